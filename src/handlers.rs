use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::errors::{Result, StreamError};
use crate::mjpeg::ClientStream;
use crate::AppState;

pub const DEFAULT_INDEX_PAGE: &str = include_str!("../static/index.html");

/// The landing page: the built-in one, or the file configured in `server.index_page`.
pub fn load_index_page(path: Option<&str>) -> Result<Bytes> {
    match path {
        Some(path) => std::fs::read(path).map(Bytes::from).map_err(|e| {
            StreamError::config(format!("Failed to read index page '{}': {}", path, e))
        }),
        None => Ok(Bytes::from_static(DEFAULT_INDEX_PAGE.as_bytes())),
    }
}

pub async fn root_redirect() -> Response {
    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, "/index.html")]).into_response()
}

pub async fn index_page(State(state): State<AppState>) -> Response {
    trace!("Index page requested");
    let page = state.index_page.clone();
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/html".to_string()),
            (header::CONTENT_LENGTH, page.len().to_string()),
        ],
        page,
    )
        .into_response()
}

pub async fn stream_mjpg(
    State(state): State<AppState>,
    addr: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let client = addr
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    if state.broadcaster.is_closed() {
        debug!("Rejecting streaming client {}: shutting down", client);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let permit = match &state.client_slots {
        Some(slots) => match slots.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                warn!("Rejecting streaming client {}: client limit reached", client);
                return (StatusCode::SERVICE_UNAVAILABLE, "Too many streaming clients").into_response();
            }
        },
        None => None,
    };

    ClientStream::new(state.broadcaster.subscribe(), client, permit).into_response()
}

pub async fn not_found(uri: Uri) -> Response {
    debug!("No route for {}", uri.path());
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::StreamBroadcaster;
    use crate::server::build_router;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use futures_util::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    const PAGE: &str = "<html><body><img src=\"stream.mjpg\"></body></html>";

    fn state(max_clients: Option<usize>) -> AppState {
        AppState::new(
            Arc::new(StreamBroadcaster::new()),
            Bytes::from_static(PAGE.as_bytes()),
            max_clients,
        )
    }

    async fn get(state: &AppState, path: &str) -> Response {
        build_router(state.clone())
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    fn jpeg(tag: u8) -> Bytes {
        Bytes::from(vec![0xFF, 0xD8, tag, tag, 0xFF, 0xD9])
    }

    #[tokio::test]
    async fn test_root_redirects_to_index() {
        let response = get(&state(None), "/").await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[header::LOCATION], "/index.html");
    }

    #[tokio::test]
    async fn test_index_page() {
        let response = get(&state(None), "/index.html").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/html");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], PAGE.len().to_string().as_str());

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], PAGE.as_bytes());
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let state = state(None);
        assert_eq!(get(&state, "/nope").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(get(&state, "/index.htm").await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stream_headers_and_parts() {
        let state = state(None);
        let response = get(&state, "/stream.mjpg").await;
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "multipart/x-mixed-replace; boundary=FRAME");
        assert_eq!(headers[header::AGE], "0");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache, private");
        assert_eq!(headers[header::PRAGMA], "no-cache");

        let mut body = response.into_body().into_data_stream();
        for tag in 1..=3 {
            state.broadcaster.publish(jpeg(tag), Utc::now());
            let part = tokio::time::timeout(Duration::from_secs(1), body.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();

            let mut expected =
                b"--FRAME\r\nContent-Type: image/jpeg\r\nContent-Length: 6\r\n\r\n".to_vec();
            expected.extend_from_slice(&jpeg(tag));
            expected.extend_from_slice(b"\r\n");
            assert_eq!(&part[..], &expected[..]);
        }
    }

    #[tokio::test]
    async fn test_dropped_client_does_not_affect_others() {
        let state = state(None);
        let first = get(&state, "/stream.mjpg").await.into_body().into_data_stream();
        let mut second = get(&state, "/stream.mjpg").await.into_body().into_data_stream();
        assert_eq!(state.broadcaster.receiver_count(), 2);

        // The first client's connection goes away.
        drop(first);
        assert_eq!(state.broadcaster.receiver_count(), 1);

        state.broadcaster.publish(jpeg(7), Utc::now());
        let part = tokio::time::timeout(Duration::from_secs(1), second.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(part.ends_with(&[0xFF, 0xD8, 7, 7, 0xFF, 0xD9, b'\r', b'\n']));
        assert_eq!(state.broadcaster.sequence(), 1);
    }

    #[tokio::test]
    async fn test_client_limit() {
        let state = state(Some(1));
        let first = get(&state, "/stream.mjpg").await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(get(&state, "/stream.mjpg").await.status(), StatusCode::SERVICE_UNAVAILABLE);

        // Closing the first stream frees its slot.
        drop(first);
        assert_eq!(get(&state, "/stream.mjpg").await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_stream_refused_after_shutdown() {
        let state = state(None);
        state.broadcaster.close();
        assert_eq!(get(&state, "/stream.mjpg").await.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_default_index_page_embeds_stream() {
        let page = load_index_page(None).unwrap();
        let page = String::from_utf8(page.to_vec()).unwrap();
        assert!(page.contains("<img src=\"stream.mjpg\""));
        assert!(load_index_page(Some("/definitely/not/here.html")).is_err());
    }
}
