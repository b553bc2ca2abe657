use std::convert::Infallible;
use std::fmt::Write as FmtWrite;
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream::unfold;
use tokio::sync::OwnedSemaphorePermit;
use tracing::info;

use crate::broadcaster::FrameReceiver;

pub const BOUNDARY: &str = "FRAME";

/// Encode one multipart part for `jpeg`, reusing `buf`'s allocation:
/// `--FRAME`, the part headers, a blank line, the JPEG, then CRLF.
pub fn encode_part(jpeg: &[u8], buf: &mut BytesMut) -> Bytes {
    buf.clear();
    buf.reserve(jpeg.len() + 96);
    // Writing into a BytesMut cannot fail.
    let _ = write!(
        buf,
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );
    buf.put_slice(jpeg);
    buf.put_slice(b"\r\n");
    buf.split().freeze()
}

pub fn stream_headers() -> [(HeaderName, String); 4] {
    [
        (header::AGE, "0".to_string()),
        (header::CACHE_CONTROL, "no-cache, private".to_string()),
        (header::PRAGMA, "no-cache".to_string()),
        (
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={}", BOUNDARY),
        ),
    ]
}

/// One connected `/stream.mjpg` client.
///
/// The body stream owns this value; when the connection goes away (the write
/// failed or the server is shutting down) it is dropped, which logs the
/// removal and frees the client slot.
pub struct ClientStream {
    receiver: FrameReceiver,
    client: String,
    buf: BytesMut,
    frames_sent: u64,
    connected_at: Instant,
    _permit: Option<OwnedSemaphorePermit>,
}

impl ClientStream {
    pub fn new(receiver: FrameReceiver, client: String, permit: Option<OwnedSemaphorePermit>) -> Self {
        info!("Added streaming client {}", client);
        Self {
            receiver,
            client,
            buf: BytesMut::new(),
            frames_sent: 0,
            connected_at: Instant::now(),
            _permit: permit,
        }
    }

    async fn next_part(&mut self) -> Option<Bytes> {
        let frame = self.receiver.next_frame().await?;
        self.frames_sent += 1;
        Some(encode_part(&frame.data, &mut self.buf))
    }

    pub fn into_response(self) -> Response {
        let body = Body::from_stream(unfold(self, |mut client| async move {
            let part = client.next_part().await?;
            Some((Ok::<_, Infallible>(part), client))
        }));
        (StatusCode::OK, stream_headers(), body).into_response()
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        info!(
            "Removed streaming client {}: sent {} frames in {:.1}s",
            self.client,
            self.frames_sent,
            self.connected_at.elapsed().as_secs_f64()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::StreamBroadcaster;
    use chrono::Utc;
    use futures_util::StreamExt;
    use std::sync::Arc;

    #[test]
    fn test_encode_part_layout() {
        let mut buf = BytesMut::new();
        let part = encode_part(&[0xFF, 0xD8, 0xAA, 0xFF, 0xD9], &mut buf);

        let mut expected = b"--FRAME\r\nContent-Type: image/jpeg\r\nContent-Length: 5\r\n\r\n".to_vec();
        expected.extend_from_slice(&[0xFF, 0xD8, 0xAA, 0xFF, 0xD9]);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(&part[..], &expected[..]);

        // The buffer is reusable for the next part.
        let next = encode_part(&[0xFF, 0xD8], &mut buf);
        assert!(next.starts_with(b"--FRAME\r\n"));
        assert!(next.ends_with(&[0xFF, 0xD8, b'\r', b'\n']));
    }

    #[tokio::test]
    async fn test_client_stream_ends_when_broadcaster_closes() {
        let broadcaster = Arc::new(StreamBroadcaster::new());
        let client = ClientStream::new(broadcaster.subscribe(), "test".into(), None);
        let response = client.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let mut body = response.into_body().into_data_stream();
        broadcaster.publish(Bytes::from_static(&[0xFF, 0xD8, 0x01]), Utc::now());
        let part = body.next().await.unwrap().unwrap();
        assert!(part.ends_with(&[0xFF, 0xD8, 0x01, b'\r', b'\n']));

        broadcaster.close();
        assert!(body.next().await.is_none());
        drop(body);
        assert_eq!(broadcaster.receiver_count(), 0);
    }
}
