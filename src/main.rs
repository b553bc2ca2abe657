use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use chrono::Utc;
use clap::Parser;
use tokio::sync::Semaphore;
use tokio::time::Duration;
use tracing::{error, info, warn};

mod broadcaster;
mod capture;
mod config;
mod errors;
mod frame_sink;
mod handlers;
mod mjpeg;
mod server;
mod test_pattern;
mod timelapse;

use broadcaster::StreamBroadcaster;
use capture::CaptureHandle;
use config::Config;
use frame_sink::FrameSink;
use timelapse::TimelapseWriter;

#[derive(Parser, Debug)]
#[command(name = "mjpeg-camera-server", version, about = "Single-camera MJPEG live streaming server")]
struct Cli {
    /// Configuration file (TOML, or JSON with a .json extension)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override server.port from the configuration file
    #[arg(short, long)]
    port: Option<u16>,
}

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub broadcaster: Arc<StreamBroadcaster>,
    pub index_page: Bytes,
    pub client_slots: Option<Arc<Semaphore>>,
}

impl AppState {
    pub fn new(broadcaster: Arc<StreamBroadcaster>, index_page: Bytes, max_clients: Option<usize>) -> Self {
        Self {
            broadcaster,
            index_page,
            client_slots: max_clients.map(|n| Arc::new(Semaphore::new(n))),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match Config::read_or_default(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", cli.config.display(), e);
            std::process::exit(1);
        }
    };
    config.apply_port_override(cli.port);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    // Logging is only set up once the config is known, so report the source here.
    if cli.config.exists() {
        info!("Loaded configuration from '{}'", cli.config.display());
    } else {
        warn!("Config file '{}' not found, using default configuration", cli.config.display());
    }

    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(1);
    }
    let index_page = match handlers::load_index_page(config.server.index_page.as_deref()) {
        Ok(page) => page,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting MJPEG camera server on {}:{} (capture source: {})",
        config.server.host, config.server.port, config.camera.source
    );

    let broadcaster = Arc::new(StreamBroadcaster::new());
    let timelapse = TimelapseWriter::new(&config.timelapse, Utc::now());
    let sink = FrameSink::new(broadcaster.clone(), timelapse, config.camera.max_frame_size);
    let capture = CaptureHandle::spawn(
        capture::source_from_config(&config.camera),
        sink,
        Duration::from_secs(config.camera.restart_interval),
    );

    let state = AppState::new(broadcaster.clone(), index_page, config.server.max_clients);
    if let Err(e) = run(&config, state, capture, server::shutdown_signal()).await {
        error!("Error in server: {}", e);
        std::process::exit(1);
    }

    info!("Shutdown complete ({} frames published)", broadcaster.sequence());
    Ok(())
}

/// Serve until `shutdown` resolves, then stop streaming and capture.
///
/// The cleanup runs whether or not the server came up.
async fn run(
    config: &Config,
    state: AppState,
    capture: CaptureHandle,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> errors::Result<()> {
    let broadcaster = state.broadcaster.clone();
    let result = run_server(config, state, shutdown).await;

    broadcaster.close();
    capture.stop().await;
    result
}

async fn run_server(
    config: &Config,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> errors::Result<()> {
    let listener = server::bind_listener(&config.server.host, config.server.port)?;
    let broadcaster = state.broadcaster.clone();

    server::serve(listener, server::build_router(state), async move {
        shutdown.await;
        // Open streams never finish on their own; end them so shutdown can complete.
        broadcaster.close();
    })
    .await
}
