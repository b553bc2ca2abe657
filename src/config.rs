use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::errors::{Result, StreamError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CaptureSourceKind {
    #[serde(rename = "ffmpeg")]
    Ffmpeg,
    #[serde(rename = "test_pattern")]
    TestPattern,
}

impl Default for CaptureSourceKind {
    fn default() -> Self {
        Self::Ffmpeg
    }
}

impl std::fmt::Display for CaptureSourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureSourceKind::Ffmpeg => write!(f, "ffmpeg"),
            CaptureSourceKind::TestPattern => write!(f, "test_pattern"),
        }
    }
}

/// A device parameter passed through to the capture backend untouched.
///
/// Numbers stay numbers until they reach the command line, so `rotation = 180`
/// and `rotation = "180"` both work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl std::fmt::Display for OptionValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptionValue::Bool(value) => write!(f, "{}", if *value { 1 } else { 0 }),
            OptionValue::Int(value) => write!(f, "{}", value),
            OptionValue::Float(value) => write!(f, "{}", value),
            OptionValue::Text(value) => write!(f, "{}", value),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub timelapse: TimelapseConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub max_clients: Option<usize>, // Concurrent /stream.mjpg clients, unlimited when absent
    pub index_page: Option<String>, // HTML file replacing the built-in landing page
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelapseConfig {
    #[serde(default)]
    pub interval: u64, // Seconds between snapshots, 0 = disabled
    #[serde(default = "default_timelapse_path")]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default)]
    pub source: CaptureSourceKind,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_input_driver")]
    pub input_driver: String, // ffmpeg -f for the input side (v4l2, avfoundation, ...)
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_framerate")]
    pub framerate: u32,
    pub quality: Option<u8>, // -q:v, lower is better
    #[serde(default = "default_chunk_read_size")]
    pub chunk_read_size: usize,
    #[serde(default = "default_restart_interval")]
    pub restart_interval: u64, // Seconds to wait before restarting a failed capture
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default)]
    pub extra_output_args: Vec<String>,
    #[serde(default)]
    pub options: BTreeMap<String, OptionValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8000 }
fn default_timelapse_path() -> String { "timelapse".to_string() }
fn default_device() -> String { "/dev/video0".to_string() }
fn default_input_driver() -> String { "v4l2".to_string() }
fn default_width() -> u32 { 640 }
fn default_height() -> u32 { 480 }
fn default_framerate() -> u32 { 30 }
fn default_chunk_read_size() -> usize { 8192 }
fn default_restart_interval() -> u64 { 5 }
fn default_max_frame_size() -> usize { 10 * 1024 * 1024 } // 10MB
/// One year, in seconds.
pub const MAX_TIMELAPSE_INTERVAL: u64 = 365 * 24 * 60 * 60;

fn default_log_level() -> String { "info".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_clients: None,
            index_page: None,
        }
    }
}

impl Default for TimelapseConfig {
    fn default() -> Self {
        Self {
            interval: 0,
            path: default_timelapse_path(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: CaptureSourceKind::default(),
            device: default_device(),
            input_driver: default_input_driver(),
            width: default_width(),
            height: default_height(),
            framerate: default_framerate(),
            quality: None,
            chunk_read_size: default_chunk_read_size(),
            restart_interval: default_restart_interval(),
            max_frame_size: default_max_frame_size(),
            extra_output_args: Vec::new(),
            options: BTreeMap::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            timelapse: TimelapseConfig::default(),
            camera: CameraConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl TimelapseConfig {
    pub fn is_enabled(&self) -> bool {
        self.interval > 0 && !self.path.is_empty()
    }
}

impl Config {
    /// Parse `path` without validating it, so command-line overrides can
    /// still be applied.
    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            StreamError::config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        let config: Config = if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };
        Ok(config)
    }

    /// Like [`Config::read`], but a missing file yields the defaults.
    pub fn read_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        Self::read(path)
    }

    pub fn apply_port_override(&mut self, port: Option<u16>) {
        if let Some(port) = port {
            self.server.port = port;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(StreamError::config("server.port must be a non-zero port number"));
        }
        if self.server.max_clients == Some(0) {
            return Err(StreamError::config("server.max_clients must be greater than 0 when set"));
        }

        if self.timelapse.interval > MAX_TIMELAPSE_INTERVAL {
            return Err(StreamError::config(format!(
                "timelapse.interval {}s exceeds the maximum of {}s",
                self.timelapse.interval, MAX_TIMELAPSE_INTERVAL
            )));
        }

        let camera = &self.camera;
        if camera.width == 0 || camera.height == 0 {
            return Err(StreamError::config(format!(
                "camera resolution {}x{} is invalid",
                camera.width, camera.height
            )));
        }
        if camera.framerate == 0 {
            return Err(StreamError::config("camera.framerate must be greater than 0"));
        }
        if camera.chunk_read_size == 0 {
            return Err(StreamError::config("camera.chunk_read_size must be greater than 0"));
        }
        if camera.max_frame_size == 0 {
            return Err(StreamError::config("camera.max_frame_size must be greater than 0"));
        }
        if camera.source == CaptureSourceKind::Ffmpeg && camera.device.trim().is_empty() {
            return Err(StreamError::config("camera.device is required for the ffmpeg source"));
        }

        Ok(())
    }
}
