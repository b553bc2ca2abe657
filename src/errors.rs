use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Capture error: {message}")]
    Capture { message: String },

    #[error("Timelapse error: {message}")]
    Timelapse { message: String },

    #[error("Server error: {message}")]
    Server { message: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },

    #[error("Network address parse error: {source}")]
    AddrParse {
        #[from]
        source: std::net::AddrParseError,
    },
}

impl StreamError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn capture(message: impl Into<String>) -> Self {
        Self::Capture { message: message.into() }
    }

    pub fn timelapse(message: impl Into<String>) -> Self {
        Self::Timelapse { message: message.into() }
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::Server { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
