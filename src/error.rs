//! Error types for the player client.
//!
//! None of these cross a component's public command surface: the runtime absorbs them
//! into state transitions or log output.

use thiserror::Error;

/// Failures talking to the backend HTTP API.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("could not decode response from {url}: {message}")]
    Decode { url: String, message: String },
}

/// Failures on the push channel. All of them lead to a scheduled reconnect.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("push channel connect failed: {0}")]
    Connect(String),

    #[error("push channel read failed: {0}")]
    Stream(#[from] std::io::Error),

    #[error("push channel closed by server")]
    Closed,
}

/// Outcome of a rejected `play()` request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlayError {
    /// Superseded by a pause or a new source before it resolved. Benign.
    #[error("play request aborted")]
    Aborted,

    #[error("playback not allowed: {0}")]
    NotAllowed(String),

    #[error("no source loaded")]
    NoSource,

    #[error("playback failed: {0}")]
    Failed(String),
}

impl PlayError {
    pub fn is_benign(&self) -> bool {
        matches!(self, PlayError::Aborted)
    }
}

/// Audio output / decode setup failures of the concrete device.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("no audio output device available")]
    NoOutputDevice,

    #[error("audio output configuration failed: {0}")]
    OutputConfig(String),

    #[error("audio stream failed: {0}")]
    Stream(String),

    #[error("resampling failed: {0}")]
    Resample(String),
}

/// Failures loading the config file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not resolve a config directory")]
    NoConfigDir,

    #[error("config file I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {path} is not valid TOML: {message}")]
    Parse { path: String, message: String },

    #[error("could not serialize default config: {0}")]
    Serialize(String),
}
