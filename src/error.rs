use crate::types::Axis;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("IO error: {context}: {source}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Connection broken: expected {expected} bytes, received {received}")]
    ConnectionBroken { expected: usize, received: usize },
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(
        "Actuator rejected a {steps}-step move on {axis:?} after {completed}/{requested} commands"
    )]
    Actuator {
        axis: Axis,
        steps: i64,
        completed: u64,
        requested: u64,
    },
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl ScanError {
    pub(crate) fn io(source: std::io::Error, context: impl Into<String>) -> Self {
        ScanError::Io {
            source,
            context: context.into(),
        }
    }

    /// True for failures that leave the link unusable.
    ///
    /// The sequencer skips the disarm handshake when the acquisition link
    /// reports one of these, since there is nobody left to acknowledge it.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ScanError::Io { .. } | ScanError::ConnectionBroken { .. } | ScanError::Timeout(_)
        )
    }
}

impl From<std::io::Error> for ScanError {
    fn from(source: std::io::Error) -> Self {
        ScanError::Io {
            source,
            context: "I/O operation".to_string(),
        }
    }
}
