use std::time::Duration;
use thiserror::Error;

/// Result type for Bravia Quad operations
pub type Result<T> = std::result::Result<T, QuadError>;

/// Errors that can occur when talking to a Bravia Quad device
#[derive(Error, Debug)]
pub enum QuadError {
    /// Opening the TCP connection failed
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Opening the TCP connection did not finish in time
    #[error("Timed out connecting to {addr} after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    /// The connection dropped while a command was waiting for its response
    #[error("Disconnected")]
    Disconnected,

    /// No connection is available for the operation
    #[error("Not connected to device")]
    NotConnected,

    /// Writing a command to the socket failed
    #[error("Failed to send command: {0}")]
    Write(#[source] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A numeric value was rejected before being sent
    #[error("{feature} must be between {min} and {max}, got {value}")]
    OutOfRange {
        feature: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    /// A value is not accepted for the feature
    #[error("Invalid value for {feature}: {value}")]
    InvalidValue { feature: String, value: String },
}

impl QuadError {
    /// Whether this error means the link to the device is unusable.
    ///
    /// These are the failures a caller would answer with a reconnect or a
    /// retry later, as opposed to validation failures.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            QuadError::Connect { .. }
                | QuadError::ConnectTimeout { .. }
                | QuadError::Disconnected
                | QuadError::NotConnected
                | QuadError::Write(_)
        )
    }
}
