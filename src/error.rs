//! Error types for the security logging pipeline.

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for pipeline setup and delivery operations
///
/// Logging calls themselves never surface these to callers: every failure
/// inside the intake path is caught and self-logged. These errors appear
/// only from construction, configuration loading and explicit flush calls.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Security subsystem error
    #[error("Security error: {0}")]
    Security(#[from] SecurityError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Security-pipeline specific errors
#[derive(Debug, Error)]
pub enum SecurityError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Sink delivery failure (batch POST rejected or timed out)
    #[error("Sink delivery failed: {0}")]
    SinkDelivery(String),

    /// Alert webhook delivery failure
    #[error("Alert delivery failed: {0}")]
    AlertDelivery(String),

    /// Data masking failure
    #[error("Masking error: {0}")]
    Masking(String),

    /// Channel write failure
    #[error("Channel write failed: {0}")]
    ChannelWrite(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("missing endpoint".to_string());
        assert!(err.to_string().contains("missing endpoint"));

        let err: Error = SecurityError::SinkDelivery("timeout".to_string()).into();
        assert!(err.to_string().contains("timeout"));
    }
}
