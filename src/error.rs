//! Error types for gatehouse-agent

use thiserror::Error;

/// Main error type for the agent proxy engine
#[derive(Error, Debug)]
pub enum ProxyError {
    /// I/O error (network, file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration or connection-parameter error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol decode failure (malformed packet). Fatal to the one
    /// connection, never to the session unless it is the startup packet.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Handshake failure: TLS policy violation or authentication rejection
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// Real server unavailable (dial failure, liveness probe timeout)
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Classifier error/timeout. Non-fatal: degrades to pass-through.
    #[error("Redaction error: {0}")]
    Redaction(String),

    /// Cancel registry missing expected state. Logged, never blocks data.
    #[error("Registry error: {0}")]
    Registry(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),
}

/// Result type alias for ProxyError
pub type Result<T> = std::result::Result<T, ProxyError>;

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::Config(err.to_string())
    }
}
