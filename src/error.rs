//! Error types for miio discovery
//!
//! Infrastructure failures (socket bind/send, configuration) abort the
//! operation that caused them. Per-device failures are reported through the
//! registry's event stream and never stop discovery.

use thiserror::Error;

/// Result type alias for miio operations
pub type Result<T> = std::result::Result<T, MiioError>;

/// Error types for miio discovery and device registration
#[derive(Error, Debug)]
pub enum MiioError {
    /// Inbound packet shorter than the fixed header
    #[error("Malformed packet: expected at least {expected} bytes, got {actual}")]
    MalformedPacket { expected: usize, actual: usize },

    /// Socket bind/send errors
    #[error("Socket error: {0}")]
    Socket(String),

    /// Per-device connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Token storage errors
    #[error("Token store error: {0}")]
    TokenStore(String),

    /// Token parsing errors
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Operation requires a running engine
    #[error("Discovery is not running")]
    NotRunning,

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl MiioError {
    /// Create a socket error
    pub fn socket<S: Into<String>>(msg: S) -> Self {
        MiioError::Socket(msg.into())
    }

    /// Create a connection error
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        MiioError::Connection(msg.into())
    }

    /// Create a token store error
    pub fn token_store<S: Into<String>>(msg: S) -> Self {
        MiioError::TokenStore(msg.into())
    }

    /// Create an invalid token error
    pub fn invalid_token<S: Into<String>>(msg: S) -> Self {
        MiioError::InvalidToken(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        MiioError::Config(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        MiioError::Timeout(msg.into())
    }

    /// Check if a later attempt of the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MiioError::Connection(_)
                | MiioError::Timeout(_)
                | MiioError::TokenStore(_)
                | MiioError::Socket(_)
                | MiioError::Io(_)
        )
    }

    /// Short machine-readable classification, used as a tracing field
    pub fn error_type(&self) -> &'static str {
        match self {
            MiioError::MalformedPacket { .. } => "malformed_packet",
            MiioError::Socket(_) => "socket_error",
            MiioError::Connection(_) => "connection_error",
            MiioError::TokenStore(_) => "token_store_error",
            MiioError::InvalidToken(_) => "invalid_token",
            MiioError::Config(_) => "config_error",
            MiioError::Timeout(_) => "timeout_error",
            MiioError::NotRunning => "not_running",
            MiioError::Io(_) => "io_error",
            MiioError::Json(_) => "json_error",
            MiioError::Toml(_) => "toml_error",
        }
    }
}
