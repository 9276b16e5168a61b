// src/error.rs
use thiserror::Error;

/// Errors raised while reading configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

/// Errors returned by the REST backend boundary.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Errors on the card reader connection itself.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Errors while opening a scan session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("card reader is not configured")]
    NotConfigured(#[from] ConfigError),

    #[error("could not connect to card reader at {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("card reader rejected start command: {0}")]
    Start(#[source] DeviceError),
}

/// A scan that could not be turned into an identification outcome.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("card number {0:?} is not numeric")]
    MalformedCard(String),

    #[error("card lookup failed: {0}")]
    Backend(#[from] ApiError),
}

/// Failure of a single one-time-entry charge attempt.
#[derive(Debug, Error)]
pub enum ChargeError {
    #[error("card could not be identified")]
    Unidentified,

    #[error("entry count must be positive")]
    InvalidCount,

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error("card reader connection lost: {0}")]
    ConnectionLost(String),

    #[error("charge rejected: {0}")]
    Rejected(#[source] ApiError),

    #[error("charge attempt already finished")]
    AttemptFinished,
}
