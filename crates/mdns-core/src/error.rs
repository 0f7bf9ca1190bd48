//! Error types for the mDNS responder
//!
//! This module defines all error types used throughout the crate.

use thiserror::Error;

/// Result type alias for responder operations
pub type Result<T> = std::result::Result<T, Error>;

/// DNS-SD numeric error codes, as reported by the native API
pub mod codes {
    pub const UNKNOWN: i32 = -65537;
    pub const BAD_PARAM: i32 = -65540;
    pub const BAD_STATE: i32 = -65542;
    pub const NOT_INITIALIZED: i32 = -65545;
    pub const NAME_CONFLICT: i32 = -65548;
    pub const NO_SUCH_RECORD: i32 = -65554;
    pub const NO_AUTH: i32 = -65555;
}

/// Core error type for the responder
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed name, type, class, ttl or flags
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The caller lacks the service discovery capability
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A uniqueness probe was lost and no rename policy applies
    #[error("Name conflict: {0}")]
    Conflict(String),

    /// Handle or record unknown to this registration
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Operation on a stopped registration
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No interface could be bound or reached
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// Malformed DNS message on the wire
    #[error("Malformed packet: {0}")]
    Wire(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Socket-level I/O errors
    #[error("Network error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a permission denied error
    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    /// Create a name conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a network unavailable error
    pub fn network_unavailable(msg: impl Into<String>) -> Self {
        Self::NetworkUnavailable(msg.into())
    }

    /// Create a wire format error
    pub fn wire(msg: impl Into<String>) -> Self {
        Self::Wire(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// The DNS-SD error code reported to clients for this error
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) | Error::Config(_) => codes::BAD_PARAM,
            Error::PermissionDenied(_) => codes::NO_AUTH,
            Error::Conflict(_) => codes::NAME_CONFLICT,
            Error::NotFound(_) => codes::NO_SUCH_RECORD,
            Error::InvalidState(_) => codes::BAD_STATE,
            Error::NetworkUnavailable(_) => codes::NOT_INITIALIZED,
            _ => codes::UNKNOWN,
        }
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::invalid_argument("x").code(), codes::BAD_PARAM);
        assert_eq!(Error::permission_denied("x").code(), codes::NO_AUTH);
        assert_eq!(Error::conflict("x").code(), codes::NAME_CONFLICT);
        assert_eq!(Error::not_found("x").code(), codes::NO_SUCH_RECORD);
        assert_eq!(Error::invalid_state("x").code(), codes::BAD_STATE);
        assert_eq!(Error::wire("x").code(), codes::UNKNOWN);
    }
}
