// Error handling module
// Defines the session error taxonomy shared by the manager and the request wrapper

use thiserror::Error;

/// Errors that can occur while managing a session or issuing requests
#[derive(Error, Debug)]
pub enum SessionError {
    /// Token could not be decoded (treated as expired by callers)
    #[error("Invalid token: {0}")]
    Decode(String),

    /// Login or refresh rejected by the server
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Session could not be recovered; credentials have been cleared
    #[error("Session expired: {0}")]
    Authentication(String),

    /// Transport failure, no session state was touched
    #[error("Network error ({kind}): {message}")]
    Network { kind: &'static str, message: String },

    /// Error envelope or non-success status from the SAMS API
    #[error("SAMS API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Session storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SessionError {
    /// True when the error means the user has to log in again
    pub fn is_session_lost(&self) -> bool {
        matches!(self, SessionError::Authentication(_))
    }
}

/// Categorize a transport error for logging and error reporting
pub fn error_kind(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection_failed"
    } else if e.is_request() {
        "request_error"
    } else if e.is_body() {
        "body_error"
    } else if e.is_decode() {
        "decode_error"
    } else {
        "unknown"
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(e: reqwest::Error) -> Self {
        SessionError::Network {
            kind: error_kind(&e),
            message: e.to_string(),
        }
    }
}

impl From<rusqlite::Error> for SessionError {
    fn from(e: rusqlite::Error) -> Self {
        SessionError::Storage(e.to_string())
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
