//! Error types for the tgctl control plane.
//!
//! Contention outcomes ("already running", "already requested") are not
//! errors; they are reported through `supervisor::OutcomeKind`. This type
//! covers configuration problems, infrastructure failures, timeouts and
//! transport faults.

use crate::transport::protocol::DiagnosticCode;
use crate::status::LifecycleState;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the tgctl library.
#[derive(Debug, Error)]
pub enum TgError {
    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Lock registry / status block
    #[error("Lock file {path} is held by another process")]
    LockHeld { path: PathBuf },

    #[error("Shared segment {path} is invalid: {message}")]
    InvalidSegment { path: PathBuf, message: String },

    #[error("Invalid lifecycle transition from {from} to {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    // Transport errors
    #[error("Transport error ({code}): {message}")]
    Transport { code: DiagnosticCode, message: String },

    #[error("Handshake failed ({code}): {message}")]
    Handshake { code: DiagnosticCode, message: String },

    #[error("Malformed frame: {message}")]
    MalformedFrame { message: String },

    #[error("Peer process is no longer alive: {message}")]
    PeerDied { message: String },

    #[error("Session {session_id} is closed")]
    SessionClosed { session_id: u64 },

    #[error("Connection rejected by server")]
    ConnectionRejected,

    #[error("Resultset {index} has already reported end-of-resultset")]
    ResultsetExhausted { index: u32 },

    #[error("Process launch failed: {message}")]
    LaunchFailed { message: String },

    #[error("Operation was cancelled")]
    Cancelled,

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for tgctl operations.
pub type Result<T> = std::result::Result<T, TgError>;

impl From<std::io::Error> for TgError {
    fn from(err: std::io::Error) -> Self {
        TgError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for TgError {
    fn from(err: serde_json::Error) -> Self {
        TgError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl TgError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        TgError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a transport error carrying a diagnostic code.
    pub fn transport(code: DiagnosticCode, message: impl Into<String>) -> Self {
        TgError::Transport {
            code,
            message: message.into(),
        }
    }

    /// Map this error onto the diagnostic code sent back over the wire.
    pub fn to_diagnostic_code(&self) -> DiagnosticCode {
        match self {
            TgError::Transport { code, .. } | TgError::Handshake { code, .. } => *code,
            TgError::Validation { .. } | TgError::MalformedFrame { .. } | TgError::Json { .. } => {
                DiagnosticCode::InvalidRequest
            }
            TgError::SessionClosed { .. } => DiagnosticCode::SessionClosed,
            TgError::PeerDied { .. } | TgError::ConnectionRejected | TgError::Cancelled => {
                DiagnosticCode::ServiceUnavailable
            }
            TgError::Timeout(_) => DiagnosticCode::Timeout,
            TgError::Io { .. } => DiagnosticCode::IoError,
            TgError::ResultsetExhausted { .. } => DiagnosticCode::InvalidRequest,
            _ => DiagnosticCode::Unknown,
        }
    }

    /// True for configuration problems detected before any lock or
    /// shared-memory interaction.
    pub fn is_config_error(&self) -> bool {
        matches!(self, TgError::Config { .. } | TgError::Validation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TgError::Config {
            message: "missing database name".into(),
        };
        assert_eq!(err.to_string(), "Configuration error: missing database name");
    }

    #[test]
    fn test_diagnostic_codes() {
        assert_eq!(
            TgError::SessionClosed { session_id: 3 }.to_diagnostic_code(),
            DiagnosticCode::SessionClosed
        );
        assert_eq!(
            TgError::transport(DiagnosticCode::AuthenticationError, "bad token")
                .to_diagnostic_code(),
            DiagnosticCode::AuthenticationError
        );
        assert_eq!(
            TgError::Timeout(Duration::from_secs(1)).to_diagnostic_code(),
            DiagnosticCode::Timeout
        );
    }

    #[test]
    fn test_config_errors_are_classified() {
        assert!(TgError::Validation {
            field: "database_name".into(),
            message: "empty".into(),
        }
        .is_config_error());
        assert!(!TgError::Other("x".into()).is_config_error());
    }
}
