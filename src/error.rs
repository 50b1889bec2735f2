// ABOUTME: Error types for the session store and the persistence gateway.
// ABOUTME: Validation and not-found errors are synchronous; persistence errors travel out-of-band.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::session::types::SessionId;

/// Errors returned directly to callers of session store operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Malformed input: unknown role, empty identifier, blank title.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// The operation referenced a session that is not in the loaded collection.
    #[error("session not found: {session_id}")]
    NotFound { session_id: String },

    /// The persistence gateway rejected a call the caller awaited directly.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl SessionError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn not_found(session_id: impl ToString) -> Self {
        Self::NotFound {
            session_id: session_id.to_string(),
        }
    }
}

/// Failures reported by a persistence gateway.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("corrupt record at {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// The backend has no record of the session a message was saved against.
    #[error("session unknown to storage backend: {session_id}")]
    SessionNotFound { session_id: SessionId },

    #[error("{operation} timed out after {after:?}")]
    TimedOut {
        operation: &'static str,
        after: Duration,
    },

    #[error("storage unavailable: {reason}")]
    Unavailable { reason: String },
}

impl PersistenceError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
pub type PersistenceResult<T> = Result<T, PersistenceError>;
