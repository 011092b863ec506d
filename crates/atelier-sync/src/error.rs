use thiserror::Error;
use uuid::Uuid;

/// Failure reported by a [`crate::backend::ThreadBackend`] call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Transport failure, timeout or 5xx. Safe to retry.
    Network,
    /// The target row does not exist.
    NotFound,
    /// The write conflicts with server state (for example a deleted message).
    Conflict,
    /// The server refused the payload.
    Rejected,
    /// The server answered with something we could not decode.
    Protocol,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Network, message)
    }

    /// Build an error from a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self::new(classify_http_status(status), message)
    }
}

/// Map HTTP status codes to backend error kinds.
pub fn classify_http_status(status: u16) -> BackendErrorKind {
    match status {
        404 => BackendErrorKind::NotFound,
        409 | 410 => BackendErrorKind::Conflict,
        408 | 429 => BackendErrorKind::Network,
        400..=499 => BackendErrorKind::Rejected,
        500..=599 => BackendErrorKind::Network,
        _ => BackendErrorKind::Protocol,
    }
}

/// Errors produced by the sync engine.
///
/// Only `Network`, `Conflict` and `NotFound` are meant for the user; see
/// [`SyncError::is_user_facing`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Retryable transport failure.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed attachment or reaction payload. Sanitized, never surfaced.
    #[error("validation error: {0}")]
    Validation(String),

    /// The remote write was rejected; local state was rolled back.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The target message does not exist (locally or server-side).
    #[error("message {0} not found")]
    NotFound(Uuid),

    /// The thread has no open session in this client.
    #[error("thread {0} is not open")]
    NotOpen(Uuid),

    /// Result of an operation that outlived its thread session.
    #[error("stale epoch for thread {thread_id}")]
    StaleEpoch { thread_id: Uuid },
}

impl SyncError {
    pub fn is_user_facing(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Conflict(_) | Self::NotFound(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Translate a backend failure for a call that targeted `message_id`.
    pub fn from_backend(err: BackendError, message_id: Option<Uuid>) -> Self {
        match (err.kind, message_id) {
            (BackendErrorKind::NotFound, Some(id)) => Self::NotFound(id),
            (BackendErrorKind::NotFound, None) => Self::Network(err.message),
            (BackendErrorKind::Conflict | BackendErrorKind::Rejected, _) => {
                Self::Conflict(err.message)
            }
            (BackendErrorKind::Network | BackendErrorKind::Protocol, _) => {
                Self::Network(err.message)
            }
        }
    }
}

/// Invalid engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key}: cannot parse '{value}'")]
    Invalid { key: &'static str, value: String },
    #[error("{0} is required")]
    Missing(&'static str),
}
