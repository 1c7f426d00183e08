//! Error types for the presence engine

use thiserror::Error;

/// Errors on the report write path and on store lookups.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// Malformed or out-of-range report, rejected before any state change
    #[error("invalid report: {0}")]
    InvalidReport(String),

    /// Store-level validation failure (empty id, coordinates out of range)
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no presence record for id {0}")]
    NotFound(String),

    /// The durability mirror write failed; in-memory state is unchanged
    #[error("persistence failure: {0}")]
    Persistence(#[from] BackendError),
}

impl PresenceError {
    /// True for errors caused by the caller's input rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PresenceError::InvalidReport(_) | PresenceError::Validation(_) | PresenceError::NotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PresenceError>;

/// Failures reported by a persistent backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record encoding error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Snapshot generation failures. Logged by the scheduler, never propagated.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render failed: {0}")]
    Render(String),

    #[error("artifact write failed: {0}")]
    Io(#[from] std::io::Error),
}
