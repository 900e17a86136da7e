//! Typed rejections for admission-control paths.
//!
//! Execution never surfaces these: its failures live in
//! `ExecutionResult::error`. Uploads and usage queries must not silently
//! proceed, so they get an explicit reason instead.

use solver_common::types::InvalidSessionId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Rejection {
    #[error("invalid session id: {0}")]
    InvalidSession(#[from] InvalidSessionId),
    #[error("invalid filename '{0}'")]
    InvalidFilename(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("quota exceeded: {used} bytes used + {incoming} incoming exceeds the {ceiling} byte limit")]
    QuotaExceeded { used: u64, incoming: u64, ceiling: u64 },
    #[error("storage unavailable: {0}")]
    Storage(String),
}

impl Rejection {
    /// Short machine-readable reason, used for metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Rejection::InvalidSession(_) => "invalid_session",
            Rejection::InvalidFilename(_) => "invalid_filename",
            Rejection::InvalidPayload(_) => "invalid_payload",
            Rejection::QuotaExceeded { .. } => "quota_exceeded",
            Rejection::Storage(_) => "storage",
        }
    }

    pub fn storage(err: anyhow::Error) -> Self {
        Rejection::Storage(format!("{:#}", err))
    }
}
