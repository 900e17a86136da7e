use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Longest session identifier accepted as a workspace directory name.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Opaque caller-supplied session identifier.
///
/// The engine never interprets the identifier, but it does become a path
/// component (`{root}/{session_id}/...`) and a remote key segment, so only
/// a conservative character set is admitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidSessionId {
    #[error("session id is empty")]
    Empty,
    #[error("session id is longer than {MAX_SESSION_ID_LEN} characters")]
    TooLong,
    #[error("session id '{0}' contains characters outside [A-Za-z0-9._-] or is a relative path")]
    BadCharacters(String),
}

impl SessionId {
    pub fn parse(raw: &str) -> Result<Self, InvalidSessionId> {
        if raw.is_empty() {
            return Err(InvalidSessionId::Empty);
        }
        if raw.len() > MAX_SESSION_ID_LEN {
            return Err(InvalidSessionId::TooLong);
        }
        let allowed = raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !allowed || raw == "." || raw == ".." {
            return Err(InvalidSessionId::BadCharacters(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-facing execution request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub session_id: String,
    pub code: String,
    /// Zero selects the configured default.
    #[serde(default)]
    pub timeout_seconds: u64,
}

/// A file harvested from the outputs directory after a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub name: String,
    /// Remote key, or the local path when the file could not be uploaded.
    pub remote_path: String,
    #[serde(default)]
    pub local_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    /// Worker generation the submission ran against (0 when no worker was reached).
    pub generation: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub timed_out: bool,
    /// The worker was torn down after this submission; session state is gone.
    pub worker_replaced: bool,
}

/// Structured result of one submission.
///
/// Always produced, even on failure: user-code faults, timeouts and
/// infrastructure faults all land in `error`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub output: String,
    pub error: String,
    /// Rendered images, kept as the encoded blobs the interpreter produced.
    pub artifacts: Vec<String>,
    pub files: Vec<FileRef>,
    #[serde(default)]
    pub metadata: ExecutionMetadata,
}

impl ExecutionResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }
}

/// File admission request; `content` is base64 encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    pub session_id: String,
    pub filename: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub accepted: bool,
    pub filename: String,
    pub bytes: u64,
    pub usage_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeardownRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownResponse {
    pub session_id: String,
    pub worker_stopped: bool,
    pub local_removed: bool,
    pub remote_removed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    pub session_id: String,
    pub used_bytes: u64,
    pub ceiling_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_accepts_plain_ids() {
        let id = SessionId::parse("user-42_chat.7").unwrap();
        assert_eq!(id.as_str(), "user-42_chat.7");
        assert_eq!(id.to_string(), "user-42_chat.7");
    }

    #[test]
    fn test_session_id_rejects_paths() {
        assert_eq!(SessionId::parse(""), Err(InvalidSessionId::Empty));
        assert!(matches!(SessionId::parse(".."), Err(InvalidSessionId::BadCharacters(_))));
        assert!(matches!(SessionId::parse("a/b"), Err(InvalidSessionId::BadCharacters(_))));
        assert!(matches!(SessionId::parse("a b"), Err(InvalidSessionId::BadCharacters(_))));
        assert_eq!(
            SessionId::parse(&"x".repeat(MAX_SESSION_ID_LEN + 1)),
            Err(InvalidSessionId::TooLong)
        );
    }

    #[test]
    fn test_execute_request_default_timeout() {
        let req: ExecuteRequest =
            serde_json::from_str(r#"{"session_id": "s1", "code": "print(1)"}"#).unwrap();
        assert_eq!(req.timeout_seconds, 0);
    }

    #[test]
    fn test_failure_result_shape() {
        let result = ExecutionResult::failure("boom");
        assert!(!result.is_success());
        assert!(result.output.is_empty());
        assert!(result.files.is_empty());
        assert!(result.artifacts.is_empty());
    }
}
