//! Common types shared between sylve-api and external integrations

pub mod guest;
pub mod model;

use serde::{Deserialize, Serialize};

/// Error type used across the cluster data-protection subsystem.
///
/// Every variant maps to a stable string code (see [`Error::code`]) which is
/// what ends up in the `message` field of the REST envelope.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("{detail}")]
    NotFound { code: String, detail: String },

    #[error("{detail}")]
    Conflict { code: String, detail: String },

    #[error("cluster leader is unknown")]
    LeaderUnknown,

    #[error("this node is not the cluster leader")]
    NotLeader,

    #[error("forwarding to node {node} failed: {detail}")]
    RemoteForward { node: String, detail: String },

    /// Retryable SSH/IO failure (connection reset, timeout).
    #[error("transient failure: {0}")]
    Transient(String),

    /// Non-retryable failure (SSH auth, ZFS rejection, captured panic).
    #[error("{0}")]
    Fatal(String),

    /// The restore pre-check could not load cluster placement details.
    /// Distinct from `Conflict` so handlers can map it to 500, not 409.
    #[error("failed to load cluster details: {0}")]
    RestorePrecheck(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn validation(detail: impl Into<String>) -> Self {
        Error::Validation(detail.into())
    }

    pub fn not_found(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::NotFound {
            code: code.into(),
            detail: detail.into(),
        }
    }

    pub fn conflict(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Conflict {
            code: code.into(),
            detail: detail.into(),
        }
    }

    pub fn fatal(detail: impl Into<String>) -> Self {
        Error::Fatal(detail.into())
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Error::Transient(detail.into())
    }

    /// Stable string code for the REST envelope.
    pub fn code(&self) -> &str {
        match self {
            Error::Validation(_) => "invalid_request",
            Error::NotFound { code, .. } => code,
            Error::Conflict { code, .. } => code,
            Error::LeaderUnknown => "leader_unknown",
            Error::NotLeader => "not_leader",
            Error::RemoteForward { .. } => "remote_forward_failed",
            Error::Transient(_) => "transient_failure",
            Error::Fatal(_) => "internal_error",
            Error::RestorePrecheck(_) => "restore_precheck_failed",
            Error::Database(_) => "internal_error",
            Error::Io(_) => "internal_error",
        }
    }

    /// Whether the replication/backup engines may retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Validation(format!("invalid JSON: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Common REST envelope: `{status, message, error, data}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    pub fn success(message: impl Into<String>, data: T) -> Self {
        Self {
            status: "success".to_string(),
            message: message.into(),
            error: None,
            data: Some(data),
        }
    }

    pub fn error(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: code.into(),
            error: Some(detail.into()),
            data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(Error::validation("bad input").code(), "invalid_request");
        assert_eq!(
            Error::not_found("backup_target_not_found", "target 3").code(),
            "backup_target_not_found"
        );
        assert_eq!(
            Error::conflict("already_running", "policy 1").code(),
            "already_running"
        );
        assert_eq!(Error::LeaderUnknown.code(), "leader_unknown");
        assert_eq!(
            Error::RestorePrecheck("db down".into()).code(),
            "restore_precheck_failed"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::transient("connection reset").is_transient());
        assert!(!Error::fatal("permission denied").is_transient());
        assert!(!Error::conflict("already_running", "x").is_transient());
    }

    #[test]
    fn test_envelope_serialization() {
        let env = ApiEnvelope::success("ok", 42u32);
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"status\":\"success\""));
        assert!(!json.contains("\"error\""));

        let env: ApiEnvelope<()> = ApiEnvelope::error("already_running", "policy 7 is running");
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"message\":\"already_running\""));
        assert!(json.contains("policy 7 is running"));
    }
}
