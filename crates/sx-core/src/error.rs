use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Why a push did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushFailureKind {
    /// Credentials missing, rejected, or insufficient permissions.
    Auth,
    /// Host unreachable, DNS failure, connection refused or timed out.
    Network,
    /// The remote refused the update (non fast-forward, hooks).
    Rejected,
    /// The named remote is not configured.
    NoRemote,
    Other,
}

impl std::fmt::Display for PushFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushFailureKind::Auth => write!(f, "auth"),
            PushFailureKind::Network => write!(f, "network"),
            PushFailureKind::Rejected => write!(f, "rejected"),
            PushFailureKind::NoRemote => write!(f, "no-remote"),
            PushFailureKind::Other => write!(f, "other"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("API error: {message} (status: {status})")]
    Api { status: u16, message: String },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider unavailable: primary: {primary}{}", .fallback.as_ref().map(|f| format!("; fallback: {f}")).unwrap_or_default())]
    ProviderUnavailable {
        primary: String,
        fallback: Option<String>,
    },

    #[error("Unparseable model response: {0}")]
    Unparseable(String),

    #[error("Patch rejected: {0}")]
    PatchRejected(String),

    #[error("Tests failed: {0}")]
    TestFailed(String),

    #[error("Push failed ({kind}): {message}")]
    PushFailed {
        kind: PushFailureKind,
        message: String,
    },

    #[error("Path escapes workspace root: {}", .0.display())]
    PathEscape(PathBuf),

    #[error("Git error: {0}")]
    Git(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::RateLimit(message.into())
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn provider_unavailable(primary: impl Into<String>, fallback: Option<String>) -> Self {
        Self::ProviderUnavailable {
            primary: primary.into(),
            fallback,
        }
    }

    pub fn unparseable(reason: impl Into<String>) -> Self {
        Self::Unparseable(reason.into())
    }

    pub fn patch_rejected(reason: impl Into<String>) -> Self {
        Self::PatchRejected(reason.into())
    }

    pub fn test_failed(summary: impl Into<String>) -> Self {
        Self::TestFailed(summary.into())
    }

    pub fn push_failed(kind: PushFailureKind, message: impl Into<String>) -> Self {
        Self::PushFailed {
            kind,
            message: message.into(),
        }
    }

    pub fn path_escape(path: impl Into<PathBuf>) -> Self {
        Self::PathEscape(path.into())
    }

    pub fn git(message: impl Into<String>) -> Self {
        Self::Git(message.into())
    }

    pub fn workspace(message: impl Into<String>) -> Self {
        Self::Workspace(message.into())
    }

    /// Errors that abort an orchestration run outright. Everything else is
    /// recorded and fed back into the next iteration.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ProviderUnavailable { .. } | Error::PathEscape(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::RateLimit(_) | Error::Timeout(_)
        )
    }

    /// The endpoint could not be reached or answered with an error status.
    /// Only these are retried against the fallback provider.
    pub fn warrants_fallback(&self) -> bool {
        self.is_retryable()
            || matches!(
                self,
                Error::Api { .. } | Error::Auth(_) | Error::InvalidRequest(_)
            )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::api(400, "Bad request");
        assert!(err.to_string().contains("400"));
        assert!(err.to_string().contains("Bad request"));
    }

    #[test]
    fn test_is_retryable() {
        assert!(Error::network("timeout").is_retryable());
        assert!(Error::rate_limit("too many requests").is_retryable());
        assert!(!Error::auth("invalid key").is_retryable());
    }

    #[test]
    fn test_only_provider_and_escape_are_fatal() {
        assert!(Error::provider_unavailable("refused", None).is_fatal());
        assert!(Error::path_escape("../etc/passwd").is_fatal());
        assert!(!Error::patch_rejected("hunk failed").is_fatal());
        assert!(!Error::test_failed("exit 1").is_fatal());
        assert!(!Error::unparseable("no diff").is_fatal());
        assert!(!Error::push_failed(PushFailureKind::Network, "down").is_fatal());
    }

    #[test]
    fn test_provider_unavailable_display_includes_both_endpoints() {
        let err = Error::provider_unavailable("connection refused", Some("401".to_string()));
        let text = err.to_string();
        assert!(text.contains("connection refused"));
        assert!(text.contains("fallback: 401"));

        let err = Error::provider_unavailable("connection refused", None);
        assert!(!err.to_string().contains("fallback"));
    }

    #[test]
    fn test_fallback_only_for_transport_and_status_errors() {
        assert!(Error::network("refused").warrants_fallback());
        assert!(Error::timeout("60s").warrants_fallback());
        assert!(Error::rate_limit("slow down").warrants_fallback());
        assert!(Error::api(502, "bad gateway").warrants_fallback());
        assert!(Error::auth("bad key").warrants_fallback());
        assert!(!Error::serialization("missing field `choices`").warrants_fallback());
        assert!(Error::invalid_request("context length exceeded").warrants_fallback());
        assert!(!Error::config("no base url").warrants_fallback());
    }
}
