use std::io;
use std::path::PathBuf;

use thiserror::Error;

// ── Backend Errors ─────────────────────────────────────

/// Failure raised by a backend while priming or running a synthesis,
/// or by the router when a backend "succeeds" without writing output.
///
/// `Connectivity` and `Truncated` are transient network conditions:
/// they are never memoized, so a flaky connection does not block
/// retries for the whole memo window.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("network connectivity problem: {0}")]
    Connectivity(String),
    #[error("truncated read: {0}")]
    Truncated(String),
    #[error("{0}")]
    Service(String),
    #[error("the {0} service did not successfully write out an MP3")]
    NoOutput(String),
}

impl BackendError {
    /// Transient errors are excluded from the failure memo.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connectivity(_) | Self::Truncated(_))
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            Self::Connectivity(err.to_string())
        } else if err.is_body() || err.is_decode() {
            Self::Truncated(err.to_string())
        } else {
            Self::Service(err.to_string())
        }
    }
}

impl From<io::Error> for BackendError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut => Self::Connectivity(err.to_string()),
            io::ErrorKind::UnexpectedEof => Self::Truncated(err.to_string()),
            _ => Self::Service(err.to_string()),
        }
    }
}

// ── Router Errors ──────────────────────────────────────

/// Everything the router can hand to a `fail` callback.
///
/// None of these propagate synchronously to the caller; they always
/// travel through the callback set together with the input text.
#[derive(Debug, Clone, Error)]
pub enum RouterError {
    /// Bad service ID, bad/missing option, or unusable text.
    #[error("{0}")]
    Validation(String),

    /// A synthesis for the same cache path is already underway.
    #[error("the '{svc_id}' service is already busy processing {path}")]
    Busy { svc_id: String, path: PathBuf },

    /// The backend raised, or wrote no output file.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Every preset in a group was tried and none could play the text.
    #[error("none of the presets in this group were able to play the input text")]
    GroupExhausted,
}

impl RouterError {
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_and_truncation_are_transient() {
        assert!(BackendError::Connectivity("refused".into()).is_transient());
        assert!(BackendError::Truncated("eof".into()).is_transient());
        assert!(!BackendError::Service("HTTP 500".into()).is_transient());
        assert!(!BackendError::NoOutput("Google".into()).is_transient());
    }

    #[test]
    fn io_errors_classify_by_kind() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "nope");
        assert!(BackendError::from(refused).is_transient());

        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "short body");
        assert!(matches!(BackendError::from(eof), BackendError::Truncated(_)));

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "no");
        assert!(!BackendError::from(denied).is_transient());
    }

    #[test]
    fn busy_detection() {
        let err = RouterError::Busy {
            svc_id: "google".into(),
            path: PathBuf::from("/tmp/x.mp3"),
        };
        assert!(err.is_busy());
        assert!(!RouterError::GroupExhausted.is_busy());
    }

    #[test]
    fn no_output_message_names_the_service() {
        let err = BackendError::NoOutput("Google Translate".into());
        assert!(err.to_string().contains("Google Translate"));
    }
}
