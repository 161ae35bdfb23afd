//! Error kinds surfaced by the uploader.
//!
//! Every fatal failure of a run maps onto exactly one [`Error`] variant. The
//! variant decides both the message printed to the user and the exit code of
//! the `upload_video` binary.

use std::fmt;

use thiserror::Error;

/// Exit code used for metadata problems, mirroring a CLI usage error.
pub const EXIT_VALIDATION: i32 = 2;
/// Exit code used for every other fatal failure.
pub const EXIT_FAILURE: i32 = 1;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The OAuth client configuration could not be located or parsed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The merged metadata record is incomplete or malformed.
    #[error("invalid metadata: {0}")]
    Validation(String),

    /// Consent was denied, timed out, or the token endpoint rejected us.
    #[error("authorization failed: {0}")]
    Authorization(String),

    /// The core upload did not produce a video.
    #[error("upload failed: {0}")]
    Upload(#[source] ApiError),

    /// A thumbnail or playlist step failed after the video was created.
    #[error("{action} failed for video {video_id}: {source}")]
    PostAction {
        action: PostAction,
        video_id: String,
        #[source]
        source: ApiError,
    },
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn authorization(msg: impl Into<String>) -> Self {
        Self::Authorization(msg.into())
    }

    /// True when the run should abort before touching the remote platform.
    pub fn is_pre_upload(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::Validation(_) | Self::Authorization(_)
        )
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) => EXIT_VALIDATION,
            Self::PostAction { .. } => 0,
            _ => EXIT_FAILURE,
        }
    }
}

/// The two actions that may run once a video id exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostAction {
    Thumbnail,
    Playlist,
}

impl fmt::Display for PostAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thumbnail => f.write_str("thumbnail"),
            Self::Playlist => f.write_str("playlist insert"),
        }
    }
}

/// A failed call against the video platform API.
///
/// `transient` tells callers whether repeating the same request could
/// plausibly succeed (network trouble, 5xx, rate limiting). Terminal errors
/// such as an exhausted quota or a rejected file are never worth repeating.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: Option<u16>,
    pub reason: Option<String>,
    pub message: String,
    pub transient: bool,
}

const TRANSIENT_REASONS: &[&str] = &["rateLimitExceeded", "userRateLimitExceeded", "backendError"];

impl ApiError {
    /// Network level failure: nothing came back from the server.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            reason: None,
            message: message.into(),
            transient: true,
        }
    }

    /// Failure that happened locally (unreadable file, malformed response).
    pub fn local(message: impl Into<String>) -> Self {
        Self {
            status: None,
            reason: None,
            message: message.into(),
            transient: false,
        }
    }

    /// Builds an error from an HTTP status and the platform's error reason.
    pub fn from_status(status: u16, reason: Option<String>, message: impl Into<String>) -> Self {
        let transient = status >= 500
            || status == 429
            || reason
                .as_deref()
                .is_some_and(|r| TRANSIENT_REASONS.contains(&r));
        Self {
            status: Some(status),
            reason,
            message: message.into(),
            transient,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.transient { "transient" } else { "terminal" };
        match (self.status, self.reason.as_deref()) {
            (Some(status), Some(reason)) => {
                write!(f, "HTTP {status} ({reason}, {kind}): {}", self.message)
            }
            (Some(status), None) => write!(f, "HTTP {status} ({kind}): {}", self.message),
            (None, _) => write!(f, "{} ({kind})", self.message),
        }
    }
}

impl std::error::Error for ApiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_rate_limits_are_transient() {
        assert!(ApiError::from_status(503, None, "unavailable").transient);
        assert!(ApiError::from_status(429, None, "slow down").transient);
        assert!(
            ApiError::from_status(403, Some("userRateLimitExceeded".into()), "limit").transient
        );
        assert!(ApiError::transport("connection reset").transient);
    }

    #[test]
    fn quota_and_bad_requests_are_terminal() {
        assert!(!ApiError::from_status(403, Some("quotaExceeded".into()), "quota").transient);
        assert!(!ApiError::from_status(400, Some("invalidTitle".into()), "bad").transient);
        assert!(!ApiError::from_status(401, None, "auth").transient);
    }

    #[test]
    fn exit_codes_follow_error_kind() {
        assert_eq!(Error::validation("no title").exit_code(), EXIT_VALIDATION);
        assert_eq!(Error::configuration("missing").exit_code(), EXIT_FAILURE);
        assert_eq!(
            Error::Upload(ApiError::transport("reset")).exit_code(),
            EXIT_FAILURE
        );
        assert!(Error::authorization("denied").is_pre_upload());
        assert!(!Error::Upload(ApiError::local("x")).is_pre_upload());
    }

    #[test]
    fn api_error_display_mentions_status_and_reason() {
        let err = ApiError::from_status(403, Some("quotaExceeded".into()), "daily quota used");
        let text = err.to_string();
        assert!(text.contains("403"));
        assert!(text.contains("quotaExceeded"));
        assert!(text.contains("terminal"));
    }
}
