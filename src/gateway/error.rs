//! Error types for generation backends.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Additional context from backend errors for debugging.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// HTTP status code from the backend.
    pub http_status: Option<u16>,
    /// Backend-specific error code (e.g. "rate_limit_exceeded").
    pub provider_code: Option<String>,
    /// Request ID from the backend (x-request-id header).
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Errors that can occur when calling a backend.
///
/// The variants are distinguishable enough for the invoker to choose between
/// retrying and failing fast.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Backend returned 429. Retryable.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        context: Option<ErrorContext>,
    },

    /// Credentials rejected (401/403). Never retried.
    #[error("authentication failed: {message}")]
    Auth {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Request rejected as invalid (other 4xx). Never retried.
    #[error("bad request: {message}")]
    BadRequest {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Backend-side failure (5xx). Retryable.
    #[error("{backend} server error: {message}")]
    Server {
        backend: String,
        message: String,
        context: Option<ErrorContext>,
    },

    /// Response arrived but could not be interpreted.
    #[error("{backend} returned a malformed response: {message}")]
    MalformedResponse { backend: String, message: String },

    /// Request timed out. Retryable.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// HTTP/network error. Retryable.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Backend does not implement embeddings.
    #[error("{0} does not support embeddings")]
    EmbeddingsUnsupported(String),

    /// Backend is not configured or not reachable.
    #[error("{0} is unavailable")]
    Unavailable(String),

    /// Configuration error (missing API key, bad URL, etc.).
    #[error("configuration error: {0}")]
    Config(String),
}

impl BackendError {
    /// Create a rate limited error.
    pub fn rate_limited(retry_after: Duration, context: ErrorContext) -> Self {
        Self::RateLimited {
            retry_after,
            context: Some(context),
        }
    }

    /// Create an authentication error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
            context: None,
        }
    }

    /// Create a bad request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
            context: None,
        }
    }

    /// Create a server error.
    pub fn server(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Server {
            backend: backend.into(),
            message: message.into(),
            context: None,
        }
    }

    /// Create a malformed response error.
    pub fn malformed(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Invalid local setup; never retried.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Map a non-success HTTP status to the matching error kind.
    pub fn from_status(
        backend: &str,
        status: u16,
        message: impl Into<String>,
        context: ErrorContext,
        retry_after: Option<Duration>,
    ) -> Self {
        let message = message.into();
        match status {
            429 => Self::RateLimited {
                retry_after: retry_after.unwrap_or(Duration::from_secs(1)),
                context: Some(context),
            },
            401 | 403 => Self::Auth {
                message,
                context: Some(context),
            },
            408 => Self::Timeout(Duration::ZERO),
            400..=499 => Self::BadRequest {
                message,
                context: Some(context),
            },
            _ => Self::Server {
                backend: backend.to_string(),
                message,
                context: Some(context),
            },
        }
    }

    /// Transient failures the invoker may retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Server { .. } => true,
            Self::Timeout(_) => true,
            Self::Transport(e) => !e.is_builder() && !e.is_decode(),
            Self::Auth { .. } => false,
            Self::BadRequest { .. } => false,
            Self::MalformedResponse { .. } => false,
            Self::EmbeddingsUnsupported(_) => false,
            Self::Unavailable(_) => false,
            Self::Config(_) => false,
        }
    }

    /// Backend-suggested minimum wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Stable code for usage records and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Auth { .. } => "auth_error",
            Self::BadRequest { .. } => "bad_request",
            Self::Server { .. } => "server_error",
            Self::MalformedResponse { .. } => "malformed_response",
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport_error",
            Self::EmbeddingsUnsupported(_) => "embeddings_unsupported",
            Self::Unavailable(_) => "unavailable",
            Self::Config(_) => "config_error",
        }
    }

    /// Classify into the pipeline-level failure taxonomy.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::RateLimited { .. } => FailureKind::RateLimited,
            Self::Auth { .. } => FailureKind::Auth,
            Self::BadRequest { .. } => FailureKind::BadRequest,
            Self::Server { .. } | Self::Timeout(_) | Self::Transport(_) => FailureKind::Transport,
            Self::MalformedResponse { .. } => FailureKind::MalformedResponse,
            Self::EmbeddingsUnsupported(_) => FailureKind::EmbeddingUnavailable,
            Self::Unavailable(_) | Self::Config(_) => FailureKind::Configuration,
        }
    }

    /// Upstream details, for the variants that carry them.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. } => context.as_ref(),
            Self::Auth { context, .. } => context.as_ref(),
            Self::BadRequest { context, .. } => context.as_ref(),
            Self::Server { context, .. } => context.as_ref(),
            _ => None,
        }
    }

    /// Upstream request id, for support tickets.
    pub fn request_id(&self) -> Option<&str> {
        self.context().and_then(|c| c.request_id.as_deref())
    }
}

/// Pipeline-level classification of a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No backend could be resolved for a stage.
    Configuration,
    /// Network, timeout, or 5xx failure that outlasted the retry ceiling.
    Transport,
    /// Rate limiting that outlasted the retry ceiling.
    RateLimited,
    /// Credentials rejected.
    Auth,
    /// Request rejected as invalid.
    BadRequest,
    /// Backend answered with something unusable.
    MalformedResponse,
    /// No embedding-capable backend was reachable.
    EmbeddingUnavailable,
    /// Judge pass failed; heuristic selection kept.
    JudgeFailure,
    /// Caller cancelled the work.
    Cancelled,
    /// Pipeline deadline elapsed before the work finished.
    DeadlineExceeded,
    /// Refinement input missing because an earlier stage produced nothing.
    UpstreamFailed,
    /// Saving or marking a candidate failed; the result is unaffected.
    Persistence,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Configuration => "configuration",
            FailureKind::Transport => "transport",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Auth => "auth",
            FailureKind::BadRequest => "bad_request",
            FailureKind::MalformedResponse => "malformed_response",
            FailureKind::EmbeddingUnavailable => "embedding_unavailable",
            FailureKind::JudgeFailure => "judge_failure",
            FailureKind::Cancelled => "cancelled",
            FailureKind::DeadlineExceeded => "deadline_exceeded",
            FailureKind::UpstreamFailed => "upstream_failed",
            FailureKind::Persistence => "persistence",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_separates_retryable_from_fatal() {
        let ctx = ErrorContext::new();
        assert!(BackendError::from_status("x", 429, "", ctx.clone(), None).is_retryable());
        assert!(BackendError::from_status("x", 503, "", ctx.clone(), None).is_retryable());
        assert!(!BackendError::from_status("x", 400, "", ctx.clone(), None).is_retryable());
        assert!(!BackendError::from_status("x", 401, "", ctx.clone(), None).is_retryable());
        assert!(matches!(
            BackendError::from_status("x", 403, "", ctx, None),
            BackendError::Auth { .. }
        ));
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        let err = BackendError::from_status(
            "x",
            429,
            "slow down",
            ErrorContext::new(),
            Some(Duration::from_secs(3)),
        );
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(err.kind(), FailureKind::RateLimited);
    }
}
