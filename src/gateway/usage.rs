//! Per-attempt accounting for backend calls.
//!
//! The invoker hands one [`CallRecord`] to its [`UsageSink`] after every
//! attempt, successful or not. Sinks never fail the call they describe.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }
}

/// One backend attempt, as seen by the invoker.
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    /// Registry name, not the backend kind.
    pub backend: String,
    /// "generate" or "embed".
    pub operation: &'static str,
    pub model: String,
    pub tokens: u32,
    /// 1-based within one invocation.
    pub attempt: u32,
    pub latency_ms: u64,
    pub status: CallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub caller: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

impl CallRecord {
    pub fn new(backend: impl Into<String>, operation: &'static str, caller: &'static str) -> Self {
        Self {
            backend: backend.into(),
            operation,
            model: String::new(),
            tokens: 0,
            attempt: 1,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            caller,
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn tokens(mut self, tokens: u32) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn correlation(mut self, id: Option<Uuid>) -> Self {
        self.correlation_id = id;
        self
    }

    /// Mark the attempt failed with a stable error code.
    pub fn error(mut self, code: impl Into<String>) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code.into());
        self
    }
}

#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: CallRecord);
}

/// Default sink for library use.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: CallRecord) {}
}

/// One JSON object per attempt on stderr; backs `alembic generate --usage`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrUsageSink;

#[async_trait]
impl UsageSink for StderrUsageSink {
    async fn record(&self, record: CallRecord) {
        match serde_json::to_string(&record) {
            Ok(line) => eprintln!("{line}"),
            Err(e) => tracing::warn!(error = %e, "failed to encode usage record"),
        }
    }
}
