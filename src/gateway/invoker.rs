//! Retrying invocation of backend calls.
//!
//! One invocation is a loop of attempts with exponential backoff under a hard
//! elapsed ceiling. Fatal errors (auth, bad request, malformed response) end
//! the loop on the first attempt. Cancellation is checked around every call
//! and every sleep.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::usage::{CallRecord, NoopUsageSink, UsageSink};
use super::{Backend, BackendError, EmbedResponse, FailureKind, GenerateRequest, GenerateResponse};

const MAX_MULTIPLIER: f64 = 10.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokerConfig {
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Hard ceiling on total time spent in one invocation, sleeps included.
    pub max_elapsed_ms: u64,
    /// Jitter fraction applied to each delay (0 disables jitter).
    pub randomization: f64,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            max_elapsed_ms: 30_000,
            randomization: 0.5,
        }
    }
}

impl InvokerConfig {
    /// Millisecond-scale delays for tests and offline runs.
    pub fn fast() -> Self {
        Self {
            initial_delay_ms: 1,
            multiplier: 2.0,
            max_delay_ms: 5,
            max_elapsed_ms: 2_000,
            randomization: 0.0,
        }
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn max_elapsed(&self) -> Duration {
        Duration::from_millis(self.max_elapsed_ms)
    }

    /// Reject settings the backoff schedule cannot honour.
    pub fn validate(&self) -> Result<(), BackendError> {
        if !self.multiplier.is_finite() || !(1.0..=MAX_MULTIPLIER).contains(&self.multiplier) {
            return Err(BackendError::config(format!(
                "invoker multiplier must be within 1..={MAX_MULTIPLIER} (got {})",
                self.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.randomization) {
            return Err(BackendError::config(format!(
                "invoker randomization must be within 0..=1 (got {})",
                self.randomization
            )));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(BackendError::config(format!(
                "invoker initial_delay_ms ({}) exceeds max_delay_ms ({})",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}

/// One failed attempt, kept for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub attempt: u32,
    pub code: String,
    pub kind: FailureKind,
    pub message: String,
    pub retryable: bool,
}

impl AttemptFailure {
    fn from_error(attempt: u32, err: &BackendError) -> Self {
        Self {
            attempt,
            code: err.code().to_string(),
            kind: err.kind(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// A successful invocation along with the attempts it took.
#[derive(Debug)]
pub struct Invoked<T> {
    pub value: T,
    pub attempts: u32,
    pub failures: Vec<AttemptFailure>,
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("{error} (after {attempts} attempt(s))")]
    Backend {
        error: BackendError,
        attempts: u32,
        failures: Vec<AttemptFailure>,
    },
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl InvokeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            InvokeError::Backend { error, .. } => error.kind(),
            InvokeError::Cancelled { .. } => FailureKind::Cancelled,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            InvokeError::Backend { attempts, .. } | InvokeError::Cancelled { attempts } => {
                *attempts
            }
        }
    }

    pub fn failures(&self) -> &[AttemptFailure] {
        match self {
            InvokeError::Backend { failures, .. } => failures,
            InvokeError::Cancelled { .. } => &[],
        }
    }
}

/// Wraps backend calls in bounded retry and records every attempt.
#[derive(Clone)]
pub struct Invoker {
    config: InvokerConfig,
    usage: Arc<dyn UsageSink>,
}

impl Default for Invoker {
    fn default() -> Self {
        Self::new(InvokerConfig::default())
    }
}

impl Invoker {
    pub fn new(config: InvokerConfig) -> Self {
        Self {
            config,
            usage: Arc::new(NoopUsageSink),
        }
    }

    pub fn with_usage_sink(mut self, usage: Arc<dyn UsageSink>) -> Self {
        self.usage = usage;
        self
    }

    pub fn config(&self) -> &InvokerConfig {
        &self.config
    }

    /// Run `op` until it succeeds, fails fatally, hits the elapsed ceiling,
    /// or `cancel` fires. `op` receives the 1-based attempt number.
    ///
    /// The ceiling also bounds an attempt still in flight: it is dropped and
    /// the invocation fails with [`BackendError::Timeout`].
    pub async fn retry<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<Invoked<T>, InvokeError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let start = Instant::now();
        let mut backoff = self.config.initial_delay();
        let mut failures = Vec::new();
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(InvokeError::Cancelled { attempts: attempt });
            }
            attempt += 1;

            let remaining = self.config.max_elapsed().saturating_sub(start.elapsed());
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(InvokeError::Cancelled { attempts: attempt });
                }
                r = op(attempt) => r,
                _ = tokio::time::sleep(remaining) => {
                    let err = BackendError::Timeout(self.config.max_elapsed());
                    warn!(attempt, elapsed_ms = start.elapsed().as_millis() as u64, "attempt abandoned at retry ceiling");
                    failures.push(AttemptFailure::from_error(attempt, &err));
                    return Err(InvokeError::Backend {
                        error: err,
                        attempts: attempt,
                        failures,
                    });
                }
            };

            let err = match result {
                Ok(value) => {
                    return Ok(Invoked {
                        value,
                        attempts: attempt,
                        failures,
                    })
                }
                Err(err) => err,
            };

            failures.push(AttemptFailure::from_error(attempt, &err));

            if !err.is_retryable() {
                debug!(attempt, code = err.code(), "fatal backend error, not retrying");
                return Err(InvokeError::Backend {
                    error: err,
                    attempts: attempt,
                    failures,
                });
            }

            let mut delay = self.jittered(backoff);
            if let Some(hint) = err.retry_after() {
                delay = delay.max(hint.min(self.config.max_delay()));
            }

            if start.elapsed() + delay > self.config.max_elapsed() {
                warn!(
                    attempt,
                    code = err.code(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "retry ceiling reached"
                );
                return Err(InvokeError::Backend {
                    error: err,
                    attempts: attempt,
                    failures,
                });
            }

            warn!(
                attempt,
                code = err.code(),
                delay_ms = delay.as_millis() as u64,
                "retryable backend error"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(InvokeError::Cancelled { attempts: attempt });
                }
                _ = tokio::time::sleep(delay) => {}
            }

            backoff = next_backoff(backoff, self.config.multiplier, self.config.max_delay());
        }
    }

    /// Generate through `backend` with retry, recording each attempt.
    pub async fn generate(
        &self,
        cancel: &CancellationToken,
        name: &str,
        backend: &dyn Backend,
        req: &GenerateRequest,
    ) -> Result<Invoked<GenerateResponse>, InvokeError> {
        let usage = self.usage.as_ref();
        self.retry(cancel, move |attempt| async move {
            let started = Instant::now();
            let result = backend.generate(req).await;
            let record = CallRecord::new(name, "generate", req.attribution.caller)
                .attempt(attempt)
                .correlation(req.attribution.correlation_id)
                .latency(started.elapsed().as_millis() as u64);
            let record = match &result {
                Ok(resp) => record.model(&resp.model).tokens(resp.tokens_used),
                Err(e) => record.model(backend.model()).error(e.code()),
            };
            usage.record(record).await;
            result
        })
        .await
    }

    /// Embed through `backend` with retry, recording each attempt.
    pub async fn embed(
        &self,
        cancel: &CancellationToken,
        name: &str,
        backend: &dyn Backend,
        text: &str,
    ) -> Result<Invoked<EmbedResponse>, InvokeError> {
        let usage = self.usage.as_ref();
        self.retry(cancel, move |attempt| async move {
            let started = Instant::now();
            let result = backend.embed(text).await;
            let record = CallRecord::new(name, "embed", "embedding::resolve")
                .attempt(attempt)
                .latency(started.elapsed().as_millis() as u64);
            let record = match &result {
                Ok(resp) => record.model(&resp.model),
                Err(e) => record.model(backend.model()).error(e.code()),
            };
            usage.record(record).await;
            result
        })
        .await
    }

    fn jittered(&self, base: Duration) -> Duration {
        let r = self.config.randomization.clamp(0.0, 1.0);
        if r == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - r)..=(1.0 + r));
        Duration::try_from_secs_f64(base.as_secs_f64() * factor)
            .unwrap_or(self.config.max_delay())
            .min(self.config.max_delay())
    }
}

/// Saturates at `max` instead of overflowing.
fn next_backoff(current: Duration, multiplier: f64, max: Duration) -> Duration {
    let multiplier = if multiplier.is_finite() && multiplier >= 1.0 {
        multiplier
    } else {
        1.0
    };
    Duration::try_from_secs_f64(current.as_secs_f64() * multiplier)
        .unwrap_or(max)
        .min(max)
}

impl std::fmt::Debug for Invoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invoker").field("config", &self.config).finish()
    }
}
