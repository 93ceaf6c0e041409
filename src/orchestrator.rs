//! Stage pipeline orchestration.
//!
//! One run turns a request into candidates:
//! 1. **Assemble**: resolve a backend for every stage (per-stage mapping →
//!    global backend → configured stage default → fallback)
//! 2. **Run**: dispatch stage calls through the invoker, sequentially or
//!    concurrently, chaining outputs when stages refine one another
//! 3. **Collect**: every successful candidate plus one failure entry per
//!    stage (or variant) that produced nothing
//!
//! Only request validation is fatal. Stage failures are data.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::candidate::{Candidate, CorrelationId};
use crate::gateway::{
    Attribution, Backend, BackendRegistry, Example, FailureKind, InvokeError, Invoker,
};
use crate::stages::{build_stage_request, default_stages, Stage, StagePromptOptions};
use crate::trace::{StageEventKind, StageTrace, TraceSink};

// =============================================================================
// Request
// =============================================================================

/// How stage N obtains its input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainMode {
    /// Stage N consumes stage N-1's outputs; a stage with no upstream output
    /// is not dispatched.
    #[default]
    Refine,
    /// Every stage consumes the raw input.
    Independent,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerationRequest {
    #[serde(default = "Uuid::new_v4")]
    pub correlation_id: CorrelationId,
    pub input: String,
    #[serde(default = "default_stages")]
    pub stages: Vec<Stage>,
    /// Variants requested per stage.
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub context: Vec<String>,
    #[serde(default)]
    pub persona: Option<String>,
    #[serde(default)]
    pub examples: Vec<Example>,
    /// Explicit stage name → backend name overrides.
    #[serde(default)]
    pub stage_backends: HashMap<String, String>,
    /// Backend applied to every stage without an explicit override.
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub chain: ChainMode,
    #[serde(default)]
    pub parallel: bool,
    /// Wall-clock budget for the whole run.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

fn default_count() -> usize {
    1
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1000
}

impl GenerationRequest {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            input: input.into(),
            stages: default_stages(),
            count: default_count(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            tags: Vec::new(),
            context: Vec::new(),
            persona: None,
            examples: Vec::new(),
            stage_backends: HashMap::new(),
            backend: None,
            chain: ChainMode::default(),
            parallel: false,
            deadline_ms: None,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.input.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("input must not be empty".into()));
        }
        if self.stages.is_empty() {
            return Err(PipelineError::InvalidRequest("stages must not be empty".into()));
        }
        if self.count == 0 {
            return Err(PipelineError::InvalidRequest("count must be at least 1".into()));
        }
        if !self.temperature.is_finite() || !(0.0..=2.0).contains(&self.temperature) {
            return Err(PipelineError::InvalidRequest(format!(
                "temperature must be within 0.0..=2.0 (got {})",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(PipelineError::InvalidRequest("max_tokens must be at least 1".into()));
        }
        Ok(())
    }
}

/// Per-stage backend defaults and the designated fallback, supplied by the
/// caller instead of read from global state.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StageBackendConfig {
    #[serde(default)]
    pub stage_defaults: HashMap<String, String>,
    #[serde(default)]
    pub fallback: Option<String>,
}

// =============================================================================
// Result
// =============================================================================

/// Lifecycle of one stage. `Pending` and `Dispatched` exist only while a run
/// is in flight (watch them through `Dispatched` trace events); a returned
/// [`StageStatus`] is always terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Dispatched,
    Succeeded,
    Failed,
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageState::Succeeded | StageState::Failed)
    }
}

/// Lifecycle of a run. `Assembling` and `Running` are logged as the run
/// progresses; [`PipelineRun::state`] is always terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Assembling,
    Running,
    PartiallyFailed,
    Completed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::PartiallyFailed | PipelineState::Completed)
    }
}

/// Final per-stage outcome of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStatus {
    pub stage: Stage,
    pub stage_index: usize,
    pub backend: Option<String>,
    pub state: StageState,
    pub succeeded: usize,
    pub failed: usize,
}

/// One `(stage, error)` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub stage_index: usize,
    /// Variant that failed, or `None` when the whole stage failed.
    pub variant: Option<usize>,
    pub backend: Option<String>,
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub correlation_id: CorrelationId,
    pub state: PipelineState,
    /// Successful candidates ordered by stage, then variant.
    pub candidates: Vec<Candidate>,
    pub failures: Vec<StageFailure>,
    pub stages: Vec<StageStatus>,
    pub elapsed_ms: u64,
}

impl PipelineRun {
    /// Distinct backend names that produced at least one candidate.
    pub fn backends_used(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for c in &self.candidates {
            if !names.contains(&c.backend) {
                names.push(c.backend.clone());
            }
        }
        names
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Where a resolved backend name came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    StageOverride,
    Global,
    StageDefault,
    Fallback,
}

pub struct Orchestrator {
    registry: Arc<BackendRegistry>,
    invoker: Invoker,
    stage_config: StageBackendConfig,
    trace: Option<Arc<dyn TraceSink>>,
}

struct CallJob {
    stage: Stage,
    stage_index: usize,
    variant: usize,
    backend_name: String,
    backend: Arc<dyn Backend>,
    input: String,
}

struct ResolvedStage {
    stage: Stage,
    stage_index: usize,
    backend: Option<(String, Arc<dyn Backend>)>,
}

impl Orchestrator {
    pub fn new(registry: Arc<BackendRegistry>, invoker: Invoker, stage_config: StageBackendConfig) -> Self {
        Self {
            registry,
            invoker,
            stage_config,
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn invoker(&self) -> &Invoker {
        &self.invoker
    }

    /// Candidate backend names for a stage, highest priority first.
    pub fn resolution_order<'a>(
        &'a self,
        stage: &Stage,
        req: &'a GenerationRequest,
    ) -> Vec<(ResolutionSource, &'a str)> {
        let mut order = Vec::with_capacity(4);
        if let Some(name) = req.stage_backends.get(stage.as_str()) {
            order.push((ResolutionSource::StageOverride, name.as_str()));
        }
        if let Some(name) = req.backend.as_deref() {
            order.push((ResolutionSource::Global, name));
        }
        if let Some(name) = self.stage_config.stage_defaults.get(stage.as_str()) {
            order.push((ResolutionSource::StageDefault, name.as_str()));
        }
        if let Some(name) = self.stage_config.fallback.as_deref() {
            order.push((ResolutionSource::Fallback, name));
        }
        order
    }

    /// Resolve the backend for one stage, skipping names that are not
    /// registered or not currently available.
    pub async fn resolve_backend(
        &self,
        stage: &Stage,
        req: &GenerationRequest,
    ) -> Result<String, String> {
        let order = self.resolution_order(stage, req);
        let mut tried = Vec::new();
        for (source, name) in order {
            if !self.registry.contains(name) {
                debug!(stage = %stage, backend = name, ?source, "backend not registered");
                tried.push(format!("{name} (not registered)"));
                continue;
            }
            if !self.registry.is_available(name).await {
                debug!(stage = %stage, backend = name, ?source, "backend unavailable");
                tried.push(format!("{name} (unavailable)"));
                continue;
            }
            debug!(stage = %stage, backend = name, ?source, "resolved stage backend");
            return Ok(name.to_string());
        }
        if tried.is_empty() {
            Err(format!("no backend configured for stage {stage}"))
        } else {
            Err(format!(
                "no usable backend for stage {stage}; tried {}",
                tried.join(", ")
            ))
        }
    }

    /// Execute a request. Partial failure is reported in the returned run.
    pub async fn run(
        &self,
        req: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<PipelineRun, PipelineError> {
        req.validate()?;
        let started = Instant::now();
        let correlation_id = req.correlation_id;

        debug!(%correlation_id, state = ?PipelineState::Assembling, stages = req.stages.len(), "assembling pipeline");

        let mut statuses: Vec<StageStatus> = req
            .stages
            .iter()
            .enumerate()
            .map(|(i, stage)| StageStatus {
                stage: stage.clone(),
                stage_index: i,
                backend: None,
                state: StageState::Pending,
                succeeded: 0,
                failed: 0,
            })
            .collect();
        let mut failures: Vec<StageFailure> = Vec::new();
        let mut resolved: Vec<ResolvedStage> = Vec::with_capacity(req.stages.len());

        for (i, stage) in req.stages.iter().enumerate() {
            match self.resolve_backend(stage, req).await {
                Ok(name) => match self.registry.get(&name) {
                    Ok(backend) => {
                        statuses[i].backend = Some(name.clone());
                        resolved.push(ResolvedStage {
                            stage: stage.clone(),
                            stage_index: i,
                            backend: Some((name, backend)),
                        });
                    }
                    Err(e) => {
                        failures.push(self.stage_failed(req, stage, i, FailureKind::Configuration, e.to_string()));
                        resolved.push(ResolvedStage {
                            stage: stage.clone(),
                            stage_index: i,
                            backend: None,
                        });
                    }
                },
                Err(message) => {
                    warn!(%correlation_id, stage = %stage, "{message}");
                    failures.push(self.stage_failed(req, stage, i, FailureKind::Configuration, message));
                    resolved.push(ResolvedStage {
                        stage: stage.clone(),
                        stage_index: i,
                        backend: None,
                    });
                }
            }
        }

        debug!(%correlation_id, state = ?PipelineState::Running, "running pipeline");

        let run_cancel = cancel.child_token();
        let deadline_hit = Arc::new(AtomicBool::new(false));
        let timer = req.deadline_ms.map(|ms| {
            let token = run_cancel.clone();
            let flag = deadline_hit.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                flag.store(true, Ordering::SeqCst);
                token.cancel();
            })
        });

        let mut candidates = match req.chain {
            ChainMode::Independent => {
                self.run_independent(req, &resolved, &run_cancel, &deadline_hit, &mut failures)
                    .await
            }
            ChainMode::Refine => {
                self.run_refine(req, &resolved, &run_cancel, &deadline_hit, &mut failures)
                    .await
            }
        };

        if let Some(timer) = timer {
            timer.abort();
        }

        candidates.sort_by(|a, b| {
            a.stage_index
                .cmp(&b.stage_index)
                .then(a.variant.cmp(&b.variant))
        });
        failures.sort_by(|a, b| {
            a.stage_index
                .cmp(&b.stage_index)
                .then(a.variant.cmp(&b.variant))
        });

        for status in &mut statuses {
            status.succeeded = candidates
                .iter()
                .filter(|c| c.stage_index == status.stage_index)
                .count();
            status.failed = failures
                .iter()
                .filter(|f| f.stage_index == status.stage_index)
                .count();
            status.state = if status.succeeded > 0 {
                StageState::Succeeded
            } else {
                StageState::Failed
            };
        }

        let state = if failures.is_empty() {
            PipelineState::Completed
        } else {
            PipelineState::PartiallyFailed
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            %correlation_id,
            state = ?state,
            candidates = candidates.len(),
            failures = failures.len(),
            elapsed_ms,
            "pipeline finished"
        );

        Ok(PipelineRun {
            correlation_id,
            state,
            candidates,
            failures,
            stages: statuses,
            elapsed_ms,
        })
    }

    async fn run_independent(
        &self,
        req: &GenerationRequest,
        resolved: &[ResolvedStage],
        cancel: &CancellationToken,
        deadline_hit: &AtomicBool,
        failures: &mut Vec<StageFailure>,
    ) -> Vec<Candidate> {
        let mut jobs = Vec::new();
        for rs in resolved {
            let Some((name, backend)) = &rs.backend else {
                continue;
            };
            for variant in 0..req.count {
                jobs.push(CallJob {
                    stage: rs.stage.clone(),
                    stage_index: rs.stage_index,
                    variant,
                    backend_name: name.clone(),
                    backend: backend.clone(),
                    input: req.input.clone(),
                });
            }
        }
        self.dispatch(req, jobs, cancel, deadline_hit, failures).await
    }

    async fn run_refine(
        &self,
        req: &GenerationRequest,
        resolved: &[ResolvedStage],
        cancel: &CancellationToken,
        deadline_hit: &AtomicBool,
        failures: &mut Vec<StageFailure>,
    ) -> Vec<Candidate> {
        let mut all = Vec::new();
        let mut upstream: Vec<String> = vec![req.input.clone()];
        let mut upstream_stage: Option<&Stage> = None;

        for rs in resolved {
            let Some((name, backend)) = &rs.backend else {
                // Configuration failure already recorded; nothing flows downstream.
                upstream.clear();
                upstream_stage = Some(&rs.stage);
                continue;
            };

            if upstream.is_empty() {
                let (kind, message) = if cancel.is_cancelled() {
                    (
                        cancellation_kind(deadline_hit),
                        "not dispatched before the run was cancelled".to_string(),
                    )
                } else {
                    let message = match upstream_stage {
                        Some(prev) => format!("upstream stage {prev} produced no output"),
                        None => "no upstream output".to_string(),
                    };
                    (FailureKind::UpstreamFailed, message)
                };
                failures.push(self.stage_failed(req, &rs.stage, rs.stage_index, kind, message));
                self.emit(
                    StageTrace::new(req.correlation_id, rs.stage.as_str(), rs.stage_index, 0, StageEventKind::Skipped)
                        .backend(name.clone()),
                );
                upstream_stage = Some(&rs.stage);
                continue;
            }

            let jobs: Vec<CallJob> = (0..req.count)
                .map(|variant| CallJob {
                    stage: rs.stage.clone(),
                    stage_index: rs.stage_index,
                    variant,
                    backend_name: name.clone(),
                    backend: backend.clone(),
                    input: upstream[variant % upstream.len()].clone(),
                })
                .collect();

            let mut produced = self.dispatch(req, jobs, cancel, deadline_hit, failures).await;
            produced.sort_by_key(|c| c.variant);
            upstream = produced.iter().map(|c| c.text.clone()).collect();
            upstream_stage = Some(&rs.stage);
            all.extend(produced);
        }
        all
    }

    /// Run jobs one at a time, or concurrently when the request is parallel.
    async fn dispatch(
        &self,
        req: &GenerationRequest,
        jobs: Vec<CallJob>,
        cancel: &CancellationToken,
        deadline_hit: &AtomicBool,
        failures: &mut Vec<StageFailure>,
    ) -> Vec<Candidate> {
        let outcomes: Vec<Result<Candidate, StageFailure>> = if req.parallel {
            let width = jobs.len().max(1);
            stream::iter(jobs.into_iter().map(|job| self.call(req, job, cancel, deadline_hit)))
                .buffer_unordered(width)
                .collect()
                .await
        } else {
            let mut out = Vec::with_capacity(jobs.len());
            for job in jobs {
                out.push(self.call(req, job, cancel, deadline_hit).await);
            }
            out
        };

        let mut candidates = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(c) => candidates.push(c),
                Err(f) => failures.push(f),
            }
        }
        candidates
    }

    async fn call(
        &self,
        req: &GenerationRequest,
        job: CallJob,
        cancel: &CancellationToken,
        deadline_hit: &AtomicBool,
    ) -> Result<Candidate, StageFailure> {
        let stage_name = job.stage.as_str().to_string();

        if cancel.is_cancelled() {
            let kind = cancellation_kind(deadline_hit);
            self.emit(
                StageTrace::new(req.correlation_id, &stage_name, job.stage_index, job.variant, StageEventKind::Skipped)
                    .backend(job.backend_name.clone())
                    .failed(kind, "not dispatched"),
            );
            return Err(StageFailure {
                stage: job.stage,
                stage_index: job.stage_index,
                variant: Some(job.variant),
                backend: Some(job.backend_name),
                kind,
                message: "not dispatched before the run was cancelled".into(),
                attempts: 0,
            });
        }

        let prompt_opts = StagePromptOptions {
            context: &req.context,
            persona: req.persona.as_deref(),
            examples: &req.examples,
        };
        let gen_req = build_stage_request(
            &job.stage,
            &job.input,
            &prompt_opts,
            req.temperature,
            req.max_tokens,
            Attribution::new("orchestrator::stage")
                .with_correlation(req.correlation_id)
                .with_stage(&stage_name),
        );

        self.emit(
            StageTrace::new(req.correlation_id, &stage_name, job.stage_index, job.variant, StageEventKind::Dispatched)
                .backend(job.backend_name.clone()),
        );
        debug!(
            correlation_id = %req.correlation_id,
            stage = %stage_name,
            variant = job.variant,
            backend = %job.backend_name,
            "stage dispatched"
        );

        let started = Instant::now();
        match self
            .invoker
            .generate(cancel, &job.backend_name, job.backend.as_ref(), &gen_req)
            .await
        {
            Ok(invoked) => {
                let resp = invoked.value;
                let candidate = Candidate::new(
                    req.correlation_id,
                    resp.text,
                    job.stage.clone(),
                    job.stage_index,
                    job.variant,
                    &job.backend_name,
                    &resp.model,
                    req.temperature,
                    req.max_tokens,
                    resp.tokens_used,
                )
                .with_tags(&req.tags);

                let mut event = StageTrace::new(
                    req.correlation_id,
                    &stage_name,
                    job.stage_index,
                    job.variant,
                    StageEventKind::Succeeded,
                )
                .backend(job.backend_name.clone());
                event.model = Some(resp.model);
                event.attempts = invoked.attempts;
                event.tokens = resp.tokens_used;
                event.latency_ms = started.elapsed().as_millis() as u64;
                self.emit(event);

                Ok(candidate)
            }
            Err(err) => {
                let kind = match &err {
                    InvokeError::Cancelled { .. } => cancellation_kind(deadline_hit),
                    InvokeError::Backend { error, .. } => error.kind(),
                };
                warn!(
                    correlation_id = %req.correlation_id,
                    stage = %stage_name,
                    variant = job.variant,
                    backend = %job.backend_name,
                    kind = %kind,
                    error = %err,
                    "stage call failed"
                );

                let mut event = StageTrace::new(
                    req.correlation_id,
                    &stage_name,
                    job.stage_index,
                    job.variant,
                    StageEventKind::Failed,
                )
                .backend(job.backend_name.clone())
                .failed(kind, err.to_string());
                event.attempts = err.attempts();
                event.latency_ms = started.elapsed().as_millis() as u64;
                self.emit(event);

                Err(StageFailure {
                    stage: job.stage,
                    stage_index: job.stage_index,
                    variant: Some(job.variant),
                    backend: Some(job.backend_name),
                    kind,
                    message: err.to_string(),
                    attempts: err.attempts(),
                })
            }
        }
    }

    fn stage_failed(
        &self,
        req: &GenerationRequest,
        stage: &Stage,
        stage_index: usize,
        kind: FailureKind,
        message: String,
    ) -> StageFailure {
        if kind == FailureKind::Configuration {
            self.emit(
                StageTrace::new(req.correlation_id, stage.as_str(), stage_index, 0, StageEventKind::Failed)
                    .failed(kind, message.clone()),
            );
        }
        StageFailure {
            stage: stage.clone(),
            stage_index,
            variant: None,
            backend: None,
            kind,
            message,
            attempts: 0,
        }
    }

    fn emit(&self, event: StageTrace) {
        if let Some(trace) = &self.trace {
            if let Err(e) = trace.record(event) {
                warn!(error = %e, "failed to record stage trace");
            }
        }
    }
}

fn cancellation_kind(deadline_hit: &AtomicBool) -> FailureKind {
    if deadline_hit.load(Ordering::SeqCst) {
        FailureKind::DeadlineExceeded
    } else {
        FailureKind::Cancelled
    }
}
