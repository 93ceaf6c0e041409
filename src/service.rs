//! End-to-end generation: orchestrate, embed, rank, judge, optimise, persist.
//!
//! Only an invalid request fails the call. Every other problem (stage
//! failures, missing embeddings, judge errors, storage errors) is reported in
//! the outcome and the best available result is still returned.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::candidate::{Candidate, CorrelationId};
use crate::config::{AlembicConfig, ConfigError};
use crate::gateway::{
    BackendRegistry, EmbeddingError, EmbeddingResolver, FailureKind, Invoker, UsageSink,
};
use crate::judge::{
    EvaluationWeights, JudgeConfig, JudgeError, JudgeSelector, JudgeWeightPresets, Selection,
    SelectionCriteria, SelectionSource,
};
use crate::optimize::{OptimizeConfig, OptimizeOutcome, Optimizer, Scorer};
use crate::orchestrator::{
    GenerationRequest, Orchestrator, PipelineError, PipelineState, StageFailure, StageStatus,
};
use crate::ranking::{RankingContext, RankingEngine, RankingResult, WeightPresets, WeightsError};
use crate::store::{input_fingerprint, CandidateStore, NoopCandidateStore, SqliteCandidateStore, StoreError};
use crate::trace::TraceSink;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("ranking weights: {0}")]
    Weights(#[from] WeightsError),
    #[error("judge: {0}")]
    Judge(#[from] JudgeError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

// =============================================================================
// Options & outcome
// =============================================================================

/// Everything a caller can ask of one generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateOptions {
    #[serde(flatten)]
    pub request: GenerationRequest,
    /// Save candidates and mark the selection accepted.
    #[serde(default)]
    pub persist: bool,
    #[serde(default)]
    pub optimize: bool,
    /// Overrides the configured iteration count.
    #[serde(default)]
    pub optimize_iterations: Option<usize>,
    #[serde(default)]
    pub judge: bool,
    /// Full judge criteria; built from the request when absent.
    #[serde(default)]
    pub criteria: Option<SelectionCriteria>,
    /// Judge weight preset name, used when `criteria` is absent.
    #[serde(default)]
    pub judge_preset: Option<String>,
    /// Ranking weight preset name for this request only.
    #[serde(default)]
    pub ranking_preset: Option<String>,
    #[serde(default)]
    pub include_embeddings: bool,
}

impl GenerateOptions {
    pub fn new(input: impl Into<String>) -> Self {
        Self::from_request(GenerationRequest::new(input))
    }

    pub fn from_request(request: GenerationRequest) -> Self {
        Self {
            request,
            persist: false,
            optimize: false,
            optimize_iterations: None,
            judge: false,
            criteria: None,
            judge_preset: None,
            ranking_preset: None,
            include_embeddings: false,
        }
    }
}

/// A non-fatal problem met after the pipeline ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeWarning {
    pub kind: FailureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_id: Option<Uuid>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeMetadata {
    pub elapsed_ms: u64,
    pub pipeline_elapsed_ms: u64,
    pub stage_count: usize,
    pub backends_used: Vec<String>,
    pub state: PipelineState,
    pub stages: Vec<StageStatus>,
    pub failures: Vec<StageFailure>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<OutcomeWarning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub correlation_id: CorrelationId,
    pub candidates: Vec<Candidate>,
    pub ranked: Vec<RankingResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<Candidate>,
    pub selection: Selection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimization: Option<OptimizeOutcome>,
    pub metadata: OutcomeMetadata,
}

// =============================================================================
// Service
// =============================================================================

pub struct GenerationService {
    orchestrator: Orchestrator,
    ranking: RankingEngine,
    ranking_presets: WeightPresets,
    judge: JudgeSelector,
    judge_presets: JudgeWeightPresets,
    judge_backend: Option<String>,
    judge_weights: EvaluationWeights,
    optimizer: Optimizer,
    resolver: EmbeddingResolver,
    store: Arc<dyn CandidateStore>,
    historical_weight: f64,
    history_limit: usize,
}

impl GenerationService {
    pub fn new(orchestrator: Orchestrator, ranking: RankingEngine) -> Self {
        let registry = orchestrator.registry().clone();
        let invoker = orchestrator.invoker().clone();
        Self {
            judge: JudgeSelector::new(registry.clone(), invoker.clone()),
            optimizer: Optimizer::new(registry, invoker, OptimizeConfig::default()),
            orchestrator,
            ranking,
            ranking_presets: WeightPresets::default(),
            judge_presets: JudgeWeightPresets::default(),
            judge_backend: None,
            judge_weights: EvaluationWeights::default(),
            resolver: EmbeddingResolver::new(),
            store: Arc::new(NoopCandidateStore),
            historical_weight: 1.0,
            history_limit: 20,
        }
    }

    /// Wire everything from a validated configuration. The trace sink, if
    /// any, is owned by the caller.
    pub fn from_config(
        config: &AlembicConfig,
        trace: Option<Arc<dyn TraceSink>>,
        usage: Option<Arc<dyn UsageSink>>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let registry = Arc::new(config.build_registry()?);
        let mut invoker = Invoker::new(config.invoker);
        if let Some(usage) = usage {
            invoker = invoker.with_usage_sink(usage);
        }
        let mut orchestrator = Orchestrator::new(registry, invoker, config.stage_backend_config());
        if let Some(trace) = trace {
            orchestrator = orchestrator.with_trace(trace);
        }

        let mut service = Self::new(orchestrator, config.ranking_engine()?)
            .with_ranking_presets(config.weight_presets()?)
            .with_judge(config.judge.call, config.judge.backend.clone())
            .with_judge_presets(config.judge_presets()?, config.judge_weights()?)
            .with_optimize_config(config.optimize)
            .with_resolver(config.embedding_resolver())
            .with_history(config.ranking.historical_weight, config.ranking.history_limit);
        if let Some(path) = &config.store_path {
            service = service.with_store(Arc::new(SqliteCandidateStore::new(path)?));
        }
        Ok(service)
    }

    pub fn with_store(mut self, store: Arc<dyn CandidateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_resolver(mut self, resolver: EmbeddingResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_ranking_presets(mut self, presets: WeightPresets) -> Self {
        self.ranking_presets = presets;
        self
    }

    pub fn with_judge(mut self, config: JudgeConfig, backend: Option<String>) -> Self {
        self.judge = self.judge.with_config(config);
        self.judge_backend = backend;
        self
    }

    pub fn with_judge_presets(mut self, presets: JudgeWeightPresets, default_weights: EvaluationWeights) -> Self {
        self.judge_presets = presets;
        self.judge_weights = default_weights;
        self
    }

    pub fn with_optimize_config(mut self, config: OptimizeConfig) -> Self {
        self.optimizer = Optimizer::new(
            self.orchestrator.registry().clone(),
            self.orchestrator.invoker().clone(),
            config,
        );
        self
    }

    pub fn with_history(mut self, historical_weight: f64, limit: usize) -> Self {
        self.historical_weight = historical_weight.clamp(0.0, 1.0);
        self.history_limit = limit;
        self
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        self.orchestrator.registry()
    }

    pub fn store(&self) -> &Arc<dyn CandidateStore> {
        &self.store
    }

    pub async fn generate(
        &self,
        opts: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome, ServiceError> {
        let started = Instant::now();
        let req = &opts.request;

        let ranking = match &opts.ranking_preset {
            Some(name) => self.ranking.reweighted(self.ranking_presets.get(name)?)?,
            None => self.ranking.clone(),
        };
        let criteria = if opts.judge {
            Some(self.criteria_for(opts)?)
        } else {
            None
        };

        let run = self.orchestrator.run(req, cancel).await?;
        let mut candidates = run.candidates.clone();
        let mut warnings = Vec::new();
        let fingerprint = input_fingerprint(&req.input);

        let history: Vec<String> = match self
            .store
            .historical_lookup(&fingerprint, self.history_limit)
            .await
        {
            Ok(entries) => entries.into_iter().map(|e| e.text).collect(),
            Err(e) => {
                warn!(error = %e, "historical lookup failed");
                Vec::new()
            }
        };

        let embedded = if opts.include_embeddings && !candidates.is_empty() {
            self.attach_embeddings(&req.input, &mut candidates, &mut warnings, cancel)
                .await
        } else {
            None
        };

        let ctx = RankingContext {
            input: &req.input,
            input_embedding: embedded.as_ref().map(|(_, v)| v.as_slice()),
            context: &req.context,
            history: &history,
            historical_weight: self.historical_weight,
        };
        let mut ranked = ranking.rank(&candidates, &ctx);
        RankingEngine::annotate(&mut candidates, &ranked);

        let mut selection = match &criteria {
            Some(criteria) if !candidates.is_empty() => {
                let selection = self
                    .judge
                    .select_or_fallback(&candidates, &ranked, criteria, cancel)
                    .await;
                if let Some(result) = &selection.judge {
                    JudgeSelector::annotate(&mut candidates, result);
                }
                if let (Some(err), Some(kind)) = (&selection.judge_error, selection.judge_error_kind) {
                    warnings.push(OutcomeWarning {
                        kind,
                        candidate_id: None,
                        message: err.clone(),
                    });
                }
                selection
            }
            _ => Selection::heuristic(&ranked),
        };

        let mut optimization = None;
        if opts.optimize {
            let selected = selection
                .candidate_id
                .and_then(|id| candidates.iter().find(|c| c.id == id))
                .cloned();
            if let Some(selected) = selected {
                let mut config = *self.optimizer.config();
                if let Some(n) = opts.optimize_iterations {
                    config.max_iterations = n;
                }
                let optimizer = Optimizer::new(self.registry().clone(), self.orchestrator.invoker().clone(), config)
                    .with_embedder(embedded.as_ref().map(|(name, _)| name.clone()));
                let outcome = match (&selection.judge, &criteria) {
                    (Some(result), Some(criteria)) => {
                        let baseline = result
                            .scores
                            .iter()
                            .find(|e| e.candidate_id == selected.id)
                            .and_then(|e| e.composite)
                            .unwrap_or(0.0);
                        let scorer = Scorer::Judge {
                            selector: &self.judge,
                            criteria,
                        };
                        optimizer
                            .optimize(&req.input, &selected, baseline, &scorer, cancel)
                            .await
                    }
                    _ => {
                        let baseline = selected.composite_score.unwrap_or(0.0);
                        let scorer = Scorer::Ranking { engine: &ranking, ctx };
                        optimizer
                            .optimize(&req.input, &selected, baseline, &scorer, cancel)
                            .await
                    }
                };

                if let Some(child) = &outcome.improved {
                    candidates.push(child.clone());
                    ranked = ranking.rank(&candidates, &ctx);
                    RankingEngine::annotate(&mut candidates, &ranked);
                    selection.candidate_id = Some(child.id);
                    selection.source = SelectionSource::Optimized;
                }
                optimization = Some(outcome);
            }
        }

        let selected = selection
            .candidate_id
            .and_then(|id| candidates.iter().find(|c| c.id == id))
            .cloned();

        if opts.persist {
            self.persist(&fingerprint, &candidates, selected.as_ref(), &mut warnings)
                .await;
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            correlation_id = %run.correlation_id,
            candidates = candidates.len(),
            selected = ?selected.as_ref().map(|c| c.id),
            source = ?selection.source,
            elapsed_ms,
            "generation finished"
        );

        let metadata = OutcomeMetadata {
            elapsed_ms,
            pipeline_elapsed_ms: run.elapsed_ms,
            stage_count: req.stages.len(),
            backends_used: run.backends_used(),
            state: run.state,
            stages: run.stages,
            failures: run.failures,
            warnings,
            judge_error: selection.judge_error.clone(),
        };

        Ok(GenerationOutcome {
            correlation_id: run.correlation_id,
            candidates,
            ranked,
            selected,
            selection,
            optimization,
            metadata,
        })
    }

    /// Criteria from the request, filling the judge backend and weights from
    /// service defaults.
    fn criteria_for(&self, opts: &GenerateOptions) -> Result<SelectionCriteria, ServiceError> {
        let mut criteria = match &opts.criteria {
            Some(c) => c.clone(),
            None => {
                let weights = match &opts.judge_preset {
                    Some(name) => self.judge_presets.get(name)?,
                    None => self.judge_weights,
                };
                SelectionCriteria {
                    task_description: opts.request.input.clone(),
                    persona: opts.request.persona.clone(),
                    requirements: opts.request.context.clone(),
                    weights,
                    ..Default::default()
                }
            }
        };
        if criteria.judge_backend.trim().is_empty() {
            criteria.judge_backend = self.judge_backend.clone().unwrap_or_default();
        }
        Ok(criteria)
    }

    /// Embed the input and every candidate through one resolved backend so
    /// all vectors share a model. Returns that backend's name and the input
    /// vector; a failure leaves the affected vector empty and records a
    /// warning.
    async fn attach_embeddings(
        &self,
        input: &str,
        candidates: &mut [Candidate],
        warnings: &mut Vec<OutcomeWarning>,
        cancel: &CancellationToken,
    ) -> Option<(String, Vec<f32>)> {
        let registry = self.registry();
        let invoker = self.orchestrator.invoker();
        let primary = candidates
            .first()
            .map(|c| c.backend.clone())
            .unwrap_or_default();

        let embedded = async {
            let name = self.resolver.resolve(registry, &primary).await?;
            let vector = EmbeddingResolver::embed_with(registry, invoker, cancel, &name, input).await?;
            Ok::<_, EmbeddingError>((name, vector))
        };
        let (name, input_embedding) = match embedded.await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "input embedding unavailable; embedding axis stays neutral");
                warnings.push(OutcomeWarning {
                    kind: e.kind(),
                    candidate_id: None,
                    message: e.to_string(),
                });
                return None;
            }
        };
        debug!(backend = %name, "embedding batch");

        for c in candidates.iter_mut() {
            match EmbeddingResolver::embed_with(registry, invoker, cancel, &name, &c.text).await {
                Ok(v) => c.embedding = Some(v),
                Err(e) => {
                    debug!(candidate = %c.id, error = %e, "candidate embedding unavailable");
                    warnings.push(OutcomeWarning {
                        kind: e.kind(),
                        candidate_id: Some(c.id),
                        message: e.to_string(),
                    });
                }
            }
        }
        Some((name, input_embedding))
    }

    async fn persist(
        &self,
        fingerprint: &str,
        candidates: &[Candidate],
        selected: Option<&Candidate>,
        warnings: &mut Vec<OutcomeWarning>,
    ) {
        for c in candidates {
            if let Err(e) = self.store.save(fingerprint, c).await {
                warn!(candidate = %c.id, error = %e, "failed to save candidate");
                warnings.push(OutcomeWarning {
                    kind: FailureKind::Persistence,
                    candidate_id: Some(c.id),
                    message: format!("persist: {e}"),
                });
            }
        }
        if let Some(selected) = selected {
            if let Err(e) = self.store.mark_accepted(selected.id).await {
                warn!(candidate = %selected.id, error = %e, "failed to mark candidate accepted");
                warnings.push(OutcomeWarning {
                    kind: FailureKind::Persistence,
                    candidate_id: Some(selected.id),
                    message: format!("mark accepted: {e}"),
                });
            }
        }
    }
}
