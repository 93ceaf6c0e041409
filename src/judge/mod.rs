//! Judge-based selection.
//!
//! A designated backend scores each candidate on five weighted dimensions.
//! Calls go through the [`Invoker`] with bounded concurrency. Any failure
//! leaves the heuristic ranking's top pick in place; see
//! [`JudgeSelector::select_or_fallback`].

pub mod criteria;
pub mod parse;

use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::candidate::Candidate;
use crate::gateway::{
    Attribution, Backend, BackendRegistry, FailureKind, GenerateRequest, InvokeError, Invoker,
    RegistryError,
};
use crate::ranking::RankingResult;

pub use criteria::{EvaluationWeights, JudgeWeightPresets, SelectionCriteria, DIMENSIONS};
pub use parse::{extract_json, parse_evaluation, DimensionScores, ParsedEvaluation};

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("invalid selection criteria: {0}")]
    InvalidCriteria(String),
    #[error("no candidates to judge")]
    NoCandidates,
    #[error("judge backend: {0}")]
    Registry(#[from] RegistryError),
    #[error("malformed judge response: {0}")]
    Malformed(String),
    #[error("judge call failed: {0}")]
    Invoke(#[from] InvokeError),
    #[error("judging cancelled")]
    Cancelled,
    #[error("all {count} evaluations failed; first error: {first}")]
    AllEvaluationsFailed { count: usize, first: String },
}

impl JudgeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            JudgeError::Cancelled => FailureKind::Cancelled,
            JudgeError::Invoke(e) => match e {
                InvokeError::Cancelled { .. } => FailureKind::Cancelled,
                _ => FailureKind::JudgeFailure,
            },
            _ => FailureKind::JudgeFailure,
        }
    }
}

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    /// Maximum evaluation calls in flight.
    pub concurrency: usize,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            temperature: 0.2,
            max_tokens: 2048,
        }
    }
}

/// The judge's verdict on one candidate. Failed evaluations keep their error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateEvaluation {
    pub candidate_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scores: Option<DimensionScores>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
}

impl CandidateEvaluation {
    fn failed(candidate_id: Uuid, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            candidate_id,
            composite: None,
            scores: None,
            reasoning: String::new(),
            confidence: None,
            error: Some(error.into()),
            attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionResult {
    pub candidate_id: Uuid,
    pub reasoning: String,
    /// In [0, 1].
    pub confidence: f64,
    /// One entry per candidate, in input order.
    pub scores: Vec<CandidateEvaluation>,
    pub judge_backend: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    /// Top of the heuristic ranking.
    Heuristic,
    Judge,
    /// Replaced by the optimisation pass.
    Optimized,
}

/// The effective selection after an optional judge pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selection {
    pub candidate_id: Option<Uuid>,
    pub source: SelectionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge: Option<SelectionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_error_kind: Option<FailureKind>,
}

impl Selection {
    /// The ranking's top pick, with no judge involved.
    pub fn heuristic(ranked: &[RankingResult]) -> Self {
        Self {
            candidate_id: ranked.first().map(|r| r.candidate_id),
            source: SelectionSource::Heuristic,
            judge: None,
            judge_error: None,
            judge_error_kind: None,
        }
    }
}

// =============================================================================
// Prompt
// =============================================================================

const JUDGE_SYSTEM: &str = "You are an impartial expert evaluator of generated text. \
Score the candidate against the criteria below on a 0-10 scale for each dimension: \
relevance, clarity, completeness, conciseness, and toxicity (0 = none, 10 = severe). \
Respond with ONLY a JSON object of the form \
{\"relevance\": n, \"clarity\": n, \"completeness\": n, \"conciseness\": n, \"toxicity\": n, \
\"reasoning\": \"...\", \"confidence\": 0.0-1.0}.";

/// The evaluation request for one candidate.
pub fn build_evaluation_request(
    criteria: &SelectionCriteria,
    candidate: &Candidate,
    config: &JudgeConfig,
) -> GenerateRequest {
    let system = format!("{JUDGE_SYSTEM}\n\n{}", criteria.render());
    let mut prompt = String::from("Please evaluate the following candidate:\n\n");
    prompt.push_str(&format!("---\nCandidate ID: {}\n{}\n---\n", candidate.id, candidate.text));
    if let Some(max) = criteria.max_length {
        let len = candidate.text.chars().count();
        if len > max {
            prompt.push_str(&format!(
                "\nNote: this candidate is {len} characters, over the {max} character limit.\n"
            ));
        }
    }

    GenerateRequest::new(
        prompt,
        Attribution::new("judge::evaluate")
            .with_correlation(candidate.correlation_id)
            .with_stage(candidate.stage.as_str()),
    )
    .system(system)
    .temperature(config.temperature)
    .max_tokens(config.max_tokens)
}

// =============================================================================
// Selector
// =============================================================================

#[derive(Debug, Clone)]
pub struct JudgeSelector {
    registry: Arc<BackendRegistry>,
    invoker: Invoker,
    config: JudgeConfig,
}

impl JudgeSelector {
    pub fn new(registry: Arc<BackendRegistry>, invoker: Invoker) -> Self {
        Self {
            registry,
            invoker,
            config: JudgeConfig::default(),
        }
    }

    pub fn with_config(mut self, config: JudgeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &JudgeConfig {
        &self.config
    }

    /// Evaluate every candidate and pick the highest judge composite.
    pub async fn select(
        &self,
        candidates: &[Candidate],
        criteria: &SelectionCriteria,
        cancel: &CancellationToken,
    ) -> Result<SelectionResult, JudgeError> {
        criteria.validate()?;
        if candidates.is_empty() {
            return Err(JudgeError::NoCandidates);
        }
        let started = Instant::now();
        let name = criteria.judge_backend.as_str();
        let backend = self.registry.get(name)?;

        debug!(
            judge = name,
            candidates = candidates.len(),
            concurrency = self.config.concurrency,
            "judging candidates"
        );

        let width = self.config.concurrency.max(1);
        let mut evaluations: Vec<(usize, CandidateEvaluation)> = stream::iter(
            candidates.iter().enumerate().map(|(i, c)| {
                let backend = backend.as_ref();
                async move { (i, self.evaluate(name, backend, c, criteria, cancel).await) }
            }),
        )
        .buffer_unordered(width)
        .collect()
        .await;
        evaluations.sort_by_key(|(i, _)| *i);
        let scores: Vec<CandidateEvaluation> = evaluations.into_iter().map(|(_, e)| e).collect();

        if cancel.is_cancelled() {
            return Err(JudgeError::Cancelled);
        }

        let mut best: Option<(usize, f64)> = None;
        let mut runner_up: Option<f64> = None;
        for (i, e) in scores.iter().enumerate() {
            let Some(score) = e.composite else { continue };
            match best {
                Some((_, b)) if score <= b => {
                    runner_up = Some(runner_up.map_or(score, |r| r.max(score)));
                }
                _ => {
                    if let Some((_, b)) = best {
                        runner_up = Some(runner_up.map_or(b, |r| r.max(b)));
                    }
                    best = Some((i, score));
                }
            }
        }

        let Some((winner_idx, winner_score)) = best else {
            let first = scores
                .iter()
                .find_map(|e| e.error.clone())
                .unwrap_or_else(|| "no evaluation produced a score".to_string());
            warn!(judge = name, count = scores.len(), "every judge evaluation failed");
            return Err(JudgeError::AllEvaluationsFailed {
                count: scores.len(),
                first,
            });
        };

        let winner = &scores[winner_idx];
        let confidence = winner
            .confidence
            .unwrap_or_else(|| 0.5 + runner_up.map_or(0.0, |r| winner_score - r))
            .clamp(0.0, 1.0);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            judge = name,
            selected = %winner.candidate_id,
            composite = winner_score,
            confidence,
            elapsed_ms,
            "judge selected candidate"
        );

        Ok(SelectionResult {
            candidate_id: winner.candidate_id,
            reasoning: winner.reasoning.clone(),
            confidence,
            scores,
            judge_backend: name.to_string(),
            elapsed_ms,
        })
    }

    /// Run the judge, falling back to the ranking's top pick on any failure.
    pub async fn select_or_fallback(
        &self,
        candidates: &[Candidate],
        ranked: &[RankingResult],
        criteria: &SelectionCriteria,
        cancel: &CancellationToken,
    ) -> Selection {
        match self.select(candidates, criteria, cancel).await {
            Ok(result) => Selection {
                candidate_id: Some(result.candidate_id),
                source: SelectionSource::Judge,
                judge: Some(result),
                judge_error: None,
                judge_error_kind: None,
            },
            Err(err) => {
                warn!(error = %err, "judge failed; keeping heuristic selection");
                Selection {
                    judge_error: Some(err.to_string()),
                    judge_error_kind: Some(err.kind()),
                    ..Selection::heuristic(ranked)
                }
            }
        }
    }

    /// Evaluate a single candidate. Failures are captured, never raised.
    pub async fn evaluate(
        &self,
        name: &str,
        backend: &dyn Backend,
        candidate: &Candidate,
        criteria: &SelectionCriteria,
        cancel: &CancellationToken,
    ) -> CandidateEvaluation {
        let req = build_evaluation_request(criteria, candidate, &self.config);
        let invoked = match self.invoker.generate(cancel, name, backend, &req).await {
            Ok(invoked) => invoked,
            Err(err) => {
                debug!(candidate = %candidate.id, error = %err, "judge call failed");
                return CandidateEvaluation::failed(candidate.id, err.to_string(), err.attempts());
            }
        };

        match parse_evaluation(&invoked.value.text) {
            Ok(parsed) => CandidateEvaluation {
                candidate_id: candidate.id,
                composite: Some(parsed.scores.composite(&criteria.weights)),
                scores: Some(parsed.scores),
                reasoning: parsed.reasoning,
                confidence: parsed.confidence,
                error: None,
                attempts: invoked.attempts,
            },
            Err(err) => {
                debug!(candidate = %candidate.id, error = %err, "unparseable judge response");
                CandidateEvaluation::failed(candidate.id, err.to_string(), invoked.attempts)
            }
        }
    }

    /// Copy judge reasoning onto the candidates it describes.
    pub fn annotate(candidates: &mut [Candidate], result: &SelectionResult) {
        for c in candidates.iter_mut() {
            if let Some(e) = result
                .scores
                .iter()
                .find(|e| e.candidate_id == c.id && e.error.is_none())
            {
                c.judge_reasoning = Some(e.reasoning.clone());
            }
        }
    }
}
