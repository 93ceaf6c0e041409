//! Iterative refinement of the selected candidate.
//!
//! Each iteration asks the candidate's own backend for an improved version,
//! scores it, and keeps it only if it beats the best so far. Failures stop
//! the loop but never fail the request.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::candidate::Candidate;
use crate::gateway::{Attribution, BackendRegistry, EmbeddingResolver, GenerateRequest, Invoker};
use crate::judge::{JudgeSelector, SelectionCriteria};
use crate::ranking::{RankingContext, RankingEngine};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizeConfig {
    pub max_iterations: usize,
    /// Stop early once a score reaches this value.
    pub target_score: Option<f64>,
    pub temperature: f32,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            target_score: None,
            temperature: 0.4,
        }
    }
}

/// How improvements are scored.
pub enum Scorer<'a> {
    /// Ranking composite, fully offline.
    Ranking {
        engine: &'a RankingEngine,
        ctx: RankingContext<'a>,
    },
    /// Judge composite; one judge call per attempt.
    Judge {
        selector: &'a JudgeSelector,
        criteria: &'a SelectionCriteria,
    },
}

impl Scorer<'_> {
    async fn score(
        &self,
        registry: &BackendRegistry,
        candidate: &Candidate,
        cancel: &CancellationToken,
    ) -> Result<f64, String> {
        match self {
            Scorer::Ranking { engine, ctx } => Ok(engine.composite(&engine.score(candidate, ctx))),
            Scorer::Judge { selector, criteria } => {
                let name = criteria.judge_backend.as_str();
                let backend = registry.get(name).map_err(|e| e.to_string())?;
                let eval = selector
                    .evaluate(name, backend.as_ref(), candidate, criteria, cancel)
                    .await;
                match (eval.composite, eval.error) {
                    (Some(score), _) => Ok(score),
                    (None, Some(err)) => Err(err),
                    (None, None) => Err("judge produced no score".into()),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeStep {
    pub iteration: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeOutcome {
    pub original_id: Uuid,
    pub original_score: f64,
    pub best_score: f64,
    /// The improved candidate, if any iteration beat the original.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub improved: Option<Candidate>,
    pub steps: Vec<OptimizeStep>,
    pub elapsed_ms: u64,
}

const OPTIMIZE_SYSTEM: &str = "You are an expert editor. Improve the text you are given so that it \
better serves the original request. Keep its core intent, make only the changes that help, and \
favour clarity and specificity.";

pub fn build_improve_request(
    original_input: &str,
    current: &Candidate,
    current_score: f64,
    config: &OptimizeConfig,
    iteration: usize,
) -> GenerateRequest {
    let prompt = format!(
        "Original request:\n\"\"\"\n{original_input}\n\"\"\"\n\n\
         Current text (score {current_score:.3}):\n\"\"\"\n{}\n\"\"\"\n\n\
         Provide an improved version.\n\n\
         FORMAT YOUR RESPONSE AS:\n\
         REASONING: [what you changed]\n\n\
         IMPROVED TEXT:\n[the improved text]",
        current.text
    );
    GenerateRequest::new(
        prompt,
        Attribution::new("optimize::improve")
            .with_correlation(current.correlation_id)
            .with_stage(format!("{}#opt{iteration}", current.stage)),
    )
    .system(OPTIMIZE_SYSTEM)
    .temperature(config.temperature)
    .max_tokens(current.max_tokens)
}

/// Split a response into (reasoning, improved text). Without the expected
/// markers the whole response is the improved text.
pub fn parse_improvement(response: &str) -> (String, String) {
    const REASONING: &str = "REASONING:";
    const IMPROVED: &str = "IMPROVED TEXT:";
    match (response.find(REASONING), response.find(IMPROVED)) {
        (Some(r), Some(p)) if r < p => (
            response[r + REASONING.len()..p].trim().to_string(),
            response[p + IMPROVED.len()..].trim().to_string(),
        ),
        (_, Some(p)) => (String::new(), response[p + IMPROVED.len()..].trim().to_string()),
        _ => (String::new(), response.trim().to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct Optimizer {
    registry: Arc<BackendRegistry>,
    invoker: Invoker,
    config: OptimizeConfig,
    embedder: Option<String>,
}

impl Optimizer {
    pub fn new(registry: Arc<BackendRegistry>, invoker: Invoker, config: OptimizeConfig) -> Self {
        Self {
            registry,
            invoker,
            config,
            embedder: None,
        }
    }

    /// Embed each improvement with `name` before scoring it, so it carries a
    /// vector from the same model as the candidate it replaces.
    pub fn with_embedder(mut self, name: Option<String>) -> Self {
        self.embedder = name;
        self
    }

    pub fn config(&self) -> &OptimizeConfig {
        &self.config
    }

    pub async fn optimize(
        &self,
        original_input: &str,
        selected: &Candidate,
        baseline: f64,
        scorer: &Scorer<'_>,
        cancel: &CancellationToken,
    ) -> OptimizeOutcome {
        let started = Instant::now();
        let mut steps = Vec::new();
        let mut best_score = baseline;
        let mut best: Option<Candidate> = None;
        let mut current = selected.clone();
        let mut current_score = baseline;

        let backend = match self.registry.get(&selected.backend) {
            Ok(b) => Some(b),
            Err(e) => {
                warn!(backend = %selected.backend, error = %e, "optimisation skipped");
                steps.push(OptimizeStep {
                    iteration: 1,
                    candidate_id: None,
                    score: None,
                    accepted: false,
                    reasoning: String::new(),
                    error: Some(e.to_string()),
                });
                None
            }
        };

        if let Some(backend) = backend {
            for iteration in 1..=self.config.max_iterations {
                if cancel.is_cancelled() {
                    break;
                }
                let req = build_improve_request(original_input, &current, current_score, &self.config, iteration);
                let invoked = match self
                    .invoker
                    .generate(cancel, &selected.backend, backend.as_ref(), &req)
                    .await
                {
                    Ok(invoked) => invoked,
                    Err(e) => {
                        warn!(iteration, error = %e, "improvement call failed");
                        steps.push(OptimizeStep {
                            iteration,
                            candidate_id: None,
                            score: None,
                            accepted: false,
                            reasoning: String::new(),
                            error: Some(e.to_string()),
                        });
                        break;
                    }
                };

                let (reasoning, text) = parse_improvement(&invoked.value.text);
                if text.is_empty() {
                    steps.push(OptimizeStep {
                        iteration,
                        candidate_id: None,
                        score: None,
                        accepted: false,
                        reasoning,
                        error: Some("empty improvement".into()),
                    });
                    continue;
                }

                let mut child = current.child(text, &invoked.value.model, invoked.value.tokens_used);
                if let Some(name) = self.embedder.as_deref().filter(|_| selected.embedding.is_some()) {
                    match EmbeddingResolver::embed_with(&self.registry, &self.invoker, cancel, name, &child.text).await {
                        Ok(v) => child.embedding = Some(v),
                        Err(e) => {
                            warn!(iteration, error = %e, "embedding improvement failed");
                            steps.push(OptimizeStep {
                                iteration,
                                candidate_id: Some(child.id),
                                score: None,
                                accepted: false,
                                reasoning,
                                error: Some(e.to_string()),
                            });
                            break;
                        }
                    }
                }
                let score = match scorer.score(&self.registry, &child, cancel).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(iteration, error = %e, "scoring improvement failed");
                        steps.push(OptimizeStep {
                            iteration,
                            candidate_id: Some(child.id),
                            score: None,
                            accepted: false,
                            reasoning,
                            error: Some(e),
                        });
                        break;
                    }
                };

                let accepted = score > best_score;
                debug!(iteration, score, best_score, accepted, "optimisation step");
                steps.push(OptimizeStep {
                    iteration,
                    candidate_id: Some(child.id),
                    score: Some(score),
                    accepted,
                    reasoning,
                    error: None,
                });
                if accepted {
                    best_score = score;
                    best = Some(child.clone());
                }
                if self.config.target_score.is_some_and(|t| score >= t) {
                    break;
                }
                current = child;
                current_score = score;
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            original = %selected.id,
            original_score = baseline,
            best_score,
            improved = best.is_some(),
            elapsed_ms,
            "optimisation finished"
        );

        OptimizeOutcome {
            original_id: selected.id,
            original_score: baseline,
            best_score,
            improved: best,
            steps,
            elapsed_ms,
        }
    }
}
