//! Multi-factor ranking of candidates.
//!
//! Pure and deterministic: the same candidates and context produce the same
//! order regardless of input order. No I/O; embeddings and history are
//! gathered by the caller and passed in through [`RankingContext`].

pub mod axes;
pub mod weights;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::candidate::Candidate;
use crate::stages::{Stage, StageProfile};

pub use weights::{AxisWeights, WeightPresets, WeightsError};

/// Axis names in canonical order.
pub const AXIS_NAMES: [&str; 7] = [
    "temperature_fit",
    "token_fit",
    "historical_fit",
    "context_fit",
    "embedding_distance",
    "length_fit",
    "semantic_fit",
];

/// Seven independent axis scores, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisScores {
    pub temperature_fit: f64,
    pub token_fit: f64,
    pub historical_fit: f64,
    pub context_fit: f64,
    pub embedding_distance: f64,
    pub length_fit: f64,
    pub semantic_fit: f64,
}

impl AxisScores {
    pub fn as_array(&self) -> [f64; 7] {
        [
            self.temperature_fit,
            self.token_fit,
            self.historical_fit,
            self.context_fit,
            self.embedding_distance,
            self.length_fit,
            self.semantic_fit,
        ]
    }
}

/// Batch-level inputs shared by every candidate being ranked.
#[derive(Debug, Clone, Copy, Default)]
pub struct RankingContext<'a> {
    pub input: &'a str,
    pub input_embedding: Option<&'a [f32]>,
    pub context: &'a [String],
    /// Previously accepted texts for the same input.
    pub history: &'a [String],
    /// Scale applied to historical-fit, in [0, 1].
    pub historical_weight: f64,
}

impl<'a> RankingContext<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input,
            historical_weight: 1.0,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingResult {
    pub candidate_id: Uuid,
    /// 1-based position after sorting.
    pub rank: usize,
    pub stage: Stage,
    pub axes: AxisScores,
    pub composite: f64,
}

/// Deterministic scorer over a fixed, normalised weight vector.
#[derive(Debug, Clone)]
pub struct RankingEngine {
    weights: AxisWeights,
    profiles: HashMap<String, StageProfile>,
}

impl Default for RankingEngine {
    fn default() -> Self {
        Self {
            weights: AxisWeights::from_array([1.0 / 7.0; 7]),
            profiles: HashMap::new(),
        }
    }
}

impl RankingEngine {
    pub fn new(weights: AxisWeights) -> Result<Self, WeightsError> {
        Ok(Self {
            weights: weights.normalized()?,
            profiles: HashMap::new(),
        })
    }

    /// Override the scoring profile for one stage name.
    pub fn with_profile(mut self, stage: impl Into<String>, profile: StageProfile) -> Self {
        self.profiles.insert(stage.into(), profile);
        self
    }

    pub fn with_profiles(mut self, profiles: HashMap<String, StageProfile>) -> Self {
        self.profiles.extend(profiles);
        self
    }

    /// Same profiles, different weights.
    pub fn reweighted(&self, weights: AxisWeights) -> Result<Self, WeightsError> {
        Ok(Self {
            weights: weights.normalized()?,
            profiles: self.profiles.clone(),
        })
    }

    /// The normalised weights in use.
    pub fn weights(&self) -> &AxisWeights {
        &self.weights
    }

    pub fn profile_for(&self, stage: &Stage) -> StageProfile {
        self.profiles
            .get(stage.as_str())
            .copied()
            .unwrap_or_else(|| StageProfile::for_stage(stage))
    }

    pub fn score(&self, candidate: &Candidate, ctx: &RankingContext<'_>) -> AxisScores {
        let profile = self.profile_for(&candidate.stage);
        AxisScores {
            temperature_fit: axes::temperature_fit(candidate.temperature, &profile),
            token_fit: axes::token_fit(candidate.actual_tokens, candidate.max_tokens, &profile),
            historical_fit: axes::historical_fit(
                &candidate.text,
                ctx.history,
                ctx.historical_weight,
            ),
            context_fit: axes::context_fit(&candidate.text, ctx.context),
            embedding_distance: axes::embedding_distance(
                candidate.embedding.as_deref(),
                ctx.input_embedding,
            ),
            length_fit: axes::length_fit(candidate.text.chars().count(), &profile),
            semantic_fit: axes::semantic_fit(&candidate.text, ctx.input),
        }
    }

    /// Weighted sum of the axis scores.
    pub fn composite(&self, scores: &AxisScores) -> f64 {
        self.weights
            .as_array()
            .iter()
            .zip(scores.as_array())
            .map(|(w, s)| w * s)
            .sum()
    }

    /// Score and order a batch: composite descending, then earliest creation,
    /// then stage order, then candidate id.
    pub fn rank(&self, candidates: &[Candidate], ctx: &RankingContext<'_>) -> Vec<RankingResult> {
        let mut scored: Vec<(&Candidate, AxisScores, f64)> = candidates
            .iter()
            .map(|c| {
                let axes = self.score(c, ctx);
                let composite = self.composite(&axes);
                (c, axes, composite)
            })
            .collect();

        scored.sort_by(|(a, _, sa), (b, _, sb)| {
            sb.total_cmp(sa)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.stage_index.cmp(&b.stage_index))
                .then_with(|| a.id.cmp(&b.id))
        });

        scored
            .into_iter()
            .enumerate()
            .map(|(i, (c, axes, composite))| RankingResult {
                candidate_id: c.id,
                rank: i + 1,
                stage: c.stage.clone(),
                axes,
                composite,
            })
            .collect()
    }

    /// Write scores back onto the candidates they belong to.
    pub fn annotate(candidates: &mut [Candidate], results: &[RankingResult]) {
        let by_id: HashMap<Uuid, &RankingResult> =
            results.iter().map(|r| (r.candidate_id, r)).collect();
        for c in candidates.iter_mut() {
            if let Some(r) = by_id.get(&c.id) {
                c.composite_score = Some(r.composite);
                c.axis_scores = Some(r.axes);
            }
        }
    }
}
