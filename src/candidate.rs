//! Generated candidates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stages::Stage;

/// Identifier grouping every candidate from one end-to-end request.
pub type CorrelationId = Uuid;

/// One generated text output tied to a stage and a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: Uuid,
    pub correlation_id: CorrelationId,
    pub text: String,
    pub stage: Stage,
    /// Position of `stage` in the request's stage list.
    pub stage_index: usize,
    /// Variant number within the stage (0-based).
    pub variant: usize,
    /// Registered name of the backend that produced it.
    pub backend: String,
    pub model: String,
    pub temperature: f32,
    /// Requested ceiling passed to the backend.
    pub max_tokens: u32,
    pub actual_tokens: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axis_scores: Option<crate::ranking::AxisScores>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_reasoning: Option<String>,
    /// Set on candidates produced by the optimisation pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
}

impl Candidate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        correlation_id: CorrelationId,
        text: impl Into<String>,
        stage: Stage,
        stage_index: usize,
        variant: usize,
        backend: impl Into<String>,
        model: impl Into<String>,
        temperature: f32,
        max_tokens: u32,
        actual_tokens: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id,
            text: text.into(),
            stage,
            stage_index,
            variant,
            backend: backend.into(),
            model: model.into(),
            temperature,
            max_tokens,
            actual_tokens,
            created_at: Utc::now(),
            tags: Vec::new(),
            embedding: None,
            composite_score: None,
            axis_scores: None,
            judge_reasoning: None,
            parent_id: None,
        }
    }

    pub fn with_tags(mut self, tags: &[String]) -> Self {
        self.tags = tags.to_vec();
        self
    }

    /// A refined copy of this candidate with new text, linked by `parent_id`.
    pub fn child(&self, text: impl Into<String>, model: impl Into<String>, actual_tokens: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            model: model.into(),
            actual_tokens,
            created_at: Utc::now(),
            embedding: None,
            composite_score: None,
            axis_scores: None,
            judge_reasoning: None,
            parent_id: Some(self.id),
            ..self.clone()
        }
    }
}
