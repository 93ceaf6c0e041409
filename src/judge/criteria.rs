//! Selection criteria and judge weight presets.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::JudgeError;

/// Dimension names in canonical order.
pub const DIMENSIONS: [&str; 5] = ["relevance", "clarity", "completeness", "conciseness", "toxicity"];

/// Importance of each judged dimension. `toxicity` is a penalty weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationWeights {
    pub relevance: f64,
    pub clarity: f64,
    pub completeness: f64,
    pub conciseness: f64,
    pub toxicity: f64,
}

impl Default for EvaluationWeights {
    fn default() -> Self {
        Self::new(0.3, 0.3, 0.2, 0.1, 0.1)
    }
}

impl EvaluationWeights {
    pub fn new(relevance: f64, clarity: f64, completeness: f64, conciseness: f64, toxicity: f64) -> Self {
        Self {
            relevance,
            clarity,
            completeness,
            conciseness,
            toxicity,
        }
    }

    pub fn as_array(&self) -> [f64; 5] {
        [
            self.relevance,
            self.clarity,
            self.completeness,
            self.conciseness,
            self.toxicity,
        ]
    }

    pub fn validate(&self) -> Result<(), JudgeError> {
        for (name, value) in DIMENSIONS.iter().copied().zip(self.as_array()) {
            if !value.is_finite() || value < 0.0 {
                return Err(JudgeError::InvalidCriteria(format!(
                    "weight {name} must be finite and non-negative (got {value})"
                )));
            }
        }
        if self.relevance + self.clarity + self.completeness + self.conciseness <= 0.0 {
            return Err(JudgeError::InvalidCriteria(
                "at least one positive dimension must carry weight".into(),
            ));
        }
        Ok(())
    }
}

/// Name-keyed judge weight presets.
#[derive(Debug, Clone)]
pub struct JudgeWeightPresets {
    presets: HashMap<String, EvaluationWeights>,
}

impl Default for JudgeWeightPresets {
    fn default() -> Self {
        let mut presets = HashMap::new();
        presets.insert("default".to_string(), EvaluationWeights::default());
        presets.insert("code".to_string(), EvaluationWeights::new(0.4, 0.2, 0.2, 0.1, 0.1));
        presets.insert("writing".to_string(), EvaluationWeights::new(0.3, 0.4, 0.1, 0.1, 0.1));
        Self { presets }
    }
}

impl JudgeWeightPresets {
    pub fn list(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.presets.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn get(&self, name: &str) -> Result<EvaluationWeights, JudgeError> {
        self.presets
            .get(name)
            .copied()
            .ok_or_else(|| JudgeError::InvalidCriteria(format!("unknown judge preset {name:?}")))
    }

    pub fn insert(&mut self, name: impl Into<String>, weights: EvaluationWeights) -> Result<(), JudgeError> {
        weights.validate()?;
        self.presets.insert(name.into(), weights);
        Ok(())
    }
}

/// What the judge should look for, and which backend judges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionCriteria {
    pub task_description: String,
    pub target_audience: Option<String>,
    pub desired_tone: Option<String>,
    /// Preferred maximum length in characters.
    pub max_length: Option<usize>,
    pub requirements: Vec<String>,
    pub persona: Option<String>,
    pub weights: EvaluationWeights,
    /// Registered name of the judge backend.
    pub judge_backend: String,
}

impl SelectionCriteria {
    pub fn new(task_description: impl Into<String>, judge_backend: impl Into<String>) -> Self {
        Self {
            task_description: task_description.into(),
            judge_backend: judge_backend.into(),
            ..Default::default()
        }
    }

    pub fn with_weights(mut self, weights: EvaluationWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_requirements(mut self, requirements: Vec<String>) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn validate(&self) -> Result<(), JudgeError> {
        if self.judge_backend.trim().is_empty() {
            return Err(JudgeError::InvalidCriteria("judge backend must be named".into()));
        }
        self.weights.validate()
    }

    /// Render the criteria block of the judge's system prompt.
    pub fn render(&self) -> String {
        let mut out = String::from("Evaluation criteria:\n");
        if !self.task_description.trim().is_empty() {
            out.push_str(&format!("- Task: {}\n", self.task_description.trim()));
        }
        if let Some(audience) = &self.target_audience {
            out.push_str(&format!("- Target audience: {audience}\n"));
        }
        if let Some(tone) = &self.desired_tone {
            out.push_str(&format!("- Desired tone: {tone}\n"));
        }
        if let Some(max) = self.max_length {
            out.push_str(&format!("- Maximum length: {max} characters\n"));
        }
        if let Some(persona) = &self.persona {
            out.push_str(&format!("- Intended persona: {persona}\n"));
        }
        if !self.requirements.is_empty() {
            out.push_str("- Requirements:\n");
            for r in &self.requirements {
                out.push_str(&format!("  - {r}\n"));
            }
        }
        let w = &self.weights;
        out.push_str(&format!(
            "\nDimension weights: relevance {:.2}, clarity {:.2}, completeness {:.2}, conciseness {:.2}, toxicity penalty {:.2}\n",
            w.relevance, w.clarity, w.completeness, w.conciseness, w.toxicity
        ));
        out
    }
}
