//! Axis weight vectors and the named preset registry.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum WeightsError {
    #[error("weight {axis} must be finite and non-negative (got {value})")]
    Invalid { axis: &'static str, value: f64 },
    #[error("weights must not all be zero")]
    AllZero,
    #[error("unknown weight preset {0:?}")]
    UnknownPreset(String),
}

/// Relative importance of each ranking axis.
///
/// Stored as given; `normalized()` rescales to sum to 1 before use.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisWeights {
    pub temperature_fit: f64,
    pub token_fit: f64,
    pub historical_fit: f64,
    pub context_fit: f64,
    pub embedding_distance: f64,
    pub length_fit: f64,
    pub semantic_fit: f64,
}

impl Default for AxisWeights {
    fn default() -> Self {
        Self::uniform()
    }
}

impl AxisWeights {
    pub fn uniform() -> Self {
        Self::from_array([1.0; 7])
    }

    pub fn from_array(w: [f64; 7]) -> Self {
        Self {
            temperature_fit: w[0],
            token_fit: w[1],
            historical_fit: w[2],
            context_fit: w[3],
            embedding_distance: w[4],
            length_fit: w[5],
            semantic_fit: w[6],
        }
    }

    /// Weights in canonical axis order.
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

    pub fn validate(&self) -> Result<(), WeightsError> {
        for (axis, value) in super::AXIS_NAMES.iter().copied().zip(self.as_array()) {
            if !value.is_finite() || value < 0.0 {
                return Err(WeightsError::Invalid { axis, value });
            }
        }
        if self.as_array().iter().sum::<f64>() <= 0.0 {
            return Err(WeightsError::AllZero);
        }
        Ok(())
    }

    /// Rescale so the weights sum to 1.
    pub fn normalized(&self) -> Result<Self, WeightsError> {
        self.validate()?;
        let sum: f64 = self.as_array().iter().sum();
        Ok(Self::from_array(self.as_array().map(|w| w / sum)))
    }
}

/// Name-keyed ranking weight presets.
#[derive(Debug, Clone)]
pub struct WeightPresets {
    presets: HashMap<String, AxisWeights>,
}

impl Default for WeightPresets {
    fn default() -> Self {
        let mut presets = HashMap::new();
        presets.insert("balanced".to_string(), AxisWeights::uniform());
        presets.insert(
            "clarity-focused".to_string(),
            //                     temp tok  hist ctx  emb  len  sem
            AxisWeights::from_array([0.5, 1.5, 0.5, 0.5, 1.0, 2.0, 1.5]),
        );
        presets.insert(
            "comprehensive".to_string(),
            AxisWeights::from_array([0.5, 0.5, 1.5, 2.0, 1.5, 0.5, 1.5]),
        );
        presets.insert(
            "precise".to_string(),
            AxisWeights::from_array([2.0, 1.5, 0.5, 0.5, 1.0, 1.0, 1.5]),
        );
        Self { presets }
    }
}

impl WeightPresets {
    pub fn list(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.presets.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn get(&self, name: &str) -> Result<AxisWeights, WeightsError> {
        self.presets
            .get(name)
            .copied()
            .ok_or_else(|| WeightsError::UnknownPreset(name.to_string()))
    }

    pub fn insert(&mut self, name: impl Into<String>, weights: AxisWeights) -> Result<(), WeightsError> {
        weights.validate()?;
        self.presets.insert(name.into(), weights);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_weights_sum_to_one() {
        let w = AxisWeights::from_array([2.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0])
            .normalized()
            .unwrap();
        let sum: f64 = w.as_array().iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!((w.temperature_fit - 0.5).abs() < 1e-12);
    }

    #[test]
    fn rejects_negative_and_zero_vectors() {
        let mut w = AxisWeights::uniform();
        w.context_fit = -1.0;
        assert!(matches!(w.validate(), Err(WeightsError::Invalid { axis: "context_fit", .. })));
        assert_eq!(
            AxisWeights::from_array([0.0; 7]).normalized(),
            Err(WeightsError::AllZero)
        );
    }

    #[test]
    fn builtin_presets_are_valid() {
        let presets = WeightPresets::default();
        assert_eq!(
            presets.list(),
            vec!["balanced", "clarity-focused", "comprehensive", "precise"]
        );
        for name in presets.list() {
            presets.get(&name).unwrap().validate().unwrap();
        }
        assert!(presets.get("nope").is_err());
    }
}
