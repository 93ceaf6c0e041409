//! Judge response parsing.
//!
//! The judge is asked for a single JSON object with five 0–10 dimension
//! scores, free-text reasoning and an optional 0–1 confidence.

use serde::{Deserialize, Serialize};

use super::criteria::EvaluationWeights;
use super::JudgeError;

/// Upper bound of the judge's scoring scale.
pub const SCALE_MAX: f64 = 10.0;

#[derive(Debug, Deserialize)]
struct EvaluationJson {
    relevance: Option<f64>,
    clarity: Option<f64>,
    completeness: Option<f64>,
    conciseness: Option<f64>,
    toxicity: Option<f64>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Dimension scores normalised to [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionScores {
    pub relevance: f64,
    pub clarity: f64,
    pub completeness: f64,
    pub conciseness: f64,
    pub toxicity: f64,
}

impl DimensionScores {
    /// Weighted positives minus the weighted toxicity penalty.
    pub fn composite(&self, w: &EvaluationWeights) -> f64 {
        w.relevance * self.relevance
            + w.clarity * self.clarity
            + w.completeness * self.completeness
            + w.conciseness * self.conciseness
            - w.toxicity * self.toxicity
    }
}

/// One parsed judge verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEvaluation {
    pub scores: DimensionScores,
    pub reasoning: String,
    pub confidence: Option<f64>,
}

pub fn parse_evaluation(raw: &str) -> Result<ParsedEvaluation, JudgeError> {
    let json_str = extract_json(raw);
    let parsed: EvaluationJson =
        serde_json::from_str(json_str).map_err(|e| JudgeError::Malformed(e.to_string()))?;

    let dim = |name: &str, value: Option<f64>| -> Result<f64, JudgeError> {
        let v = value.ok_or_else(|| JudgeError::Malformed(format!("missing '{name}'")))?;
        if !(0.0..=SCALE_MAX).contains(&v) {
            return Err(JudgeError::Malformed(format!(
                "{name} out of allowed range [0,{SCALE_MAX}]: {v}"
            )));
        }
        Ok(v / SCALE_MAX)
    };

    let scores = DimensionScores {
        relevance: dim("relevance", parsed.relevance)?,
        clarity: dim("clarity", parsed.clarity)?,
        completeness: dim("completeness", parsed.completeness)?,
        conciseness: dim("conciseness", parsed.conciseness)?,
        toxicity: dim("toxicity", parsed.toxicity)?,
    };

    Ok(ParsedEvaluation {
        scores,
        reasoning: parsed.reasoning.unwrap_or_default().trim().to_string(),
        confidence: parsed
            .confidence
            .filter(|c| c.is_finite())
            .map(|c| c.clamp(0.0, 1.0)),
    })
}

/// Extract the first balanced JSON object from a response that may carry
/// surrounding prose or code fences. Braces inside string literals are ignored.
pub fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(start) = trimmed.find('{') else {
        return trimmed;
    };
    let remainder = &trimmed[start..];

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in remainder.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return &remainder[..=i];
                }
            }
            _ => {}
        }
    }

    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_object() {
        let raw = r#"{"relevance": 8, "clarity": 7, "completeness": 9, "conciseness": 6, "toxicity": 0, "reasoning": "solid", "confidence": 0.8}"#;
        let e = parse_evaluation(raw).unwrap();
        assert!((e.scores.relevance - 0.8).abs() < 1e-12);
        assert_eq!(e.scores.toxicity, 0.0);
        assert_eq!(e.reasoning, "solid");
        assert_eq!(e.confidence, Some(0.8));
    }

    #[test]
    fn parses_with_surrounding_text_and_braces_in_strings() {
        let raw = "Here is my verdict:\n```json\n{\"relevance\": 10, \"clarity\": 10, \"completeness\": 10, \"conciseness\": 10, \"toxicity\": 1, \"reasoning\": \"uses fn f() { }\"}\n```";
        let e = parse_evaluation(raw).unwrap();
        assert_eq!(e.reasoning, "uses fn f() { }");
        assert_eq!(e.confidence, None);
    }

    #[test]
    fn rejects_missing_or_out_of_range() {
        assert!(matches!(
            parse_evaluation(r#"{"relevance": 5}"#),
            Err(JudgeError::Malformed(_))
        ));
        let raw = r#"{"relevance": 11, "clarity": 1, "completeness": 1, "conciseness": 1, "toxicity": 0}"#;
        assert!(parse_evaluation(raw).is_err());
        assert!(parse_evaluation("I cannot evaluate this.").is_err());
    }

    #[test]
    fn toxicity_is_a_penalty() {
        let w = EvaluationWeights::default();
        let clean = DimensionScores {
            relevance: 1.0,
            clarity: 1.0,
            completeness: 1.0,
            conciseness: 1.0,
            toxicity: 0.0,
        };
        let toxic = DimensionScores { toxicity: 1.0, ..clean };
        assert!((clean.composite(&w) - 0.9).abs() < 1e-12);
        assert!((toxic.composite(&w) - 0.8).abs() < 1e-12);
    }
}
