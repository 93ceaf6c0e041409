//! Pure per-axis scoring functions. Every function returns a value in [0, 1].

use std::collections::HashSet;

use crate::stages::StageProfile;

/// Neutral score for an axis that has nothing to measure.
pub const NEUTRAL: f64 = 0.5;

/// `1 − min(1, |t − ideal| / spread)`.
pub fn temperature_fit(temperature: f32, profile: &StageProfile) -> f64 {
    let distance = (f64::from(temperature) - f64::from(profile.ideal_temperature)).abs();
    let spread = f64::from(profile.temperature_spread);
    if spread <= 0.0 {
        return if distance == 0.0 { 1.0 } else { 0.0 };
    }
    clamp01(1.0 - (distance / spread).min(1.0))
}

/// `1 − |actual / max − target|`, penalising both truncation risk and
/// suspiciously short output. Neutral when the ceiling is unknown.
pub fn token_fit(actual_tokens: u32, max_tokens: u32, profile: &StageProfile) -> f64 {
    if max_tokens == 0 {
        return NEUTRAL;
    }
    let utilization = f64::from(actual_tokens) / f64::from(max_tokens);
    clamp01(1.0 - (utilization - f64::from(profile.target_utilization)).abs())
}

/// Best lexical similarity to a previously accepted text, scaled by `weight`.
/// Zero with no history.
pub fn historical_fit(text: &str, history: &[String], weight: f64) -> f64 {
    if history.is_empty() {
        return 0.0;
    }
    let words = word_set(text);
    let best = history
        .iter()
        .map(|h| jaccard(&words, &word_set(h)))
        .fold(0.0, f64::max);
    clamp01(best * clamp01(weight))
}

/// Fraction of the context's content words that appear in `text`.
/// Neutral when no context was supplied.
pub fn context_fit(text: &str, context: &[String]) -> f64 {
    let mut wanted = HashSet::new();
    for c in context {
        wanted.extend(word_set(c));
    }
    if wanted.is_empty() {
        return NEUTRAL;
    }
    let words = word_set(text);
    let hits = wanted.iter().filter(|w| words.contains(*w)).count();
    clamp01(hits as f64 / wanted.len() as f64)
}

/// Cosine similarity mapped from [-1, 1] to [0, 1]. Neutral unless both
/// vectors are present and non-degenerate.
pub fn embedding_distance(candidate: Option<&[f32]>, input: Option<&[f32]>) -> f64 {
    match (candidate, input) {
        (Some(a), Some(b)) => match cosine_similarity(a, b) {
            Some(sim) => clamp01((sim + 1.0) / 2.0),
            None => NEUTRAL,
        },
        _ => NEUTRAL,
    }
}

/// 1 inside the stage's length band, decaying proportionally outside it.
pub fn length_fit(chars: usize, profile: &StageProfile) -> f64 {
    if chars == 0 {
        return 0.0;
    }
    let min = profile.min_chars.min(profile.max_chars);
    let max = profile.max_chars.max(profile.min_chars);
    if chars < min {
        clamp01(chars as f64 / min as f64)
    } else if max > 0 && chars > max {
        clamp01(max as f64 / chars as f64)
    } else {
        1.0
    }
}

/// Lexical overlap with the original input: the fraction of the input's
/// content words the candidate keeps. Independent of embeddings.
pub fn semantic_fit(text: &str, input: &str) -> f64 {
    let wanted = word_set(input);
    if wanted.is_empty() {
        return NEUTRAL;
    }
    let words = word_set(text);
    let hits = wanted.iter().filter(|w| words.contains(*w)).count();
    clamp01(hits as f64 / wanted.len() as f64)
}

/// `None` for empty or zero vectors, and for vectors of different width
/// (they come from different embedding models and are not comparable).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return None;
    }
    let sim = dot / (na.sqrt() * nb.sqrt());
    sim.is_finite().then_some(sim.clamp(-1.0, 1.0))
}

/// Lowercase alphanumeric words of three or more characters.
pub fn word_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    let union = a.union(b).count();
    inter as f64 / union as f64
}

fn clamp01(x: f64) -> f64 {
    if x.is_nan() {
        return 0.0;
    }
    x.clamp(0.0, 1.0)
}
