use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

use alembic::candidate::Candidate;
use alembic::ranking::{AxisWeights, RankingContext, RankingEngine, WeightPresets, WeightsError};
use alembic::stages::{Stage, StageProfile};

const INPUT: &str = "Write a function that reverses a string";

fn batch() -> Vec<Candidate> {
    let correlation = Uuid::new_v4();
    let base = Utc::now();
    let specs = [
        (Stage::PrimaMateria, 0, "Write a Rust function that reverses a string, handling unicode graphemes and empty input. Return a new String and document the complexity.", 0.7, 180),
        (Stage::Solutio, 1, "Let's write a small function that takes a string and hands back the reversed version.", 0.9, 40),
        (Stage::Coagulatio, 2, "fn reverse(s: &str) -> String { s.chars().rev().collect() }", 0.4, 20),
        (Stage::Coagulatio, 2, "", 0.4, 0),
        (Stage::Custom("polish".into()), 3, "reverse string function", 2.0, 1000),
    ];
    specs
        .into_iter()
        .enumerate()
        .map(|(i, (stage, idx, text, temperature, tokens))| {
            let mut c = Candidate::new(correlation, text, stage, idx, i, "gen", "m", temperature, 400, tokens);
            c.created_at = base + ChronoDuration::milliseconds(i as i64);
            c
        })
        .collect()
}

fn ids(results: &[alembic::ranking::RankingResult]) -> Vec<Uuid> {
    results.iter().map(|r| r.candidate_id).collect()
}

#[test]
fn ranking_ignores_input_order() {
    let engine = RankingEngine::default();
    let history = vec!["fn reverse(s: &str) -> String { s.chars().rev().collect() }".to_string()];
    let context = vec!["Target language: Rust".to_string()];
    let ctx = RankingContext {
        context: &context,
        history: &history,
        ..RankingContext::new(INPUT)
    };

    let candidates = batch();
    let expected = ids(&engine.rank(&candidates, &ctx));

    let mut reversed = candidates.clone();
    reversed.reverse();
    assert_eq!(ids(&engine.rank(&reversed, &ctx)), expected);

    let mut rotated = candidates.clone();
    rotated.rotate_left(2);
    assert_eq!(ids(&engine.rank(&rotated, &ctx)), expected);
}

#[test]
fn axes_stay_in_unit_interval_and_composite_is_weighted_sum() {
    let weights = AxisWeights::from_array([3.0, 1.0, 0.5, 2.0, 1.0, 0.0, 4.0]);
    let engine = RankingEngine::new(weights).unwrap();
    let normalized = weights.normalized().unwrap();

    let mut candidates = batch();
    candidates[0].embedding = Some(vec![1.0, 0.0, 0.0]);
    candidates[1].embedding = Some(vec![-1.0, 0.0, 0.0]);
    candidates[2].embedding = Some(vec![0.0, 0.0]);
    let input_embedding = vec![1.0, 0.0, 0.0];
    let history = vec!["reverse a string".to_string()];
    let ctx = RankingContext {
        input_embedding: Some(input_embedding.as_slice()),
        history: &history,
        historical_weight: 0.5,
        ..RankingContext::new(INPUT)
    };

    let results = engine.rank(&candidates, &ctx);
    assert_eq!(results.len(), candidates.len());

    for r in &results {
        for axis in r.axes.as_array() {
            assert!((0.0..=1.0).contains(&axis), "axis out of range: {axis}");
        }
        let expected: f64 = normalized
            .as_array()
            .iter()
            .zip(r.axes.as_array())
            .map(|(w, a)| w * a)
            .sum();
        assert!((r.composite - expected).abs() < 1e-9);
    }

    for pair in results.windows(2) {
        assert!(pair[0].composite >= pair[1].composite);
    }
    let ranks: Vec<usize> = results.iter().map(|r| r.rank).collect();
    assert_eq!(ranks, vec![1, 2, 3, 4, 5]);

    let aligned = results.iter().find(|r| r.candidate_id == candidates[0].id).unwrap();
    let opposed = results.iter().find(|r| r.candidate_id == candidates[1].id).unwrap();
    let degenerate = results.iter().find(|r| r.candidate_id == candidates[2].id).unwrap();
    assert!((aligned.axes.embedding_distance - 1.0).abs() < 1e-6);
    assert!(opposed.axes.embedding_distance.abs() < 1e-6);
    assert!((degenerate.axes.embedding_distance - 0.5).abs() < 1e-9);
}

#[test]
fn ties_break_by_creation_then_stage_then_id() {
    let engine = RankingEngine::default();
    let ctx = RankingContext::new(INPUT);
    let template = batch().remove(2);

    let mut early = template.clone();
    early.id = Uuid::new_v4();
    let mut late = template.clone();
    late.id = Uuid::new_v4();
    late.created_at = early.created_at + ChronoDuration::seconds(1);

    let results = engine.rank(&[late.clone(), early.clone()], &ctx);
    assert_eq!(results[0].composite, results[1].composite);
    assert_eq!(ids(&results), vec![early.id, late.id]);

    let mut a = template.clone();
    a.id = Uuid::from_u128(1);
    let mut b = template.clone();
    b.id = Uuid::from_u128(2);
    let results = engine.rank(&[b.clone(), a.clone()], &ctx);
    assert_eq!(ids(&results), vec![a.id, b.id]);
}

#[test]
fn history_drives_historical_fit_and_its_weight_scales_it() {
    let engine = RankingEngine::default();
    let candidates = batch();
    let accepted = candidates[2].text.clone();
    let history = vec![accepted];

    let none = engine.score(&candidates[2], &RankingContext::new(INPUT));
    assert_eq!(none.historical_fit, 0.0);

    let full = engine.score(
        &candidates[2],
        &RankingContext {
            history: &history,
            ..RankingContext::new(INPUT)
        },
    );
    assert!((full.historical_fit - 1.0).abs() < 1e-9);

    let half = engine.score(
        &candidates[2],
        &RankingContext {
            history: &history,
            historical_weight: 0.5,
            ..RankingContext::new(INPUT)
        },
    );
    assert!((half.historical_fit - 0.5).abs() < 1e-9);
}

#[test]
fn missing_signals_score_neutral() {
    let engine = RankingEngine::default();
    let candidates = batch();
    let scores = engine.score(&candidates[1], &RankingContext::new(INPUT));
    assert_eq!(scores.context_fit, 0.5);
    assert_eq!(scores.embedding_distance, 0.5);

    let empty = engine.score(&candidates[3], &RankingContext::new(INPUT));
    assert_eq!(empty.length_fit, 0.0);
    assert_eq!(empty.semantic_fit, 0.0);
}

#[test]
fn embeddings_of_different_width_are_not_compared() {
    let engine = RankingEngine::default();
    let mut candidates = batch();
    candidates[0].embedding = Some(vec![1.0, 0.0]);
    let input_embedding = vec![1.0, 0.0, 0.0, 0.0];
    let ctx = RankingContext {
        input_embedding: Some(input_embedding.as_slice()),
        ..RankingContext::new(INPUT)
    };

    let scores = engine.score(&candidates[0], &ctx);
    assert_eq!(scores.embedding_distance, 0.5);
}

#[test]
fn stage_profiles_shape_temperature_fit() {
    let candidates = batch();
    let engine = RankingEngine::default();
    let ctx = RankingContext::new(INPUT);
    assert_eq!(engine.score(&candidates[2], &ctx).temperature_fit, 1.0);
    assert_eq!(engine.score(&candidates[4], &ctx).temperature_fit, 0.0);

    let tuned = RankingEngine::default().with_profile(
        "polish",
        StageProfile {
            ideal_temperature: 2.0,
            ..StageProfile::default()
        },
    );
    assert_eq!(tuned.score(&candidates[4], &ctx).temperature_fit, 1.0);
}

#[test]
fn invalid_weights_and_presets_are_rejected() {
    assert_eq!(
        RankingEngine::new(AxisWeights::from_array([0.0; 7])).unwrap_err(),
        WeightsError::AllZero
    );
    let mut negative = AxisWeights::uniform();
    negative.token_fit = -0.1;
    assert!(RankingEngine::new(negative).is_err());

    let presets = WeightPresets::default();
    assert!(matches!(presets.get("nope"), Err(WeightsError::UnknownPreset(_))));
    let precise = RankingEngine::default()
        .reweighted(presets.get("precise").unwrap())
        .unwrap();
    let sum: f64 = precise.weights().as_array().iter().sum();
    assert!((sum - 1.0).abs() < 1e-12);
}

#[test]
fn annotate_writes_scores_back() {
    let engine = RankingEngine::default();
    let mut candidates = batch();
    let results = engine.rank(&candidates, &RankingContext::new(INPUT));
    RankingEngine::annotate(&mut candidates, &results);
    for c in &candidates {
        let r = results.iter().find(|r| r.candidate_id == c.id).unwrap();
        assert_eq!(c.composite_score, Some(r.composite));
        assert_eq!(c.axis_scores, Some(r.axes));
    }
}
