mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use alembic::candidate::Candidate;
use alembic::gateway::{BackendRegistry, FailureKind, Invoker, InvokerConfig};
use alembic::judge::{
    EvaluationWeights, JudgeConfig, JudgeError, JudgeSelector, SelectionCriteria, SelectionSource,
};
use alembic::ranking::{RankingContext, RankingEngine};
use alembic::stages::Stage;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use common::{judge_json, ScriptedBackend};

const INPUT: &str = "Write a function that reverses a string";

fn candidates(texts: &[&str]) -> Vec<Candidate> {
    let correlation = Uuid::new_v4();
    texts
        .iter()
        .enumerate()
        .map(|(i, text)| Candidate::new(correlation, *text, Stage::Coagulatio, 2, i, "gen", "m", 0.4, 400, 60))
        .collect()
}

fn selector(judge: ScriptedBackend, config: JudgeConfig) -> (JudgeSelector, Arc<ScriptedBackend>) {
    let judge = Arc::new(judge);
    let mut registry = BackendRegistry::new();
    registry.register("judge", judge.clone()).unwrap();
    let selector = JudgeSelector::new(Arc::new(registry), Invoker::new(InvokerConfig::fast())).with_config(config);
    (selector, judge)
}

/// Scores keyed on a marker word in the candidate text.
fn scoring_judge() -> ScriptedBackend {
    ScriptedBackend::responding(|req| {
        let reply = if req.prompt.contains("alpha") {
            judge_json(5, 5, 0, "thin")
        } else if req.prompt.contains("beta") {
            judge_json(9, 9, 0, "clear and complete")
        } else {
            judge_json(7, 7, 0, "fine")
        };
        Ok(reply)
    })
}

#[tokio::test]
async fn judge_picks_highest_weighted_composite() {
    let (selector, judge) = selector(scoring_judge(), JudgeConfig::default());
    let batch = candidates(&["alpha answer", "beta answer", "gamma answer"]);
    let criteria = SelectionCriteria::new(INPUT, "judge");

    let result = selector
        .select(&batch, &criteria, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.candidate_id, batch[1].id);
    assert_eq!(result.reasoning, "clear and complete");
    assert_eq!(result.judge_backend, "judge");
    assert_eq!(judge.calls(), 3);

    let order: Vec<Uuid> = result.scores.iter().map(|e| e.candidate_id).collect();
    assert_eq!(order, batch.iter().map(|c| c.id).collect::<Vec<_>>());
    assert!(result.scores.iter().all(|e| e.error.is_none()));

    // No confidence reported: 0.5 plus the margin over the runner-up.
    let beta = result.scores[1].composite.unwrap();
    let gamma = result.scores[2].composite.unwrap();
    assert!((result.confidence - (0.5 + beta - gamma)).abs() < 1e-9);
    assert!((0.0..=1.0).contains(&result.confidence));
}

#[tokio::test]
async fn judge_prompt_carries_criteria_and_candidate() {
    let (selector, judge) = selector(scoring_judge(), JudgeConfig::default());
    let batch = candidates(&["beta answer"]);
    let criteria = SelectionCriteria::new(INPUT, "judge")
        .with_requirements(vec!["Must handle unicode".into()]);

    selector
        .select(&batch, &criteria, &CancellationToken::new())
        .await
        .unwrap();

    let prompt = &judge.prompts()[0];
    assert!(prompt.contains(&batch[0].id.to_string()));
    assert!(prompt.contains("beta answer"));
}

#[tokio::test]
async fn toxicity_is_penalised() {
    let judge = ScriptedBackend::responding(|req| {
        Ok(if req.prompt.contains("edgy") {
            judge_json(9, 9, 8, "sharp but hostile")
        } else {
            judge_json(8, 8, 0, "polite")
        })
    });
    let (selector, _) = selector(judge, JudgeConfig::default());
    let batch = candidates(&["edgy answer", "calm answer"]);
    let criteria = SelectionCriteria::new(INPUT, "judge").with_weights(EvaluationWeights::default());

    let result = selector
        .select(&batch, &criteria, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.candidate_id, batch[1].id);
    assert!(result.scores[0].composite.unwrap() < result.scores[1].composite.unwrap());
}

#[tokio::test]
async fn malformed_responses_keep_heuristic_selection() {
    let (selector, _) = selector(
        ScriptedBackend::replying("I liked the second one best."),
        JudgeConfig::default(),
    );
    let batch = candidates(&["alpha answer", "beta answer", "gamma answer"]);
    let ranked = RankingEngine::default().rank(&batch, &RankingContext::new(INPUT));
    let criteria = SelectionCriteria::new(INPUT, "judge");

    let err = selector
        .select(&batch, &criteria, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, JudgeError::AllEvaluationsFailed { count: 3, .. }));

    let selection = selector
        .select_or_fallback(&batch, &ranked, &criteria, &CancellationToken::new())
        .await;
    assert_eq!(selection.source, SelectionSource::Heuristic);
    assert_eq!(selection.candidate_id, Some(ranked[0].candidate_id));
    assert!(selection.judge.is_none());
    assert_eq!(selection.judge_error_kind, Some(FailureKind::JudgeFailure));
    assert!(selection.judge_error.is_some());
}

#[tokio::test]
async fn one_bad_evaluation_does_not_sink_the_rest() {
    let judge = ScriptedBackend::responding(|req| {
        Ok(if req.prompt.contains("alpha") {
            "{\"relevance\": 14}".to_string()
        } else if req.prompt.contains("beta") {
            judge_json(6, 6, 0, "ok")
        } else {
            judge_json(8, 8, 0, "better")
        })
    });
    let (selector, _) = selector(judge, JudgeConfig::default());
    let batch = candidates(&["alpha answer", "beta answer", "gamma answer"]);

    let result = selector
        .select(&batch, &SelectionCriteria::new(INPUT, "judge"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.candidate_id, batch[2].id);
    assert!(result.scores[0].error.is_some());
    assert!(result.scores[0].composite.is_none());
}

#[tokio::test]
async fn evaluations_respect_concurrency_limit() {
    let judge = scoring_judge().with_delay(Duration::from_millis(200));
    let (selector, judge) = selector(
        judge,
        JudgeConfig {
            concurrency: 3,
            ..JudgeConfig::default()
        },
    );
    let batch = candidates(&["a1", "a2", "a3", "a4", "a5", "a6"]);

    let started = Instant::now();
    selector
        .select(&batch, &SelectionCriteria::new(INPUT, "judge"), &CancellationToken::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // Two waves of three; fully serial would take 1.2s, fully parallel 0.2s.
    assert!(elapsed >= Duration::from_millis(400), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1000), "{elapsed:?}");
    assert_eq!(judge.calls(), 6);
}

#[tokio::test]
async fn configuration_problems_fail_fast() {
    let (selector, judge) = selector(scoring_judge(), JudgeConfig::default());
    let batch = candidates(&["alpha answer"]);
    let cancel = CancellationToken::new();

    let err = selector
        .select(&batch, &SelectionCriteria::new(INPUT, "nobody"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, JudgeError::Registry(_)));

    let err = selector
        .select(&batch, &SelectionCriteria::new(INPUT, " "), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, JudgeError::InvalidCriteria(_)));

    let err = selector
        .select(&[], &SelectionCriteria::new(INPUT, "judge"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, JudgeError::NoCandidates));

    let negative = EvaluationWeights::new(-1.0, 0.3, 0.2, 0.1, 0.1);
    let err = selector
        .select(
            &batch,
            &SelectionCriteria::new(INPUT, "judge").with_weights(negative),
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, JudgeError::InvalidCriteria(_)));
    assert_eq!(judge.calls(), 0);
}

#[tokio::test]
async fn cancelled_judging_falls_back_with_cancelled_kind() {
    let (selector, _) = selector(
        scoring_judge().with_delay(Duration::from_secs(5)),
        JudgeConfig::default(),
    );
    let batch = candidates(&["alpha answer", "beta answer"]);
    let ranked = RankingEngine::default().rank(&batch, &RankingContext::new(INPUT));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let selection = selector
        .select_or_fallback(&batch, &ranked, &SelectionCriteria::new(INPUT, "judge"), &cancel)
        .await;

    assert_eq!(selection.source, SelectionSource::Heuristic);
    assert_eq!(selection.candidate_id, Some(ranked[0].candidate_id));
    assert_eq!(selection.judge_error_kind, Some(FailureKind::Cancelled));
}

#[tokio::test]
async fn annotate_copies_reasoning_onto_candidates() {
    let (selector, _) = selector(scoring_judge(), JudgeConfig::default());
    let mut batch = candidates(&["alpha answer", "beta answer"]);

    let result = selector
        .select(&batch, &SelectionCriteria::new(INPUT, "judge"), &CancellationToken::new())
        .await
        .unwrap();
    JudgeSelector::annotate(&mut batch, &result);

    assert_eq!(batch[0].judge_reasoning.as_deref(), Some("thin"));
    assert_eq!(batch[1].judge_reasoning.as_deref(), Some("clear and complete"));
}
