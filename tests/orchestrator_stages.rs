mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alembic::gateway::{BackendError, BackendRegistry, FailureKind, Invoker, InvokerConfig};
use alembic::orchestrator::{
    ChainMode, GenerationRequest, Orchestrator, PipelineError, PipelineState, StageBackendConfig,
    StageState,
};
use alembic::stages::Stage;
use tokio_util::sync::CancellationToken;

use common::ScriptedBackend;

fn orchestrator(backends: Vec<(&str, Arc<ScriptedBackend>)>, fallback: Option<&str>) -> Orchestrator {
    let mut registry = BackendRegistry::new();
    for (name, backend) in backends {
        registry.register(name, backend).unwrap();
    }
    Orchestrator::new(
        Arc::new(registry),
        Invoker::new(InvokerConfig::fast()),
        StageBackendConfig {
            stage_defaults: HashMap::new(),
            fallback: fallback.map(str::to_string),
        },
    )
}

fn request(stage_backends: &[(&str, &str)]) -> GenerationRequest {
    let mut req = GenerationRequest::new("Write a function that reverses a string");
    req.stage_backends = stage_backends
        .iter()
        .map(|(s, b)| (s.to_string(), b.to_string()))
        .collect();
    req
}

#[tokio::test]
async fn refine_chain_feeds_each_stage_the_previous_output() {
    let gen = Arc::new(ScriptedBackend::echo());
    let orch = orchestrator(vec![("gen", gen.clone())], Some("gen"));

    let run = orch
        .run(&request(&[]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(run.state, PipelineState::Completed);
    assert!(run.failures.is_empty());
    let stages: Vec<&str> = run.candidates.iter().map(|c| c.stage.as_str()).collect();
    assert_eq!(stages, vec!["prima-materia", "solutio", "coagulatio"]);
    assert!(run.candidates.iter().all(|c| c.correlation_id == run.correlation_id));

    let prompts = gen.prompts();
    assert_eq!(prompts.len(), 3);
    assert!(prompts[0].contains("Write a function that reverses a string"));
    assert!(prompts[1].contains("prima-materia output"));
    assert!(prompts[2].contains("solutio output"));
    assert_eq!(run.backends_used(), vec!["gen"]);
}

#[tokio::test]
async fn unresolvable_last_stage_is_a_configuration_failure() {
    let gen = Arc::new(ScriptedBackend::echo());
    let orch = orchestrator(vec![("gen", gen.clone())], None);
    let req = request(&[
        ("prima-materia", "gen"),
        ("solutio", "gen"),
        ("coagulatio", "missing"),
    ]);

    let run = orch.run(&req, &CancellationToken::new()).await.unwrap();

    assert_eq!(run.state, PipelineState::PartiallyFailed);
    assert_eq!(run.candidates.len(), 2);
    assert_eq!(run.failures.len(), 1);
    let failure = &run.failures[0];
    assert_eq!(failure.stage, Stage::Coagulatio);
    assert_eq!(failure.stage_index, 2);
    assert_eq!(failure.kind, FailureKind::Configuration);
    assert_eq!(failure.variant, None);
    assert!(failure.message.contains("missing"));
    assert_eq!(run.stages[2].state, StageState::Failed);
    assert_eq!(run.stages[2].backend, None);
    assert_eq!(gen.calls(), 2);
}

#[tokio::test]
async fn independent_mode_runs_stages_around_a_missing_middle() {
    let gen = Arc::new(ScriptedBackend::echo());
    let orch = orchestrator(vec![("gen", gen.clone())], None);
    let mut req = request(&[
        ("prima-materia", "gen"),
        ("solutio", "missing"),
        ("coagulatio", "gen"),
    ]);
    req.chain = ChainMode::Independent;

    let run = orch.run(&req, &CancellationToken::new()).await.unwrap();

    let indices: Vec<usize> = run.candidates.iter().map(|c| c.stage_index).collect();
    assert_eq!(indices, vec![0, 2]);
    assert_eq!(run.failures.len(), 1);
    assert_eq!(run.failures[0].stage_index, 1);
    assert_eq!(run.failures[0].kind, FailureKind::Configuration);
    assert!(gen
        .prompts()
        .iter()
        .all(|p| p.contains("Write a function that reverses a string")));
}

#[tokio::test]
async fn failed_stage_starves_its_downstream_in_refine_mode() {
    let good = Arc::new(ScriptedBackend::echo());
    let broken = Arc::new(ScriptedBackend::failing(|| BackendError::bad_request("rejected")));
    let orch = orchestrator(vec![("good", good.clone()), ("broken", broken.clone())], None);
    let req = request(&[
        ("prima-materia", "good"),
        ("solutio", "broken"),
        ("coagulatio", "good"),
    ]);

    let run = orch.run(&req, &CancellationToken::new()).await.unwrap();

    assert_eq!(run.candidates.len(), 1);
    let kinds: Vec<(usize, FailureKind)> = run.failures.iter().map(|f| (f.stage_index, f.kind)).collect();
    assert_eq!(
        kinds,
        vec![(1, FailureKind::BadRequest), (2, FailureKind::UpstreamFailed)]
    );
    assert_eq!(run.failures[0].attempts, 1);
    assert_eq!(broken.calls(), 1);
    assert_eq!(good.calls(), 1);

    assert!(run.state.is_terminal());
    let states: Vec<StageState> = run.stages.iter().map(|s| s.state).collect();
    assert_eq!(
        states,
        vec![StageState::Succeeded, StageState::Failed, StageState::Failed]
    );
    assert!(states.iter().all(StageState::is_terminal));
}

#[tokio::test]
async fn deadline_keeps_finished_candidates() {
    let fast = Arc::new(ScriptedBackend::echo());
    let slow = Arc::new(ScriptedBackend::echo().with_delay(Duration::from_secs(5)));
    let orch = orchestrator(vec![("fast", fast), ("slow", slow)], None);
    let mut req = request(&[
        ("prima-materia", "fast"),
        ("solutio", "slow"),
        ("coagulatio", "slow"),
    ]);
    req.chain = ChainMode::Independent;
    req.deadline_ms = Some(150);

    let started = Instant::now();
    let run = orch.run(&req, &CancellationToken::new()).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(run.candidates.len(), 1);
    assert_eq!(run.candidates[0].stage, Stage::PrimaMateria);
    assert_eq!(run.failures.len(), 2);
    assert!(run
        .failures
        .iter()
        .all(|f| f.kind == FailureKind::DeadlineExceeded));
    assert_eq!(run.state, PipelineState::PartiallyFailed);
}

#[tokio::test]
async fn caller_cancellation_marks_every_stage_cancelled() {
    let gen = Arc::new(ScriptedBackend::echo());
    let orch = orchestrator(vec![("gen", gen.clone())], Some("gen"));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let run = orch.run(&request(&[]), &cancel).await.unwrap();

    assert!(run.candidates.is_empty());
    assert_eq!(run.failures.len(), 3);
    assert!(run.failures.iter().all(|f| f.kind == FailureKind::Cancelled));
    assert_eq!(gen.calls(), 0);
}

#[tokio::test]
async fn parallel_independent_stages_overlap() {
    let gen = Arc::new(ScriptedBackend::echo().with_delay(Duration::from_millis(200)));
    let orch = orchestrator(vec![("gen", gen.clone())], Some("gen"));
    let mut req = request(&[]);
    req.chain = ChainMode::Independent;
    req.parallel = true;
    req.count = 2;

    let started = Instant::now();
    let run = orch.run(&req, &CancellationToken::new()).await.unwrap();

    // Six calls of 200ms each; run one after another they would take 1.2s.
    assert!(started.elapsed() < Duration::from_millis(900));
    assert_eq!(run.candidates.len(), 6);
    let order: Vec<(usize, usize)> = run.candidates.iter().map(|c| (c.stage_index, c.variant)).collect();
    assert_eq!(order, vec![(0, 0), (0, 1), (1, 0), (1, 1), (2, 0), (2, 1)]);
}

#[tokio::test]
async fn count_produces_variants_per_stage() {
    let gen = Arc::new(ScriptedBackend::echo());
    let orch = orchestrator(vec![("gen", gen.clone())], Some("gen"));
    let mut req = request(&[]);
    req.stages = vec![Stage::PrimaMateria, Stage::parse("polish")];
    req.count = 3;
    req.tags = vec!["demo".into()];

    let run = orch.run(&req, &CancellationToken::new()).await.unwrap();

    assert_eq!(run.candidates.len(), 6);
    assert_eq!(gen.calls(), 6);
    assert_eq!(run.stages[0].succeeded, 3);
    assert_eq!(run.stages[1].succeeded, 3);
    assert_eq!(run.candidates[3].stage, Stage::Custom("polish".into()));
    assert!(run.candidates.iter().all(|c| c.tags == vec!["demo".to_string()]));
    assert!(run.candidates.iter().all(|c| c.max_tokens == 1000));
}

#[tokio::test]
async fn invalid_request_is_rejected_before_any_call() {
    let gen = Arc::new(ScriptedBackend::echo());
    let orch = orchestrator(vec![("gen", gen.clone())], Some("gen"));

    let mut req = request(&[]);
    req.stages.clear();
    let err = orch.run(&req, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRequest(_)));

    let mut req = request(&[]);
    req.input = "   ".into();
    assert!(orch.run(&req, &CancellationToken::new()).await.is_err());
    assert_eq!(gen.calls(), 0);
}

#[tokio::test]
async fn global_backend_applies_where_no_stage_override_exists() {
    let a = Arc::new(ScriptedBackend::echo());
    let b = Arc::new(ScriptedBackend::echo());
    let orch = orchestrator(vec![("a", a.clone()), ("b", b.clone())], None);
    let mut req = request(&[("solutio", "b")]);
    req.backend = Some("a".into());

    let run = orch.run(&req, &CancellationToken::new()).await.unwrap();

    let used: Vec<&str> = run.candidates.iter().map(|c| c.backend.as_str()).collect();
    assert_eq!(used, vec!["a", "b", "a"]);
    assert_eq!(a.calls(), 2);
    assert_eq!(b.calls(), 1);
}
