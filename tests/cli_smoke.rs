use std::path::Path;
use std::process::Command;

use tempfile::tempdir;

fn alembic(dir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_alembic"));
    cmd.current_dir(dir)
        .env_remove("ALEMBIC_FALLBACK_BACKEND")
        .env_remove("ALEMBIC_JUDGE_BACKEND")
        .env_remove("ALEMBIC_STORE_PATH");
    cmd
}

fn read_json(path: &Path) -> serde_json::Value {
    let raw = std::fs::read_to_string(path).unwrap();
    serde_json::from_str(&raw).unwrap()
}

#[test]
fn cli_generate_offline_smoke() {
    let dir = tempdir().unwrap();
    let out_path = dir.path().join("outcome.json");
    let trace_path = dir.path().join("trace.jsonl");

    let status = alembic(dir.path())
        .args(["generate", "--input", "Write a function that reverses a string"])
        .arg("--trace")
        .arg(&trace_path)
        .arg("--out")
        .arg(&out_path)
        .status()
        .unwrap();
    assert!(status.success());

    let v = read_json(&out_path);
    let candidates = v.get("candidates").and_then(|c| c.as_array()).unwrap();
    assert_eq!(candidates.len(), 3);
    assert_eq!(
        v.pointer("/ranked/0/rank").and_then(|r| r.as_u64()),
        Some(1)
    );
    assert_eq!(
        v.pointer("/selection/source").and_then(|s| s.as_str()),
        Some("heuristic")
    );
    assert_eq!(
        v.pointer("/selected/id"),
        v.pointer("/ranked/0/candidate_id")
    );
    assert_eq!(
        v.pointer("/metadata/backends_used/0").and_then(|s| s.as_str()),
        Some("placeholder")
    );

    let trace = std::fs::read_to_string(&trace_path).unwrap();
    assert_eq!(trace.lines().count(), 6);
}

#[test]
fn cli_rejects_malformed_stage_backend() {
    let dir = tempdir().unwrap();
    let status = alembic(dir.path())
        .args(["generate", "--input", "x", "--stage-backend", "solutio"])
        .status()
        .unwrap();
    assert!(!status.success());
}

#[test]
fn cli_backends_json_lists_the_offline_backend() {
    let dir = tempdir().unwrap();
    let output = alembic(dir.path()).args(["backends", "--json"]).output().unwrap();
    assert!(output.status.success());

    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], "placeholder");
    assert_eq!(rows[0]["kind"], "placeholder");
    assert_eq!(rows[0]["available"], true);
    assert_eq!(rows[0]["embeddings"], true);
}

#[test]
fn cli_persisted_selection_shows_up_in_history() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("alembic.json");
    let db_path = dir.path().join("candidates.sqlite");
    let config = serde_json::json!({
        "backends": [{"type": "placeholder", "name": "local"}],
        "fallback_backend": "local",
        "store_path": db_path,
    });
    std::fs::write(&config_path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    let out_path = dir.path().join("outcome.json");

    let status = alembic(dir.path())
        .arg("--config")
        .arg(&config_path)
        .args(["generate", "--input", "Write a haiku about rivers", "--persist", "--count", "2"])
        .arg("--out")
        .arg(&out_path)
        .status()
        .unwrap();
    assert!(status.success());
    let outcome = read_json(&out_path);
    assert_eq!(outcome["candidates"].as_array().unwrap().len(), 6);

    let output = alembic(dir.path())
        .arg("--config")
        .arg(&config_path)
        .args(["history", "--input", "write a haiku about RIVERS"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let entries: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let entries = entries.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["candidate_id"], outcome["selected"]["id"]);
    assert_eq!(entries[0]["backend"], "local");
}
