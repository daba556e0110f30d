//! Integration tests for the `ember-cli checkpoints` command.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn make_checkpoint(temp_dir: &TempDir, step: u64) {
    let dir = temp_dir.path().join("out").join(format!("checkpoint-{step}"));
    std::fs::create_dir_all(&dir).unwrap();
    let state = serde_json::json!({
        "run_id": "test-run",
        "global_step": step,
        "max_steps": 100,
        "epoch": step as f64 / 10.0,
        "world_size": 1,
        "log_history": [{"step": step, "epoch": step as f64 / 10.0, "loss": 1.25, "learning_rate": 5e-5}],
    });
    std::fs::write(dir.join("trainer_state.json"), state.to_string()).unwrap();
}

fn ember(temp_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("ember-cli").unwrap();
    cmd.current_dir(temp_dir.path()).env_remove("EMBER_WORKSPACE").env_remove("EMBER_LOG");
    cmd
}

#[test]
fn test_checkpoints_json_newest_first() {
    let temp_dir = TempDir::new().unwrap();
    for step in [2, 10, 9] {
        make_checkpoint(&temp_dir, step);
    }
    std::fs::create_dir_all(temp_dir.path().join("out/checkpoint-final")).unwrap();
    std::fs::write(temp_dir.path().join("out/checkpoint-7"), "not a directory").unwrap();

    let output = ember(&temp_dir).args(["checkpoints", "out", "--json"]).output().unwrap();
    assert!(output.status.success());

    let listing: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let steps: Vec<u64> = listing["checkpoints"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["step"].as_u64().unwrap())
        .collect();
    assert_eq!(steps, vec![10, 9, 2]);
    assert_eq!(listing["checkpoints"][0]["loss"], 1.25);
    assert!(listing["final"].is_null());
}

#[test]
fn test_checkpoints_missing_output_dir_is_empty() {
    let temp_dir = TempDir::new().unwrap();

    ember(&temp_dir)
        .args(["checkpoints", "nowhere"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No checkpoints found"));
}

#[test]
fn test_checkpoints_honors_workspace_flag() {
    let temp_dir = TempDir::new().unwrap();
    make_checkpoint(&temp_dir, 500);
    let elsewhere = TempDir::new().unwrap();

    let mut cmd = Command::cargo_bin("ember-cli").unwrap();
    cmd.current_dir(elsewhere.path())
        .env_remove("EMBER_LOG")
        .arg("--workspace")
        .arg(temp_dir.path())
        .args(["checkpoints", "out"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Checkpoints (1)"))
        .stdout(predicate::str::contains("checkpoint-500"));
}
