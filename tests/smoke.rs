//! Smoke tests -- verify the binary runs and the command surface is wired up.

use assert_cmd::Command;

fn jobscope(state: &tempfile::TempDir) -> Command {
    let config = state.path().join("jobscope.toml");
    std::fs::write(
        &config,
        format!(
            "[storage]\ndb_path = {:?}\nspill_dir = {:?}\n",
            state.path().join("state.db"),
            state.path().join("shots"),
        ),
    )
    .unwrap();

    let mut cmd = Command::cargo_bin("jobscope").unwrap();
    cmd.env("JOBSCOPE_CONFIG", &config)
        .env_remove("JOBSCOPE_BACKEND")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("jobscope")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Observe, replay and audit"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("jobscope")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("jobscope"));
}

#[test]
fn test_subcommands_exist() {
    for sub in [
        "submit", "stop", "status", "watch", "timeline", "events", "results", "playback",
        "upload", "export",
    ] {
        Command::cargo_bin("jobscope")
            .unwrap()
            .args([sub, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_submit_rejects_two_scenario_sources() {
    Command::cargo_bin("jobscope")
        .unwrap()
        .args(["submit", "--scenario-token", "a", "--scenario-path", "b"])
        .assert()
        .failure();
}

#[test]
fn test_submit_task_options_need_a_task() {
    Command::cargo_bin("jobscope")
        .unwrap()
        .args(["submit", "--package-name", "com.android.settings"])
        .assert()
        .failure();

    Command::cargo_bin("jobscope")
        .unwrap()
        .args(["submit", "--task", "Turn on dark mode", "--scenario-token", "a"])
        .assert()
        .failure();
}

#[test]
fn test_batch_submit_without_entries_fails_locally() {
    let state = tempfile::tempdir().unwrap();

    jobscope(&state)
        .args(["--backend", "http://127.0.0.1:9", "submit", "--mode", "batch"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("--run-config"));
}

#[test]
fn test_backend_preference_round_trip() {
    let state = tempfile::tempdir().unwrap();

    jobscope(&state)
        .args(["config", "backend", "http://10.0.0.7:8000"])
        .assert()
        .success();

    jobscope(&state)
        .args(["config", "backend"])
        .assert()
        .success()
        .stdout(predicates::str::contains("http://10.0.0.7:8000"));

    jobscope(&state)
        .args(["config", "backend", "--clear"])
        .assert()
        .success();

    jobscope(&state)
        .args(["config", "backend"])
        .assert()
        .success()
        .stdout(predicates::str::contains("http://127.0.0.1:8000"));
}

#[test]
fn test_malformed_backend_rejected_before_any_request() {
    let state = tempfile::tempdir().unwrap();

    jobscope(&state)
        .args(["config", "backend", "not a url"])
        .assert()
        .failure();

    jobscope(&state)
        .args(["--backend", "ftp://example.com", "status", "job-1"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("ftp://example.com"));
}

#[test]
fn test_empty_history() {
    let state = tempfile::tempdir().unwrap();

    jobscope(&state)
        .args(["history", "jobs"])
        .assert()
        .success()
        .stdout(predicates::str::contains("No jobs remembered."));

    jobscope(&state)
        .args(["history", "scenarios", "--clear"])
        .assert()
        .success();
}
