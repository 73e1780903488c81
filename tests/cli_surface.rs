//! CLI surface tests: flag parsing, stream discipline, and exit codes for
//! the commands that need no external tooling.

use assert_cmd::Command;
use predicates::prelude::*;

/// A command wired to isolated config/state/cache directories.
fn dsr(dirs: &TestDirs) -> Command {
    let mut cmd = Command::cargo_bin("dsr").expect("binary builds");
    cmd.env("DSR_CONFIG_DIR", dirs.config.path())
        .env("DSR_STATE_DIR", dirs.state.path())
        .env("DSR_CACHE_DIR", dirs.cache.path())
        .env_remove("DSR_THRESHOLD")
        .env_remove("RUST_LOG");
    cmd
}

struct TestDirs {
    config: tempfile::TempDir,
    state: tempfile::TempDir,
    cache: tempfile::TempDir,
}

fn dirs() -> TestDirs {
    TestDirs {
        config: tempfile::tempdir().unwrap(),
        state: tempfile::tempdir().unwrap(),
        cache: tempfile::tempdir().unwrap(),
    }
}

#[test]
fn help_lists_the_command_surface() {
    let dirs = dirs();
    dsr(&dirs)
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("check")
                .and(predicate::str::contains("watch"))
                .and(predicate::str::contains("build"))
                .and(predicate::str::contains("release"))
                .and(predicate::str::contains("fallback"))
                .and(predicate::str::contains("doctor"))
                .and(predicate::str::contains("prune")),
        );
}

#[test]
fn missing_subcommand_is_an_invalid_arguments_error() {
    let dirs = dirs();
    dsr(&dirs).assert().failure().code(4);
}

#[test]
fn unknown_tool_maps_to_invalid_config_exit() {
    let dirs = dirs();
    dsr(&dirs)
        .args(["check", "no-such-tool"])
        .assert()
        .failure()
        .code(4)
        .stderr(predicate::str::contains("E031"));
}

#[test]
fn json_mode_emits_one_envelope_on_stdout() {
    let dirs = dirs();
    let output = dsr(&dirs)
        .args(["--json", "config", "show"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let envelope: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout is a single JSON document");
    for key in [
        "command",
        "status",
        "exit_code",
        "run_id",
        "started_at",
        "duration_ms",
        "tool",
        "version",
        "schema_version",
    ] {
        assert!(envelope.get(key).is_some(), "missing required field {key}");
    }
    assert_eq!(envelope["command"], "config");
    assert_eq!(envelope["status"], "success");
    assert_eq!(envelope["exit_code"], 0);
}

#[test]
fn config_init_writes_starter_documents() {
    let dirs = dirs();
    dsr(&dirs)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("config.yaml").and(predicate::str::contains("hosts.yaml")),
        );

    assert!(dirs.config.path().join("config.yaml").exists());
    assert!(dirs.config.path().join("hosts.yaml").exists());
    assert!(dirs.config.path().join("repos.d").is_dir());
}

#[test]
fn config_set_then_get_round_trips() {
    let dirs = dirs();
    dsr(&dirs)
        .args(["config", "set", "threshold_secs", "120"])
        .assert()
        .success();
    dsr(&dirs)
        .args(["config", "get", "threshold_secs"])
        .assert()
        .success()
        .stdout(predicate::str::contains("120"));
}

#[test]
fn config_get_unknown_key_is_invalid_config() {
    let dirs = dirs();
    dsr(&dirs)
        .args(["config", "get", "no.such.key"])
        .assert()
        .failure()
        .code(4);
}

#[test]
fn env_threshold_beats_file_value() {
    let dirs = dirs();
    std::fs::write(
        dirs.config.path().join("config.yaml"),
        "schema_version: 1\nthreshold_secs: 900\n",
    )
    .unwrap();

    dsr(&dirs)
        .env("DSR_THRESHOLD", "42")
        .args(["config", "get", "threshold_secs"])
        .assert()
        .success()
        .stdout(predicate::str::contains("42"));
}

#[test]
fn repos_lifecycle_add_list_info_remove() {
    let dirs = dirs();
    std::fs::create_dir_all(dirs.config.path().join("repos.d")).unwrap();

    dsr(&dirs)
        .args([
            "repos",
            "add",
            "cass",
            "someuser/cass",
            "--source-path",
            "/src/cass",
        ])
        .assert()
        .success();

    dsr(&dirs)
        .args(["repos", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cass someuser/cass"));

    dsr(&dirs)
        .args(["repos", "info", "cass"])
        .assert()
        .success()
        .stdout(predicate::str::contains("asset_pattern"));

    dsr(&dirs)
        .args(["repos", "remove", "cass"])
        .assert()
        .success();

    dsr(&dirs)
        .args(["repos", "info", "cass"])
        .assert()
        .failure()
        .code(4);
}

#[test]
fn repos_add_rejects_malformed_repo() {
    let dirs = dirs();
    dsr(&dirs)
        .args([
            "repos",
            "add",
            "cass",
            "not-a-repo",
            "--source-path",
            "/src/cass",
        ])
        .assert()
        .failure()
        .code(4)
        .stderr(predicate::str::contains("owner/name"));
}

#[test]
fn repos_discover_is_a_structured_unsupported_error() {
    let dirs = dirs();
    let output = dsr(&dirs)
        .args(["--json", "repos", "discover"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(4));

    let envelope: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(envelope["errors"][0]["code"], "E030");
}

#[test]
fn repos_validate_flags_unresolvable_platform() {
    let dirs = dirs();
    std::fs::create_dir_all(dirs.config.path().join("repos.d")).unwrap();
    // darwin/arm64 has no host in an empty hosts.yaml.
    std::fs::write(
        dirs.config.path().join("repos.d/cass.yaml"),
        r#"
tool: cass
repo: someuser/cass
source_path: /src/cass
platforms: [darwin/arm64]
asset_pattern: "${name}-${version}-${target}${ext}"
native_build_command: "make release"
"#,
    )
    .unwrap();

    dsr(&dirs)
        .args(["repos", "validate"])
        .assert()
        .failure()
        .code(4)
        .stderr(predicate::str::contains("darwin/arm64"));
}

#[test]
fn status_on_empty_state_succeeds_quietly() {
    let dirs = dirs();
    dsr(&dirs)
        .args(["status"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn prune_dry_run_removes_nothing() {
    let dirs = dirs();
    let run_dir = dirs
        .state
        .path()
        .join("runs/cass/0.1.0/run-1");
    std::fs::create_dir_all(&run_dir).unwrap();

    dsr(&dirs)
        .args(["--dry-run", "prune", "--older-than-days", "0"])
        .assert()
        .success();
    assert!(run_dir.exists());
}

#[test]
fn build_requires_a_configured_tool() {
    let dirs = dirs();
    dsr(&dirs)
        .args(["build", "ghost", "--version", "1.0.0"])
        .assert()
        .failure()
        .code(4);
}
