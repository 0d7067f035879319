#![allow(deprecated)]
use assert_cmd::Command;
use borg_ui_core::registry::{JobRecord, JobStatus, RedbRegistry, Registry, ScheduleKind};
use predicates::prelude::*;
use tempfile::TempDir;

fn borg_ui(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("borg-ui").unwrap();
    cmd.current_dir(dir.path())
        .env("BORG_UI_DATA_DIR", dir.path())
        .env_remove("RUST_LOG");
    cmd
}

fn json_output(cmd: &mut Command) -> serde_json::Value {
    let output = cmd.output().unwrap();
    assert!(output.status.success(), "{output:?}");
    serde_json::from_slice(&output.stdout).unwrap()
}

/// Pid of a child that has already exited and been reaped.
fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

// ---------------------------------------------------------------------------
// borg-ui migrate
// ---------------------------------------------------------------------------

#[test]
fn migrate_creates_registry_and_is_idempotent() {
    let dir = TempDir::new().unwrap();

    let first = json_output(borg_ui(&dir).args(["migrate", "--json"]));
    assert!(first["applied"].as_u64().unwrap() > 0);
    assert!(dir.path().join("registry.redb").exists());

    let second = json_output(borg_ui(&dir).args(["migrate", "--json"]));
    assert_eq!(second["applied"], 0);
    assert_eq!(second["schema_version"], first["schema_version"]);

    borg_ui(&dir)
        .arg("migrate")
        .assert()
        .success()
        .stdout(predicate::str::contains("up to date"));
}

// ---------------------------------------------------------------------------
// borg-ui reconcile
// ---------------------------------------------------------------------------

#[test]
fn reconcile_empty_registry_reports_nothing() {
    let dir = TempDir::new().unwrap();
    let report = json_output(borg_ui(&dir).args(["reconcile", "--json"]));
    assert_eq!(report["jobs"]["checked"], 0);
    assert_eq!(report["mounts"]["checked"], 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn reconcile_marks_dead_job_orphaned() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("registry.redb");
    {
        let registry = RedbRegistry::open(&path).unwrap();
        registry.apply_migrations().await.unwrap();
        registry
            .create_job(JobRecord::running(ScheduleKind::Backup, "/repo", dead_pid()).with_id(42))
            .await
            .unwrap();
    }

    let report = json_output(borg_ui(&dir).args(["reconcile", "--json"]));
    assert_eq!(report["jobs"]["checked"], 1);
    assert_eq!(report["jobs"]["orphaned"], serde_json::json!([42]));

    let registry = RedbRegistry::open(&path).unwrap();
    let job = registry.get_job(42).await.unwrap();
    assert_eq!(job.status, JobStatus::Orphaned);
    assert!(job.ended_at.is_some());
}

#[test]
fn reconcile_prints_table() {
    let dir = TempDir::new().unwrap();
    borg_ui(&dir)
        .arg("reconcile")
        .assert()
        .success()
        .stdout(predicate::str::contains("RESOURCE"))
        .stdout(predicate::str::contains("jobs"))
        .stdout(predicate::str::contains("mounts"));
}

// ---------------------------------------------------------------------------
// borg-ui config
// ---------------------------------------------------------------------------

#[test]
fn default_config_is_valid() {
    let dir = TempDir::new().unwrap();
    borg_ui(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config is valid"));
}

#[test]
fn empty_dispatch_template_fails_validation() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("config.yaml"), "dispatch:\n  check: []\n").unwrap();
    borg_ui(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error]"))
        .stderr(predicate::str::contains("config validation found errors"));
}

#[test]
fn config_show_reflects_file() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("config.yaml"),
        "schedulers:\n  backup_interval_secs: 15\n",
    )
    .unwrap();
    let shown = json_output(borg_ui(&dir).args(["config", "show", "--json"]));
    assert_eq!(shown["schedulers"]["backup_interval_secs"], 15);
    assert_eq!(shown["schedulers"]["check_interval_secs"], 3600);
}

// ---------------------------------------------------------------------------
// Argument handling
// ---------------------------------------------------------------------------

#[test]
fn help_lists_commands() {
    let dir = TempDir::new().unwrap();
    borg_ui(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("reconcile"))
        .stdout(predicate::str::contains("migrate"));
}

#[test]
fn unknown_log_format_is_rejected() {
    let dir = TempDir::new().unwrap();
    borg_ui(&dir)
        .args(["--log-format", "xml", "migrate"])
        .assert()
        .failure();
}
