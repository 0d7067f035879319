use async_trait::async_trait;
use borg_ui_core::admin::AdminBootstrap;
use borg_ui_core::cache::{BackendKind, CacheService};
use borg_ui_core::error::{BorgUiError, Result};
use borg_ui_core::housekeeping::Housekeeping;
use borg_ui_core::logs::RotationReport;
use borg_ui_core::probe::{Liveness, OsProbe};
use borg_ui_core::registry::{
    JobRecord, JobStatus, MountRecord, MountStatus, RedbRegistry, Registry, ScheduleDefinition,
    ScheduleKind,
};
use borg_ui_core::scheduler::{DispatchError, Dispatcher, SchedulerState};
use borg_ui_core::settings::{FileSettingsStore, LogRetention};
use borg_ui_core::supervisor::{StartupStep, StepStatus};
use borg_ui_core::sysinfo::SystemInfo;
use borg_ui_core::{Lifecycle, Services, Supervisor, SupervisorConfig};
use chrono::Utc;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

struct FakeHousekeeping {
    registry: Arc<RedbRegistry>,
    fail_migrations: bool,
    rotations: AtomicUsize,
}

#[async_trait]
impl Housekeeping for FakeHousekeeping {
    async fn apply_migrations(&self) -> Result<u32> {
        if self.fail_migrations {
            return Err(BorgUiError::Registry("database is locked".into()));
        }
        self.registry.apply_migrations().await
    }

    async fn bootstrap_admin(&self) -> Result<AdminBootstrap> {
        Ok(AdminBootstrap::AlreadyPresent)
    }

    async fn load_system_info(&self) -> Result<SystemInfo> {
        Err(BorgUiError::Command {
            command: "borg --version".into(),
            reason: "not installed".into(),
        })
    }

    async fn rotate_logs(&self, _retention: LogRetention) -> Result<RotationReport> {
        self.rotations.fetch_add(1, Ordering::SeqCst);
        Ok(RotationReport::default())
    }
}

/// Pid 43 and `/mnt/live` are alive; everything else is gone.
struct FakeProbe;

#[async_trait]
impl OsProbe for FakeProbe {
    async fn is_process_alive(&self, pid: u32) -> Liveness {
        if pid == 43 {
            Liveness::Alive
        } else {
            Liveness::Dead
        }
    }

    async fn is_path_mounted(&self, path: &Path) -> Liveness {
        if path == Path::new("/mnt/live") {
            Liveness::Alive
        } else {
            Liveness::Dead
        }
    }

    async fn force_unmount(&self, _path: &Path) -> bool {
        false
    }
}

#[derive(Default)]
struct CountingDispatcher {
    calls: Mutex<Vec<String>>,
    /// Job ids reported as still running on the next shutdown.
    running: Mutex<Vec<u64>>,
}

impl CountingDispatcher {
    fn record(&self, s: &ScheduleDefinition) -> std::result::Result<(), DispatchError> {
        self.calls.lock().unwrap().push(s.name.clone());
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for CountingDispatcher {
    async fn submit_backup_job(
        &self,
        s: &ScheduleDefinition,
    ) -> std::result::Result<(), DispatchError> {
        self.record(s)
    }

    async fn submit_check(&self, s: &ScheduleDefinition) -> std::result::Result<(), DispatchError> {
        self.record(s)
    }

    async fn refresh_stats(
        &self,
        s: &ScheduleDefinition,
    ) -> std::result::Result<(), DispatchError> {
        self.record(s)
    }

    async fn shutdown(&self, _timeout: Duration) -> Vec<u64> {
        std::mem::take(&mut *self.running.lock().unwrap())
    }
}

struct Harness {
    _dir: TempDir,
    registry: Arc<RedbRegistry>,
    housekeeping: Arc<FakeHousekeeping>,
    dispatcher: Arc<CountingDispatcher>,
    cache: Arc<CacheService>,
    supervisor: Supervisor,
}

fn harness(settings_yaml: &str, fail_migrations: bool) -> Harness {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(RedbRegistry::open(&dir.path().join("registry.redb")).unwrap());
    let settings_path = dir.path().join("settings.yaml");
    std::fs::write(&settings_path, settings_yaml).unwrap();

    let housekeeping = Arc::new(FakeHousekeeping {
        registry: registry.clone(),
        fail_migrations,
        rotations: AtomicUsize::new(0),
    });
    let dispatcher = Arc::new(CountingDispatcher::default());
    let cache = Arc::new(CacheService::new(1 << 20));

    let services = Services {
        registry: registry.clone(),
        settings: Arc::new(FileSettingsStore::new(settings_path)),
        probe: Arc::new(FakeProbe),
        dispatcher: dispatcher.clone(),
        cache: cache.clone(),
        housekeeping: housekeeping.clone(),
    };
    let mut config = SupervisorConfig {
        verify_attempts: 1,
        verify_delay: Duration::from_millis(1),
        shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    config.schedulers.backup_interval_secs = 1;

    Harness {
        _dir: dir,
        registry,
        housekeeping,
        dispatcher,
        cache,
        supervisor: Supervisor::new(services, config),
    }
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_migrations_do_not_stop_startup() {
    let h = harness("log_cleanup_on_startup: true\n", true);

    let report = h.supervisor.on_process_start().await;

    assert!(matches!(
        report.status_of(StartupStep::Migrations),
        Some(StepStatus::Failed(_))
    ));
    assert!(matches!(
        report.status_of(StartupStep::SystemInfo),
        Some(StepStatus::Failed(_))
    ));
    assert_eq!(
        report.status_of(StartupStep::LogRotation),
        Some(&StepStatus::Succeeded)
    );
    assert_eq!(
        report.status_of(StartupStep::LaunchSchedulers),
        Some(&StepStatus::Succeeded)
    );
    assert_eq!(h.housekeeping.rotations.load(Ordering::SeqCst), 1);

    let states = h.supervisor.scheduler_states();
    assert_eq!(states.len(), 3);
    assert!(states.iter().all(|s| s.state != SchedulerState::Stopped));
    assert!(h.supervisor.is_running().await);

    let stopped = h.supervisor.on_process_stop().await;
    assert_eq!(stopped.cancelled.len(), 3);
    assert!(stopped.failures.is_empty());
    assert!(h
        .supervisor
        .scheduler_states()
        .iter()
        .all(|s| s.state == SchedulerState::Stopped));
}

#[tokio::test]
async fn steps_run_in_order() {
    let h = harness("", false);
    let report = h.supervisor.startup().await;
    let order: Vec<StartupStep> = report.steps.iter().map(|s| s.step).collect();
    assert_eq!(
        order,
        vec![
            StartupStep::Migrations,
            StartupStep::AdminBootstrap,
            StartupStep::CacheConfiguration,
            StartupStep::SystemInfo,
            StartupStep::LogRotation,
            StartupStep::ReconcileJobs,
            StartupStep::ReconcileMounts,
            StartupStep::LaunchSchedulers,
        ]
    );
    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn startup_reconciles_orphans() {
    let h = harness("log_cleanup_on_startup: false\n", false);
    h.registry.apply_migrations().await.unwrap();
    h.registry
        .create_job(JobRecord::running(ScheduleKind::Backup, "/repo", 9999).with_id(42))
        .await
        .unwrap();
    h.registry
        .create_job(JobRecord::running(ScheduleKind::Backup, "/repo", 43).with_id(43))
        .await
        .unwrap();
    let gone = h
        .registry
        .create_mount(MountRecord::active("/mnt/gone", "/repo"))
        .await
        .unwrap();

    let report = h.supervisor.startup().await;
    assert_eq!(
        report.status_of(StartupStep::LogRotation),
        Some(&StepStatus::Skipped("log cleanup on startup disabled".into()))
    );
    assert_eq!(h.housekeeping.rotations.load(Ordering::SeqCst), 0);
    assert_eq!(report.jobs.as_ref().unwrap().orphaned, vec![42]);

    let j42 = h.registry.get_job(42).await.unwrap();
    assert_eq!(j42.status, JobStatus::Orphaned);
    assert!(j42.ended_at.is_some());
    assert_eq!(
        h.registry.get_job(43).await.unwrap().status,
        JobStatus::Running
    );
    assert_eq!(
        h.registry.get_mount(gone).await.unwrap().status,
        MountStatus::Stale
    );

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn unreachable_cache_falls_back_and_serving_continues() {
    let h = harness("redis_url: redis://127.0.0.1:1/0\n", false);
    let report = h.supervisor.startup().await;

    assert!(matches!(
        report.status_of(StartupStep::CacheConfiguration),
        Some(StepStatus::Failed(_))
    ));
    assert!(report.cache.as_ref().unwrap().is_fallback());
    assert_eq!(h.cache.backend_kind(), BackendKind::Memory);
    assert_eq!(
        report.status_of(StartupStep::LaunchSchedulers),
        Some(&StepStatus::Succeeded)
    );

    h.cache.put("k", b"v".to_vec()).await;
    assert_eq!(h.cache.get("k").await, Some(b"v".to_vec()));
    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn launched_scheduler_dispatches_due_schedule_once() {
    let h = harness("", false);
    h.registry.apply_migrations().await.unwrap();
    // yearly, so the next occurrence after dispatch is far away
    let mut schedule =
        ScheduleDefinition::new("nightly", ScheduleKind::Backup, "/repo", "0 0 1 1 *");
    schedule.created_at = Utc::now() - chrono::Duration::days(400);
    h.registry.create_schedule(schedule).await.unwrap();

    h.supervisor.startup().await;
    // backup interval is one second; give it a few cycles
    tokio::time::sleep(Duration::from_millis(2500)).await;
    h.supervisor.shutdown().await;

    assert_eq!(
        h.dispatcher.calls.lock().unwrap().as_slice(),
        ["nightly".to_string()]
    );
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_before_startup_is_a_noop() {
    let h = harness("", false);
    let report = h.supervisor.on_process_stop().await;
    assert_eq!(report.total(), 0);
}

#[tokio::test]
async fn shutdown_twice_is_safe() {
    let h = harness("", false);
    h.supervisor.startup().await;

    let first = h.supervisor.shutdown().await;
    assert_eq!(first.cancelled.len(), 3);
    let second = h.supervisor.shutdown().await;
    assert_eq!(second.total(), 0);
    assert!(!h.supervisor.is_running().await);
}

#[tokio::test]
async fn second_startup_does_not_duplicate_schedulers() {
    let h = harness("", false);
    h.supervisor.startup().await;
    let again = h.supervisor.startup().await;
    assert!(matches!(
        again.status_of(StartupStep::LaunchSchedulers),
        Some(StepStatus::Skipped(_))
    ));
    assert_eq!(h.supervisor.shutdown().await.cancelled.len(), 3);
}

#[tokio::test]
async fn shutdown_reports_jobs_left_running() {
    let h = harness("", false);
    h.supervisor.startup().await;
    *h.dispatcher.running.lock().unwrap() = vec![7, 8];

    let report = h.supervisor.shutdown().await;
    assert_eq!(report.cancelled.len(), 3);
    assert_eq!(report.unfinished_jobs, vec![7, 8]);
    // unfinished jobs are not background tasks
    assert_eq!(report.total(), 3);

    assert!(h.supervisor.shutdown().await.unfinished_jobs.is_empty());
}
