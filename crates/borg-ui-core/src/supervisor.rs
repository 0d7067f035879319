//! Lifecycle supervisor: best-effort startup sequence and graceful shutdown.
//!
//! Startup runs a fixed sequence of steps. A failing step is recorded in the
//! [`StartupReport`] and logged, and the sequence moves on; the process is
//! meant to come up in a degraded state rather than not at all. The three
//! schedulers are launched last into a [`TaskGroup`] the supervisor owns until
//! shutdown consumes it.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::admin::AdminBootstrap;
use crate::cache::ReconfigureOutcome;
use crate::config::{AppConfig, SchedulerConfig};
use crate::error::{BorgUiError, Result};
use crate::reconcile::{JobReconcileReport, MountReconcileReport};
use crate::registry::ScheduleKind;
use crate::scheduler::{Scheduler, SchedulerState};
use crate::services::Services;
use crate::task_group::{ShutdownReport, TaskGroup};

// ---------------------------------------------------------------------------
// Lifecycle hooks
// ---------------------------------------------------------------------------

/// The only entry points the HTTP server and CLI call.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn on_process_start(&self) -> StartupReport;

    async fn on_process_stop(&self) -> ShutdownReport;
}

// ---------------------------------------------------------------------------
// Startup report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupStep {
    Migrations,
    AdminBootstrap,
    CacheConfiguration,
    SystemInfo,
    LogRotation,
    ReconcileJobs,
    ReconcileMounts,
    LaunchSchedulers,
}

impl StartupStep {
    pub fn as_str(self) -> &'static str {
        match self {
            StartupStep::Migrations => "migrations",
            StartupStep::AdminBootstrap => "admin_bootstrap",
            StartupStep::CacheConfiguration => "cache_configuration",
            StartupStep::SystemInfo => "system_info",
            StartupStep::LogRotation => "log_rotation",
            StartupStep::ReconcileJobs => "reconcile_jobs",
            StartupStep::ReconcileMounts => "reconcile_mounts",
            StartupStep::LaunchSchedulers => "launch_schedulers",
        }
    }
}

impl fmt::Display for StartupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub step: StartupStep,
    pub outcome: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StartupReport {
    pub steps: Vec<StepOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<ReconfigureOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<JobReconcileReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mounts: Option<MountReconcileReport>,
}

impl StartupReport {
    pub fn status_of(&self, step: StartupStep) -> Option<&StepStatus> {
        self.steps
            .iter()
            .find(|s| s.step == step)
            .map(|s| &s.outcome)
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepStatus::Failed(_)))
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    fn record(&mut self, step: StartupStep, result: Result<String>) {
        match result {
            Ok(detail) => {
                tracing::info!(step = %step, %detail, "startup step succeeded");
                self.steps.push(StepOutcome {
                    step,
                    outcome: StepStatus::Succeeded,
                    detail: Some(detail),
                });
            }
            Err(e) => {
                tracing::warn!(step = %step, error = %e, "startup step failed, continuing");
                self.steps.push(StepOutcome {
                    step,
                    outcome: StepStatus::Failed(e.to_string()),
                    detail: None,
                });
            }
        }
    }

    fn skip(&mut self, step: StartupStep, reason: &str) {
        tracing::info!(step = %step, reason, "startup step skipped");
        self.steps.push(StepOutcome {
            step,
            outcome: StepStatus::Skipped(reason.to_string()),
            detail: None,
        });
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub schedulers: SchedulerConfig,
    pub verify_attempts: u32,
    pub verify_delay: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from(&AppConfig::new("."))
    }
}

impl From<&AppConfig> for SupervisorConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            schedulers: config.schedulers.clone(),
            verify_attempts: config.reconciler.verify_attempts,
            verify_delay: config.verify_delay(),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerSnapshot {
    pub name: String,
    pub kind: ScheduleKind,
    pub state: SchedulerState,
    pub interval_secs: u64,
}

pub struct Supervisor {
    services: Services,
    config: SupervisorConfig,
    tasks: Mutex<Option<TaskGroup>>,
    schedulers: RwLock<Vec<Arc<Scheduler>>>,
}

impl Supervisor {
    pub fn new(services: Services, config: SupervisorConfig) -> Self {
        Self {
            services,
            config,
            tasks: Mutex::new(None),
            schedulers: RwLock::new(Vec::new()),
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Names, kinds and current states of the launched schedulers.
    pub fn scheduler_states(&self) -> Vec<SchedulerSnapshot> {
        self.schedulers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|s| SchedulerSnapshot {
                name: s.name().to_string(),
                kind: s.kind(),
                state: s.state(),
                interval_secs: s.interval().as_secs(),
            })
            .collect()
    }

    pub async fn is_running(&self) -> bool {
        self.tasks.lock().await.is_some()
    }

    /// Run every startup step in order. Never fails; see [`StartupReport`].
    pub async fn startup(&self) -> StartupReport {
        let mut report = StartupReport::default();
        let hk = &self.services.housekeeping;

        report.record(
            StartupStep::Migrations,
            hk.apply_migrations()
                .await
                .map(|n| format!("{n} migration(s) applied")),
        );

        report.record(
            StartupStep::AdminBootstrap,
            hk.bootstrap_admin().await.map(|outcome| match outcome {
                AdminBootstrap::AlreadyPresent => "users present".to_string(),
                AdminBootstrap::Created { username, .. } => format!("created '{username}'"),
            }),
        );

        let cache_step = match self.services.settings.fetch_cache_config().await {
            Ok(config) => {
                let outcome = self.services.cache.apply(&config).await;
                let result = match &outcome.fallback_reason {
                    None => Ok(format!("{} ({})", outcome.backend, outcome.connection_info)),
                    Some(reason) => Err(BorgUiError::Cache(format!(
                        "using in-process fallback: {reason}"
                    ))),
                };
                report.cache = Some(outcome);
                result
            }
            Err(e) => Err(e),
        };
        report.record(StartupStep::CacheConfiguration, cache_step);

        report.record(
            StartupStep::SystemInfo,
            hk.load_system_info().await.map(|info| {
                format!(
                    "borg {}",
                    info.borg_version.as_deref().unwrap_or("unknown")
                )
            }),
        );

        match self.services.settings.fetch_log_cleanup_policy().await {
            Ok(true) => {
                let rotated = match self.services.settings.fetch_log_retention().await {
                    Ok(retention) => hk.rotate_logs(retention).await,
                    Err(e) => Err(e),
                };
                report.record(
                    StartupStep::LogRotation,
                    rotated.map(|r| format!("{} file(s) removed", r.removed)),
                );
            }
            Ok(false) => report.skip(StartupStep::LogRotation, "log cleanup on startup disabled"),
            Err(e) => report.record(StartupStep::LogRotation, Err(e)),
        }

        let reconciler = self
            .services
            .reconciler(self.config.verify_attempts, self.config.verify_delay);
        let jobs = match reconciler.reconcile_jobs().await {
            Ok(r) => {
                let detail = format!(
                    "{} checked, {} orphaned, {} unverified",
                    r.checked,
                    r.orphaned.len(),
                    r.unverified.len()
                );
                report.jobs = Some(r);
                Ok(detail)
            }
            Err(e) => Err(e),
        };
        report.record(StartupStep::ReconcileJobs, jobs);

        let mounts = match reconciler.reconcile_mounts().await {
            Ok(r) => {
                let detail = format!(
                    "{} checked, {} stale, {} unverified",
                    r.checked,
                    r.stale.len(),
                    r.unverified.len()
                );
                report.mounts = Some(r);
                Ok(detail)
            }
            Err(e) => Err(e),
        };
        report.record(StartupStep::ReconcileMounts, mounts);

        self.launch_schedulers(&mut report).await;

        if report.is_clean() {
            tracing::info!(steps = report.steps.len(), "startup complete");
        } else {
            tracing::warn!(
                failed = report.failures().count(),
                "startup complete with failures"
            );
        }
        report
    }

    async fn launch_schedulers(&self, report: &mut StartupReport) {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            report.skip(StartupStep::LaunchSchedulers, "schedulers already running");
            return;
        }

        let mut group = TaskGroup::new();
        let mut launched = Vec::with_capacity(ScheduleKind::all().len());
        for kind in ScheduleKind::all() {
            let scheduler = Arc::new(Scheduler::new(
                *kind,
                self.config.schedulers.interval_for(*kind),
                self.services.registry.clone(),
                self.services.dispatcher.clone(),
            ));
            let runner = scheduler.clone();
            group.spawn(scheduler.name(), move |cancel| runner.run(cancel));
            launched.push(scheduler);
        }

        let names = group.names().join(", ");
        *self
            .schedulers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = launched;
        *tasks = Some(group);
        report.record(StartupStep::LaunchSchedulers, Ok(names));
    }

    /// Cancel and join every background task. Safe to call before startup,
    /// after a partial startup, and more than once.
    pub async fn shutdown(&self) -> ShutdownReport {
        let group = self.tasks.lock().await.take();
        let mut report = match group {
            Some(mut group) => {
                let report = group.shutdown(self.config.shutdown_timeout).await;
                tracing::info!(
                    cancelled = report.cancelled.len(),
                    failed = report.failures.len(),
                    timed_out = report.timed_out.len(),
                    "background tasks stopped"
                );
                report
            }
            None => {
                tracing::debug!("no background tasks to stop");
                ShutdownReport::default()
            }
        };

        // schedulers are stopped, so nothing new is dispatched past this point
        report.unfinished_jobs = self
            .services
            .dispatcher
            .shutdown(self.config.shutdown_timeout)
            .await;
        if !report.unfinished_jobs.is_empty() {
            tracing::warn!(
                jobs = ?report.unfinished_jobs,
                "jobs still running at shutdown"
            );
        }
        report
    }
}

#[async_trait]
impl Lifecycle for Supervisor {
    async fn on_process_start(&self) -> StartupReport {
        self.startup().await
    }

    async fn on_process_stop(&self) -> ShutdownReport {
        self.shutdown().await
    }
}
