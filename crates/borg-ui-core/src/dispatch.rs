//! Default [`Dispatcher`]: runs a configured worker command per schedule kind
//! and tracks it as a job record.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::{Id, JoinError, JoinSet};

use crate::config::DispatchConfig;
use crate::registry::{JobRecord, JobStatus, Registry, ScheduleDefinition, ScheduleKind};
use crate::scheduler::{DispatchError, Dispatcher};

type DispatchResult = std::result::Result<(), DispatchError>;

/// Completion watchers for spawned jobs, keyed to the job each one records.
#[derive(Default)]
struct Watchers {
    set: JoinSet<()>,
    jobs: HashMap<Id, u64>,
}

impl Watchers {
    /// Forget watchers that have already finished.
    fn reap(&mut self) {
        while let Some(joined) = self.set.try_join_next_with_id() {
            self.finished(joined);
        }
    }

    /// An aborted watcher leaves its job running, so it stays tracked.
    fn finished(&mut self, joined: std::result::Result<(Id, ()), JoinError>) {
        match joined {
            Ok((id, ())) => {
                self.jobs.remove(&id);
            }
            Err(e) if e.is_panic() => {
                let job_id = self.jobs.remove(&e.id());
                tracing::warn!(job_id = ?job_id, error = %e, "job watcher panicked");
            }
            Err(_) => {}
        }
    }
}

pub struct CommandDispatcher {
    registry: Arc<dyn Registry>,
    templates: DispatchConfig,
    /// Worker output goes to `<log_dir>/<kind>-<schedule id>-<timestamp>.log`.
    log_dir: Option<PathBuf>,
    watchers: Mutex<Watchers>,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<dyn Registry>, templates: DispatchConfig) -> Self {
        Self {
            registry,
            templates,
            log_dir: None,
            watchers: Mutex::new(Watchers::default()),
        }
    }

    /// Jobs whose completion is still being watched.
    pub async fn in_flight(&self) -> usize {
        let mut watchers = self.watchers.lock().await;
        watchers.reap();
        watchers.jobs.len()
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    async fn output_sink(&self, schedule: &ScheduleDefinition) -> (Stdio, Stdio) {
        let Some(dir) = &self.log_dir else {
            return (Stdio::null(), Stdio::null());
        };
        let path = dir.join(format!(
            "{}-{}-{}.log",
            schedule.kind,
            schedule.id,
            Utc::now().format("%Y%m%dT%H%M%S")
        ));
        let opened = async {
            tokio::fs::create_dir_all(dir).await?;
            let file = tokio::fs::File::create(&path).await?.into_std().await;
            let err = file.try_clone()?;
            Ok::<_, std::io::Error>((Stdio::from(file), Stdio::from(err)))
        };
        match opened.await {
            Ok(sinks) => sinks,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot open job log, discarding output");
                (Stdio::null(), Stdio::null())
            }
        }
    }

    async fn spawn(&self, kind: ScheduleKind, schedule: &ScheduleDefinition) -> DispatchResult {
        let argv = render(self.templates.template_for(kind), schedule);
        let Some((program, args)) = argv.split_first() else {
            return Err(DispatchError::Permanent(format!(
                "no command configured for {kind} schedules"
            )));
        };

        let (stdout, stderr) = self.output_sink(schedule).await;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| DispatchError::Retryable(format!("failed to spawn '{program}': {e}")))?;

        let pid = child.id();
        let mut job = JobRecord::running(kind, schedule.repository.clone(), pid.unwrap_or(0))
            .with_schedule(schedule.id);
        job.pid = pid;

        let job_id = match self.registry.create_job(job).await {
            Ok(id) => id,
            Err(e) => {
                let _ = child.start_kill();
                return Err(DispatchError::Retryable(format!(
                    "could not record job: {e}"
                )));
            }
        };
        tracing::info!(job_id, pid = ?pid, schedule = %schedule.name, kind = %kind, "job started");

        let registry = self.registry.clone();
        let mut watchers = self.watchers.lock().await;
        watchers.reap();
        let handle = watchers.set.spawn(async move {
            let status = match child.wait().await {
                Ok(exit) if exit.success() => JobStatus::Completed,
                Ok(exit) => {
                    tracing::warn!(job_id, code = ?exit.code(), "job exited with failure");
                    JobStatus::Failed
                }
                Err(e) => {
                    tracing::warn!(job_id, error = %e, "lost track of job process");
                    JobStatus::Failed
                }
            };
            if let Err(e) = registry
                .update_job_status(job_id, status, Some(Utc::now()))
                .await
            {
                tracing::warn!(job_id, error = %e, "could not record job completion");
            }
        });
        watchers.jobs.insert(handle.id(), job_id);

        Ok(())
    }
}

#[async_trait]
impl Dispatcher for CommandDispatcher {
    async fn submit_backup_job(&self, schedule: &ScheduleDefinition) -> DispatchResult {
        self.spawn(ScheduleKind::Backup, schedule).await
    }

    async fn submit_check(&self, schedule: &ScheduleDefinition) -> DispatchResult {
        self.spawn(ScheduleKind::Check, schedule).await
    }

    async fn refresh_stats(&self, schedule: &ScheduleDefinition) -> DispatchResult {
        self.spawn(ScheduleKind::Stats, schedule).await
    }

    /// Wait up to `timeout` for running jobs, then stop watching the rest.
    /// Their processes keep running and their records stay `running` until
    /// the next startup reconciles them.
    async fn shutdown(&self, timeout: Duration) -> Vec<u64> {
        let mut watchers = std::mem::take(&mut *self.watchers.lock().await);
        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = watchers.set.join_next_with_id().await {
                watchers.finished(joined);
            }
        })
        .await;
        if drained.is_err() {
            watchers.set.abort_all();
            while let Some(joined) = watchers.set.join_next_with_id().await {
                watchers.finished(joined);
            }
        }

        let mut unfinished: Vec<u64> = watchers.jobs.into_values().collect();
        unfinished.sort_unstable();
        for job_id in &unfinished {
            tracing::warn!(job_id, "job still running at shutdown, left for reconciliation");
        }
        unfinished
    }
}

/// Substitute `{repository}`, `{schedule}` and `{schedule_id}` in each argument.
fn render(template: &[String], schedule: &ScheduleDefinition) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            arg.replace("{repository}", &schedule.repository)
                .replace("{schedule_id}", &schedule.id.to_string())
                .replace("{schedule}", &schedule.name)
        })
        .collect()
}
