//! Periodic schedulers that poll the registry for due schedules and hand
//! them to a [`Dispatcher`].
//!
//! One generic [`Scheduler`] serves backups, consistency checks and stats
//! refreshes; the instances differ only in schedule kind and interval. Each
//! cycle dispatches its due schedules concurrently. Cancellation is checked
//! at the top of every cycle and raced against the inter-cycle sleep.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::registry::{Registry, ScheduleDefinition, ScheduleKind};

// ---------------------------------------------------------------------------
// Dispatch contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Leave the schedule as is and try again next poll.
    #[error("retryable dispatch failure: {0}")]
    Retryable(String),
    /// The schedule can never succeed; stop polling it.
    #[error("permanent dispatch failure: {0}")]
    Permanent(String),
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn submit_backup_job(
        &self,
        schedule: &ScheduleDefinition,
    ) -> std::result::Result<(), DispatchError>;

    async fn submit_check(
        &self,
        schedule: &ScheduleDefinition,
    ) -> std::result::Result<(), DispatchError>;

    async fn refresh_stats(
        &self,
        schedule: &ScheduleDefinition,
    ) -> std::result::Result<(), DispatchError>;

    /// Stop tracking dispatched work, waiting up to `timeout` for it to
    /// finish. Returns the ids of jobs still running afterwards.
    async fn shutdown(&self, _timeout: Duration) -> Vec<u64> {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Polling,
    Dispatching,
    Stopped,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Polling => "polling",
            SchedulerState::Dispatching => "dispatching",
            SchedulerState::Stopped => "stopped",
        })
    }
}

/// Tally of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub due: usize,
    pub dispatched: usize,
    pub retryable: usize,
    pub permanent: usize,
    pub errors: usize,
}

enum Outcome {
    Dispatched,
    Retryable,
    Permanent,
    Error,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    kind: ScheduleKind,
    interval: Duration,
    registry: Arc<dyn Registry>,
    dispatcher: Arc<dyn Dispatcher>,
    state: watch::Sender<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        kind: ScheduleKind,
        interval: Duration,
        registry: Arc<dyn Registry>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            kind,
            interval,
            registry,
            dispatcher,
            state,
        }
    }

    pub fn name(&self) -> &'static str {
        scheduler_name(self.kind)
    }

    pub fn kind(&self) -> ScheduleKind {
        self.kind
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: SchedulerState) {
        self.state.send_replace(next);
    }

    /// Poll until `cancel` fires, then settle in [`SchedulerState::Stopped`].
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        tracing::info!(scheduler = self.name(), interval_secs = self.interval.as_secs(), "scheduler started");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.poll_once(Utc::now()).await {
                Ok(report) if report.due > 0 => {
                    tracing::info!(
                        scheduler = self.name(),
                        due = report.due,
                        dispatched = report.dispatched,
                        retryable = report.retryable,
                        permanent = report.permanent,
                        "poll cycle finished"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(scheduler = self.name(), error = %e, "poll failed, retrying next cycle");
                }
            }
            self.set_state(SchedulerState::Idle);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        self.set_state(SchedulerState::Stopped);
        tracing::info!(scheduler = self.name(), "scheduler stopped");
        Ok(())
    }

    /// Run one cycle as of `now`.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        self.set_state(SchedulerState::Polling);
        let due = self.registry.fetch_due_schedules(self.kind, now).await?;
        let mut report = CycleReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        self.set_state(SchedulerState::Dispatching);
        let outcomes =
            futures::future::join_all(due.iter().map(|s| self.dispatch_one(s, now))).await;
        for outcome in outcomes {
            match outcome {
                Outcome::Dispatched => report.dispatched += 1,
                Outcome::Retryable => report.retryable += 1,
                Outcome::Permanent => report.permanent += 1,
                Outcome::Error => report.errors += 1,
            }
        }
        Ok(report)
    }

    async fn dispatch(
        &self,
        schedule: &ScheduleDefinition,
    ) -> std::result::Result<(), DispatchError> {
        match self.kind {
            ScheduleKind::Backup => self.dispatcher.submit_backup_job(schedule).await,
            ScheduleKind::Check => self.dispatcher.submit_check(schedule).await,
            ScheduleKind::Stats => self.dispatcher.refresh_stats(schedule).await,
        }
    }

    async fn dispatch_one(&self, schedule: &ScheduleDefinition, now: DateTime<Utc>) -> Outcome {
        let result = match schedule.parse_cadence() {
            Ok(_) => self.dispatch(schedule).await,
            Err(e) => Err(DispatchError::Permanent(e.to_string())),
        };

        match result {
            Ok(()) => match self.registry.update_schedule_last_run(schedule.id, now).await {
                Ok(()) => {
                    tracing::debug!(scheduler = self.name(), schedule = %schedule.name, "dispatched");
                    Outcome::Dispatched
                }
                Err(e) => {
                    tracing::error!(
                        scheduler = self.name(),
                        schedule = %schedule.name,
                        error = %e,
                        "dispatched but last run not recorded; may dispatch again"
                    );
                    Outcome::Error
                }
            },
            Err(DispatchError::Retryable(reason)) => {
                tracing::warn!(scheduler = self.name(), schedule = %schedule.name, %reason, "dispatch failed, will retry");
                Outcome::Retryable
            }
            Err(DispatchError::Permanent(reason)) => {
                tracing::error!(scheduler = self.name(), schedule = %schedule.name, %reason, "dispatch failed permanently, disabling schedule");
                if let Err(e) = self.registry.mark_schedule_failed(schedule.id, &reason).await {
                    tracing::warn!(schedule = %schedule.name, error = %e, "could not mark schedule failed");
                    return Outcome::Error;
                }
                Outcome::Permanent
            }
        }
    }
}

pub fn scheduler_name(kind: ScheduleKind) -> &'static str {
    match kind {
        ScheduleKind::Backup => "backup-schedule-checker",
        ScheduleKind::Check => "check-scheduler",
        ScheduleKind::Stats => "stats-refresh-scheduler",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RedbRegistry;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::{Barrier, Notify};

    #[derive(Default)]
    struct RecordingDispatcher {
        calls: Mutex<Vec<String>>,
        failures: HashMap<String, DispatchError>,
        barrier: Option<Barrier>,
        /// Backup dispatches hang until this is notified.
        backup_gate: Option<Notify>,
    }

    impl RecordingDispatcher {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        async fn record(
            &self,
            verb: &str,
            s: &ScheduleDefinition,
        ) -> std::result::Result<(), DispatchError> {
            self.calls.lock().unwrap().push(format!("{verb}:{}", s.name));
            if let (Some(gate), "backup") = (&self.backup_gate, verb) {
                gate.notified().await;
            }
            if let Some(barrier) = &self.barrier {
                barrier.wait().await;
            }
            match self.failures.get(&s.name) {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl Dispatcher for RecordingDispatcher {
        async fn submit_backup_job(
            &self,
            s: &ScheduleDefinition,
        ) -> std::result::Result<(), DispatchError> {
            self.record("backup", s).await
        }

        async fn submit_check(
            &self,
            s: &ScheduleDefinition,
        ) -> std::result::Result<(), DispatchError> {
            self.record("check", s).await
        }

        async fn refresh_stats(
            &self,
            s: &ScheduleDefinition,
        ) -> std::result::Result<(), DispatchError> {
            self.record("stats", s).await
        }
    }

    async fn registry() -> (TempDir, Arc<RedbRegistry>) {
        let dir = TempDir::new().unwrap();
        let reg = RedbRegistry::open(&dir.path().join("r.redb")).unwrap();
        reg.apply_migrations().await.unwrap();
        (dir, Arc::new(reg))
    }

    async fn add_due(reg: &RedbRegistry, name: &str, kind: ScheduleKind, cadence: &str) -> u64 {
        let mut s = ScheduleDefinition::new(name, kind, "/repo", cadence);
        s.created_at = Utc::now() - chrono::Duration::hours(2);
        reg.create_schedule(s).await.unwrap()
    }

    fn scheduler(
        kind: ScheduleKind,
        reg: Arc<RedbRegistry>,
        dispatcher: Arc<RecordingDispatcher>,
    ) -> Scheduler {
        Scheduler::new(kind, Duration::from_secs(3600), reg, dispatcher)
    }

    #[tokio::test]
    async fn due_schedule_dispatches_once_per_occurrence() {
        let (_dir, reg) = registry().await;
        let id = add_due(&reg, "nightly", ScheduleKind::Backup, "0 * * * *").await;
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let sched = scheduler(ScheduleKind::Backup, reg.clone(), dispatcher.clone());

        let now = Utc::now();
        let first = sched.poll_once(now).await.unwrap();
        assert_eq!(first.dispatched, 1);
        let second = sched.poll_once(now + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(second.due, 0);

        assert_eq!(dispatcher.calls(), vec!["backup:nightly".to_string()]);
        assert_eq!(reg.get_schedule(id).await.unwrap().last_run, Some(now));
    }

    #[tokio::test]
    async fn only_own_kind_is_polled() {
        let (_dir, reg) = registry().await;
        add_due(&reg, "verify", ScheduleKind::Check, "0 * * * *").await;
        let dispatcher = Arc::new(RecordingDispatcher::default());

        let backup = scheduler(ScheduleKind::Backup, reg.clone(), dispatcher.clone());
        assert_eq!(backup.poll_once(Utc::now()).await.unwrap().due, 0);

        let check = scheduler(ScheduleKind::Check, reg.clone(), dispatcher.clone());
        assert_eq!(check.poll_once(Utc::now()).await.unwrap().dispatched, 1);
        assert_eq!(dispatcher.calls(), vec!["check:verify".to_string()]);
    }

    #[tokio::test]
    async fn retryable_failure_is_retried_next_poll() {
        let (_dir, reg) = registry().await;
        let id = add_due(&reg, "flaky", ScheduleKind::Backup, "0 * * * *").await;
        let mut d = RecordingDispatcher::default();
        d.failures
            .insert("flaky".into(), DispatchError::Retryable("busy".into()));
        let dispatcher = Arc::new(d);
        let sched = scheduler(ScheduleKind::Backup, reg.clone(), dispatcher.clone());

        assert_eq!(sched.poll_once(Utc::now()).await.unwrap().retryable, 1);
        assert_eq!(sched.poll_once(Utc::now()).await.unwrap().retryable, 1);
        assert_eq!(dispatcher.calls().len(), 2);
        assert_eq!(reg.get_schedule(id).await.unwrap().last_run, None);
    }

    #[tokio::test]
    async fn permanent_failure_disables_schedule() {
        let (_dir, reg) = registry().await;
        let id = add_due(&reg, "broken", ScheduleKind::Stats, "0 * * * *").await;
        let mut d = RecordingDispatcher::default();
        d.failures
            .insert("broken".into(), DispatchError::Permanent("no such repo".into()));
        let dispatcher = Arc::new(d);
        let sched = scheduler(ScheduleKind::Stats, reg.clone(), dispatcher.clone());

        assert_eq!(sched.poll_once(Utc::now()).await.unwrap().permanent, 1);
        assert_eq!(sched.poll_once(Utc::now()).await.unwrap().due, 0);
        let stored = reg.get_schedule(id).await.unwrap();
        assert_eq!(stored.failed.as_deref(), Some("no such repo"));
    }

    #[tokio::test]
    async fn malformed_cadence_fails_without_dispatch() {
        let (_dir, reg) = registry().await;
        let id = add_due(&reg, "typo", ScheduleKind::Backup, "every day at noon").await;
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let sched = scheduler(ScheduleKind::Backup, reg.clone(), dispatcher.clone());

        let report = sched.poll_once(Utc::now()).await.unwrap();
        assert_eq!(report.permanent, 1);
        assert!(dispatcher.calls().is_empty());
        assert!(reg.get_schedule(id).await.unwrap().failed.is_some());
    }

    #[tokio::test]
    async fn mixed_cycle_records_only_successful_runs() {
        let (_dir, reg) = registry().await;
        let ok = add_due(&reg, "ok", ScheduleKind::Backup, "0 * * * *").await;
        let flaky = add_due(&reg, "flaky", ScheduleKind::Backup, "0 * * * *").await;
        let broken = add_due(&reg, "broken", ScheduleKind::Backup, "0 * * * *").await;
        let mut d = RecordingDispatcher::default();
        d.failures
            .insert("flaky".into(), DispatchError::Retryable("lock held".into()));
        d.failures
            .insert("broken".into(), DispatchError::Permanent("repo missing".into()));
        let dispatcher = Arc::new(d);
        let sched = scheduler(ScheduleKind::Backup, reg.clone(), dispatcher.clone());

        let now = Utc::now();
        let report = sched.poll_once(now).await.unwrap();
        assert_eq!(report.due, 3);
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.retryable, 1);
        assert_eq!(report.permanent, 1);
        assert_eq!(report.errors, 0);

        let stored_ok = reg.get_schedule(ok).await.unwrap();
        assert_eq!(stored_ok.last_run, Some(now));
        assert_eq!(stored_ok.failed, None);
        let stored_flaky = reg.get_schedule(flaky).await.unwrap();
        assert_eq!(stored_flaky.last_run, None);
        assert_eq!(stored_flaky.failed, None);
        let stored_broken = reg.get_schedule(broken).await.unwrap();
        assert_eq!(stored_broken.last_run, None);
        assert_eq!(stored_broken.failed.as_deref(), Some("repo missing"));

        // only the retryable item comes back
        let again = sched.poll_once(now).await.unwrap();
        assert_eq!(again.due, 1);
        assert_eq!(again.retryable, 1);
        let mut calls = dispatcher.calls();
        calls.sort();
        assert_eq!(
            calls,
            vec!["backup:broken", "backup:flaky", "backup:flaky", "backup:ok"]
        );
    }

    #[tokio::test]
    async fn slow_backup_does_not_delay_check() {
        let (_dir, reg) = registry().await;
        add_due(&reg, "nightly", ScheduleKind::Backup, "0 * * * *").await;
        let verify = add_due(&reg, "verify", ScheduleKind::Check, "0 * * * *").await;
        let dispatcher = Arc::new(RecordingDispatcher {
            backup_gate: Some(Notify::new()),
            ..Default::default()
        });
        let backup = Arc::new(scheduler(ScheduleKind::Backup, reg.clone(), dispatcher.clone()));
        let check = Arc::new(scheduler(ScheduleKind::Check, reg.clone(), dispatcher.clone()));

        let cancel = CancellationToken::new();
        let backup_task = tokio::spawn(backup.clone().run(cancel.clone()));
        let mut backup_state = backup.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            backup_state.wait_for(|s| *s == SchedulerState::Dispatching),
        )
        .await
        .expect("backup never started dispatching")
        .unwrap();

        let check_task = tokio::spawn(check.clone().run(cancel.clone()));
        let checked = async {
            while reg.get_schedule(verify).await.unwrap().last_run.is_none() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), checked)
            .await
            .expect("check cycle was held up by the backup dispatch");
        assert_eq!(dispatcher.calls().len(), 2);
        assert_eq!(backup.state(), SchedulerState::Dispatching);

        if let Some(gate) = &dispatcher.backup_gate {
            gate.notify_one();
        }
        cancel.cancel();
        for task in [backup_task, check_task] {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("scheduler did not stop")
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn due_items_dispatch_concurrently() {
        let (_dir, reg) = registry().await;
        add_due(&reg, "a", ScheduleKind::Backup, "0 * * * *").await;
        add_due(&reg, "b", ScheduleKind::Backup, "0 * * * *").await;
        // both dispatches must be in flight at once to pass the barrier
        let dispatcher = Arc::new(RecordingDispatcher {
            barrier: Some(Barrier::new(2)),
            ..Default::default()
        });
        let sched = scheduler(ScheduleKind::Backup, reg.clone(), dispatcher.clone());

        let report = tokio::time::timeout(Duration::from_secs(5), sched.poll_once(Utc::now()))
            .await
            .expect("dispatches were serialized")
            .unwrap();
        assert_eq!(report.dispatched, 2);
    }

    #[tokio::test]
    async fn cancel_during_sleep_stops_without_another_poll() {
        let (_dir, reg) = registry().await;
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let sched = Arc::new(scheduler(ScheduleKind::Backup, reg.clone(), dispatcher));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(sched.clone().run(cancel.clone()));
        // let the first (empty) cycle finish, then add work a second poll would pick up
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sched.state(), SchedulerState::Idle);
        add_due(&reg, "late", ScheduleKind::Backup, "0 * * * *").await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap()
            .unwrap();

        assert_eq!(sched.state(), SchedulerState::Stopped);
        let stored = reg.list_schedules().await.unwrap();
        assert_eq!(stored[0].last_run, None);
    }

    #[tokio::test]
    async fn cancelled_before_start_never_polls() {
        let (_dir, reg) = registry().await;
        add_due(&reg, "nightly", ScheduleKind::Backup, "0 * * * *").await;
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let sched = Arc::new(scheduler(ScheduleKind::Backup, reg, dispatcher.clone()));

        let cancel = CancellationToken::new();
        cancel.cancel();
        sched.clone().run(cancel).await.unwrap();
        assert!(dispatcher.calls().is_empty());
        assert_eq!(sched.state(), SchedulerState::Stopped);
    }
}
