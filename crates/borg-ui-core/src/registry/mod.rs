//! Process/mount registry: durable job, mount and schedule records.
//!
//! [`Registry`] is the narrow read/write contract the orchestration layer
//! consumes; [`RedbRegistry`] is the bundled implementation.

pub mod db;
pub mod migrations;
pub mod record;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

pub use db::{RedbRegistry, UserRecord};
pub use record::{
    parse_cadence, JobRecord, JobStatus, MountRecord, MountStatus, ScheduleDefinition,
    ScheduleKind,
};

#[async_trait]
pub trait Registry: Send + Sync {
    async fn fetch_running_jobs(&self) -> Result<Vec<JobRecord>>;

    async fn fetch_active_mounts(&self) -> Result<Vec<MountRecord>>;

    /// Move a job to `status`. Returns `false` without writing when the job is
    /// already terminal or already has that status.
    async fn update_job_status(
        &self,
        id: u64,
        status: JobStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// Returns `false` when the mount already has `status`.
    async fn update_mount_status(&self, id: u64, status: MountStatus) -> Result<bool>;

    /// Pollable schedules of `kind` that are due at `now`. Schedules whose
    /// cadence cannot be evaluated are included so the caller can fail them.
    async fn fetch_due_schedules(
        &self,
        kind: ScheduleKind,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleDefinition>>;

    async fn update_schedule_last_run(&self, id: u64, at: DateTime<Utc>) -> Result<()>;

    /// Exclude a schedule from future polling.
    async fn mark_schedule_failed(&self, id: u64, reason: &str) -> Result<()>;

    /// Insert a job; an `id` of 0 is replaced by the next free id.
    async fn create_job(&self, job: JobRecord) -> Result<u64>;

    async fn create_mount(&self, mount: MountRecord) -> Result<u64>;

    async fn create_schedule(&self, schedule: ScheduleDefinition) -> Result<u64>;
}
