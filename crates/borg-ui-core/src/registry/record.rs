//! Persisted records the orchestration layer reads and writes.
//!
//! Job and mount records describe OS-level resources the application created;
//! schedule definitions describe recurring work. All three are stored as JSON
//! by [`RedbRegistry`](super::RedbRegistry).

use crate::error::{BorgUiError, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// ScheduleKind
// ---------------------------------------------------------------------------

/// The kind of work a schedule (and the jobs it spawns) performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Backup,
    Check,
    Stats,
}

impl ScheduleKind {
    pub fn all() -> &'static [ScheduleKind] {
        &[ScheduleKind::Backup, ScheduleKind::Check, ScheduleKind::Stats]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleKind::Backup => "backup",
            ScheduleKind::Check => "check",
            ScheduleKind::Stats => "stats",
        }
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleKind {
    type Err = BorgUiError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "backup" => Ok(ScheduleKind::Backup),
            "check" => Ok(ScheduleKind::Check),
            "stats" => Ok(ScheduleKind::Stats),
            other => Err(BorgUiError::Registry(format!(
                "unknown schedule kind: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// JobStatus / JobRecord
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
///
/// Transitions: `Pending → Running → Completed | Failed | Orphaned`.
/// The three terminal states are sticky: the registry refuses to move a job
/// out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Orphaned,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Orphaned
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Orphaned => "orphaned",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A spawned backup, check or stats operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Assigned by the registry when created with `0`.
    pub id: u64,
    pub kind: ScheduleKind,
    pub repository: String,
    pub pid: Option<u32>,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub schedule_id: Option<u64>,
}

impl JobRecord {
    /// A job whose process has just been spawned.
    pub fn running(kind: ScheduleKind, repository: impl Into<String>, pid: u32) -> Self {
        Self {
            id: 0,
            kind,
            repository: repository.into(),
            pid: Some(pid),
            status: JobStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            schedule_id: None,
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn with_schedule(mut self, schedule_id: u64) -> Self {
        self.schedule_id = Some(schedule_id);
        self
    }
}

// ---------------------------------------------------------------------------
// MountStatus / MountRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountStatus {
    Active,
    Stale,
}

impl MountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MountStatus::Active => "active",
            MountStatus::Stale => "stale",
        }
    }
}

impl fmt::Display for MountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An archive mounted for browsing or restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountRecord {
    pub id: u64,
    pub path: PathBuf,
    pub repository: String,
    pub created_at: DateTime<Utc>,
    pub status: MountStatus,
}

impl MountRecord {
    pub fn active(path: impl Into<PathBuf>, repository: impl Into<String>) -> Self {
        Self {
            id: 0,
            path: path.into(),
            repository: repository.into(),
            created_at: Utc::now(),
            status: MountStatus::Active,
        }
    }
}

// ---------------------------------------------------------------------------
// ScheduleDefinition
// ---------------------------------------------------------------------------

/// A recurring unit of work with a cron cadence.
///
/// Due when the first cadence occurrence after `last_run` (or `created_at`
/// for a schedule that never ran) is at or before now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub id: u64,
    pub name: String,
    pub kind: ScheduleKind,
    pub repository: String,
    /// Cron expression. Five-field expressions get a leading seconds field.
    pub cadence: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Set when dispatch failed permanently; such schedules are not polled.
    #[serde(default)]
    pub failed: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl ScheduleDefinition {
    pub fn new(
        name: impl Into<String>,
        kind: ScheduleKind,
        repository: impl Into<String>,
        cadence: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            kind,
            repository: repository.into(),
            cadence: cadence.into(),
            enabled: true,
            last_run: None,
            created_at: Utc::now(),
            failed: None,
        }
    }

    /// Enabled and not permanently failed.
    pub fn is_pollable(&self) -> bool {
        self.enabled && self.failed.is_none()
    }

    pub fn parse_cadence(&self) -> Result<Schedule> {
        parse_cadence(&self.cadence)
    }

    /// The occurrence this schedule is waiting for.
    pub fn next_due(&self) -> Result<DateTime<Utc>> {
        let anchor = self.last_run.unwrap_or(self.created_at);
        self.parse_cadence()?
            .after(&anchor)
            .next()
            .ok_or_else(|| BorgUiError::InvalidCadence {
                expr: self.cadence.clone(),
                reason: "no upcoming occurrence".into(),
            })
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> Result<bool> {
        Ok(self.next_due()? <= now)
    }
}

/// Parse a cron expression, accepting the classic five-field form.
pub fn parse_cadence(expr: &str) -> Result<Schedule> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| BorgUiError::InvalidCadence {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
