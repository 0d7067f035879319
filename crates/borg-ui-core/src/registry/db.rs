//! Persistent job/mount/schedule registry using redb.
//!
//! # Table design
//!
//! ```text
//! jobs       u64  -> JSON JobRecord
//! mounts     u64  -> JSON MountRecord
//! schedules  u64  -> JSON ScheduleDefinition
//! users      &str -> JSON UserRecord
//! meta       &str -> u64   (schema_version, id sequences)
//! ```
//!
//! redb transactions are blocking, so every [`Registry`] method hops onto the
//! blocking pool. Reads against a table that does not exist yet (migrations
//! not applied) return empty results instead of failing.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition, TableError, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{BorgUiError, Result};

use super::migrations;
use super::record::{
    JobRecord, JobStatus, MountRecord, MountStatus, ScheduleDefinition, ScheduleKind,
};
use super::Registry;

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

/// Every record table maps a `u64` id to a JSON document.
type JsonTable = TableDefinition<'static, u64, &'static [u8]>;

pub(crate) const JOBS: JsonTable = TableDefinition::new("jobs");
pub(crate) const MOUNTS: JsonTable = TableDefinition::new("mounts");
pub(crate) const SCHEDULES: JsonTable = TableDefinition::new("schedules");
pub(crate) const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");
pub(crate) const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const JOB_SEQ: &str = "seq:jobs";
const MOUNT_SEQ: &str = "seq:mounts";
const SCHEDULE_SEQ: &str = "seq:schedules";

pub(crate) fn reg_err(e: impl std::fmt::Display) -> BorgUiError {
    BorgUiError::Registry(e.to_string())
}

// ---------------------------------------------------------------------------
// UserRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    /// `base64(salt)$base64(sha256(salt ++ password))`
    pub password_hash: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Sync helpers (run inside spawn_blocking)
// ---------------------------------------------------------------------------

/// Read every JSON value of a `u64`-keyed table.
fn read_all<T: DeserializeOwned>(db: &Database, def: JsonTable) -> Result<Vec<T>> {
    let rt = db.begin_read().map_err(reg_err)?;
    let table = match rt.open_table(def) {
        Ok(t) => t,
        Err(TableError::TableDoesNotExist(_)) => return Ok(vec![]),
        Err(e) => return Err(reg_err(e)),
    };
    let mut result = Vec::new();
    for entry in table.iter().map_err(reg_err)? {
        let (_, v) = entry.map_err(reg_err)?;
        result.push(serde_json::from_slice(v.value())?);
    }
    Ok(result)
}

fn read_one<T: DeserializeOwned>(
    db: &Database,
    def: JsonTable,
    id: u64,
) -> Result<Option<T>> {
    let rt = db.begin_read().map_err(reg_err)?;
    let table = match rt.open_table(def) {
        Ok(t) => t,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(e) => return Err(reg_err(e)),
    };
    let value = table.get(id).map_err(reg_err)?;
    match value {
        Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
        None => Ok(None),
    }
}

/// Allocate an id from `seq`, or advance `seq` past an explicit one.
fn claim_id(wt: &WriteTransaction, seq: &str, requested: u64) -> Result<u64> {
    let mut meta = wt.open_table(META).map_err(reg_err)?;
    let last = meta.get(seq).map_err(reg_err)?.map(|v| v.value()).unwrap_or(0);
    let id = if requested == 0 { last + 1 } else { requested };
    if id > last {
        meta.insert(seq, id).map_err(reg_err)?;
    }
    Ok(id)
}

fn insert_json<T: Serialize>(
    db: &Database,
    def: JsonTable,
    seq: &str,
    requested: u64,
    assign: impl FnOnce(&mut T, u64),
    mut record: T,
) -> Result<u64> {
    let wt = db.begin_write().map_err(reg_err)?;
    let id = claim_id(&wt, seq, requested)?;
    assign(&mut record, id);
    let value = serde_json::to_vec(&record)?;
    {
        let mut table = wt.open_table(def).map_err(reg_err)?;
        table.insert(id, value.as_slice()).map_err(reg_err)?;
    }
    wt.commit().map_err(reg_err)?;
    Ok(id)
}

/// Read-modify-write a single record in one transaction.
///
/// `f` returns whether it changed the record; unchanged records are not
/// rewritten. `Ok(None)` means the record does not exist.
fn modify<T, F>(db: &Database, def: JsonTable, id: u64, f: F) -> Result<Option<bool>>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce(&mut T) -> bool,
{
    let wt = db.begin_write().map_err(reg_err)?;
    let changed = {
        let mut table = wt.open_table(def).map_err(reg_err)?;
        let current: Option<T> = match table.get(id).map_err(reg_err)? {
            Some(v) => Some(serde_json::from_slice(v.value())?),
            None => None,
        };
        let Some(mut record) = current else {
            return Ok(None);
        };
        let changed = f(&mut record);
        if changed {
            let value = serde_json::to_vec(&record)?;
            table.insert(id, value.as_slice()).map_err(reg_err)?;
        }
        changed
    };
    if changed {
        wt.commit().map_err(reg_err)?;
    } else {
        wt.abort().map_err(reg_err)?;
    }
    Ok(Some(changed))
}

// ---------------------------------------------------------------------------
// RedbRegistry
// ---------------------------------------------------------------------------

/// redb-backed [`Registry`]. Cheap to clone.
#[derive(Clone)]
pub struct RedbRegistry {
    db: Arc<Database>,
}

impl RedbRegistry {
    /// Open or create the registry database at `path`.
    ///
    /// Does not create tables; call [`RedbRegistry::apply_migrations`].
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(reg_err)?;
        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    pub async fn apply_migrations(&self) -> Result<u32> {
        self.blocking(migrations::apply_migrations).await
    }

    pub async fn schema_version(&self) -> Result<u64> {
        self.blocking(migrations::schema_version).await
    }

    // -----------------------------------------------------------------------
    // Listing
    // -----------------------------------------------------------------------

    pub async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        self.blocking(|db| read_all(db, JOBS)).await
    }

    pub async fn list_mounts(&self) -> Result<Vec<MountRecord>> {
        self.blocking(|db| read_all(db, MOUNTS)).await
    }

    pub async fn list_schedules(&self) -> Result<Vec<ScheduleDefinition>> {
        self.blocking(|db| read_all(db, SCHEDULES)).await
    }

    pub async fn get_job(&self, id: u64) -> Result<JobRecord> {
        self.blocking(move |db| read_one(db, JOBS, id))
            .await?
            .ok_or(BorgUiError::JobNotFound(id))
    }

    pub async fn get_mount(&self, id: u64) -> Result<MountRecord> {
        self.blocking(move |db| read_one(db, MOUNTS, id))
            .await?
            .ok_or(BorgUiError::MountNotFound(id))
    }

    pub async fn get_schedule(&self, id: u64) -> Result<ScheduleDefinition> {
        self.blocking(move |db| read_one(db, SCHEDULES, id))
            .await?
            .ok_or(BorgUiError::ScheduleNotFound(id))
    }

    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    pub async fn has_users(&self) -> Result<bool> {
        self.blocking(|db| {
            let rt = db.begin_read().map_err(reg_err)?;
            let table = match rt.open_table(USERS) {
                Ok(t) => t,
                Err(TableError::TableDoesNotExist(_)) => return Ok(false),
                Err(e) => return Err(reg_err(e)),
            };
            let mut iter = table.iter().map_err(reg_err)?;
            let any = iter.next().is_some();
            Ok(any)
        })
        .await
    }

    /// Insert `user` unless a user with that name exists. Returns whether it
    /// was inserted.
    pub async fn insert_user(&self, user: UserRecord) -> Result<bool> {
        self.blocking(move |db| {
            let value = serde_json::to_vec(&user)?;
            let wt = db.begin_write().map_err(reg_err)?;
            let inserted = {
                let mut table = wt.open_table(USERS).map_err(reg_err)?;
                let exists = table
                    .get(user.username.as_str())
                    .map_err(reg_err)?
                    .is_some();
                if !exists {
                    table
                        .insert(user.username.as_str(), value.as_slice())
                        .map_err(reg_err)?;
                }
                !exists
            };
            wt.commit().map_err(reg_err)?;
            Ok(inserted)
        })
        .await
    }

    pub async fn get_user(&self, username: &str) -> Result<Option<UserRecord>> {
        let username = username.to_string();
        self.blocking(move |db| {
            let rt = db.begin_read().map_err(reg_err)?;
            let table = match rt.open_table(USERS) {
                Ok(t) => t,
                Err(TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(e) => return Err(reg_err(e)),
            };
            let value = table.get(username.as_str()).map_err(reg_err)?;
            match value {
                Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
                None => Ok(None),
            }
        })
        .await
    }
}

#[async_trait]
impl Registry for RedbRegistry {
    async fn fetch_running_jobs(&self) -> Result<Vec<JobRecord>> {
        let jobs = self.list_jobs().await?;
        Ok(jobs
            .into_iter()
            .filter(|j| j.status == JobStatus::Running)
            .collect())
    }

    async fn fetch_active_mounts(&self) -> Result<Vec<MountRecord>> {
        let mounts = self.list_mounts().await?;
        Ok(mounts
            .into_iter()
            .filter(|m| m.status == MountStatus::Active)
            .collect())
    }

    async fn update_job_status(
        &self,
        id: u64,
        status: JobStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.blocking(move |db| {
            modify(db, JOBS, id, |job: &mut JobRecord| {
                if job.status.is_terminal() || job.status == status {
                    return false;
                }
                job.status = status;
                if ended_at.is_some() {
                    job.ended_at = ended_at;
                }
                true
            })
        })
        .await?
        .ok_or(BorgUiError::JobNotFound(id))
    }

    async fn update_mount_status(&self, id: u64, status: MountStatus) -> Result<bool> {
        self.blocking(move |db| {
            modify(db, MOUNTS, id, |mount: &mut MountRecord| {
                if mount.status == status {
                    return false;
                }
                mount.status = status;
                true
            })
        })
        .await?
        .ok_or(BorgUiError::MountNotFound(id))
    }

    async fn fetch_due_schedules(
        &self,
        kind: ScheduleKind,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleDefinition>> {
        let schedules = self.list_schedules().await?;
        Ok(schedules
            .into_iter()
            .filter(|s| s.kind == kind && s.is_pollable())
            // An unparseable cadence is surfaced so the scheduler can fail it.
            .filter(|s| !matches!(s.is_due(now), Ok(false)))
            .collect())
    }

    async fn update_schedule_last_run(&self, id: u64, at: DateTime<Utc>) -> Result<()> {
        self.blocking(move |db| {
            modify(db, SCHEDULES, id, |s: &mut ScheduleDefinition| {
                s.last_run = Some(at);
                true
            })
        })
        .await?
        .map(|_| ())
        .ok_or(BorgUiError::ScheduleNotFound(id))
    }

    async fn mark_schedule_failed(&self, id: u64, reason: &str) -> Result<()> {
        let reason = reason.to_string();
        self.blocking(move |db| {
            modify(db, SCHEDULES, id, |s: &mut ScheduleDefinition| {
                s.failed = Some(reason);
                true
            })
        })
        .await?
        .map(|_| ())
        .ok_or(BorgUiError::ScheduleNotFound(id))
    }

    async fn create_job(&self, job: JobRecord) -> Result<u64> {
        self.blocking(move |db| {
            let requested = job.id;
            insert_json(db, JOBS, JOB_SEQ, requested, |j: &mut JobRecord, id| j.id = id, job)
        })
        .await
    }

    async fn create_mount(&self, mount: MountRecord) -> Result<u64> {
        self.blocking(move |db| {
            let requested = mount.id;
            insert_json(
                db,
                MOUNTS,
                MOUNT_SEQ,
                requested,
                |m: &mut MountRecord, id| m.id = id,
                mount,
            )
        })
        .await
    }

    async fn create_schedule(&self, schedule: ScheduleDefinition) -> Result<u64> {
        self.blocking(move |db| {
            let requested = schedule.id;
            insert_json(
                db,
                SCHEDULES,
                SCHEDULE_SEQ,
                requested,
                |s: &mut ScheduleDefinition, id| s.id = id,
                schedule,
            )
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as CDur;
    use tempfile::TempDir;

    async fn open_tmp() -> (TempDir, RedbRegistry) {
        let dir = TempDir::new().unwrap();
        let registry = RedbRegistry::open(&dir.path().join("registry.redb")).unwrap();
        registry.apply_migrations().await.unwrap();
        (dir, registry)
    }

    #[tokio::test]
    async fn reads_before_migrations_are_empty() {
        let dir = TempDir::new().unwrap();
        let registry = RedbRegistry::open(&dir.path().join("registry.redb")).unwrap();
        assert!(registry.fetch_running_jobs().await.unwrap().is_empty());
        assert!(registry.fetch_active_mounts().await.unwrap().is_empty());
        assert!(!registry.has_users().await.unwrap());
    }

    #[tokio::test]
    async fn create_job_assigns_sequential_ids() {
        let (_dir, registry) = open_tmp().await;
        let a = registry
            .create_job(JobRecord::running(ScheduleKind::Backup, "/repo", 100))
            .await
            .unwrap();
        let b = registry
            .create_job(JobRecord::running(ScheduleKind::Check, "/repo", 101))
            .await
            .unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(registry.get_job(b).await.unwrap().pid, Some(101));
    }

    #[tokio::test]
    async fn explicit_id_advances_sequence() {
        let (_dir, registry) = open_tmp().await;
        let job = JobRecord::running(ScheduleKind::Backup, "/repo", 1).with_id(42);
        assert_eq!(registry.create_job(job).await.unwrap(), 42);
        let next = registry
            .create_job(JobRecord::running(ScheduleKind::Backup, "/repo", 2))
            .await
            .unwrap();
        assert_eq!(next, 43);
    }

    #[tokio::test]
    async fn fetch_running_jobs_filters_by_status() {
        let (_dir, registry) = open_tmp().await;
        let running = registry
            .create_job(JobRecord::running(ScheduleKind::Backup, "/repo", 10))
            .await
            .unwrap();
        let done = registry
            .create_job(JobRecord::running(ScheduleKind::Backup, "/repo", 11))
            .await
            .unwrap();
        registry
            .update_job_status(done, JobStatus::Completed, Some(Utc::now()))
            .await
            .unwrap();

        let jobs = registry.fetch_running_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, running);
    }

    #[tokio::test]
    async fn terminal_job_status_is_sticky() {
        let (_dir, registry) = open_tmp().await;
        let id = registry
            .create_job(JobRecord::running(ScheduleKind::Backup, "/repo", 10))
            .await
            .unwrap();
        assert!(registry
            .update_job_status(id, JobStatus::Completed, Some(Utc::now()))
            .await
            .unwrap());
        assert!(!registry
            .update_job_status(id, JobStatus::Orphaned, Some(Utc::now()))
            .await
            .unwrap());
        assert_eq!(
            registry.get_job(id).await.unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn update_unknown_job_is_not_found() {
        let (_dir, registry) = open_tmp().await;
        let err = registry
            .update_job_status(999, JobStatus::Failed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BorgUiError::JobNotFound(999)));
    }

    #[tokio::test]
    async fn mount_status_update_reports_change() {
        let (_dir, registry) = open_tmp().await;
        let id = registry
            .create_mount(MountRecord::active("/mnt/a", "/repo"))
            .await
            .unwrap();
        assert!(registry
            .update_mount_status(id, MountStatus::Stale)
            .await
            .unwrap());
        assert!(!registry
            .update_mount_status(id, MountStatus::Stale)
            .await
            .unwrap());
        assert!(registry.fetch_active_mounts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn due_schedules_respect_kind_last_run_and_failure() {
        let (_dir, registry) = open_tmp().await;
        let now = Utc::now();

        let mut due = ScheduleDefinition::new("due", ScheduleKind::Backup, "/r", "0 * * * *");
        due.created_at = now - CDur::hours(3);
        let due_id = registry.create_schedule(due).await.unwrap();

        let mut fresh = ScheduleDefinition::new("fresh", ScheduleKind::Backup, "/r", "0 * * * *");
        fresh.created_at = now - CDur::hours(3);
        fresh.last_run = Some(now);
        registry.create_schedule(fresh).await.unwrap();

        let mut other = ScheduleDefinition::new("check", ScheduleKind::Check, "/r", "0 * * * *");
        other.created_at = now - CDur::hours(3);
        registry.create_schedule(other).await.unwrap();

        let mut broken = ScheduleDefinition::new("broken", ScheduleKind::Backup, "/r", "nope");
        broken.created_at = now - CDur::hours(3);
        let broken_id = registry.create_schedule(broken).await.unwrap();

        let ids: Vec<u64> = registry
            .fetch_due_schedules(ScheduleKind::Backup, now)
            .await
            .unwrap()
            .iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![due_id, broken_id]);

        registry
            .mark_schedule_failed(broken_id, "invalid cadence")
            .await
            .unwrap();
        registry
            .update_schedule_last_run(due_id, now)
            .await
            .unwrap();
        assert!(registry
            .fetch_due_schedules(ScheduleKind::Backup, now)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn insert_user_is_idempotent_per_name() {
        let (_dir, registry) = open_tmp().await;
        let user = UserRecord {
            username: "admin".into(),
            password_hash: "x$y".into(),
            is_admin: true,
            created_at: Utc::now(),
        };
        assert!(registry.insert_user(user.clone()).await.unwrap());
        assert!(!registry.insert_user(user).await.unwrap());
        assert!(registry.has_users().await.unwrap());
        assert!(registry.get_user("admin").await.unwrap().unwrap().is_admin);
    }
}
