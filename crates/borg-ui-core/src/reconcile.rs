//! Orphan reconciler: corrects job and mount records that claim OS resources
//! which no longer exist.
//!
//! Only non-terminal records are touched, and terminal job statuses are sticky
//! in the registry, so a pass can run alongside dispatch and can be repeated.

use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::probe::{Liveness, OsProbe};
use crate::registry::{JobStatus, MountStatus, Registry};

/// Outcome of verifying one record.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Live,
    Gone,
    /// Every attempt came back unknown; the last reason is kept.
    Unverified(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobReconcileReport {
    pub checked: usize,
    pub alive: usize,
    /// Confirmed dead, now orphaned.
    pub orphaned: Vec<u64>,
    /// Could not be verified, orphaned conservatively.
    pub unverified: Vec<u64>,
    /// Already terminal by the time the update landed.
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MountReconcileReport {
    pub checked: usize,
    pub mounted: usize,
    pub stale: Vec<u64>,
    pub unverified: Vec<u64>,
    pub unmount_failed: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub jobs: JobReconcileReport,
    pub mounts: MountReconcileReport,
}

pub struct OrphanReconciler {
    registry: Arc<dyn Registry>,
    probe: Arc<dyn OsProbe>,
    verify_attempts: u32,
    verify_delay: Duration,
}

impl OrphanReconciler {
    pub fn new(registry: Arc<dyn Registry>, probe: Arc<dyn OsProbe>) -> Self {
        Self {
            registry,
            probe,
            verify_attempts: 3,
            verify_delay: Duration::from_millis(250),
        }
    }

    /// How many probes an ambiguous record gets, and the pause between them.
    pub fn with_verification(mut self, attempts: u32, delay: Duration) -> Self {
        self.verify_attempts = attempts.max(1);
        self.verify_delay = delay;
        self
    }

    async fn verify<F, Fut>(&self, mut probe: F) -> Verdict
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Liveness>,
    {
        let mut last_reason = String::new();
        for attempt in 1..=self.verify_attempts {
            match probe().await {
                Liveness::Alive => return Verdict::Live,
                Liveness::Dead => return Verdict::Gone,
                Liveness::Unknown(reason) => {
                    tracing::debug!(attempt, %reason, "liveness undetermined");
                    last_reason = reason;
                }
            }
            if attempt < self.verify_attempts {
                tokio::time::sleep(self.verify_delay).await;
            }
        }
        Verdict::Unverified(last_reason)
    }

    /// Orphan every running job whose process is gone.
    pub async fn reconcile_jobs(&self) -> Result<JobReconcileReport> {
        let jobs = self.registry.fetch_running_jobs().await?;
        let mut report = JobReconcileReport {
            checked: jobs.len(),
            ..Default::default()
        };

        for job in jobs {
            let verdict = match job.pid {
                Some(pid) => self.verify(|| self.probe.is_process_alive(pid)).await,
                None => Verdict::Gone,
            };

            match &verdict {
                Verdict::Live => {
                    report.alive += 1;
                    continue;
                }
                Verdict::Gone => {
                    tracing::info!(job_id = job.id, pid = ?job.pid, "job process is gone, marking orphaned");
                }
                Verdict::Unverified(reason) => {
                    tracing::warn!(
                        job_id = job.id,
                        pid = ?job.pid,
                        attempts = self.verify_attempts,
                        %reason,
                        "job liveness could not be verified, marking orphaned"
                    );
                }
            }

            match self
                .registry
                .update_job_status(job.id, JobStatus::Orphaned, Some(Utc::now()))
                .await
            {
                Ok(true) if matches!(verdict, Verdict::Unverified(_)) => {
                    report.unverified.push(job.id)
                }
                Ok(true) => report.orphaned.push(job.id),
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(job_id = job.id, error = %e, "could not orphan job");
                    report.errors += 1;
                }
            }
        }

        tracing::info!(
            checked = report.checked,
            orphaned = report.orphaned.len(),
            unverified = report.unverified.len(),
            "job reconciliation finished"
        );
        Ok(report)
    }

    /// Detach and mark stale every active mount that is no longer mounted.
    pub async fn reconcile_mounts(&self) -> Result<MountReconcileReport> {
        let mounts = self.registry.fetch_active_mounts().await?;
        let mut report = MountReconcileReport {
            checked: mounts.len(),
            ..Default::default()
        };

        for mount in mounts {
            let verdict = self.verify(|| self.probe.is_path_mounted(&mount.path)).await;
            match &verdict {
                Verdict::Live => {
                    report.mounted += 1;
                    continue;
                }
                Verdict::Gone => {
                    tracing::info!(mount_id = mount.id, path = %mount.path.display(), "mount is gone, marking stale");
                }
                Verdict::Unverified(reason) => {
                    tracing::warn!(
                        mount_id = mount.id,
                        path = %mount.path.display(),
                        attempts = self.verify_attempts,
                        %reason,
                        "mount could not be verified, marking stale"
                    );
                }
            }

            if !self.probe.force_unmount(&mount.path).await {
                report.unmount_failed += 1;
            }

            match self
                .registry
                .update_mount_status(mount.id, MountStatus::Stale)
                .await
            {
                Ok(_) if matches!(verdict, Verdict::Unverified(_)) => {
                    report.unverified.push(mount.id)
                }
                Ok(_) => report.stale.push(mount.id),
                Err(e) => {
                    tracing::warn!(mount_id = mount.id, error = %e, "could not mark mount stale");
                    report.errors += 1;
                }
            }
        }

        tracing::info!(
            checked = report.checked,
            stale = report.stale.len(),
            unverified = report.unverified.len(),
            "mount reconciliation finished"
        );
        Ok(report)
    }

    /// Jobs first, then mounts.
    pub async fn reconcile_all(&self) -> Result<ReconcileReport> {
        Ok(ReconcileReport {
            jobs: self.reconcile_jobs().await?,
            mounts: self.reconcile_mounts().await?,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
