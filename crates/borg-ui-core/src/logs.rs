//! Job log rotation.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::Result;
use crate::settings::LogRetention;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    pub removed: usize,
    pub freed_bytes: u64,
    pub kept: usize,
}

struct LogFile {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

/// Delete log files older than the retention age, then the oldest remaining
/// files until the directory is within the size bound. Subdirectories are
/// left alone. A missing directory is an empty one.
pub fn rotate_logs(dir: &Path, retention: &LogRetention, now: SystemTime) -> Result<RotationReport> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RotationReport::default()),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        files.push(LogFile {
            path: entry.path(),
            size: meta.len(),
            modified: meta.modified().unwrap_or(now),
        });
    }
    files.sort_by_key(|f| f.modified);

    let mut report = RotationReport::default();
    let mut total: u64 = files.iter().map(|f| f.size).sum();
    for file in files {
        let age = now.duration_since(file.modified).unwrap_or_default();
        let expired = age > retention.max_age;
        if !expired && total <= retention.max_total_bytes {
            report.kept += 1;
            continue;
        }
        match std::fs::remove_file(&file.path) {
            Ok(()) => {
                total -= file.size;
                report.removed += 1;
                report.freed_bytes += file.size;
            }
            Err(e) => {
                tracing::warn!(path = %file.path.display(), error = %e, "could not remove log file");
                report.kept += 1;
            }
        }
    }

    if report.removed > 0 {
        tracing::info!(
            dir = %dir.display(),
            removed = report.removed,
            freed_bytes = report.freed_bytes,
            "rotated logs"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn write(dir: &Path, name: &str, bytes: usize) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, vec![b'x'; bytes]).unwrap();
        path
    }

    fn retention(days: u64, max_total_bytes: u64) -> LogRetention {
        LogRetention {
            max_age: DAY * days as u32,
            max_total_bytes,
        }
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let report = rotate_logs(&dir.path().join("none"), &retention(30, 1), SystemTime::now()).unwrap();
        assert_eq!(report, RotationReport::default());
    }

    #[test]
    fn removes_files_past_retention() {
        let dir = TempDir::new().unwrap();
        let old = write(dir.path(), "backup-1.log", 10);
        let fresh = write(dir.path(), "backup-2.log", 10);

        // pretend forty days have passed; both files look old
        let later = SystemTime::now() + DAY * 40;
        let report = rotate_logs(dir.path(), &retention(30, u64::MAX), later).unwrap();
        assert_eq!(report.removed, 2);
        assert!(!old.exists());
        assert!(!fresh.exists());

        let kept = write(dir.path(), "backup-3.log", 10);
        let report = rotate_logs(dir.path(), &retention(30, u64::MAX), SystemTime::now()).unwrap();
        assert_eq!(report.removed, 0);
        assert_eq!(report.kept, 1);
        assert!(kept.exists());
    }

    #[test]
    fn trims_oldest_until_within_size_bound() {
        let dir = TempDir::new().unwrap();
        let first = write(dir.path(), "a.log", 100);
        std::thread::sleep(Duration::from_millis(20));
        let second = write(dir.path(), "b.log", 100);
        std::thread::sleep(Duration::from_millis(20));
        let third = write(dir.path(), "c.log", 100);

        let report = rotate_logs(dir.path(), &retention(30, 250), SystemTime::now()).unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.freed_bytes, 100);
        assert!(!first.exists());
        assert!(second.exists());
        assert!(third.exists());
    }

    #[test]
    fn subdirectories_are_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("archive")).unwrap();
        let report = rotate_logs(dir.path(), &retention(0, 0), SystemTime::now() + DAY).unwrap();
        assert_eq!(report.removed, 0);
        assert!(dir.path().join("archive").exists());
    }
}
