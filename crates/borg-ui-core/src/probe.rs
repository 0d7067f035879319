//! OS probe: process liveness, mount presence and forced unmount.
//!
//! Answers are three-valued. [`Liveness::Unknown`] means the probe could not
//! tell, which the reconciler treats differently from a confirmed
//! [`Liveness::Dead`].

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
    Unknown(String),
}

impl Liveness {
    pub fn is_alive(&self) -> bool {
        matches!(self, Liveness::Alive)
    }
}

#[async_trait]
pub trait OsProbe: Send + Sync {
    /// Alive only if `pid` exists and belongs to this application.
    async fn is_process_alive(&self, pid: u32) -> Liveness;

    /// Alive only if `path` is a mount point and answers a stat.
    async fn is_path_mounted(&self, path: &Path) -> Liveness;

    /// Lazily detach the mount at `path`. Never fails; returns whether any
    /// unmount command succeeded.
    async fn force_unmount(&self, path: &Path) -> bool;
}

// ---------------------------------------------------------------------------
// SystemProbe
// ---------------------------------------------------------------------------

const PROC_ROOT: &str = "/proc";
const MOUNTS_FILE: &str = "/proc/self/mounts";

/// [`OsProbe`] over procfs, falling back to `kill -0` where procfs is absent.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    owned_names: Vec<String>,
    timeout: Duration,
    proc_root: PathBuf,
    mounts_file: PathBuf,
}

impl SystemProbe {
    pub fn new(owned_names: Vec<String>, timeout: Duration) -> Self {
        Self {
            owned_names,
            timeout,
            proc_root: PathBuf::from(PROC_ROOT),
            mounts_file: PathBuf::from(MOUNTS_FILE),
        }
    }

    /// Read mounts from `path` instead of `/proc/self/mounts`.
    pub fn with_mounts_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.mounts_file = path.into();
        self
    }

    fn owns(&self, cmdline: &[u8]) -> bool {
        if self.owned_names.is_empty() {
            return true;
        }
        cmdline
            .split(|b| *b == 0)
            .filter(|arg| !arg.is_empty())
            .filter_map(|arg| {
                let arg = String::from_utf8_lossy(arg);
                Path::new(arg.as_ref())
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .any(|base| self.owned_names.iter().any(|n| base.starts_with(n.as_str())))
    }

    async fn procfs_liveness(&self, pid: u32) -> Liveness {
        let dir = self.proc_root.join(pid.to_string());

        match tokio::fs::read_to_string(dir.join("stat")).await {
            Ok(stat) if process_state(&stat) == Some('Z') => return Liveness::Dead,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Liveness::Dead,
            Err(e) => return Liveness::Unknown(format!("read stat for pid {pid}: {e}")),
        }

        match tokio::fs::read(dir.join("cmdline")).await {
            Ok(cmdline) if self.owns(&cmdline) => Liveness::Alive,
            Ok(_) => {
                tracing::debug!(pid, "pid is live but not an application process");
                Liveness::Dead
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Liveness::Dead,
            Err(e) => Liveness::Unknown(format!("read cmdline for pid {pid}: {e}")),
        }
    }

    async fn signal_liveness(&self, pid: u32) -> Liveness {
        let probe = Command::new("kill")
            .args(["-0", &pid.to_string()])
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(self.timeout, probe).await {
            Ok(Ok(out)) if out.status.success() => Liveness::Alive,
            Ok(Ok(out)) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                if stderr.contains("No such process") || stderr.is_empty() {
                    Liveness::Dead
                } else {
                    Liveness::Unknown(stderr.trim().to_string())
                }
            }
            Ok(Err(e)) => Liveness::Unknown(format!("kill -0 {pid}: {e}")),
            Err(_) => Liveness::Unknown(format!("kill -0 {pid} timed out")),
        }
    }

    async fn run_unmount(&self, program: &str, args: &[&str], path: &Path) -> bool {
        let Ok(bin) = which::which(program) else {
            tracing::debug!(program, "unmount helper not installed");
            return false;
        };
        let child = Command::new(bin)
            .args(args)
            .arg(path)
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(out)) if out.status.success() => true,
            Ok(Ok(out)) => {
                tracing::debug!(
                    program,
                    path = %path.display(),
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "unmount refused"
                );
                false
            }
            Ok(Err(e)) => {
                tracing::debug!(program, path = %path.display(), error = %e, "unmount failed to run");
                false
            }
            Err(_) => {
                tracing::debug!(program, path = %path.display(), "unmount timed out");
                false
            }
        }
    }
}

#[async_trait]
impl OsProbe for SystemProbe {
    async fn is_process_alive(&self, pid: u32) -> Liveness {
        if pid == 0 {
            return Liveness::Dead;
        }
        if tokio::fs::metadata(self.proc_root.join("self")).await.is_ok() {
            self.procfs_liveness(pid).await
        } else {
            self.signal_liveness(pid).await
        }
    }

    async fn is_path_mounted(&self, path: &Path) -> Liveness {
        let table = match tokio::fs::read_to_string(&self.mounts_file).await {
            Ok(t) => t,
            Err(e) => {
                return Liveness::Unknown(format!(
                    "read {}: {e}",
                    self.mounts_file.display()
                ))
            }
        };
        if !mount_points(&table).any(|p| same_path(&p, path)) {
            return Liveness::Dead;
        }
        match tokio::time::timeout(self.timeout, tokio::fs::metadata(path)).await {
            Ok(Ok(_)) => Liveness::Alive,
            Ok(Err(e)) => {
                tracing::debug!(path = %path.display(), error = %e, "mount point unreachable");
                Liveness::Dead
            }
            Err(_) => Liveness::Unknown(format!("stat {} timed out", path.display())),
        }
    }

    async fn force_unmount(&self, path: &Path) -> bool {
        if self.run_unmount("fusermount", &["-u", "-z"], path).await {
            return true;
        }
        self.run_unmount("umount", &["-l"], path).await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Single-letter state from `/proc/<pid>/stat`. The command name may contain
/// spaces and parentheses, so the state follows the last `)`.
fn process_state(stat: &str) -> Option<char> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.trim_start().chars().next()
}

/// Mount points listed in a `/proc/self/mounts` style table.
fn mount_points(table: &str) -> impl Iterator<Item = PathBuf> + '_ {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape_mount_field(field)))
}

/// Undo the octal escaping procfs applies to spaces, tabs and backslashes.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(value) = u8::from_str_radix(digits, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn same_path(a: &Path, b: &Path) -> bool {
    a.components().eq(b.components())
}
