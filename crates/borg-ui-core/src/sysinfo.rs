//! Static system information gathered once at startup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::process::Command;

use crate::error::{BorgUiError, Result};

/// Cache key the collected [`SystemInfo`] is published under.
pub const SYSTEM_INFO_KEY: &str = "system:info";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub app_version: String,
    /// `None` when the borg binary could not be queried.
    pub borg_version: Option<String>,
    pub os: String,
    pub arch: String,
    pub collected_at: DateTime<Utc>,
}

impl SystemInfo {
    fn new(borg_version: Option<String>) -> Self {
        Self {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            borg_version,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            collected_at: Utc::now(),
        }
    }
}

/// Query `<borg_binary> --version`.
///
/// On failure the error is returned alongside info without a borg version,
/// so callers can still publish what is known.
pub async fn collect(
    borg_binary: &str,
    timeout: Duration,
) -> std::result::Result<SystemInfo, (SystemInfo, BorgUiError)> {
    match borg_version(borg_binary, timeout).await {
        Ok(version) => Ok(SystemInfo::new(Some(version))),
        Err(e) => Err((SystemInfo::new(None), e)),
    }
}

async fn borg_version(borg_binary: &str, timeout: Duration) -> Result<String> {
    let command_err = |reason: String| BorgUiError::Command {
        command: format!("{borg_binary} --version"),
        reason,
    };
    let output = Command::new(borg_binary)
        .arg("--version")
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(timeout, output)
        .await
        .map_err(|_| command_err(format!("timed out after {}s", timeout.as_secs())))?
        .map_err(|e| command_err(e.to_string()))?;
    if !output.status.success() {
        return Err(command_err(format!(
            "exit {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    parse_borg_version(&String::from_utf8_lossy(&output.stdout))
        .ok_or_else(|| command_err("unrecognized version output".into()))
}

/// `borg 1.2.8` → `1.2.8`. Also accepts a bare version string.
fn parse_borg_version(stdout: &str) -> Option<String> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    line.split_whitespace()
        .find(|tok| tok.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .map(str::to_string)
}
