//! Structured background tasks: every task shares one cancellation token and
//! is joined as a unit on shutdown.

use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::task::{Id, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub task: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Tasks that acknowledged cancellation and returned.
    pub cancelled: Vec<String>,
    /// Tasks that returned an error or panicked.
    pub failures: Vec<TaskFailure>,
    /// Tasks still running at the deadline, aborted.
    pub timed_out: Vec<String>,
    /// Dispatched jobs still running when their watchers were dropped.
    pub unfinished_jobs: Vec<u64>,
}

impl ShutdownReport {
    pub fn total(&self) -> usize {
        self.cancelled.len() + self.failures.len() + self.timed_out.len()
    }
}

pub struct TaskGroup {
    cancel: CancellationToken,
    tasks: JoinSet<Result<()>>,
    names: HashMap<Id, String>,
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGroup {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
            names: HashMap::new(),
        }
    }

    /// Spawn `task` with a child of the group's token.
    pub fn spawn<F, Fut>(&mut self, name: impl Into<String>, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let handle = self.tasks.spawn(task(self.cancel.child_token()));
        tracing::debug!(task = %name, "background task spawned");
        self.names.insert(handle.id(), name);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.names.values().cloned().collect();
        names.sort();
        names
    }

    /// Cancel every task and wait up to `timeout` for them to return.
    /// Stragglers are aborted. Errors are collected, never propagated.
    pub async fn shutdown(&mut self, timeout: Duration) -> ShutdownReport {
        self.cancel.cancel();
        let deadline = Instant::now() + timeout;
        let mut report = ShutdownReport::default();

        while !self.tasks.is_empty() {
            let joined = match tokio::time::timeout_at(deadline, self.tasks.join_next_with_id()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_) => {
                    self.tasks.abort_all();
                    let mut stragglers: Vec<String> = self.names.drain().map(|(_, n)| n).collect();
                    stragglers.sort();
                    for name in &stragglers {
                        tracing::warn!(task = %name, "task ignored cancellation, aborted");
                    }
                    report.timed_out = stragglers;
                    // reap the aborted tasks so nothing outlives the group
                    while self.tasks.join_next().await.is_some() {}
                    break;
                }
            };

            let (id, failure) = match joined {
                Ok((id, Ok(()))) => (id, None),
                Ok((id, Err(e))) => (id, Some(e.to_string())),
                Err(e) => (e.id(), Some(e.to_string())),
            };
            let name = self.names.remove(&id).unwrap_or_else(|| format!("task {id}"));
            match failure {
                None => report.cancelled.push(name),
                Some(reason) => {
                    tracing::warn!(task = %name, %reason, "task ended with error");
                    report.failures.push(TaskFailure { task: name, reason });
                }
            }
        }

        report
    }
}
