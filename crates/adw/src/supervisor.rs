//! C7 Agent supervisor (spec §4.7).
//!
//! Tracks every live task's workflow run as a `tokio::task`, one per
//! `adw_id`. Each task drives its own phase-by-phase `AgentExecutor`
//! invocations (the actual OS child processes); the supervisor's job is
//! non-blocking reap of whichever of those driving tasks has finished,
//! mirroring the `poll() -> [(adw_id, exit_code, stderr)]` contract from
//! spec §4.7 at the task level rather than the OS-process level, since a
//! single task's workflow is serial phases each spawning (at most) one
//! live child at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;

use crate::workflow::WorkflowOutcome;

pub struct SupervisedEntry {
    pub adw_id: String,
    pub task_description: String,
    pub workflow_name: String,
    pub worktree_name: String,
    pub start_time: Instant,
    handle: JoinHandle<WorkflowOutcome>,
    cancel: Arc<AtomicBool>,
}

/// Cooperative cancellation flag threaded into a workflow run; checked
/// between phases so `kill()` doesn't have to reach into the running
/// child process directly.
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub adw_id: String,
    pub task_description: String,
    pub exit_code: i32,
    pub outcome: WorkflowOutcome,
}

/// In-memory table `adw_id -> {start_time, workflow, task_description,
/// worktree}` (spec §4.7). Rebuilt fresh on every daemon restart — it is
/// never persisted, which is why an `in_progress` task file entry with no
/// matching supervisor entry right after a restart means the prior daemon
/// crashed mid-task (see the "orphaned" reconciliation in `daemon.rs`).
#[derive(Default)]
pub struct Supervisor {
    entries: HashMap<String, SupervisedEntry>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn list(&self) -> Vec<(&str, &str, &str)> {
        self.entries
            .values()
            .map(|e| (e.adw_id.as_str(), e.task_description.as_str(), e.worktree_name.as_str()))
            .collect()
    }

    pub fn is_running(&self, adw_id: &str) -> bool {
        self.entries.contains_key(adw_id)
    }

    /// `spawn(adw_id, ...) -> CancelToken`. The caller (the cron daemon)
    /// has already marked the task in_progress via C1 and built the
    /// `ADWState`; this just starts the workflow-driving task and records
    /// it. `future` is the already-constructed async workflow run.
    pub fn spawn<F>(
        &mut self,
        adw_id: String,
        task_description: String,
        workflow_name: String,
        worktree_name: String,
        future: F,
    ) -> CancelToken
    where
        F: std::future::Future<Output = WorkflowOutcome> + Send + 'static,
    {
        let cancel = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(future);
        self.entries.insert(
            adw_id.clone(),
            SupervisedEntry {
                adw_id,
                task_description,
                workflow_name,
                worktree_name,
                start_time: Instant::now(),
                handle,
                cancel: cancel.clone(),
            },
        );
        CancelToken(cancel)
    }

    /// Non-blocking reap of exited workflow runs. Removes each completed
    /// entry and returns its outcome.
    pub async fn poll(&mut self) -> Vec<Completion> {
        let finished: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        let mut completions = Vec::new();
        for adw_id in finished {
            let entry = match self.entries.remove(&adw_id) {
                Some(e) => e,
                None => continue,
            };
            let outcome = match entry.handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => WorkflowOutcome {
                    success: false,
                    commit_hash: None,
                    error_message: Some(format!("workflow task panicked: {join_err}")),
                },
            };
            let exit_code = if outcome.success { 0 } else { 1 };
            completions.push(Completion {
                adw_id,
                task_description: entry.task_description,
                exit_code,
                outcome,
            });
        }
        completions
    }

    /// Signals cooperative cancellation and aborts the driving task.
    /// Returns `true` if `adw_id` was live.
    pub fn kill(&mut self, adw_id: &str) -> bool {
        match self.entries.remove(adw_id) {
            Some(entry) => {
                entry.cancel.store(true, Ordering::SeqCst);
                entry.handle.abort();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poll_is_empty_when_nothing_has_finished() {
        let mut sup = Supervisor::new();
        sup.spawn(
            "deadbeef".to_string(),
            "Task A".to_string(),
            "minimal".to_string(),
            "main".to_string(),
            async {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                WorkflowOutcome { success: true, commit_hash: None, error_message: None }
            },
        );
        assert_eq!(sup.count(), 1);
        let completions = sup.poll().await;
        assert!(completions.is_empty());
        assert_eq!(sup.count(), 1);
    }

    #[tokio::test]
    async fn poll_reaps_finished_workflow_and_reports_success() {
        let mut sup = Supervisor::new();
        sup.spawn(
            "cafebabe".to_string(),
            "Task B".to_string(),
            "minimal".to_string(),
            "main".to_string(),
            async { WorkflowOutcome { success: true, commit_hash: Some("abc123".to_string()), error_message: None } },
        );

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let completions = sup.poll().await;
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].exit_code, 0);
        assert_eq!(completions[0].outcome.commit_hash.as_deref(), Some("abc123"));
        assert_eq!(sup.count(), 0);
    }

    #[tokio::test]
    async fn kill_removes_entry_and_aborts() {
        let mut sup = Supervisor::new();
        let token = sup.spawn(
            "11111111".to_string(),
            "Task C".to_string(),
            "minimal".to_string(),
            "main".to_string(),
            async {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                WorkflowOutcome { success: true, commit_hash: None, error_message: None }
            },
        );
        assert!(sup.kill("11111111"));
        assert!(token.is_cancelled());
        assert_eq!(sup.count(), 0);
        assert!(!sup.kill("11111111"));
    }

    #[tokio::test]
    async fn concurrency_ceiling_is_enforced_by_caller_using_count() {
        let mut sup = Supervisor::new();
        let max_concurrent = 2;
        for i in 0..4 {
            if sup.count() >= max_concurrent {
                break;
            }
            sup.spawn(
                format!("{i:08}"),
                format!("Task {i}"),
                "minimal".to_string(),
                "main".to_string(),
                async {
                    tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                    WorkflowOutcome { success: true, commit_hash: None, error_message: None }
                },
            );
        }
        assert_eq!(sup.count(), max_concurrent);
    }
}
