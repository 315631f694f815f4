//! C8 Cron trigger daemon (spec §4.7 loop pseudocode, §5).
//!
//! Joins the task-file store, eligibility engine, worktree/port
//! provisioning, and the supervisor into the poll-dispatch-reap loop.
//! Grounded on the process-spawn-and-reap idiom implicit in the teacher's
//! `Command::output()` call sites, generalized to polling `tokio::task`
//! handles each daemon tick instead of one blocking call per task.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use adw_core::config::AdwConfig;
use adw_core::error::AdwResult;
use adw_core::model::Task;
use adw_core::ports::PortAllocator;
use adw_core::retry::EscalationReport;
use adw_core::state::{ADWState, StateStore};
use adw_core::task_file::TaskFileStore;
use adw_core::worktree::WorktreeManager;

use crate::adw_id;
use crate::executor::AgentExecutor;
use crate::supervisor::Supervisor;
use crate::test_detect::detect_test_command;
use crate::workflow::{select_workflow, WorkflowSettings};

const PORT_KINDS: &[&str] = &["frontend", "backend", "database"];

pub struct Daemon {
    pub config: AdwConfig,
    pub repo_root: PathBuf,
    pub task_store: TaskFileStore,
    pub state_store: Arc<StateStore>,
    pub port_allocator: Arc<PortAllocator>,
    pub worktree_manager: Arc<WorktreeManager>,
}

impl Daemon {
    pub fn new(repo_root: PathBuf, config: AdwConfig) -> AdwResult<Self> {
        let task_store = TaskFileStore::new(repo_root.join(&config.core.tasks_file));
        let agents_dir = repo_root.join(&config.workspace.agents_dir);
        let worktrees_dir = repo_root.join(&config.workspace.worktrees_dir);

        Ok(Self {
            task_store,
            state_store: Arc::new(StateStore::new(agents_dir)),
            port_allocator: Arc::new(PortAllocator::new(Default::default())),
            worktree_manager: Arc::new(WorktreeManager::new(&repo_root, worktrees_dir)?),
            repo_root,
            config,
        })
    }

    /// On daemon start, any task file entry in `in_progress` status has no
    /// corresponding live supervisor entry (the supervisor table is always
    /// empty right after a process restart) and is marked `failed` with
    /// the conservative "orphaned" reason the spec's open question
    /// resolves to.
    pub fn reconcile_orphans(&self) -> AdwResult<usize> {
        let sections = self.task_store.load()?;
        let mut reconciled = 0;
        for section in &sections {
            for task in &section.tasks {
                if task.status == adw_core::model::TaskStatus::InProgress {
                    if let Some(adw_id) = &task.adw_id {
                        self.task_store.mark_failed(
                            &task.description,
                            adw_id,
                            "orphaned: no live agent process found at daemon startup",
                        )?;
                        reconciled += 1;
                    }
                }
            }
        }
        Ok(reconciled)
    }

    /// One pass of the cron loop: kill any supervised run the task file now
    /// says is cancelled, reap completions, then dispatch newly eligible
    /// tasks up to the concurrency ceiling.
    pub async fn run_once(&self, supervisor: &mut Supervisor) -> AdwResult<()> {
        self.reconcile_cancellations(supervisor).await?;
        self.reap_completions(supervisor).await?;
        self.dispatch_eligible(supervisor).await?;
        Ok(())
    }

    /// `adw cancel <adw_id>` runs as a separate, short-lived CLI process —
    /// it cannot reach into a running daemon's in-memory `Supervisor`
    /// directly, so it only rewrites the task file via `mark_cancelled`.
    /// This is the daemon side of that handoff: on every pass, before
    /// reaping, check whether any currently-supervised `adw_id` has had its
    /// task line externally marked failed with reason "cancelled" — if so,
    /// the live workflow task is aborted here and its port/worktree
    /// reclaimed, so a later-finishing orphaned child can never overwrite
    /// the cancelled status via `mark_done`/`mark_failed`.
    async fn reconcile_cancellations(&self, supervisor: &mut Supervisor) -> AdwResult<()> {
        let running: Vec<String> = supervisor.list().iter().map(|(id, _, _)| id.to_string()).collect();
        for adw_id in running {
            let Some(task) = self.task_store.find_by_adw_id(&adw_id)? else {
                continue;
            };
            let cancelled = task.status == adw_core::model::TaskStatus::Failed
                && task.error_message.as_deref() == Some("cancelled");
            if !cancelled {
                continue;
            }
            supervisor.kill(&adw_id);
            tracing::info!(adw_id = %adw_id, "killed live workflow run for externally cancelled task");
            self.port_allocator.release(&adw_id);
            if self.config.workflow.remove_worktree_on_failure {
                if let Some(name) = self.worktree_name_for(&adw_id) {
                    let _ = self.worktree_manager.remove(&name, true);
                }
            }
        }
        Ok(())
    }

    /// Top-level cron loop (spec §4.7). Reconciles orphaned tasks once at
    /// startup, then alternates `run_once` and `poll_interval_seconds` of
    /// sleep until either `once` is set or SIGINT arrives. A live supervisor
    /// is never torn down mid-phase on shutdown: already-spawned workflow
    /// tasks keep running to completion in the background; the process just
    /// stops accepting new ones and returns once the signal lands.
    ///
    /// A single pass failing (port exhaustion, a worktree git command
    /// failing, a task-file race) is logged and does not end the process —
    /// only startup failures (`Daemon::new`, orphan reconciliation) do.
    pub async fn run_loop(&self, once: bool) -> AdwResult<()> {
        let orphaned = self.reconcile_orphans()?;
        if orphaned > 0 {
            tracing::warn!(orphaned, "reconciled orphaned in_progress tasks at startup");
        }

        let mut supervisor = Supervisor::new();
        let poll_interval = Duration::from_secs(self.config.daemon.poll_interval_seconds);

        loop {
            if let Err(e) = self.run_once(&mut supervisor).await {
                tracing::error!(error = %e, "error during daemon pass, continuing with other tasks");
            }

            if once {
                return Ok(());
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "failed to listen for shutdown signal");
                    }
                    tracing::info!(running = supervisor.count(), "shutdown requested, no longer dispatching new tasks");
                    return Ok(());
                }
            }
        }
    }

    async fn reap_completions(&self, supervisor: &mut Supervisor) -> AdwResult<()> {
        for completion in supervisor.poll().await {
            if completion.outcome.success {
                self.task_store.mark_done(
                    &completion.task_description,
                    &completion.adw_id,
                    completion.outcome.commit_hash.as_deref(),
                )?;
                tracing::info!(adw_id = %completion.adw_id, "task completed successfully");
            } else {
                let error = completion.outcome.error_message.clone().unwrap_or_else(|| "unknown failure".to_string());
                self.task_store.mark_failed(&completion.task_description, &completion.adw_id, &error)?;
                tracing::warn!(adw_id = %completion.adw_id, error = %error, "task failed");
            }
            self.port_allocator.release(&completion.adw_id);
            if !completion.outcome.success && self.config.workflow.remove_worktree_on_failure {
                if let Some(name) = self.worktree_name_for(&completion.adw_id) {
                    let _ = self.worktree_manager.remove(&name, true);
                }
            }
        }
        Ok(())
    }

    fn worktree_name_for(&self, adw_id: &str) -> Option<String> {
        self.state_store.load(adw_id).ok().map(|s| s.worktree_name)
    }

    async fn dispatch_eligible(&self, supervisor: &mut Supervisor) -> AdwResult<()> {
        let eligible = self.task_store.get_eligible()?;
        let running: HashSet<String> = supervisor.list().iter().map(|(_, desc, _)| desc.to_string()).collect();

        let free_slots = self.config.daemon.max_concurrent.saturating_sub(supervisor.count());
        let mut dispatched = 0;

        for task in eligible {
            if dispatched >= free_slots {
                break;
            }
            if running.contains(&task.description) {
                continue;
            }
            self.dispatch_one(task, supervisor).await?;
            dispatched += 1;
        }
        Ok(())
    }

    async fn dispatch_one(&self, task: Task, supervisor: &mut Supervisor) -> AdwResult<()> {
        let adw_id = adw_id::generate_unique(|id| self.state_store.task_dir(id).exists())
            .ok_or_else(|| adw_core::error::AdwError::invariant("failed to generate a unique adw_id"))?;

        self.task_store.mark_in_progress(&task.description, &adw_id)?;

        let base_branch = current_branch(&self.repo_root).unwrap_or_else(|| "main".to_string());
        let worktree_path = self.worktree_manager.create(&task.worktree_name, &base_branch)?;

        let ports = self.port_allocator.allocate(&adw_id, PORT_KINDS)?;
        tracing::info!(adw_id = %adw_id, worktree = %task.worktree_name, ?ports, "dispatching task");

        let workflow = select_workflow(&task, &self.config.workflow.default_complexity);
        let mut state = ADWState::new(
            adw_id.clone(),
            task.description.clone(),
            workflow.name(),
            task.worktree_name.clone(),
            worktree_path.clone(),
            task.worktree_name.clone(),
        );
        state.task_tags = task.tags.clone();
        self.state_store.create(&state)?;

        let test_command = detect_test_command(&worktree_path, self.config.workflow.test_command.as_deref());
        let settings = WorkflowSettings {
            max_test_retries: self.config.workflow.max_test_retries,
            test_validation_enabled: self.config.workflow.test_validation_enabled,
            enable_expertise_preamble: true,
            test_command,
            phase_max_retries: self.config.workflow.max_retries,
            phase_timeout_seconds: self.config.workflow.phase_timeout_seconds,
        };

        let agent_cli = self.config.core.agent_cli.clone();
        let state_store = self.state_store.clone();
        let task_description = task.description.clone();
        let worktree_name = task.worktree_name.clone();
        let workflow_name = workflow.name().to_string();
        let escalation_path = state_store.task_dir(&adw_id).join("escalation.md");

        supervisor.spawn(adw_id.clone(), task_description, workflow_name, worktree_name, async move {
            let state_store_ref: &StateStore = &state_store;
            let executor = AgentExecutor::new(agent_cli, state_store_ref);
            let mut escalation = EscalationReport::new(state.adw_id.clone(), task.description.clone());

            let outcome = crate::workflow::run(
                &workflow,
                &task,
                &mut state,
                &executor,
                &settings,
                &worktree_path,
                state_store_ref,
                &mut escalation,
            )
            .await;

            match outcome {
                Ok(outcome) => {
                    if !outcome.success {
                        let _ = escalation.write_to(&escalation_path);
                    }
                    outcome
                }
                Err(e) => {
                    escalation.record("daemon", e.to_string(), adw_core::retry::RetryStrategy::Simplify, 0.0);
                    let _ = escalation.write_to(&escalation_path);
                    crate::workflow::WorkflowOutcome {
                        success: false,
                        commit_hash: None,
                        error_message: Some(e.to_string()),
                    }
                }
            }
        });

        Ok(())
    }
}

fn current_branch(repo_root: &std::path::Path) -> Option<String> {
    let output = std::process::Command::new("git")
        .args(["branch", "--show-current"])
        .current_dir(repo_root)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!branch.is_empty()).then_some(branch)
}
