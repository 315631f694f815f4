//! C6 Workflow runner (spec §4.6).
//!
//! Maps a task to a sequence of phases, each one `AgentExecutor` call, with
//! test-driven retry between phases. Grounded on the teacher's single-issue
//! phase loop (`swarm-agents::main`'s plan/implement/test sequencing),
//! generalized into the data-driven `Workflow` tagged enum spec §9 calls
//! for (`Minimal | Standard | Full | Custom(phases)`), driven by a phase
//! table instead of a hardcoded call sequence, and restructured as a
//! single `async fn` the cron daemon can run concurrently per task.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command as StdCommand;
use std::time::Duration;

use adw_core::error::AdwResult;
use adw_core::model::{ModelTag, PhaseResult, Task, WorkflowTag};
use adw_core::retry::{truncate_middle, EscalationReport, RetryStrategy};
use adw_core::state::{ADWState, StateStore};
use chrono::Utc;

use crate::executor::{AgentExecutor, AgentRequest};

const EXPERTISE_PREAMBLE: &str = "You are an expert software engineer working inside an isolated git worktree. Make the smallest correct change that satisfies the task.";

#[derive(Debug, Clone)]
pub struct Phase {
    pub name: String,
    pub prompt_template: String,
    pub model: ModelTag,
    pub required: bool,
    pub max_retries: u32,
    pub timeout_seconds: u64,
}

impl Phase {
    fn new(name: &str, prompt_template: &str, model: ModelTag) -> Self {
        Self {
            name: name.to_string(),
            prompt_template: prompt_template.to_string(),
            model,
            required: true,
            max_retries: 2,
            timeout_seconds: 1800,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Workflow {
    Minimal,
    Standard,
    Full,
    Custom(Vec<Phase>),
}

impl Workflow {
    pub fn name(&self) -> &'static str {
        match self {
            Workflow::Minimal => "minimal",
            Workflow::Standard => "standard",
            Workflow::Full => "full",
            Workflow::Custom(_) => "custom",
        }
    }

    pub fn phases(&self) -> Vec<Phase> {
        match self {
            Workflow::Minimal => vec![Phase::new(
                "implement",
                "Implement the following task:\n\n{task}",
                ModelTag::Sonnet,
            )],
            Workflow::Standard => vec![
                Phase::new("plan", "Write a short implementation plan for:\n\n{task}", ModelTag::Sonnet),
                Phase::new("implement", "Following the plan, implement:\n\n{task}", ModelTag::Sonnet),
            ],
            Workflow::Full => vec![
                Phase::new("plan", "Write a detailed implementation plan for:\n\n{task}", ModelTag::Opus),
                Phase::new("implement", "Following the plan, implement:\n\n{task}", ModelTag::Sonnet),
                Phase::new("test", "Write and run tests covering:\n\n{task}", ModelTag::Sonnet),
                Phase::new("review", "Review the change for correctness and style:\n\n{task}", ModelTag::Opus),
                Phase::new("document", "Document the change:\n\n{task}", ModelTag::Sonnet),
            ],
            Workflow::Custom(phases) => phases.clone(),
        }
    }
}

const FULL_KEYWORDS: &[&str] = &["critical", "security", "architecture", "refactor", "performance", "database"];
const MINIMAL_KEYWORDS: &[&str] = &["typo", "docs", "comment", "chore", "unused", "minor"];

/// Five-rule complexity-selection cascade (spec §4.6). The first rule that
/// matches wins.
pub fn select_workflow(task: &Task, default_complexity: &str) -> Workflow {
    if let Some(tag) = task.workflow_tag() {
        match tag {
            WorkflowTag::Simple => return Workflow::Minimal,
            WorkflowTag::Minimal => return Workflow::Minimal,
            WorkflowTag::Standard => return Workflow::Standard,
            WorkflowTag::Sdlc | WorkflowTag::Full => return Workflow::Full,
            WorkflowTag::BugFix | WorkflowTag::Prototype => {
                // Not directly mapped by rule 1/2; fall through to priority
                // and keyword rules.
            }
        }
    }

    if let Some(priority) = task.priority_tag() {
        use adw_core::model::PriorityTag;
        match priority {
            PriorityTag::P0 => return Workflow::Full,
            PriorityTag::P3 => return Workflow::Minimal,
            PriorityTag::P1 | PriorityTag::P2 => {}
        }
    }

    let lower = task.description.to_ascii_lowercase();
    if FULL_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Workflow::Full;
    }
    if MINIMAL_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Workflow::Minimal;
    }

    match default_complexity {
        "minimal" => Workflow::Minimal,
        "full" | "sdlc" => Workflow::Full,
        _ => Workflow::Standard,
    }
}

fn build_prompt(phase: &Phase, task: &Task, retry_context: Option<&str>, expertise_preamble: bool) -> String {
    let mut prompt = String::new();
    if expertise_preamble {
        prompt.push_str(EXPERTISE_PREAMBLE);
        prompt.push_str("\n\n");
    }
    prompt.push_str(&phase.prompt_template.replace("{task}", &task.description));
    if let Some(ctx) = retry_context {
        prompt.push_str("\n\n## Retry context\n\n");
        prompt.push_str(ctx);
    }
    prompt
}

struct TestSummary {
    passed: bool,
    output: String,
}

async fn run_tests(command: &[String], worktree_path: &Path, timeout_seconds: u64) -> AdwResult<TestSummary> {
    let mut cmd = tokio::process::Command::new(&command[0]);
    cmd.args(&command[1..]).current_dir(worktree_path);
    cmd.stdout(std::process::Stdio::piped()).stderr(std::process::Stdio::piped());

    let output = tokio::time::timeout(Duration::from_secs(timeout_seconds), cmd.output()).await;
    match output {
        Ok(Ok(out)) => {
            let mut combined = String::from_utf8_lossy(&out.stdout).to_string();
            combined.push_str(&String::from_utf8_lossy(&out.stderr));
            Ok(TestSummary {
                passed: out.status.success(),
                output: combined,
            })
        }
        Ok(Err(e)) => Ok(TestSummary {
            passed: false,
            output: format!("failed to run test command: {e}"),
        }),
        Err(_) => Ok(TestSummary {
            passed: false,
            output: format!("test command timed out after {timeout_seconds}s"),
        }),
    }
}

/// Commits all changes in the worktree and returns the short SHA, or
/// `None` if there was nothing to commit. Best-effort: a commit failure
/// does not fail the task (commit_hash is optional per the data model).
fn commit_changes(worktree_path: &Path, adw_id: &str, description: &str) -> Option<String> {
    StdCommand::new("git").args(["add", "-A"]).current_dir(worktree_path).output().ok()?;

    let status = StdCommand::new("git")
        .args(["diff", "--cached", "--quiet"])
        .current_dir(worktree_path)
        .status()
        .ok()?;
    if status.success() {
        return None; // nothing staged
    }

    let message = format!("adw[{adw_id}]: {description}");
    let commit = StdCommand::new("git")
        .args(["commit", "-m", &message])
        .current_dir(worktree_path)
        .output()
        .ok()?;
    if !commit.status.success() {
        return None;
    }

    let rev = StdCommand::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .current_dir(worktree_path)
        .output()
        .ok()?;
    if !rev.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&rev.stdout).trim().to_string())
}

#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    pub success: bool,
    pub commit_hash: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub max_test_retries: u32,
    pub test_validation_enabled: bool,
    pub enable_expertise_preamble: bool,
    pub test_command: Option<Vec<String>>,
    /// Overrides every phase's `max_retries` (spec §9's per-phase
    /// `max_retries` is data-driven, not hardcoded).
    pub phase_max_retries: u32,
    /// Overrides every phase's `timeout_seconds`. `None` keeps each
    /// tier's built-in per-phase default (1800s).
    pub phase_timeout_seconds: Option<u64>,
}

/// Runs every phase of `workflow` for one task, applying the test-driven
/// retry loop after `implement`/`test` phases and recording results into
/// `state` and `escalation` as it goes.
pub async fn run(
    workflow: &Workflow,
    task: &Task,
    state: &mut ADWState,
    executor: &AgentExecutor<'_>,
    settings: &WorkflowSettings,
    worktree_path: &Path,
    state_store: &StateStore,
    escalation: &mut EscalationReport,
) -> AdwResult<WorkflowOutcome> {
    let delays = [1u64, 3, 5];
    let phases = workflow.phases();
    let mut test_retry_count = 0u32;
    let mut retry_context: Option<String> = None;
    let mut idx = 0usize;

    while idx < phases.len() {
        let mut phase = phases[idx].clone();
        phase.max_retries = settings.phase_max_retries;
        if let Some(timeout) = settings.phase_timeout_seconds {
            phase.timeout_seconds = timeout;
        }
        if phase.name == "review" && task.skip_review() {
            idx += 1;
            continue;
        }

        let prompt = build_prompt(&phase, task, retry_context.as_deref(), settings.enable_expertise_preamble);
        retry_context = None;

        let request = AgentRequest {
            prompt,
            adw_id: state.adw_id.clone(),
            phase_name: phase.name.clone(),
            model: Some(phase.model),
            working_dir: worktree_path.to_path_buf(),
            timeout_seconds: phase.timeout_seconds,
            skip_permissions: true,
            env_overlay: HashMap::new(),
        };

        let attempt_number = state.phases_completed.iter().filter(|p| p.phase == phase.name).count() as u32 + 1;
        let response = executor.prompt_with_retry(&request, phase.max_retries, &delays).await?;

        if let Some(sid) = &response.session_id {
            state.session_id = Some(sid.clone());
        }

        let result = PhaseResult {
            phase: phase.name.clone(),
            success: response.success,
            duration_seconds: response.duration_seconds,
            error: response.error_message.clone(),
            timestamp: Some(Utc::now()),
        };
        state.record_phase(result);
        state_store.save(state)?;

        if !response.success {
            let strategy = RetryStrategy::for_attempt(attempt_number);
            escalation.record(phase.name.as_str(), response.error_message.clone().unwrap_or_default(), strategy, response.duration_seconds);
            if phase.required {
                return Ok(WorkflowOutcome {
                    success: false,
                    commit_hash: None,
                    error_message: response.error_message,
                });
            }
            idx += 1;
            continue;
        }

        let validates = settings.test_validation_enabled && matches!(phase.name.as_str(), "implement" | "test");
        if validates {
            if let Some(command) = &settings.test_command {
                let summary = run_tests(command, worktree_path, phase.timeout_seconds).await?;
                if summary.passed {
                    idx += 1;
                } else {
                    test_retry_count += 1;
                    if test_retry_count > settings.max_test_retries {
                        escalation.record(
                            "implement",
                            truncate_middle(&summary.output, 40, 20),
                            RetryStrategy::Simplify,
                            0.0,
                        );
                        return Ok(WorkflowOutcome {
                            success: false,
                            commit_hash: None,
                            error_message: Some(format!(
                                "tests still failing after {} retries",
                                settings.max_test_retries
                            )),
                        });
                    }
                    retry_context = Some(format!(
                        "The previous implementation failed the project's tests:\n\n```\n{}\n```",
                        truncate_middle(&summary.output, 40, 20)
                    ));
                    idx = phases.iter().position(|p| p.name == "implement").unwrap_or(idx);
                    continue;
                }
            } else {
                idx += 1;
            }
        } else {
            idx += 1;
        }
    }

    let commit_hash = commit_changes(worktree_path, &state.adw_id, &task.description);
    state.commit_hash = commit_hash.clone();
    state_store.save(state)?;

    Ok(WorkflowOutcome {
        success: true,
        commit_hash,
        error_message: None,
    })
}
