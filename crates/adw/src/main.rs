//! `adw` — the cron/supervisor-facing CLI surface (spec §6).
//!
//! `run` drives the poll-dispatch-reap loop (`daemon::Daemon::run_loop`);
//! `add`, `list`, `cancel` and `retry` are one-shot operations against
//! `tasks.md` for a human (or a chat-integration adapter, out of scope
//! here) to drive work without starting the daemon; `message` is the
//! human-facing writer side of the message channel (spec §4.8). Grounded
//! on the teacher's
//! `swarm-agents::main` clap-free entrypoint style generalized to a real
//! `clap::Parser`/`Subcommand` surface, following the `rust-cluster-mcp`
//! binary's `#[derive(Parser)]` usage in the same repo.

use std::path::PathBuf;
use std::process::ExitCode;

use adw_core::config::AdwConfig;
use adw_core::error::AdwError;
use adw_core::message::{MessagePriority, MessageStore};
use adw_core::model::{Tag, TaskStatus};
use adw_core::state::StateStore;
use adw_core::task_file::TaskFileStore;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

/// Autonomous Developer Workflow engine: a local supervisor that dispatches
/// coding-agent child processes against a human-curated task list.
#[derive(Parser, Debug)]
#[command(name = "adw", author, version, about, long_about = None)]
struct Cli {
    /// Path to the project root (defaults to the current directory).
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Path to the config file (defaults to `~/.adw/config.toml`, overridable via ADW_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity: -v for debug, -vv for trace. Overrides RUST_LOG.
    #[arg(short = 'v', long = "verbose", global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the cron daemon loop: poll the task file, dispatch eligible
    /// tasks up to the concurrency ceiling, reap completions, repeat.
    Run {
        /// Dispatch a single pass and exit instead of looping.
        #[arg(long)]
        once: bool,
        /// Override the configured poll interval, in seconds.
        #[arg(long)]
        poll_interval: Option<u64>,
        /// Override the configured concurrency ceiling.
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
    /// Append a new pending task to the task file.
    Add {
        /// The task's free-form description (the prompt seed for the agent).
        description: String,
        /// The worktree section to append under (created if absent).
        #[arg(long, default_value = "main")]
        worktree: String,
        /// Workflow tier tag: simple, standard, sdlc, bug-fix, prototype, full, minimal.
        #[arg(long)]
        workflow: Option<String>,
        /// Model tag: opus, sonnet, haiku.
        #[arg(long)]
        model: Option<String>,
        /// Priority tag: p0, p1, p2, p3.
        #[arg(long)]
        priority: Option<String>,
    },
    /// List tasks, optionally filtered by status, with eligibility noted.
    List {
        /// Filter to one status: pending, blocked, in_progress, done, failed.
        #[arg(long)]
        status: Option<String>,
    },
    /// Kill a running task and mark it failed with reason "cancelled".
    Cancel {
        /// The task's adw_id.
        adw_id: String,
    },
    /// Re-queue a failed task as pending for another attempt.
    Retry {
        /// The task's adw_id.
        adw_id: String,
    },
    /// Append an out-of-band message to a running task's queue
    /// (`agents/<adw_id>/adw_messages.jsonl`), surfaced to the agent on its
    /// next scheduled hook invocation.
    Message {
        /// The task's adw_id.
        adw_id: String,
        /// The message text.
        text: String,
        /// Priority: normal, high, interrupt. A literal "stop" token in the
        /// text is auto-promoted to interrupt regardless of this flag.
        #[arg(long, default_value = "normal")]
        priority: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "adw=info",
        1 => "adw=debug",
        _ => "adw=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            error!(error = %e, recovery = %e.recovery_suggestion(), "adw command failed");
            match e {
                AdwError::Configuration { .. } => ExitCode::from(2),
                _ => ExitCode::from(1),
            }
        }
    }
}

async fn run(cli: Cli) -> Result<(), AdwError> {
    let repo_root = cli
        .repo
        .canonicalize()
        .map_err(|e| AdwError::io(&cli.repo, e))?;

    let mut config = AdwConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run { once, poll_interval, max_concurrent } => {
            if let Some(p) = poll_interval {
                config.daemon.poll_interval_seconds = p;
            }
            if let Some(m) = max_concurrent {
                config.daemon.max_concurrent = m;
            }
            run_daemon(repo_root, config, once).await
        }
        Command::Add { description, worktree, workflow, model, priority } => {
            add_task(&repo_root, &config, &worktree, &description, workflow, model, priority)
        }
        Command::List { status } => list_tasks(&repo_root, &config, status.as_deref()),
        Command::Cancel { adw_id } => cancel_task(&repo_root, &config, &adw_id),
        Command::Retry { adw_id } => retry_task(&repo_root, &config, &adw_id),
        Command::Message { adw_id, text, priority } => send_message(&repo_root, &config, &adw_id, &text, &priority),
    }
}

async fn run_daemon(repo_root: PathBuf, config: AdwConfig, once: bool) -> Result<(), AdwError> {
    if which::which(&config.core.agent_cli).is_err() {
        return Err(AdwError::configuration(
            format!("external code-generation CLI `{}` not found on PATH", config.core.agent_cli),
            "Install the CLI or set core.agent_cli / ADW_AGENT_CLI to its path",
        ));
    }

    let tasks_file = repo_root.join(&config.core.tasks_file);
    if !tasks_file.exists() {
        return Err(AdwError::configuration(
            format!("task file not found at {}", tasks_file.display()),
            "Run `adw add <description>` to create tasks.md, or point core.tasks_file at an existing file",
        ));
    }

    info!(
        repo = %repo_root.display(),
        poll_interval = config.daemon.poll_interval_seconds,
        max_concurrent = config.daemon.max_concurrent,
        once,
        "adw daemon starting"
    );

    let daemon = adw::Daemon::new(repo_root, config)?;
    daemon.run_loop(once).await
}

fn add_task(
    repo_root: &std::path::Path,
    config: &AdwConfig,
    worktree: &str,
    description: &str,
    workflow: Option<String>,
    model: Option<String>,
    priority: Option<String>,
) -> Result<(), AdwError> {
    let store = TaskFileStore::new(repo_root.join(&config.core.tasks_file));

    let mut tags = Vec::new();
    for raw in [workflow, model, priority].into_iter().flatten() {
        let tag = Tag::parse(&raw);
        if matches!(tag, Tag::Unknown(_)) {
            warn!(tag = %raw, "unrecognized tag, it will be preserved but ignored by dispatch logic");
        }
        tags.push(tag);
    }

    store.add_task(worktree, description, tags)?;
    println!("added task to worktree '{worktree}': {description}");
    Ok(())
}

fn list_tasks(repo_root: &std::path::Path, config: &AdwConfig, status_filter: Option<&str>) -> Result<(), AdwError> {
    let store = TaskFileStore::new(repo_root.join(&config.core.tasks_file));
    let sections = store.load()?;
    let eligible = store.get_eligible()?;
    let eligible_descriptions: std::collections::HashSet<&str> =
        eligible.iter().map(|t| t.description.as_str()).collect();

    let wanted = status_filter.map(parse_status_filter).transpose()?;

    for section in &sections {
        println!("## Worktree: {}", section.name);
        for task in &section.tasks {
            if let Some(status) = wanted {
                if task.status != status {
                    continue;
                }
            }
            let marker = status_label(task.status);
            let eligible_marker = if eligible_descriptions.contains(task.description.as_str()) {
                " [eligible]"
            } else {
                ""
            };
            let adw_id = task.adw_id.as_deref().unwrap_or("-");
            println!("  [{marker:<11}] {adw_id:<8} {}{}", task.description, eligible_marker);
            if let Some(err) = &task.error_message {
                println!("      error: {err}");
            }
        }
    }
    Ok(())
}

fn parse_status_filter(raw: &str) -> Result<TaskStatus, AdwError> {
    match raw {
        "pending" => Ok(TaskStatus::Pending),
        "blocked" => Ok(TaskStatus::Blocked),
        "in_progress" => Ok(TaskStatus::InProgress),
        "done" => Ok(TaskStatus::Done),
        "failed" => Ok(TaskStatus::Failed),
        other => Err(AdwError::domain(format!("unknown status filter '{other}'"))),
    }
}

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Blocked => "blocked",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Done => "done",
        TaskStatus::Failed => "failed",
    }
}

fn cancel_task(repo_root: &std::path::Path, config: &AdwConfig, adw_id: &str) -> Result<(), AdwError> {
    let store = TaskFileStore::new(repo_root.join(&config.core.tasks_file));
    let task = store.mark_cancelled(adw_id)?;
    info!(adw_id, description = %task.description, "task marked cancelled");
    println!(
        "marked {adw_id} failed (cancelled). If a daemon owns its child process, it will reap the live child on its next poll."
    );
    Ok(())
}

fn retry_task(repo_root: &std::path::Path, config: &AdwConfig, adw_id: &str) -> Result<(), AdwError> {
    let store = TaskFileStore::new(repo_root.join(&config.core.tasks_file));
    let task = store.requeue_pending(adw_id)?;
    println!("re-queued as pending: {}", task.description);
    Ok(())
}

fn send_message(
    repo_root: &std::path::Path,
    config: &AdwConfig,
    adw_id: &str,
    text: &str,
    priority: &str,
) -> Result<(), AdwError> {
    let priority = match priority {
        "normal" => MessagePriority::Normal,
        "high" => MessagePriority::High,
        "interrupt" => MessagePriority::Interrupt,
        other => return Err(AdwError::domain(format!("unknown priority '{other}'"))),
    };

    let agents_dir = repo_root.join(&config.workspace.agents_dir);
    let task_dir = StateStore::new(agents_dir).task_dir(adw_id);
    if !task_dir.exists() {
        return Err(AdwError::domain(format!("no agent directory found for adw_id {adw_id}")));
    }

    let message = MessageStore::new(task_dir).send(text, priority)?;
    info!(adw_id, priority = ?message.priority, "queued message for agent");
    println!("queued message for {adw_id} (priority: {:?})", message.priority);
    Ok(())
}
