//! `adw` — the process-spawning half of the ADW engine: the agent executor
//! (C5), workflow runner (C6), supervisor (C7) and cron daemon (C8) built
//! on top of `adw-core`'s filesystem-and-git primitives.

pub mod adw_id;
pub mod daemon;
pub mod executor;
pub mod supervisor;
pub mod test_detect;
pub mod workflow;

pub use daemon::Daemon;
pub use executor::{AgentExecutor, AgentRequest, AgentResponse, RetryCode};
pub use supervisor::{CancelToken, Completion, Supervisor};
pub use workflow::{select_workflow, Workflow, WorkflowOutcome, WorkflowSettings};
