//! `adw-core` — the filesystem-and-git engineering core of the ADW engine.
//!
//! Holds every piece of the Autonomous Developer Workflow supervisor that
//! has no process-spawning or CLI surface of its own: the task-file store
//! and its dependency resolver (C1), the per-task state store (C2), the
//! port allocator (C3), the worktree manager (C4), the message channel
//! (C9), and retry/recovery classification plus escalation reporting
//! (C10). `crates/adw` builds the agent executor, workflow runner,
//! supervisor and cron daemon on top of these.

#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod error;
pub mod message;
pub mod model;
pub mod ports;
pub mod retry;
pub mod state;
pub mod task_file;
pub mod worktree;

pub use config::AdwConfig;
pub use error::{AdwError, AdwResult};
pub use message::{Message, MessagePriority, MessageStore};
pub use model::{
    ModelTag, PhaseResult, PriorityTag, Tag, Task, TaskStatus, WorkflowTag, WorktreeSection,
};
pub use ports::{PortAllocator, PortPool};
pub use retry::{EscalationAttempt, EscalationReport, FailureClass, RetryStrategy};
pub use state::{ADWState, PhaseOutputPaths, StateStore};
pub use task_file::{render_task_line, TaskFileStore};
pub use worktree::{WorktreeInfo, WorktreeManager};
