//! Core data types: task status, tags, and the in-memory task representation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Blocked,
    InProgress,
    Done,
    Failed,
}

impl TaskStatus {
    /// The opaque marker character(s) used in `tasks.md`.
    pub fn marker(self) -> &'static str {
        match self {
            TaskStatus::Pending => "",
            TaskStatus::Blocked => "\u{231B}",      // hourglass
            TaskStatus::InProgress => "\u{1F6A6}",  // traffic light
            TaskStatus::Done => "\u{2713}",         // check
            TaskStatus::Failed => "\u{2717}",       // cross
        }
    }

    pub fn from_marker(marker: &str) -> Option<Self> {
        match marker.trim() {
            "" => Some(TaskStatus::Pending),
            "\u{231B}" => Some(TaskStatus::Blocked),
            "\u{1F6A6}" => Some(TaskStatus::InProgress),
            "\u{2713}" => Some(TaskStatus::Done),
            "\u{2717}" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTag {
    Opus,
    Sonnet,
    Haiku,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowTag {
    Simple,
    Standard,
    Sdlc,
    BugFix,
    Prototype,
    Full,
    Minimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTag {
    P0,
    P1,
    P2,
    P3,
}

/// A single closed-vocabulary tag, or an unrecognized one preserved verbatim.
///
/// Per the design notes, unknown tags are kept on rewrite but ignored by
/// dispatch logic — a typed enum union rather than a bare string set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Tag {
    Model(ModelTag),
    Workflow(WorkflowTag),
    Priority(PriorityTag),
    SkipReview,
    Unknown(String),
}

impl Tag {
    pub fn parse(raw: &str) -> Tag {
        let lower = raw.trim().to_ascii_lowercase();
        match lower.as_str() {
            "opus" => Tag::Model(ModelTag::Opus),
            "sonnet" => Tag::Model(ModelTag::Sonnet),
            "haiku" => Tag::Model(ModelTag::Haiku),
            "simple" => Tag::Workflow(WorkflowTag::Simple),
            "standard" => Tag::Workflow(WorkflowTag::Standard),
            "sdlc" => Tag::Workflow(WorkflowTag::Sdlc),
            "bug-fix" | "bugfix" => Tag::Workflow(WorkflowTag::BugFix),
            "prototype" => Tag::Workflow(WorkflowTag::Prototype),
            "full" => Tag::Workflow(WorkflowTag::Full),
            "minimal" => Tag::Workflow(WorkflowTag::Minimal),
            "p0" => Tag::Priority(PriorityTag::P0),
            "p1" => Tag::Priority(PriorityTag::P1),
            "p2" => Tag::Priority(PriorityTag::P2),
            "p3" => Tag::Priority(PriorityTag::P3),
            "skip-review" | "skip_review" | "no-review" | "no_review" => Tag::SkipReview,
            _ => Tag::Unknown(raw.trim().to_string()),
        }
    }

    /// The exact text to re-emit when rewriting a task line.
    pub fn render(&self) -> String {
        match self {
            Tag::Model(ModelTag::Opus) => "opus".to_string(),
            Tag::Model(ModelTag::Sonnet) => "sonnet".to_string(),
            Tag::Model(ModelTag::Haiku) => "haiku".to_string(),
            Tag::Workflow(WorkflowTag::Simple) => "simple".to_string(),
            Tag::Workflow(WorkflowTag::Standard) => "standard".to_string(),
            Tag::Workflow(WorkflowTag::Sdlc) => "sdlc".to_string(),
            Tag::Workflow(WorkflowTag::BugFix) => "bug-fix".to_string(),
            Tag::Workflow(WorkflowTag::Prototype) => "prototype".to_string(),
            Tag::Workflow(WorkflowTag::Full) => "full".to_string(),
            Tag::Workflow(WorkflowTag::Minimal) => "minimal".to_string(),
            Tag::Priority(PriorityTag::P0) => "p0".to_string(),
            Tag::Priority(PriorityTag::P1) => "p1".to_string(),
            Tag::Priority(PriorityTag::P2) => "p2".to_string(),
            Tag::Priority(PriorityTag::P3) => "p3".to_string(),
            Tag::SkipReview => "skip-review".to_string(),
            Tag::Unknown(raw) => raw.clone(),
        }
    }
}

/// One line of the task file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub status: TaskStatus,
    pub description: String,
    pub adw_id: Option<String>,
    pub commit_hash: Option<String>,
    pub error_message: Option<String>,
    pub tags: Vec<Tag>,
    pub worktree_name: String,
    pub line_number: usize,
}

impl Task {
    pub fn is_eligible(&self, all_above_done: bool) -> bool {
        match self.status {
            TaskStatus::Pending => true,
            TaskStatus::Blocked => all_above_done,
            _ => false,
        }
    }

    pub fn workflow_tag(&self) -> Option<WorkflowTag> {
        self.tags.iter().find_map(|t| match t {
            Tag::Workflow(w) => Some(*w),
            _ => None,
        })
    }

    pub fn priority_tag(&self) -> Option<PriorityTag> {
        self.tags.iter().find_map(|t| match t {
            Tag::Priority(p) => Some(*p),
            _ => None,
        })
    }

    pub fn model_tag(&self) -> Option<ModelTag> {
        self.tags.iter().find_map(|t| match t {
            Tag::Model(m) => Some(*m),
            _ => None,
        })
    }

    pub fn skip_review(&self) -> bool {
        self.tags.iter().any(|t| matches!(t, Tag::SkipReview))
    }
}

/// A named section (`## Worktree: <name>`) and the tasks beneath it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeSection {
    pub name: String,
    pub tasks: Vec<Task>,
}

/// Per-attempt phase result, the explicit non-propagating boundary between
/// phases (no exceptions cross phase boundaries — see error handling design).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: String,
    pub success: bool,
    pub duration_seconds: f64,
    pub error: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}
