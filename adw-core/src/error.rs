//! Error taxonomy for the ADW engine.
//!
//! Mirrors the error-kind-not-type classification from the design: every
//! variant knows whether it is retryable and can produce a one-line
//! recovery suggestion, so callers never have to re-derive that from the
//! message text.

use std::path::PathBuf;
use thiserror::Error;

pub type AdwResult<T> = Result<T, AdwError>;

#[derive(Debug, Error)]
pub enum AdwError {
    /// Missing task file, missing external CLI on PATH, unparseable config.
    /// Fatal at daemon start.
    #[error("configuration error: {message}")]
    Configuration { message: String, recovery: String },

    /// Task not found, stale description, duplicate adw_id.
    #[error("domain error: {message}")]
    Domain { message: String },

    /// Child rate-limited, network blip, short test flake.
    #[error("transient error: {message}")]
    Transient { message: String },

    /// Agent CLI exited non-zero with a parseable error record.
    #[error("agent failed in phase {phase}: {message}")]
    ChildFailure {
        phase: String,
        message: String,
        code: Option<i32>,
    },

    /// Child exceeded its wall-clock budget.
    #[error("phase {phase} timed out after {elapsed_seconds}s")]
    Timeout { phase: String, elapsed_seconds: u64 },

    /// Unexpected internal state (e.g. adw_id collision).
    #[error("invariant violation: {message}")]
    Invariant { message: String },

    #[error("git {operation} failed: {message}")]
    Git { operation: String, message: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AdwError {
    pub fn configuration(message: impl Into<String>, recovery: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            recovery: recovery.into(),
        }
    }

    pub fn domain(message: impl Into<String>) -> Self {
        Self::Domain {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn child_failure(phase: impl Into<String>, message: impl Into<String>, code: Option<i32>) -> Self {
        Self::ChildFailure {
            phase: phase.into(),
            message: message.into(),
            code,
        }
    }

    pub fn timeout(phase: impl Into<String>, elapsed_seconds: u64) -> Self {
        Self::Timeout {
            phase: phase.into(),
            elapsed_seconds,
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }

    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the workflow runner / supervisor should retry the operation
    /// that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::ChildFailure { .. } | Self::Timeout { .. }
        )
    }

    /// A human-actionable one-liner, the way `HarnessError::recovery_suggestion`
    /// does for the harness's MCP-facing errors.
    pub fn recovery_suggestion(&self) -> String {
        match self {
            Self::Configuration { recovery, .. } => recovery.clone(),
            Self::Domain { .. } => "Run `adw list` to see current task state".to_string(),
            Self::Transient { .. } => "Transient failure; the caller will retry automatically".to_string(),
            Self::ChildFailure { phase, .. } => {
                format!("Inspect agents/<adw_id>/{phase}/cc_raw_output.jsonl for the agent's error")
            }
            Self::Timeout { phase, .. } => {
                format!("Phase {phase} exceeded its timeout; consider chunking the task or raising timeout_seconds")
            }
            Self::Invariant { .. } => "Internal invariant violated; this is likely a bug, please report it".to_string(),
            Self::Git { .. } => "Check `git status` in the affected worktree".to_string(),
            Self::Io { path, .. } => format!("Check permissions and existence of {}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(AdwError::transient("x").is_retryable());
        assert!(AdwError::child_failure("implement", "x", Some(1)).is_retryable());
        assert!(AdwError::timeout("test", 30).is_retryable());
        assert!(!AdwError::domain("x").is_retryable());
        assert!(!AdwError::invariant("x").is_retryable());
        assert!(!AdwError::configuration("x", "y").is_retryable());
    }

    #[test]
    fn recovery_suggestions_are_non_empty() {
        let errs = vec![
            AdwError::configuration("missing", "install it"),
            AdwError::domain("not found"),
            AdwError::transient("blip"),
            AdwError::child_failure("plan", "boom", None),
            AdwError::timeout("implement", 120),
            AdwError::invariant("dup id"),
            AdwError::git("worktree add", "fatal"),
        ];
        for e in errs {
            assert!(!e.recovery_suggestion().is_empty());
        }
    }
}
