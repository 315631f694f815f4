//! C10 Retry/recovery (spec §4.9).
//!
//! Classifies a phase failure into retriable / fixable / fatal, picks the
//! retry strategy the workflow runner should apply next, and renders the
//! `escalation.md` report written on terminal failure. Grounded on
//! `HarnessError::is_retryable`/`recovery_suggestion`'s kind-not-type split
//! for the retriable/fatal boundary, and on the teacher's regex-plus-
//! explicit-code classification idiom (formerly `feedback::error_parser`,
//! since removed as out of scope) for the fixable-vs-fatal heuristic
//! matching — not its content, which classified ensemble-vote
//! disagreements rather than agent/test failures.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AdwError, AdwResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Transient: network, rate-limit, flaky test. Retry as-is.
    Retriable,
    /// Deterministic and addressable by re-prompting: missing import, type
    /// error, assertion failure.
    Fixable,
    /// Permission denied, internal invariant. Do not retry.
    Fatal,
}

/// Classifies an `AdwError` by the kind of remediation it calls for, not
/// merely whether a retry ladder applies (that's `AdwError::is_retryable`).
pub fn classify(error: &AdwError) -> FailureClass {
    match error {
        AdwError::Transient { .. } | AdwError::Timeout { .. } => FailureClass::Retriable,
        AdwError::ChildFailure { message, .. } => classify_message(message),
        AdwError::Invariant { .. } | AdwError::Configuration { .. } => FailureClass::Fatal,
        AdwError::Domain { .. } | AdwError::Git { .. } | AdwError::Io { .. } => FailureClass::Fatal,
    }
}

/// Syntactic classification over a raw error/test-failure message, used
/// both for `ChildFailure` payloads and for test-output summaries handed
/// back from the workflow runner.
pub fn classify_message(message: &str) -> FailureClass {
    let lower = message.to_ascii_lowercase();
    if lower.contains("permission denied") || lower.contains("not permitted") {
        return FailureClass::Fatal;
    }
    if lower.contains("rate limit") || lower.contains("429") || lower.contains("timed out") || lower.contains("timeout") {
        return FailureClass::Retriable;
    }
    if lower.contains("connection") || lower.contains("network") || lower.contains("flaky") {
        return FailureClass::Retriable;
    }
    if lower.contains("importerror")
        || lower.contains("no module named")
        || lower.contains("cannot find")
        || lower.contains("unresolved import")
        || lower.contains("type error")
        || lower.contains("typeerror")
        || lower.contains("assertionerror")
        || lower.contains("assertion failed")
        || lower.contains("test failed")
        || lower.contains("undefined")
    {
        return FailureClass::Fixable;
    }
    FailureClass::Fatal
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Re-invoke the failing phase with an appended retry-context block.
    SameApproach,
    /// Prompt the agent to try a different design (third attempt).
    Alternative,
    /// Prompt the agent for the smallest viable change (final attempt).
    Simplify,
}

impl RetryStrategy {
    /// `attempt` is 1-based: the attempt about to run. Per spec §4.9 the
    /// first two attempts retry with the same approach, the third tries an
    /// alternative design, and any further attempt asks for the simplest
    /// viable change.
    pub fn for_attempt(attempt: u32) -> Self {
        match attempt {
            1 | 2 => RetryStrategy::SameApproach,
            3 => RetryStrategy::Alternative,
            _ => RetryStrategy::Simplify,
        }
    }
}

/// Truncates a block of text to `head` leading and `tail` trailing lines,
/// eliding the middle — used to keep retry-context prompts and escalation
/// reports bounded when a stack trace or test summary is large.
pub fn truncate_middle(text: &str, head: usize, tail: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= head + tail {
        return text.to_string();
    }
    let elided = lines.len() - head - tail;
    let mut out = lines[..head].join("\n");
    out.push_str(&format!("\n... [{elided} lines elided] ...\n"));
    out.push_str(&lines[lines.len() - tail..].join("\n"));
    out
}

fn heuristic_suggestion(error: &str) -> &'static str {
    let lower = error.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        "timeout -> chunk the work into smaller phases or raise timeout_seconds"
    } else if lower.contains("import") || lower.contains("module") || lower.contains("dependency") {
        "import error -> verify dependencies are installed and declared"
    } else if lower.contains("permission denied") {
        "permission denied -> check sandbox and filesystem permissions for the worktree"
    } else if lower.contains("rate limit") {
        "rate limit -> the external CLI is being throttled; widen the backoff delays"
    } else if lower.contains("test failed") || lower.contains("assertion") {
        "test failure -> review the failed test names and retry with additional context"
    } else {
        "inspect the phase's cc_raw_output.jsonl for the underlying agent error"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationAttempt {
    pub phase: String,
    pub error: String,
    pub strategy: RetryStrategy,
    pub duration_seconds: f64,
    pub timestamp: DateTime<Utc>,
}

/// Human-readable markdown artefact at `agents/<adw_id>/escalation.md`,
/// written on terminal task failure (spec §3 "Escalation report").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationReport {
    pub adw_id: String,
    pub task_description: String,
    pub attempts: Vec<EscalationAttempt>,
}

impl EscalationReport {
    pub fn new(adw_id: impl Into<String>, task_description: impl Into<String>) -> Self {
        Self {
            adw_id: adw_id.into(),
            task_description: task_description.into(),
            attempts: Vec::new(),
        }
    }

    pub fn record(&mut self, phase: impl Into<String>, error: impl Into<String>, strategy: RetryStrategy, duration_seconds: f64) {
        self.attempts.push(EscalationAttempt {
            phase: phase.into(),
            error: error.into(),
            strategy,
            duration_seconds,
            timestamp: Utc::now(),
        });
    }

    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# Escalation report: {}\n\n", self.adw_id));
        out.push_str(&format!("**Task:** {}\n\n", self.task_description));
        out.push_str(&format!("**Attempts:** {}\n\n", self.attempts.len()));

        for (i, attempt) in self.attempts.iter().enumerate() {
            out.push_str(&format!("## Attempt {} — phase `{}`\n\n", i + 1, attempt.phase));
            out.push_str(&format!("- Strategy: `{:?}`\n", attempt.strategy));
            out.push_str(&format!("- Duration: {:.1}s\n", attempt.duration_seconds));
            out.push_str(&format!("- Timestamp: {}\n", attempt.timestamp.to_rfc3339()));
            out.push_str("- Error:\n\n```\n");
            out.push_str(&truncate_middle(&attempt.error, 20, 10));
            out.push_str("\n```\n\n");
            out.push_str(&format!("- Suggestion: {}\n\n", heuristic_suggestion(&attempt.error)));
        }

        out
    }

    pub fn write_to(&self, path: &Path) -> AdwResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| AdwError::io(parent, e))?;
        }
        fs::write(path, self.render_markdown()).map_err(|e| AdwError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn classifies_rate_limit_as_retriable() {
        assert_eq!(classify_message("429 rate limit exceeded"), FailureClass::Retriable);
    }

    #[test]
    fn classifies_import_error_as_fixable() {
        assert_eq!(classify_message("ImportError: no module named foo"), FailureClass::Fixable);
    }

    #[test]
    fn classifies_permission_denied_as_fatal() {
        assert_eq!(classify_message("Permission denied writing to /etc"), FailureClass::Fatal);
    }

    #[test]
    fn strategy_escalates_by_attempt_number() {
        assert_eq!(RetryStrategy::for_attempt(1), RetryStrategy::SameApproach);
        assert_eq!(RetryStrategy::for_attempt(2), RetryStrategy::SameApproach);
        assert_eq!(RetryStrategy::for_attempt(3), RetryStrategy::Alternative);
        assert_eq!(RetryStrategy::for_attempt(4), RetryStrategy::Simplify);
        assert_eq!(RetryStrategy::for_attempt(99), RetryStrategy::Simplify);
    }

    #[test]
    fn truncate_middle_elides_only_when_over_budget() {
        let short = "a\nb\nc";
        assert_eq!(truncate_middle(short, 5, 5), short);

        let long: String = (0..100).map(|i| format!("line{i}")).collect::<Vec<_>>().join("\n");
        let truncated = truncate_middle(&long, 5, 5);
        assert!(truncated.contains("elided"));
        assert!(truncated.contains("line0"));
        assert!(truncated.contains("line99"));
        assert!(!truncated.contains("line50"));
    }

    #[test]
    fn escalation_report_renders_and_writes() {
        let mut report = EscalationReport::new("deadbeef", "Fix the thing");
        report.record("implement", "ImportError: no module named foo", RetryStrategy::SameApproach, 12.5);
        report.record("implement", "ImportError: no module named foo", RetryStrategy::Alternative, 9.1);

        let dir = tempdir().unwrap();
        let path = dir.path().join("escalation.md");
        report.write_to(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("Escalation report: deadbeef"));
        assert!(content.contains("Attempt 1"));
        assert!(content.contains("Attempt 2"));
        assert!(content.contains("import error"));
    }
}
