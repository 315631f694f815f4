//! C9 Message channel (spec §4.8).
//!
//! `agents/<adw_id>/adw_messages.jsonl` is an append-only log of
//! human-to-agent messages; `adw_messages_processed.jsonl` is the ledger
//! the child's pre-turn hook uses to avoid re-surfacing a message it has
//! already read. Grounded on the teacher's append-only-ledger idiom
//! (`events::bus`'s history log, `beads_bridge`'s read-diff-append status
//! pattern) — no teacher file owns this exact schema, so the record shape
//! is original to the spec while the read/diff/append mechanics follow the
//! teacher's file-ledger style.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AdwError, AdwResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Normal,
    High,
    Interrupt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message: String,
    pub priority: MessagePriority,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Canonical JSON form used to hash a message for the processed-ledger
    /// diff — field order is fixed by the struct, so this is stable.
    fn canonical_json(&self) -> String {
        serde_json::to_string(self).expect("Message always serializes")
    }

    fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Messages containing the literal token "stop" (case-insensitive,
    /// word-matched) are auto-promoted to `interrupt` priority.
    fn promote_stop(mut self) -> Self {
        let lower = self.message.to_ascii_lowercase();
        let is_stop_word = lower
            .split(|c: char| !c.is_alphanumeric())
            .any(|word| word == "stop");
        if is_stop_word && self.priority != MessagePriority::Interrupt {
            self.priority = MessagePriority::Interrupt;
        }
        self
    }
}

/// Owns the message and processed-ledger files for one `adw_id`.
pub struct MessageStore {
    messages_path: PathBuf,
    processed_path: PathBuf,
}

impl MessageStore {
    pub fn new(task_dir: impl Into<PathBuf>) -> Self {
        let task_dir = task_dir.into();
        Self {
            messages_path: task_dir.join("adw_messages.jsonl"),
            processed_path: task_dir.join("adw_messages_processed.jsonl"),
        }
    }

    fn append_line(path: &PathBuf, line: &str) -> AdwResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| AdwError::io(parent, e))?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| AdwError::io(path, e))?;
        writeln!(f, "{line}").map_err(|e| AdwError::io(path, e))?;
        Ok(())
    }

    fn read_jsonl<T: for<'de> Deserialize<'de>>(path: &PathBuf) -> AdwResult<Vec<T>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path).map_err(|e| AdwError::io(path, e))?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l)
                    .map_err(|e| AdwError::invariant(format!("malformed jsonl line: {e}")))
            })
            .collect()
    }

    /// Appends a human-authored message to `adw_messages.jsonl`.
    /// Never blocks the supervisor: this is a single append, no read-modify
    /// cycle on the main file.
    pub fn send(&self, message: impl Into<String>, priority: MessagePriority) -> AdwResult<Message> {
        let msg = Message {
            message: message.into(),
            priority,
            timestamp: Utc::now(),
        }
        .promote_stop();

        let line = serde_json::to_string(&msg)
            .map_err(|e| AdwError::invariant(format!("failed to serialize message: {e}")))?;
        Self::append_line(&self.messages_path, &line)?;
        Ok(msg)
    }

    /// Returns every message not yet recorded in the processed ledger, and
    /// appends their hashes to that ledger so a later call never returns
    /// the same message twice — the exactly-once contract the child's
    /// pre-turn hook relies on.
    pub fn take_unprocessed(&self) -> AdwResult<Vec<Message>> {
        let all: Vec<Message> = Self::read_jsonl(&self.messages_path)?;
        let processed: HashSet<String> = Self::read_jsonl::<ProcessedEntry>(&self.processed_path)?
            .into_iter()
            .map(|e| e.hash)
            .collect();

        let mut fresh = Vec::new();
        for msg in all {
            let hash = msg.hash();
            if !processed.contains(&hash) {
                fresh.push((msg, hash));
            }
        }

        for (_, hash) in &fresh {
            let entry = ProcessedEntry { hash: hash.clone() };
            let line = serde_json::to_string(&entry)
                .map_err(|e| AdwError::invariant(format!("failed to serialize ledger entry: {e}")))?;
            Self::append_line(&self.processed_path, &line)?;
        }

        Ok(fresh.into_iter().map(|(m, _)| m).collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProcessedEntry {
    hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn send_then_take_surfaces_once() {
        let dir = tempdir().unwrap();
        let store = MessageStore::new(dir.path());
        store.send("hello agent", MessagePriority::Normal).unwrap();

        let first = store.take_unprocessed().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].message, "hello agent");

        let second = store.take_unprocessed().unwrap();
        assert!(second.is_empty(), "message must not be surfaced twice");
    }

    #[test]
    fn new_messages_after_a_read_are_still_surfaced() {
        let dir = tempdir().unwrap();
        let store = MessageStore::new(dir.path());
        store.send("first", MessagePriority::Normal).unwrap();
        store.take_unprocessed().unwrap();

        store.send("second", MessagePriority::Normal).unwrap();
        let next = store.take_unprocessed().unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].message, "second");
    }

    #[test]
    fn stop_token_is_promoted_to_interrupt() {
        let dir = tempdir().unwrap();
        let store = MessageStore::new(dir.path());
        let msg = store.send("please stop now", MessagePriority::Normal).unwrap();
        assert_eq!(msg.priority, MessagePriority::Interrupt);
    }

    #[test]
    fn stop_as_substring_is_not_promoted() {
        let dir = tempdir().unwrap();
        let store = MessageStore::new(dir.path());
        let msg = store.send("keep working on the workstop module", MessagePriority::Normal).unwrap();
        assert_eq!(msg.priority, MessagePriority::Normal);
    }

    #[test]
    fn missing_files_read_as_empty() {
        let dir = tempdir().unwrap();
        let store = MessageStore::new(dir.path());
        assert!(store.take_unprocessed().unwrap().is_empty());
    }
}
