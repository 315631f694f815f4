//! C2 State store — per-`adw_id` JSON snapshot of a task's progress
//! (spec §3 "Task state", §4 data model). Persisted at
//! `agents/<adw_id>/adw_state.json`, written atomically the same way the
//! task file is, grounded on `feature_registry::save`'s temp-then-rename
//! idiom plus a best-effort `.backup` copy.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AdwError, AdwResult};
use crate::model::{PhaseResult, Tag};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ADWState {
    pub adw_id: String,
    pub task_description: String,
    #[serde(default)]
    pub task_tags: Vec<Tag>,
    pub workflow_type: String,
    pub current_phase: Option<String>,
    #[serde(default)]
    pub phases_completed: Vec<PhaseResult>,
    pub worktree_name: String,
    pub worktree_path: PathBuf,
    pub branch_name: String,
    pub commit_hash: Option<String>,
    pub plan_file: Option<PathBuf>,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Carried through from the agent executor's last response so later
    /// phases can reference the same underlying agent session.
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ADWState {
    pub fn new(
        adw_id: impl Into<String>,
        task_description: impl Into<String>,
        workflow_type: impl Into<String>,
        worktree_name: impl Into<String>,
        worktree_path: impl Into<PathBuf>,
        branch_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            adw_id: adw_id.into(),
            task_description: task_description.into(),
            task_tags: Vec::new(),
            workflow_type: workflow_type.into(),
            current_phase: None,
            phases_completed: Vec::new(),
            worktree_name: worktree_name.into(),
            worktree_path: worktree_path.into(),
            branch_name: branch_name.into(),
            commit_hash: None,
            plan_file: None,
            errors: Vec::new(),
            session_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn record_phase(&mut self, result: PhaseResult) {
        if !result.success {
            if let Some(err) = &result.error {
                self.errors.push(err.clone());
            }
        }
        self.current_phase = Some(result.phase.clone());
        self.phases_completed.push(result);
        self.updated_at = Utc::now();
    }
}

/// Per-adw_id directory layout under `agents/`.
pub struct StateStore {
    agents_root: PathBuf,
}

impl StateStore {
    pub fn new(agents_root: impl Into<PathBuf>) -> Self {
        Self {
            agents_root: agents_root.into(),
        }
    }

    pub fn task_dir(&self, adw_id: &str) -> PathBuf {
        self.agents_root.join(adw_id)
    }

    fn state_path(&self, adw_id: &str) -> PathBuf {
        self.task_dir(adw_id).join("adw_state.json")
    }

    pub fn phase_dir(&self, adw_id: &str, phase: &str) -> PathBuf {
        self.task_dir(adw_id).join(phase)
    }

    /// Creates `agents/<adw_id>/` if absent and writes the initial state.
    pub fn create(&self, state: &ADWState) -> AdwResult<()> {
        let dir = self.task_dir(&state.adw_id);
        fs::create_dir_all(&dir).map_err(|e| AdwError::io(&dir, e))?;
        self.save(state)
    }

    pub fn load(&self, adw_id: &str) -> AdwResult<ADWState> {
        let path = self.state_path(adw_id);
        let content = fs::read_to_string(&path).map_err(|e| AdwError::io(&path, e))?;
        serde_json::from_str(&content)
            .map_err(|e| AdwError::invariant(format!("corrupt state for {adw_id}: {e}")))
    }

    /// Write-temp-then-rename, with a best-effort `.backup` copy of the
    /// previous snapshot — the same pattern `feature_registry::save` uses.
    pub fn save(&self, state: &ADWState) -> AdwResult<()> {
        let path = self.state_path(&state.adw_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| AdwError::io(parent, e))?;
        }

        if path.exists() {
            let backup = path.with_extension("json.backup");
            let _ = fs::copy(&path, &backup);
        }

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| AdwError::invariant(format!("failed to serialize state: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| AdwError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| AdwError::io(&path, e))?;
        Ok(())
    }

    pub fn phase_output_paths(&self, adw_id: &str, phase: &str) -> PhaseOutputPaths {
        let dir = self.phase_dir(adw_id, phase);
        PhaseOutputPaths {
            raw_jsonl: dir.join("cc_raw_output.jsonl"),
            raw_json: dir.join("cc_raw_output.json"),
            final_result: dir.join("cc_final_result.txt"),
            dir,
        }
    }
}

pub struct PhaseOutputPaths {
    pub dir: PathBuf,
    pub raw_jsonl: PathBuf,
    pub raw_json: PathBuf,
    pub final_result: PathBuf,
}

impl PhaseOutputPaths {
    pub fn ensure_dir(&self) -> AdwResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| AdwError::io(&self.dir, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_load_save_roundtrip() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let state = ADWState::new("deadbeef", "Task A", "standard", "main", "/tmp/wt", "main");
        store.create(&state).unwrap();

        let loaded = store.load("deadbeef").unwrap();
        assert_eq!(loaded.adw_id, "deadbeef");
        assert_eq!(loaded.task_description, "Task A");
    }

    #[test]
    fn record_phase_updates_errors_and_timestamp() {
        let mut state = ADWState::new("deadbeef", "Task A", "minimal", "main", "/tmp/wt", "main");
        let before = state.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        state.record_phase(PhaseResult {
            phase: "implement".to_string(),
            success: false,
            duration_seconds: 1.0,
            error: Some("boom".to_string()),
            timestamp: None,
        });
        assert_eq!(state.errors, vec!["boom".to_string()]);
        assert!(state.updated_at >= before);
        assert_eq!(state.current_phase.as_deref(), Some("implement"));
    }

    #[test]
    fn save_never_leaves_a_temp_file_behind() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let state = ADWState::new("cafebabe", "Task B", "full", "main", "/tmp/wt", "main");
        store.create(&state).unwrap();
        store.save(&state).unwrap();

        let entries: Vec<_> = fs::read_dir(store.task_dir("cafebabe"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(!entries.iter().any(|f| f.ends_with(".tmp")));
        assert!(entries.iter().any(|f| f == "adw_state.json"));
    }
}
