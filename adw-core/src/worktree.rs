//! C4 Worktree manager (spec §4.4).
//!
//! Grounded directly on `WorktreeBridge`, generalized from a single
//! hardcoded `swarm/<issue_id>` branch convention to the spec's
//! worktree-name-is-the-branch-name convention with an explicit
//! `base_branch` and a `remove(force)` that is a pure filesystem+git
//! operation (not a merge — the workflow runner, not this component,
//! decides what becomes of a finished branch).

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{AdwError, AdwResult};

#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub name: String,
    pub path: PathBuf,
    pub branch: String,
}

pub struct WorktreeManager {
    repo_root: PathBuf,
    worktrees_dir: PathBuf,
}

impl WorktreeManager {
    /// `repo_root` must be a git repository; `worktrees_dir` is the
    /// canonical parent directory for worktrees (spec: `.worktrees/<name>`).
    pub fn new(repo_root: impl Into<PathBuf>, worktrees_dir: impl Into<PathBuf>) -> AdwResult<Self> {
        let repo_root = repo_root.into();
        let check = Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&repo_root)
            .output()
            .map_err(|e| AdwError::git("rev-parse", e.to_string()))?;
        if !check.status.success() {
            return Err(AdwError::configuration(
                format!("not a git repository: {}", repo_root.display()),
                "Run this daemon from inside a git-initialized project",
            ));
        }

        let worktrees_dir = worktrees_dir.into();
        std::fs::create_dir_all(&worktrees_dir).map_err(|e| AdwError::io(&worktrees_dir, e))?;

        Ok(Self {
            repo_root,
            worktrees_dir,
        })
    }

    pub fn worktree_path(&self, name: &str) -> PathBuf {
        self.worktrees_dir.join(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.worktree_path(name).exists()
    }

    /// `create(worktree_name, base_branch) -> path`. Idempotent: if a
    /// worktree with the name already exists, returns its existing path
    /// rather than erroring.
    pub fn create(&self, name: &str, base_branch: &str) -> AdwResult<PathBuf> {
        let path = self.worktree_path(name);
        if path.exists() {
            return Ok(path);
        }

        let output = Command::new("git")
            .args([
                "worktree",
                "add",
                "-b",
                name,
                &path.display().to_string(),
                base_branch,
            ])
            .current_dir(&self.repo_root)
            .output()
            .map_err(|e| AdwError::git("worktree add", e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(AdwError::git("worktree add", stderr));
        }

        Ok(path)
    }

    fn has_uncommitted_changes(&self, path: &Path) -> AdwResult<bool> {
        let status = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(path)
            .output()
            .map_err(|e| AdwError::git("status", e.to_string()))?;
        Ok(!String::from_utf8_lossy(&status.stdout).trim().is_empty())
    }

    /// Prunes the worktree and optionally deletes its branch. Refuses to
    /// remove a worktree with uncommitted changes unless `force`.
    pub fn remove(&self, name: &str, force: bool) -> AdwResult<()> {
        let path = self.worktree_path(name);
        if !path.exists() {
            return Ok(());
        }

        if !force && self.has_uncommitted_changes(&path)? {
            return Err(AdwError::domain(format!(
                "worktree {name} has uncommitted changes; pass force=true to discard"
            )));
        }

        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        let path_str = path.display().to_string();
        args.push(&path_str);

        let output = Command::new("git")
            .args(&args)
            .current_dir(&self.repo_root)
            .output()
            .map_err(|e| AdwError::git("worktree remove", e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(AdwError::git("worktree remove", stderr));
        }

        let del = Command::new("git")
            .args(["branch", "-D", name])
            .current_dir(&self.repo_root)
            .output()
            .map_err(|e| AdwError::git("branch -D", e.to_string()))?;
        if !del.status.success() {
            tracing::warn!(
                name,
                stderr = %String::from_utf8_lossy(&del.stderr),
                "failed to delete worktree branch after removal"
            );
        }

        Ok(())
    }

    /// `list() -> [name, path, branch]`.
    pub fn list(&self) -> AdwResult<Vec<WorktreeInfo>> {
        let output = Command::new("git")
            .args(["worktree", "list", "--porcelain"])
            .current_dir(&self.repo_root)
            .output()
            .map_err(|e| AdwError::git("worktree list", e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(AdwError::git("worktree list", stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut infos = Vec::new();
        let mut current_path: Option<PathBuf> = None;
        let mut current_branch: Option<String> = None;

        for line in stdout.lines() {
            if let Some(path_str) = line.strip_prefix("worktree ") {
                if let (Some(path), Some(branch)) = (current_path.take(), current_branch.take()) {
                    infos.push(Self::info_from(path, branch));
                }
                current_path = Some(PathBuf::from(path_str));
            } else if let Some(branch_ref) = line.strip_prefix("branch refs/heads/") {
                current_branch = Some(branch_ref.to_string());
            }
        }
        if let (Some(path), Some(branch)) = (current_path, current_branch) {
            infos.push(Self::info_from(path, branch));
        }

        Ok(infos.into_iter().filter(|i| i.path.starts_with(&self.worktrees_dir)).collect())
    }

    fn info_from(path: PathBuf, branch: String) -> WorktreeInfo {
        let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| branch.clone());
        WorktreeInfo { name, path, branch }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::tempdir;

    fn init_repo(path: &Path) {
        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            StdCommand::new("git").args(&args).current_dir(path).output().unwrap();
        }
        std::fs::write(path.join("README.md"), "hello").unwrap();
        StdCommand::new("git").args(["add", "."]).current_dir(path).output().unwrap();
        StdCommand::new("git").args(["commit", "-m", "init"]).current_dir(path).output().unwrap();
    }

    #[test]
    fn create_is_idempotent_and_list_finds_it() {
        let repo_dir = tempdir().unwrap();
        init_repo(repo_dir.path());
        let wt_dir = tempdir().unwrap();

        let manager = WorktreeManager::new(repo_dir.path(), wt_dir.path()).unwrap();
        let path1 = manager.create("feature-x", "master").or_else(|_| manager.create("feature-x", "main")).unwrap();
        let path2 = manager.create("feature-x", "master").or_else(|_| manager.create("feature-x", "main")).unwrap();
        assert_eq!(path1, path2);

        let list = manager.list().unwrap();
        assert!(list.iter().any(|w| w.name == "feature-x"));
    }

    #[test]
    fn remove_refuses_without_force_when_dirty() {
        let repo_dir = tempdir().unwrap();
        init_repo(repo_dir.path());
        let wt_dir = tempdir().unwrap();
        let manager = WorktreeManager::new(repo_dir.path(), wt_dir.path()).unwrap();

        let default_branch = StdCommand::new("git")
            .args(["branch", "--show-current"])
            .current_dir(repo_dir.path())
            .output()
            .unwrap();
        let base = String::from_utf8_lossy(&default_branch.stdout).trim().to_string();

        let path = manager.create("dirty", &base).unwrap();
        std::fs::write(path.join("uncommitted.txt"), "wip").unwrap();

        assert!(manager.remove("dirty", false).is_err());
        assert!(manager.remove("dirty", true).is_ok());
    }
}
