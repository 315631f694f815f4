//! C1 Task-file store and C1's dependency resolver (spec §4.1, §4.2).
//!
//! `tasks.md` is the single source of truth for work: a line-oriented text
//! file with worktree headers, task lines, and everything else treated as
//! comments. Every mutation rewrites exactly one line, via write-to-temp
//! then rename, the same atomic-write idiom `feature_registry::save` uses
//! for its JSON registry.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::{AdwError, AdwResult};
use crate::model::{Tag, Task, TaskStatus, WorktreeSection};

const DEFAULT_WORKTREE: &str = "main";

fn task_line_regex() -> Regex {
    // [<marker>(,<adw_id>)?(,<commit>)?] <description> ({tags})? (// comment)?
    Regex::new(
        r"(?x)
        ^\[
            (?P<marker>[^,\]]*)
            (?:,\s*(?P<adw_id>[0-9a-f]{8}))?
            (?:,\s*(?P<commit>[0-9a-f]{4,}))?
        \]
        \s*(?P<desc>[^{}]*?)\s*
        (?:\{(?P<tags>[^}]*)\})?
        \s*(?://\s*(?P<comment>.*))?
        $
        ",
    )
    .expect("static task line regex is valid")
}

fn worktree_header_regex() -> Regex {
    Regex::new(r"^##\s*Worktree:\s*(?P<name>.+?)\s*$").expect("static header regex is valid")
}

/// Parses one physical line into a `Task`, if it looks like a task line.
///
/// Returns `Ok(None)` for anything that isn't a task line (worktree headers,
/// comments, blank lines) — per spec, malformed task-looking lines are
/// skipped with a warning, never abort parsing.
fn parse_task_line(line: &str, worktree_name: &str, line_number: usize) -> Option<Task> {
    let trimmed = line.trim_end();
    if !trimmed.trim_start().starts_with('[') {
        return None;
    }
    let caps = task_line_regex().captures(trimmed.trim_start())?;

    let marker = caps.name("marker").map(|m| m.as_str()).unwrap_or("");
    let status = match TaskStatus::from_marker(marker) {
        Some(s) => s,
        None => {
            tracing::warn!(line_number, marker, "unrecognized status marker, skipping line");
            return None;
        }
    };

    // Description must contain literal '{' or '}' only inside the escaped
    // tag block — the regex already excludes braces from `desc`, so a
    // description containing a stray unescaped brace fails to match the
    // tag-block group cleanly and is rejected here (open question: braces
    // in descriptions are forbidden).
    let desc = caps.name("desc").map(|m| m.as_str().trim().to_string()).unwrap_or_default();
    if desc.is_empty() {
        tracing::warn!(line_number, "task line has empty description, skipping");
        return None;
    }

    let adw_id = caps.name("adw_id").map(|m| m.as_str().to_string());
    let commit_hash = caps.name("commit").map(|m| m.as_str().to_string());
    let error_message = if status == TaskStatus::Failed {
        caps.name("comment").map(|m| m.as_str().to_string())
    } else {
        None
    };

    let tags = caps
        .name("tags")
        .map(|m| {
            m.as_str()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(Tag::parse)
                .collect()
        })
        .unwrap_or_default();

    Some(Task {
        status,
        description: desc,
        adw_id,
        commit_hash,
        error_message,
        tags,
        worktree_name: worktree_name.to_string(),
        line_number,
    })
}

/// Renders a task back into its canonical line form.
pub fn render_task_line(task: &Task) -> String {
    let mut bracket = task.status.marker().to_string();
    if let Some(id) = &task.adw_id {
        bracket.push_str(", ");
        bracket.push_str(id);
    }
    if let Some(commit) = &task.commit_hash {
        bracket.push_str(", ");
        bracket.push_str(commit);
    }

    let mut line = format!("[{bracket}] {}", task.description);

    if !task.tags.is_empty() {
        let tags = task.tags.iter().map(Tag::render).collect::<Vec<_>>().join(", ");
        line.push_str(&format!(" {{{tags}}}"));
    }

    if let Some(err) = &task.error_message {
        line.push_str(&format!(" // {err}"));
    }

    line
}

/// Store over a single `tasks.md` file. Stateless: every call re-reads the
/// file from disk, so concurrent daemon passes always see the latest
/// on-disk truth; an in-process mutex around the store serializes writers.
pub struct TaskFileStore {
    path: PathBuf,
}

impl TaskFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_lines(&self) -> AdwResult<Vec<String>> {
        if !self.path.exists() {
            return Err(AdwError::configuration(
                format!("task file not found: {}", self.path.display()),
                "Run `adw add <description>` to create tasks.md, or point core.tasks_file at an existing file",
            ));
        }
        let content = fs::read_to_string(&self.path).map_err(|e| AdwError::io(&self.path, e))?;
        Ok(content.lines().map(str::to_string).collect())
    }

    fn write_lines_atomic(&self, lines: &[String]) -> AdwResult<()> {
        let mut content = lines.join("\n");
        content.push('\n');

        let tmp_path = self.path.with_extension("md.tmp");
        {
            let mut f = fs::File::create(&tmp_path).map_err(|e| AdwError::io(&tmp_path, e))?;
            f.write_all(content.as_bytes()).map_err(|e| AdwError::io(&tmp_path, e))?;
            f.sync_all().map_err(|e| AdwError::io(&tmp_path, e))?;
        }
        fs::rename(&tmp_path, &self.path).map_err(|e| AdwError::io(&self.path, e))?;
        Ok(())
    }

    /// `load()` — ordered list of (worktree, tasks\[\]), preserving physical order.
    pub fn load(&self) -> AdwResult<Vec<WorktreeSection>> {
        let lines = self.read_lines()?;
        let mut sections: Vec<WorktreeSection> = Vec::new();
        let mut current = DEFAULT_WORKTREE.to_string();

        for (idx, line) in lines.iter().enumerate() {
            let line_number = idx + 1;
            if let Some(caps) = worktree_header_regex().captures(line) {
                current = caps.name("name").unwrap().as_str().to_string();
                if !sections.iter().any(|s: &WorktreeSection| s.name == current) {
                    sections.push(WorktreeSection {
                        name: current.clone(),
                        tasks: Vec::new(),
                    });
                }
                continue;
            }

            if let Some(task) = parse_task_line(line, &current, line_number) {
                let section = match sections.iter_mut().find(|s| s.name == current) {
                    Some(s) => s,
                    None => {
                        sections.push(WorktreeSection {
                            name: current.clone(),
                            tasks: Vec::new(),
                        });
                        sections.last_mut().unwrap()
                    }
                };
                section.tasks.push(task);
            }
        }

        Ok(sections)
    }

    /// `get_eligible()` — flat list of tasks eligible across all worktrees,
    /// preserving per-worktree order (spec §4.2: the resolver never crosses
    /// worktrees).
    pub fn get_eligible(&self) -> AdwResult<Vec<Task>> {
        let sections = self.load()?;
        let mut eligible = Vec::new();
        for section in &sections {
            let mut all_above_done = true;
            for task in &section.tasks {
                if task.is_eligible(all_above_done) {
                    eligible.push(task.clone());
                }
                all_above_done = all_above_done && task.status == TaskStatus::Done;
            }
        }
        Ok(eligible)
    }

    /// Finds the line index of the task matching `description`, disambiguated
    /// by `adw_id` when given. Per spec: if multiple lines match description,
    /// the first unmatched-by-adw_id line is chosen; true ambiguity (several
    /// candidates and no adw_id to disambiguate) is a domain error.
    fn find_line_index(&self, lines: &[String], description: &str, adw_id: Option<&str>) -> AdwResult<usize> {
        let mut candidates = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            if let Some(task) = parse_task_line(line, DEFAULT_WORKTREE, idx + 1) {
                if task.description == description {
                    if let Some(id) = adw_id {
                        if task.adw_id.as_deref() == Some(id) {
                            return Ok(idx);
                        }
                    }
                    candidates.push(idx);
                }
            }
        }

        match candidates.len() {
            0 => Err(AdwError::domain(format!("task not found: {description}"))),
            1 => Ok(candidates[0]),
            _ if adw_id.is_none() => Ok(candidates[0]),
            _ => Err(AdwError::domain(format!(
                "ambiguous task description with no matching adw_id: {description}"
            ))),
        }
    }

    fn rewrite_line(&self, description: &str, adw_id: Option<&str>, mutate: impl FnOnce(&mut Task)) -> AdwResult<Task> {
        let mut lines = self.read_lines()?;
        let idx = self.find_line_index(&lines, description, adw_id)?;

        let mut task = parse_task_line(&lines[idx], DEFAULT_WORKTREE, idx + 1)
            .ok_or_else(|| AdwError::invariant("line matched but failed to re-parse"))?;

        mutate(&mut task);
        lines[idx] = render_task_line(&task);
        self.write_lines_atomic(&lines)?;
        Ok(task)
    }

    pub fn mark_in_progress(&self, description: &str, adw_id: &str) -> AdwResult<Task> {
        self.rewrite_line(description, None, |task| {
            task.status = TaskStatus::InProgress;
            task.adw_id = Some(adw_id.to_string());
        })
    }

    pub fn mark_done(&self, description: &str, adw_id: &str, commit_hash: Option<&str>) -> AdwResult<Task> {
        self.rewrite_line(description, Some(adw_id), |task| {
            task.status = TaskStatus::Done;
            task.commit_hash = commit_hash.map(str::to_string);
            task.error_message = None;
        })
    }

    pub fn mark_failed(&self, description: &str, adw_id: &str, error: &str) -> AdwResult<Task> {
        const MAX_ERROR_LEN: usize = 200;
        let truncated = if error.len() > MAX_ERROR_LEN {
            format!("{}...", &error[..MAX_ERROR_LEN])
        } else {
            error.to_string()
        };
        self.rewrite_line(description, Some(adw_id), |task| {
            task.status = TaskStatus::Failed;
            task.error_message = Some(truncated.clone());
        })
    }

    /// `cancel <adw_id>` CLI command (spec §6): marks the live task failed
    /// with reason "cancelled". This call only updates the durable record —
    /// it runs in its own short-lived CLI process and has no way to reach a
    /// running daemon's in-memory supervisor directly. The task file is the
    /// cross-process boundary: a daemon that owns this `adw_id` notices the
    /// externally-written "cancelled" failure on its next poll
    /// (`Daemon::reconcile_cancellations`) and aborts the live workflow run
    /// there.
    pub fn mark_cancelled(&self, adw_id: &str) -> AdwResult<Task> {
        let task = self
            .find_by_adw_id(adw_id)?
            .ok_or_else(|| AdwError::domain(format!("no task found with adw_id {adw_id}")))?;
        self.mark_failed(&task.description, adw_id, "cancelled")
    }

    /// `retry <adw_id>` CLI command (spec §6): re-queues a failed task as
    /// pending, clearing its adw_id/commit/error so it gets a fresh attempt.
    pub fn requeue_pending(&self, adw_id: &str) -> AdwResult<Task> {
        let task = self
            .find_by_adw_id(adw_id)?
            .ok_or_else(|| AdwError::domain(format!("no task found with adw_id {adw_id}")))?;
        self.rewrite_line(&task.description, Some(adw_id), |task| {
            task.status = TaskStatus::Pending;
            task.adw_id = None;
            task.commit_hash = None;
            task.error_message = None;
        })
    }

    /// Scans every worktree section for a task carrying `adw_id`.
    pub fn find_by_adw_id(&self, adw_id: &str) -> AdwResult<Option<Task>> {
        let sections = self.load()?;
        Ok(sections
            .into_iter()
            .flat_map(|s| s.tasks)
            .find(|t| t.adw_id.as_deref() == Some(adw_id)))
    }

    /// `add <description>` CLI command (spec §6): appends a new pending
    /// task line at the end of `worktree`'s section (or at end of file,
    /// under a fresh header, if that worktree has no section yet).
    pub fn add_task(&self, worktree: &str, description: &str, tags: Vec<Tag>) -> AdwResult<()> {
        if description.contains('{') || description.contains('}') {
            return Err(AdwError::domain("task description may not contain '{' or '}'"));
        }

        let mut lines = if self.path.exists() { self.read_lines()? } else { Vec::new() };

        let task = Task {
            status: TaskStatus::Pending,
            description: description.to_string(),
            adw_id: None,
            commit_hash: None,
            error_message: None,
            tags,
            worktree_name: worktree.to_string(),
            line_number: 0,
        };
        let rendered = render_task_line(&task);

        let header_idx = lines.iter().position(|l| {
            worktree_header_regex()
                .captures(l)
                .map(|c| c.name("name").unwrap().as_str() == worktree)
                .unwrap_or(false)
        });

        match header_idx {
            Some(idx) => {
                let mut insert_at = idx + 1;
                while insert_at < lines.len() && !lines[insert_at].trim_start().starts_with("## ") {
                    insert_at += 1;
                }
                lines.insert(insert_at, rendered);
            }
            None => {
                if !lines.is_empty() {
                    lines.push(String::new());
                }
                lines.push(format!("## Worktree: {worktree}"));
                lines.push(rendered);
            }
        }

        self.write_lines_atomic(&lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(dir: &Path, content: &str) -> TaskFileStore {
        let path = dir.join("tasks.md");
        fs::write(&path, content).unwrap();
        TaskFileStore::new(path)
    }

    #[test]
    fn round_trip_parsing() {
        let line = "[] Task A {sonnet, p1}";
        let task = parse_task_line(line, "main", 1).unwrap();
        assert_eq!(render_task_line(&task), line);
    }

    #[test]
    fn round_trip_done_with_commit() {
        let line = "[\u{2713}, a1b2c3d4, deadbeef] Ship feature {standard}";
        let task = parse_task_line(line, "main", 1).unwrap();
        assert_eq!(render_task_line(&task), line);
    }

    #[test]
    fn load_preserves_order_and_sections() {
        let dir = tempdir().unwrap();
        let store = write(
            &dir.path(),
            "## Worktree: main\n[] Task A\n[blocked] Task B\n## Worktree: other\n[] Task C\n",
        );
        let sections = store.load().unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].name, "main");
        assert_eq!(sections[0].tasks.len(), 2);
        assert_eq!(sections[1].name, "other");
        assert_eq!(sections[1].tasks[0].description, "Task C");
    }

    #[test]
    fn eligibility_is_positional_per_worktree() {
        let dir = tempdir().unwrap();
        // S4 "worktree independence"
        let store = write(
            &dir.path(),
            "## Worktree: x\n[\u{2713}] X1\n[blocked] X2\n## Worktree: y\n[blocked] Y1\n",
        );
        let eligible = store.get_eligible().unwrap();
        let descs: Vec<_> = eligible.iter().map(|t| t.description.as_str()).collect();
        assert_eq!(descs, vec!["X2", "Y1"]);
    }

    #[test]
    fn blocked_unlocks_after_dependency_done() {
        // S2 "blocked unlocks"
        let dir = tempdir().unwrap();
        let store = write(&dir.path(), "[] A\n[blocked] B\n");
        let eligible: Vec<_> = store.get_eligible().unwrap().into_iter().map(|t| t.description).collect();
        assert_eq!(eligible, vec!["A"]);

        store.mark_in_progress("A", "aaaaaaaa").unwrap();
        store.mark_done("A", "aaaaaaaa", None).unwrap();

        let eligible: Vec<_> = store.get_eligible().unwrap().into_iter().map(|t| t.description).collect();
        assert_eq!(eligible, vec!["B"]);
    }

    #[test]
    fn mark_in_progress_is_atomic_and_preserves_other_lines() {
        let dir = tempdir().unwrap();
        let store = write(&dir.path(), "[] Task A {sonnet}\n[] Task B\n");
        store.mark_in_progress("Task A", "deadbeef").unwrap();

        let sections = store.load().unwrap();
        let a = &sections[0].tasks[0];
        assert_eq!(a.status, TaskStatus::InProgress);
        assert_eq!(a.adw_id.as_deref(), Some("deadbeef"));
        assert_eq!(sections[0].tasks[1].description, "Task B");
    }

    #[test]
    fn mark_failed_appends_truncated_error_as_comment() {
        let dir = tempdir().unwrap();
        let store = write(&dir.path(), "[] Task A\n");
        store.mark_in_progress("Task A", "deadbeef").unwrap();
        store.mark_failed("Task A", "deadbeef", "boom").unwrap();

        let sections = store.load().unwrap();
        let a = &sections[0].tasks[0];
        assert_eq!(a.status, TaskStatus::Failed);
        assert_eq!(a.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn ambiguous_description_without_adw_id_errors_on_disambiguated_update() {
        let dir = tempdir().unwrap();
        let store = write(&dir.path(), "[] Dup\n[] Dup\n");
        store.mark_in_progress("Dup", "11111111").unwrap();
        // Now one `Dup` has adw_id 11111111, the other none; marking done
        // with a *different* adw_id that matches neither is ambiguous.
        let err = store.mark_done("Dup", "22222222", None);
        assert!(err.is_err());
    }

    #[test]
    fn missing_task_file_is_a_configuration_error() {
        let dir = tempdir().unwrap();
        let store = TaskFileStore::new(dir.path().join("nope.md"));
        assert!(store.load().is_err());
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let store = write(&dir.path(), "[???] not a real marker\n[] Real task\n");
        let sections = store.load().unwrap();
        assert_eq!(sections[0].tasks.len(), 1);
        assert_eq!(sections[0].tasks[0].description, "Real task");
    }
}
