//! Test-command detection (spec §6), used by the workflow runner to
//! validate a phase's changes. Infers the project's test runner from
//! marker files in the worktree root; an explicit config override always
//! wins.

use std::path::Path;

/// Explicit override takes precedence over every marker-file probe.
pub fn detect_test_command(root: &Path, override_command: Option<&[String]>) -> Option<Vec<String>> {
    if let Some(cmd) = override_command {
        if !cmd.is_empty() {
            return Some(cmd.to_vec());
        }
    }

    if root.join("Cargo.toml").exists() {
        return Some(vec!["cargo".to_string(), "test".to_string()]);
    }

    if root.join("go.mod").exists() {
        return Some(vec!["go".to_string(), "test".to_string(), "./...".to_string()]);
    }

    if let Some(cmd) = detect_node_test_command(root) {
        return Some(cmd);
    }

    if root.join("pyproject.toml").exists() || root.join("pytest.ini").exists() || root.join("setup.cfg").exists() {
        return Some(vec!["pytest".to_string()]);
    }

    None
}

fn detect_node_test_command(root: &Path) -> Option<Vec<String>> {
    let package_json = root.join("package.json");
    if !package_json.exists() {
        return None;
    }
    let content = std::fs::read_to_string(&package_json).ok()?;
    let parsed: serde_json::Value = serde_json::from_str(&content).ok()?;

    let has_dep = |name: &str| {
        ["dependencies", "devDependencies"]
            .iter()
            .any(|section| parsed.get(section).and_then(|d| d.get(name)).is_some())
    };

    if has_dep("vitest") {
        return Some(vec!["npx".to_string(), "vitest".to_string(), "run".to_string()]);
    }
    if has_dep("jest") {
        return Some(vec!["npx".to_string(), "jest".to_string()]);
    }
    if parsed
        .get("scripts")
        .and_then(|s| s.get("test"))
        .is_some()
    {
        return Some(vec!["npm".to_string(), "test".to_string()]);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn detects_cargo_project() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\nname=\"x\"").unwrap();
        assert_eq!(
            detect_test_command(dir.path(), None),
            Some(vec!["cargo".to_string(), "test".to_string()])
        );
    }

    #[test]
    fn detects_go_project() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("go.mod"), "module x").unwrap();
        assert_eq!(
            detect_test_command(dir.path(), None),
            Some(vec!["go".to_string(), "test".to_string(), "./...".to_string()])
        );
    }

    #[test]
    fn detects_vitest_over_plain_npm_script() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"devDependencies":{"vitest":"1.0.0"},"scripts":{"test":"vitest"}}"#,
        )
        .unwrap();
        assert_eq!(
            detect_test_command(dir.path(), None),
            Some(vec!["npx".to_string(), "vitest".to_string(), "run".to_string()])
        );
    }

    #[test]
    fn detects_pytest_project() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("pyproject.toml"), "[tool.pytest]").unwrap();
        assert_eq!(detect_test_command(dir.path(), None), Some(vec!["pytest".to_string()]));
    }

    #[test]
    fn override_wins_over_every_marker() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\nname=\"x\"").unwrap();
        let over = vec!["make".to_string(), "test".to_string()];
        assert_eq!(detect_test_command(dir.path(), Some(&over)), Some(over));
    }

    #[test]
    fn unknown_project_type_returns_none() {
        let dir = tempdir().unwrap();
        assert_eq!(detect_test_command(dir.path(), None), None);
    }
}
