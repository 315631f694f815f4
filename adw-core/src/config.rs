//! Configuration (spec §6 persisted state layout, SPEC_FULL §2 ambient
//! layer). Parses `~/.adw/config.toml` into a typed `AdwConfig`, mirroring
//! the teacher's `SwarmConfig` precedence: environment overrides file
//! overrides built-in defaults. Only the core-relevant sections are
//! modeled — `[slack]`, `[linear]`, `[notion]`, `[github]`, `[webhook]`,
//! `[plugins]`, `[ui]` from the original implementation are Non-goal
//! integrations and are intentionally absent.

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AdwError, AdwResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub tasks_file: PathBuf,
    /// Name or path of the external code-generation CLI binary (spec §6).
    pub agent_cli: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            tasks_file: PathBuf::from("tasks.md"),
            agent_cli: "claude".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub poll_interval_seconds: u64,
    pub max_concurrent: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 5,
            max_concurrent: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub default_complexity: String,
    pub max_test_retries: u32,
    pub max_retries: u32,
    pub test_validation_enabled: bool,
    pub remove_worktree_on_failure: bool,
    /// Explicit override for the project's test command, bypassing the
    /// marker-file detection in §6 ("Explicit override via config").
    /// `None` means fall back to auto-detection from the worktree root.
    pub test_command: Option<Vec<String>>,
    /// Overrides the wall-clock timeout (seconds) applied to every phase.
    /// `None` keeps each workflow tier's built-in default.
    pub phase_timeout_seconds: Option<u64>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_complexity: "standard".to_string(),
            max_test_retries: 3,
            max_retries: 2,
            test_validation_enabled: true,
            remove_worktree_on_failure: false,
            test_command: None,
            phase_timeout_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub worktrees_dir: PathBuf,
    pub agents_dir: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            worktrees_dir: PathBuf::from(".worktrees"),
            agents_dir: PathBuf::from("agents"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdwConfig {
    pub core: CoreConfig,
    pub daemon: DaemonConfig,
    pub workflow: WorkflowConfig,
    pub workspace: WorkspaceConfig,
}

impl AdwConfig {
    /// Default location: `~/.adw/config.toml`.
    pub fn default_path() -> AdwResult<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| {
            AdwError::configuration(
                "could not determine home directory",
                "Set ADW_CONFIG to an explicit config file path",
            )
        })?;
        Ok(home.join(".adw").join("config.toml"))
    }

    /// Resolves the config path: explicit `override_path`, then
    /// `ADW_CONFIG` env var, then the default `~/.adw/config.toml`.
    pub fn resolve_path(override_path: Option<&Path>) -> AdwResult<PathBuf> {
        if let Some(p) = override_path {
            return Ok(p.to_path_buf());
        }
        if let Ok(p) = env::var("ADW_CONFIG") {
            return Ok(PathBuf::from(p));
        }
        Self::default_path()
    }

    /// Loads configuration with precedence environment > file > defaults.
    /// A missing config file is not an error — defaults apply.
    pub fn load(override_path: Option<&Path>) -> AdwResult<Self> {
        let path = Self::resolve_path(override_path)?;
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| AdwError::io(&path, e))?;
            toml::from_str(&content).map_err(|e| {
                AdwError::configuration(
                    format!("failed to parse {}: {e}", path.display()),
                    "Check the TOML syntax of the config file, or remove it to fall back to defaults",
                )
            })?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("ADW_TASKS_FILE") {
            self.core.tasks_file = PathBuf::from(v);
        }
        if let Ok(v) = env::var("ADW_AGENT_CLI") {
            self.core.agent_cli = v;
        }
        if let Ok(v) = env::var("ADW_POLL_INTERVAL") {
            if let Ok(n) = v.parse() {
                self.daemon.poll_interval_seconds = n;
            }
        }
        if let Ok(v) = env::var("ADW_MAX_CONCURRENT") {
            if let Ok(n) = v.parse() {
                self.daemon.max_concurrent = n;
            }
        }
        if let Ok(v) = env::var("ADW_DEFAULT_COMPLEXITY") {
            self.workflow.default_complexity = v;
        }
        if let Ok(v) = env::var("ADW_MAX_TEST_RETRIES") {
            if let Ok(n) = v.parse() {
                self.workflow.max_test_retries = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        let config = AdwConfig::load(Some(&path)).unwrap();
        assert_eq!(config.daemon.max_concurrent, 3);
        assert_eq!(config.workflow.default_complexity, "standard");
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[daemon]\nmax_concurrent = 7\n\n[workflow]\nmax_test_retries = 9\n",
        )
        .unwrap();

        let config = AdwConfig::load(Some(&path)).unwrap();
        assert_eq!(config.daemon.max_concurrent, 7);
        assert_eq!(config.workflow.max_test_retries, 9);
        assert_eq!(config.daemon.poll_interval_seconds, 5);
    }

    #[test]
    fn env_override_wins_over_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[daemon]\nmax_concurrent = 7\n").unwrap();

        env::set_var("ADW_MAX_CONCURRENT", "11");
        let config = AdwConfig::load(Some(&path)).unwrap();
        env::remove_var("ADW_MAX_CONCURRENT");

        assert_eq!(config.daemon.max_concurrent, 11);
    }

    #[test]
    fn test_command_override_parses_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[workflow]\ntest_command = [\"make\", \"check\"]\n").unwrap();

        let config = AdwConfig::load(Some(&path)).unwrap();
        assert_eq!(
            config.workflow.test_command,
            Some(vec!["make".to_string(), "check".to_string()])
        );
    }
}
