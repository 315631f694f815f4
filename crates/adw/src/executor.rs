//! C5 Agent executor (spec §4.5).
//!
//! Runs exactly one invocation of the external code-generation CLI,
//! capturing its streamed JSONL output to `agents/<adw_id>/<phase>/`.
//! Grounded stylistically on the `std::process::Command`-based subprocess
//! idioms the teacher used around git and worktree operations, generalized
//! to `tokio::process::Command` + `tokio::time::timeout` because C5 is
//! awaited inside the async cron loop alongside other daemon I/O rather
//! than run as a single foreground invocation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use adw_core::error::{AdwError, AdwResult};
use adw_core::model::ModelTag;
use adw_core::state::StateStore;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Environment variables always allowed through to the child, regardless
/// of what the parent daemon process happens to have set (spec §6).
const ENV_ALLOWLIST: &[&str] = &[
    "PATH", "HOME", "USER", "SHELL", "LANG", "TERM", "TZ", "TMPDIR",
    "HTTP_PROXY", "HTTPS_PROXY", "NO_PROXY", "http_proxy", "https_proxy", "no_proxy",
    "ANTHROPIC_API_KEY", "CLAUDE_API_KEY",
];

fn model_flag(model: ModelTag) -> &'static str {
    match model {
        ModelTag::Haiku => "haiku",
        ModelTag::Sonnet => "sonnet",
        ModelTag::Opus => "opus",
    }
}

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub adw_id: String,
    pub phase_name: String,
    /// `None` means let the CLI use its own default model.
    pub model: Option<ModelTag>,
    pub working_dir: PathBuf,
    pub timeout_seconds: u64,
    pub skip_permissions: bool,
    /// Per-task additions overlaid on top of the allowlisted environment
    /// (e.g. allocated ports).
    pub env_overlay: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryCode {
    None,
    ClaudeCodeError,
    TimeoutError,
    ExecutionError,
    RateLimit,
}

#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub success: bool,
    pub output: String,
    pub session_id: Option<String>,
    pub retry_code: RetryCode,
    pub error_message: Option<String>,
    pub duration_seconds: f64,
}

impl AgentResponse {
    fn failure(retry_code: RetryCode, error_message: impl Into<String>, duration_seconds: f64) -> Self {
        Self {
            success: false,
            output: String::new(),
            session_id: None,
            retry_code,
            error_message: Some(error_message.into()),
            duration_seconds,
        }
    }
}

fn build_argv(cli: &str, request: &AgentRequest) -> Vec<String> {
    let mut argv = vec![
        cli.to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ];
    if let Some(model) = request.model {
        argv.push("--model".to_string());
        argv.push(model_flag(model).to_string());
    }
    if request.skip_permissions {
        argv.push("--dangerously-skip-permissions".to_string());
    }
    argv.push("--print".to_string());
    argv.push(request.prompt.clone());
    argv
}

fn build_env(overlay: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars()
        .filter(|(k, _)| ENV_ALLOWLIST.contains(&k.as_str()) || k.starts_with("LC_"))
        .collect();
    for (k, v) in overlay {
        env.insert(k.clone(), v.clone());
    }
    env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
    env
}

/// One parsed record from the JSONL stream.
#[derive(Debug, Clone, Deserialize)]
struct StreamRecord {
    #[serde(rename = "type")]
    kind: String,
    result: Option<String>,
    session_id: Option<String>,
    error: Option<StreamError>,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamError {
    message: String,
}

struct ParsedStream {
    final_result: Option<String>,
    session_id: Option<String>,
    error_message: Option<String>,
    records: Vec<serde_json::Value>,
}

fn parse_stream(raw: &str) -> ParsedStream {
    let mut final_result = None;
    let mut session_id = None;
    let mut error_message = None;
    let mut records = Vec::new();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        records.push(value.clone());

        if let Ok(record) = serde_json::from_value::<StreamRecord>(value) {
            if record.session_id.is_some() {
                session_id = record.session_id;
            }
            match record.kind.as_str() {
                "result" => final_result = record.result,
                "error" => {
                    error_message = record.error.map(|e| e.message).or(Some("unknown agent error".to_string()));
                }
                _ => {}
            }
        }
    }

    ParsedStream {
        final_result,
        session_id,
        error_message,
        records,
    }
}

fn classify_retry(timed_out: bool, exit_success: bool, parsed: &ParsedStream, stderr: &str) -> RetryCode {
    if timed_out {
        return RetryCode::TimeoutError;
    }
    let combined = format!(
        "{} {}",
        parsed.error_message.as_deref().unwrap_or_default(),
        stderr
    )
    .to_ascii_lowercase();
    if combined.contains("rate limit") || combined.contains("429") || combined.contains("overloaded") {
        return RetryCode::RateLimit;
    }
    if parsed.error_message.is_some() {
        return RetryCode::ExecutionError;
    }
    if !exit_success {
        return RetryCode::ClaudeCodeError;
    }
    if parsed.final_result.is_none() {
        return RetryCode::ExecutionError;
    }
    RetryCode::None
}

pub struct AgentExecutor<'a> {
    agent_cli: String,
    state_store: &'a StateStore,
}

impl<'a> AgentExecutor<'a> {
    pub fn new(agent_cli: impl Into<String>, state_store: &'a StateStore) -> Self {
        Self {
            agent_cli: agent_cli.into(),
            state_store,
        }
    }

    /// Runs exactly one invocation and persists its artefacts. Never
    /// returns `Err` for an agent-side failure — those are expressed in
    /// the returned `AgentResponse`; `Err` is reserved for I/O failures
    /// setting up the phase directory itself.
    pub async fn execute(&self, request: &AgentRequest) -> AdwResult<AgentResponse> {
        let paths = self.state_store.phase_output_paths(&request.adw_id, &request.phase_name);
        paths.ensure_dir()?;

        let argv = build_argv(&self.agent_cli, request);
        let env = build_env(&request.env_overlay);

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(&request.working_dir)
            .kill_on_drop(true)
            .env_clear()
            .envs(&env)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let start = Instant::now();
        let mut child = match command.spawn() {
            Ok(c) => c,
            Err(e) => {
                return Ok(AgentResponse::failure(
                    RetryCode::ClaudeCodeError,
                    format!("failed to spawn {}: {e}", argv[0]),
                    start.elapsed().as_secs_f64(),
                ))
            }
        };

        let wait = tokio::time::timeout(Duration::from_secs(request.timeout_seconds), child.wait_with_output()).await;

        let (timed_out, stdout, stderr, exit_success) = match wait {
            Ok(Ok(output)) => (
                false,
                String::from_utf8_lossy(&output.stdout).to_string(),
                String::from_utf8_lossy(&output.stderr).to_string(),
                output.status.success(),
            ),
            Ok(Err(e)) => {
                return Ok(AgentResponse::failure(
                    RetryCode::ClaudeCodeError,
                    format!("child process error: {e}"),
                    start.elapsed().as_secs_f64(),
                ))
            }
            Err(_) => (true, String::new(), String::new(), false),
        };

        let duration_seconds = start.elapsed().as_secs_f64();

        self.persist_raw(&paths, &stdout).await?;
        let parsed = parse_stream(&stdout);
        self.persist_parsed(&paths, &parsed).await?;

        let retry_code = classify_retry(timed_out, exit_success, &parsed, &stderr);
        let output_text = parsed.final_result.clone().unwrap_or_default();
        self.persist_final(&paths, &output_text).await?;

        Ok(AgentResponse {
            success: retry_code == RetryCode::None,
            output: output_text,
            session_id: parsed.session_id,
            retry_code,
            error_message: if timed_out {
                Some(format!("phase {} timed out after {}s", request.phase_name, request.timeout_seconds))
            } else {
                parsed.error_message.clone().or_else(|| (!stderr.trim().is_empty()).then(|| stderr.trim().to_string()))
            },
            duration_seconds,
        })
    }

    async fn persist_raw(&self, paths: &adw_core::state::PhaseOutputPaths, stdout: &str) -> AdwResult<()> {
        let mut f = tokio::fs::File::create(&paths.raw_jsonl)
            .await
            .map_err(|e| AdwError::io(&paths.raw_jsonl, e))?;
        f.write_all(stdout.as_bytes()).await.map_err(|e| AdwError::io(&paths.raw_jsonl, e))?;
        Ok(())
    }

    async fn persist_parsed(&self, paths: &adw_core::state::PhaseOutputPaths, parsed: &ParsedStream) -> AdwResult<()> {
        let json = serde_json::to_string_pretty(&parsed.records)
            .map_err(|e| AdwError::invariant(format!("failed to serialize parsed stream: {e}")))?;
        tokio::fs::write(&paths.raw_json, json).await.map_err(|e| AdwError::io(&paths.raw_json, e))
    }

    async fn persist_final(&self, paths: &adw_core::state::PhaseOutputPaths, text: &str) -> AdwResult<()> {
        tokio::fs::write(&paths.final_result, text).await.map_err(|e| AdwError::io(&paths.final_result, e))
    }

    /// `prompt_with_retry` — wraps `execute` with the classification-driven
    /// backoff ladder: `rate_limit` waits 3x the delay step, the other
    /// retryable codes wait 1x, `none` returns immediately. Total attempts
    /// never exceed `max_retries + 1`.
    pub async fn prompt_with_retry(
        &self,
        request: &AgentRequest,
        max_retries: u32,
        delays: &[u64],
    ) -> AdwResult<AgentResponse> {
        let mut attempt = 0;
        loop {
            let response = self.execute(request).await?;
            if response.retry_code == RetryCode::None || attempt >= max_retries {
                return Ok(response);
            }

            let step = *delays.get(attempt as usize).unwrap_or_else(|| delays.last().unwrap_or(&1));
            let delay = if response.retry_code == RetryCode::RateLimit { step * 3 } else { step };
            tracing::warn!(
                adw_id = %request.adw_id,
                phase = %request.phase_name,
                attempt,
                retry_code = ?response.retry_code,
                delay,
                "agent invocation failed, retrying after backoff"
            );
            tokio::time::sleep(Duration::from_secs(delay)).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adw_core::state::StateStore;
    use tempfile::tempdir;

    fn stub_script(dir: &std::path::Path, body: &str) -> PathBuf {
        let path = dir.join("stub_cli.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
        }
        path
    }

    fn base_request(adw_id: &str, phase: &str, working_dir: &std::path::Path) -> AgentRequest {
        AgentRequest {
            prompt: "do the thing".to_string(),
            adw_id: adw_id.to_string(),
            phase_name: phase.to_string(),
            model: Some(ModelTag::Sonnet),
            working_dir: working_dir.to_path_buf(),
            timeout_seconds: 5,
            skip_permissions: false,
            env_overlay: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn successful_invocation_extracts_result_and_session_id() {
        let agents_dir = tempdir().unwrap();
        let work_dir = tempdir().unwrap();
        let state_store = StateStore::new(agents_dir.path());
        let script = stub_script(
            agents_dir.path(),
            r#"echo '{"type":"system","session_id":"sess-1"}'
echo '{"type":"result","result":"ok","session_id":"sess-1"}'"#,
        );

        let executor = AgentExecutor::new(script.to_string_lossy().to_string(), &state_store);
        let request = base_request("deadbeef", "implement", work_dir.path());
        let response = executor.execute(&request).await.unwrap();

        assert!(response.success);
        assert_eq!(response.output, "ok");
        assert_eq!(response.session_id.as_deref(), Some("sess-1"));
        assert_eq!(response.retry_code, RetryCode::None);

        let final_path = state_store.phase_output_paths("deadbeef", "implement").final_result;
        assert_eq!(std::fs::read_to_string(final_path).unwrap(), "ok");
    }

    #[tokio::test]
    async fn error_record_yields_execution_error() {
        let agents_dir = tempdir().unwrap();
        let work_dir = tempdir().unwrap();
        let state_store = StateStore::new(agents_dir.path());
        let script = stub_script(
            agents_dir.path(),
            r#"echo '{"type":"error","error":{"message":"boom"}}'
exit 1"#,
        );

        let executor = AgentExecutor::new(script.to_string_lossy().to_string(), &state_store);
        let request = base_request("cafebabe", "plan", work_dir.path());
        let response = executor.execute(&request).await.unwrap();

        assert!(!response.success);
        assert_eq!(response.retry_code, RetryCode::ExecutionError);
        assert_eq!(response.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn timeout_is_classified_and_does_not_hang() {
        let agents_dir = tempdir().unwrap();
        let work_dir = tempdir().unwrap();
        let state_store = StateStore::new(agents_dir.path());
        let script = stub_script(agents_dir.path(), "sleep 30");

        let executor = AgentExecutor::new(script.to_string_lossy().to_string(), &state_store);
        let mut request = base_request("00000001", "test", work_dir.path());
        request.timeout_seconds = 1;
        let response = executor.execute(&request).await.unwrap();

        assert!(!response.success);
        assert_eq!(response.retry_code, RetryCode::TimeoutError);
    }

    #[tokio::test]
    async fn prompt_with_retry_stops_on_success() {
        let agents_dir = tempdir().unwrap();
        let work_dir = tempdir().unwrap();
        let state_store = StateStore::new(agents_dir.path());
        let script = stub_script(agents_dir.path(), r#"echo '{"type":"result","result":"ok"}'"#);

        let executor = AgentExecutor::new(script.to_string_lossy().to_string(), &state_store);
        let request = base_request("11111111", "implement", work_dir.path());
        let response = executor.prompt_with_retry(&request, 2, &[1, 1, 1]).await.unwrap();
        assert!(response.success);
    }

    #[tokio::test]
    async fn prompt_with_retry_caps_total_attempts() {
        let agents_dir = tempdir().unwrap();
        let work_dir = tempdir().unwrap();
        let state_store = StateStore::new(agents_dir.path());
        let script = stub_script(agents_dir.path(), r#"echo '{"type":"error","error":{"message":"boom"}}'
exit 1"#);

        let executor = AgentExecutor::new(script.to_string_lossy().to_string(), &state_store);
        let request = base_request("22222222", "implement", work_dir.path());
        let response = executor.prompt_with_retry(&request, 1, &[0, 0]).await.unwrap();
        assert!(!response.success);
        assert_eq!(response.retry_code, RetryCode::ExecutionError);
    }

    #[test]
    fn argv_includes_model_and_permissions_flags() {
        let request = AgentRequest {
            prompt: "hi".to_string(),
            adw_id: "a".to_string(),
            phase_name: "plan".to_string(),
            model: Some(ModelTag::Opus),
            working_dir: PathBuf::from("."),
            timeout_seconds: 1,
            skip_permissions: true,
            env_overlay: HashMap::new(),
        };
        let argv = build_argv("claude", &request);
        assert!(argv.contains(&"--model".to_string()));
        assert!(argv.contains(&"opus".to_string()));
        assert!(argv.contains(&"--dangerously-skip-permissions".to_string()));
        assert_eq!(argv.last().unwrap(), "hi");
    }

    #[test]
    fn env_allowlist_strips_unlisted_vars_and_overlays_win() {
        std::env::set_var("ADW_TEST_SHOULD_NOT_LEAK", "1");
        let mut overlay = HashMap::new();
        overlay.insert("PORT".to_string(), "4000".to_string());
        let env = build_env(&overlay);
        std::env::remove_var("ADW_TEST_SHOULD_NOT_LEAK");

        assert!(!env.contains_key("ADW_TEST_SHOULD_NOT_LEAK"));
        assert_eq!(env.get("PORT").map(String::as_str), Some("4000"));
        assert_eq!(env.get("PYTHONUNBUFFERED").map(String::as_str), Some("1"));
    }
}
