//! CLI subprocess executor.
//!
//! Runs the external interactive LLM binary with a stream-json output format
//! and turns its newline-delimited JSON stdout into a typed event stream.
//! A hard timeout aborts the process, escalating from SIGTERM to SIGKILL
//! after a grace period.

use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::errors::GatewayError;

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Variables the CLI binary legitimately needs: a shell runtime to find and
/// run itself and the `npx`-spawned tool servers from `.mcp.json`, plus
/// locale/terminal settings. Everything else in the parent environment,
/// notably the provider API keys this gateway holds, stays out of the child.
const CHILD_ENV: &[&str] = &[
    "PATH",
    "HOME",
    "SHELL",
    "USER",
    "LANG",
    "TERM",
    "TMPDIR",
    "NODE_OPTIONS",
    "NPM_CONFIG_PREFIX",
];

fn child_env_allowed(key: &str) -> bool {
    CHILD_ENV.contains(&key) || key.starts_with("LC_") || key.starts_with("XDG_")
}

/// Structured events parsed from the CLI's stdout stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecEvent {
    SubprocessStart {
        pid: u32,
    },
    StatusUpdate {
        status: String,
        details: Value,
    },
    TextChunk {
        chunk: String,
    },
    ToolCall {
        name: String,
    },
    FinalResult {
        success: bool,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    StreamParseError {
        line: String,
    },
    SubprocessExit {
        code: Option<i32>,
        stderr: String,
    },
}

/// Coarse progress document pushed to observers (the polling manager writes
/// these into the task row).
#[derive(Debug, Clone, Serialize)]
pub struct ExecProgress {
    pub stage: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_response_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<u64>,
}

pub type ProgressFn = Arc<dyn Fn(ExecProgress) + Send + Sync>;

#[derive(Clone)]
pub struct CliExecutor {
    bin: PathBuf,
    workdir: PathBuf,
    timeout: Duration,
    verbose: bool,
}

impl CliExecutor {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            bin: config.cli_path.clone(),
            workdir: config.workspace_dir.clone(),
            timeout: Duration::from_secs(config.subprocess_timeout_secs),
            verbose: config.verbose_cli,
        }
    }

    /// Argument vector handed to the binary:
    /// `-p <prompt> --output-format stream-json [--verbose] --system-prompt <sys>`.
    pub fn build_args(prompt: &str, system_prompt: &str, verbose: bool) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
        ];
        if verbose {
            args.push("--verbose".to_string());
        }
        args.push("--system-prompt".to_string());
        args.push(system_prompt.to_string());
        args
    }

    /// Base command for one CLI run: workdir set, environment rebuilt from
    /// scratch with only [`CHILD_ENV`]-sanctioned variables, and color output
    /// suppressed so stdout stays parseable as line-delimited JSON.
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.env_clear()
            .envs(std::env::vars().filter(|(key, _)| child_env_allowed(key)))
            .env("NO_COLOR", "1")
            .current_dir(&self.workdir);
        cmd
    }

    /// Spawn the binary and stream its events. The channel closes after the
    /// terminal `subprocess_exit` event.
    pub fn run(
        &self,
        prompt: String,
        system_prompt: String,
    ) -> Result<mpsc::Receiver<ExecEvent>, GatewayError> {
        if !self.workdir.is_dir() {
            return Err(GatewayError::Config(format!(
                "working directory does not exist: {}",
                self.workdir.display()
            )));
        }

        let args = Self::build_args(&prompt, &system_prompt, self.verbose);
        debug!("spawning {} in {}", self.bin.display(), self.workdir.display());

        let mut cmd = self.command();
        cmd.args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            GatewayError::Config(format!(
                "failed to start CLI binary {}: {e}",
                self.bin.display()
            ))
        })?;

        let (tx, rx) = mpsc::channel(64);
        let timeout = self.timeout;
        let pid = child.id().unwrap_or(0);
        info!("CLI subprocess started (pid {pid})");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        tokio::spawn(async move {
            let _ = tx.send(ExecEvent::SubprocessStart { pid }).await;

            // Drain stderr concurrently so a chatty binary can't deadlock on
            // a full pipe.
            let stderr_task = tokio::spawn(async move {
                let mut buf = String::new();
                if let Some(mut stderr) = stderr {
                    let _ = stderr.read_to_string(&mut buf).await;
                }
                buf
            });

            let mut timed_out = false;
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                let pump = async {
                    while let Ok(Some(line)) = lines.next_line().await {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        for event in parse_stream_line(trimmed) {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                };
                if tokio::time::timeout(timeout, pump).await.is_err() {
                    error!("CLI subprocess exceeded {timeout:?}, terminating");
                    timed_out = true;
                    terminate(&mut child).await;
                    let _ = tx
                        .send(ExecEvent::FinalResult {
                            success: false,
                            content: String::new(),
                            details: Some(json!({
                                "reason": "timeout",
                                "message": format!("subprocess timed out after {}s", timeout.as_secs()),
                            })),
                        })
                        .await;
                }
            }

            let status = child.wait().await.ok();
            let stderr_output = stderr_task.await.unwrap_or_default();
            let code = status.and_then(|s| s.code());
            if !timed_out {
                info!("CLI subprocess exited with code {code:?}");
            }
            let _ = tx
                .send(ExecEvent::SubprocessExit {
                    code,
                    stderr: stderr_output.trim().to_string(),
                })
                .await;
        });

        Ok(rx)
    }

    /// Run to completion, accumulating text chunks and preferring the
    /// stream's own final result. Progress observers get coarse updates as
    /// the stream advances.
    pub async fn run_to_completion(
        &self,
        prompt: String,
        system_prompt: String,
        progress: Option<ProgressFn>,
    ) -> Result<String, GatewayError> {
        let mut events = self.run(prompt, system_prompt)?;

        let report = |stage: &str, message: String, prefix: Option<String>, tools: Option<u64>| {
            if let Some(callback) = &progress {
                callback(ExecProgress {
                    stage: stage.to_string(),
                    message,
                    partial_response_prefix: prefix,
                    tool_calls: tools,
                });
            }
        };

        let mut accumulated = String::new();
        let mut final_result: Option<Result<String, GatewayError>> = None;
        let mut tool_calls: u64 = 0;
        let mut exit: Option<(Option<i32>, String)> = None;

        while let Some(event) = events.recv().await {
            match event {
                ExecEvent::SubprocessStart { pid } => {
                    report("starting", format!("CLI process running (pid {pid})"), None, None);
                }
                ExecEvent::StatusUpdate { status, .. } => {
                    report(&status, format!("CLI reported status '{status}'"), None, None);
                }
                ExecEvent::TextChunk { chunk } => {
                    accumulated.push_str(&chunk);
                    let prefix: String = accumulated.chars().take(200).collect();
                    report(
                        "generating_response",
                        format!("generated {} characters", accumulated.len()),
                        Some(prefix),
                        None,
                    );
                }
                ExecEvent::ToolCall { name } => {
                    tool_calls += 1;
                    report(
                        "tool_execution",
                        format!("executing tool: {name}"),
                        None,
                        Some(tool_calls),
                    );
                }
                ExecEvent::FinalResult {
                    success,
                    content,
                    details,
                } => {
                    if success {
                        final_result = Some(Ok(content));
                    } else if details
                        .as_ref()
                        .and_then(|d| d.get("reason"))
                        .and_then(Value::as_str)
                        == Some("timeout")
                    {
                        final_result = Some(Err(GatewayError::Timeout(self.timeout)));
                    } else {
                        let message = details
                            .as_ref()
                            .map(Value::to_string)
                            .unwrap_or_else(|| "CLI reported an error result".into());
                        final_result = Some(Err(GatewayError::Provider {
                            message,
                            retryable: false,
                        }));
                    }
                }
                ExecEvent::StreamParseError { line } => {
                    warn!("unparsable CLI stream line: {line}");
                }
                ExecEvent::SubprocessExit { code, stderr } => {
                    exit = Some((code, stderr));
                }
            }
        }

        match final_result {
            Some(Ok(content)) if !content.is_empty() => Ok(content),
            Some(Ok(_)) => Ok(accumulated.trim().to_string()),
            Some(Err(e)) => Err(e),
            None => {
                let (code, stderr) = exit.unwrap_or((None, String::new()));
                match code {
                    Some(0) if !accumulated.trim().is_empty() => {
                        Ok(accumulated.trim().to_string())
                    }
                    Some(0) => Err(GatewayError::Provider {
                        message: "CLI produced no output".into(),
                        retryable: false,
                    }),
                    other => Err(GatewayError::Provider {
                        message: format!(
                            "CLI exited with code {other:?} before delivering a result: {stderr}"
                        ),
                        retryable: false,
                    }),
                }
            }
        }
    }
}

/// Parse one stdout line into events. Unparsable lines become
/// `stream_parse_error`; recognized message types map per the CLI contract.
pub fn parse_stream_line(line: &str) -> Vec<ExecEvent> {
    let Ok(data) = serde_json::from_str::<Value>(line) else {
        return vec![ExecEvent::StreamParseError {
            line: line.to_string(),
        }];
    };

    match data.get("type").and_then(Value::as_str) {
        Some("assistant") => {
            let mut events = Vec::new();
            if let Some(content) = data["message"]["content"].as_array() {
                for item in content {
                    if item.get("type").and_then(Value::as_str) == Some("text") {
                        if let Some(text) = item.get("text").and_then(Value::as_str) {
                            events.push(ExecEvent::TextChunk {
                                chunk: text.to_string(),
                            });
                            break;
                        }
                    }
                }
            }
            events
        }
        Some("system") if data.get("subtype").and_then(Value::as_str) == Some("init") => {
            vec![ExecEvent::StatusUpdate {
                status: "init".into(),
                details: data,
            }]
        }
        Some("tool_use") => {
            let name = data["tool"]["name"].as_str().unwrap_or("unknown").to_string();
            vec![ExecEvent::ToolCall { name }]
        }
        Some("result") => {
            if data.get("subtype").and_then(Value::as_str) == Some("success") {
                let content = data
                    .get("result")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                vec![ExecEvent::FinalResult {
                    success: true,
                    content,
                    details: None,
                }]
            } else {
                vec![ExecEvent::FinalResult {
                    success: false,
                    content: String::new(),
                    details: Some(data),
                }]
            }
        }
        _ => {
            debug!("ignoring unrecognized CLI stream message");
            Vec::new()
        }
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        warn!("CLI subprocess ignored SIGTERM, killing");
    }
    let _ = child.kill().await;
}

#[cfg(test)]
mod tests;
