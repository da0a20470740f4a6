//! OpenAI-compatible HTTP proxy fronting the CLI subprocess executor.
//!
//! `POST /v1/chat/completions` accepts a chat-completions body extended with
//! `mcp_config`, `polling_mode`, `wait_for_completion`, and `timeout`. The
//! per-request tool manifest is written to `{workdir}/.mcp.json` for exactly
//! the duration of the CLI run; a drop guard removes it on every exit path,
//! and an in-process mutex keeps the workdir exclusive to one request.

use anyhow::Result;
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::errors::GatewayError;
use crate::executor::{CliExecutor, ExecProgress, ProgressFn};
use crate::polling::{PollingManager, TaskStatus};
use crate::request::{ChatResponse, Message, ResponseFormat};
use crate::utils::json::extract_json_block;
use crate::validation::default_tool_manifest;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Default wait budget for `wait_for_completion`, in seconds.
const DEFAULT_WAIT_SECS: f64 = 300.0;

#[derive(Clone)]
pub struct ProxyState {
    config: Arc<GatewayConfig>,
    executor: CliExecutor,
    polling: Arc<PollingManager>,
    /// Serializes access to the workdir (and its `.mcp.json`).
    workdir_lock: Arc<tokio::sync::Mutex<()>>,
    default_mcp: Arc<Value>,
}

impl ProxyState {
    pub fn new(config: GatewayConfig, polling: Arc<PollingManager>) -> Self {
        let executor = CliExecutor::new(&config.proxy);
        Self {
            config: Arc::new(config),
            executor,
            polling,
            workdir_lock: Arc::new(tokio::sync::Mutex::new(())),
            default_mcp: Arc::new(default_tool_manifest()),
        }
    }
}

/// Chat-completions body plus the proxy's extension fields. Unknown keys are
/// ignored so standard OpenAI clients work unmodified.
#[derive(Debug, Deserialize)]
struct ProxyChatRequest {
    #[serde(default)]
    model: String,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    response_format: Option<ResponseFormat>,
    #[serde(default)]
    mcp_config: Option<Value>,
    #[serde(default)]
    polling_mode: bool,
    #[serde(default)]
    wait_for_completion: bool,
    #[serde(default)]
    timeout: Option<f64>,
}

pub fn build_router(state: ProxyState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/polling/status/{task_id}", get(polling_status))
        .route("/v1/polling/cancel/{task_id}", post(polling_cancel))
        .route("/v1/polling/active", get(polling_active))
        .route("/health", get(health))
        .with_state(state)
}

/// Start the proxy server and the polling TTL cleanup loop.
pub async fn serve(config: GatewayConfig) -> Result<()> {
    std::fs::create_dir_all(&config.proxy.workspace_dir)?;
    let polling = PollingManager::new(&config.polling)?;
    polling.start_cleanup();

    let addr = format!("{}:{}", config.proxy.host, config.proxy.port);
    let state = ProxyState::new(config, polling.clone());
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("CLI proxy listening on {addr}");
    axum::serve(listener, app).await?;

    polling.cancel_all()?;
    Ok(())
}

/// Removes the per-request `.mcp.json` on drop, whatever the exit path.
struct McpFileGuard {
    path: PathBuf,
}

impl McpFileGuard {
    fn write(path: PathBuf, manifest: &Value) -> Result<Self, GatewayError> {
        std::fs::write(&path, serde_json::to_string_pretty(manifest).unwrap_or_default())
            .map_err(|e| {
                GatewayError::Internal(anyhow::anyhow!(
                    "failed to write tool manifest {}: {e}",
                    path.display()
                ))
            })?;
        debug!("wrote tool manifest to {}", path.display());
        Ok(Self { path })
    }
}

impl Drop for McpFileGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove {}: {e}", self.path.display());
            }
        } else {
            debug!("removed tool manifest {}", self.path.display());
        }
    }
}

/// Run one CLI execution with the manifest in place, returning an
/// OpenAI-shaped completion document.
async fn run_cli_request(
    state: ProxyState,
    model: String,
    prompt: String,
    system_prompt: String,
    manifest: Value,
    response_format: Option<ResponseFormat>,
    progress: Option<ProgressFn>,
) -> Result<Value, GatewayError> {
    let _workdir = state.workdir_lock.lock().await;
    let mcp_path = state.config.proxy.workspace_dir.join(".mcp.json");
    let _manifest_guard = McpFileGuard::write(mcp_path, &manifest)?;

    let raw = state
        .executor
        .run_to_completion(prompt, system_prompt, progress)
        .await?;

    let content = if response_format.as_ref().is_some_and(ResponseFormat::is_json_object) {
        // Best effort: models often wrap JSON in fences or prose. Fall back
        // to the raw text when nothing parses.
        extract_json_block(&raw).unwrap_or(raw)
    } else {
        raw
    };

    let mut response = ChatResponse::from_text(model, content);
    response.id = format!("cli-{}", uuid::Uuid::new_v4().simple());
    response.usage = Some(crate::request::Usage::default());
    serde_json::to_value(response).map_err(|e| GatewayError::Internal(e.into()))
}

fn error_status(e: &GatewayError) -> StatusCode {
    match e {
        GatewayError::Config(_) => StatusCode::BAD_REQUEST,
        GatewayError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn chat_completions(
    State(state): State<ProxyState>,
    Json(body): Json<ProxyChatRequest>,
) -> impl IntoResponse {
    // Last user message is the prompt; text parts are concatenated.
    let prompt = body
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(Message::text)
        .unwrap_or_default();
    if prompt.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "no user message provided"})),
        );
    }
    let system_prompt = body
        .messages
        .iter()
        .find(|m| m.role == "system")
        .map(Message::text)
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

    let manifest = match &body.mcp_config {
        Some(manifest) => {
            debug!("using request-supplied tool manifest");
            manifest.clone()
        }
        None => (*state.default_mcp).clone(),
    };

    let model = if body.model.is_empty() {
        "cli/default".to_string()
    } else {
        body.model.clone()
    };

    // Polling path: durable submission, optionally waiting for the result.
    // When both flags are set, waiting wins.
    if body.polling_mode || body.wait_for_completion {
        let task_config = json!({
            "model": model,
            "prompt_preview": prompt.chars().take(120).collect::<String>(),
            "response_format": body.response_format,
        });

        let worker_state = state.clone();
        let worker_model = model.clone();
        let response_format = body.response_format.clone();
        let submit = state.polling.submit(task_config, move |handle| {
            let progress_handle = handle.clone();
            let progress: ProgressFn = Arc::new(move |p: ExecProgress| {
                progress_handle
                    .set_progress(serde_json::to_value(&p).unwrap_or(Value::Null));
            });
            run_cli_request(
                worker_state,
                worker_model,
                prompt,
                system_prompt,
                manifest,
                response_format,
                Some(progress),
            )
        });

        let task_id = match submit {
            Ok(id) => id,
            Err(e) => return (error_status(&e), Json(json!({"error": e.to_string()}))),
        };

        let polling_url = format!("/v1/polling/status/{task_id}");
        if body.wait_for_completion {
            let limit = Duration::from_secs_f64(body.timeout.unwrap_or(DEFAULT_WAIT_SECS));
            return match state.polling.wait(&task_id, Some(limit)).await {
                Ok(result) => (StatusCode::OK, Json(result)),
                Err(GatewayError::Timeout(_)) => (
                    StatusCode::REQUEST_TIMEOUT,
                    Json(json!({
                        "error": "request timeout",
                        "task_id": task_id,
                        "message": format!("task is still running; check status at {polling_url}"),
                    })),
                ),
                Err(e) => (error_status(&e), Json(json!({"error": e.to_string()}))),
            };
        }

        return (
            StatusCode::OK,
            Json(json!({
                "task_id": task_id,
                "status": "pending",
                "message": "task submitted for background execution",
                "polling_url": polling_url,
            })),
        );
    }

    // Synchronous path.
    match run_cli_request(
        state,
        model,
        prompt,
        system_prompt,
        manifest,
        body.response_format,
        None,
    )
    .await
    {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(e) => (error_status(&e), Json(json!({"error": e.to_string()}))),
    }
}

async fn polling_status(
    State(state): State<ProxyState>,
    AxumPath(task_id): AxumPath<String>,
) -> impl IntoResponse {
    match state.polling.get_status(&task_id) {
        Ok(Some(task)) => {
            let mut body = json!({
                "task_id": task.task_id,
                "status": task.status,
                "created_at": task.created_at,
                "started_at": task.started_at,
                "completed_at": task.completed_at,
                "progress": task.progress,
            });
            match task.status {
                TaskStatus::Completed => body["result"] = task.result.unwrap_or(Value::Null),
                TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Cancelled => {
                    body["error"] = json!(task.error)
                }
                _ => {}
            }
            (StatusCode::OK, Json(body))
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("task {task_id} not found")})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

async fn polling_cancel(
    State(state): State<ProxyState>,
    AxumPath(task_id): AxumPath<String>,
) -> impl IntoResponse {
    match state.polling.cancel(&task_id) {
        Ok(true) => (
            StatusCode::OK,
            Json(json!({"message": format!("task {task_id} cancelled")})),
        ),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("task {task_id} not found or already completed")})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

async fn polling_active(State(state): State<ProxyState>) -> impl IntoResponse {
    match state.polling.active_tasks() {
        Ok(tasks) => {
            let active: Vec<Value> = tasks
                .iter()
                .map(|task| {
                    json!({
                        "task_id": task.task_id,
                        "status": task.status,
                        "model": task.config.get("model").cloned().unwrap_or(Value::Null),
                        "created_at": task.created_at,
                        "started_at": task.started_at,
                        "progress": task.progress,
                    })
                })
                .collect();
            let count = active.len();
            (
                StatusCode::OK,
                Json(json!({"active_tasks": active, "count": count})),
            )
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

async fn health(State(state): State<ProxyState>) -> impl IntoResponse {
    let active = state.polling.active_tasks().map(|t| t.len()).unwrap_or(0);
    Json(json!({
        "status": "healthy",
        "working_directory": state.config.proxy.workspace_dir.display().to_string(),
        "mcp_support": true,
        "active_tasks": active,
    }))
}
