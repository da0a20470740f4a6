use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::errors::GatewayError;
use crate::providers::base::{ChatProvider, CompletionRequest};
use crate::providers::http_chat::{error_from_response, map_request_error};
use crate::request::ChatResponse;

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Adapter for the in-process CLI proxy (§ proxy module). Speaks the same
/// chat-completions dialect, extended with `mcp_config` and polling fields.
pub struct CliProxyProvider {
    base_url: String,
    default_timeout: Duration,
    client: Client,
}

impl CliProxyProvider {
    pub fn new(base_url: String, default_timeout: Duration) -> Self {
        Self {
            base_url,
            default_timeout,
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn build_payload(req: &CompletionRequest) -> Value {
        let params = &req.params;
        let mut payload = json!({
            "model": params.model,
            "messages": req.messages,
        });
        if let Some(t) = params.temperature {
            payload["temperature"] = json!(t);
        }
        if let Some(m) = params.max_tokens {
            payload["max_tokens"] = json!(m);
        }
        if let Some(rf) = &params.response_format {
            payload["response_format"] = json!(rf);
        }
        if let Some(mcp) = &params.mcp_config {
            payload["mcp_config"] = mcp.clone();
        }
        if params.polling {
            payload["polling_mode"] = json!(true);
        }
        if let Some(timeout) = params.timeout {
            payload["timeout"] = json!(timeout.as_secs_f64());
        }
        payload
    }
}

#[async_trait]
impl ChatProvider for CliProxyProvider {
    async fn complete(&self, req: CompletionRequest) -> Result<ChatResponse, GatewayError> {
        // The proxy runs an interactive CLI; give the HTTP call headroom
        // beyond the subprocess's own budget.
        let timeout = req
            .params
            .timeout
            .unwrap_or(self.default_timeout)
            .saturating_add(Duration::from_secs(10));

        let resp = self
            .client
            .post(self.endpoint())
            .timeout(timeout)
            .json(&Self::build_payload(&req))
            .send()
            .await
            .map_err(|e| map_request_error(&e, timeout))?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::Transport(format!("failed to decode proxy response: {e}")))?;

        // Polling submissions come back as a task document, not a completion.
        // Surface it as a synthetic response so callers can read the task id.
        if let Some(task_id) = body.get("task_id").and_then(Value::as_str) {
            debug!("proxy accepted polling task {task_id}");
            return Ok(ChatResponse::from_text(
                req.params.model.clone(),
                body.to_string(),
            ));
        }

        serde_json::from_value(body)
            .map_err(|e| GatewayError::Transport(format!("malformed proxy completion: {e}")))
    }

    fn name(&self) -> &str {
        "cli_proxy"
    }
}

#[cfg(test)]
mod tests;
