use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::GatewayError;
use crate::providers::base::{ChatProvider, CompletionRequest};
use crate::providers::sse::{SseBuffer, StreamFrame};
use crate::request::ChatResponse;

const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Adapter for OpenAI-compatible chat-completions endpoints.
pub struct HttpChatProvider {
    base_url: String,
    api_key: Option<String>,
    default_timeout: Duration,
    client: Client,
}

impl HttpChatProvider {
    pub fn new(base_url: String, api_key: Option<String>, default_timeout: Duration) -> Self {
        Self {
            base_url,
            api_key,
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
        if params.stream {
            payload["stream"] = json!(true);
        }
        if let Some(project) = &params.vertex_project {
            payload["vertex_project"] = json!(project);
        }
        if let Some(location) = &params.vertex_location {
            payload["vertex_location"] = json!(location);
        }
        payload
    }

    async fn send(&self, req: &CompletionRequest) -> Result<reqwest::Response, GatewayError> {
        let timeout = req.params.timeout.unwrap_or(self.default_timeout);
        let mut builder = self
            .client
            .post(self.endpoint())
            .timeout(timeout)
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let resp = builder
            .json(&Self::build_payload(req))
            .send()
            .await
            .map_err(|e| map_request_error(&e, timeout))?;

        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            Err(error_from_response(resp).await)
        }
    }

    async fn complete_streaming(
        &self,
        req: &CompletionRequest,
    ) -> Result<ChatResponse, GatewayError> {
        use futures_util::StreamExt;

        let resp = self.send(req).await?;
        let mut stream = resp.bytes_stream();
        let mut buffer = SseBuffer::default();

        let mut id: Option<String> = None;
        let mut model: Option<String> = None;
        let mut finish_reason: Option<String> = None;
        let mut content = String::new();

        let consume = |data: &Value,
                           id: &mut Option<String>,
                           model: &mut Option<String>,
                           finish: &mut Option<String>,
                           content: &mut String| {
            if id.is_none() {
                *id = data.get("id").and_then(Value::as_str).map(String::from);
            }
            if model.is_none() {
                *model = data.get("model").and_then(Value::as_str).map(String::from);
            }
            if let Some(choice) = data["choices"].get(0) {
                if let Some(delta) = choice["delta"]["content"].as_str() {
                    content.push_str(delta);
                }
                if let Some(reason) = choice["finish_reason"].as_str() {
                    *finish = Some(reason.to_string());
                }
            }
        };

        while let Some(chunk) = stream.next().await {
            let bytes =
                chunk.map_err(|e| GatewayError::Transport(format!("stream read failed: {e}")))?;
            let text = String::from_utf8_lossy(&bytes);
            for frame in buffer.push(&text) {
                if let StreamFrame::Chunk(data) = frame {
                    consume(&data, &mut id, &mut model, &mut finish_reason, &mut content);
                }
            }
        }
        for frame in buffer.finish() {
            if let StreamFrame::Chunk(data) = frame {
                consume(&data, &mut id, &mut model, &mut finish_reason, &mut content);
            }
        }

        debug!("assembled {} streamed chars", content.len());
        let mut response = ChatResponse::from_text(
            model.unwrap_or_else(|| req.params.model.clone()),
            content,
        );
        if let Some(id) = id {
            response.id = id;
        }
        response.choices[0].finish_reason = finish_reason.or(Some("stop".into()));
        Ok(response)
    }
}

#[async_trait]
impl ChatProvider for HttpChatProvider {
    async fn complete(&self, req: CompletionRequest) -> Result<ChatResponse, GatewayError> {
        if req.params.stream {
            return self.complete_streaming(&req).await;
        }
        let resp = self.send(&req).await?;
        resp.json::<ChatResponse>()
            .await
            .map_err(|e| GatewayError::Transport(format!("failed to decode response: {e}")))
    }

    fn name(&self) -> &str {
        "http_chat"
    }
}

/// Map a failed HTTP status to the typed error taxonomy.
pub(crate) async fn error_from_response(resp: reqwest::Response) -> GatewayError {
    let status = resp.status();
    let retry_after = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let body = resp.text().await.unwrap_or_default();
    let message = api_error_message(status.as_u16(), &body);

    match status.as_u16() {
        401 | 403 => GatewayError::Auth(message),
        429 => {
            warn!("rate limited (retry-after: {retry_after:?})");
            GatewayError::RateLimit { retry_after }
        }
        500..=599 => GatewayError::Transport(message),
        _ => GatewayError::Provider {
            message,
            retryable: false,
        },
    }
}

/// Prefer the structured `error.message` field when the body carries one.
fn api_error_message(status: u16, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<Value>(body) {
        if let Some(error) = parsed.get("error") {
            let error_type = error
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let error_msg = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            return format!("API error ({error_type}): {error_msg}");
        }
    }
    let preview: String = body.chars().take(200).collect();
    format!("API error ({status}): {preview}")
}

pub(crate) fn map_request_error(e: &reqwest::Error, timeout: Duration) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout(timeout)
    } else {
        GatewayError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests;
