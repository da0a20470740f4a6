use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::errors::GatewayError;
use crate::request::{ChatResponse, Message, ResponseFormat};

/// Per-call parameters after routing normalization. Orchestration-only keys
/// (validation specs, retry knobs, image settings) never appear here.
#[derive(Debug, Clone, Default)]
pub struct CompletionParams {
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub response_format: Option<ResponseFormat>,
    pub stream: bool,
    pub timeout: Option<Duration>,
    /// Tool manifest, forwarded on CLI-proxy routes and when staged retry
    /// injects the debug tool.
    pub mcp_config: Option<Value>,
    /// CLI-proxy polling mode: the proxy returns a task id instead of a
    /// completion.
    pub polling: bool,
    pub vertex_project: Option<String>,
    pub vertex_location: Option<String>,
}

/// One provider invocation: the working message list plus normalized params.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub params: CompletionParams,
}

/// Uniform adapter contract over one provider family.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(&self, req: CompletionRequest) -> Result<ChatResponse, GatewayError>;

    fn name(&self) -> &str;
}
