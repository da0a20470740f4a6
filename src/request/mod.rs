use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// One part of a multimodal message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Message content: plain text or an ordered list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Flatten to plain text, concatenating text parts with spaces.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    pub fn has_images(&self) -> bool {
        matches!(self, Self::Parts(parts)
            if parts.iter().any(|p| matches!(p, ContentPart::ImageUrl { .. })))
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

impl Message {
    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }

    pub fn text(&self) -> String {
        self.content.as_text()
    }
}

/// Requested output constraint, OpenAI-style: `{"type": "json_object"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub format_type: String,
}

impl ResponseFormat {
    pub fn json_object() -> Self {
        Self {
            format_type: "json_object".into(),
        }
    }

    pub fn is_json_object(&self) -> bool {
        self.format_type == "json_object"
    }
}

/// A named validation strategy plus its parameters. The `type` string indexes
/// the validator registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl ValidatorSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: Value::Null,
        }
    }

    pub fn with_params(kind: impl Into<String>, params: Value) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }
}

/// Caller-facing request configuration. Value semantics: the orchestrator
/// clones this before any preprocessing mutates messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestConfig {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// Provider call timeout in seconds.
    #[serde(default, rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,

    /// Caller-supplied endpoint overrides (required for `runpod/{model}` routes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertex_project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertex_location: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation: Vec<ValidatorSpec>,
    #[serde(
        default,
        alias = "retry_config",
        skip_serializing_if = "Option::is_none"
    )]
    pub retry: Option<crate::retry::RetryConfig>,

    /// Tool manifest forwarded verbatim to CLI-proxy routes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_config: Option<Value>,
    /// CLI-proxy polling mode: return a task id instead of a completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling: Option<bool>,

    /// Base directory for resolving relative image paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_directory: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_image_size_kb: Option<u64>,

    // Staged-retry knobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts_before_tool_use: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts_before_human: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_tool_mcp_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_user_prompt: Option<String>,
}

impl RequestConfig {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Default::default()
        }
    }

    /// Whether any message carries an image part.
    pub fn is_multimodal(&self) -> bool {
        self.messages.iter().any(|m| m.content.has_images())
    }

    pub fn wants_json(&self) -> bool {
        self.response_format
            .as_ref()
            .is_some_and(ResponseFormat::is_json_object)
    }

    /// Content of the last user message (used as original-prompt context in
    /// retry feedback when the caller didn't supply one).
    pub fn last_user_prompt(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(Message::text)
    }
}

/// Normalized provider result, compatible with OpenAI chat completions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    #[serde(default = "default_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

fn default_object() -> String {
    "chat.completion".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: ResponseMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl ChatResponse {
    /// Build a minimal response around assistant text (used by the CLI proxy
    /// and by tests).
    pub fn from_text(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: format!("gen-{}", uuid::Uuid::new_v4().simple()),
            object: default_object(),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".into(),
                    content: Some(content.into()),
                },
                finish_reason: Some("stop".into()),
            }],
            usage: None,
        }
    }

    /// Content of the first choice, empty string when absent.
    pub fn content(&self) -> &str {
        self.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .unwrap_or("")
    }
}
