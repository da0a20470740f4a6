//! Validator contracts and the process-wide registry.
//!
//! Validators decide whether a provider response is acceptable. They are
//! addressed by a `type` string (see [`crate::request::ValidatorSpec`]) and
//! constructed through factory functions registered once at startup. AI
//! validators additionally receive a recursion handle back into the
//! orchestrator through [`ValidationContext`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::GatewayError;
use crate::request::{ChatResponse, RequestConfig, ValidatorSpec};

mod advanced;
mod ai;
mod basic;

pub use ai::{default_tool_manifest, selective_mcp_config};

/// Outcome of a single validation strategy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<Value>,
}

impl ValidationResult {
    pub fn pass() -> Self {
        Self {
            valid: true,
            ..Default::default()
        }
    }

    pub fn pass_with_debug(debug: Value) -> Self {
        Self {
            valid: true,
            debug: Some(debug),
            ..Default::default()
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self
    }

    pub fn with_debug(mut self, debug: Value) -> Self {
        self.debug = Some(debug);
        self
    }
}

/// Handle that lets AI validators re-enter the orchestrator. The
/// implementation enforces the recursion depth cap.
#[async_trait]
pub trait RecursiveCaller: Send + Sync {
    async fn call(&self, request: RequestConfig) -> Result<ChatResponse, GatewayError>;
}

/// Per-attempt context handed to every validator.
#[derive(Clone)]
pub struct ValidationContext {
    /// 0-indexed attempt number within the retry loop.
    pub attempt: usize,
    /// The user's original request text, for judge prompts.
    pub original_prompt: Option<String>,
    /// Current recursion depth (0 for top-level requests).
    pub depth: usize,
    pub max_depth: usize,
    /// Set for requests running under an orchestrator; AI validators fail
    /// gracefully when absent.
    pub recursive: Option<Arc<dyn RecursiveCaller>>,
}

impl ValidationContext {
    pub fn detached() -> Self {
        Self {
            attempt: 0,
            original_prompt: None,
            depth: 0,
            max_depth: 3,
            recursive: None,
        }
    }
}

#[async_trait]
pub trait Validator: Send + Sync {
    fn name(&self) -> String;

    async fn validate(&self, response: &ChatResponse, ctx: &ValidationContext)
        -> ValidationResult;
}

impl std::fmt::Debug for dyn Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator").field("name", &self.name()).finish()
    }
}

type ValidatorFactory = fn(&Value) -> Result<Box<dyn Validator>, GatewayError>;

/// String-keyed registry of validator factories. Built once at startup,
/// read-only afterwards.
pub struct ValidatorRegistry {
    factories: HashMap<&'static str, ValidatorFactory>,
}

impl ValidatorRegistry {
    /// Registry with every built-in validator installed.
    pub fn builtin() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("response_not_empty", basic::response_not_empty);
        registry.register("json_string", basic::json_string);
        registry.register("field_present", advanced::field_present);
        registry.register("length", advanced::length);
        registry.register("regex", advanced::regex);
        registry.register("contains", advanced::contains);
        registry.register("code", advanced::code);
        registry.register("schema", advanced::schema);
        registry.register("ai_contradiction_check", ai::contradiction_check);
        registry.register("agent_task", ai::agent_task);
        registry
    }

    pub fn register(&mut self, kind: &'static str, factory: ValidatorFactory) {
        self.factories.insert(kind, factory);
    }

    pub fn build(&self, spec: &ValidatorSpec) -> Result<Box<dyn Validator>, GatewayError> {
        let factory = self.factories.get(spec.kind.as_str()).ok_or_else(|| {
            GatewayError::Config(format!("unknown validator type: '{}'", spec.kind))
        })?;
        factory(&spec.params)
    }

    /// Build the full list for a request, failing fast on any unknown type
    /// or bad parameters.
    pub fn build_all(
        &self,
        specs: &[ValidatorSpec],
    ) -> Result<Vec<Box<dyn Validator>>, GatewayError> {
        specs.iter().map(|spec| self.build(spec)).collect()
    }

    pub fn known_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.factories.keys().copied().collect();
        types.sort_unstable();
        types
    }
}

/// Deserialize validator parameters, mapping failures to `ConfigError`.
pub(crate) fn parse_params<T: serde::de::DeserializeOwned>(
    kind: &str,
    params: &Value,
) -> Result<T, GatewayError> {
    let value = if params.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        params.clone()
    };
    serde_json::from_value(value).map_err(|e| {
        GatewayError::Config(format!("invalid params for validator '{kind}': {e}"))
    })
}
