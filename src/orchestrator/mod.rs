//! Request orchestration: preprocessing, routing, validator wiring, and the
//! retry loop. `make_request` is the single entry point for library callers,
//! the CLI, and recursive AI-validator calls.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::GatewayConfig;
use crate::errors::GatewayError;
use crate::providers::{ChatProvider, CliProxyProvider, HttpChatProvider};
use crate::request::{ChatResponse, Message, RequestConfig};
use crate::retry::{
    retry_with_validation, BreakerRegistry, CircuitBreaker, RetryConfig, StagedRetryPolicy,
};
use crate::router::{is_cli_route, resolve_route, RouteTarget};
use crate::utils::media::resolve_image_parts;
use crate::validation::{RecursiveCaller, ValidationContext, Validator, ValidatorRegistry};

pub struct Orchestrator {
    config: GatewayConfig,
    registry: ValidatorRegistry,
    /// Persistent per-model breakers, present when the gateway config enables
    /// the circuit breaker globally.
    breakers: Option<BreakerRegistry>,
}

impl Orchestrator {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let breakers = config
            .circuit_breaker
            .clone()
            .map(BreakerRegistry::new);
        Arc::new(Self {
            config,
            registry: ValidatorRegistry::builtin(),
            breakers,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub async fn make_request(
        self: &Arc<Self>,
        request: RequestConfig,
    ) -> Result<ChatResponse, GatewayError> {
        self.make_request_at_depth(request, 0).await
    }

    pub(crate) async fn make_request_at_depth(
        self: &Arc<Self>,
        request: RequestConfig,
        depth: usize,
    ) -> Result<ChatResponse, GatewayError> {
        let max_depth = self.config.llm.max_recursion_depth;
        if depth > max_depth {
            return Err(GatewayError::RecursionLimit {
                depth,
                max: max_depth,
            });
        }

        if request.model.is_empty() && request.messages.is_empty() {
            return Err(GatewayError::Config("request config cannot be empty".into()));
        }
        if request.messages.is_empty() {
            return Err(GatewayError::Config("'messages' field is required".into()));
        }

        // The caller's config stays untouched: `request` is already our copy.
        let mut processed = request;

        if processed.wants_json() {
            debug!("JSON response format requested, ensuring system directive");
            inject_json_instruction(
                &mut processed.messages,
                &self.config.llm.json_mode_instruction,
            );
        }

        if processed.is_multimodal() {
            if is_cli_route(&processed.model) {
                return Err(GatewayError::Config(format!(
                    "model '{}' is served by the local CLI and does not accept image inputs; \
                     use an HTTP-routed model for multimodal requests",
                    processed.model
                )));
            }
            info!("multimodal content detected for '{}'", processed.model);
            let max_kb = processed
                .max_image_size_kb
                .unwrap_or(self.config.llm.max_image_size_kb);
            resolve_image_parts(
                &mut processed.messages,
                processed.image_directory.as_deref(),
                max_kb,
            )?;
        }

        let route = resolve_route(&processed, &self.config)?;
        let default_timeout = Duration::from_secs_f64(self.config.llm.default_timeout_secs);
        let provider: Box<dyn ChatProvider> = match &route.target {
            RouteTarget::CliProxy { base_url } => {
                Box::new(CliProxyProvider::new(base_url.clone(), default_timeout))
            }
            RouteTarget::HttpChat { base_url, api_key } => Box::new(HttpChatProvider::new(
                base_url.clone(),
                api_key.clone(),
                default_timeout,
            )),
        };

        let mut validators: Vec<Box<dyn Validator>> =
            self.registry.build_all(&processed.validation)?;
        if validators.is_empty() && self.config.llm.validation_enabled {
            validators = self.default_validators(&processed)?;
        }

        let retry_config = processed
            .retry
            .clone()
            .unwrap_or_else(|| self.config.retry.clone());
        let staged = StagedRetryPolicy::from_request(&processed);
        let breaker = self.breaker_for(&route.params.model, &retry_config);

        let vctx = ValidationContext {
            attempt: 0,
            original_prompt: staged.original_user_prompt.clone(),
            depth,
            max_depth,
            recursive: Some(Arc::new(DepthGuardedCaller {
                orchestrator: self.clone(),
                depth: depth + 1,
            })),
        };

        retry_with_validation(
            provider.as_ref(),
            route.params,
            processed.messages,
            &validators,
            &retry_config,
            &staged,
            breaker,
            &vctx,
        )
        .await
    }

    fn default_validators(
        &self,
        request: &RequestConfig,
    ) -> Result<Vec<Box<dyn Validator>>, GatewayError> {
        use crate::request::ValidatorSpec;
        let mut specs = vec![ValidatorSpec::new("response_not_empty")];
        if request.wants_json() {
            specs.push(ValidatorSpec::new("json_string"));
        }
        self.registry.build_all(&specs)
    }

    /// Pick the breaker for this call: the persistent per-model one when the
    /// gateway enables breakers globally, a fresh single-call breaker when
    /// only the request's retry config asks for one.
    fn breaker_for(
        &self,
        model: &str,
        retry_config: &RetryConfig,
    ) -> Option<Arc<tokio::sync::Mutex<CircuitBreaker>>> {
        if let Some(registry) = &self.breakers {
            return Some(registry.breaker_for(model));
        }
        retry_config.circuit_breaker.clone().map(|cb_config| {
            Arc::new(tokio::sync::Mutex::new(CircuitBreaker::new(
                model, cb_config,
            )))
        })
    }
}

/// Recursion handle given to AI validators. Each hop increments the depth;
/// the orchestrator refuses calls past the configured maximum.
struct DepthGuardedCaller {
    orchestrator: Arc<Orchestrator>,
    depth: usize,
}

#[async_trait]
impl RecursiveCaller for DepthGuardedCaller {
    async fn call(&self, request: RequestConfig) -> Result<ChatResponse, GatewayError> {
        self.orchestrator
            .make_request_at_depth(request, self.depth)
            .await
    }
}

/// Ensure a JSON-only directive is present in the system prompt. Inserts a
/// system message at position 0 when none exists; otherwise prepends the
/// directive unless the existing prompt already talks about JSON output.
/// Idempotent: running it twice yields the same messages.
pub(crate) fn inject_json_instruction(messages: &mut Vec<Message>, instruction: &str) {
    match messages.iter().position(|m| m.role == "system") {
        None => messages.insert(0, Message::system(instruction)),
        Some(i) => {
            let existing = messages[i].text();
            let lower = existing.to_lowercase();
            if !lower.contains("json object") && !lower.contains("valid json") {
                let combined = format!("{instruction} {existing}");
                messages[i].content = combined.trim().to_string().into();
            }
        }
    }
}
