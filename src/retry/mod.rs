//! Validation-aware retry with staged escalation.
//!
//! The engine calls a provider, runs the configured validators in order, and
//! on failure feeds the errors back to the model as conversation context
//! before retrying with exponential backoff. Escalation is staged: plain
//! retries first, then retries with an injected debug tool, then a terminal
//! human-review error.

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

mod breaker;

pub use breaker::{BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitState};

use crate::errors::GatewayError;
use crate::providers::{ChatProvider, CompletionParams, CompletionRequest};
use crate::request::{ChatResponse, Message, RequestConfig};
use crate::validation::{ValidationContext, ValidationResult, Validator};

fn default_max_attempts() -> usize {
    3
}
fn default_initial_delay() -> f64 {
    1.0
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_max_delay() -> f64 {
    60.0
}
fn default_jitter_fraction() -> f64 {
    0.1
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Seconds before the first retry.
    #[serde(default = "default_initial_delay")]
    pub initial_delay: f64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Upper bound on the backoff delay, in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
    /// Jitter as a fraction of the delay, in [0, 1]. Zero disables jitter.
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
    /// Accepted for config compatibility; response caching is an external
    /// collaborator, not part of the retry engine.
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default)]
    pub debug_mode: bool,
    #[serde(default, rename = "circuitBreaker")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            backoff_factor: default_backoff_factor(),
            max_delay: default_max_delay(),
            jitter_fraction: default_jitter_fraction(),
            cache_enabled: true,
            debug_mode: false,
            circuit_breaker: None,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff delay for a 0-indexed attempt, with jitter.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_delay * self.backoff_factor.powi(attempt as i32);
        delay = delay.min(self.max_delay);

        if self.jitter_fraction > 0.0 {
            let jitter = delay * self.jitter_fraction;
            delay += jitter * (2.0 * fastrand::f64() - 1.0);
            delay = delay.max(0.1);
        }

        Duration::from_secs_f64(delay.max(0.0))
    }
}

/// Escalation thresholds and debug-tool wiring extracted from the request.
#[derive(Debug, Clone, Default)]
pub struct StagedRetryPolicy {
    pub max_attempts_before_tool_use: Option<usize>,
    pub max_attempts_before_human: Option<usize>,
    pub debug_tool_name: Option<String>,
    pub debug_tool_mcp_config: Option<Value>,
    pub original_user_prompt: Option<String>,
}

impl StagedRetryPolicy {
    pub fn from_request(request: &RequestConfig) -> Self {
        Self {
            max_attempts_before_tool_use: request.max_attempts_before_tool_use,
            max_attempts_before_human: request.max_attempts_before_human,
            debug_tool_name: request.debug_tool_name.clone(),
            debug_tool_mcp_config: request.debug_tool_mcp_config.clone(),
            original_user_prompt: request
                .original_user_prompt
                .clone()
                .or_else(|| request.last_user_prompt()),
        }
    }

    /// Should this attempt's outbound params carry the debug tool manifest?
    fn tool_injection_due(&self, attempt: usize) -> bool {
        self.max_attempts_before_tool_use
            .is_some_and(|threshold| attempt >= threshold)
            && self.debug_tool_mcp_config.is_some()
    }

    /// Should the feedback for this attempt direct the model at the tool?
    /// (The next attempt will run past the threshold.)
    fn tool_suggestion_due(&self, attempt: usize) -> bool {
        self.max_attempts_before_tool_use
            .is_some_and(|threshold| attempt + 1 >= threshold)
            && self.debug_tool_name.is_some()
    }
}

/// Soft cap on a single feedback message, to avoid unbounded context growth.
const FEEDBACK_CAP_BYTES: usize = 4096;

/// Build the corrective user message appended after a failed attempt.
/// Attempts are reported 1-indexed to the model.
pub fn build_feedback_message(
    validation_errors: &[ValidationResult],
    attempt: usize,
    max_attempts: usize,
    original_prompt: Option<&str>,
    use_tool: Option<&str>,
) -> String {
    let mut parts = vec![
        format!(
            "Your response did not pass validation (attempt {}/{max_attempts}).",
            attempt + 1
        ),
        "\nValidation errors found:".to_string(),
    ];

    for (i, result) in validation_errors.iter().enumerate() {
        parts.push(format!(
            "\n{}. {}",
            i + 1,
            result.error.as_deref().unwrap_or("validation failed")
        ));
        if !result.suggestions.is_empty() {
            parts.push("   Suggestions to fix:".to_string());
            for suggestion in &result.suggestions {
                parts.push(format!("   - {suggestion}"));
            }
        }
    }

    if let Some(tool) = use_tool {
        parts.push(format!(
            "\nIMPORTANT: You should use the '{tool}' tool to help debug and fix these issues."
        ));
        parts.push(format!(
            "   Use '{tool}' to research the error or find the correct solution."
        ));
    }

    if let Some(prompt) = original_prompt {
        parts.push(format!("\nOriginal request: {prompt}"));
    }

    parts.push("\nPlease provide a corrected response that addresses these validation errors.".to_string());

    truncate_to(parts.join("\n"), FEEDBACK_CAP_BYTES)
}

fn truncate_to(mut text: String, cap: usize) -> String {
    if text.len() <= cap {
        return text;
    }
    let mut end = cap.saturating_sub(16);
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text.push_str("\n…[truncated]");
    text
}

/// Run the staged retry + validation state machine.
///
/// Returns the first response that passes every validator, or a typed error:
/// `CircuitOpen` when the breaker rejects, `HumanReviewNeeded` past the
/// escalation threshold, `Auth`/`Config` immediately, `RetryExhausted` when
/// plain attempts run out.
#[allow(clippy::too_many_arguments)]
pub async fn retry_with_validation(
    provider: &dyn ChatProvider,
    base_params: CompletionParams,
    messages: Vec<Message>,
    validators: &[Box<dyn Validator>],
    config: &RetryConfig,
    staged: &StagedRetryPolicy,
    breaker: Option<Arc<tokio::sync::Mutex<CircuitBreaker>>>,
    vctx: &ValidationContext,
) -> Result<ChatResponse, GatewayError> {
    let model = base_params.model.clone();
    let human_threshold = staged
        .max_attempts_before_human
        .unwrap_or(config.max_attempts);

    let mut working_messages = messages;
    let mut accumulated_errors: Vec<ValidationResult> = Vec::new();
    let mut last_attempt_errors: Vec<ValidationResult> = Vec::new();
    let mut last_response: Option<ChatResponse> = None;

    for attempt in 0..config.max_attempts {
        if let Some(breaker) = &breaker {
            let mut guard = breaker.lock().await;
            if !guard.can_execute() {
                return Err(GatewayError::CircuitOpen {
                    model,
                    retry_in_secs: guard.retry_in_secs(),
                });
            }
        }

        if attempt >= human_threshold {
            return Err(GatewayError::HumanReviewNeeded {
                attempts: attempt,
                last_response: last_response.map(Box::new),
                validation_errors: accumulated_errors,
            });
        }

        let mut params = base_params.clone();
        if staged.tool_injection_due(attempt) {
            debug!(
                "injecting debug tool manifest for '{}' at attempt {}",
                staged.debug_tool_name.as_deref().unwrap_or("?"),
                attempt + 1
            );
            params.mcp_config = staged.debug_tool_mcp_config.clone();
        }

        if config.debug_mode {
            debug!(
                "attempt {}/{} for '{model}' ({} messages)",
                attempt + 1,
                config.max_attempts,
                working_messages.len()
            );
        }

        let request = CompletionRequest {
            messages: working_messages.clone(),
            params,
        };

        match provider.complete(request).await {
            Ok(response) => {
                last_response = Some(response.clone());

                // Validators run in declaration order; the first failure
                // short-circuits the rest of the list. A panicking validator
                // counts as a failure rather than tearing down the request.
                let mut attempt_errors = Vec::new();
                for validator in validators {
                    let ctx = ValidationContext {
                        attempt,
                        ..vctx.clone()
                    };
                    let result = match std::panic::AssertUnwindSafe(
                        validator.validate(&response, &ctx),
                    )
                    .catch_unwind()
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => ValidationResult::fail(format!(
                            "validator crashed: {}",
                            validator.name()
                        )),
                    };
                    if config.debug_mode {
                        debug!(
                            "validator '{}': valid={} error={:?}",
                            validator.name(),
                            result.valid,
                            result.error
                        );
                    }
                    if !result.valid {
                        attempt_errors.push(result);
                        break;
                    }
                }

                if attempt_errors.is_empty() {
                    if let Some(breaker) = &breaker {
                        breaker.lock().await.record_success();
                    }
                    info!(
                        "validation passed for '{model}' on attempt {}",
                        attempt + 1
                    );
                    return Ok(response);
                }

                accumulated_errors.extend(attempt_errors.iter().cloned());

                if attempt + 1 < config.max_attempts {
                    // Echo the failed response, then tell the model what to fix.
                    working_messages.push(Message::assistant(response.content().to_string()));

                    let use_tool = if staged.tool_suggestion_due(attempt) {
                        staged.debug_tool_name.as_deref()
                    } else {
                        None
                    };
                    let feedback = build_feedback_message(
                        &attempt_errors,
                        attempt,
                        config.max_attempts,
                        staged.original_user_prompt.as_deref(),
                        use_tool,
                    );
                    working_messages.push(Message::user(feedback));

                    let delay = config.delay_for(attempt);
                    debug!("waiting {delay:?} before retry");
                    tokio::time::sleep(delay).await;
                }

                last_attempt_errors = attempt_errors;
            }
            Err(e) => {
                error!("attempt {} for '{model}' failed: {e}", attempt + 1);

                if let GatewayError::Auth(message) = &e {
                    // Authentication cannot be fixed by retrying; log a
                    // structured diagnostic and surface immediately.
                    error!(
                        model = %model,
                        attempt = attempt + 1,
                        "authentication failure, aborting retries: {message}"
                    );
                    return Err(e);
                }
                if e.is_fatal() {
                    return Err(e);
                }

                if e.counts_toward_breaker() {
                    if let Some(breaker) = &breaker {
                        breaker.lock().await.record_failure();
                    }
                }

                if attempt + 1 >= human_threshold {
                    accumulated_errors.push(ValidationResult::fail(format!(
                        "provider call failed: {e}"
                    )));
                    return Err(GatewayError::HumanReviewNeeded {
                        attempts: attempt + 1,
                        last_response: last_response.map(Box::new),
                        validation_errors: accumulated_errors,
                    });
                }
                if attempt + 1 >= config.max_attempts {
                    return Err(e);
                }

                // Honor a server-provided retry-after hint over our backoff.
                let delay = match &e {
                    GatewayError::RateLimit {
                        retry_after: Some(secs),
                    } => Duration::from_secs(*secs),
                    _ => config.delay_for(attempt),
                };
                warn!("retrying '{model}' in {delay:?}");
                tokio::time::sleep(delay).await;
            }
        }
    }

    // All attempts failed validation.
    if config.max_attempts >= human_threshold {
        return Err(GatewayError::HumanReviewNeeded {
            attempts: config.max_attempts,
            last_response: last_response.map(Box::new),
            validation_errors: accumulated_errors,
        });
    }

    let summary = last_attempt_errors
        .iter()
        .filter_map(|e| e.error.as_deref())
        .collect::<Vec<_>>()
        .join("; ");
    Err(GatewayError::RetryExhausted {
        attempts: config.max_attempts,
        summary,
    })
}
