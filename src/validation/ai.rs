//! AI-assisted validators: strategies that ask another model to judge the
//! response. These re-enter the orchestrator through the
//! [`RecursiveCaller`](super::RecursiveCaller) handle on the validation
//! context, the only permitted recursion path.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{parse_params, ValidationContext, ValidationResult, Validator};
use crate::errors::GatewayError;
use crate::request::{ChatResponse, Message, RequestConfig, ResponseFormat};

/// Process-wide default tool manifest handed to judge models. Individual
/// validators project this down to the tools they actually need.
pub fn default_tool_manifest() -> Value {
    json!({
        "mcpServers": {
            "perplexity-ask": {
                "command": "npx",
                "args": ["-y", "server-perplexity-ask"],
                "env": {"PERPLEXITY_API_KEY": "${PERPLEXITY_API_KEY}"}
            },
            "desktop-commander": {
                "command": "npx",
                "args": ["-y", "@wonderwhy-er/desktop-commander"],
                "env": {}
            }
        }
    })
}

/// Build a tool manifest containing only the named tools. Returns `None` when
/// no requested tool is known.
pub fn selective_mcp_config(required_tools: &[String]) -> Option<Value> {
    let manifest = default_tool_manifest();
    let all_servers = manifest.get("mcpServers")?.as_object()?;
    let mut selected = serde_json::Map::new();
    for tool in required_tools {
        if let Some(server) = all_servers.get(tool) {
            selected.insert(tool.clone(), server.clone());
        }
    }
    if selected.is_empty() {
        None
    } else {
        Some(json!({ "mcpServers": selected }))
    }
}

/// Issue the recursive judge call, returning the judge's parsed JSON verdict
/// or a failure `ValidationResult` describing what went wrong.
async fn call_judge(
    validator_name: &str,
    ctx: &ValidationContext,
    request: RequestConfig,
) -> Result<Value, ValidationResult> {
    let Some(caller) = &ctx.recursive else {
        return Err(ValidationResult::fail(format!(
            "{validator_name}: no recursive caller available for AI-assisted validation"
        )));
    };

    let response = match caller.call(request).await {
        Ok(r) => r,
        Err(GatewayError::RecursionLimit { depth, max }) => {
            return Err(ValidationResult::fail(format!(
                "{validator_name}: recursion depth {depth} exceeds maximum {max}"
            )));
        }
        Err(e) => {
            warn!("{validator_name}: judge call failed: {e}");
            return Err(ValidationResult::fail(format!(
                "{validator_name}: no response from validation agent: {e}"
            )));
        }
    };

    let content = response.content();
    if content.trim().is_empty() {
        return Err(ValidationResult::fail(format!(
            "{validator_name}: agent returned empty content"
        )));
    }
    debug!("{validator_name}: agent verdict: {content}");
    serde_json::from_str(content).map_err(|e| {
        let preview: String = content.chars().take(300).collect();
        ValidationResult::fail(format!(
            "{validator_name}: could not parse JSON verdict: {e}"
        ))
        .with_debug(json!({"raw_response": preview}))
    })
}

fn default_validation_model() -> String {
    "cli/claude-3-opus".into()
}

// --- ai_contradiction_check ---

#[derive(Deserialize)]
struct ContradictionParams {
    text_to_check: String,
    topic_context: String,
    #[serde(default = "default_validation_model")]
    validation_model: String,
    #[serde(default = "default_contradiction_tools")]
    required_mcp_tools: Vec<String>,
}

fn default_contradiction_tools() -> Vec<String> {
    vec!["perplexity-ask".into()]
}

pub(super) fn contradiction_check(params: &Value) -> Result<Box<dyn Validator>, GatewayError> {
    let p: ContradictionParams = parse_params("ai_contradiction_check", params)?;
    Ok(Box::new(ContradictionCheckValidator {
        text_to_check: p.text_to_check,
        topic_context: p.topic_context,
        validation_model: p.validation_model,
        required_mcp_tools: p.required_mcp_tools,
    }))
}

/// Asks a judge model to research a topic with a named tool and report
/// contradictions in the supplied text as a structured JSON verdict.
pub struct ContradictionCheckValidator {
    text_to_check: String,
    topic_context: String,
    validation_model: String,
    required_mcp_tools: Vec<String>,
}

const MAX_CHECKED_TEXT: usize = 150_000;

impl ContradictionCheckValidator {
    fn judge_prompt(&self) -> String {
        let mut text = self.text_to_check.as_str();
        if text.len() > MAX_CHECKED_TEXT {
            let mut end = MAX_CHECKED_TEXT;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text = &text[..end];
        }
        let tool = self
            .required_mcp_tools
            .first()
            .map(String::as_str)
            .unwrap_or("perplexity-ask");
        format!(
            "Please analyze the following text, which is related to '{topic}', for any \
             internal contradictions, logical fallacies, or statements that significantly \
             conflict with well-established scientific consensus or factual knowledge.\n\n\
             You MUST use your '{tool}' tool to research '{topic}', focusing on common \
             misconceptions, key facts, and any known internal inconsistencies within \
             theories related to this topic.\n\n\
             Text to Analyze:\n```text\n{text}\n```\n\n\
             After your analysis and tool use, respond ONLY with a JSON object with the \
             following structure:\n\
             {{\n  \"contradictions_found\": <boolean>,\n  \"certainty\": <float_from_0.0_to_1.0>,\n  \
             \"summary\": \"<string_explanation>\"\n}}\n\
             If no contradictions are found, set 'contradictions_found' to false and explain why.",
            topic = self.topic_context,
        )
    }
}

#[async_trait]
impl Validator for ContradictionCheckValidator {
    fn name(&self) -> String {
        let topic: String = self
            .topic_context
            .chars()
            .take(30)
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("ai_contradiction_check_on_{topic}")
    }

    async fn validate(
        &self,
        _response: &ChatResponse,
        ctx: &ValidationContext,
    ) -> ValidationResult {
        if self.text_to_check.trim().is_empty() {
            debug!("{}: no text provided, skipping", self.name());
            return ValidationResult::pass_with_debug(json!({"reason": "no text to check"}));
        }

        let mut request = RequestConfig::new(
            self.validation_model.clone(),
            vec![
                Message::system(
                    "You are a highly analytical validation assistant specializing in \
                     identifying contradictions and factual inconsistencies using research tools.",
                ),
                Message::user(self.judge_prompt()),
            ],
        );
        request.response_format = Some(ResponseFormat::json_object());
        request.temperature = Some(0.0);
        request.max_tokens = Some(1000);
        request.mcp_config = selective_mcp_config(&self.required_mcp_tools);

        let report = match call_judge(&self.name(), ctx, request).await {
            Ok(v) => v,
            Err(failure) => return failure,
        };

        let contradictions_found = report
            .get("contradictions_found")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let certainty = report
            .get("certainty")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let summary = report
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or("No explanation provided");

        if contradictions_found {
            warn!(
                "{}: contradictions found (certainty {certainty:.2})",
                self.name()
            );
            ValidationResult::fail(format!("AI found contradictions: {summary}"))
                .with_suggestions(vec![
                    "Review the contradictions identified by the AI validator".into(),
                ])
                .with_debug(json!({"agent_report": report}))
        } else {
            ValidationResult::pass_with_debug(json!({"agent_report": report}))
        }
    }
}

// --- agent_task ---

#[derive(Deserialize)]
struct AgentTaskParams {
    task_prompt: String,
    #[serde(default = "default_validation_model")]
    validation_model: String,
    #[serde(default)]
    mcp_config: Option<Value>,
    #[serde(default)]
    required_mcp_tools: Vec<String>,
    /// Optional extra success rule; currently `all_true_in_details_keys`
    /// requires every value in the verdict's `details` map to be truthy.
    #[serde(default)]
    success_criteria: Option<String>,
}

pub(super) fn agent_task(params: &Value) -> Result<Box<dyn Validator>, GatewayError> {
    let p: AgentTaskParams = parse_params("agent_task", params)?;
    if let Some(criteria) = &p.success_criteria {
        if criteria != "all_true_in_details_keys" {
            return Err(GatewayError::Config(format!(
                "unknown agent_task success_criteria: {criteria}"
            )));
        }
    }
    Ok(Box::new(AgentTaskValidator {
        task_prompt: p.task_prompt,
        validation_model: p.validation_model,
        mcp_config: p.mcp_config,
        required_mcp_tools: p.required_mcp_tools,
        success_criteria: p.success_criteria,
    }))
}

/// Generic LLM-as-judge: sends a templated task prompt to a configured model
/// and expects `{"validation_passed": bool, "explanation": str, "details": {}}`.
pub struct AgentTaskValidator {
    task_prompt: String,
    validation_model: String,
    mcp_config: Option<Value>,
    required_mcp_tools: Vec<String>,
    success_criteria: Option<String>,
}

#[async_trait]
impl Validator for AgentTaskValidator {
    fn name(&self) -> String {
        let words: String = self
            .task_prompt
            .split_whitespace()
            .take(5)
            .filter(|w| w.chars().all(char::is_alphanumeric))
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join("_");
        format!("agent_task_{words}")
    }

    async fn validate(&self, response: &ChatResponse, ctx: &ValidationContext) -> ValidationResult {
        let full_prompt = format!(
            "{}\n\nResponse to validate:\n```\n{}\n```\n\n\
             Respond with a JSON object containing:\n\
             {{\"validation_passed\": <boolean>, \"explanation\": \"<string>\", \"details\": {{}}}}",
            self.task_prompt,
            response.content()
        );

        let mut request = RequestConfig::new(
            self.validation_model.clone(),
            vec![
                Message::system(
                    "You are a validation agent. Execute the given task and report results \
                     in JSON format.",
                ),
                Message::user(full_prompt),
            ],
        );
        request.response_format = Some(ResponseFormat::json_object());
        request.temperature = Some(0.0);
        request.max_tokens = Some(1000);
        request.mcp_config = self
            .mcp_config
            .clone()
            .or_else(|| selective_mcp_config(&self.required_mcp_tools));

        let verdict = match call_judge(&self.name(), ctx, request).await {
            Ok(v) => v,
            Err(failure) => return failure,
        };

        let mut passed = verdict
            .get("validation_passed")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let explanation = verdict
            .get("explanation")
            .and_then(Value::as_str)
            .unwrap_or("No explanation provided")
            .to_string();

        if passed && self.success_criteria.as_deref() == Some("all_true_in_details_keys") {
            let details_ok = verdict
                .get("details")
                .and_then(Value::as_object)
                .is_some_and(|details| {
                    details
                        .values()
                        .all(|v| v.as_bool().unwrap_or(!v.is_null()))
                });
            if !details_ok {
                passed = false;
            }
        }

        if passed {
            ValidationResult::pass_with_debug(json!({"agent_result": verdict}))
        } else {
            ValidationResult::fail(format!("Agent validation failed: {explanation}"))
                .with_debug(json!({"agent_result": verdict}))
        }
    }
}
