//! The two default validators: non-empty content and JSON well-formedness.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{parse_params, ValidationContext, ValidationResult, Validator};
use crate::errors::GatewayError;
use crate::request::ChatResponse;

pub(super) fn response_not_empty(
    params: &Value,
) -> Result<Box<dyn Validator>, GatewayError> {
    let _: EmptyParams = parse_params("response_not_empty", params)?;
    Ok(Box::new(ResponseNotEmptyValidator))
}

pub(super) fn json_string(params: &Value) -> Result<Box<dyn Validator>, GatewayError> {
    let _: EmptyParams = parse_params("json_string", params)?;
    Ok(Box::new(JsonStringValidator))
}

#[derive(serde::Deserialize)]
struct EmptyParams {}

/// Fails when the response has no choices or only whitespace content.
pub struct ResponseNotEmptyValidator;

#[async_trait]
impl Validator for ResponseNotEmptyValidator {
    fn name(&self) -> String {
        "response_not_empty".into()
    }

    async fn validate(
        &self,
        response: &ChatResponse,
        _ctx: &ValidationContext,
    ) -> ValidationResult {
        if response.choices.is_empty() {
            return ValidationResult::fail("No choices in response")
                .with_debug(json!({"id": response.id}));
        }
        let content = response.content();
        if content.trim().is_empty() {
            return ValidationResult::fail("Response content is empty").with_suggestions(vec![
                "Try rephrasing the prompt".into(),
                "Check model availability".into(),
            ]);
        }
        ValidationResult::pass_with_debug(json!({"content_length": content.len()}))
    }
}

/// Fails unless the content parses as JSON; reports the parse position.
pub struct JsonStringValidator;

#[async_trait]
impl Validator for JsonStringValidator {
    fn name(&self) -> String {
        "json_string".into()
    }

    async fn validate(
        &self,
        response: &ChatResponse,
        _ctx: &ValidationContext,
    ) -> ValidationResult {
        let content = response.content();
        if content.is_empty() {
            return ValidationResult::fail("Empty content cannot be valid JSON");
        }
        match serde_json::from_str::<Value>(content) {
            Ok(data) => {
                let keys = data
                    .as_object()
                    .map(|obj| obj.keys().cloned().collect::<Vec<_>>());
                ValidationResult::pass_with_debug(json!({
                    "json_type": json_type_name(&data),
                    "json_keys": keys,
                }))
            }
            Err(e) => ValidationResult::fail(format!("Invalid JSON: {e}"))
                .with_suggestions(vec![
                    "Ensure prompt requests JSON format".into(),
                    "Try adding 'You must respond with valid JSON' to prompt".into(),
                    "Check for trailing commas or unquoted strings".into(),
                ])
                .with_debug(json!({
                    "error_line": e.line(),
                    "error_column": e.column(),
                })),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(content: &str) -> ChatResponse {
        ChatResponse::from_text("test-model", content)
    }

    #[tokio::test]
    async fn accepts_non_empty_content() {
        let result = ResponseNotEmptyValidator
            .validate(&response("Hello, world!"), &ValidationContext::detached())
            .await;
        assert!(result.valid);
    }

    #[tokio::test]
    async fn rejects_whitespace_content() {
        let result = ResponseNotEmptyValidator
            .validate(&response("   \n\t"), &ValidationContext::detached())
            .await;
        assert!(!result.valid);
        assert!(result.error.unwrap().contains("empty"));
        assert!(!result.suggestions.is_empty());
    }

    #[tokio::test]
    async fn rejects_missing_choices() {
        let mut resp = response("x");
        resp.choices.clear();
        let result = ResponseNotEmptyValidator
            .validate(&resp, &ValidationContext::detached())
            .await;
        assert!(!result.valid);
        assert!(result.error.unwrap().contains("choices"));
    }

    #[tokio::test]
    async fn json_validator_accepts_object() {
        let result = JsonStringValidator
            .validate(
                &response(r#"{"key": "value", "number": 42}"#),
                &ValidationContext::detached(),
            )
            .await;
        assert!(result.valid);
        let debug = result.debug.unwrap();
        assert_eq!(debug["json_type"], "object");
        assert_eq!(debug["json_keys"][0], "key");
    }

    #[tokio::test]
    async fn json_validator_reports_position() {
        let result = JsonStringValidator
            .validate(&response("not json at all"), &ValidationContext::detached())
            .await;
        assert!(!result.valid);
        assert!(result.error.unwrap().starts_with("Invalid JSON"));
        assert!(result.debug.unwrap()["error_line"].is_number());
        assert!(!result.suggestions.is_empty());
    }
}
