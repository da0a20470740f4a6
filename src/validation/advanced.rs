//! Structural validators: field presence, length bounds, regex, substring,
//! code syntax, and JSON Schema.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_params, ValidationContext, ValidationResult, Validator};
use crate::errors::GatewayError;
use crate::request::ChatResponse;
use crate::utils::json::extract_json;

// --- field_present ---

#[derive(Deserialize)]
struct FieldPresentParams {
    field_name: String,
    #[serde(default)]
    expected_value: Option<Value>,
    #[serde(default = "default_true")]
    should_exist: bool,
}

fn default_true() -> bool {
    true
}

pub(super) fn field_present(params: &Value) -> Result<Box<dyn Validator>, GatewayError> {
    let p: FieldPresentParams = parse_params("field_present", params)?;
    Ok(Box::new(FieldPresentValidator {
        field_name: p.field_name,
        expected_value: p.expected_value,
        should_exist: p.should_exist,
    }))
}

/// Navigates a dotted path in the parsed JSON content and checks
/// presence/absence and optionally an exact value.
pub struct FieldPresentValidator {
    field_name: String,
    expected_value: Option<Value>,
    should_exist: bool,
}

#[async_trait]
impl Validator for FieldPresentValidator {
    fn name(&self) -> String {
        let existence = if self.should_exist { "present" } else { "absent" };
        format!("field_{existence}_{}", sanitize(&self.field_name))
    }

    async fn validate(
        &self,
        response: &ChatResponse,
        _ctx: &ValidationContext,
    ) -> ValidationResult {
        let Some(data) = extract_json(response.content()) else {
            return ValidationResult::fail("No valid JSON found to check fields")
                .with_suggestions(vec!["Ensure response contains valid JSON".into()]);
        };

        let mut current = &data;
        let mut exists = true;
        for part in self.field_name.split('.') {
            match current.get(part) {
                Some(next) => current = next,
                None => {
                    exists = false;
                    break;
                }
            }
        }

        if self.should_exist && !exists {
            return ValidationResult::fail(format!(
                "Required field '{}' not found",
                self.field_name
            ))
            .with_suggestions(vec![format!(
                "Include field '{}' in response",
                self.field_name
            )]);
        }
        if !self.should_exist && exists {
            return ValidationResult::fail(format!(
                "Field '{}' should not be present",
                self.field_name
            ))
            .with_suggestions(vec![format!(
                "Remove field '{}' from response",
                self.field_name
            )]);
        }
        if self.should_exist && exists {
            if let Some(expected) = &self.expected_value {
                if current != expected {
                    return ValidationResult::fail(format!(
                        "Field '{}' has value {current}, expected {expected}",
                        self.field_name
                    ))
                    .with_suggestions(vec![format!(
                        "Set '{}' to {expected}",
                        self.field_name
                    )]);
                }
            }
        }
        ValidationResult::pass_with_debug(json!({"field": self.field_name, "exists": exists}))
    }
}

// --- length ---

#[derive(Deserialize)]
struct LengthParams {
    #[serde(default)]
    min_length: Option<usize>,
    #[serde(default)]
    max_length: Option<usize>,
}

pub(super) fn length(params: &Value) -> Result<Box<dyn Validator>, GatewayError> {
    let p: LengthParams = parse_params("length", params)?;
    if p.min_length.is_none() && p.max_length.is_none() {
        return Err(GatewayError::Config(
            "length validator requires at least one of min_length or max_length".into(),
        ));
    }
    Ok(Box::new(LengthValidator {
        min_length: p.min_length,
        max_length: p.max_length,
    }))
}

pub struct LengthValidator {
    min_length: Option<usize>,
    max_length: Option<usize>,
}

#[async_trait]
impl Validator for LengthValidator {
    fn name(&self) -> String {
        let mut parts = Vec::new();
        if let Some(min) = self.min_length {
            parts.push(format!("min_{min}"));
        }
        if let Some(max) = self.max_length {
            parts.push(format!("max_{max}"));
        }
        format!("length_{}", parts.join("_"))
    }

    async fn validate(
        &self,
        response: &ChatResponse,
        _ctx: &ValidationContext,
    ) -> ValidationResult {
        let len = response.content().len();
        if let Some(min) = self.min_length {
            if len < min {
                return ValidationResult::fail(format!(
                    "Response too short: {len} characters (minimum: {min})"
                ))
                .with_suggestions(vec![format!(
                    "Response should be at least {min} characters"
                )])
                .with_debug(json!({"actual_length": len, "min_required": min}));
            }
        }
        if let Some(max) = self.max_length {
            if len > max {
                return ValidationResult::fail(format!(
                    "Response too long: {len} characters (maximum: {max})"
                ))
                .with_suggestions(vec![format!("Response should be at most {max} characters")])
                .with_debug(json!({"actual_length": len, "max_allowed": max}));
            }
        }
        ValidationResult::pass_with_debug(json!({"length": len}))
    }
}

// --- regex ---

#[derive(Deserialize)]
struct RegexParams {
    pattern: String,
    /// Flag characters: `i` (case-insensitive), `m` (multi-line), `s`
    /// (dot matches newline).
    #[serde(default)]
    flags: String,
}

pub(super) fn regex(params: &Value) -> Result<Box<dyn Validator>, GatewayError> {
    let p: RegexParams = parse_params("regex", params)?;
    let mut builder = regex::RegexBuilder::new(&p.pattern);
    for flag in p.flags.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            other => {
                return Err(GatewayError::Config(format!(
                    "unknown regex flag '{other}' (expected i, m, or s)"
                )))
            }
        };
    }
    let compiled = builder
        .build()
        .map_err(|e| GatewayError::Config(format!("invalid regex pattern: {e}")))?;
    Ok(Box::new(RegexValidator {
        pattern: p.pattern,
        compiled,
    }))
}

pub struct RegexValidator {
    pattern: String,
    compiled: regex::Regex,
}

#[async_trait]
impl Validator for RegexValidator {
    fn name(&self) -> String {
        let preview: String = self.pattern.chars().take(30).collect();
        format!("regex_{}", sanitize(&preview))
    }

    async fn validate(
        &self,
        response: &ChatResponse,
        _ctx: &ValidationContext,
    ) -> ValidationResult {
        let content = response.content();
        if self.compiled.is_match(content) {
            ValidationResult::pass_with_debug(json!({"pattern": self.pattern}))
        } else {
            let preview: String = content.chars().take(100).collect();
            ValidationResult::fail(format!(
                "Response does not match pattern: {}",
                self.pattern
            ))
            .with_suggestions(vec!["Ensure response matches the required pattern".into()])
            .with_debug(json!({"pattern": self.pattern, "content_preview": preview}))
        }
    }
}

// --- contains ---

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize)]
struct ContainsParams {
    required_text: OneOrMany,
    #[serde(default)]
    case_sensitive: bool,
}

pub(super) fn contains(params: &Value) -> Result<Box<dyn Validator>, GatewayError> {
    let p: ContainsParams = parse_params("contains", params)?;
    let required = match p.required_text {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    };
    if required.is_empty() {
        return Err(GatewayError::Config(
            "contains validator requires at least one required_text entry".into(),
        ));
    }
    Ok(Box::new(ContainsValidator {
        required,
        case_sensitive: p.case_sensitive,
    }))
}

pub struct ContainsValidator {
    required: Vec<String>,
    case_sensitive: bool,
}

#[async_trait]
impl Validator for ContainsValidator {
    fn name(&self) -> String {
        let summary: String = self
            .required
            .iter()
            .take(3)
            .map(|t| t.chars().take(10).collect::<String>())
            .collect::<Vec<_>>()
            .join("_");
        format!("contains_{}", sanitize(&summary))
    }

    async fn validate(
        &self,
        response: &ChatResponse,
        _ctx: &ValidationContext,
    ) -> ValidationResult {
        let content = if self.case_sensitive {
            response.content().to_string()
        } else {
            response.content().to_lowercase()
        };

        let missing: Vec<&String> = self
            .required
            .iter()
            .filter(|text| {
                let needle = if self.case_sensitive {
                    (*text).clone()
                } else {
                    text.to_lowercase()
                };
                !content.contains(&needle)
            })
            .collect();

        if missing.is_empty() {
            ValidationResult::pass()
        } else {
            let list = missing
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            ValidationResult::fail(format!("Response missing required text: [{list}]"))
                .with_suggestions(vec![format!("Response must contain: {list}")])
                .with_debug(json!({"missing": missing}))
        }
    }
}

// --- code ---

#[derive(Deserialize)]
struct CodeParams {
    #[serde(default = "default_language")]
    language: String,
}

fn default_language() -> String {
    "python".into()
}

pub(super) fn code(params: &Value) -> Result<Box<dyn Validator>, GatewayError> {
    let p: CodeParams = parse_params("code", params)?;
    let language = p.language.to_lowercase();
    if !matches!(language.as_str(), "python" | "json") {
        return Err(GatewayError::Config(format!(
            "unsupported code validator language: {language}"
        )));
    }
    Ok(Box::new(CodeValidator { language }))
}

/// Extracts fenced code blocks (or falls back to the whole content) and runs
/// a syntax check per block. `json` blocks get a full parse; `python` blocks
/// get a structural check (delimiter balance, string termination) since no
/// Python parser is available.
pub struct CodeValidator {
    language: String,
}

impl CodeValidator {
    fn extract_blocks(&self, text: &str) -> Vec<String> {
        let pattern = format!(r"```(?:{})?[ \t]*\n([\s\S]*?)```", regex::escape(&self.language));
        let re = regex::Regex::new(&pattern).unwrap_or_else(|_| regex::Regex::new("$^").unwrap());
        re.captures_iter(text)
            .map(|cap| cap[1].to_string())
            .collect()
    }

    fn check_block(&self, code: &str) -> Option<String> {
        match self.language.as_str() {
            "json" => serde_json::from_str::<Value>(code)
                .err()
                .map(|e| format!("invalid JSON: {e}")),
            _ => check_python_structure(code),
        }
    }
}

/// Structural syntax check for Python-like code. Reports the first problem:
/// an unbalanced delimiter, a delimiter mismatch, or an unterminated string.
fn check_python_structure(code: &str) -> Option<String> {
    let mut stack: Vec<(char, usize)> = Vec::new();
    for (line_no, line) in code.lines().enumerate() {
        let mut chars = line.chars().peekable();
        let mut in_string: Option<char> = None;
        while let Some(c) = chars.next() {
            if let Some(quote) = in_string {
                if c == '\\' {
                    chars.next();
                } else if c == quote {
                    in_string = None;
                }
                continue;
            }
            match c {
                '#' => break,
                '\'' | '"' => in_string = Some(c),
                '(' | '[' | '{' => stack.push((c, line_no + 1)),
                ')' | ']' | '}' => {
                    let expected = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match stack.pop() {
                        Some((open, _)) if open == expected => {}
                        Some((open, open_line)) => {
                            return Some(format!(
                                "line {}: closing '{c}' does not match '{open}' opened at line {open_line}",
                                line_no + 1
                            ));
                        }
                        None => {
                            return Some(format!("line {}: unmatched closing '{c}'", line_no + 1));
                        }
                    }
                }
                _ => {}
            }
        }
        if in_string.is_some() && !line.trim_end().ends_with('\\') {
            return Some(format!("line {}: unterminated string literal", line_no + 1));
        }
    }
    stack
        .first()
        .map(|(open, line)| format!("line {line}: unclosed '{open}'"))
}

#[async_trait]
impl Validator for CodeValidator {
    fn name(&self) -> String {
        format!("code_{}", self.language)
    }

    async fn validate(
        &self,
        response: &ChatResponse,
        _ctx: &ValidationContext,
    ) -> ValidationResult {
        let content = response.content();
        let mut blocks = self.extract_blocks(content);
        if blocks.is_empty() {
            blocks.push(content.to_string());
        }

        let mut errors = Vec::new();
        for (i, block) in blocks.iter().enumerate() {
            if let Some(error) = self.check_block(block) {
                errors.push(format!("Block {}: {error}", i + 1));
            }
        }

        if errors.is_empty() {
            ValidationResult::pass_with_debug(json!({"code_blocks": blocks.len()}))
        } else {
            ValidationResult::fail(format!(
                "Invalid {} code: {}",
                self.language,
                errors.join("; ")
            ))
            .with_suggestions(vec![format!("Fix syntax errors in {} code", self.language)])
            .with_debug(json!({"errors": errors}))
        }
    }
}

// --- schema ---

#[derive(Deserialize)]
struct SchemaParams {
    schema: Value,
}

pub(super) fn schema(params: &Value) -> Result<Box<dyn Validator>, GatewayError> {
    let p: SchemaParams = parse_params("schema", params)?;
    let compiled = jsonschema::draft7::new(&p.schema)
        .map_err(|e| GatewayError::Config(format!("invalid JSON schema: {e}")))?;
    Ok(Box::new(SchemaValidator {
        schema: p.schema,
        compiled,
    }))
}

/// Draft 7 JSON Schema validation; reports up to the 3 earliest errors.
pub struct SchemaValidator {
    schema: Value,
    compiled: jsonschema::Validator,
}

#[async_trait]
impl Validator for SchemaValidator {
    fn name(&self) -> String {
        let title = self
            .schema
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("unnamed");
        format!("schema_{}", sanitize(title))
    }

    async fn validate(
        &self,
        response: &ChatResponse,
        _ctx: &ValidationContext,
    ) -> ValidationResult {
        let Some(data) = extract_json(response.content()) else {
            return ValidationResult::fail("No valid JSON found in response")
                .with_suggestions(vec!["Ensure response contains valid JSON".into()]);
        };

        let errors: Vec<String> = self
            .compiled
            .iter_errors(&data)
            .map(|err| {
                let path = err.instance_path().to_string();
                if path.is_empty() {
                    format!("root: {err}")
                } else {
                    format!("{path}: {err}")
                }
            })
            .collect();

        if errors.is_empty() {
            ValidationResult::pass_with_debug(json!({
                "schema_title": self.schema.get("title").and_then(Value::as_str).unwrap_or("unnamed")
            }))
        } else {
            let shown = errors.iter().take(3).cloned().collect::<Vec<_>>();
            ValidationResult::fail(format!("Schema validation failed: {}", shown.join("; ")))
                .with_suggestions(vec!["Ensure response matches the required schema".into()])
                .with_debug(json!({"errors": shown, "error_count": errors.len()}))
        }
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
