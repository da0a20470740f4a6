//! Request routing: maps a model name to a provider target and normalizes
//! per-call parameters. Orchestration-only keys (validation, retry, image
//! settings) are dropped here and never reach an adapter.

use std::time::Duration;
use tracing::{debug, info};

use crate::config::GatewayConfig;
use crate::errors::GatewayError;
use crate::providers::CompletionParams;
use crate::request::RequestConfig;

/// Which adapter family serves this request, plus how to construct it.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteTarget {
    CliProxy {
        base_url: String,
    },
    HttpChat {
        base_url: String,
        api_key: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub target: RouteTarget,
    pub params: CompletionParams,
}

/// Whether this model name routes to the CLI proxy (`cli/`, or the legacy
/// `max/` spelling).
pub fn is_cli_route(model: &str) -> bool {
    let lower = model.to_lowercase();
    lower.starts_with("cli/") || lower.starts_with("max/")
}

pub fn resolve_route(
    request: &RequestConfig,
    gateway: &GatewayConfig,
) -> Result<ResolvedRoute, GatewayError> {
    let model = if request.model.is_empty() {
        gateway
            .llm
            .default_model
            .clone()
            .ok_or_else(|| GatewayError::Config("'model' field is required".into()))?
    } else {
        request.model.clone()
    };
    let lower = model.to_lowercase();
    debug!("resolving route for model: {model}");

    let mut params = CompletionParams {
        model: model.clone(),
        temperature: Some(
            request
                .temperature
                .unwrap_or(gateway.llm.default_temperature),
        ),
        max_tokens: Some(request.max_tokens.unwrap_or(gateway.llm.default_max_tokens)),
        response_format: request.response_format.clone(),
        stream: request.stream.unwrap_or(false),
        timeout: Some(Duration::from_secs_f64(
            request
                .timeout_secs
                .unwrap_or(gateway.llm.default_timeout_secs),
        )),
        ..Default::default()
    };

    if is_cli_route(&model) {
        info!("route: CLI proxy for model '{model}'");
        if request.is_multimodal() {
            return Err(GatewayError::Config(format!(
                "model '{model}' is served by the local CLI and does not accept image inputs"
            )));
        }
        params.mcp_config = request.mcp_config.clone();
        params.polling = request.polling.unwrap_or(false);
        return Ok(ResolvedRoute {
            target: RouteTarget::CliProxy {
                base_url: gateway.proxy.base_url(),
            },
            params,
        });
    }

    if lower.starts_with("runpod/") {
        return resolve_runpod(&model, request, params);
    }

    if lower.starts_with("vertex_ai/") {
        params.vertex_project = request
            .vertex_project
            .clone()
            .or_else(|| gateway.providers.vertex_project.clone());
        params.vertex_location = request
            .vertex_location
            .clone()
            .or_else(|| gateway.providers.vertex_location.clone());
        let base_url = request
            .base_url
            .clone()
            .unwrap_or_else(|| gateway.llm.default_base_url.clone());
        info!("route: HTTP (vertex) for model '{model}'");
        return Ok(ResolvedRoute {
            target: RouteTarget::HttpChat {
                base_url,
                api_key: request.api_key.clone(),
            },
            params,
        });
    }

    // Everything else: an OpenAI-compatible endpoint picked by model prefix.
    let (default_base, api_key) = default_endpoint(&lower, gateway);
    let base_url = request.base_url.clone().unwrap_or(default_base);
    let api_key = request.api_key.clone().or(api_key);
    info!("route: HTTP for model '{model}' via {base_url}");
    Ok(ResolvedRoute {
        target: RouteTarget::HttpChat { base_url, api_key },
        params,
    })
}

/// Runpod endpoints are OpenAI-compatible vLLM pods.
/// `runpod/{pod_id}/{model}` derives the pod URL; `runpod/{model}` requires a
/// caller-provided `base_url`. Pods demand some API key, any value works.
fn resolve_runpod(
    model: &str,
    request: &RequestConfig,
    mut params: CompletionParams,
) -> Result<ResolvedRoute, GatewayError> {
    let parts: Vec<&str> = model.splitn(3, '/').collect();
    let (pod_id, actual_model) = match parts.as_slice() {
        [_, pod_id, actual] => (Some(*pod_id), *actual),
        [_, actual] => (None, *actual),
        _ => {
            return Err(GatewayError::Config(format!(
                "malformed runpod model name: '{model}'"
            )))
        }
    };

    params.model = format!("openai/{actual_model}");

    let base_url = match (pod_id, &request.base_url) {
        (_, Some(explicit)) => explicit.clone(),
        (Some(pod_id), None) => format!("https://{pod_id}-8000.proxy.runpod.net/v1"),
        (None, None) => {
            return Err(GatewayError::Config(
                "Runpod model requires either pod_id in model name (runpod/{pod_id}/{model}) \
                 or base_url parameter"
                    .into(),
            ))
        }
    };

    let api_key = request.api_key.clone().unwrap_or_else(|| "EMPTY".into());
    info!("route: HTTP (runpod) for model '{actual_model}' via {base_url}");
    Ok(ResolvedRoute {
        target: RouteTarget::HttpChat {
            base_url,
            api_key: Some(api_key),
        },
        params,
    })
}

/// Default base URL + credential for bare model names, by prefix.
fn default_endpoint(lower_model: &str, gateway: &GatewayConfig) -> (String, Option<String>) {
    if lower_model.starts_with("claude") || lower_model.starts_with("anthropic/") {
        (
            "https://api.anthropic.com/v1".to_string(),
            gateway.providers.anthropic_api_key.clone(),
        )
    } else if lower_model.starts_with("gpt")
        || lower_model.starts_with("o1")
        || lower_model.starts_with("o3")
        || lower_model.starts_with("openai/")
    {
        (
            "https://api.openai.com/v1".to_string(),
            gateway.providers.openai_api_key.clone(),
        )
    } else {
        (
            gateway.llm.default_base_url.clone(),
            gateway.providers.openai_api_key.clone(),
        )
    }
}

#[cfg(test)]
mod tests;
