use super::*;
use crate::request::{ContentPart, ImageUrl, Message, MessageContent, ResponseFormat};
use serde_json::json;

fn gateway() -> GatewayConfig {
    GatewayConfig::default()
}

fn request(model: &str) -> RequestConfig {
    RequestConfig::new(model, vec![Message::user("test")])
}

#[test]
fn missing_model_is_config_error() {
    let err = resolve_route(&request(""), &gateway()).unwrap_err();
    assert!(matches!(err, GatewayError::Config(_)));
    assert!(err.to_string().contains("model"));
}

#[test]
fn missing_model_falls_back_to_configured_default() {
    let mut gw = gateway();
    gw.llm.default_model = Some("gpt-4o-mini".into());
    let route = resolve_route(&request(""), &gw).unwrap();
    assert_eq!(route.params.model, "gpt-4o-mini");
}

#[test]
fn cli_prefix_routes_to_proxy() {
    let mut req = request("cli/opus");
    req.temperature = Some(0.5);
    req.mcp_config = Some(json!({"mcpServers": {}}));

    let route = resolve_route(&req, &gateway()).unwrap();
    match route.target {
        RouteTarget::CliProxy { base_url } => {
            assert_eq!(base_url, "http://127.0.0.1:3010/v1");
        }
        other => panic!("expected CliProxy, got {other:?}"),
    }
    assert_eq!(route.params.model, "cli/opus");
    assert_eq!(route.params.temperature, Some(0.5));
    assert!(route.params.mcp_config.is_some());
}

#[test]
fn legacy_max_prefix_also_routes_to_proxy() {
    let route = resolve_route(&request("max/claude-3-opus"), &gateway()).unwrap();
    assert!(matches!(route.target, RouteTarget::CliProxy { .. }));
}

#[test]
fn cli_route_rejects_image_parts() {
    let mut req = request("cli/opus");
    req.messages = vec![Message::user(MessageContent::Parts(vec![
        ContentPart::Text {
            text: "what is this".into(),
        },
        ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: "photo.png".into(),
                detail: None,
            },
        },
    ]))];
    let err = resolve_route(&req, &gateway()).unwrap_err();
    assert!(err.to_string().contains("image"));
}

#[test]
fn runpod_with_pod_id_rewrites_everything() {
    let route = resolve_route(&request("runpod/abc123xyz/llama-3-70b"), &gateway()).unwrap();
    assert_eq!(route.params.model, "openai/llama-3-70b");
    match route.target {
        RouteTarget::HttpChat { base_url, api_key } => {
            assert_eq!(base_url, "https://abc123xyz-8000.proxy.runpod.net/v1");
            assert_eq!(api_key.as_deref(), Some("EMPTY"));
        }
        other => panic!("expected HttpChat, got {other:?}"),
    }
}

#[test]
fn runpod_without_pod_id_requires_base_url() {
    let err = resolve_route(&request("runpod/llama-3-70b"), &gateway()).unwrap_err();
    assert!(matches!(err, GatewayError::Config(_)));
    assert!(err.to_string().contains("Runpod"));

    let mut req = request("runpod/llama-3-70b");
    req.base_url = Some("https://custom-8000.proxy.runpod.net/v1".into());
    let route = resolve_route(&req, &gateway()).unwrap();
    assert_eq!(route.params.model, "openai/llama-3-70b");
    match route.target {
        RouteTarget::HttpChat { base_url, api_key } => {
            assert_eq!(base_url, "https://custom-8000.proxy.runpod.net/v1");
            assert_eq!(api_key.as_deref(), Some("EMPTY"));
        }
        other => panic!("expected HttpChat, got {other:?}"),
    }
}

#[test]
fn vertex_route_injects_project_and_location() {
    let mut gw = gateway();
    gw.providers.vertex_project = Some("test-project".into());
    gw.providers.vertex_location = Some("us-central1".into());

    let route = resolve_route(&request("vertex_ai/gemini-pro"), &gw).unwrap();
    assert_eq!(route.params.vertex_project.as_deref(), Some("test-project"));
    assert_eq!(route.params.vertex_location.as_deref(), Some("us-central1"));
}

#[test]
fn vertex_request_values_win_over_config() {
    let mut gw = gateway();
    gw.providers.vertex_project = Some("config-project".into());

    let mut req = request("vertex_ai/gemini-pro");
    req.vertex_project = Some("request-project".into());
    let route = resolve_route(&req, &gw).unwrap();
    assert_eq!(
        route.params.vertex_project.as_deref(),
        Some("request-project")
    );
}

#[test]
fn bare_gpt_model_uses_openai_endpoint() {
    let mut gw = gateway();
    gw.providers.openai_api_key = Some("sk-test".into());

    let route = resolve_route(&request("gpt-3.5-turbo"), &gw).unwrap();
    match route.target {
        RouteTarget::HttpChat { base_url, api_key } => {
            assert_eq!(base_url, "https://api.openai.com/v1");
            assert_eq!(api_key.as_deref(), Some("sk-test"));
        }
        other => panic!("expected HttpChat, got {other:?}"),
    }
}

#[test]
fn claude_model_uses_anthropic_endpoint() {
    let mut gw = gateway();
    gw.providers.anthropic_api_key = Some("sk-ant".into());

    let route = resolve_route(&request("claude-3-opus"), &gw).unwrap();
    match route.target {
        RouteTarget::HttpChat { base_url, api_key } => {
            assert!(base_url.contains("anthropic"));
            assert_eq!(api_key.as_deref(), Some("sk-ant"));
        }
        other => panic!("expected HttpChat, got {other:?}"),
    }
}

#[test]
fn caller_base_url_and_key_override_defaults() {
    let mut req = request("gpt-4");
    req.base_url = Some("http://localhost:8000/v1".into());
    req.api_key = Some("local-key".into());

    let route = resolve_route(&req, &gateway()).unwrap();
    match route.target {
        RouteTarget::HttpChat { base_url, api_key } => {
            assert_eq!(base_url, "http://localhost:8000/v1");
            assert_eq!(api_key.as_deref(), Some("local-key"));
        }
        other => panic!("expected HttpChat, got {other:?}"),
    }
}

#[test]
fn defaults_fill_unset_params() {
    let route = resolve_route(&request("gpt-4"), &gateway()).unwrap();
    assert_eq!(route.params.temperature, Some(0.7));
    assert_eq!(route.params.max_tokens, Some(4096));
    assert_eq!(
        route.params.timeout,
        Some(std::time::Duration::from_secs(120))
    );
    assert!(!route.params.stream);
}

#[test]
fn response_format_and_timeout_pass_through() {
    let mut req = request("gpt-4");
    req.response_format = Some(ResponseFormat::json_object());
    req.timeout_secs = Some(7.5);

    let route = resolve_route(&req, &gateway()).unwrap();
    assert!(route.params.response_format.unwrap().is_json_object());
    assert_eq!(
        route.params.timeout,
        Some(std::time::Duration::from_secs_f64(7.5))
    );
}
