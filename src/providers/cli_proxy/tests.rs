use super::*;
use crate::providers::base::CompletionParams;
use crate::request::Message;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(server: &MockServer) -> CliProxyProvider {
    CliProxyProvider::new(format!("{}/v1", server.uri()), Duration::from_secs(5))
}

fn request(polling: bool, mcp: Option<Value>) -> CompletionRequest {
    CompletionRequest {
        messages: vec![Message::user("short prompt")],
        params: CompletionParams {
            model: "cli/opus".into(),
            mcp_config: mcp,
            polling,
            ..Default::default()
        },
    }
}

#[tokio::test]
async fn sync_completion_round_trips() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cli-1234",
            "object": "chat.completion",
            "created": 1_700_000_000,
            "model": "cli/opus",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "done"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0}
        })))
        .mount(&server)
        .await;

    let result = provider(&server).complete(request(false, None)).await.unwrap();
    assert_eq!(result.content(), "done");
}

#[tokio::test]
async fn mcp_config_forwarded_verbatim() {
    let server = MockServer::start().await;
    let manifest = json!({"mcpServers": {"perplexity-ask": {"command": "npx"}}});
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"mcp_config": manifest.clone()})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cli-1",
            "choices": [{"message": {"role": "assistant", "content": "ok"}}]
        })))
        .mount(&server)
        .await;

    let result = provider(&server)
        .complete(request(false, Some(manifest)))
        .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn polling_submission_surfaces_task_document() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"polling_mode": true})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "task_id": "9f0c6b3a-0000-4000-8000-000000000001",
            "status": "pending",
            "polling_url": "/v1/polling/status/9f0c6b3a-0000-4000-8000-000000000001"
        })))
        .mount(&server)
        .await;

    let result = provider(&server).complete(request(true, None)).await.unwrap();
    let doc: Value = serde_json::from_str(result.content()).unwrap();
    assert_eq!(doc["status"], "pending");
    assert!(doc["task_id"].as_str().unwrap().len() == 36);
}

#[tokio::test]
async fn proxy_error_status_maps_to_taxonomy() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("executor crashed"))
        .mount(&server)
        .await;

    let err = provider(&server).complete(request(false, None)).await.unwrap_err();
    assert!(matches!(err, GatewayError::Transport(_)));
}
