use super::*;
use crate::providers::base::CompletionParams;
use crate::request::{Message, ResponseFormat};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(server: &MockServer, api_key: Option<&str>) -> HttpChatProvider {
    HttpChatProvider::new(
        format!("{}/v1", server.uri()),
        api_key.map(String::from),
        Duration::from_secs(5),
    )
}

fn request(model: &str, content: &str) -> CompletionRequest {
    CompletionRequest {
        messages: vec![Message::user(content)],
        params: CompletionParams {
            model: model.into(),
            temperature: Some(0.7),
            max_tokens: Some(100),
            ..Default::default()
        },
    }
}

fn ok_body(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-abc",
        "object": "chat.completion",
        "created": 1_700_000_000,
        "model": "gpt-3.5-turbo",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12}
    })
}

#[tokio::test]
async fn complete_success_with_bearer_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("Authorization", "Bearer test_key"))
        .and(body_partial_json(json!({"model": "gpt-3.5-turbo"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("OK")))
        .mount(&server)
        .await;

    let result = provider(&server, Some("test_key"))
        .complete(request("gpt-3.5-turbo", "Reply OK"))
        .await
        .unwrap();
    assert_eq!(result.content(), "OK");
    assert_eq!(result.usage.unwrap().total_tokens, 12);
}

#[tokio::test]
async fn no_auth_header_without_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("hi")))
        .mount(&server)
        .await;

    // Would 404 if the path were wrong; the mock has no auth matcher so this
    // verifies the request shape is accepted without a key.
    let result = provider(&server, None)
        .complete(request("local-model", "hello"))
        .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn json_mode_and_params_reach_the_wire() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({
            "response_format": {"type": "json_object"},
            "temperature": 0.0,
            "max_tokens": 50
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("{}")))
        .mount(&server)
        .await;

    let mut req = request("gpt-4", "json please");
    req.params.temperature = Some(0.0);
    req.params.max_tokens = Some(50);
    req.params.response_format = Some(ResponseFormat::json_object());

    assert!(provider(&server, None).complete(req).await.is_ok());
}

#[tokio::test]
async fn status_401_maps_to_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"type": "invalid_request_error", "message": "Incorrect API key"}
        })))
        .mount(&server)
        .await;

    let err = provider(&server, Some("bad"))
        .complete(request("gpt-4", "hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Auth(_)));
    assert!(err.to_string().contains("Incorrect API key"));
}

#[tokio::test]
async fn status_429_maps_to_rate_limit_with_hint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "7")
                .set_body_string("slow down"),
        )
        .mount(&server)
        .await;

    let err = provider(&server, None)
        .complete(request("gpt-4", "hi"))
        .await
        .unwrap_err();
    match err {
        GatewayError::RateLimit { retry_after } => assert_eq!(retry_after, Some(7)),
        other => panic!("expected RateLimit, got {other:?}"),
    }
}

#[tokio::test]
async fn status_500_maps_to_transport() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&server)
        .await;

    let err = provider(&server, None)
        .complete(request("gpt-4", "hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Transport(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn status_404_is_non_retryable_provider_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {"type": "not_found_error", "message": "model: gpt-99"}
        })))
        .mount(&server)
        .await;

    let err = provider(&server, None)
        .complete(request("gpt-99", "hi"))
        .await
        .unwrap_err();
    match err {
        GatewayError::Provider { retryable, message } => {
            assert!(!retryable);
            assert!(message.contains("not_found_error"));
        }
        other => panic!("expected Provider, got {other:?}"),
    }
}

#[tokio::test]
async fn streaming_reassembles_delta_chunks() {
    let server = MockServer::start().await;
    let sse_body = concat!(
        "data: {\"id\":\"chatcmpl-s1\",\"model\":\"gpt-4\",\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo \"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"world\"},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_body.as_bytes(), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let mut req = request("gpt-4", "stream it");
    req.params.stream = true;
    let result = provider(&server, None).complete(req).await.unwrap();
    assert_eq!(result.content(), "Hello world");
    assert_eq!(result.id, "chatcmpl-s1");
    assert_eq!(result.choices[0].finish_reason.as_deref(), Some("stop"));
}

#[tokio::test]
async fn connection_refused_is_transport() {
    // Port 1 is essentially never listening.
    let provider = HttpChatProvider::new(
        "http://127.0.0.1:1/v1".into(),
        None,
        Duration::from_secs(2),
    );
    let err = provider
        .complete(request("gpt-4", "hi"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::Transport(_) | GatewayError::Timeout(_)
    ));
}
