use modelgate::config::GatewayConfig;
use modelgate::conversations::ConversationStore;
use modelgate::orchestrator::Orchestrator;
use modelgate::request::{Message, RequestConfig};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn conversation_replay_threads_multiple_models() {
    let dir = TempDir::new().unwrap();
    let store = ConversationStore::open(&dir.path().join("conversations.db")).unwrap();

    let conv = store
        .create("doc-analysis", Some(json!({"purpose": "large doc"})))
        .unwrap();
    store
        .append(&conv, "user", "Analyze this document", Some("user"), None)
        .unwrap();
    store
        .append(
            &conv,
            "assistant",
            "Delegating the heavy lifting.",
            Some("claude-3-opus"),
            None,
        )
        .unwrap();

    // A second model answers with the replayed history as context.
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-9",
            "object": "chat.completion",
            "created": 1_700_000_000,
            "model": "gemini-1.5-pro",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Key findings: entanglement."},
                "finish_reason": "stop"
            }]
        })))
        .mount(&server)
        .await;

    let history: Vec<Message> = store
        .for_llm(&conv, None)
        .unwrap()
        .into_iter()
        .map(|m| Message {
            role: m.role,
            content: m.content.into(),
        })
        .collect();
    assert_eq!(history.len(), 2);

    let mut request = RequestConfig::new("gemini-1.5-pro", history);
    request.base_url = Some(format!("{}/v1", server.uri()));
    let response = Orchestrator::new(GatewayConfig::default())
        .make_request(request)
        .await
        .unwrap();

    store
        .append(
            &conv,
            "assistant",
            response.content(),
            Some("gemini-1.5-pro"),
            Some(json!({"latency_ms": 42})),
        )
        .unwrap();

    // The replayed history reached the wire in order.
    let received = server.received_requests().await.unwrap();
    let sent: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(sent["messages"][0]["content"], "Analyze this document");
    assert_eq!(sent["messages"][1]["content"], "Delegating the heavy lifting.");

    // The thread now spans two assistant models in append order.
    let messages = store.get(&conv, None).unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1].model.as_deref(), Some("claude-3-opus"));
    assert_eq!(messages[2].model.as_deref(), Some("gemini-1.5-pro"));
    assert_eq!(messages[2].content, "Key findings: entanglement.");
    assert_eq!(messages[2].metadata["latency_ms"], 42);

    // Discovery by participating model.
    let found = store.search(None, Some("gemini-1.5-pro"), None).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, conv);
}
