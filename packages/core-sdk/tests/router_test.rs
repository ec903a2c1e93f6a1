//! Request router tests against a mock OpenAI-compatible server.

use std::sync::Arc;
use std::time::Duration;

use openwork_core_sdk::llm::{self, RequestRouter};
use openwork_core_sdk::prelude::*;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

struct Fixture {
    _dir: tempfile::TempDir,
    store: Arc<MemoryStore>,
    generator: ConfigGenerator,
    router: RequestRouter,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let generator = ConfigGenerator::new(dir.path().join("opencode").join("opencode.json"));
    let store = Arc::new(MemoryStore::new());
    let router = RequestRouter::new(generator.clone(), store.clone(), Duration::from_secs(5))
        .expect("router");
    Fixture {
        _dir: dir,
        store,
        generator,
        router,
    }
}

fn connect(fx: &Fixture, base_url: &str, key: Option<&str>) {
    let submitted = SettingsForm::new("local-vllm", base_url, key.map(str::to_string), "llama-3-8b");
    form::connect(&submitted, fx.store.as_ref(), &fx.generator).expect("connect");
}

fn completion_body(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": "llama-3-8b",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }]
    })
}

fn sse_body(pieces: &[&str]) -> String {
    let mut body = String::new();
    body.push_str(
        "data: {\"model\":\"llama-3-8b\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\n\n",
    );
    for piece in pieces {
        let chunk = json!({
            "model": "llama-3-8b",
            "choices": [{"index": 0, "delta": {"content": piece}, "finish_reason": null}]
        });
        body.push_str(&format!("data: {}\n\n", chunk));
    }
    body.push_str(
        "data: {\"model\":\"llama-3-8b\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
    );
    body.push_str("data: [DONE]\n\n");
    body
}

#[tokio::test]
async fn test_unauthorized_maps_to_authentication_failed_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"message": "Incorrect API key provided", "type": "invalid_request_error"}
        })))
        // 两次调用，每次恰好一个请求
        .expect(2)
        .mount(&server)
        .await;

    let fx = fixture();
    connect(&fx, &format!("{}/v1", server.uri()), Some("wrong-key"));

    let err = fx
        .router
        .chat_once(&[Message::user("hello")])
        .await
        .unwrap_err();
    match err {
        ProviderError::AuthenticationFailed { status, message } => {
            assert_eq!(status, 401);
            assert_eq!(message, "Incorrect API key provided");
        }
        other => panic!("expected AuthenticationFailed, got {other:?}"),
    }

    let err = fx
        .router
        .stream_chat(&[Message::user("hello")])
        .await
        .err()
        .expect("stream should fail");
    assert!(matches!(err, ProviderError::AuthenticationFailed { .. }));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_streamed_reply_matches_non_streamed_reply() {
    let server = MockServer::start().await;
    let pieces = ["Hel", "lo", ", wor", "ld!", " 你好"];
    let full: String = pieces.concat();

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body(&pieces), "text/event-stream"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(&full)))
        .mount(&server)
        .await;

    let fx = fixture();
    connect(&fx, &format!("{}/v1", server.uri()), None);
    let messages = [Message::user("say hello")];

    let once = fx.router.chat_once(&messages).await.expect("chat_once");
    let events = fx.router.stream_events(&messages).await.expect("stream");
    let streamed = llm::collect_stream(events).await.expect("collect");

    assert_eq!(streamed, once);
    assert_eq!(streamed.content, full);
    assert_eq!(streamed.finish_reason.as_deref(), Some("stop"));
}

#[tokio::test]
async fn test_text_stream_yields_only_content_deltas() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body(&["a", "b"]), "text/event-stream"))
        .mount(&server)
        .await;

    let fx = fixture();
    connect(&fx, &server.uri(), None);

    use futures_util::TryStreamExt;
    let deltas: Vec<String> = fx
        .router
        .stream_chat(&[Message::user("x")])
        .await
        .expect("stream")
        .try_collect()
        .await
        .expect("collect");
    assert_eq!(deltas, vec!["a", "b"]);
}

#[tokio::test]
async fn test_malformed_stream_payload_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\ndata: not-json\n\n", "text/event-stream"),
        )
        .mount(&server)
        .await;

    let fx = fixture();
    connect(&fx, &format!("{}/v1", server.uri()), None);
    let events = fx.router.stream_events(&[Message::user("x")]).await.expect("stream");
    let err = llm::collect_stream(events).await.unwrap_err();
    assert!(matches!(err, ProviderError::MalformedStream(_)));
}

#[tokio::test]
async fn test_unknown_model_maps_to_model_invocation_failed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "object": "error",
            "message": "The model `llama-3-8b` does not exist.",
            "type": "NotFoundError",
            "code": 404
        })))
        .mount(&server)
        .await;

    let fx = fixture();
    connect(&fx, &format!("{}/v1", server.uri()), None);
    let err = fx.router.chat_once(&[Message::user("x")]).await.unwrap_err();
    match err {
        ProviderError::ModelInvocationFailed { status, message } => {
            assert_eq!(status, 404);
            assert!(message.contains("does not exist"));
        }
        other => panic!("expected ModelInvocationFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_bearer_header_sent_only_with_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .and(header("Authorization", "Bearer sk-local"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "list",
            "data": [{"id": "llama-3-8b"}, {"id": "qwen2.5-7b"}]
        })))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/models"))
        .and(|req: &Request| !req.headers.contains_key("authorization"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "tiny"}])))
        .expect(1)
        .mount(&server)
        .await;

    let fx = fixture();
    connect(&fx, &format!("{}/v1/", server.uri()), Some("sk-local"));
    assert_eq!(
        fx.router.list_models().await.expect("models"),
        vec!["llama-3-8b", "qwen2.5-7b"]
    );
    let report = fx.router.health().await.expect("health");
    assert!(report.ok);
    assert!(report.model_listed);
    assert_eq!(report.models, 2);

    connect(&fx, &format!("{}/v2", server.uri()), None);
    assert_eq!(fx.router.list_models().await.expect("models"), vec!["tiny"]);
}

#[tokio::test]
async fn test_connection_failure_is_reported() {
    let fx = fixture();
    // 端口 1 上没有服务
    connect(&fx, "http://127.0.0.1:1/v1", None);
    let err = fx.router.list_models().await.unwrap_err();
    assert!(matches!(err, ProviderError::ConnectionFailed { .. }));

    let report = fx.router.health().await.expect("health report");
    assert!(!report.ok);
    assert!(report.error.is_some());
    assert!(report.hint.is_some());
}

#[tokio::test]
async fn test_url_without_scheme_never_reaches_network() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .expect(0)
        .mount(&server)
        .await;

    let address = server.address();
    let submitted = SettingsForm::new("p", format!("{}/v1", address), None, "m");
    let client = llm::http_client(Duration::from_secs(5)).expect("client");
    let err = llm::health_preview(&client, &submitted).await.unwrap_err();
    assert!(matches!(err, ProviderError::InvalidBaseUrl { .. }));

    let fx = fixture();
    assert!(form::connect(&submitted, fx.store.as_ref(), &fx.generator).is_err());
    assert!(!fx.generator.path().exists());
}

#[tokio::test]
async fn test_router_requires_configuration_and_credentials() {
    let fx = fixture();
    let err = fx.router.chat_once(&[Message::user("x")]).await.unwrap_err();
    assert!(matches!(err, ProviderError::NotConfigured));

    connect(&fx, "http://127.0.0.1:1/v1", Some("sk-gone"));
    let key_ref = fx.generator.load().unwrap().unwrap().api_key_ref.unwrap();
    fx.store.delete(&key_ref).unwrap();
    let err = fx.router.resolve_active().unwrap_err();
    assert!(matches!(err, ProviderError::CredentialStoreUnavailable(_)));
}

#[tokio::test]
async fn test_resubmission_routes_to_new_profile() {
    let old_server = MockServer::start().await;
    let new_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("old")))
        .expect(0)
        .mount(&old_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("Authorization", "Bearer k2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("new")))
        .expect(1)
        .mount(&new_server)
        .await;

    let fx = fixture();
    connect(&fx, &format!("{}/v1", old_server.uri()), Some("k1"));
    connect(&fx, &format!("{}/v1", new_server.uri()), Some("k2"));

    let reply = fx.router.chat_once(&[Message::user("x")]).await.expect("chat");
    assert_eq!(reply.content, "new");

    let written = std::fs::read_to_string(fx.generator.path()).unwrap();
    assert!(!written.contains("k1"));
    assert!(!written.contains("k2"));
    assert!(!written.contains(&format!("\"{}/v1\"", old_server.uri())));
}
