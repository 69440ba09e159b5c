//! Streaming chat client against a mock assistant backend.

use lib::config::AssistantSettings;
use lib::llm::{DifyClient, DifyError, ErrorKind};
use lib::logger::{LogLevel, Logger};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn frame(v: Value) -> String {
    format!("data: {}\n\n", v)
}

fn client_for(server: &MockServer) -> (DifyClient, Logger) {
    let logger = Logger::default();
    let settings = AssistantSettings::new(Some("app-test".to_string()), format!("{}/v1", server.uri()));
    (DifyClient::new(settings, logger.clone()), logger)
}

async fn mount_stream(server: &MockServer, body: String) {
    Mock::given(method("POST"))
        .and(path("/v1/chat-messages"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(server)
        .await;
}

async fn last_request_body(server: &MockServer) -> Value {
    let requests = server.received_requests().await.expect("request recording enabled");
    let last = requests.last().expect("at least one request");
    last.body_json().expect("json body")
}

#[tokio::test]
async fn first_turn_streams_chunks_and_returns_conversation_id() {
    let server = MockServer::start().await;
    let body = [
        frame(json!({ "event": "message", "answer": "Nike", "conversation_id": "" })),
        frame(json!({ "event": "message", "answer": " Vaporfly" })),
        frame(json!({ "event": "message_end", "conversation_id": "abc123" })),
    ]
    .concat();
    mount_stream(&server, body).await;
    let (client, _) = client_for(&server);

    let mut chunks = Vec::new();
    let outcome = client
        .send_streaming_message("推荐一双跑鞋", &mut |c: &str| chunks.push(c.to_string()), None)
        .await
        .unwrap();

    assert_eq!(chunks, vec!["Nike", " Vaporfly"]);
    assert_eq!(chunks.concat(), outcome.full_text);
    assert_eq!(outcome.full_text, "Nike Vaporfly");
    assert_eq!(outcome.conversation_id.as_deref(), Some("abc123"));

    let requests = server.received_requests().await.unwrap();
    let req = &requests[0];
    assert_eq!(
        req.headers.get("authorization").and_then(|v| v.to_str().ok()),
        Some("Bearer app-test")
    );
    assert_eq!(
        req.headers.get("accept").and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    let sent: Value = req.body_json().unwrap();
    assert_eq!(sent["query"], "推荐一双跑鞋");
    assert_eq!(sent["response_mode"], "streaming");
    assert_eq!(sent["user"], "triathlon-user");
    assert_eq!(sent["inputs"]["sport_focus"], "triathlon");
    assert!(sent.get("conversation_id").is_none());
}

#[tokio::test]
async fn follow_up_turn_echoes_conversation_id() {
    let server = MockServer::start().await;
    mount_stream(
        &server,
        frame(json!({ "event": "message_end", "conversation_id": "abc123" })),
    )
    .await;
    let (client, _) = client_for(&server);

    client
        .send_streaming_message("再来一双", &mut |_: &str| {}, Some("abc123"))
        .await
        .unwrap();
    assert_eq!(last_request_body(&server).await["conversation_id"], "abc123");
}

#[tokio::test]
async fn malformed_frames_are_skipped_and_logged() {
    let server = MockServer::start().await;
    let body = [
        frame(json!({ "event": "message", "answer": "A" })),
        "data: {\"event\":\"message\",\"answer\n\n".to_string(),
        "event: ping\n\n".to_string(),
        frame(json!({ "event": "agent_thought", "thought": "thinking" })),
        frame(json!({ "event": "ping" })),
        frame(json!({ "event": "agent_message", "answer": "B" })),
    ]
    .concat();
    mount_stream(&server, body).await;
    let (client, logger) = client_for(&server);

    let mut chunks = Vec::new();
    let outcome = client
        .send_streaming_message("hi", &mut |c: &str| chunks.push(c.to_string()), None)
        .await
        .unwrap();
    assert_eq!(chunks, vec!["A", "B"]);
    assert_eq!(outcome.full_text, "AB");
    assert_eq!(outcome.conversation_id, None);
    assert!(logger.by_level(LogLevel::Warn).len() >= 2);
}

#[tokio::test]
async fn unterminated_last_frame_is_processed() {
    let server = MockServer::start().await;
    let body = format!(
        "{}data: {}",
        frame(json!({ "event": "message", "answer": "tail" })),
        json!({ "event": "message_end", "conversation_id": "c-9" })
    );
    mount_stream(&server, body).await;
    let (client, _) = client_for(&server);
    let outcome = client
        .send_streaming_message("hi", &mut |_: &str| {}, None)
        .await
        .unwrap();
    assert_eq!(outcome.conversation_id.as_deref(), Some("c-9"));
}

#[tokio::test]
async fn error_event_stops_the_stream() {
    let server = MockServer::start().await;
    let body = [
        frame(json!({ "event": "message", "answer": "A" })),
        frame(json!({ "event": "error", "status": 400, "code": "provider_quota_exceeded", "message": "quota" })),
        frame(json!({ "event": "message", "answer": "C" })),
    ]
    .concat();
    mount_stream(&server, body).await;
    let (client, logger) = client_for(&server);

    let mut chunks = Vec::new();
    let err = client
        .send_streaming_message("hi", &mut |c: &str| chunks.push(c.to_string()), None)
        .await
        .unwrap_err();
    assert_eq!(chunks, vec!["A"]);
    match err {
        DifyError::Backend { code, message } => {
            assert_eq!(code, "provider_quota_exceeded");
            assert_eq!(message, "quota");
        }
        other => panic!("expected backend error, got {other:?}"),
    }
    assert!(!logger.by_level(LogLevel::Error).is_empty());
}

#[tokio::test]
async fn http_401_is_rejected_with_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat-messages"))
        .respond_with(ResponseTemplate::new(401).set_body_string("{\"code\":\"unauthorized\"}"))
        .mount(&server)
        .await;
    let (client, _) = client_for(&server);

    let err = client
        .send_streaming_message("hi", &mut |_: &str| {}, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Rejected);
    match err {
        DifyError::Rejected { status, body, .. } => {
            assert_eq!(status, 401);
            assert!(body.contains("unauthorized"));
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn slow_backend_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat-messages"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;
    let logger = Logger::default();
    let settings = AssistantSettings::new(Some("app-test".to_string()), format!("{}/v1", server.uri()))
        .with_timeout(Duration::from_millis(200));
    let client = DifyClient::new(settings, logger);

    let started = Instant::now();
    let err = client
        .send_streaming_message("hi", &mut |_: &str| {}, None)
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_ne!(err.kind(), ErrorKind::Network);
    assert!(err.guidance().contains("diagnostics"));
}

#[tokio::test]
async fn cancel_token_aborts_pending_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat-messages"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;
    let (client, _) = client_for(&server);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = client
        .send_streaming_message_with_cancel("hi", &mut |_: &str| {}, None, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, DifyError::Cancelled));
}

#[tokio::test]
async fn refused_connection_is_a_network_error_naming_the_endpoint() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
        listener.local_addr().expect("local_addr").port()
    };
    let base = format!("http://127.0.0.1:{}/v1", port);
    let client = DifyClient::new(
        AssistantSettings::new(Some("app-test".to_string()), base.clone()),
        Logger::default(),
    );

    let err = client
        .send_streaming_message("hi", &mut |_: &str| {}, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
    let text = err.to_string();
    assert!(text.starts_with("network error:"));
    assert!(text.contains(&format!("{}/chat-messages", base)));
}

#[tokio::test]
async fn missing_key_fails_before_any_request() {
    let server = MockServer::start().await;
    let client = DifyClient::new(
        AssistantSettings::new(None, format!("{}/v1", server.uri())),
        Logger::default(),
    );
    let err = client
        .send_streaming_message("hi", &mut |_: &str| {}, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn blocking_message_returns_whole_answer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat-messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "event": "message",
            "message_id": "m-1",
            "conversation_id": "c-1",
            "answer": "A carbon-plated racer",
            "created_at": 1700000000
        })))
        .mount(&server)
        .await;
    let (client, _) = client_for(&server);

    let answer = client.send_message("racing shoes?", None).await.unwrap();
    assert_eq!(answer.answer, "A carbon-plated racer");
    assert_eq!(answer.conversation_id.as_deref(), Some("c-1"));
    assert_eq!(last_request_body(&server).await["response_mode"], "blocking");
}

#[tokio::test]
async fn conversations_are_listed_for_the_configured_user() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/conversations"))
        .and(wiremock::matchers::query_param("user", "triathlon-user"))
        .and(wiremock::matchers::query_param("limit", "5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "id": "c-1", "name": "Running shoes", "status": "normal", "created_at": 1, "updated_at": 2 }],
            "has_more": false
        })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1/conversations/c-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": "success" })))
        .mount(&server)
        .await;
    let (client, _) = client_for(&server);

    let page = client.list_conversations(5).await.unwrap();
    assert_eq!(page.data.len(), 1);
    assert_eq!(page.data[0].name, "Running shoes");
    assert!(!page.has_more);

    client.delete_conversation("c-1").await.unwrap();
    assert_eq!(last_request_body(&server).await["user"], "triathlon-user");
}
