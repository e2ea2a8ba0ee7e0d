//! Group bot webhook delivery.

use std::time::Duration;

use courier::event::NormalizedEvent;
use courier::sinks::webhook::GroupWebhookAdapter;
use courier::sinks::{http_client, DeliveryError, SinkAdapter};

use crate::mock_http::MockServer;

fn event(body: &str) -> NormalizedEvent {
    NormalizedEvent {
        origin_id: 42,
        origin_title: "Ops room".to_owned(),
        sender_name: "Alice".to_owned(),
        body: body.to_owned(),
        message_id: 1,
        is_muted: false,
    }
}

fn client() -> reqwest::Client {
    match http_client(Duration::from_secs(5)) {
        Ok(client) => client,
        Err(err) => panic!("client should build: {err}"),
    }
}

#[tokio::test]
async fn wecom_posts_markdown_template() {
    let server = MockServer::always(200, r#"{"errcode":0,"errmsg":"ok"}"#).await;
    let adapter = GroupWebhookAdapter::wecom(client(), server.url("/cgi-bin/webhook/send?key=k"));

    let result = adapter.send(&event("hi")).await;
    assert!(result.is_ok(), "unexpected error: {result:?}");

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.method, "POST");
    assert_eq!(request.query(), "key=k");

    let body: serde_json::Value = match serde_json::from_str(&request.body) {
        Ok(body) => body,
        Err(err) => panic!("request body should be JSON: {err}"),
    };
    assert_eq!(body["msgtype"], "markdown");
    assert_eq!(
        body["markdown"]["content"],
        "**Ops room**\nMessage: hi\nSender: Alice"
    );
}

#[tokio::test]
async fn feishu_posts_text_template() {
    let server = MockServer::always(200, r#"{"code":0,"msg":"success"}"#).await;
    let adapter = GroupWebhookAdapter::feishu(client(), server.url("/open-apis/bot/v2/hook/x"));

    assert!(adapter.send(&event("deploy done")).await.is_ok());

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    let body: serde_json::Value = match serde_json::from_str(&requests[0].body) {
        Ok(body) => body,
        Err(err) => panic!("request body should be JSON: {err}"),
    };
    assert_eq!(body["msg_type"], "text");
    assert!(body["content"]["text"]
        .as_str()
        .is_some_and(|t| t.contains("deploy done")));
}

#[tokio::test]
async fn server_error_is_transient() {
    let server = MockServer::always(503, "upstream busy").await;
    let adapter = GroupWebhookAdapter::wecom(client(), server.url("/hook"));

    match adapter.send(&event("hi")).await {
        Err(DeliveryError::Transient(detail)) => assert!(detail.contains("503")),
        other => panic!("expected transient error, got {other:?}"),
    }
}

#[tokio::test]
async fn client_error_is_permanent() {
    let server = MockServer::always(404, "no such hook").await;
    let adapter = GroupWebhookAdapter::wecom(client(), server.url("/hook"));

    let result = adapter.send(&event("hi")).await;
    assert!(matches!(result, Err(DeliveryError::Permanent(_))));
}

#[tokio::test]
async fn backend_error_code_in_ok_response_is_permanent() {
    let server = MockServer::always(200, r#"{"errcode":93000,"errmsg":"invalid webhook url"}"#).await;
    let adapter = GroupWebhookAdapter::wecom(client(), server.url("/hook"));

    match adapter.send(&event("hi")).await {
        Err(DeliveryError::Permanent(detail)) => assert!(detail.contains("93000")),
        other => panic!("expected permanent error, got {other:?}"),
    }
}

#[tokio::test]
async fn backend_rate_limit_is_transient() {
    let server = MockServer::always(200, r#"{"errcode":45009,"errmsg":"api freq out of limit"}"#).await;
    let adapter = GroupWebhookAdapter::wecom(client(), server.url("/hook"));

    let result = adapter.send(&event("hi")).await;
    assert!(matches!(result, Err(DeliveryError::Transient(_))));
}

#[tokio::test]
async fn unreachable_endpoint_is_transient() {
    // Bind and drop to get a port nobody listens on.
    let addr = match std::net::TcpListener::bind("127.0.0.1:0").and_then(|l| l.local_addr()) {
        Ok(addr) => addr,
        Err(err) => panic!("should bind: {err}"),
    };
    let adapter = GroupWebhookAdapter::wecom(client(), format!("http://{addr}/hook"));

    let result = adapter.send(&event("hi")).await;
    assert!(matches!(result, Err(DeliveryError::Transient(_))));
}
