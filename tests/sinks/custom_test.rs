//! Custom HTTP delivery.

use std::collections::BTreeMap;
use std::time::Duration;

use courier::config::CustomConfig;
use courier::event::NormalizedEvent;
use courier::sinks::custom::CustomHttpAdapter;
use courier::sinks::{http_client, DeliveryError, SinkAdapter};

use crate::mock_http::MockServer;

fn adapter(url: String, method: &str, headers: &[(&str, &str)]) -> CustomHttpAdapter {
    let config = CustomConfig {
        url,
        method: method.to_owned(),
        headers: headers
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<BTreeMap<_, _>>(),
    };
    let client = match http_client(Duration::from_secs(5)) {
        Ok(client) => client,
        Err(err) => panic!("client should build: {err}"),
    };
    match CustomHttpAdapter::from_config(client, &config) {
        Ok(adapter) => adapter,
        Err(err) => panic!("adapter should build: {err}"),
    }
}

fn event() -> NormalizedEvent {
    NormalizedEvent {
        origin_id: -1001234,
        origin_title: "Alerts".to_owned(),
        sender_name: "Bob".to_owned(),
        body: "disk full".to_owned(),
        message_id: 99,
        is_muted: false,
    }
}

#[tokio::test]
async fn sends_projection_with_configured_method_and_headers() {
    let server = MockServer::always(201, "").await;
    let adapter = adapter(
        server.url("/events"),
        "put",
        &[("Authorization", "Bearer abc"), ("X-Source", "courier")],
    );

    let result = adapter.send(&event()).await;
    assert!(result.is_ok(), "unexpected error: {result:?}");

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.method, "PUT");
    assert_eq!(request.path(), "/events");
    assert_eq!(request.header("authorization"), Some("Bearer abc"));
    assert_eq!(request.header("x-source"), Some("courier"));
    assert_eq!(request.header("content-type"), Some("application/json"));

    let body: serde_json::Value = match serde_json::from_str(&request.body) {
        Ok(body) => body,
        Err(err) => panic!("request body should be JSON: {err}"),
    };
    assert_eq!(
        body,
        serde_json::json!({
            "chat_title": "Alerts",
            "sender": "Bob",
            "message": "disk full",
            "chat_id": -1001234,
            "message_id": 99,
        })
    );
}

#[tokio::test]
async fn non_success_status_is_classified() {
    let server = MockServer::always(500, "boom").await;
    let failing = adapter(server.url("/events"), "POST", &[]);
    assert!(matches!(
        failing.send(&event()).await,
        Err(DeliveryError::Transient(_))
    ));

    let server = MockServer::always(400, "bad").await;
    let rejected = adapter(server.url("/events"), "POST", &[]);
    assert!(matches!(
        rejected.send(&event()).await,
        Err(DeliveryError::Permanent(_))
    ));
}

#[tokio::test]
async fn too_many_requests_is_transient() {
    let server = MockServer::always(429, "slow down").await;
    let adapter = adapter(server.url("/events"), "POST", &[]);
    assert!(matches!(
        adapter.send(&event()).await,
        Err(DeliveryError::Transient(_))
    ));
}
