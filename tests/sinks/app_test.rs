//! WeCom application delivery with token refresh.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier::credentials::CredentialCache;
use courier::event::NormalizedEvent;
use courier::sinks::app::{AuthenticatedAppAdapter, Recipients, WecomTokenSource};
use courier::sinks::{http_client, DeliveryError, SinkAdapter};

use crate::mock_http::{MockServer, RecordedRequest};

const TOKEN_PATH: &str = "/cgi-bin/gettoken";
const SEND_PATH: &str = "/cgi-bin/message/send";

fn event() -> NormalizedEvent {
    NormalizedEvent {
        origin_id: 7,
        origin_title: "Ops".to_owned(),
        sender_name: "Alice".to_owned(),
        body: "hi".to_owned(),
        message_id: 3,
        is_muted: false,
    }
}

fn adapter(server: &MockServer, recipients: Recipients) -> AuthenticatedAppAdapter {
    let client = match http_client(Duration::from_secs(5)) {
        Ok(client) => client,
        Err(err) => panic!("client should build: {err}"),
    };
    let base = server.url("");
    let source = WecomTokenSource::new(client.clone(), base.clone(), "corp", "secret");
    let cache = Arc::new(CredentialCache::new(Arc::new(source)));
    AuthenticatedAppAdapter::new(client, base, 1000002, recipients, cache)
}

fn token_reply(request: &RecordedRequest, token_number: usize) -> (u16, String) {
    assert!(request.query().contains("corpid=corp"));
    assert!(request.query().contains("corpsecret=secret"));
    (
        200,
        format!(r#"{{"errcode":0,"errmsg":"ok","access_token":"t{token_number}","expires_in":7200}}"#),
    )
}

#[tokio::test]
async fn sends_with_acquired_token() {
    let server = MockServer::start(|request, _| match request.path() {
        TOKEN_PATH => token_reply(request, 1),
        _ => (200, r#"{"errcode":0,"errmsg":"ok"}"#.to_owned()),
    })
    .await;
    let adapter = adapter(
        &server,
        Recipients::from_ids(&["zhangsan".to_owned(), "lisi".to_owned()]),
    );

    assert!(adapter.send(&event()).await.is_ok());
    assert!(adapter.send(&event()).await.is_ok());

    // Second send reuses the cached token.
    assert_eq!(server.count(TOKEN_PATH), 1);
    assert_eq!(server.count(SEND_PATH), 2);

    let send = match server.requests().into_iter().find(|r| r.path() == SEND_PATH) {
        Some(request) => request,
        None => panic!("send request should be recorded"),
    };
    assert_eq!(send.query(), "access_token=t1");
    let body: serde_json::Value = match serde_json::from_str(&send.body) {
        Ok(body) => body,
        Err(err) => panic!("request body should be JSON: {err}"),
    };
    assert_eq!(body["touser"], "zhangsan|lisi");
    assert_eq!(body["agentid"], 1000002);
    assert_eq!(body["text"]["content"], "Ops\nMessage: hi\nSender: Alice");
}

#[tokio::test]
async fn auth_rejection_refreshes_once_and_resends() {
    let token_calls = Arc::new(AtomicUsize::new(0));
    let calls = Arc::clone(&token_calls);
    let server = MockServer::start(move |request, _| match request.path() {
        TOKEN_PATH => {
            let n = calls.fetch_add(1, Ordering::SeqCst).saturating_add(1);
            token_reply(request, n)
        }
        _ if request.query() == "access_token=t1" => (
            200,
            r#"{"errcode":40014,"errmsg":"invalid access_token"}"#.to_owned(),
        ),
        _ => (200, r#"{"errcode":0,"errmsg":"ok"}"#.to_owned()),
    })
    .await;
    let adapter = adapter(&server, Recipients::All);

    let result = adapter.send(&event()).await;
    assert!(result.is_ok(), "auth rejection should be absorbed: {result:?}");

    assert_eq!(server.count(TOKEN_PATH), 2, "initial acquisition plus one refresh");
    let sends: Vec<String> = server
        .requests()
        .into_iter()
        .filter(|r| r.path() == SEND_PATH)
        .map(|r| r.query().to_owned())
        .collect();
    assert_eq!(sends, vec!["access_token=t1", "access_token=t2"]);
    assert_eq!(adapter.credentials().acquisitions(), 2);

    let cached = adapter.credentials().peek().await;
    assert_eq!(cached.as_ref().map(|c| c.token()), Some("t2"));
}

#[tokio::test]
async fn repeated_auth_rejection_surfaces_as_transient() {
    let server = MockServer::start(|request, index| match request.path() {
        TOKEN_PATH => token_reply(request, index),
        _ => (
            200,
            r#"{"errcode":42001,"errmsg":"access_token expired"}"#.to_owned(),
        ),
    })
    .await;
    let adapter = adapter(&server, Recipients::All);

    let result = adapter.send(&event()).await;
    assert!(matches!(result, Err(DeliveryError::Transient(_))));
    assert_eq!(server.count(TOKEN_PATH), 2);
    assert_eq!(server.count(SEND_PATH), 2);
}

#[tokio::test]
async fn token_endpoint_failure_is_transient() {
    let server = MockServer::start(|request, _| match request.path() {
        TOKEN_PATH => (
            200,
            r#"{"errcode":40013,"errmsg":"invalid corpid"}"#.to_owned(),
        ),
        _ => (200, r#"{"errcode":0}"#.to_owned()),
    })
    .await;
    let adapter = adapter(&server, Recipients::All);

    match adapter.send(&event()).await {
        Err(DeliveryError::Transient(detail)) => assert!(detail.contains("40013")),
        other => panic!("expected transient error, got {other:?}"),
    }
    assert_eq!(server.count(SEND_PATH), 0);
}
