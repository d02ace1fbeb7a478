//! Browser-facing push-stream transport.

use axum::body::to_bytes;
use axum::response::IntoResponse;
use mcp_bridge::transport::sse_server::{SseBody, SseServerTransport};
use mcp_bridge::transport::{Transport, TransportEvent};
use mcp_bridge::AppError;
use serde_json::json;

#[tokio::test]
async fn post_before_start_is_not_connected() {
    let (transport, _events, _body) = SseServerTransport::new("/message");
    let err = transport
        .handle_post_message(json!({"jsonrpc": "2.0", "method": "ping", "id": 1}))
        .expect_err("not started");
    assert!(matches!(err, AppError::NotConnected(_)));
}

#[tokio::test]
async fn posted_messages_and_batches_become_events() {
    let (transport, mut events, _body) = SseServerTransport::new("/message");
    transport.start().await.expect("start");

    transport
        .handle_post_message(json!({"jsonrpc": "2.0", "method": "ping", "id": 1}))
        .expect("single");
    transport
        .handle_post_message(json!([
            {"jsonrpc": "2.0", "method": "a", "id": 2},
            {"jsonrpc": "2.0", "method": "b"}
        ]))
        .expect("batch");

    let mut methods = Vec::new();
    for _ in 0..3 {
        match events.recv().await {
            Some(TransportEvent::Message(message)) => {
                methods.push(message["method"].as_str().unwrap().to_owned());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(methods, ["ping", "a", "b"]);
}

#[tokio::test]
async fn non_object_post_is_bad_request() {
    let (transport, _events, _body) = SseServerTransport::new("/message");
    transport.start().await.expect("start");
    for body in [json!("hello"), json!([]), json!([1, 2])] {
        assert!(matches!(
            transport.handle_post_message(body),
            Err(AppError::BadRequest(_))
        ));
    }
}

#[tokio::test]
async fn send_requires_start_and_fails_after_close() {
    let (transport, mut events, _body) = SseServerTransport::new("/message");
    let early = transport.send(json!({"jsonrpc": "2.0", "method": "x"})).await;
    assert!(matches!(early, Err(AppError::NotConnected(_))));

    transport.start().await.expect("start");
    transport.close().await.expect("close");
    transport.close().await.expect("second close");

    let late = transport.send(json!({"jsonrpc": "2.0", "method": "x"})).await;
    assert!(matches!(late, Err(AppError::Disconnected(_))));
    let post = transport.handle_post_message(json!({"jsonrpc": "2.0", "method": "x"}));
    assert!(matches!(post, Err(AppError::Disconnected(_))));

    assert!(matches!(events.recv().await, Some(TransportEvent::Closed)));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn stream_announces_endpoint_then_messages() {
    let (transport, _events, body): (_, _, SseBody) = SseServerTransport::new("/message");
    let session_id = transport.id().to_owned();
    assert_eq!(transport.session_id().as_deref(), Some(session_id.as_str()));
    assert_eq!(
        transport.endpoint_url(),
        format!("/message?sessionId={session_id}")
    );

    transport.start().await.expect("start");
    transport
        .send(json!({"jsonrpc": "2.0", "id": 7, "result": {}}))
        .await
        .expect("send");
    transport.close().await.expect("close");

    let bytes = to_bytes(body.into_response().into_body(), usize::MAX)
        .await
        .expect("body");
    let text = String::from_utf8(bytes.to_vec()).expect("utf8");

    let endpoint_at = text.find("event: endpoint").expect("endpoint event");
    let message_at = text.find("event: message").expect("message event");
    assert!(endpoint_at < message_at);
    assert!(text.contains(&format!("data: /message?sessionId={session_id}")));
    assert!(text.contains(r#""id":7"#));
}

#[tokio::test]
async fn dropping_the_body_closes_the_transport() {
    let (transport, mut events, body) = SseServerTransport::new("/message");
    transport.start().await.expect("start");
    drop(body);

    assert!(matches!(events.recv().await, Some(TransportEvent::Closed)));
    let err = transport.send(json!({"jsonrpc": "2.0", "method": "x"})).await;
    assert!(matches!(err, Err(AppError::Disconnected(_))));
}
