//! Agents that reject forwarded credentials surface as HTTP 401 and leave no
//! session behind.

use axum::http::header::AUTHORIZATION;
use mcp_bridge::headers::MCP_SESSION_ID;
use reqwest::Client;
use serde_json::json;

use super::fake_agents::{sse_agent, streamable_agent, GOOD_TOKEN};
use super::test_helpers::{spawn_proxy, wait_until};

fn initialize_body() -> serde_json::Value {
    json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}})
}

#[tokio::test]
async fn streamable_agent_rejection_is_401() {
    let agent = streamable_agent(Some(GOOD_TOKEN)).await;
    let proxy = spawn_proxy().await;

    let resp = Client::new()
        .post(format!(
            "{}?transportType=streamable-http&url={}/mcp",
            proxy.url("/mcp"),
            agent.base_url
        ))
        .header("accept", "application/json, text/event-stream")
        .header(AUTHORIZATION, "Bearer wrong")
        .json(&initialize_body())
        .send()
        .await
        .expect("POST initialize");

    assert_eq!(resp.status(), 401);
    let registry = &proxy.state.registry;
    assert!(wait_until(|| registry.is_empty()).await);
}

#[tokio::test]
async fn streamable_agent_accepts_good_token() {
    let agent = streamable_agent(Some(GOOD_TOKEN)).await;
    let proxy = spawn_proxy().await;

    let resp = Client::new()
        .post(format!(
            "{}?transportType=streamable-http&url={}/mcp",
            proxy.url("/mcp"),
            agent.base_url
        ))
        .header("accept", "application/json")
        .header(AUTHORIZATION, GOOD_TOKEN)
        .json(&initialize_body())
        .send()
        .await
        .expect("POST initialize");

    assert_eq!(resp.status(), 200);
    assert!(resp.headers().contains_key(MCP_SESSION_ID));
    assert_eq!(proxy.state.registry.len(), 1);
}

#[tokio::test]
async fn push_stream_agent_rejection_is_401() {
    let agent = sse_agent(Some(GOOD_TOKEN)).await;
    let proxy = spawn_proxy().await;

    let resp = Client::new()
        .get(format!(
            "{}?transportType=sse&url={}/sse",
            proxy.url("/sse"),
            agent.base_url
        ))
        .send()
        .await
        .expect("GET /sse");

    assert_eq!(resp.status(), 401);
    assert!(proxy.state.registry.is_empty());
    assert_eq!(agent.seen().len(), 1);
}
