//! FastMCP streamable-HTTP handshake and the optional transport mirror.

use std::sync::Arc;

use agentmesh::app::ServerBridge;
use agentmesh::client::{FastMcpClientFactory, McpClientFactory};
use agentmesh::mcp::http::{FastMcpHttpBridge, MCP_SESSION_ID};
use agentmesh::mcp::server::McpServer;
use agentmesh::mcp::types::CallToolResult;
use agentmesh::transport::slim::node::SlimNode;
use agentmesh::transport::slim::{SlimTransport, SlimTransportConfig};
use agentmesh::transport::Transport;

const SECRET: &str = "an-integration-test-secret-of-32b!";

fn tool_server() -> Arc<McpServer> {
    let server = McpServer::new("calc_server", "0.1.0");
    server.register_tool(
        "add",
        "Add two integers",
        serde_json::json!({
            "type": "object",
            "properties": {
                "a": { "type": "integer" },
                "b": { "type": "integer" }
            },
            "required": ["a", "b"]
        }),
        |args| async move {
            let a = args["a"].as_i64().ok_or("a must be an integer")?;
            let b = args["b"].as_i64().ok_or("b must be an integer")?;
            Ok(CallToolResult::text((a + b).to_string()))
        },
    );
    Arc::new(server)
}

#[tokio::test]
async fn streamable_http_handshake() {
    let bridge = FastMcpHttpBridge::new(tool_server(), "127.0.0.1", Some(0));
    bridge.setup().await.unwrap();
    let url = format!("http://{}/", bridge.local_addr().unwrap());
    let http = reqwest::Client::new();

    // First POST: initialize mints a session id.
    let response = http
        .post(&url)
        .json(&serde_json::json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "test", "version": "0" }
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let session_id = response
        .headers()
        .get(MCP_SESSION_ID)
        .expect("Mcp-Session-Id header")
        .to_str()
        .unwrap()
        .to_string();
    assert!(!session_id.is_empty());

    // Second POST: confirm with the same header.
    let response = http
        .post(&url)
        .header(MCP_SESSION_ID, &session_id)
        .json(&serde_json::json!({
            "jsonrpc": "2.0", "method": "notifications/initialized"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // tools/list without the header is refused.
    let response = http
        .post(&url)
        .json(&serde_json::json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/list"
        }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_client_error());

    // With the header the registered tools come back.
    let response = http
        .post(&url)
        .header(MCP_SESSION_ID, &session_id)
        .json(&serde_json::json!({
            "jsonrpc": "2.0", "id": 3, "method": "tools/list"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["result"]["tools"][0]["name"], "add");

    bridge.teardown().await.unwrap();
}

#[tokio::test]
async fn fast_mcp_client_round_trip() {
    let bridge = FastMcpHttpBridge::new(tool_server(), "127.0.0.1", Some(0));
    bridge.setup().await.unwrap();
    let url = format!("http://{}", bridge.local_addr().unwrap());

    let client = FastMcpClientFactory.create_client(&url).await.unwrap();
    assert!(!client.session_id().is_empty());

    let tools = client.list_tools().await.unwrap();
    assert!(tools.iter().any(|t| t.name == "add"));

    let result = client
        .call_tool("add", serde_json::json!({ "a": 20, "b": 22 }))
        .await
        .unwrap();
    assert!(!result.is_error);
    assert_eq!(result.text_content(), "42");

    bridge.teardown().await.unwrap();
}

#[tokio::test]
async fn transport_mirror_serves_the_same_tools() {
    let node = SlimNode::bind("127.0.0.1:0", SECRET)
        .await
        .unwrap()
        .spawn()
        .unwrap();

    let mut server_config =
        SlimTransportConfig::new(node.endpoint(), "default/default/calc_server");
    server_config.shared_secret = SECRET.to_string();
    let server_transport: Arc<dyn Transport> =
        Arc::new(SlimTransport::new(server_config).unwrap());

    let bridge = FastMcpHttpBridge::new(tool_server(), "127.0.0.1", Some(0))
        .with_transport_mirror(server_transport, "default/default/calc_server");
    bridge.setup().await.unwrap();

    // HTTP side answers.
    let url = format!("http://{}", bridge.local_addr().unwrap());
    let http_client = FastMcpClientFactory.create_client(&url).await.unwrap();
    assert_eq!(http_client.list_tools().await.unwrap().len(), 1);

    // Transport side mirrors the same dispatch.
    let mut client_config = SlimTransportConfig::new(node.endpoint(), "default/default/calc_client");
    client_config.shared_secret = SECRET.to_string();
    let client_transport: Arc<dyn Transport> =
        Arc::new(SlimTransport::new(client_config).unwrap());
    let mcp_client = McpClientFactory
        .create_client("default/default/calc_server", client_transport)
        .await
        .unwrap();
    let result = mcp_client
        .call_tool("add", serde_json::json!({ "a": 1, "b": 2 }))
        .await
        .unwrap();
    assert_eq!(result.text_content(), "3");

    mcp_client.close().await.unwrap();
    bridge.teardown().await.unwrap();
}
