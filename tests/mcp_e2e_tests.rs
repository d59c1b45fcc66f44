//! End-to-end MCP scenarios: tool calls over the SLIM memory-stream bridge
//! and pending-request cancellation.

use std::sync::Arc;
use std::time::Duration;

use agentmesh::app::{AppSession, ServeTarget};
use agentmesh::client::McpClientFactory;
use agentmesh::mcp::server::McpServer;
use agentmesh::mcp::types::CallToolResult;
use agentmesh::mcp::McpClient;
use agentmesh::transport::slim::node::{SlimNode, SlimNodeHandle};
use agentmesh::transport::slim::{SlimTransport, SlimTransportConfig};
use agentmesh::transport::Transport;

const SECRET: &str = "an-integration-test-secret-of-32b!";
const FORECAST: &str = "Temperature: 30°C\nHumidity: 50%\nCondition: Sunny\n";

async fn start_node() -> SlimNodeHandle {
    SlimNode::bind("127.0.0.1:0", SECRET)
        .await
        .unwrap()
        .spawn()
        .unwrap()
}

fn slim_transport(endpoint: &str, name: &str) -> Arc<dyn Transport> {
    let mut config = SlimTransportConfig::new(endpoint, name);
    config.shared_secret = SECRET.to_string();
    Arc::new(SlimTransport::new(config).unwrap())
}

fn forecast_server() -> Arc<McpServer> {
    let server = McpServer::new("weather_server", "0.1.0");
    server.register_tool(
        "get_forecast",
        "Get the weather forecast for a location",
        serde_json::json!({
            "type": "object",
            "properties": { "location": { "type": "string" } },
            "required": ["location"]
        }),
        |args| async move {
            if args["location"].as_str().is_none() {
                return Err("location is required".to_string());
            }
            Ok(CallToolResult::text(FORECAST))
        },
    );
    Arc::new(server)
}

#[tokio::test]
async fn tool_calls_over_slim() {
    let node = start_node().await;

    let session = AppSession::new(10);
    session
        .add(ServeTarget::Mcp {
            server: forecast_server(),
        })
        .with_transport(slim_transport(
            &node.endpoint(),
            "default/default/weather_server",
        ))
        .with_topic("default/default/weather_server")
        .build("mcp-weather")
        .await
        .unwrap();
    session.start_all_sessions(false).await.unwrap();

    let client_transport = slim_transport(&node.endpoint(), "default/default/mcp_client");
    let client = McpClientFactory
        .create_client("default/default/weather_server", client_transport)
        .await
        .unwrap();

    let tools = client.list_tools().await.unwrap();
    assert!(tools.iter().any(|t| t.name == "get_forecast"));

    let result = client
        .call_tool("get_forecast", serde_json::json!({ "location": "Colombia" }))
        .await
        .unwrap();
    assert!(!result.is_error);
    assert_eq!(result.text_content(), FORECAST);

    // Handler failures surface as isError results, not protocol errors.
    let result = client
        .call_tool("get_forecast", serde_json::json!({}))
        .await
        .unwrap();
    assert!(result.is_error);

    client.close().await.unwrap();
    session.stop_all_sessions().await;
}

#[tokio::test]
async fn close_cancels_pending_requests() {
    let node = start_node().await;

    // A peer that receives requests but never answers them.
    let blackhole = slim_transport(&node.endpoint(), "default/default/nobody_home");
    blackhole.set_handler(agentmesh::transport::handler_fn(
        |_msg: agentmesh::Message| async move { Ok(None) },
    ));
    blackhole.subscribe("default/default/nobody_home").await.unwrap();

    let transport = slim_transport(&node.endpoint(), "default/default/lonely_client");
    transport.setup().await.unwrap();
    let client = Arc::new(
        McpClient::new(transport, "default/default/nobody_home")
            .with_timeout(Duration::from_secs(30)),
    );

    let requester = Arc::clone(&client);
    let pending = tokio::spawn(async move { requester.list_tools().await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    client.close().await.unwrap();

    let err = pending.await.unwrap().unwrap_err();
    assert!(err.is_cancellation(), "expected cancellation, got: {err}");
}
