//! Low-level MCP server: a named-tool registry plus a run loop over a duplex
//! channel pair, standing in for the stdio streams MCP normally expects.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::types::*;

type ToolHandler = Arc<
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = std::result::Result<CallToolResult, String>> + Send>>
        + Send
        + Sync,
>;

struct RegisteredTool {
    descriptor: McpTool,
    handler: ToolHandler,
}

/// An MCP server exposing named tools.
///
/// Register tools up front, then drive the server either through
/// [`McpServer::run`] (channel pair, used by the memory-stream bridge) or
/// per-request via [`McpServer::handle_request`] (used by the HTTP bridge).
pub struct McpServer {
    name: String,
    version: String,
    tools: RwLock<Vec<RegisteredTool>>,
}

impl McpServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            tools: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a tool with its input schema and async handler. Handler
    /// errors surface as `isError` tool results, not protocol failures.
    pub fn register_tool<F, Fut>(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<CallToolResult, String>> + Send + 'static,
    {
        let descriptor = McpTool {
            name: name.into(),
            description: Some(description.into()),
            input_schema,
        };
        let handler: ToolHandler = Arc::new(move |args| Box::pin(handler(args)));
        self.tools
            .write()
            .expect("tool registry lock")
            .push(RegisteredTool { descriptor, handler });
    }

    pub fn list_tools(&self) -> Vec<McpTool> {
        self.tools
            .read()
            .expect("tool registry lock")
            .iter()
            .map(|t| t.descriptor.clone())
            .collect()
    }

    fn find_tool(&self, name: &str) -> Option<ToolHandler> {
        self.tools
            .read()
            .expect("tool registry lock")
            .iter()
            .find(|t| t.descriptor.name == name)
            .map(|t| Arc::clone(&t.handler))
    }

    /// Handle one JSON-RPC request and produce its response.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();
        match request.method.as_str() {
            "initialize" => {
                let result = InitializeResult {
                    protocol_version: PROTOCOL_VERSION.to_string(),
                    capabilities: ServerCapabilities {
                        tools: Some(ToolsCapability {
                            list_changed: false,
                        }),
                    },
                    server_info: ServerInfo {
                        name: self.name.clone(),
                        version: self.version.clone(),
                    },
                };
                JsonRpcResponse::success(id, serde_json::to_value(result).unwrap_or_default())
            }
            "ping" => JsonRpcResponse::success(id, serde_json::json!({})),
            "tools/list" => {
                let result = ListToolsResult {
                    tools: self.list_tools(),
                };
                JsonRpcResponse::success(id, serde_json::to_value(result).unwrap_or_default())
            }
            "tools/call" => {
                let params: CallToolParams = match request
                    .params
                    .map(serde_json::from_value)
                    .transpose()
                {
                    Ok(Some(params)) => params,
                    Ok(None) => {
                        return JsonRpcResponse::failure(
                            id,
                            JsonRpcError::invalid_params("missing params"),
                        );
                    }
                    Err(e) => {
                        return JsonRpcResponse::failure(
                            id,
                            JsonRpcError::invalid_params(e.to_string()),
                        );
                    }
                };
                match self.find_tool(&params.name) {
                    Some(handler) => {
                        let result = match handler(params.arguments).await {
                            Ok(result) => result,
                            Err(message) => CallToolResult::error(message),
                        };
                        JsonRpcResponse::success(
                            id,
                            serde_json::to_value(result).unwrap_or_default(),
                        )
                    }
                    None => JsonRpcResponse::failure(
                        id,
                        JsonRpcError::method_not_found(&format!("tool '{}'", params.name)),
                    ),
                }
            }
            other => JsonRpcResponse::failure(id, JsonRpcError::method_not_found(other)),
        }
    }

    /// Event loop over a bounded channel pair. Terminates when the inbound
    /// channel closes or the outbound receiver goes away.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Vec<u8>>,
        outbound: mpsc::Sender<Vec<u8>>,
    ) {
        info!(server = %self.name, "MCP server loop started");
        while let Some(bytes) = inbound.recv().await {
            let message = match McpMessage::from_bytes(&bytes) {
                Ok(message) => message,
                Err(e) => {
                    warn!(server = %self.name, error = %e, "dropping malformed MCP payload");
                    continue;
                }
            };
            match message {
                McpMessage::Request(request) => {
                    let response = self.handle_request(request).await;
                    let bytes = match serde_json::to_vec(&response) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!(error = %e, "failed to serialize MCP response");
                            continue;
                        }
                    };
                    if outbound.send(bytes).await.is_err() {
                        break;
                    }
                }
                McpMessage::Notification(notification) => {
                    debug!(server = %self.name, method = %notification.method, "notification");
                }
                McpMessage::Response(response) => {
                    debug!(server = %self.name, id = ?response.id, "ignoring client response");
                }
            }
        }
        info!(server = %self.name, "MCP server loop ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forecast_server() -> Arc<McpServer> {
        let server = McpServer::new("weather_server", "0.1.0");
        server.register_tool(
            "get_forecast",
            "Get the forecast for a location",
            serde_json::json!({
                "type": "object",
                "properties": { "location": { "type": "string" } },
                "required": ["location"]
            }),
            |args| async move {
                let location = args["location"].as_str().unwrap_or("unknown").to_string();
                let _ = location;
                Ok(CallToolResult::text(
                    "Temperature: 30°C\nHumidity: 50%\nCondition: Sunny\n",
                ))
            },
        );
        Arc::new(server)
    }

    #[tokio::test]
    async fn initialize_and_list_tools() {
        let server = forecast_server();

        let response = server
            .handle_request(JsonRpcRequest::new(
                RequestId::Number(1),
                "initialize",
                None,
            ))
            .await;
        let result: InitializeResult = serde_json::from_value(response.result.unwrap()).unwrap();
        assert_eq!(result.server_info.name, "weather_server");
        assert!(result.capabilities.tools.is_some());

        let response = server
            .handle_request(JsonRpcRequest::new(
                RequestId::Number(2),
                "tools/list",
                None,
            ))
            .await;
        let result: ListToolsResult = serde_json::from_value(response.result.unwrap()).unwrap();
        assert_eq!(result.tools.len(), 1);
        assert_eq!(result.tools[0].name, "get_forecast");
    }

    #[tokio::test]
    async fn call_tool_and_unknown_tool() {
        let server = forecast_server();

        let response = server
            .handle_request(JsonRpcRequest::new(
                RequestId::Number(3),
                "tools/call",
                Some(serde_json::json!({
                    "name": "get_forecast",
                    "arguments": { "location": "Colombia" }
                })),
            ))
            .await;
        let result: CallToolResult = serde_json::from_value(response.result.unwrap()).unwrap();
        assert!(!result.is_error);
        assert_eq!(
            result.text_content(),
            "Temperature: 30°C\nHumidity: 50%\nCondition: Sunny\n"
        );

        let response = server
            .handle_request(JsonRpcRequest::new(
                RequestId::Number(4),
                "tools/call",
                Some(serde_json::json!({ "name": "nope", "arguments": {} })),
            ))
            .await;
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn run_loop_over_channel_pair() {
        let server = forecast_server();
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let loop_task = tokio::spawn(Arc::clone(&server).run(in_rx, out_tx));

        let request =
            JsonRpcRequest::new(RequestId::Number(1), "tools/list", None);
        in_tx
            .send(serde_json::to_vec(&request).unwrap())
            .await
            .unwrap();

        let bytes = out_rx.recv().await.unwrap();
        let response: JsonRpcResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(response.result.is_some());

        // Closing both channels terminates the loop.
        drop(in_tx);
        loop_task.await.unwrap();
    }
}
