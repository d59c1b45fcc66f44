//! MCP client over a message transport.
//!
//! Requests ride the memory-stream framing in reverse: client JSON-RPC bytes
//! wrapped in `McpFrame`s, correlated replies resolved against a
//! pending-request table. Every outbound request resolves, times out, or is
//! cancelled on close; the table never leaks across reconnects.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use super::types::*;
use crate::error::{Error, Result};
use crate::message::{McpFrame, Message};
use crate::transport::Transport;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// MCP client speaking to a server topic over a transport.
pub struct McpClient {
    transport: Arc<dyn Transport>,
    topic: String,
    stream_id: String,
    seq: AtomicU64,
    request_id: AtomicI64,
    timeout: Duration,
    pending: Arc<DashMap<RequestId, oneshot::Sender<Result<Message>>>>,
    server_info: RwLock<Option<ServerInfo>>,
    available_tools: RwLock<Vec<McpTool>>,
    closed: AtomicBool,
}

impl McpClient {
    pub fn new(transport: Arc<dyn Transport>, topic: impl Into<String>) -> Self {
        Self {
            transport,
            topic: topic.into(),
            stream_id: Uuid::new_v4().simple().to_string(),
            seq: AtomicU64::new(0),
            request_id: AtomicI64::new(1),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            pending: Arc::new(DashMap::new()),
            server_info: RwLock::new(None),
            available_tools: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Connect and run the MCP initialize handshake.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        topic: impl Into<String>,
    ) -> Result<Arc<Self>> {
        let client = Arc::new(Self::new(transport, topic));
        client.transport.setup().await?;
        client.initialize().await?;
        Ok(client)
    }

    /// Initialize handshake: `initialize` request, then the
    /// `notifications/initialized` confirmation, then a tool refresh.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo {
                name: "agentmesh".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let result = self
            .request("initialize", Some(serde_json::to_value(&params)?))
            .await?;
        let result: InitializeResult = serde_json::from_value(result)?;

        *self.server_info.write().await = Some(result.server_info.clone());

        self.notify("notifications/initialized", None).await?;
        info!(
            server = %result.server_info.name,
            version = %result.server_info.version,
            "connected to MCP server"
        );

        if result.capabilities.tools.is_some() {
            self.refresh_tools().await?;
        }
        Ok(result)
    }

    pub async fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.read().await.clone()
    }

    /// Re-fetch the tool list from the server.
    pub async fn refresh_tools(&self) -> Result<Vec<McpTool>> {
        let result = self.request("tools/list", None).await?;
        let result: ListToolsResult = serde_json::from_value(result)?;
        *self.available_tools.write().await = result.tools.clone();
        Ok(result.tools)
    }

    /// The cached tool list.
    pub async fn tools(&self) -> Vec<McpTool> {
        self.available_tools.read().await.clone()
    }

    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        self.refresh_tools().await
    }

    pub async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<CallToolResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let result = self
            .request("tools/call", Some(serde_json::to_value(&params)?))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send a request and await the correlated response.
    async fn request(&self, method: &str, params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Cancelled("client closed".to_string()));
        }
        let id = RequestId::Number(self.request_id.fetch_add(1, Ordering::SeqCst));
        let request = JsonRpcRequest::new(id.clone(), method, params);
        let envelope = self.envelope(serde_json::to_vec(&request)?);

        // The awaiter parks in the pending table so close() can cancel it;
        // correlation itself rides on the transport's reply token (session
        // for SLIM, inbox for NATS).
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let transport = Arc::clone(&self.transport);
        let topic = self.topic.clone();
        let timeout = self.timeout;
        let pending = Arc::clone(&self.pending);
        let request_key = id.clone();
        tokio::spawn(async move {
            let outcome = transport.request(&topic, envelope, timeout).await;
            if let Some((_, tx)) = pending.remove(&request_key) {
                let _ = tx.send(outcome);
            }
        });

        let reply = rx
            .await
            .map_err(|_| Error::Cancelled("request cancelled".to_string()))??;

        let frame = McpFrame::deserialize(&reply.payload)?;
        let response: JsonRpcResponse = serde_json::from_slice(&frame.payload)?;
        if let Some(error) = response.error {
            return Err(Error::Handler(format!(
                "MCP error {}: {}",
                error.code, error.message
            )));
        }
        response
            .result
            .ok_or_else(|| Error::Decode("empty MCP response".to_string()))
    }

    /// Fire-and-forget notification.
    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        let envelope = self.envelope(serde_json::to_vec(&notification)?);
        self.transport.publish(&self.topic, envelope).await
    }

    fn envelope(&self, payload: Vec<u8>) -> Message {
        let frame = McpFrame::new(
            self.stream_id.clone(),
            self.seq.fetch_add(1, Ordering::SeqCst),
            payload,
        );
        Message::new("MCPFrame", frame.serialize())
    }

    /// Cancel every pending request and close the client.
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let keys: Vec<RequestId> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, tx)) = self.pending.remove(&key) {
                debug!(id = ?key, "cancelling pending MCP request");
                drop(tx);
            }
        }
        Ok(())
    }
}
