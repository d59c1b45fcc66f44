//! FastMCP streamable-HTTP bridge and client.
//!
//! The bridge always runs an HTTP server implementing the MCP
//! streamable-HTTP handshake: the first POST (`initialize`) mints an
//! `Mcp-Session-Id`, `notifications/initialized` confirms it, and every
//! later POST must echo the header. When a transport is also configured the
//! same server is mirrored over it with the memory-stream bridge.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use dashmap::DashMap;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use super::bridge::McpMemoryStreamBridge;
use super::server::McpServer;
use super::types::*;
use crate::app::ServerBridge;
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Header carrying the negotiated session id.
pub const MCP_SESSION_ID: &str = "mcp-session-id";

/// Environment variable overriding the default HTTP port.
pub const FAST_MCP_PORT_ENV: &str = "FAST_MCP_PORT";

/// Default FastMCP HTTP port.
pub const DEFAULT_FAST_MCP_PORT: u16 = 8081;

/// Resolve the port: explicit override, then environment, then default.
pub fn resolve_port(explicit: Option<u16>) -> u16 {
    explicit
        .or_else(|| {
            std::env::var(FAST_MCP_PORT_ENV)
                .ok()
                .and_then(|v| v.parse().ok())
        })
        .unwrap_or(DEFAULT_FAST_MCP_PORT)
}

#[derive(Clone, Copy)]
struct SessionState {
    initialized: bool,
}

#[derive(Clone)]
struct HttpState {
    server: Arc<McpServer>,
    sessions: Arc<DashMap<String, SessionState>>,
}

/// HTTP-first MCP bridge with an optional transport mirror.
pub struct FastMcpHttpBridge {
    server: Arc<McpServer>,
    host: String,
    port: Option<u16>,
    mirror: Option<(Arc<dyn Transport>, String)>,
    mirror_bridge: Mutex<Option<McpMemoryStreamBridge>>,
    bound: std::sync::OnceLock<SocketAddr>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FastMcpHttpBridge {
    /// `port: None` falls back to `FAST_MCP_PORT`, then 8081. Port 0 binds
    /// ephemerally, which tests use.
    pub fn new(server: Arc<McpServer>, host: &str, port: Option<u16>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            server,
            host: host.to_string(),
            port,
            mirror: None,
            mirror_bridge: Mutex::new(None),
            bound: std::sync::OnceLock::new(),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Additionally serve the same MCP dispatch over a message transport.
    pub fn with_transport_mirror(
        mut self,
        transport: Arc<dyn Transport>,
        topic: impl Into<String>,
    ) -> Self {
        self.mirror = Some((transport, topic.into()));
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.get().copied()
    }
}

#[async_trait]
impl ServerBridge for FastMcpHttpBridge {
    fn protocol(&self) -> &'static str {
        "FastMCP"
    }

    fn topic(&self) -> Option<&str> {
        self.mirror.as_ref().map(|(_, topic)| topic.as_str())
    }

    async fn setup(&self) -> Result<()> {
        let port = resolve_port(self.port);
        let state = HttpState {
            server: Arc::clone(&self.server),
            sessions: Arc::new(DashMap::new()),
        };
        let app = Router::new()
            .route("/", post(handle_post))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind((self.host.as_str(), port))
            .await
            .map_err(|e| {
                Error::Connect(format!(
                    "failed to bind FastMCP bridge on {}:{port}: {e}",
                    self.host
                ))
            })?;
        let addr = listener.local_addr()?;
        let _ = self.bound.set(addr);

        let mut shutdown_rx = self.shutdown.subscribe();
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        let task = tokio::spawn(async move {
            if let Err(e) = server.await {
                tracing::error!(error = %e, "FastMCP HTTP bridge failed");
            }
        });
        *self.task.lock().await = Some(task);
        info!(%addr, "FastMCP HTTP bridge started");

        if let Some((transport, topic)) = &self.mirror {
            let bridge = McpMemoryStreamBridge::new(
                Arc::clone(&self.server),
                Arc::clone(transport),
                topic.clone(),
            );
            bridge.setup().await?;
            *self.mirror_bridge.lock().await = Some(bridge);
            info!(topic = %topic, "FastMCP transport mirror started");
        }
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        if let Some(bridge) = self.mirror_bridge.lock().await.take() {
            bridge.teardown().await?;
        }
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        Ok(())
    }
}

async fn handle_post(
    State(state): State<HttpState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> axum::response::Response {
    let message = match McpMessage::from_bytes(&body) {
        Ok(message) => message,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid MCP payload: {e}"))
                .into_response();
        }
    };
    let session_header = headers
        .get(MCP_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match message {
        McpMessage::Request(request) if request.method == "initialize" => {
            let session_id = Uuid::new_v4().to_string();
            state
                .sessions
                .insert(session_id.clone(), SessionState { initialized: false });
            debug!(session_id = %session_id, "FastMCP session created");

            let response = state.server.handle_request(request).await;
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE.as_str(), "application/json"),
                    (MCP_SESSION_ID, session_id.as_str()),
                ],
                serde_json::to_vec(&response).unwrap_or_default(),
            )
                .into_response()
        }
        McpMessage::Notification(notification) => {
            let Some(session_id) = session_header else {
                return (StatusCode::BAD_REQUEST, "missing Mcp-Session-Id header").into_response();
            };
            let Some(mut session) = state.sessions.get_mut(&session_id) else {
                return (StatusCode::NOT_FOUND, "unknown MCP session").into_response();
            };
            if notification.method == "notifications/initialized" {
                session.initialized = true;
                debug!(session_id = %session_id, "FastMCP session confirmed");
            }
            (StatusCode::OK, "").into_response()
        }
        McpMessage::Request(request) => {
            let Some(session_id) = session_header else {
                return (StatusCode::BAD_REQUEST, "missing Mcp-Session-Id header").into_response();
            };
            if !state.sessions.contains_key(&session_id) {
                return (StatusCode::NOT_FOUND, "unknown MCP session").into_response();
            }
            let response = state.server.handle_request(request).await;
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE.as_str(), "application/json")],
                serde_json::to_vec(&response).unwrap_or_default(),
            )
                .into_response()
        }
        McpMessage::Response(_) => {
            (StatusCode::BAD_REQUEST, "unexpected response message").into_response()
        }
    }
}

/// Client for FastMCP's streamable-HTTP surface. Performs the two-POST
/// handshake before exposing tool operations.
pub struct FastMcpHttpClient {
    http: reqwest::Client,
    url: String,
    session_id: String,
    timeout: Duration,
    request_id: std::sync::atomic::AtomicI64,
}

impl FastMcpHttpClient {
    pub async fn connect(url: impl Into<String>) -> Result<Self> {
        let url = url.into().trim_end_matches('/').to_string() + "/";
        let http = reqwest::Client::new();

        let init = JsonRpcRequest::new(
            RequestId::Number(0),
            "initialize",
            Some(serde_json::to_value(InitializeParams {
                protocol_version: PROTOCOL_VERSION.to_string(),
                capabilities: ClientCapabilities::default(),
                client_info: ClientInfo {
                    name: "agentmesh".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
            })?),
        );
        let response = http
            .post(&url)
            .json(&init)
            .send()
            .await
            .map_err(|e| Error::Connect(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Connect(format!(
                "initialize returned {}",
                response.status()
            )));
        }
        let session_id = response
            .headers()
            .get(MCP_SESSION_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::Connect("initialize response lacks Mcp-Session-Id".into()))?;

        let confirm = JsonRpcNotification::new("notifications/initialized", None);
        let response = http
            .post(&url)
            .header(MCP_SESSION_ID, &session_id)
            .json(&confirm)
            .send()
            .await
            .map_err(|e| Error::Connect(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Connect(format!(
                "initialized confirmation returned {}",
                response.status()
            )));
        }

        Ok(Self {
            http,
            url,
            session_id,
            timeout: Duration::from_secs(30),
            request_id: std::sync::atomic::AtomicI64::new(1),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        let result = self.request("tools/list", None).await?;
        let result: ListToolsResult = serde_json::from_value(result)?;
        Ok(result.tools)
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

    async fn request(&self, method: &str, params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let id = RequestId::Number(
            self.request_id
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst),
        );
        let request = JsonRpcRequest::new(id, method, params);
        let response = self
            .http
            .post(&self.url)
            .header(MCP_SESSION_ID, &self.session_id)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(self.timeout)
                } else {
                    Error::Transport(e.to_string())
                }
            })?;
        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "FastMCP request returned {}",
                response.status()
            )));
        }
        let response: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| Error::Decode(e.to_string()))?;
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
}
