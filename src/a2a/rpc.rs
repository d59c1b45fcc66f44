//! A2A over native SLIM RPC: raw JSON-RPC payloads on dedicated
//! point-to-point sessions, no envelope wrapping.
//!
//! Each client request opens a session; the server replies on the same
//! session, streaming methods emit one response frame per event and close
//! the session to mark the end of the stream. A client that disconnects
//! mid-stream cancels the server-side handler.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::engine::JsonRpcDispatcher;
use super::types::*;
use crate::app::ServerBridge;
use crate::error::{Error, Result};
use crate::topic::RoutableName;
use crate::transport::slim::connection::{SessionMessage, SlimConnection, SlimSession};
use crate::transport::slim::transport::MIN_PRODUCTION_SECRET_LEN;

const STREAM_EVENT_QUEUE: usize = 64;

/// Connection bundle consumed by SLIM to authenticate and route a native
/// RPC stream.
#[derive(Debug, Clone)]
pub struct SlimRpcConnectionConfig {
    /// Routable identity, `org/namespace/local_name`.
    pub identity: String,
    /// Shared secret; at least 32 bytes outside of development.
    pub shared_secret: String,
    /// SLIM dataplane endpoint.
    pub endpoint: String,
    pub tls_insecure: bool,
}

impl SlimRpcConnectionConfig {
    pub fn new(
        identity: impl Into<String>,
        shared_secret: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            shared_secret: shared_secret.into(),
            endpoint: endpoint.into(),
            tls_insecure: true,
        }
    }

    /// Parse the identity and flag weak secrets.
    pub fn validate(&self) -> Result<RoutableName> {
        let identity: RoutableName = self.identity.parse()?;
        if self.shared_secret.len() < MIN_PRODUCTION_SECRET_LEN {
            warn!(
                identity = %identity,
                "SLIM RPC shared secret is shorter than {MIN_PRODUCTION_SECRET_LEN} bytes; \
                 acceptable for development only"
            );
        }
        Ok(identity)
    }
}

/// Server bridge owning a native SLIM RPC endpoint for one identity.
pub struct A2aSlimRpcBridge {
    config: SlimRpcConnectionConfig,
    dispatcher: Arc<JsonRpcDispatcher>,
    card: AgentCard,
    conn: Mutex<Option<Arc<SlimConnection>>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl A2aSlimRpcBridge {
    pub fn new(
        dispatcher: JsonRpcDispatcher,
        card: AgentCard,
        config: SlimRpcConnectionConfig,
    ) -> Self {
        Self {
            config,
            dispatcher: Arc::new(dispatcher),
            card,
            conn: Mutex::new(None),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn card(&self) -> &AgentCard {
        &self.card
    }
}

#[async_trait]
impl ServerBridge for A2aSlimRpcBridge {
    fn protocol(&self) -> &'static str {
        "A2A"
    }

    fn topic(&self) -> Option<&str> {
        Some(&self.config.identity)
    }

    async fn setup(&self) -> Result<()> {
        let identity = self.config.validate()?;
        let conn = SlimConnection::connect(
            &self.config.endpoint,
            &identity,
            &self.config.shared_secret,
            5,
        )
        .await?;
        *self.conn.lock().await = Some(Arc::clone(&conn));

        let dispatcher = Arc::clone(&self.dispatcher);
        let listener = tokio::spawn(async move {
            while let Some(session) = conn.next_inbound_session().await {
                debug!(session_id = %session.id, "inbound SLIM RPC session");
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(serve_rpc_session(session, dispatcher));
            }
        });
        self.tasks.lock().expect("task lock").push(listener);

        info!(identity = %self.config.identity, "A2A SLIM RPC bridge started");
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        for task in self.tasks.lock().expect("task lock").drain(..) {
            task.abort();
        }
        if let Some(conn) = self.conn.lock().await.take() {
            conn.close();
        }
        Ok(())
    }
}

/// Serve one RPC session. The payloads on the session are raw JSON-RPC, no
/// transport envelope.
async fn serve_rpc_session(session: Arc<SlimSession>, dispatcher: Arc<JsonRpcDispatcher>) {
    while let Some(SessionMessage { from, payload }) = session.next_message().await {
        let request: JsonRpcRequest = match serde_json::from_slice(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "dropping malformed RPC payload");
                let response = JsonRpcResponse::failure(
                    serde_json::Value::Null,
                    JsonRpcError::parse_error(e.to_string()),
                );
                let bytes = serde_json::to_vec(&response).unwrap_or_default();
                let _ = session.publish_to(&from, bytes).await;
                continue;
            }
        };

        if request.method == "message/stream" {
            stream_response(&session, &from, &dispatcher, request).await;
            // One stream per session; closing marks the end of the stream.
            let _ = session.close().await;
            break;
        }

        let response = dispatcher.dispatch_bytes(&payload, None).await;
        if session.publish_to(&from, response).await.is_err() {
            debug!(session_id = %session.id, "client went away, ending session");
            break;
        }
    }
}

/// Run the streaming handler, forwarding each event as a response frame in
/// production order. A failed publish means the client disconnected; the
/// producer is dropped, cancelling the handler.
async fn stream_response(
    session: &Arc<SlimSession>,
    from: &str,
    dispatcher: &Arc<JsonRpcDispatcher>,
    request: JsonRpcRequest,
) {
    let id = request.id.clone();
    let params: MessageSendParams = match serde_json::from_value(request.params) {
        Ok(params) => params,
        Err(e) => {
            let response =
                JsonRpcResponse::failure(id, JsonRpcError::invalid_params(e.to_string()));
            let _ = session
                .publish_to(from, serde_json::to_vec(&response).unwrap_or_default())
                .await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel::<StreamEvent>(STREAM_EVENT_QUEUE);
    let handler = dispatcher.handler();
    let producer = tokio::spawn(async move { handler.on_message_stream(params, tx).await });

    while let Some(event) = rx.recv().await {
        let frame = match serde_json::to_value(&event) {
            Ok(value) => JsonRpcResponse::success(id.clone(), value),
            Err(e) => JsonRpcResponse::failure(id.clone(), JsonRpcError::internal_error(e.to_string())),
        };
        let bytes = serde_json::to_vec(&frame).unwrap_or_default();
        if session.publish_to(from, bytes).await.is_err() {
            // Client disconnect cancels the handler.
            producer.abort();
            return;
        }
    }

    match producer.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            let response = JsonRpcResponse::failure(id, error);
            let _ = session
                .publish_to(from, serde_json::to_vec(&response).unwrap_or_default())
                .await;
        }
        Err(e) if e.is_cancelled() => {}
        Err(e) => {
            warn!(error = %e, "streaming handler panicked");
            let response =
                JsonRpcResponse::failure(id, JsonRpcError::internal_error(e.to_string()));
            let _ = session
                .publish_to(from, serde_json::to_vec(&response).unwrap_or_default())
                .await;
        }
    }
}

/// Client half of SLIM RPC: one session per request, replies correlated by
/// the session itself.
pub struct SlimRpcClient {
    conn: Arc<SlimConnection>,
    peer: String,
}

impl SlimRpcClient {
    pub async fn connect(config: &SlimRpcConnectionConfig, peer: &str) -> Result<Self> {
        let identity = config.validate()?;
        let conn =
            SlimConnection::connect(&config.endpoint, &identity, &config.shared_secret, 5).await?;
        let peer = identity.resolve(peer)?.to_string();
        Ok(Self { conn, peer })
    }

    /// Unary call: open a session, send, await one reply.
    pub async fn call(
        &self,
        request: &JsonRpcRequest,
        timeout: std::time::Duration,
    ) -> Result<JsonRpcResponse> {
        let session = self
            .conn
            .create_session(crate::transport::slim::SessionConfig::PointToPoint {
                peer: self.peer.clone(),
            })
            .await?;
        session.publish(serde_json::to_vec(request)?).await?;

        let reply = tokio::time::timeout(timeout, session.next_message()).await;
        let result = match reply {
            Ok(Some(SessionMessage { payload, .. })) => {
                serde_json::from_slice(&payload).map_err(|e| Error::Decode(e.to_string()))
            }
            Ok(None) => Err(Error::Transport("session closed without a reply".into())),
            Err(_) => Err(Error::Timeout(timeout)),
        };
        let _ = session.close().await;
        self.conn.forget_session(&session.id);
        result
    }

    /// Streaming call: events arrive as response frames until the server
    /// closes the session.
    pub async fn call_streaming(
        &self,
        request: &JsonRpcRequest,
        timeout: std::time::Duration,
    ) -> Result<Vec<StreamEvent>> {
        let session = self
            .conn
            .create_session(crate::transport::slim::SessionConfig::PointToPoint {
                peer: self.peer.clone(),
            })
            .await?;
        session.publish(serde_json::to_vec(request)?).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut events = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, session.next_message()).await {
                Ok(Some(SessionMessage { payload, .. })) => {
                    let response: JsonRpcResponse = serde_json::from_slice(&payload)
                        .map_err(|e| Error::Decode(e.to_string()))?;
                    if let Some(error) = response.error {
                        self.conn.forget_session(&session.id);
                        return Err(Error::Handler(error.message));
                    }
                    if let Some(result) = response.result {
                        events.push(serde_json::from_value(result)?);
                    }
                }
                Ok(None) => break, // server closed: end of stream
                Err(_) => {
                    self.conn.forget_session(&session.id);
                    return Err(Error::Timeout(timeout));
                }
            }
        }
        self.conn.forget_session(&session.id);
        Ok(events)
    }

    /// Close the connection; pending calls are cancelled, never replayed.
    pub fn close(&self) {
        self.conn.close();
    }
}
