//! A2A over plain HTTP JSON-RPC: the fallback bridge when no message
//! transport is configured. Serves the agent card on the well-known routes
//! and JSON-RPC on POST `/`.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use super::engine::JsonRpcDispatcher;
use super::types::AgentCard;
use crate::app::ServerBridge;
use crate::error::{Error, Result};

#[derive(Clone)]
struct HttpState {
    dispatcher: Arc<JsonRpcDispatcher>,
    card: Arc<AgentCard>,
}

/// HTTP JSON-RPC bridge for an A2A agent.
pub struct A2aHttpBridge {
    state: HttpState,
    host: String,
    port: u16,
    bound: std::sync::OnceLock<SocketAddr>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl A2aHttpBridge {
    /// Port 0 binds an ephemeral port; see [`A2aHttpBridge::local_addr`].
    pub fn new(dispatcher: JsonRpcDispatcher, card: AgentCard, host: &str, port: u16) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: HttpState {
                dispatcher: Arc::new(dispatcher),
                card: Arc::new(card),
            },
            host: host.to_string(),
            port,
            bound: std::sync::OnceLock::new(),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// The bound address, available after setup.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.get().copied()
    }
}

#[async_trait]
impl ServerBridge for A2aHttpBridge {
    fn protocol(&self) -> &'static str {
        "A2A"
    }

    fn topic(&self) -> Option<&str> {
        None
    }

    async fn setup(&self) -> Result<()> {
        let app = Router::new()
            .route("/.well-known/agent.json", get(agent_card))
            .route("/.well-known/agent-card.json", get(agent_card))
            .route("/", post(handle_rpc))
            .with_state(self.state.clone());

        let listener = tokio::net::TcpListener::bind((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                Error::Connect(format!(
                    "failed to bind A2A HTTP bridge on {}:{}: {e}",
                    self.host, self.port
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
                tracing::error!(error = %e, "A2A HTTP bridge failed");
            }
        });
        *self.task.lock().await = Some(task);

        info!(%addr, "A2A HTTP JSON-RPC bridge started");
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        Ok(())
    }
}

async fn agent_card(State(state): State<HttpState>) -> Json<AgentCard> {
    Json(state.card.as_ref().clone())
}

async fn handle_rpc(
    State(state): State<HttpState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let response = state.dispatcher.dispatch_bytes(&body, authorization).await;
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        response,
    )
}
