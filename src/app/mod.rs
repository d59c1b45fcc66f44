//! Server-side session management: containers binding a served target to a
//! bridge, and the [`AppSession`] supervisor owning many containers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::a2a::engine::{A2aRequestHandler, IdentityVerifier, JsonRpcDispatcher};
use crate::a2a::http::A2aHttpBridge;
use crate::a2a::rpc::{A2aSlimRpcBridge, SlimRpcConnectionConfig};
use crate::a2a::server::A2aPatternsBridge;
use crate::a2a::types::AgentCard;
use crate::error::{Error, Result};
use crate::mcp::bridge::McpMemoryStreamBridge;
use crate::mcp::http::FastMcpHttpBridge;
use crate::mcp::server::McpServer;
use crate::transport::Transport;

/// How long a stopping container may drain in-flight work.
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// A protocol bridge a container can run: owns a subscription (or listener)
/// and a protocol engine instance.
#[async_trait]
pub trait ServerBridge: Send + Sync {
    fn protocol(&self) -> &'static str;
    fn topic(&self) -> Option<&str>;
    async fn setup(&self) -> Result<()>;
    async fn teardown(&self) -> Result<()>;
}

/// What a container serves. Bridge selection inspects this together with
/// the presence of a transport.
pub enum ServeTarget {
    /// An A2A agent handler plus its card.
    A2a {
        handler: Arc<dyn A2aRequestHandler>,
        card: AgentCard,
    },
    /// An A2A agent bound to a native SLIM RPC endpoint; the connection
    /// config carries everything, any transport on the builder is ignored.
    A2aRpc {
        handler: Arc<dyn A2aRequestHandler>,
        card: AgentCard,
        config: SlimRpcConnectionConfig,
    },
    /// A low-level MCP server; requires a transport and topic.
    Mcp { server: Arc<McpServer> },
    /// A FastMCP server; HTTP always runs, a transport mirror is optional.
    FastMcp { server: Arc<McpServer> },
}

/// Lifecycle of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Pending,
    Active,
    Closed,
    Errored,
}

/// One running (or runnable) bridge under a supervisor.
pub struct AppContainer {
    session_id: String,
    bridge: Arc<dyn ServerBridge>,
    state: watch::Sender<ContainerState>,
}

impl std::fmt::Debug for AppContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContainer")
            .field("session_id", &self.session_id)
            .field("protocol", &self.bridge.protocol())
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl AppContainer {
    fn new(session_id: String, bridge: Arc<dyn ServerBridge>) -> Self {
        let (state, _) = watch::channel(ContainerState::Pending);
        Self {
            session_id,
            bridge,
            state,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn topic(&self) -> Option<&str> {
        self.bridge.topic()
    }

    pub fn state(&self) -> ContainerState {
        *self.state.borrow()
    }

    /// Watch for lifecycle changes.
    pub fn state_changes(&self) -> watch::Receiver<ContainerState> {
        self.state.subscribe()
    }

    pub fn bridge(&self) -> &Arc<dyn ServerBridge> {
        &self.bridge
    }

    pub async fn run(&self) -> Result<()> {
        if self.state() == ContainerState::Active {
            warn!(session_id = %self.session_id, "container already running");
            return Ok(());
        }
        match self.bridge.setup().await {
            Ok(()) => {
                let _ = self.state.send(ContainerState::Active);
                info!(
                    session_id = %self.session_id,
                    protocol = self.bridge.protocol(),
                    "container started"
                );
                Ok(())
            }
            Err(e) => {
                let _ = self.state.send(ContainerState::Errored);
                Err(e)
            }
        }
    }

    pub async fn stop(&self) -> Result<()> {
        let result = tokio::time::timeout(TEARDOWN_GRACE, self.bridge.teardown()).await;
        match result {
            Ok(Ok(())) => {
                let _ = self.state.send(ContainerState::Closed);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = self.state.send(ContainerState::Errored);
                Err(e)
            }
            Err(_) => {
                let _ = self.state.send(ContainerState::Errored);
                Err(Error::Timeout(TEARDOWN_GRACE))
            }
        }
    }
}

/// Fluent builder: `session.add(target).with_transport(t).build("id")`.
pub struct AppContainerBuilder<'a> {
    session: &'a AppSession,
    target: ServeTarget,
    transport: Option<Arc<dyn Transport>>,
    topic: Option<String>,
    host: String,
    port: Option<u16>,
    verifier: Option<Arc<dyn IdentityVerifier>>,
}

impl<'a> AppContainerBuilder<'a> {
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Override the topic; defaults to the card-derived value for A2A.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_identity_verifier(mut self, verifier: Arc<dyn IdentityVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    fn dispatcher(
        handler: Arc<dyn A2aRequestHandler>,
        verifier: Option<Arc<dyn IdentityVerifier>>,
    ) -> JsonRpcDispatcher {
        let dispatcher = JsonRpcDispatcher::new(handler);
        match verifier {
            Some(verifier) => dispatcher.with_verifier(verifier),
            None => dispatcher,
        }
    }

    /// Select the bridge for the target and register the container under
    /// `session_id`.
    pub async fn build(self, session_id: impl Into<String>) -> Result<Arc<AppContainer>> {
        let session_id = session_id.into();
        let bridge: Arc<dyn ServerBridge> = match self.target {
            ServeTarget::A2aRpc {
                handler,
                card,
                config,
            } => Arc::new(A2aSlimRpcBridge::new(
                Self::dispatcher(handler, self.verifier),
                card,
                config,
            )),
            ServeTarget::A2a { handler, card } => match self.transport {
                Some(transport) => Arc::new(A2aPatternsBridge::new(
                    Self::dispatcher(handler, self.verifier),
                    card,
                    transport,
                    self.topic,
                )),
                None => {
                    let port = self.port.ok_or_else(|| {
                        Error::Config(
                            "an A2A server without a transport serves HTTP and needs a port"
                                .to_string(),
                        )
                    })?;
                    Arc::new(A2aHttpBridge::new(
                        Self::dispatcher(handler, self.verifier),
                        card,
                        &self.host,
                        port,
                    ))
                }
            },
            ServeTarget::Mcp { server } => {
                let transport = self.transport.ok_or_else(|| {
                    Error::Config("a transport is required for an MCP server".to_string())
                })?;
                let topic = self
                    .topic
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| Error::Config("a topic is required for an MCP server".into()))?;
                Arc::new(McpMemoryStreamBridge::new(server, transport, topic))
            }
            ServeTarget::FastMcp { server } => {
                let bridge = FastMcpHttpBridge::new(server, &self.host, self.port);
                match self.transport {
                    Some(transport) => {
                        let topic = self.topic.filter(|t| !t.is_empty()).ok_or_else(|| {
                            Error::Config(
                                "a topic is required to mirror FastMCP over a transport".into(),
                            )
                        })?;
                        Arc::new(bridge.with_transport_mirror(transport, topic))
                    }
                    None => Arc::new(bridge),
                }
            }
        };

        self.session.register(session_id, bridge).await
    }
}

/// Supervises up to `max_sessions` containers as siblings: one crashed
/// child never restarts another, and shutdown walks them in reverse
/// insertion order.
pub struct AppSession {
    max_sessions: usize,
    containers: Mutex<Vec<Arc<AppContainer>>>,
}

impl AppSession {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions,
            containers: Mutex::new(Vec::new()),
        }
    }

    /// Begin registering a target; finish with
    /// [`AppContainerBuilder::build`].
    pub fn add(&self, target: ServeTarget) -> AppContainerBuilder<'_> {
        AppContainerBuilder {
            session: self,
            target,
            transport: None,
            topic: None,
            host: "0.0.0.0".to_string(),
            port: None,
            verifier: None,
        }
    }

    async fn register(
        &self,
        session_id: String,
        bridge: Arc<dyn ServerBridge>,
    ) -> Result<Arc<AppContainer>> {
        let mut containers = self.containers.lock().await;
        if containers.len() >= self.max_sessions {
            return Err(Error::Config(format!(
                "maximum of {} sessions reached",
                self.max_sessions
            )));
        }
        if containers.iter().any(|c| c.session_id == session_id) {
            return Err(Error::Config(format!(
                "session id '{session_id}' is already registered"
            )));
        }
        // Topic subscriptions are exclusive within one supervisor.
        if let Some(topic) = bridge.topic() {
            if containers
                .iter()
                .any(|c| c.topic() == Some(topic))
            {
                return Err(Error::Config(format!(
                    "topic '{topic}' is already served by another session"
                )));
            }
        }
        let container = Arc::new(AppContainer::new(session_id, bridge));
        containers.push(Arc::clone(&container));
        Ok(container)
    }

    pub async fn container(&self, session_id: &str) -> Option<Arc<AppContainer>> {
        self.containers
            .lock()
            .await
            .iter()
            .find(|c| c.session_id == session_id)
            .cloned()
    }

    pub async fn start_session(&self, session_id: &str) -> Result<()> {
        let container = self.container(session_id).await.ok_or_else(|| {
            Error::Config(format!("no container for session id '{session_id}'"))
        })?;
        container.run().await
    }

    pub async fn stop_session(&self, session_id: &str) -> Result<()> {
        let container = self.container(session_id).await.ok_or_else(|| {
            Error::Config(format!("no container for session id '{session_id}'"))
        })?;
        container.stop().await
    }

    /// Start every container. If one fails to start, the ones already
    /// started are stopped and the error is returned. With `keep_alive`,
    /// blocks until an interrupt, then shuts everything down.
    pub async fn start_all_sessions(&self, keep_alive: bool) -> Result<()> {
        let containers = self.containers.lock().await.clone();
        let mut started: Vec<Arc<AppContainer>> = Vec::new();
        for container in &containers {
            match container.run().await {
                Ok(()) => started.push(Arc::clone(container)),
                Err(e) => {
                    error!(
                        session_id = %container.session_id,
                        error = %e,
                        "container failed to start, rolling back"
                    );
                    for running in started.iter().rev() {
                        if let Err(stop_err) = running.stop().await {
                            warn!(
                                session_id = %running.session_id,
                                error = %stop_err,
                                "rollback stop failed"
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }
        info!(count = started.len(), "all sessions started");

        if keep_alive {
            tokio::signal::ctrl_c()
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;
            info!("interrupt received, shutting down sessions");
            self.stop_all_sessions().await;
        }
        Ok(())
    }

    /// Stop every running container, newest first. Failures are logged and
    /// the child marked errored; siblings still stop.
    pub async fn stop_all_sessions(&self) {
        let containers = self.containers.lock().await.clone();
        for container in containers.iter().rev() {
            if container.state() != ContainerState::Active {
                continue;
            }
            if let Err(e) = container.stop().await {
                warn!(
                    session_id = %container.session_id,
                    error = %e,
                    "container failed to stop cleanly"
                );
            }
        }
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.containers
            .lock()
            .await
            .iter()
            .map(|c| c.session_id.clone())
            .collect()
    }
}
