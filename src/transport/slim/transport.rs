//! SLIM implementation of the [`Transport`] trait.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::{SessionManager, SessionMessage, SlimConnection, SlimSession};
use super::wire::SessionConfig;
use crate::error::{Error, Result};
use crate::message::{
    Message, MUTED_PARTICIPANTS, RESPOND_TO_GROUP, RESPOND_TO_SOURCE, SESSION_END_MESSAGE,
};
use crate::topic::RoutableName;
use crate::transport::{ConversationOptions, MessageHandler, Transport, TransportKind};

/// Default SLIM dataplane endpoint.
pub const DEFAULT_SLIM_ENDPOINT: &str = "http://localhost:46357";

/// Shared secrets shorter than this are refused outside of development.
pub const MIN_PRODUCTION_SECRET_LEN: usize = 32;

const GROUPCHAT_STREAM_QUEUE: usize = 32;

/// Configuration for a SLIM transport endpoint.
#[derive(Debug, Clone)]
pub struct SlimTransportConfig {
    /// Dataplane endpoint, `http(s)://host:port`.
    pub endpoint: String,
    /// Routable identity, `org/namespace/local_name`.
    pub name: String,
    /// Shared secret authenticating the identity.
    pub shared_secret: String,
    /// Skip TLS verification when the dataplane uses self-signed certs.
    pub tls_insecure: bool,
    /// Default deadline for request/reply exchanges.
    pub message_timeout: Duration,
    /// Connect attempts before giving up.
    pub max_connect_retries: u32,
}

impl SlimTransportConfig {
    pub fn new(endpoint: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            name: name.into(),
            ..Default::default()
        }
    }
}

impl Default for SlimTransportConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_SLIM_ENDPOINT.to_string(),
            name: String::new(),
            shared_secret: "slim-mls-secret".to_string(),
            tls_insecure: true,
            message_timeout: Duration::from_secs(60),
            max_connect_retries: 5,
        }
    }
}

/// SLIM transport: sessions, routes, and identity-authenticated frames.
pub struct SlimTransport {
    config: SlimTransportConfig,
    local: RoutableName,
    conn: Mutex<Option<Arc<SlimConnection>>>,
    handler: RwLock<Option<MessageHandler>>,
    subscriptions: RwLock<HashSet<String>>,
    sessions: SessionManager,
    listener_started: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl SlimTransport {
    pub fn new(config: SlimTransportConfig) -> Result<Self> {
        let local: RoutableName = config.name.parse()?;
        if config.shared_secret.len() < MIN_PRODUCTION_SECRET_LEN {
            warn!(
                identity = %local,
                "SLIM shared secret is shorter than {MIN_PRODUCTION_SECRET_LEN} bytes; \
                 acceptable for development only"
            );
        }
        Ok(Self {
            config,
            local,
            conn: Mutex::new(None),
            handler: RwLock::new(None),
            subscriptions: RwLock::new(HashSet::new()),
            sessions: SessionManager::new(),
            listener_started: AtomicBool::new(false),
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Convenience constructor matching the factory's `endpoint + name`
    /// calling convention.
    pub fn from_config(endpoint: &str, name: &str) -> Result<Self> {
        Self::new(SlimTransportConfig::new(endpoint, name))
    }

    pub fn local_name(&self) -> &RoutableName {
        &self.local
    }

    async fn connection(&self) -> Result<Arc<SlimConnection>> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            if !conn.is_lost() {
                return Ok(Arc::clone(conn));
            }
            info!(identity = %self.local, "SLIM connection lost, reconnecting");
            self.sessions.clear().await;
        }
        let conn = SlimConnection::connect(
            &self.config.endpoint,
            &self.local,
            &self.config.shared_secret,
            self.config.max_connect_retries,
        )
        .await?;
        *guard = Some(Arc::clone(&conn));
        Ok(conn)
    }

    fn handler_ref(&self) -> Option<MessageHandler> {
        self.handler.read().expect("handler lock").clone()
    }

    fn resolve(&self, topic: &str) -> Result<String> {
        Ok(self.local.resolve(topic)?.to_string())
    }

    async fn open_group_session(
        &self,
        channel: &str,
        participants: &[String],
    ) -> Result<Arc<SlimSession>> {
        let conn = self.connection().await?;
        let channel = self.resolve(channel)?;
        let session = conn
            .create_session(SessionConfig::Group { channel })
            .await?;
        for participant in participants {
            let participant = self.resolve(participant)?;
            session.invite(&participant).await?;
        }
        Ok(session)
    }

    /// Shared collection loop for group chats: relay messages to `out`
    /// until the end token appears or the deadline passes, then close the
    /// session with the end signal so participants drop it too.
    async fn run_groupchat(
        session: Arc<SlimSession>,
        end_message: String,
        end_signal: String,
        deadline: tokio::time::Instant,
        out: mpsc::Sender<Message>,
    ) {
        loop {
            let next = tokio::time::timeout_at(deadline, session.next_message()).await;
            match next {
                Ok(Some(SessionMessage { payload, .. })) => {
                    let message = match Message::deserialize(&payload) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(session_id = %session.id, error = %e, "dropping malformed group message");
                            continue;
                        }
                    };
                    let text = message.text();
                    let done = text.contains(&end_message);
                    if out.send(message).await.is_err() {
                        break;
                    }
                    if done {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(session_id = %session.id, "group chat timed out");
                    break;
                }
            }
        }

        let end = Message::new("text/plain", end_signal.clone().into_bytes())
            .with_header(SESSION_END_MESSAGE, end_signal);
        if session.publish(end.serialize()).await.is_ok() {
            // Give the fabric a moment to relay the end signal before the
            // session record disappears.
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let _ = session.close().await;
    }
}

#[async_trait]
impl Transport for SlimTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Slim
    }

    async fn setup(&self) -> Result<()> {
        self.connection().await.map(|_| ())
    }

    async fn publish(&self, topic: &str, message: Message) -> Result<()> {
        let conn = self.connection().await?;
        let peer = self.resolve(topic)?;
        let entry = self.sessions.point_to_point(&conn, &peer).await?;
        entry.session.publish(message.serialize()).await
    }

    async fn request(&self, topic: &str, message: Message, timeout: Duration) -> Result<Message> {
        let conn = self.connection().await?;
        let peer = self.resolve(topic)?;
        let entry = self.sessions.point_to_point(&conn, &peer).await?;

        // One exchange at a time per session: replies correlate by session
        // id, so interleaved requests could steal each other's replies.
        let _exchange = entry.exchange.lock().await;

        let message = message.with_header(RESPOND_TO_SOURCE, "true");
        entry.session.publish(message.serialize()).await?;

        match tokio::time::timeout(timeout, entry.session.next_message()).await {
            Ok(Some(SessionMessage { payload, .. })) => Message::deserialize(&payload),
            Ok(None) => {
                self.sessions.forget(&peer).await;
                if conn.is_locally_closed() {
                    Err(Error::Cancelled("transport closed".to_string()))
                } else {
                    Err(Error::Transport(
                        "session closed before a reply arrived".to_string(),
                    ))
                }
            }
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    fn set_handler(&self, handler: MessageHandler) {
        *self.handler.write().expect("handler lock") = Some(handler);
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        let handler = self
            .handler_ref()
            .ok_or_else(|| Error::Config("set_handler must be called before subscribe".into()))?;

        let resolved = self.resolve(topic)?;
        {
            let mut subs = self.subscriptions.write().expect("subscription lock");
            if !subs.insert(resolved.clone()) {
                return Err(Error::Config(format!(
                    "already subscribed to topic '{resolved}'"
                )));
            }
        }
        if resolved != self.local.to_string() {
            // SLIM routes by identity; a foreign topic will never reach us.
            warn!(
                topic = %resolved,
                identity = %self.local,
                "subscribe topic differs from transport identity"
            );
        }

        let conn = self.connection().await?;

        // One listener drains inbound sessions regardless of how many
        // subscriptions were registered.
        if self.listener_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let local = self.local.clone();
        let listener = tokio::spawn(async move {
            while let Some(session) = conn.next_inbound_session().await {
                debug!(session_id = %session.id, "inbound SLIM session");
                let handler = handler.clone();
                let local = local.clone();
                tokio::spawn(async move {
                    serve_session(session, handler, local).await;
                });
            }
        });
        self.tasks.lock().expect("task lock").push(listener);
        Ok(())
    }

    async fn broadcast(
        &self,
        topic: &str,
        message: Message,
        recipients: &[String],
        expected: Option<usize>,
        timeout: Duration,
    ) -> Result<Vec<Message>> {
        let mut rx = self
            .broadcast_streaming(topic, message, recipients, expected, timeout)
            .await?;
        let mut replies = Vec::new();
        while let Some(reply) = rx.recv().await {
            replies.push(reply);
        }
        Ok(replies)
    }

    async fn broadcast_streaming(
        &self,
        topic: &str,
        message: Message,
        recipients: &[String],
        expected: Option<usize>,
        timeout: Duration,
    ) -> Result<mpsc::Receiver<Message>> {
        if recipients.is_empty() {
            return Err(Error::Config(
                "recipients must be provided for a SLIM broadcast".to_string(),
            ));
        }
        let limit = expected.unwrap_or(recipients.len()).min(recipients.len());
        let session = self.open_group_session(topic, recipients).await?;

        let message = message.with_header(RESPOND_TO_SOURCE, "true");
        session.publish(message.serialize()).await?;

        let (tx, rx) = mpsc::channel(GROUPCHAT_STREAM_QUEUE);
        let topic = topic.to_string();
        let deadline = tokio::time::Instant::now() + timeout;
        let task = tokio::spawn(async move {
            let mut collected = 0usize;
            while collected < limit {
                match tokio::time::timeout_at(deadline, session.next_message()).await {
                    Ok(Some(SessionMessage { payload, .. })) => {
                        match Message::deserialize(&payload) {
                            Ok(reply) => {
                                collected += 1;
                                if tx.send(reply).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "dropping malformed broadcast reply");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        warn!(
                            topic,
                            collected,
                            expected = limit,
                            "broadcast timed out with partial replies"
                        );
                        break;
                    }
                }
            }
            let _ = session.close().await;
        });
        self.tasks.lock().expect("task lock").push(task);
        Ok(rx)
    }

    async fn start_groupchat(
        &self,
        channel: &str,
        participants: &[String],
        init: Message,
        options: ConversationOptions,
    ) -> Result<Vec<Message>> {
        let mut rx = self
            .start_streaming_groupchat(channel, participants, init, options)
            .await?;
        let mut transcript = Vec::new();
        while let Some(message) = rx.recv().await {
            transcript.push(message);
        }
        Ok(transcript)
    }

    async fn start_streaming_groupchat(
        &self,
        channel: &str,
        participants: &[String],
        init: Message,
        options: ConversationOptions,
    ) -> Result<mpsc::Receiver<Message>> {
        if participants.is_empty() {
            return Err(Error::Config(
                "participants must be provided for a group chat".to_string(),
            ));
        }
        let session = self.open_group_session(channel, participants).await?;

        let muted: Vec<String> = options
            .muted_participants
            .iter()
            .map(|p| self.resolve(p))
            .collect::<Result<_>>()?;
        let end_signal = Uuid::new_v4().simple().to_string();

        let init = init
            .with_header(RESPOND_TO_GROUP, "true")
            .with_header(SESSION_END_MESSAGE, end_signal.clone())
            .with_header(MUTED_PARTICIPANTS, muted.join(","));
        session.publish(init.serialize()).await?;

        let (tx, rx) = mpsc::channel(GROUPCHAT_STREAM_QUEUE);
        let deadline = tokio::time::Instant::now() + options.timeout;
        let end_message = options.end_message.clone();
        let task = tokio::spawn(Self::run_groupchat(
            session,
            end_message,
            end_signal,
            deadline,
            tx,
        ));
        self.tasks.lock().expect("task lock").push(task);
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        for task in self.tasks.lock().expect("task lock").drain(..) {
            task.abort();
        }
        self.sessions.clear().await;
        if let Some(conn) = self.conn.lock().await.take() {
            conn.close();
        }
        self.listener_started.store(false, Ordering::SeqCst);
        self.subscriptions.write().expect("subscription lock").clear();
        Ok(())
    }
}

/// Receive loop for one inbound session: decode, dispatch to the handler,
/// route the reply per the request headers. Messages on a session are
/// processed strictly in arrival order.
async fn serve_session(session: Arc<SlimSession>, handler: MessageHandler, local: RoutableName) {
    let local_name = local.to_string();
    while let Some(SessionMessage { from, payload }) = session.next_message().await {
        let message = match Message::deserialize(&payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "dropping malformed message");
                continue;
            }
        };

        // End-of-session signal: the payload repeats the signal header.
        if let Some(end_signal) = message.header(SESSION_END_MESSAGE) {
            if !end_signal.is_empty() && message.text().contains(end_signal) {
                debug!(session_id = %session.id, "end signal received, leaving session");
                break;
            }
        }

        let muted = message
            .header(MUTED_PARTICIPANTS)
            .map(|list| list.split(',').any(|p| p == local_name))
            .unwrap_or(false);

        let output = match handler(message.clone()).await {
            Ok(Some(output)) => output.propagate_routing(&message),
            Ok(None) => continue,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "handler failed");
                continue;
            }
        };

        if muted {
            debug!(session_id = %session.id, "muted participant, suppressing reply");
            continue;
        }

        let result = if message.header_flag(RESPOND_TO_SOURCE) {
            session.publish_to(&from, output.serialize()).await
        } else if message.header_flag(RESPOND_TO_GROUP) {
            session.publish(output.serialize()).await
        } else {
            debug!(session_id = %session.id, "no reply routing requested");
            Ok(())
        };
        if let Err(e) = result {
            warn!(session_id = %session.id, error = %e, "failed to publish reply");
            break;
        }
    }
    debug!(session_id = %session.id, "session receive loop ended");
}
