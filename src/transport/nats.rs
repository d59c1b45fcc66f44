//! NATS implementation of the [`Transport`] trait.
//!
//! Subjects use the sanitized three-segment identity. Request/reply rides on
//! a fresh inbox subject per call (the client library's native correlation);
//! broadcast fan-out collects replies on a dedicated reply subject. Group
//! chat is not part of the NATS model and reports `UnsupportedOperation` at
//! call time.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::topic::sanitize_topic;
use crate::transport::{
    Backoff, ConversationOptions, MessageHandler, Transport, TransportKind,
};

/// Default NATS server endpoint.
pub const DEFAULT_NATS_ENDPOINT: &str = "localhost:4222";

/// Configuration for a NATS transport.
#[derive(Debug, Clone)]
pub struct NatsTransportConfig {
    /// Server endpoint, `host:port`.
    pub endpoint: String,
    /// Connect attempts before giving up.
    pub max_connect_retries: u32,
}

impl NatsTransportConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }
}

impl Default for NatsTransportConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_NATS_ENDPOINT.to_string(),
            max_connect_retries: 5,
        }
    }
}

/// NATS transport: subject-based pub/sub with inbox reply correlation.
pub struct NatsTransport {
    config: NatsTransportConfig,
    client: Mutex<Option<async_nats::Client>>,
    handler: RwLock<Option<MessageHandler>>,
    subscriptions: RwLock<HashSet<String>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl NatsTransport {
    pub fn new(config: NatsTransportConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
            handler: RwLock::new(None),
            subscriptions: RwLock::new(HashSet::new()),
            tasks: std::sync::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(endpoint: &str) -> Self {
        Self::new(NatsTransportConfig::new(endpoint))
    }

    async fn connected_client(&self) -> Result<async_nats::Client> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Cancelled("transport closed".to_string()));
        }
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }

        let mut backoff = Backoff::default();
        let mut attempt = 0u32;
        let client = loop {
            match async_nats::connect(self.config.endpoint.as_str()).await {
                Ok(client) => break client,
                Err(e) if attempt < self.config.max_connect_retries => {
                    attempt += 1;
                    let delay = backoff.next_delay();
                    debug!(
                        endpoint = %self.config.endpoint,
                        attempt,
                        error = %e,
                        "NATS connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(Error::Connect(format!(
                        "failed to reach NATS at {}: {e}",
                        self.config.endpoint
                    )));
                }
            }
        };
        info!(endpoint = %self.config.endpoint, "connected to NATS");
        *guard = Some(client.clone());
        Ok(client)
    }

    fn handler_ref(&self) -> Option<MessageHandler> {
        self.handler.read().expect("handler lock").clone()
    }
}

#[async_trait]
impl Transport for NatsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Nats
    }

    async fn setup(&self) -> Result<()> {
        self.connected_client().await.map(|_| ())
    }

    async fn publish(&self, topic: &str, message: Message) -> Result<()> {
        let client = self.connected_client().await?;
        let subject = sanitize_topic(topic);
        client
            .publish(subject, message.serialize().into())
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        client
            .flush()
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn request(&self, topic: &str, message: Message, timeout: Duration) -> Result<Message> {
        let client = self.connected_client().await?;
        let subject = sanitize_topic(topic);
        let response = tokio::time::timeout(
            timeout,
            client.request(subject, message.serialize().into()),
        )
        .await
        .map_err(|_| Error::Timeout(timeout))?
        .map_err(|e| Error::Transport(e.to_string()))?;
        Message::deserialize(&response.payload)
    }

    fn set_handler(&self, handler: MessageHandler) {
        *self.handler.write().expect("handler lock") = Some(handler);
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        let handler = self
            .handler_ref()
            .ok_or_else(|| Error::Config("set_handler must be called before subscribe".into()))?;

        let subject = sanitize_topic(topic);
        {
            let mut subs = self.subscriptions.write().expect("subscription lock");
            if !subs.insert(subject.clone()) {
                return Err(Error::Config(format!(
                    "already subscribed to topic '{subject}'"
                )));
            }
        }

        let client = self.connected_client().await?;
        let mut subscriber = client
            .subscribe(subject.clone())
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let task = tokio::spawn(async move {
            // Handler calls are awaited inline so messages on one
            // subscription are processed in arrival order.
            while let Some(nats_msg) = subscriber.next().await {
                let mut message = match Message::deserialize(&nats_msg.payload) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(subject = %nats_msg.subject, error = %e, "dropping malformed message");
                        continue;
                    }
                };
                if message.reply_to.is_none() {
                    if let Some(reply) = &nats_msg.reply {
                        message.reply_to = Some(reply.to_string());
                    }
                }

                let reply_to = message.reply_to.clone();
                let output = match handler(message).await {
                    Ok(output) => output,
                    Err(e) => {
                        warn!(subject = %nats_msg.subject, error = %e, "handler failed");
                        continue;
                    }
                };

                let Some(reply_to) = reply_to else {
                    continue;
                };
                let reply = match output {
                    Some(output) => output,
                    None => {
                        warn!(subject = %nats_msg.subject, "handler returned no response");
                        Message::new("error", b"No response from handler".to_vec())
                    }
                };
                if let Err(e) = client.publish(reply_to.clone(), reply.serialize().into()).await {
                    warn!(reply_to, error = %e, "failed to publish reply");
                }
            }
            debug!(subject, "NATS subscription ended");
        });
        self.tasks.lock().expect("task lock").push(task);
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
                "recipients must be provided for a NATS broadcast".to_string(),
            ));
        }
        let limit = expected.unwrap_or(recipients.len()).min(recipients.len());
        let client = self.connected_client().await?;

        let reply_subject = format!("_gather.{}", Uuid::new_v4().simple());
        let mut subscriber = client
            .subscribe(reply_subject.clone())
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        // The broadcast group rides in a header; replies funnel into the
        // dedicated reply subject.
        let message = message
            .with_reply_to(reply_subject.clone())
            .with_header(crate::message::BROADCAST_GROUP, sanitize_topic(topic));
        for recipient in recipients {
            let subject = sanitize_topic(recipient);
            client
                .publish(subject, message.serialize().into())
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;
        }
        client
            .flush()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let (tx, rx) = mpsc::channel(32);
        let topic = topic.to_string();
        let deadline = tokio::time::Instant::now() + timeout;
        let task = tokio::spawn(async move {
            let mut collected = 0usize;
            while collected < limit {
                match tokio::time::timeout_at(deadline, subscriber.next()).await {
                    Ok(Some(nats_msg)) => match Message::deserialize(&nats_msg.payload) {
                        Ok(reply) => {
                            collected += 1;
                            if tx.send(reply).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "dropping malformed broadcast reply");
                        }
                    },
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
            let _ = subscriber.unsubscribe().await;
        });
        self.tasks.lock().expect("task lock").push(task);
        Ok(rx)
    }

    async fn start_groupchat(
        &self,
        _channel: &str,
        _participants: &[String],
        _init: Message,
        _options: ConversationOptions,
    ) -> Result<Vec<Message>> {
        Err(Error::UnsupportedOperation(
            "group chat is not supported on the NATS transport".to_string(),
        ))
    }

    async fn start_streaming_groupchat(
        &self,
        _channel: &str,
        _participants: &[String],
        _init: Message,
        _options: ConversationOptions,
    ) -> Result<mpsc::Receiver<Message>> {
        Err(Error::UnsupportedOperation(
            "group chat is not supported on the NATS transport".to_string(),
        ))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        for task in self.tasks.lock().expect("task lock").drain(..) {
            task.abort();
        }
        if let Some(client) = self.client.lock().await.take() {
            if let Err(e) = client.flush().await {
                warn!(error = %e, "error flushing NATS connection on close");
            }
        }
        self.subscriptions.write().expect("subscription lock").clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::handler_fn;

    #[tokio::test]
    async fn groupchat_is_unsupported() {
        let transport = NatsTransport::new(NatsTransportConfig::default());
        let err = transport
            .start_groupchat(
                "channel",
                &["a".to_string()],
                Message::new("text/plain", b"hi".to_vec()),
                ConversationOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation(_)));
    }

    #[tokio::test]
    async fn subscribe_requires_handler() {
        let transport = NatsTransport::new(NatsTransportConfig::default());
        let err = transport.subscribe("some.topic").await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn operations_fail_after_close() {
        let transport = NatsTransport::new(NatsTransportConfig::default());
        transport.close().await.unwrap();
        let err = transport
            .publish("topic", Message::new("text/plain", b"x".to_vec()))
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
    }

    // Requires a live NATS server on localhost:4222.
    #[tokio::test]
    #[ignore]
    async fn request_reply_against_live_server() {
        let server = NatsTransport::new(NatsTransportConfig::default());
        server.set_handler(handler_fn(|msg: Message| async move {
            Ok(Some(Message::new("echo", msg.payload)))
        }));
        server.subscribe("agentmesh.echo.test").await.unwrap();

        let client = NatsTransport::new(NatsTransportConfig::default());
        let reply = client
            .request(
                "agentmesh.echo.test",
                Message::new("text/plain", b"ping".to_vec()),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(reply.payload, b"ping");
    }
}
