//! A2A patterns bridge: serves an agent over SLIM or NATS pub/sub.
//!
//! The A2A specification is point-to-point request/response; this bridge
//! extends the same JSON-RPC envelopes and agent-card handshake to broadcast
//! and group-chat patterns over non-HTTP transports. Inbound envelopes route
//! straight into the [`JsonRpcDispatcher`], so there is no HTTP layer in the
//! path.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::info;

use super::engine::JsonRpcDispatcher;
use super::types::AgentCard;
use crate::app::ServerBridge;
use crate::error::Result;
use crate::topic::{sanitize_topic, topic_url};
use crate::transport::{handler_fn, Transport, TransportKind};

/// Maps a transport to its `(preferred_transport tag, URL scheme)`.
fn transport_tag(kind: TransportKind) -> (&'static str, &'static str) {
    match kind {
        TransportKind::Slim => ("slimpatterns", "slim"),
        TransportKind::Nats => ("natspatterns", "nats"),
    }
}

/// Deterministic topic for an agent card: `{name}_{version}`, mangled for
/// transport compatibility.
pub fn agent_topic(card: &AgentCard) -> String {
    sanitize_topic(&format!("{}_{}", card.name, card.version))
}

/// Bridges an A2A agent onto a pub/sub transport subscription.
pub struct A2aPatternsBridge {
    dispatcher: Arc<JsonRpcDispatcher>,
    card: RwLock<AgentCard>,
    transport: Arc<dyn Transport>,
    topic: String,
}

impl A2aPatternsBridge {
    /// `topic` defaults to the card-derived value when `None`.
    pub fn new(
        dispatcher: JsonRpcDispatcher,
        card: AgentCard,
        transport: Arc<dyn Transport>,
        topic: Option<String>,
    ) -> Self {
        let topic = topic
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| agent_topic(&card));
        Self {
            dispatcher: Arc::new(dispatcher),
            card: RwLock::new(card),
            transport,
            topic,
        }
    }

    /// The card as served, with transport tag and URL stamped at setup.
    pub fn card(&self) -> AgentCard {
        self.card.read().expect("card lock").clone()
    }
}

#[async_trait]
impl ServerBridge for A2aPatternsBridge {
    fn protocol(&self) -> &'static str {
        "A2A"
    }

    fn topic(&self) -> Option<&str> {
        Some(&self.topic)
    }

    async fn setup(&self) -> Result<()> {
        // Stamp the card before anything can read it: clients derive the
        // topic from card.url and the tag from preferred_transport.
        let (tag, scheme) = transport_tag(self.transport.kind());
        {
            let mut card = self.card.write().expect("card lock");
            card.preferred_transport = Some(tag.to_string());
            card.url = topic_url(scheme, &self.topic);
        }

        self.transport.setup().await?;

        let dispatcher = Arc::clone(&self.dispatcher);
        self.transport.set_handler(handler_fn(move |message| {
            let dispatcher = Arc::clone(&dispatcher);
            async move { Ok(Some(dispatcher.handle_message(message).await)) }
        }));
        self.transport.subscribe(&self.topic).await?;

        info!(topic = %self.topic, transport = tag, "A2A patterns bridge started");
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        self.transport.close().await
    }
}
