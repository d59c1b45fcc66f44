//! Transport abstraction: point-to-point request/reply, fan-out broadcast,
//! and moderated group chat over pluggable message fabrics.
//!
//! Two concrete transports ship with the crate:
//!
//! | Transport | Module | Correlation | Group chat |
//! |-----------|--------|-------------|------------|
//! | SLIM      | [`slim`] | session id | yes |
//! | NATS      | [`nats`] | inbox subject | no (`UnsupportedOperation`) |

pub mod nats;
pub mod slim;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::message::Message;

/// Discriminates the concrete transport behind a `dyn Transport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Slim,
    Nats,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Slim => "SLIM",
            TransportKind::Nats => "NATS",
        }
    }
}

/// Async callback invoked for every inbound message on a subscription.
///
/// Returning `Some(message)` asks the transport to route a reply according
/// to the inbound message's headers (reply-to topic on NATS, session routing
/// on SLIM). Returning `None` suppresses the reply.
pub type MessageHandler = Arc<
    dyn Fn(Message) -> Pin<Box<dyn Future<Output = Result<Option<Message>>> + Send>> + Send + Sync,
>;

/// Build a [`MessageHandler`] from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Message>>> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(f(msg)))
}

/// Options for a moderated multi-party conversation.
#[derive(Debug, Clone)]
pub struct ConversationOptions {
    /// Token that ends the conversation when it appears in a payload.
    pub end_message: String,
    /// Overall deadline; partial transcripts are returned on expiry.
    pub timeout: Duration,
    /// Participants that receive messages but must not respond.
    pub muted_participants: Vec<String>,
}

impl Default for ConversationOptions {
    fn default() -> Self {
        Self {
            end_message: "done".to_string(),
            timeout: Duration::from_secs(60),
            muted_participants: Vec::new(),
        }
    }
}

/// A pluggable message transport.
///
/// Implementations are shared across sessions (`Arc<dyn Transport>`); all
/// operations take `&self`. Handler invocations for one subscription are
/// serialized in arrival order; distinct subscriptions run in parallel.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Establish the underlying connection. Idempotent; retries with
    /// exponential backoff before giving up with `Error::Connect`.
    async fn setup(&self) -> Result<()>;

    /// Fire-and-forget publish to a topic.
    async fn publish(&self, topic: &str, message: Message) -> Result<()>;

    /// Send a message and await exactly one correlated reply.
    async fn request(&self, topic: &str, message: Message, timeout: Duration) -> Result<Message>;

    /// Register the callback invoked for inbound messages. Must be set
    /// before [`Transport::subscribe`].
    fn set_handler(&self, handler: MessageHandler);

    /// Start receiving messages addressed to `topic`. Subscribing to the
    /// same topic twice on one transport is an error.
    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// Publish once and collect up to `expected` replies (defaulting to one
    /// per recipient). Returns the partial set on timeout, never an error.
    async fn broadcast(
        &self,
        topic: &str,
        message: Message,
        recipients: &[String],
        expected: Option<usize>,
        timeout: Duration,
    ) -> Result<Vec<Message>>;

    /// Streaming variant of [`Transport::broadcast`]: yields replies as they
    /// arrive. The channel closes at the reply limit or the timeout.
    async fn broadcast_streaming(
        &self,
        topic: &str,
        message: Message,
        recipients: &[String],
        expected: Option<usize>,
        timeout: Duration,
    ) -> Result<mpsc::Receiver<Message>>;

    /// Open a moderated group chat, relay every participant emission, and
    /// return the transcript once the end token appears or the timeout
    /// elapses.
    async fn start_groupchat(
        &self,
        channel: &str,
        participants: &[String],
        init: Message,
        options: ConversationOptions,
    ) -> Result<Vec<Message>>;

    /// Streaming variant of [`Transport::start_groupchat`]: yields each
    /// relayed message as it arrives. The channel closes when the end token
    /// is seen or the timeout elapses.
    async fn start_streaming_groupchat(
        &self,
        channel: &str,
        participants: &[String],
        init: Message,
        options: ConversationOptions,
    ) -> Result<mpsc::Receiver<Message>>;

    /// Terminate all subscriptions and pending operations. Pending awaiters
    /// fail with `Error::Cancelled`.
    async fn close(&self) -> Result<()>;
}

// ─── Reconnect backoff ───────────────────────────────────────────────────

/// Exponential backoff with jitter for connect retries.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// The delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(10));
        self.attempt = self.attempt.saturating_add(1);
        let capped = exp.min(self.max);
        // Up to 25% jitter keeps reconnect storms from synchronizing.
        let jitter = rand::thread_rng().gen_range(0.0..0.25);
        capped.mul_f64(1.0 + jitter)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        let first = backoff.next_delay();
        let second = backoff.next_delay();
        assert!(first >= Duration::from_millis(100));
        assert!(second >= Duration::from_millis(200));
        for _ in 0..10 {
            assert!(backoff.next_delay() <= Duration::from_millis(1250));
        }
    }
}
