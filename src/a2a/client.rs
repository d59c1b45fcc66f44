//! A2A clients: the standard unary client plus the experimental client with
//! broadcast and group-chat patterns.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use super::rpc::{SlimRpcClient, SlimRpcConnectionConfig};
use super::types::*;
use crate::error::{Error, Result};
use crate::message::Message as TransportMessage;
use crate::transport::{ConversationOptions, Transport};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

enum Backend {
    Http {
        http: reqwest::Client,
        url: String,
    },
    Patterns {
        transport: Arc<dyn Transport>,
        topic: String,
    },
    SlimRpc(SlimRpcClient),
}

/// Standard unary A2A client over any negotiated transport.
pub struct A2aClient {
    backend: Backend,
    timeout: Duration,
}

impl std::fmt::Debug for A2aClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match &self.backend {
            Backend::Http { url, .. } => format!("Http({url})"),
            Backend::Patterns { topic, .. } => format!("Patterns({topic})"),
            Backend::SlimRpc(_) => "SlimRpc".to_string(),
        };
        f.debug_struct("A2aClient")
            .field("backend", &backend)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl A2aClient {
    /// Plain HTTP JSON-RPC client.
    pub fn http(url: impl Into<String>) -> Self {
        Self {
            backend: Backend::Http {
                http: reqwest::Client::new(),
                url: url.into().trim_end_matches('/').to_string(),
            },
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Client speaking JSON-RPC envelopes over a message transport.
    pub fn patterns(transport: Arc<dyn Transport>, topic: impl Into<String>) -> Self {
        Self {
            backend: Backend::Patterns {
                transport,
                topic: topic.into(),
            },
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Native SLIM RPC client.
    pub async fn slim_rpc(config: &SlimRpcConnectionConfig, peer: &str) -> Result<Self> {
        Ok(Self {
            backend: Backend::SlimRpc(SlimRpcClient::connect(config, peer).await?),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fetch an agent card from the well-known HTTP path.
    pub async fn resolve_card(base_url: &str) -> Result<AgentCard> {
        let url = format!(
            "{}/.well-known/agent-card.json",
            base_url.trim_end_matches('/')
        );
        let response = reqwest::get(&url)
            .await
            .map_err(|e| Error::Connect(e.to_string()))?;
        response
            .json::<AgentCard>()
            .await
            .map_err(|e| Error::Decode(e.to_string()))
    }

    pub async fn send_message(&self, params: MessageSendParams) -> Result<SendMessageResponse> {
        let request = JsonRpcRequest::new("message/send", serde_json::to_value(&params)?);
        let response = self.call(&request).await?;
        into_result(response)
    }

    /// Convenience: send a single text part.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<SendMessageResponse> {
        self.send_message(MessageSendParams {
            message: Message::user_text(text),
            configuration: None,
        })
        .await
    }

    /// Streamed send; events are returned in production order.
    pub async fn send_message_streaming(
        &self,
        params: MessageSendParams,
    ) -> Result<Vec<StreamEvent>> {
        let request = JsonRpcRequest::new("message/stream", serde_json::to_value(&params)?);
        match &self.backend {
            Backend::SlimRpc(client) => client.call_streaming(&request, self.timeout).await,
            _ => {
                // Unary transports deliver the drained final event.
                let response = self.call(&request).await?;
                let result = check_error(response)?;
                Ok(vec![serde_json::from_value(result)?])
            }
        }
    }

    pub async fn get_task(&self, id: &str, history_length: Option<usize>) -> Result<Task> {
        let request = JsonRpcRequest::new(
            "tasks/get",
            serde_json::to_value(TaskQueryParams {
                id: id.to_string(),
                history_length,
            })?,
        );
        let response = self.call(&request).await?;
        Ok(serde_json::from_value(check_error(response)?)?)
    }

    pub async fn cancel_task(&self, id: &str) -> Result<Task> {
        let request = JsonRpcRequest::new(
            "tasks/cancel",
            serde_json::to_value(TaskQueryParams {
                id: id.to_string(),
                history_length: None,
            })?,
        );
        let response = self.call(&request).await?;
        Ok(serde_json::from_value(check_error(response)?)?)
    }

    async fn call(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        match &self.backend {
            Backend::Http { http, url } => {
                let response = http
                    .post(url)
                    .timeout(self.timeout)
                    .json(request)
                    .send()
                    .await
                    .map_err(|e| {
                        if e.is_timeout() {
                            Error::Timeout(self.timeout)
                        } else {
                            Error::Transport(e.to_string())
                        }
                    })?;
                response
                    .json::<JsonRpcResponse>()
                    .await
                    .map_err(|e| Error::Decode(e.to_string()))
            }
            Backend::Patterns { transport, topic } => {
                let envelope =
                    TransportMessage::new("A2ARequest", serde_json::to_vec(request)?);
                let reply = transport.request(topic, envelope, self.timeout).await?;
                serde_json::from_slice(&reply.payload).map_err(|e| Error::Decode(e.to_string()))
            }
            Backend::SlimRpc(client) => client.call(request, self.timeout).await,
        }
    }
}

/// Extended client exposing broadcast and group-chat patterns. Only
/// constructed for `slimpatterns` / `natspatterns` transports.
pub struct A2aExperimentalClient {
    client: A2aClient,
    transport: Arc<dyn Transport>,
    topic: String,
}

impl std::fmt::Debug for A2aExperimentalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("A2aExperimentalClient")
            .field("client", &self.client)
            .field("topic", &self.topic)
            .finish()
    }
}

impl A2aExperimentalClient {
    pub fn new(transport: Arc<dyn Transport>, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        Self {
            client: A2aClient::patterns(Arc::clone(&transport), topic.clone()),
            transport,
            topic,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Fan a message out to `recipients` and collect their responses.
    /// Partial results are returned on timeout.
    pub async fn broadcast_message(
        &self,
        broadcast_topic: &str,
        text: impl Into<String>,
        recipients: &[String],
        expected: Option<usize>,
        timeout: Duration,
    ) -> Result<Vec<SendMessageResponse>> {
        let mut rx = self
            .broadcast_message_streaming(broadcast_topic, text, recipients, expected, timeout)
            .await?;
        let mut responses = Vec::new();
        while let Some(response) = rx.recv().await {
            responses.push(response);
        }
        Ok(responses)
    }

    /// Streaming fan-out: responses arrive as they are produced.
    pub async fn broadcast_message_streaming(
        &self,
        broadcast_topic: &str,
        text: impl Into<String>,
        recipients: &[String],
        expected: Option<usize>,
        timeout: Duration,
    ) -> Result<mpsc::Receiver<SendMessageResponse>> {
        let mut request = JsonRpcRequest::new(
            "message/send",
            serde_json::to_value(MessageSendParams {
                message: Message::user_text(text),
                configuration: None,
            })?,
        );
        request.broadcast_topic = Some(broadcast_topic.to_string());
        request.recipients = recipients.to_vec();

        let envelope = TransportMessage::new("A2ARequest", serde_json::to_vec(&request)?);
        let mut raw = self
            .transport
            .broadcast_streaming(broadcast_topic, envelope, recipients, expected, timeout)
            .await?;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            while let Some(reply) = raw.recv().await {
                match parse_broadcast_reply(&reply) {
                    Ok(response) => {
                        if tx.send(response).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, "skipping unparseable broadcast reply"),
                }
            }
        });
        Ok(rx)
    }

    /// Open a moderated group chat and return the full transcript.
    pub async fn start_groupchat(
        &self,
        channel: &str,
        participants: &[String],
        init_text: impl Into<String>,
        options: ConversationOptions,
    ) -> Result<Vec<Message>> {
        let mut rx = self
            .start_streaming_groupchat(channel, participants, init_text, options)
            .await?;
        let mut transcript = Vec::new();
        while let Some(message) = rx.recv().await {
            transcript.push(message);
        }
        Ok(transcript)
    }

    /// Streaming group chat: relayed messages arrive as the conversation
    /// unfolds.
    pub async fn start_streaming_groupchat(
        &self,
        channel: &str,
        participants: &[String],
        init_text: impl Into<String>,
        options: ConversationOptions,
    ) -> Result<mpsc::Receiver<Message>> {
        let request = JsonRpcRequest::new(
            "message/send",
            serde_json::to_value(MessageSendParams {
                message: Message::user_text(init_text),
                configuration: None,
            })?,
        );
        let envelope = TransportMessage::new("A2ARequest", serde_json::to_vec(&request)?);
        let mut raw = self
            .transport
            .start_streaming_groupchat(channel, participants, envelope, options)
            .await?;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            while let Some(relayed) = raw.recv().await {
                match parse_groupchat_message(&relayed) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, "skipping unparseable group message"),
                }
            }
        });
        Ok(rx)
    }
}

impl std::ops::Deref for A2aExperimentalClient {
    type Target = A2aClient;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

fn parse_broadcast_reply(reply: &TransportMessage) -> Result<SendMessageResponse> {
    let response: JsonRpcResponse = serde_json::from_slice(&reply.payload)?;
    into_result(response)
}

/// A relayed group-chat payload is a JSON-RPC response from one of the
/// participants; surface the inner message.
fn parse_groupchat_message(relayed: &TransportMessage) -> Result<Message> {
    if let Ok(response) = serde_json::from_slice::<JsonRpcResponse>(&relayed.payload) {
        if let Some(result) = response.result {
            if let Ok(send) = serde_json::from_value::<SendMessageResponse>(result) {
                return match send {
                    SendMessageResponse::Message(message) => Ok(message),
                    SendMessageResponse::Task(task) => task
                        .status
                        .message
                        .ok_or_else(|| Error::Decode("task without status message".into())),
                };
            }
        }
        if let Some(error) = response.error {
            return Err(Error::Handler(error.message));
        }
    }
    // Plain-text emissions (e.g. the end signal) become synthetic messages.
    Ok(Message::agent_text(relayed.text()))
}

fn check_error(response: JsonRpcResponse) -> Result<serde_json::Value> {
    if let Some(error) = response.error {
        return Err(Error::Handler(format!(
            "RPC error {}: {}",
            error.code, error.message
        )));
    }
    response
        .result
        .ok_or_else(|| Error::Decode("response carries neither result nor error".into()))
}

fn into_result(response: JsonRpcResponse) -> Result<SendMessageResponse> {
    Ok(serde_json::from_value(check_error(response)?)?)
}
