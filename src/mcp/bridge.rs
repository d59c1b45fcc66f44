//! MCP memory-stream bridge: runs a low-level [`McpServer`] behind a
//! transport subscription.
//!
//! The bridge owns a pair of bounded ordered channels standing in for the
//! stdio streams the MCP run loop expects. Two concurrent pumps move data:
//! inbound transport frames feed the server's inbound channel, and the
//! outbound channel drains back to each request's reply route. Bounded
//! capacity is load-bearing: a full outbound channel suspends the tool
//! handler instead of letting it race ahead of the transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::server::McpServer;
use super::types::{McpMessage, RequestId};
use crate::app::ServerBridge;
use crate::error::{Error, Result};
use crate::message::{McpFrame, Message};
use crate::transport::{handler_fn, Transport};

/// Default bound for the duplex channel pair.
pub const DEFAULT_STREAM_CAPACITY: usize = 32;

const REQUEST_DEADLINE: Duration = Duration::from_secs(30);

/// Bridges a low-level MCP server onto a transport topic.
pub struct McpMemoryStreamBridge {
    server: Arc<McpServer>,
    transport: Arc<dyn Transport>,
    topic: String,
    capacity: usize,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl McpMemoryStreamBridge {
    pub fn new(server: Arc<McpServer>, transport: Arc<dyn Transport>, topic: impl Into<String>) -> Self {
        Self {
            server,
            transport,
            topic: topic.into(),
            capacity: DEFAULT_STREAM_CAPACITY,
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}

#[async_trait]
impl ServerBridge for McpMemoryStreamBridge {
    fn protocol(&self) -> &'static str {
        "MCP"
    }

    fn topic(&self) -> Option<&str> {
        Some(&self.topic)
    }

    async fn setup(&self) -> Result<()> {
        self.transport.setup().await?;

        // The duplex pair the MCP run loop treats as its stdio.
        let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(self.capacity);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(self.capacity);

        let server_task = tokio::spawn(Arc::clone(&self.server).run(inbound_rx, outbound_tx));

        // In-flight requests awaiting their response from the run loop.
        let pending: Arc<DashMap<RequestId, oneshot::Sender<Vec<u8>>>> = Arc::new(DashMap::new());

        // Outbound pump: resolve each response against the pending table.
        let pump_pending = Arc::clone(&pending);
        let outbound_task = tokio::spawn(async move {
            while let Some(bytes) = outbound_rx.recv().await {
                match McpMessage::from_bytes(&bytes) {
                    Ok(McpMessage::Response(response)) => {
                        match pump_pending.remove(&response.id) {
                            Some((_, tx)) => {
                                let _ = tx.send(bytes);
                            }
                            None => {
                                debug!(id = ?response.id, "response without a waiting request");
                            }
                        }
                    }
                    Ok(_) => {
                        // Server-initiated traffic has no reply route here.
                        debug!("dropping non-response outbound record");
                    }
                    Err(e) => warn!(error = %e, "malformed outbound record"),
                }
            }
        });

        // Inbound pump: unwrap the multiplexing frame, push the raw bytes
        // into the server's inbound channel, await the correlated response.
        // Request ids are rewritten to a bridge-private sequence before they
        // enter the shared run loop; two clients may both use id 1.
        let handler_pending = Arc::clone(&pending);
        let next_id = Arc::new(std::sync::atomic::AtomicI64::new(1));
        self.transport.set_handler(handler_fn(move |message: Message| {
            let inbound_tx = inbound_tx.clone();
            let pending = Arc::clone(&handler_pending);
            let next_id = Arc::clone(&next_id);
            async move {
                let frame = McpFrame::deserialize(&message.payload)?;
                let mcp_message = McpMessage::from_bytes(&frame.payload)?;

                match mcp_message {
                    McpMessage::Request(mut request) => {
                        let original_id = request.id.clone();
                        let internal_id = RequestId::Number(
                            next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst),
                        );
                        request.id = internal_id.clone();

                        let (tx, rx) = oneshot::channel();
                        pending.insert(internal_id.clone(), tx);
                        inbound_tx
                            .send(serde_json::to_vec(&request)?)
                            .await
                            .map_err(|_| Error::Cancelled("MCP server loop ended".into()))?;

                        let response = tokio::time::timeout(REQUEST_DEADLINE, rx)
                            .await
                            .map_err(|_| {
                                pending.remove(&internal_id);
                                Error::Timeout(REQUEST_DEADLINE)
                            })?
                            .map_err(|_| Error::Cancelled("MCP server loop ended".into()))?;

                        let mut response: super::types::JsonRpcResponse =
                            serde_json::from_slice(&response)?;
                        response.id = original_id;

                        let reply_frame = McpFrame::new(
                            frame.stream_id,
                            frame.seq,
                            serde_json::to_vec(&response)?,
                        );
                        Ok(Some(Message::new("MCPFrame", reply_frame.serialize())))
                    }
                    _ => {
                        // Notifications flow in without a reply.
                        inbound_tx
                            .send(frame.payload)
                            .await
                            .map_err(|_| Error::Cancelled("MCP server loop ended".into()))?;
                        Ok(None)
                    }
                }
            }
        }));
        self.transport.subscribe(&self.topic).await?;

        self.tasks
            .lock()
            .expect("task lock")
            .extend([server_task, outbound_task]);
        info!(topic = %self.topic, server = %self.server.name(), "MCP memory-stream bridge started");
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        self.transport.close().await?;
        // Dropping the handler's channels ends the run loop; aborting covers
        // a loop blocked mid-send.
        for task in self.tasks.lock().expect("task lock").drain(..) {
            task.abort();
        }
        Ok(())
    }
}
