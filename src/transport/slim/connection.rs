//! Client side of the SLIM fabric: an authenticated connection plus the
//! session handles multiplexed over it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::wire::{auth_digest, read_frame, write_frame, Frame, SessionConfig};
use crate::error::{Error, Result};
use crate::topic::RoutableName;
use crate::transport::Backoff;

const SESSION_QUEUE: usize = 64;
const INBOUND_SESSION_QUEUE: usize = 64;
const WRITER_QUEUE: usize = 256;

/// A message delivered on a session.
#[derive(Debug, Clone)]
pub struct SessionMessage {
    pub from: String,
    pub payload: Vec<u8>,
}

struct SessionEntry {
    tx: mpsc::Sender<SessionMessage>,
    config: SessionConfig,
}

/// Handle to one logical SLIM session (point-to-point or group).
pub struct SlimSession {
    pub id: String,
    pub config: SessionConfig,
    pub moderator: String,
    writer: mpsc::Sender<Frame>,
    rx: Mutex<mpsc::Receiver<SessionMessage>>,
}

impl SlimSession {
    /// Publish to the session; the fabric relays to every other member.
    pub async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        self.send_frame(Frame::Publish {
            session_id: self.id.clone(),
            to: None,
            payload,
        })
        .await
    }

    /// Publish to a single member of the session.
    pub async fn publish_to(&self, target: &str, payload: Vec<u8>) -> Result<()> {
        self.send_frame(Frame::Publish {
            session_id: self.id.clone(),
            to: Some(target.to_string()),
            payload,
        })
        .await
    }

    /// Invite a participant into this (group) session.
    pub async fn invite(&self, participant: &str) -> Result<()> {
        self.send_frame(Frame::Invite {
            session_id: self.id.clone(),
            participant: participant.to_string(),
        })
        .await
    }

    /// Await the next message. `None` means the session (or connection)
    /// closed.
    pub async fn next_message(&self) -> Option<SessionMessage> {
        self.rx.lock().await.recv().await
    }

    /// Close the session on the fabric.
    pub async fn close(&self) -> Result<()> {
        self.send_frame(Frame::CloseSession {
            session_id: self.id.clone(),
        })
        .await
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.writer
            .send(frame)
            .await
            .map_err(|_| Error::Transport("SLIM connection closed".to_string()))
    }
}

/// An authenticated connection to a SLIM node, shared by all sessions a
/// transport opens.
pub struct SlimConnection {
    pub identity: RoutableName,
    writer: mpsc::Sender<Frame>,
    sessions: Arc<DashMap<String, SessionEntry>>,
    inbound_rx: Mutex<mpsc::Receiver<Arc<SlimSession>>>,
    locally_closed: Arc<AtomicBool>,
    lost: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl SlimConnection {
    /// Connect and authenticate, retrying with exponential backoff up to
    /// `max_retries` before failing with `Error::Connect`.
    pub async fn connect(
        endpoint: &str,
        identity: &RoutableName,
        shared_secret: &str,
        max_retries: u32,
    ) -> Result<Arc<Self>> {
        let addr = host_port(endpoint)?;
        let mut backoff = Backoff::default();
        let mut attempt = 0u32;
        let stream = loop {
            match TcpStream::connect(&addr).await {
                Ok(stream) => break stream,
                Err(e) if attempt < max_retries => {
                    attempt += 1;
                    let delay = backoff.next_delay();
                    debug!(
                        endpoint,
                        attempt, error = %e, "SLIM connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(Error::Connect(format!(
                        "failed to reach SLIM node at {endpoint}: {e}"
                    )));
                }
            }
        };
        stream.set_nodelay(true).ok();

        let (mut read_half, mut write_half) = tokio::io::split(stream);

        write_frame(
            &mut write_half,
            &Frame::Hello {
                identity: identity.to_string(),
                digest: auth_digest(&identity.to_string(), shared_secret),
            },
        )
        .await?;

        match read_frame(&mut read_half).await? {
            Some(Frame::HelloAck { ok: true, .. }) => {}
            Some(Frame::HelloAck { ok: false, error }) => {
                return Err(Error::Connect(format!(
                    "SLIM node rejected identity '{identity}': {}",
                    error.unwrap_or_default()
                )));
            }
            other => {
                return Err(Error::Connect(format!(
                    "unexpected handshake frame: {other:?}"
                )));
            }
        }

        let (writer_tx, mut writer_rx) = mpsc::channel::<Frame>(WRITER_QUEUE);
        let sessions: Arc<DashMap<String, SessionEntry>> = Arc::new(DashMap::new());
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_SESSION_QUEUE);
        let locally_closed = Arc::new(AtomicBool::new(false));
        let lost = Arc::new(AtomicBool::new(false));

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                if write_frame(&mut write_half, &frame).await.is_err() {
                    break;
                }
            }
        });

        let reader_sessions = Arc::clone(&sessions);
        let reader_writer = writer_tx.clone();
        let reader_lost = Arc::clone(&lost);
        let reader_closed = Arc::clone(&locally_closed);
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(frame)) => {
                        dispatch_frame(frame, &reader_sessions, &reader_writer, &inbound_tx).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        if e.is_cancellation() {
                            break;
                        }
                        // Malformed frames poison the stream; give up on it.
                        warn!(error = %e, "SLIM connection read failed");
                        break;
                    }
                }
            }
            if !reader_closed.load(Ordering::SeqCst) {
                reader_lost.store(true, Ordering::SeqCst);
            }
            // Dropping the entries closes every session receiver.
            reader_sessions.clear();
        });

        Ok(Arc::new(Self {
            identity: identity.clone(),
            writer: writer_tx,
            sessions,
            inbound_rx: Mutex::new(inbound_rx),
            locally_closed,
            lost,
            reader_task,
            writer_task,
        }))
    }

    /// Open a new session; the local endpoint becomes its moderator.
    pub async fn create_session(&self, config: SessionConfig) -> Result<Arc<SlimSession>> {
        let session_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        self.sessions.insert(
            session_id.clone(),
            SessionEntry {
                tx,
                config: config.clone(),
            },
        );

        self.writer
            .send(Frame::CreateSession {
                session_id: session_id.clone(),
                config: config.clone(),
            })
            .await
            .map_err(|_| Error::Transport("SLIM connection closed".to_string()))?;

        Ok(Arc::new(SlimSession {
            id: session_id,
            config,
            moderator: self.identity.to_string(),
            writer: self.writer.clone(),
            rx: Mutex::new(rx),
        }))
    }

    /// Await the next session another endpoint opened with us. `None` when
    /// the connection is gone.
    pub async fn next_inbound_session(&self) -> Option<Arc<SlimSession>> {
        self.inbound_rx.lock().await.recv().await
    }

    /// Drop a session's local state without touching the fabric.
    pub fn forget_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Whether the connection was closed by us (rather than lost).
    pub fn is_locally_closed(&self) -> bool {
        self.locally_closed.load(Ordering::SeqCst)
    }

    /// Whether the connection was lost to a transport failure.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Tear the connection down. Every pending session receive completes
    /// with `None`, which callers surface as `Error::Cancelled`.
    pub fn close(&self) {
        self.locally_closed.store(true, Ordering::SeqCst);
        self.sessions.clear();
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

impl Drop for SlimConnection {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

async fn dispatch_frame(
    frame: Frame,
    sessions: &Arc<DashMap<String, SessionEntry>>,
    writer: &mpsc::Sender<Frame>,
    inbound_tx: &mpsc::Sender<Arc<SlimSession>>,
) {
    match frame {
        Frame::Deliver {
            session_id,
            from,
            payload,
        } => {
            let tx = sessions
                .get(&session_id)
                .map(|entry| entry.tx.clone());
            match tx {
                Some(tx) => {
                    // Bounded send: backpressure suspends the reader, which
                    // in turn flow-controls the node.
                    if tx.send(SessionMessage { from, payload }).await.is_err() {
                        sessions.remove(&session_id);
                    }
                }
                None => {
                    debug!(session_id, "message for unknown session dropped");
                }
            }
        }
        Frame::SessionOpen {
            session_id,
            config,
            moderator,
        } => {
            let (tx, rx) = mpsc::channel(SESSION_QUEUE);
            sessions.insert(
                session_id.clone(),
                SessionEntry {
                    tx,
                    config: config.clone(),
                },
            );
            let session = Arc::new(SlimSession {
                id: session_id,
                config,
                moderator,
                writer: writer.clone(),
                rx: Mutex::new(rx),
            });
            if inbound_tx.send(session).await.is_err() {
                debug!("inbound session listener gone");
            }
        }
        Frame::SessionClosed { session_id } => {
            sessions.remove(&session_id);
        }
        Frame::Error {
            session_id,
            message,
        } => {
            warn!(?session_id, message, "SLIM node reported error");
            if let Some(id) = session_id {
                // A failed point-to-point session is dead; waking its
                // receiver lets pending awaiters fail fast. A group session
                // survives individual invite failures.
                let is_p2p = sessions
                    .get(&id)
                    .map(|e| matches!(e.config, SessionConfig::PointToPoint { .. }))
                    .unwrap_or(false);
                if is_p2p {
                    sessions.remove(&id);
                }
            }
        }
        other => {
            debug!(frame = ?other, "unexpected frame from node");
        }
    }
}

/// Extract `host:port` from a SLIM endpoint of the form
/// `http(s)://host:port` (scheme optional).
pub fn host_port(endpoint: &str) -> Result<String> {
    let stripped = endpoint
        .strip_prefix("https://")
        .or_else(|| endpoint.strip_prefix("http://"))
        .unwrap_or(endpoint);
    let stripped = stripped.trim_end_matches('/');
    if stripped.is_empty() {
        return Err(Error::Config(format!("invalid SLIM endpoint '{endpoint}'")));
    }
    Ok(stripped.to_string())
}

/// Reuse map for point-to-point sessions, keyed by peer identity.
pub struct SessionManager {
    p2p: Mutex<HashMap<String, P2pEntry>>,
}

#[derive(Clone)]
pub struct P2pEntry {
    pub session: Arc<SlimSession>,
    /// Serializes request/reply exchanges on the shared session so replies
    /// cannot cross between concurrent callers.
    pub exchange: Arc<Mutex<()>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            p2p: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the point-to-point session for `peer`.
    pub async fn point_to_point(
        &self,
        conn: &Arc<SlimConnection>,
        peer: &str,
    ) -> Result<P2pEntry> {
        let mut map = self.p2p.lock().await;
        if let Some(entry) = map.get(peer) {
            // A lost connection leaves stale handles behind; recreate.
            if !entry.session.writer.is_closed() {
                return Ok(entry.clone());
            }
            map.remove(peer);
        }
        let session = conn
            .create_session(SessionConfig::PointToPoint {
                peer: peer.to_string(),
            })
            .await?;
        let entry = P2pEntry {
            session,
            exchange: Arc::new(Mutex::new(())),
        };
        map.insert(peer.to_string(), entry.clone());
        Ok(entry)
    }

    /// Drop the cached session for `peer`, e.g. after it errored.
    pub async fn forget(&self, peer: &str) {
        self.p2p.lock().await.remove(peer);
    }

    pub async fn clear(&self) {
        self.p2p.lock().await.clear();
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing() {
        assert_eq!(host_port("http://localhost:46357").unwrap(), "localhost:46357");
        assert_eq!(host_port("https://10.0.0.1:5000/").unwrap(), "10.0.0.1:5000");
        assert_eq!(host_port("localhost:46357").unwrap(), "localhost:46357");
        assert!(host_port("http://").is_err());
    }
}
