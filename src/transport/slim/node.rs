//! Embedded SLIM node: the routing fabric endpoints connect to.
//!
//! The node authenticates identities with the shared secret, keeps the
//! identity → connection registry, and relays session traffic: point-to-point
//! sessions route between their two members, group sessions relay each
//! publish to every other member (or to a single member when the publisher
//! addresses one). Running the node in-process keeps deployments and tests
//! self-contained.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::wire::{auth_digest, read_frame, write_frame, Frame, SessionConfig};
use crate::error::{Error, Result};

const CONNECTION_QUEUE: usize = 256;

struct NodeSession {
    config: SessionConfig,
    moderator: String,
    members: Vec<String>,
}

struct NodeState {
    shared_secret: String,
    peers: DashMap<String, mpsc::Sender<Frame>>,
    sessions: DashMap<String, NodeSession>,
}

impl NodeState {
    fn peer_sender(&self, identity: &str) -> Option<mpsc::Sender<Frame>> {
        self.peers.get(identity).map(|entry| entry.value().clone())
    }

    async fn deliver(&self, identity: &str, frame: Frame) {
        if let Some(tx) = self.peer_sender(identity) {
            if tx.send(frame).await.is_err() {
                debug!(peer = identity, "dropping frame for disconnected peer");
            }
        } else {
            debug!(peer = identity, "no route for frame");
        }
    }
}

/// A bound, not-yet-running SLIM node.
pub struct SlimNode {
    listener: TcpListener,
    state: Arc<NodeState>,
}

impl SlimNode {
    /// Bind the node. `addr` accepts `host:port`; port 0 picks an ephemeral
    /// port, which tests rely on.
    pub async fn bind(addr: &str, shared_secret: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Connect(format!("failed to bind SLIM node on {addr}: {e}")))?;
        Ok(Self {
            listener,
            state: Arc::new(NodeState {
                shared_secret: shared_secret.to_string(),
                peers: DashMap::new(),
                sessions: DashMap::new(),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Into::into)
    }

    /// The endpoint string clients pass to their transport config.
    pub fn endpoint(&self) -> Result<String> {
        Ok(format!("http://{}", self.local_addr()?))
    }

    /// Start the accept loop and return a handle that stops the node when
    /// shut down or dropped.
    pub fn spawn(self) -> Result<SlimNodeHandle> {
        let addr = self.local_addr()?;
        let state = Arc::clone(&self.state);
        let listener = self.listener;
        let task = tokio::spawn(async move {
            info!(%addr, "SLIM node listening");
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, state).await {
                                debug!(%peer_addr, error = %e, "SLIM connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "SLIM node accept failed");
                    }
                }
            }
        });
        Ok(SlimNodeHandle { addr, task })
    }
}

/// Handle to a running node.
pub struct SlimNodeHandle {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl SlimNodeHandle {
    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for SlimNodeHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<NodeState>) -> Result<()> {
    stream.set_nodelay(true).ok();
    let (mut reader, mut writer) = tokio::io::split(stream);

    // The first frame must authenticate the endpoint.
    let identity = match read_frame(&mut reader).await? {
        Some(Frame::Hello { identity, digest }) => {
            if digest != auth_digest(&identity, &state.shared_secret) {
                write_frame(
                    &mut writer,
                    &Frame::HelloAck {
                        ok: false,
                        error: Some("authentication failed".to_string()),
                    },
                )
                .await?;
                return Err(Error::Connect(format!(
                    "rejected identity '{identity}': bad digest"
                )));
            }
            write_frame(
                &mut writer,
                &Frame::HelloAck {
                    ok: true,
                    error: None,
                },
            )
            .await?;
            identity
        }
        Some(other) => {
            return Err(Error::Transport(format!(
                "expected hello, got {other:?}"
            )));
        }
        None => return Ok(()),
    };

    let (tx, mut rx) = mpsc::channel::<Frame>(CONNECTION_QUEUE);
    if state.peers.insert(identity.clone(), tx.clone()).is_some() {
        warn!(identity = %identity, "replacing existing connection for identity");
    }
    debug!(identity = %identity, "endpoint connected");

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    });

    let result = connection_loop(&mut reader, &identity, &state).await;

    // Deregister and drop session membership for this endpoint. A reconnect
    // may already have replaced the registration; leave that one alone.
    state
        .peers
        .remove_if(&identity, |_, sender| sender.same_channel(&tx));
    let mut emptied = Vec::new();
    for mut entry in state.sessions.iter_mut() {
        entry.members.retain(|m| m != &identity);
        if entry.members.is_empty() {
            emptied.push(entry.key().clone());
        }
    }
    for session_id in emptied {
        state.sessions.remove(&session_id);
    }
    writer_task.abort();
    debug!(identity = %identity, "endpoint disconnected");
    result
}

async fn connection_loop(
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
    identity: &str,
    state: &Arc<NodeState>,
) -> Result<()> {
    while let Some(frame) = read_frame(reader).await? {
        match frame {
            Frame::CreateSession { session_id, config } => {
                create_session(state, identity, session_id, config).await;
            }
            Frame::Invite {
                session_id,
                participant,
            } => {
                invite(state, identity, &session_id, participant).await;
            }
            Frame::Publish {
                session_id,
                to,
                payload,
            } => {
                publish(state, identity, &session_id, to, payload).await;
            }
            Frame::CloseSession { session_id } => {
                close_session(state, identity, &session_id).await;
            }
            other => {
                debug!(identity, frame = ?other, "ignoring unexpected frame");
            }
        }
    }
    Ok(())
}

async fn create_session(
    state: &Arc<NodeState>,
    creator: &str,
    session_id: String,
    config: SessionConfig,
) {
    let mut members = vec![creator.to_string()];
    let mut open_for: Option<String> = None;

    match &config {
        SessionConfig::PointToPoint { peer } => {
            members.push(peer.clone());
            open_for = Some(peer.clone());
        }
        SessionConfig::Group { .. } => {}
    }

    state.sessions.insert(
        session_id.clone(),
        NodeSession {
            config: config.clone(),
            moderator: creator.to_string(),
            members,
        },
    );

    if let Some(peer) = open_for {
        if state.peers.contains_key(&peer) {
            state
                .deliver(
                    &peer,
                    Frame::SessionOpen {
                        session_id,
                        config,
                        moderator: creator.to_string(),
                    },
                )
                .await;
        } else {
            state
                .deliver(
                    creator,
                    Frame::Error {
                        session_id: Some(session_id),
                        message: format!("peer '{peer}' is not connected"),
                    },
                )
                .await;
        }
    }
}

async fn invite(state: &Arc<NodeState>, sender: &str, session_id: &str, participant: String) {
    let config = match state.sessions.get_mut(session_id) {
        Some(mut entry) => {
            if entry.moderator != sender {
                warn!(session_id, sender, "invite from non-moderator ignored");
                return;
            }
            if !entry.members.contains(&participant) {
                entry.members.push(participant.clone());
            }
            entry.config.clone()
        }
        None => {
            state
                .deliver(
                    sender,
                    Frame::Error {
                        session_id: Some(session_id.to_string()),
                        message: "unknown session".to_string(),
                    },
                )
                .await;
            return;
        }
    };

    if state.peers.contains_key(&participant) {
        state
            .deliver(
                &participant,
                Frame::SessionOpen {
                    session_id: session_id.to_string(),
                    config,
                    moderator: sender.to_string(),
                },
            )
            .await;
    } else {
        state
            .deliver(
                sender,
                Frame::Error {
                    session_id: Some(session_id.to_string()),
                    message: format!("participant '{participant}' is not connected"),
                },
            )
            .await;
    }
}

async fn publish(
    state: &Arc<NodeState>,
    sender: &str,
    session_id: &str,
    to: Option<String>,
    payload: Vec<u8>,
) {
    let recipients: Vec<String> = match state.sessions.get(session_id) {
        Some(entry) => match &to {
            // Directed delivery must still target a session member.
            Some(target) if entry.members.contains(target) => vec![target.clone()],
            Some(target) => {
                warn!(session_id, target = %target, "directed publish to non-member dropped");
                return;
            }
            None => entry
                .members
                .iter()
                .filter(|m| m.as_str() != sender)
                .cloned()
                .collect(),
        },
        None => {
            state
                .deliver(
                    sender,
                    Frame::Error {
                        session_id: Some(session_id.to_string()),
                        message: "unknown session".to_string(),
                    },
                )
                .await;
            return;
        }
    };

    for recipient in recipients {
        state
            .deliver(
                &recipient,
                Frame::Deliver {
                    session_id: session_id.to_string(),
                    from: sender.to_string(),
                    payload: payload.clone(),
                },
            )
            .await;
    }
}

async fn close_session(state: &Arc<NodeState>, sender: &str, session_id: &str) {
    let members = match state.sessions.remove(session_id) {
        Some((_, session)) => session.members,
        None => return,
    };
    for member in members {
        if member != sender {
            state
                .deliver(
                    &member,
                    Frame::SessionClosed {
                        session_id: session_id.to_string(),
                    },
                )
                .await;
        }
    }
}
