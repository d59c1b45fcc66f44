//! AppSession supervisor behavior: registration limits, start rollback,
//! lifecycle states, and reverse-order shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use agentmesh::a2a::engine::A2aRequestHandler;
use agentmesh::a2a::types::{
    AgentCapabilities, AgentCard, JsonRpcError, MessageSendParams, SendMessageResponse,
};
use agentmesh::app::{AppSession, ContainerState, ServeTarget};
use agentmesh::transport::slim::node::{SlimNode, SlimNodeHandle};
use agentmesh::transport::slim::{SlimTransport, SlimTransportConfig};
use agentmesh::transport::Transport;
use agentmesh::Error;

const SECRET: &str = "an-integration-test-secret-of-32b!";

struct NullAgent;

#[async_trait]
impl A2aRequestHandler for NullAgent {
    async fn on_message_send(
        &self,
        _params: MessageSendParams,
    ) -> Result<SendMessageResponse, JsonRpcError> {
        Ok(SendMessageResponse::Message(
            agentmesh::a2a::types::Message::agent_text("ok"),
        ))
    }
}

fn card(name: &str) -> AgentCard {
    AgentCard {
        name: name.to_string(),
        description: String::new(),
        url: String::new(),
        version: "1.0.0".to_string(),
        preferred_transport: None,
        additional_interfaces: vec![],
        capabilities: AgentCapabilities::default(),
        skills: vec![],
        default_input_modes: vec![],
        default_output_modes: vec![],
        provider: None,
    }
}

fn target(name: &str) -> ServeTarget {
    ServeTarget::A2a {
        handler: Arc::new(NullAgent),
        card: card(name),
    }
}

async fn start_node() -> SlimNodeHandle {
    SlimNode::bind("127.0.0.1:0", SECRET)
        .await
        .unwrap()
        .spawn()
        .unwrap()
}

fn slim_transport(endpoint: &str, name: &str) -> Arc<dyn Transport> {
    let mut config = SlimTransportConfig::new(endpoint, format!("default/default/{name}"));
    config.shared_secret = SECRET.to_string();
    Arc::new(SlimTransport::new(config).unwrap())
}

/// Transport pointing at a port nothing listens on; fails fast at setup.
fn broken_transport(name: &str) -> Arc<dyn Transport> {
    let mut config =
        SlimTransportConfig::new("http://127.0.0.1:9", format!("default/default/{name}"));
    config.shared_secret = SECRET.to_string();
    config.max_connect_retries = 0;
    Arc::new(SlimTransport::new(config).unwrap())
}

#[tokio::test]
async fn max_sessions_is_enforced() {
    let node = start_node().await;
    let session = AppSession::new(1);
    session
        .add(target("one"))
        .with_transport(slim_transport(&node.endpoint(), "one_1.0.0"))
        .build("one")
        .await
        .unwrap();
    let err = session
        .add(target("two"))
        .with_transport(slim_transport(&node.endpoint(), "two_1.0.0"))
        .build("two")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn duplicate_session_ids_and_topics_are_rejected() {
    let node = start_node().await;
    let session = AppSession::new(10);
    session
        .add(target("alpha"))
        .with_transport(slim_transport(&node.endpoint(), "alpha_1.0.0"))
        .build("a")
        .await
        .unwrap();

    let err = session
        .add(target("beta"))
        .with_transport(slim_transport(&node.endpoint(), "beta_1.0.0"))
        .build("a")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));

    // Same topic (derived from the same card) under a different id.
    let err = session
        .add(target("alpha"))
        .with_transport(slim_transport(&node.endpoint(), "alpha_1.0.0"))
        .build("b")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn failed_child_rolls_back_started_siblings() {
    let node = start_node().await;
    let session = AppSession::new(10);
    let healthy = session
        .add(target("healthy"))
        .with_transport(slim_transport(&node.endpoint(), "healthy_1.0.0"))
        .build("healthy")
        .await
        .unwrap();
    session
        .add(target("doomed"))
        .with_transport(broken_transport("doomed_1.0.0"))
        .build("doomed")
        .await
        .unwrap();

    let err = session.start_all_sessions(false).await.unwrap_err();
    assert!(matches!(err, Error::Connect(_)));
    // The healthy child was stopped during rollback.
    assert_eq!(healthy.state(), ContainerState::Closed);
}

#[tokio::test]
async fn lifecycle_states_progress() {
    let node = start_node().await;
    let session = AppSession::new(10);
    let container = session
        .add(target("lifecycle"))
        .with_transport(slim_transport(&node.endpoint(), "lifecycle_1.0.0"))
        .build("lifecycle")
        .await
        .unwrap();

    assert_eq!(container.state(), ContainerState::Pending);
    session.start_session("lifecycle").await.unwrap();
    assert_eq!(container.state(), ContainerState::Active);
    session.stop_session("lifecycle").await.unwrap();
    assert_eq!(container.state(), ContainerState::Closed);
}

#[tokio::test]
async fn children_stop_in_reverse_order() {
    let node = start_node().await;
    let session = AppSession::new(10);
    let first = session
        .add(target("first"))
        .with_transport(slim_transport(&node.endpoint(), "first_1.0.0"))
        .build("first")
        .await
        .unwrap();
    let second = session
        .add(target("second"))
        .with_transport(slim_transport(&node.endpoint(), "second_1.0.0"))
        .build("second")
        .await
        .unwrap();

    session.start_all_sessions(false).await.unwrap();

    let mut first_changes = first.state_changes();
    let mut second_changes = second.state_changes();
    let stopper = tokio::spawn(async move {
        // Wait for both to close and report which closed first.
        let second_closed = async {
            loop {
                second_changes.changed().await.unwrap();
                if *second_changes.borrow() == ContainerState::Closed {
                    break tokio::time::Instant::now();
                }
            }
        };
        let first_closed = async {
            loop {
                first_changes.changed().await.unwrap();
                if *first_changes.borrow() == ContainerState::Closed {
                    break tokio::time::Instant::now();
                }
            }
        };
        tokio::join!(second_closed, first_closed)
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    session.stop_all_sessions().await;

    let (second_at, first_at) = stopper.await.unwrap();
    assert!(second_at <= first_at, "newest child stops first");
}
