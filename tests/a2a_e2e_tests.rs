//! End-to-end A2A scenarios over the embedded SLIM node: unary RPC,
//! pub/sub patterns, broadcast fan-out, group chat, and negotiation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use agentmesh::a2a::engine::A2aRequestHandler;
use agentmesh::a2a::rpc::SlimRpcConnectionConfig;
use agentmesh::a2a::types::{
    AgentCapabilities, AgentCard, AgentSkill, JsonRpcError, Message, MessageSendParams,
    SendMessageResponse,
};
use agentmesh::app::{AppSession, ServeTarget};
use agentmesh::client::{A2aClientFactory, ClientConfig};
use agentmesh::transport::slim::node::{SlimNode, SlimNodeHandle};
use agentmesh::transport::slim::{SlimTransport, SlimTransportConfig};
use agentmesh::transport::{ConversationOptions, Transport};
use agentmesh::Error;

const SECRET: &str = "an-integration-test-secret-of-32b!";
const WEATHER_REPORT: &str = "The weather is sunny with a high of 75F.";

struct WeatherAgent;

#[async_trait]
impl A2aRequestHandler for WeatherAgent {
    async fn on_message_send(
        &self,
        _params: MessageSendParams,
    ) -> Result<SendMessageResponse, JsonRpcError> {
        Ok(SendMessageResponse::Message(Message::agent_text(
            WEATHER_REPORT,
        )))
    }
}

/// Responds with an ack until the third round, then delivers.
struct CountingAgent {
    label: String,
    seen: AtomicUsize,
}

#[async_trait]
impl A2aRequestHandler for CountingAgent {
    async fn on_message_send(
        &self,
        _params: MessageSendParams,
    ) -> Result<SendMessageResponse, JsonRpcError> {
        let count = self.seen.fetch_add(1, Ordering::SeqCst);
        let text = if count >= 2 {
            "DELIVERED".to_string()
        } else {
            format!("{} ack {count}", self.label)
        };
        Ok(SendMessageResponse::Message(Message::agent_text(text)))
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

fn slim_client_config(endpoint: &str, name: &str) -> SlimTransportConfig {
    let mut config = SlimTransportConfig::new(endpoint, format!("default/default/{name}"));
    config.shared_secret = SECRET.to_string();
    config
}

fn weather_card(url: &str, preferred: &str) -> AgentCard {
    AgentCard {
        name: "Weather Agent".to_string(),
        description: "An agent that provides weather reports".to_string(),
        url: url.to_string(),
        version: "1.0.0".to_string(),
        preferred_transport: Some(preferred.to_string()),
        additional_interfaces: vec![],
        capabilities: AgentCapabilities {
            streaming: true,
            push_notifications: false,
        },
        skills: vec![AgentSkill {
            id: "weather_report".to_string(),
            name: "Returns weather report".to_string(),
            description: "Provides a simple weather report".to_string(),
            tags: vec!["weather".to_string(), "report".to_string()],
            examples: vec!["What's the weather like?".to_string()],
        }],
        default_input_modes: vec!["text".to_string()],
        default_output_modes: vec!["text".to_string()],
        provider: None,
    }
}

fn simple_card(name: &str) -> AgentCard {
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

#[tokio::test]
async fn unary_a2a_over_slim_rpc() {
    let node = start_node().await;

    let session = AppSession::new(10);
    let server_config = SlimRpcConnectionConfig {
        identity: "default/default/weather-rpc".to_string(),
        shared_secret: SECRET.to_string(),
        endpoint: node.endpoint(),
        tls_insecure: true,
    };
    session
        .add(ServeTarget::A2aRpc {
            handler: Arc::new(WeatherAgent),
            card: weather_card("slim://default/default/weather-rpc", "slimrpc"),
            config: server_config,
        })
        .build("weather-rpc")
        .await
        .unwrap();
    session.start_all_sessions(false).await.unwrap();

    let client_config = ClientConfig {
        slim_rpc: Some(SlimRpcConnectionConfig {
            identity: "default/default/weather-client".to_string(),
            shared_secret: SECRET.to_string(),
            endpoint: node.endpoint(),
            tls_insecure: true,
        }),
        ..Default::default()
    };
    let factory = A2aClientFactory::new(client_config);
    let client = factory
        .create(&weather_card("slim://default/default/weather-rpc", "slimrpc"))
        .await
        .unwrap();
    assert!(client.experimental().is_none());

    let response = tokio::time::timeout(Duration::from_secs(5), client.send_text("hi"))
        .await
        .expect("round trip within 5s")
        .unwrap();
    assert_eq!(response.text(), WEATHER_REPORT);

    session.stop_all_sessions().await;
}

#[tokio::test]
async fn unary_a2a_over_slim_patterns() {
    let node = start_node().await;

    // The server transport identity matches the card-derived topic.
    let session = AppSession::new(10);
    session
        .add(ServeTarget::A2a {
            handler: Arc::new(WeatherAgent),
            card: weather_card("", ""),
        })
        .with_transport(slim_transport(&node.endpoint(), "Weather_Agent_1.0.0"))
        .build("weather-patterns")
        .await
        .unwrap();
    session.start_all_sessions(false).await.unwrap();

    let factory = A2aClientFactory::new(ClientConfig {
        slim: Some(slim_client_config(&node.endpoint(), "weather-client")),
        ..Default::default()
    });
    // The served card advertises the derived topic in its URL.
    let client = factory
        .create(&weather_card("slim://Weather_Agent_1.0.0", "slimpatterns"))
        .await
        .unwrap();
    assert!(client.experimental().is_some());

    let response = client.send_text("what's the weather?").await.unwrap();
    assert_eq!(response.text(), WEATHER_REPORT);

    session.stop_all_sessions().await;
}

#[tokio::test]
async fn broadcast_fan_out_with_partial_results() {
    let node = start_node().await;

    let session = AppSession::new(10);
    for name in ["agent1", "agent2", "agent3"] {
        session
            .add(ServeTarget::A2a {
                handler: Arc::new(CountingAgent {
                    label: name.to_string(),
                    seen: AtomicUsize::new(1000), // always past the ack phase
                }),
                card: simple_card(name),
            })
            .with_transport(slim_transport(&node.endpoint(), name))
            .with_topic(name)
            .build(name)
            .await
            .unwrap();
    }
    session.start_all_sessions(false).await.unwrap();

    let factory = A2aClientFactory::new(ClientConfig {
        slim: Some(slim_client_config(&node.endpoint(), "broadcast-client")),
        ..Default::default()
    });
    let client = factory
        .create(&{
            let mut card = simple_card("agent1");
            card.preferred_transport = Some("slimpatterns".to_string());
            card.url = "slim://agent1".to_string();
            card
        })
        .await
        .unwrap();
    let experimental = client.experimental().unwrap();

    let recipients: Vec<String> = ["agent1", "agent2", "agent3"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let replies = experimental
        .broadcast_message(
            "status-check",
            "Status check",
            &recipients,
            Some(3),
            Duration::from_secs(30),
        )
        .await
        .unwrap();
    assert_eq!(replies.len(), 3);

    // One server offline: same expectation, shorter timeout, two replies.
    session.stop_session("agent2").await.unwrap();
    let replies = experimental
        .broadcast_message(
            "status-check",
            "Status check",
            &recipients,
            Some(3),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert_eq!(replies.len(), 2);

    session.stop_all_sessions().await;
}

#[tokio::test]
async fn groupchat_terminates_on_delivered() {
    let node = start_node().await;

    let session = AppSession::new(10);
    for name in ["agent_a", "agent_b"] {
        session
            .add(ServeTarget::A2a {
                handler: Arc::new(CountingAgent {
                    label: name.to_string(),
                    seen: AtomicUsize::new(0),
                }),
                card: simple_card(name),
            })
            .with_transport(slim_transport(&node.endpoint(), name))
            .with_topic(name)
            .build(name)
            .await
            .unwrap();
    }
    session.start_all_sessions(false).await.unwrap();

    let factory = A2aClientFactory::new(ClientConfig {
        slim: Some(slim_client_config(&node.endpoint(), "chat-moderator")),
        ..Default::default()
    });
    let client = factory
        .create(&{
            let mut card = simple_card("agent_a");
            card.preferred_transport = Some("slimpatterns".to_string());
            card.url = "slim://agent_a".to_string();
            card
        })
        .await
        .unwrap();
    let experimental = client.experimental().unwrap();

    let transcript = experimental
        .start_groupchat(
            "group-room",
            &["agent_a".to_string(), "agent_b".to_string()],
            "hello agents",
            ConversationOptions {
                end_message: "DELIVERED".to_string(),
                timeout: Duration::from_secs(15),
                muted_participants: vec![],
            },
        )
        .await
        .unwrap();

    assert!(!transcript.is_empty());
    assert!(transcript.last().unwrap().text().contains("DELIVERED"));

    session.stop_all_sessions().await;
}

#[tokio::test]
async fn negotiation_failure_is_reported() {
    let factory = A2aClientFactory::new(ClientConfig {
        nats: Some(agentmesh::transport::nats::NatsTransportConfig::default()),
        ..Default::default()
    });
    let err = factory
        .create(&weather_card("slim://default/default/weather", "slimrpc"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoCompatibleTransport { .. }));
}

#[tokio::test]
async fn http_bridge_serves_card_and_rpc() {
    use agentmesh::a2a::engine::JsonRpcDispatcher;
    use agentmesh::a2a::http::A2aHttpBridge;
    use agentmesh::app::ServerBridge;

    let bridge = A2aHttpBridge::new(
        JsonRpcDispatcher::new(Arc::new(WeatherAgent)),
        weather_card("http://127.0.0.1:0", "jsonrpc"),
        "127.0.0.1",
        0,
    );
    bridge.setup().await.unwrap();
    let addr = bridge.local_addr().unwrap();
    let base_url = format!("http://{addr}");

    let factory = A2aClientFactory::new(ClientConfig {
        http_base_url: Some(base_url.clone()),
        ..Default::default()
    });
    let client = factory.connect(&base_url).await.unwrap();
    let response = client.send_text("hello").await.unwrap();
    assert_eq!(response.text(), WEATHER_REPORT);

    bridge.teardown().await.unwrap();
}
