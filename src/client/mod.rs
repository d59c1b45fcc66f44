//! Client-side configuration, transport negotiation, and the protocol
//! client factories.

use std::sync::Arc;

use tracing::{debug, info};

use crate::a2a::client::{A2aClient, A2aExperimentalClient};
use crate::a2a::rpc::SlimRpcConnectionConfig;
use crate::a2a::types::AgentCard;
use crate::error::{Error, Result};
use crate::mcp::client::McpClient;
use crate::mcp::http::FastMcpHttpClient;
use crate::topic::topic_from_url;
use crate::transport::nats::{NatsTransport, NatsTransportConfig};
use crate::transport::slim::{SlimTransport, SlimTransportConfig};
use crate::transport::Transport;

/// Transport variants a client can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportTag {
    SlimRpc,
    SlimPatterns,
    NatsPatterns,
    JsonRpc,
}

impl TransportTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportTag::SlimRpc => "slimrpc",
            TransportTag::SlimPatterns => "slimpatterns",
            TransportTag::NatsPatterns => "natspatterns",
            TransportTag::JsonRpc => "jsonrpc",
        }
    }

    /// Parse a card-declared tag; case-insensitive, unknown tags are
    /// `None`.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "slimrpc" => Some(TransportTag::SlimRpc),
            "slimpatterns" => Some(TransportTag::SlimPatterns),
            "natspatterns" => Some(TransportTag::NatsPatterns),
            "jsonrpc" | "http+json" => Some(TransportTag::JsonRpc),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransportTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-transport client configuration. The populated fields define which
/// transports this client can negotiate.
#[derive(Default)]
pub struct ClientConfig {
    /// SLIM patterns transport config.
    pub slim: Option<SlimTransportConfig>,
    /// NATS patterns transport config.
    pub nats: Option<NatsTransportConfig>,
    /// Native SLIM RPC connection config.
    pub slim_rpc: Option<SlimRpcConnectionConfig>,
    /// Base URL for plain HTTP JSON-RPC; when `None` the card URL is used.
    pub http_base_url: Option<String>,
    /// Enable the HTTP fallback even without an explicit base URL.
    pub allow_http: bool,
    /// Prefer the client's transport order over the server's.
    pub use_client_preference: bool,
}

impl ClientConfig {
    /// Tags this config can actually build, in local preference order.
    /// An empty config falls back to plain JSON-RPC.
    pub fn supported_transports(&self) -> Vec<TransportTag> {
        let mut supported = Vec::new();
        if self.slim_rpc.is_some() {
            supported.push(TransportTag::SlimRpc);
        }
        if self.slim.is_some() {
            supported.push(TransportTag::SlimPatterns);
        }
        if self.nats.is_some() {
            supported.push(TransportTag::NatsPatterns);
        }
        if self.http_base_url.is_some() || self.allow_http || supported.is_empty() {
            supported.push(TransportTag::JsonRpc);
        }
        supported
    }
}

/// Deterministic negotiation: intersect the card's declared transports with
/// the config's supported set. Server preference wins unless the config
/// says otherwise.
pub fn negotiate(card: &AgentCard, config: &ClientConfig) -> Result<(TransportTag, String)> {
    let server: Vec<(TransportTag, String)> = card
        .declared_transports()
        .into_iter()
        .filter_map(|(tag, url)| TransportTag::parse(&tag).map(|t| (t, url)))
        .collect();
    let client = config.supported_transports();

    let selected = if config.use_client_preference {
        client.iter().find_map(|tag| {
            server
                .iter()
                .find(|(server_tag, _)| server_tag == tag)
                .cloned()
        })
    } else {
        server
            .iter()
            .find(|(tag, _)| client.contains(tag))
            .cloned()
    };

    selected.ok_or_else(|| Error::NoCompatibleTransport {
        server: server.iter().map(|(t, _)| t.to_string()).collect(),
        client: client.iter().map(|t| t.to_string()).collect(),
    })
}

/// A negotiated A2A client: experimental for patterns transports, standard
/// otherwise.
#[derive(Debug)]
pub enum NegotiatedA2aClient {
    Standard(A2aClient),
    Experimental(A2aExperimentalClient),
}

impl NegotiatedA2aClient {
    pub fn client(&self) -> &A2aClient {
        match self {
            NegotiatedA2aClient::Standard(client) => client,
            NegotiatedA2aClient::Experimental(client) => client,
        }
    }

    /// The extended pattern surface, when the negotiated transport has one.
    pub fn experimental(&self) -> Option<&A2aExperimentalClient> {
        match self {
            NegotiatedA2aClient::Standard(_) => None,
            NegotiatedA2aClient::Experimental(client) => Some(client),
        }
    }
}

impl std::ops::Deref for NegotiatedA2aClient {
    type Target = A2aClient;

    fn deref(&self) -> &Self::Target {
        self.client()
    }
}

/// Card-driven A2A client factory. Reusable: call
/// [`A2aClientFactory::create`] once per agent.
pub struct A2aClientFactory {
    config: ClientConfig,
}

impl A2aClientFactory {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn protocol_type(&self) -> &'static str {
        "A2A"
    }

    /// Negotiate the transport for `card` and build the matching client.
    pub async fn create(&self, card: &AgentCard) -> Result<NegotiatedA2aClient> {
        let (tag, url) = negotiate(card, &self.config)?;
        let topic = topic_from_url(&url);
        info!(agent = %card.name, transport = %tag, topic = %topic, "negotiated A2A transport");

        match tag {
            TransportTag::SlimPatterns => {
                let config = self.config.slim.clone().ok_or_else(|| {
                    Error::Config("negotiated slimpatterns without a SLIM config".into())
                })?;
                let transport: Arc<dyn Transport> = Arc::new(SlimTransport::new(config)?);
                transport.setup().await?;
                Ok(NegotiatedA2aClient::Experimental(
                    A2aExperimentalClient::new(transport, topic),
                ))
            }
            TransportTag::NatsPatterns => {
                let config = self.config.nats.clone().ok_or_else(|| {
                    Error::Config("negotiated natspatterns without a NATS config".into())
                })?;
                let transport: Arc<dyn Transport> = Arc::new(NatsTransport::new(config));
                transport.setup().await?;
                Ok(NegotiatedA2aClient::Experimental(
                    A2aExperimentalClient::new(transport, topic),
                ))
            }
            TransportTag::SlimRpc => {
                let config = self.config.slim_rpc.clone().ok_or_else(|| {
                    Error::Config("negotiated slimrpc without a connection config".into())
                })?;
                Ok(NegotiatedA2aClient::Standard(
                    A2aClient::slim_rpc(&config, &topic).await?,
                ))
            }
            TransportTag::JsonRpc => {
                let url = self
                    .config
                    .http_base_url
                    .clone()
                    .unwrap_or(url);
                debug!(url = %url, "building HTTP JSON-RPC client");
                Ok(NegotiatedA2aClient::Standard(A2aClient::http(url)))
            }
        }
    }

    /// Resolve the card from a well-known HTTP URL, then create.
    pub async fn connect(&self, base_url: &str) -> Result<NegotiatedA2aClient> {
        let card = A2aClient::resolve_card(base_url).await?;
        self.create(&card).await
    }
}

/// Factory for MCP clients over message transports.
pub struct McpClientFactory;

impl McpClientFactory {
    pub fn protocol_type(&self) -> &'static str {
        "MCP"
    }

    /// Open the memory-stream client on `topic` over `transport` and run
    /// the initialize handshake.
    pub async fn create_client(
        &self,
        topic: &str,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<McpClient>> {
        McpClient::connect(transport, topic).await
    }
}

/// Factory for FastMCP streamable-HTTP clients.
pub struct FastMcpClientFactory;

impl FastMcpClientFactory {
    pub fn protocol_type(&self) -> &'static str {
        "FastMCP"
    }

    /// Perform the two-POST handshake against `url`.
    pub async fn create_client(&self, url: &str) -> Result<FastMcpHttpClient> {
        FastMcpHttpClient::connect(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::a2a::types::{AgentCapabilities, AgentInterface};

    fn card_with(preferred: &str, extra: &[(&str, &str)]) -> AgentCard {
        AgentCard {
            name: "agent".to_string(),
            description: String::new(),
            url: format!("{}://default/default/agent", scheme_for(preferred)),
            version: "1.0.0".to_string(),
            preferred_transport: Some(preferred.to_string()),
            additional_interfaces: extra
                .iter()
                .map(|(t, u)| AgentInterface {
                    transport: t.to_string(),
                    url: u.to_string(),
                })
                .collect(),
            capabilities: AgentCapabilities::default(),
            skills: vec![],
            default_input_modes: vec![],
            default_output_modes: vec![],
            provider: None,
        }
    }

    fn scheme_for(tag: &str) -> &'static str {
        match tag {
            "natspatterns" => "nats",
            "jsonrpc" => "http",
            _ => "slim",
        }
    }

    fn slim_config() -> SlimTransportConfig {
        SlimTransportConfig::new("http://localhost:46357", "default/default/client")
    }

    #[test]
    fn negotiation_is_deterministic_and_server_preferred() {
        let card = card_with(
            "slimpatterns",
            &[("natspatterns", "nats://default/default/agent")],
        );
        let config = ClientConfig {
            slim: Some(slim_config()),
            nats: Some(NatsTransportConfig::default()),
            ..Default::default()
        };
        for _ in 0..3 {
            let (tag, url) = negotiate(&card, &config).unwrap();
            assert_eq!(tag, TransportTag::SlimPatterns);
            assert_eq!(url, "slim://default/default/agent");
        }
    }

    #[test]
    fn client_preference_flips_selection() {
        let card = card_with(
            "slimpatterns",
            &[("natspatterns", "nats://default/default/agent")],
        );
        let config = ClientConfig {
            slim: Some(slim_config()),
            nats: Some(NatsTransportConfig::default()),
            use_client_preference: true,
            ..Default::default()
        };
        // Local order lists slimpatterns first, so preference still lands
        // there; drop SLIM and NATS wins.
        let (tag, _) = negotiate(&card, &config).unwrap();
        assert_eq!(tag, TransportTag::SlimPatterns);

        let config = ClientConfig {
            nats: Some(NatsTransportConfig::default()),
            use_client_preference: true,
            ..Default::default()
        };
        let (tag, _) = negotiate(&card, &config).unwrap();
        assert_eq!(tag, TransportTag::NatsPatterns);
    }

    #[test]
    fn disjoint_sets_fail_with_no_compatible_transport() {
        let card = card_with("slimrpc", &[]);
        let config = ClientConfig {
            nats: Some(NatsTransportConfig::default()),
            ..Default::default()
        };
        let err = negotiate(&card, &config).unwrap_err();
        match err {
            Error::NoCompatibleTransport { server, client } => {
                assert_eq!(server, vec!["slimrpc".to_string()]);
                assert_eq!(client, vec!["natspatterns".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_config_falls_back_to_jsonrpc() {
        let config = ClientConfig::default();
        assert_eq!(config.supported_transports(), vec![TransportTag::JsonRpc]);

        let card = card_with("jsonrpc", &[]);
        let (tag, _) = negotiate(&card, &config).unwrap();
        assert_eq!(tag, TransportTag::JsonRpc);
    }

    #[test]
    fn unknown_card_tags_are_skipped() {
        let card = card_with("grpc", &[("jsonrpc", "http://localhost:1")]);
        let config = ClientConfig::default();
        let (tag, url) = negotiate(&card, &config).unwrap();
        assert_eq!(tag, TransportTag::JsonRpc);
        assert_eq!(url, "http://localhost:1");
    }
}
