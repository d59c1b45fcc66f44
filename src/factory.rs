//! Root factory: builds transports, app sessions, and protocol client
//! factories, and owns the logging/tracing bootstrap.

use std::sync::Arc;
use std::sync::Once;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::app::AppSession;
use crate::client::{A2aClientFactory, ClientConfig, FastMcpClientFactory, McpClientFactory};
use crate::error::{Error, Result};
use crate::transport::nats::{NatsTransport, NatsTransportConfig};
use crate::transport::slim::{SlimTransport, SlimTransportConfig};
use crate::transport::Transport;

/// Environment variable naming the OTLP span collector.
pub const OTLP_HTTP_ENDPOINT_ENV: &str = "OTLP_HTTP_ENDPOINT";

/// Default OTLP collector endpoint.
pub const DEFAULT_OTLP_HTTP_ENDPOINT: &str = "http://localhost:4318";

static INIT_LOGGING: Once = Once::new();

/// Unified entry point for building interoperable multi-agent pieces:
/// transports (SLIM, NATS), app sessions, and typed protocol client
/// factories (A2A, MCP, FastMCP).
///
/// ```no_run
/// # use agentmesh::factory::AgentmeshFactory;
/// # use agentmesh::client::ClientConfig;
/// let factory = AgentmeshFactory::new("my-app", false);
/// let session = factory.create_app_session(10);
/// let a2a = factory.a2a(ClientConfig::default());
/// ```
pub struct AgentmeshFactory {
    name: String,
    enable_tracing: bool,
}

impl AgentmeshFactory {
    /// `enable_tracing` wires the span-export hook; the exporter itself is
    /// a pluggable collaborator reached via `OTLP_HTTP_ENDPOINT`.
    pub fn new(name: impl Into<String>, enable_tracing: bool) -> Self {
        INIT_LOGGING.call_once(|| {
            let filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"));
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .try_init();
        });

        let factory = Self {
            name: name.into(),
            enable_tracing,
        };
        if enable_tracing {
            info!(
                service = %factory.name,
                endpoint = %factory.tracing_endpoint(),
                "tracing export enabled"
            );
        }
        factory
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tracing_enabled(&self) -> bool {
        self.enable_tracing
    }

    /// The OTLP collector endpoint spans would be shipped to.
    pub fn tracing_endpoint(&self) -> String {
        std::env::var(OTLP_HTTP_ENDPOINT_ENV)
            .unwrap_or_else(|_| DEFAULT_OTLP_HTTP_ENDPOINT.to_string())
    }

    /// Build a transport by kind. SLIM needs a routable `name`; NATS only
    /// the endpoint.
    pub fn create_transport(
        &self,
        kind: &str,
        endpoint: &str,
        name: Option<&str>,
    ) -> Result<Arc<dyn Transport>> {
        match kind.to_ascii_uppercase().as_str() {
            "SLIM" => {
                let name = name.ok_or_else(|| {
                    Error::Config(
                        "a routable name ('org/namespace/local') is required for SLIM".into(),
                    )
                })?;
                Ok(Arc::new(SlimTransport::new(SlimTransportConfig::new(
                    endpoint, name,
                ))?))
            }
            "NATS" => Ok(Arc::new(NatsTransport::new(NatsTransportConfig::new(
                endpoint,
            )))),
            other => Err(Error::Config(format!(
                "no transport registered for type '{other}'; available: {:?}",
                self.registered_transports()
            ))),
        }
    }

    /// An app session managing up to `max_sessions` containers.
    pub fn create_app_session(&self, max_sessions: usize) -> AppSession {
        AppSession::new(max_sessions)
    }

    /// A2A client factory for the given transport config.
    pub fn a2a(&self, config: ClientConfig) -> A2aClientFactory {
        A2aClientFactory::new(config)
    }

    /// MCP client factory.
    pub fn mcp(&self) -> McpClientFactory {
        McpClientFactory
    }

    /// FastMCP (streamable HTTP) client factory.
    pub fn fast_mcp(&self) -> FastMcpClientFactory {
        FastMcpClientFactory
    }

    pub fn registered_transports(&self) -> Vec<&'static str> {
        vec!["SLIM", "NATS"]
    }

    pub fn registered_protocols(&self) -> Vec<&'static str> {
        vec!["A2A", "MCP", "FastMCP"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registries_list_wellknown_entries() {
        let factory = AgentmeshFactory::new("test", false);
        assert_eq!(factory.registered_transports(), vec!["SLIM", "NATS"]);
        assert_eq!(
            factory.registered_protocols(),
            vec!["A2A", "MCP", "FastMCP"]
        );
    }

    #[test]
    fn transport_creation_validates_inputs() {
        let factory = AgentmeshFactory::new("test", false);
        assert!(factory
            .create_transport("SLIM", "http://localhost:46357", None)
            .is_err());
        assert!(factory
            .create_transport("SLIM", "http://localhost:46357", Some("default/default/x"))
            .is_ok());
        assert!(factory
            .create_transport("NATS", "localhost:4222", None)
            .is_ok());
        assert!(factory.create_transport("MQTT", "x", None).is_err());
    }

    #[test]
    fn tracing_endpoint_defaults() {
        let factory = AgentmeshFactory::new("test", true);
        if std::env::var(OTLP_HTTP_ENDPOINT_ENV).is_err() {
            assert_eq!(factory.tracing_endpoint(), DEFAULT_OTLP_HTTP_ENDPOINT);
        }
    }
}
