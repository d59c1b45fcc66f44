//! agentmesh - transport-agnostic bridge/factory SDK for agent protocols
//!
//! Runs agent application protocols (A2A, MCP) unchanged over pluggable
//! message transports (SLIM, NATS), plain HTTP, and mixes of the three.
//! Servers bind an agent implementation to a bridge inside a supervised
//! [`app::AppSession`]; clients negotiate a transport from an agent card
//! through the [`factory::AgentmeshFactory`].

pub mod a2a;
pub mod app;
pub mod client;
pub mod error;
pub mod factory;
pub mod mcp;
pub mod message;
pub mod topic;
pub mod transport;

pub use error::{Error, Result};
pub use factory::AgentmeshFactory;
pub use message::Message;
pub use topic::RoutableName;
