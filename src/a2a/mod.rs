//! A2A protocol layer: agent cards, the JSON-RPC engine, server bridges for
//! every transport pattern, and the matching clients.
//!
//! ## Server bridges
//! - [`server::A2aPatternsBridge`] — pub/sub + group chat over SLIM or NATS
//! - [`rpc::A2aSlimRpcBridge`] — native SLIM RPC sessions
//! - [`http::A2aHttpBridge`] — plain HTTP JSON-RPC fallback

pub mod client;
pub mod engine;
pub mod http;
pub mod rpc;
pub mod server;
pub mod types;

pub use client::{A2aClient, A2aExperimentalClient};
pub use engine::{A2aRequestHandler, IdentityVerifier, JsonRpcDispatcher};
pub use rpc::SlimRpcConnectionConfig;
pub use server::agent_topic;
pub use types::AgentCard;
