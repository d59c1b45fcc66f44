//! SLIM: a session-oriented, identity-authenticated message fabric with
//! request/reply, fan-out, and moderated group-chat sessions.
//!
//! The module carries the whole stack: the wire codec ([`wire`]), the client
//! connection and session handles ([`connection`]), the [`Transport`]
//! implementation ([`transport`]), and an embeddable routing node
//! ([`node`]) so a deployment or test can run the fabric in-process.
//!
//! [`Transport`]: crate::transport::Transport

pub mod connection;
pub mod node;
pub mod transport;
pub mod wire;

pub use connection::{SlimConnection, SlimSession};
pub use node::{SlimNode, SlimNodeHandle};
pub use transport::{SlimTransport, SlimTransportConfig, DEFAULT_SLIM_ENDPOINT};
pub use wire::SessionConfig;
