//! # Session Module
//!
//! Everything about connected clients: the JSON message protocol spoken over
//! each WebSocket, and the registry that tracks live connections so state
//! changes can be fanned out to all of them.
//!
//! ## Key Components:
//! - **Protocol**: one tagged enum covering every message in both directions
//! - **Session Registry**: non-owning map of connection id to mailbox address
//!   with best-effort broadcast

pub mod protocol;
pub mod registry;

pub use protocol::WebSocketMessage;
pub use registry::{Outbound, SessionRegistry};
