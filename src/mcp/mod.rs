//! Model Context Protocol integration: transports, server connections and
//! the [`ToolBridge`] that exposes allowed tools to providers.

pub mod bridge;
pub mod client;
pub mod permissions;
pub mod transport;

pub use bridge::ToolBridge;
