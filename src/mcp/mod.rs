//! MCP surface of the tunnel broker.
//!
//! - `types`: Serializable response envelopes for MCP tools
//! - `commands`: MCP tool implementations

pub mod commands;
pub mod types;

pub use commands::TunnelTools;
