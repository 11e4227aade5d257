//! Serializable response types for the MCP tunnel tools.
//!
//! Tunnel records themselves are returned as-is from `tunnel::types`; this
//! module only adds the envelopes that have no engine counterpart.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::tunnel::Tunnel;

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct TunnelListResponse {
    pub tunnels: Vec<Tunnel>,
    pub count: usize,
    /// Kind filter that was applied, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl TunnelListResponse {
    pub fn new(tunnels: Vec<Tunnel>, kind: Option<String>) -> Self {
        Self {
            count: tunnels.len(),
            tunnels,
            kind,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct DeleteTunnelResponse {
    pub tunnel_id: String,
    pub deleted: bool,
    pub message: String,
}
