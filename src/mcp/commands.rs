//! MCP tunnel tools.
//!
//! Thin mapping from MCP tool calls onto [`TunnelBroker`] operations:
//!
//! - `create_standard_tunnel`: Dial out to a bastion and forward a service locally
//! - `create_reverse_tunnel`: Open an SSH server a remote peer forwards into
//! - `get_tunnel`: Read a tunnel with its health-checked instances
//! - `list_tunnels`: List tunnels, optionally filtered by kind
//! - `update_tunnel`: Enable or disable a tunnel
//! - `get_connection_details`: What a peer needs to open a reverse tunnel
//! - `get_tunnel_traffic`: Relay totals of a reverse tunnel
//! - `delete_tunnel`: Tear a tunnel down and release its ports

use std::sync::Arc;

use poem_mcpserver::{Tools, tool::StructuredContent};
use tracing::{info, warn};

use super::types::{DeleteTunnelResponse, TunnelListResponse};
use crate::tunnel::{
    BrokerError, ConnectionDetails, CreateReverseTunnel, CreateStandardTunnel, CreatedTunnel,
    Tunnel, TunnelBroker, TunnelKind, TunnelTraffic,
};

const DEFAULT_SSH_PORT: u16 = 22;

/// MCP tool implementation backed by a shared [`TunnelBroker`].
#[derive(Clone)]
pub struct TunnelTools {
    broker: Arc<TunnelBroker>,
}

impl TunnelTools {
    pub fn new(broker: Arc<TunnelBroker>) -> Self {
        Self { broker }
    }
}

/// Renders a broker error as `<code>: <message>` for MCP callers.
pub(crate) fn render_error(err: BrokerError) -> String {
    format!("{}: {}", err.code(), err)
}

/// Parses the `kind` filter of `list_tunnels`. Case-insensitive.
pub(crate) fn parse_kind(kind: Option<&str>) -> Result<Option<TunnelKind>, String> {
    let Some(kind) = kind.map(str::trim).filter(|k| !k.is_empty()) else {
        return Ok(None);
    };
    match kind.to_ascii_uppercase().as_str() {
        "STANDARD" => Ok(Some(TunnelKind::Standard)),
        "REVERSE" => Ok(Some(TunnelKind::Reverse)),
        other => Err(render_error(BrokerError::InvalidArgument(format!(
            "unknown tunnel kind '{}', expected STANDARD or REVERSE",
            other
        )))),
    }
}

#[Tools]
impl TunnelTools {
    /// Create a STANDARD tunnel: the broker connects to an SSH bastion and
    /// forwards `service_host:service_port` (as seen from the bastion) to a
    /// local bind port.
    ///
    /// Returns immediately with the tunnel in CREATING or ESTABLISHING state.
    /// Poll `get_tunnel` until the state is ACTIVE. Either supply
    /// `private_keys` or set `create_key_pair=true`; a generated public key is
    /// returned once and must be authorized on the bastion.
    #[allow(clippy::too_many_arguments)]
    async fn create_standard_tunnel(
        &self,
        /// SSH bastion hostname or IP address
        ssh_host: String,
        /// SSH bastion port (default: 22)
        ssh_port: Option<u16>,
        /// SSH username (default: env TUNNEL_SSH_USER)
        ssh_user: Option<String>,
        /// Host of the service to reach, resolved on the bastion side
        service_host: String,
        /// Port of the service to reach
        service_port: u16,
        /// OpenSSH-format private keys used to authenticate (mutually exclusive with create_key_pair)
        private_keys: Option<Vec<String>>,
        /// Generate a fresh ed25519 key pair for this tunnel (default: false)
        create_key_pair: Option<bool>,
    ) -> Result<StructuredContent<CreatedTunnel>, String> {
        info!(
            "Creating standard tunnel via {}:{} to {}:{}",
            ssh_host,
            ssh_port.unwrap_or(DEFAULT_SSH_PORT),
            service_host,
            service_port
        );
        let request = CreateStandardTunnel {
            ssh_host,
            ssh_port: ssh_port.unwrap_or(DEFAULT_SSH_PORT),
            ssh_user,
            service_host,
            service_port,
            private_keys: private_keys.unwrap_or_default(),
            create_key_pair: create_key_pair.unwrap_or(false),
        };
        self.broker
            .create_standard_tunnel(request)
            .await
            .map(StructuredContent)
            .map_err(|e| {
                warn!("Failed to create standard tunnel: {}", e);
                render_error(e)
            })
    }

    /// Create a REVERSE tunnel: the broker starts an SSH server on a dedicated
    /// port and a remote peer opens a remote forward into it.
    ///
    /// Either supply the peer's `public_keys` or set `create_key_pair=true`;
    /// a generated private key is returned exactly once. Use
    /// `get_connection_details` for the command the peer should run.
    async fn create_reverse_tunnel(
        &self,
        /// OpenSSH-format public keys the peer may authenticate with (mutually exclusive with create_key_pair)
        public_keys: Option<Vec<String>>,
        /// Generate a fresh ed25519 key pair for the peer (default: false)
        create_key_pair: Option<bool>,
    ) -> Result<StructuredContent<CreatedTunnel>, String> {
        info!("Creating reverse tunnel");
        let request = CreateReverseTunnel {
            public_keys: public_keys.unwrap_or_default(),
            create_key_pair: create_key_pair.unwrap_or(false),
        };
        self.broker
            .create_reverse_tunnel(request)
            .await
            .map(StructuredContent)
            .map_err(|e| {
                warn!("Failed to create reverse tunnel: {}", e);
                render_error(e)
            })
    }

    /// Get a tunnel with its state, last error and instances.
    ///
    /// Instances are ordered PASSING first, then WARNING, then CRITICAL. Each
    /// carries the most recent result per health probe.
    async fn get_tunnel(
        &self,
        /// Tunnel ID returned from a create call
        tunnel_id: String,
    ) -> Result<StructuredContent<Tunnel>, String> {
        self.broker
            .get_tunnel(&tunnel_id)
            .map(StructuredContent)
            .map_err(render_error)
    }

    /// List all tunnels, oldest first.
    async fn list_tunnels(
        &self,
        /// Optional kind filter: STANDARD or REVERSE
        kind: Option<String>,
    ) -> Result<StructuredContent<TunnelListResponse>, String> {
        let filter = parse_kind(kind.as_deref())?;
        let tunnels = self.broker.list_tunnels(filter);
        Ok(StructuredContent(TunnelListResponse::new(
            tunnels,
            filter.map(|k| k.to_string()),
        )))
    }

    /// Enable or disable a tunnel.
    ///
    /// Disabling stops the backing SSH process and pauses health checks while
    /// keeping the tunnel's ports reserved. Enabling relaunches it.
    async fn update_tunnel(
        &self,
        /// Tunnel ID to update
        tunnel_id: String,
        /// Whether the tunnel should be running
        enabled: bool,
    ) -> Result<StructuredContent<Tunnel>, String> {
        info!("Setting tunnel {} enabled={}", tunnel_id, enabled);
        self.broker
            .set_tunnel_enabled(&tunnel_id, enabled)
            .map(StructuredContent)
            .map_err(render_error)
    }

    /// Get the host, SSH server port and remote-forward port a peer must use
    /// for a REVERSE tunnel, with an example `ssh` command line.
    async fn get_connection_details(
        &self,
        /// Tunnel ID of a REVERSE tunnel
        tunnel_id: String,
    ) -> Result<StructuredContent<ConnectionDetails>, String> {
        self.broker
            .connection_details(&tunnel_id)
            .map(StructuredContent)
            .map_err(render_error)
    }

    /// Get relay totals of a REVERSE tunnel: forwarded connections, bytes in
    /// each direction and remote-forward requests since creation.
    ///
    /// Byte counts are added when a forwarded connection closes.
    async fn get_tunnel_traffic(
        &self,
        /// Tunnel ID of a REVERSE tunnel
        tunnel_id: String,
    ) -> Result<StructuredContent<TunnelTraffic>, String> {
        self.broker
            .tunnel_traffic(&tunnel_id)
            .map(StructuredContent)
            .map_err(render_error)
    }

    /// Delete a tunnel: stop its SSH process and release its ports.
    ///
    /// Deleting a tunnel that is already being deleted succeeds.
    async fn delete_tunnel(
        &self,
        /// Tunnel ID to delete
        tunnel_id: String,
    ) -> Result<StructuredContent<DeleteTunnelResponse>, String> {
        info!("Deleting tunnel {}", tunnel_id);
        match self.broker.delete_tunnel(&tunnel_id).await {
            Ok(()) => Ok(StructuredContent(DeleteTunnelResponse {
                message: format!("Tunnel {} deleted", tunnel_id),
                tunnel_id,
                deleted: true,
            })),
            Err(e) => {
                warn!("Failed to delete tunnel {}: {}", tunnel_id, e);
                Err(render_error(e))
            }
        }
    }
}
