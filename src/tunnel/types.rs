//! Tunnel records, state machine and health types.
//!
//! Every type here is serializable and carries a JSON schema so the MCP layer
//! can hand registry snapshots straight back to callers.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Which side initiates the SSH connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TunnelKind {
    /// The broker dials out to a bastion.
    Standard,
    /// A remote peer dials in to the broker's SSH server.
    Reverse,
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelKind::Standard => write!(f, "STANDARD"),
            TunnelKind::Reverse => write!(f, "REVERSE"),
        }
    }
}

/// Lifecycle state of a tunnel.
///
/// ```text
/// CREATING -> ESTABLISHING -> ACTIVE <-> DEGRADED -> DELETING -> DELETED
///     \             \            \          /
///      +-------------+------------+--> FAILED --> DELETING
/// ```
///
/// `ACTIVE`/`DEGRADED` may also fall back to `ESTABLISHING` when the backing
/// process is stopped (tunnel disabled) and relaunched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TunnelState {
    Creating,
    Establishing,
    Active,
    Degraded,
    Failed,
    Deleting,
    Deleted,
}

impl TunnelState {
    /// `ACTIVE` and `DEGRADED` are the two states in which traffic may flow.
    pub fn is_live(self) -> bool {
        matches!(self, TunnelState::Active | TunnelState::Degraded)
    }

    /// States from which the tunnel can never come back.
    pub fn is_deleting(self) -> bool {
        matches!(self, TunnelState::Deleting | TunnelState::Deleted)
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: TunnelState) -> bool {
        use TunnelState::*;

        match (self, next) {
            (Deleted, _) => false,
            (Deleting, Deleted) => true,
            (Deleting, _) => false,
            (_, Deleting) => true,
            (Creating, Establishing) => true,
            (Establishing, Active) => true,
            (Active, Degraded) | (Degraded, Active) => true,
            (Active, Establishing) | (Degraded, Establishing) => true,
            (Creating | Establishing | Active | Degraded, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Creating => "CREATING",
            TunnelState::Establishing => "ESTABLISHING",
            TunnelState::Active => "ACTIVE",
            TunnelState::Degraded => "DEGRADED",
            TunnelState::Failed => "FAILED",
            TunnelState::Deleting => "DELETING",
            TunnelState::Deleted => "DELETED",
        };
        write!(f, "{}", name)
    }
}

/// Result of a health probe.
///
/// The discriminants are the wire values (WARNING=0, PASSING=1, CRITICAL=2)
/// and do NOT follow severity. Compare with [`HealthStatus::severity`], never
/// with the numeric value; `Ord` is intentionally not derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i32)]
pub enum HealthStatus {
    Warning = 0,
    Passing = 1,
    Critical = 2,
}

impl HealthStatus {
    /// Severity rank: PASSING < WARNING < CRITICAL.
    pub fn severity(self) -> u8 {
        match self {
            HealthStatus::Passing => 0,
            HealthStatus::Warning => 1,
            HealthStatus::Critical => 2,
        }
    }

    /// Wire value of the status.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Decodes a wire value. Unknown values are treated as CRITICAL.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => HealthStatus::Warning,
            1 => HealthStatus::Passing,
            _ => HealthStatus::Critical,
        }
    }

    /// The most severe status in `statuses`, or PASSING for an empty set.
    pub fn worst<I>(statuses: I) -> HealthStatus
    where
        I: IntoIterator<Item = HealthStatus>,
    {
        statuses
            .into_iter()
            .max_by_key(|s| s.severity())
            .unwrap_or(HealthStatus::Passing)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Warning => write!(f, "WARNING"),
            HealthStatus::Passing => write!(f, "PASSING"),
            HealthStatus::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// One named probe result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TunnelHealthcheck {
    /// Stable probe identifier, e.g. `tcp-connect`
    pub id: String,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the probe finished (RFC3339 format)
    pub checked_at: String,
}

impl TunnelHealthcheck {
    pub fn new(id: impl Into<String>, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            id: id.into(),
            status,
            message,
            checked_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// An observable endpoint of a tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TunnelInstance {
    pub host: String,
    pub port: u16,
    /// Worst status across `healthchecks`
    pub status: HealthStatus,
    /// Most recent result per probe, most recent first
    pub healthchecks: Vec<TunnelHealthcheck>,
}

impl TunnelInstance {
    /// A freshly observed endpoint that has not been probed yet.
    pub fn unprobed(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            status: HealthStatus::Warning,
            healthchecks: Vec::new(),
        }
    }

    /// Replaces the probe results and recomputes the aggregate status.
    pub fn apply_healthchecks(&mut self, mut checks: Vec<TunnelHealthcheck>) {
        checks.sort_by(|a, b| b.checked_at.cmp(&a.checked_at));
        let mut seen = std::collections::HashSet::new();
        checks.retain(|c| seen.insert(c.id.clone()));
        self.status = HealthStatus::worst(checks.iter().map(|c| c.status));
        self.healthchecks = checks;
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Connection fields of a broker-initiated tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StandardTunnel {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub service_host: String,
    pub service_port: u16,
}

/// Broker-owned ports of a peer-initiated tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ReverseTunnel {
    /// Where the broker's SSH server listens for the peer
    pub sshd_port: u16,
    /// Remote-forward port the peer must request
    pub tunnel_port: u16,
}

/// Kind-specific payload. The variant is the tunnel's kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TunnelPayload {
    Standard(StandardTunnel),
    Reverse(ReverseTunnel),
}

impl TunnelPayload {
    pub fn kind(&self) -> TunnelKind {
        match self {
            TunnelPayload::Standard(_) => TunnelKind::Standard,
            TunnelPayload::Reverse(_) => TunnelKind::Reverse,
        }
    }
}

/// Relay totals of a reverse tunnel since it was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TunnelTraffic {
    /// Forwarded connections opened to the peer
    pub connections: u64,
    /// Bytes from local clients to the peer, counted on close
    pub bytes_sent: u64,
    /// Bytes from the peer to local clients, counted on close
    pub bytes_received: u64,
    /// `tcpip-forward` requests received, refused ones included
    pub forward_requests: u64,
}

/// A provisioned forwarding path as stored in the registry.
///
/// Holds public key material only. Private keys live with the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Tunnel {
    pub id: String,
    /// When the tunnel was created (RFC3339 format)
    pub created_at: String,
    pub enabled: bool,
    pub bind_port: u16,
    pub state: TunnelState,
    pub payload: TunnelPayload,
    /// OpenSSH-encoded public keys associated with the tunnel
    pub public_keys: Vec<String>,
    /// SHA256 fingerprints matching `public_keys`
    pub key_fingerprints: Vec<String>,
    /// Last process diagnostic, kept on FAILED
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub instances: Vec<TunnelInstance>,
}

impl Tunnel {
    pub fn kind(&self) -> TunnelKind {
        self.payload.kind()
    }

    /// Instances ordered PASSING, WARNING, CRITICAL.
    pub fn sorted_instances(&self) -> Vec<TunnelInstance> {
        let mut instances = self.instances.clone();
        instances.sort_by_key(|i| i.status.severity());
        instances
    }

    /// Whether any instance currently reports CRITICAL.
    pub fn has_critical_instance(&self) -> bool {
        self.instances
            .iter()
            .any(|i| i.status == HealthStatus::Critical)
    }
}
