//! Tunnel orchestration engine.
//!
//! - `types`: Tunnel records, the state machine and health types
//! - `error`: Error taxonomy and failure classification
//! - `config`: Environment-driven configuration
//! - `keys`: SSH key generation and validation
//! - `ports`: Port pools
//! - `registry`: Compare-and-swap tunnel store
//! - `process`: The managed-process interface
//! - `ssh_client`: OpenSSH client process for standard tunnels
//! - `reverse_server`: In-process SSH server for reverse tunnels
//! - `supervisor`: Per-tunnel launch, restart and teardown
//! - `health`: Probes and the health scheduler
//! - `broker`: The public facade

pub mod broker;
pub mod config;
pub mod error;
pub mod health;
pub mod keys;
pub mod ports;
pub mod process;
pub mod registry;
pub mod reverse_server;
pub mod ssh_client;
pub mod supervisor;
pub mod types;

pub use broker::{
    ConnectionDetails, CreateReverseTunnel, CreateStandardTunnel, CreatedTunnel, TunnelBroker,
};
pub use config::BrokerConfig;
pub use error::{BrokerError, BrokerResult};
pub use types::{HealthStatus, Tunnel, TunnelKind, TunnelState, TunnelTraffic};
