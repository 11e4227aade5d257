//! Broker facade: the only entry point callers use.
//!
//! Creates validate, resolve keys, allocate ports and insert a CREATING record
//! synchronously, then hand the tunnel to a supervisor and a health scheduler
//! task and return without waiting for establishment. Callers poll
//! [`TunnelBroker::get_tunnel`] until the tunnel is ACTIVE and its instance
//! PASSING.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::BrokerConfig;
use super::error::{BrokerError, BrokerResult};
use super::health::{HealthScheduler, Probe, default_probes};
use super::keys::{self, KeySource, PublicKeyMaterial};
use super::ports::{PortAllocator, PortLease, PortPool};
use super::process::ManagedProcess;
use super::registry::{DeleteStart, MemoryTunnelStore, TunnelStore};
use super::reverse_server::{ReverseServerProcess, ReverseServerSpec, TrafficCounters};
use super::ssh_client::{SshClientProcess, SshClientSpec};
use super::supervisor::Supervisor;
use super::types::{
    ReverseTunnel, StandardTunnel, Tunnel, TunnelKind, TunnelPayload, TunnelState, TunnelTraffic,
};

/// Extra time granted to the supervisor on top of the terminate grace
const TEARDOWN_SLACK: Duration = Duration::from_secs(1);

/// Parameters of `CreateStandardTunnel`.
#[derive(Debug, Clone, Default)]
pub struct CreateStandardTunnel {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: Option<String>,
    pub service_host: String,
    pub service_port: u16,
    pub private_keys: Vec<String>,
    pub create_key_pair: bool,
}

/// Parameters of `CreateReverseTunnel`.
#[derive(Debug, Clone, Default)]
pub struct CreateReverseTunnel {
    pub public_keys: Vec<String>,
    pub create_key_pair: bool,
}

/// A freshly created tunnel plus any generated key material.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CreatedTunnel {
    pub tunnel: Tunnel,
    /// Generated public key to install on the bastion (standard tunnels)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Generated private key for the peer (reverse tunnels). Returned once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

/// What a remote peer needs to open a reverse tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionDetails {
    pub tunnel_id: String,
    /// Address the broker's SSH server listens on
    pub host: String,
    pub sshd_port: u16,
    /// Port to request with `-R`
    pub tunnel_port: u16,
    /// Where the forwarded service becomes reachable on the broker
    pub bind_port: u16,
    /// Example OpenSSH invocation for the peer
    pub command: String,
}

/// What to launch for a tunnel.
pub enum LaunchPlan {
    Standard {
        spec: SshClientSpec,
        private_keys: Vec<String>,
    },
    Reverse {
        spec: ReverseServerSpec,
        trusted: Vec<PublicKeyMaterial>,
        traffic: Arc<TrafficCounters>,
    },
}

/// Builds the process backing a tunnel.
pub type ProcessFactory = Arc<dyn Fn(LaunchPlan) -> Box<dyn ManagedProcess> + Send + Sync>;

/// OpenSSH client for standard tunnels, in-process server for reverse ones.
pub fn default_process_factory(config: &BrokerConfig) -> ProcessFactory {
    let ssh = config.ssh.clone();
    Arc::new(move |plan: LaunchPlan| -> Box<dyn ManagedProcess> {
        match plan {
            LaunchPlan::Standard { spec, private_keys } => {
                Box::new(SshClientProcess::new(spec, ssh.clone(), private_keys))
            }
            LaunchPlan::Reverse {
                spec,
                trusted,
                traffic,
            } => Box::new(
                ReverseServerProcess::new(spec, trusted, ssh.keepalive_interval)
                    .with_traffic(traffic),
            ),
        }
    })
}

/// Background work and resources owned by one tunnel.
///
/// Registered before the record becomes visible so a delete always finds the
/// lease, even if it lands before the tasks are spawned.
struct TunnelTasks {
    cancel: CancellationToken,
    enabled: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    lease: PortLease,
    /// Relay totals, reverse tunnels only
    traffic: Option<Arc<TrafficCounters>>,
}

/// Provisions, observes and tears down tunnels.
pub struct TunnelBroker {
    config: BrokerConfig,
    store: Arc<dyn TunnelStore>,
    ports: Arc<PortAllocator>,
    probes: Arc<Vec<Arc<dyn Probe>>>,
    factory: ProcessFactory,
    tasks: DashMap<String, TunnelTasks>,
}

impl TunnelBroker {
    /// A broker with the in-memory registry, the configured probes and real
    /// SSH processes.
    pub fn new(config: BrokerConfig) -> BrokerResult<Self> {
        let probes = default_probes(&config.health)?;
        let factory = default_process_factory(&config);
        Ok(Self::with_parts(
            config,
            Arc::new(MemoryTunnelStore::new()),
            probes,
            factory,
        ))
    }

    pub fn with_parts(
        config: BrokerConfig,
        store: Arc<dyn TunnelStore>,
        probes: Vec<Arc<dyn Probe>>,
        factory: ProcessFactory,
    ) -> Self {
        let ports = Arc::new(PortAllocator::from_config(&config));
        Self {
            config,
            store,
            ports,
            probes: Arc::new(probes),
            factory,
            tasks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Provisions a broker-initiated tunnel through `ssh_host:ssh_port`.
    ///
    /// # Errors
    ///
    /// * `InvalidArgument` - Missing host, zero port, malformed or conflicting keys
    /// * `ResourceExhausted` - No free bind port
    pub async fn create_standard_tunnel(
        &self,
        request: CreateStandardTunnel,
    ) -> BrokerResult<CreatedTunnel> {
        let ssh_host = require_host("ssh_host", &request.ssh_host)?;
        let service_host = require_host("service_host", &request.service_host)?;
        let ssh_port = require_port("ssh_port", request.ssh_port)?;
        let service_port = require_port("service_port", request.service_port)?;
        let ssh_user = request
            .ssh_user
            .filter(|user| !user.trim().is_empty())
            .unwrap_or_else(|| self.config.ssh.default_user.clone());

        let (keys, generated) =
            match keys::resolve_key_source(&request.private_keys, request.create_key_pair)? {
                KeySource::Generate => (vec![keys::issue()?], true),
                KeySource::Supplied => (keys::accept_private_keys(&request.private_keys)?, false),
            };

        let mut lease = PortLease::new();
        let bind_port = lease.take(&self.ports, PortPool::Standard)?;

        let target = StandardTunnel {
            ssh_host,
            ssh_port,
            ssh_user,
            service_host,
            service_port,
        };
        let tunnel = new_record(
            bind_port,
            TunnelPayload::Standard(target.clone()),
            keys.iter().map(|k| &k.public),
        );
        let id = tunnel.id.clone();
        let snapshot = tunnel.clone();
        self.reserve(&id, lease, None);
        if let Err(e) = self.store.create(tunnel) {
            self.unreserve(&id);
            return Err(e);
        }

        let plan = LaunchPlan::Standard {
            spec: SshClientSpec {
                tunnel_id: id.clone(),
                bind_host: self.config.bind_host.clone(),
                bind_port,
                target,
            },
            private_keys: keys.iter().map(|k| k.openssh.clone()).collect(),
        };
        self.launch(&id, plan);
        info!(tunnel_id = %id, bind_port, "standard tunnel created");

        Ok(CreatedTunnel {
            tunnel: self.get_tunnel(&id).unwrap_or(snapshot),
            public_key: generated
                .then(|| keys.first().map(|k| k.public.openssh.clone()))
                .flatten(),
            private_key: None,
        })
    }

    /// Provisions a peer-initiated tunnel and starts its SSH server.
    ///
    /// # Errors
    ///
    /// * `InvalidArgument` - Malformed or conflicting keys
    /// * `ResourceExhausted` - No free tunnel or sshd port
    pub async fn create_reverse_tunnel(
        &self,
        request: CreateReverseTunnel,
    ) -> BrokerResult<CreatedTunnel> {
        let (trusted, private_key) =
            match keys::resolve_key_source(&request.public_keys, request.create_key_pair)? {
                KeySource::Generate => {
                    let material = keys::issue()?;
                    (vec![material.public], Some(material.openssh))
                }
                KeySource::Supplied => (keys::accept_public_keys(&request.public_keys)?, None),
            };

        let mut lease = PortLease::new();
        let tunnel_port = lease.take(&self.ports, PortPool::Reverse)?;
        let sshd_port = match lease.take(&self.ports, PortPool::Sshd) {
            Ok(port) => port,
            Err(e) => {
                lease.release_all(&self.ports);
                return Err(e);
            }
        };

        let tunnel = new_record(
            tunnel_port,
            TunnelPayload::Reverse(ReverseTunnel {
                sshd_port,
                tunnel_port,
            }),
            trusted.iter(),
        );
        let id = tunnel.id.clone();
        let snapshot = tunnel.clone();
        let traffic = Arc::new(TrafficCounters::default());
        self.reserve(&id, lease, Some(traffic.clone()));
        if let Err(e) = self.store.create(tunnel) {
            self.unreserve(&id);
            return Err(e);
        }

        let plan = LaunchPlan::Reverse {
            spec: ReverseServerSpec {
                tunnel_id: id.clone(),
                listen_host: self.config.reverse_bind_host.clone(),
                sshd_port,
                bind_host: self.config.bind_host.clone(),
                bind_port: tunnel_port,
                tunnel_port,
            },
            trusted,
            traffic,
        };
        self.launch(&id, plan);
        info!(tunnel_id = %id, sshd_port, tunnel_port, "reverse tunnel created");

        Ok(CreatedTunnel {
            tunnel: self.get_tunnel(&id).unwrap_or(snapshot),
            public_key: None,
            private_key,
        })
    }

    /// Reads a tunnel with its instances ordered PASSING first.
    pub fn get_tunnel(&self, id: &str) -> BrokerResult<Tunnel> {
        let mut tunnel = self.store.get(id)?;
        tunnel.instances = tunnel.sorted_instances();
        Ok(tunnel)
    }

    /// All tunnels, oldest first.
    pub fn list_tunnels(&self, kind: Option<TunnelKind>) -> Vec<Tunnel> {
        self.store
            .list(kind)
            .into_iter()
            .map(|mut tunnel| {
                tunnel.instances = tunnel.sorted_instances();
                tunnel
            })
            .collect()
    }

    /// Tears a tunnel down and releases its ports.
    ///
    /// Idempotent: a tunnel that is already being deleted, or is gone, is not
    /// an error. Blocks for at most the terminate grace period plus a second.
    pub async fn delete_tunnel(&self, id: &str) -> BrokerResult<()> {
        match self.store.begin_delete(id)? {
            DeleteStart::Started(_) => {}
            DeleteStart::InProgress | DeleteStart::AlreadyDeleted => return Ok(()),
        }

        if let Some((_, mut tasks)) = self.tasks.remove(id) {
            tasks.cancel.cancel();
            let wait = self.config.supervisor.terminate_grace + TEARDOWN_SLACK;
            for handle in tasks.handles {
                let abort = handle.abort_handle();
                if tokio::time::timeout(wait, handle).await.is_err() {
                    warn!(tunnel_id = %id, "teardown exceeded {:?}, aborting task", wait);
                    abort.abort();
                }
            }
            tasks.lease.release_all(&self.ports);
        }

        self.store.finish_delete(id)?;
        info!(tunnel_id = %id, "tunnel deleted");
        Ok(())
    }

    /// Deletes every tunnel. Used on shutdown.
    pub async fn delete_all(&self) {
        for tunnel in self.store.list(None) {
            if let Err(e) = self.delete_tunnel(&tunnel.id).await {
                warn!(tunnel_id = %tunnel.id, "failed to delete tunnel: {}", e);
            }
        }
    }

    /// Pauses or resumes a tunnel. Ports stay allocated while disabled.
    pub fn set_tunnel_enabled(&self, id: &str, enabled: bool) -> BrokerResult<Tunnel> {
        let tunnel = self.store.set_enabled(id, enabled)?;
        if let Some(tasks) = self.tasks.get(id) {
            tasks.enabled.send_replace(enabled);
        }
        info!(tunnel_id = %id, enabled, state = %tunnel.state, "tunnel updated");
        self.get_tunnel(id)
    }

    /// Where a peer has to connect for a reverse tunnel.
    pub fn connection_details(&self, id: &str) -> BrokerResult<ConnectionDetails> {
        let tunnel = self.store.get(id)?;
        let TunnelPayload::Reverse(reverse) = &tunnel.payload else {
            return Err(BrokerError::InvalidArgument(format!(
                "tunnel {} is a {} tunnel, connection details exist only for REVERSE tunnels",
                id,
                tunnel.kind()
            )));
        };
        let host = match self.config.reverse_bind_host.as_str() {
            "0.0.0.0" | "::" => "<broker-host>".to_string(),
            host => host.to_string(),
        };
        let command = format!(
            "ssh -N -R {}:localhost:<service-port> -p {} -i <private-key-file> tunnel@{}",
            reverse.tunnel_port, reverse.sshd_port, host
        );
        Ok(ConnectionDetails {
            tunnel_id: tunnel.id.clone(),
            host,
            sshd_port: reverse.sshd_port,
            tunnel_port: reverse.tunnel_port,
            bind_port: tunnel.bind_port,
            command,
        })
    }

    /// Relay totals of a reverse tunnel.
    ///
    /// # Errors
    ///
    /// * `NotFound` - Unknown tunnel
    /// * `InvalidArgument` - Standard tunnels are forwarded by OpenSSH and have no counters
    pub fn tunnel_traffic(&self, id: &str) -> BrokerResult<TunnelTraffic> {
        let tunnel = self.store.get(id)?;
        if tunnel.kind() != TunnelKind::Reverse {
            return Err(BrokerError::InvalidArgument(format!(
                "tunnel {} is a {} tunnel, traffic is counted only for REVERSE tunnels",
                id,
                tunnel.kind()
            )));
        }
        Ok(self
            .tasks
            .get(id)
            .and_then(|tasks| tasks.traffic.as_ref().map(|t| t.snapshot()))
            .unwrap_or_default())
    }

    /// Parks the lease under `id` ahead of the registry insert.
    fn reserve(&self, id: &str, lease: PortLease, traffic: Option<Arc<TrafficCounters>>) {
        let (enabled, _) = watch::channel(true);
        self.tasks.insert(
            id.to_string(),
            TunnelTasks {
                cancel: CancellationToken::new(),
                enabled,
                handles: Vec::new(),
                lease,
                traffic,
            },
        );
    }

    fn unreserve(&self, id: &str) {
        if let Some((_, mut tasks)) = self.tasks.remove(id) {
            tasks.lease.release_all(&self.ports);
        }
    }

    /// Spawns the supervisor and scheduler of a reserved tunnel.
    ///
    /// The task entry stays locked while spawning, so a concurrent delete
    /// either removes it first (nothing is launched) or waits and then
    /// tears the new tasks down.
    fn launch(&self, id: &str, plan: LaunchPlan) {
        let Some(mut tasks) = self.tasks.get_mut(id) else {
            debug!(tunnel_id = %id, "tunnel deleted before launch");
            return;
        };
        let probe_now = Arc::new(Notify::new());

        let supervisor = Supervisor::new(
            id.to_string(),
            (self.factory)(plan),
            self.store.clone(),
            self.config.supervisor.clone(),
            probe_now.clone(),
            tasks.enabled.subscribe(),
            tasks.cancel.child_token(),
        );
        let scheduler = HealthScheduler::new(
            id.to_string(),
            self.store.clone(),
            self.probes.clone(),
            self.config.health.interval,
            probe_now,
            tasks.cancel.child_token(),
        );

        tasks.handles.push(tokio::spawn(supervisor.run()));
        tasks.handles.push(tokio::spawn(scheduler.run()));
    }
}

fn new_record<'a>(
    bind_port: u16,
    payload: TunnelPayload,
    keys: impl Iterator<Item = &'a PublicKeyMaterial>,
) -> Tunnel {
    let (public_keys, key_fingerprints) = keys
        .map(|k| (k.openssh.clone(), k.fingerprint.clone()))
        .unzip();
    Tunnel {
        id: Uuid::new_v4().to_string(),
        created_at: chrono::Utc::now().to_rfc3339(),
        enabled: true,
        bind_port,
        state: TunnelState::Creating,
        payload,
        public_keys,
        key_fingerprints,
        error: None,
        instances: Vec::new(),
    }
}

fn require_host(field: &str, value: &str) -> BrokerResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(BrokerError::InvalidArgument(format!("{} is required", field)));
    }
    if value.contains(char::is_whitespace) {
        return Err(BrokerError::InvalidArgument(format!(
            "{} must not contain whitespace",
            field
        )));
    }
    Ok(value.to_string())
}

fn require_port(field: &str, port: u16) -> BrokerResult<u16> {
    match port {
        0 => Err(BrokerError::InvalidArgument(format!(
            "{} must be between 1 and 65535",
            field
        ))),
        port => Ok(port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::config::PortRange;
    use crate::tunnel::health::TcpConnectProbe;
    use crate::tunnel::process::fake::{ScriptHandle, ScriptedProcess};
    use crate::tunnel::reverse_server::peer;
    use crate::tunnel::registry::StateChange;
    use crate::tunnel::supervisor::tests::fast_settings;
    use crate::tunnel::types::{HealthStatus, TunnelHealthcheck};
    use parking_lot::Mutex;
    use tokio::net::TcpListener;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .unwrap()
    }

    fn test_config(standard: PortRange) -> BrokerConfig {
        let mut config = BrokerConfig::default();
        config.bind_host = "127.0.0.1".to_string();
        config.reverse_bind_host = "127.0.0.1".to_string();
        config.standard_ports = standard;
        let reverse = free_port();
        config.reverse_ports = PortRange::new(reverse, reverse);
        let sshd = free_port();
        config.sshd_ports = PortRange::new(sshd, sshd);
        config.supervisor = fast_settings(3);
        config.health.interval = Duration::from_millis(50);
        config.health.timeout = Duration::from_secs(2);
        config
    }

    /// Standard tunnels get a process that turns ready at their bind port.
    fn ready_factory(config: &BrokerConfig) -> (ProcessFactory, Arc<Mutex<Vec<ScriptHandle>>>) {
        let handles = Arc::new(Mutex::new(Vec::new()));
        let seen = handles.clone();
        let real = default_process_factory(config);
        let factory: ProcessFactory =
            Arc::new(move |plan: LaunchPlan| -> Box<dyn ManagedProcess> {
                match plan {
                    LaunchPlan::Standard { spec, .. } => {
                        let (process, handle) =
                            ScriptedProcess::always_ready(&spec.bind_host, spec.bind_port);
                        seen.lock().push(handle);
                        Box::new(process)
                    }
                    reverse => real(reverse),
                }
            });
        (factory, handles)
    }

    fn broker(standard: PortRange) -> (TunnelBroker, Arc<Mutex<Vec<ScriptHandle>>>) {
        let config = test_config(standard);
        let (factory, handles) = ready_factory(&config);
        let probes: Vec<Arc<dyn Probe>> = vec![Arc::new(TcpConnectProbe::new(
            config.health.timeout,
            config.health.slow_threshold,
        ))];
        let broker = TunnelBroker::with_parts(
            config,
            Arc::new(MemoryTunnelStore::new()),
            probes,
            factory,
        );
        (broker, handles)
    }

    /// Stands in for the forwarded service so TCP health checks pass.
    async fn serve(port: u16) {
        let service = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = service.accept().await {
                held.push(socket);
            }
        });
    }

    fn standard_request() -> CreateStandardTunnel {
        CreateStandardTunnel {
            ssh_host: "bastion".to_string(),
            ssh_port: 2222,
            ssh_user: None,
            service_host: "svc".to_string(),
            service_port: 5678,
            private_keys: vec![],
            create_key_pair: true,
        }
    }

    async fn poll<F>(broker: &TunnelBroker, id: &str, pred: F) -> Tunnel
    where
        F: Fn(&Tunnel) -> bool,
    {
        for _ in 0..500 {
            let tunnel = broker.get_tunnel(id).unwrap();
            if pred(&tunnel) {
                return tunnel;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached: {:?}", broker.get_tunnel(id));
    }

    mod standard {
        use super::*;

        #[tokio::test]
        async fn test_create_standard_reaches_active_and_passing() {
            let port = free_port();
            serve(port).await;

            let (broker, _) = broker(PortRange::new(port, port));
            let created = broker.create_standard_tunnel(standard_request()).await.unwrap();

            assert!(created.public_key.as_deref().is_some_and(|k| !k.is_empty()));
            assert!(created.private_key.is_none());
            assert!(matches!(
                created.tunnel.state,
                TunnelState::Creating | TunnelState::Establishing | TunnelState::Active
            ));
            assert_eq!(created.tunnel.bind_port, port);
            match &created.tunnel.payload {
                TunnelPayload::Standard(s) => assert_eq!(s.ssh_user, "passage"),
                other => panic!("unexpected payload {:?}", other),
            }

            let tunnel = poll(&broker, &created.tunnel.id, |t| {
                t.state == TunnelState::Active
                    && t.instances.first().is_some_and(|i| i.status == HealthStatus::Passing)
            })
            .await;
            assert_eq!(tunnel.instances.len(), 1);
            assert_eq!(tunnel.instances[0].port, port);

            broker.delete_tunnel(&tunnel.id).await.unwrap();
        }

        #[tokio::test]
        async fn test_private_key_never_reaches_registry() {
            let (broker, _) = broker(PortRange::new(40100, 40100));
            let key = keys::issue().unwrap();
            let created = broker
                .create_standard_tunnel(CreateStandardTunnel {
                    private_keys: vec![key.openssh.clone()],
                    create_key_pair: false,
                    ..standard_request()
                })
                .await
                .unwrap();

            assert!(created.public_key.is_none());
            let json = serde_json::to_string(&broker.get_tunnel(&created.tunnel.id).unwrap()).unwrap();
            assert!(!json.contains("PRIVATE KEY"));
            assert!(json.contains(&key.public.fingerprint));

            broker.delete_tunnel(&created.tunnel.id).await.unwrap();
        }

        #[tokio::test]
        async fn test_invalid_requests_allocate_nothing() {
            let (broker, _) = broker(PortRange::new(40200, 40201));

            let both = CreateStandardTunnel {
                private_keys: vec![keys::issue().unwrap().openssh],
                ..standard_request()
            };
            let no_host = CreateStandardTunnel {
                ssh_host: " ".to_string(),
                ..standard_request()
            };
            let no_port = CreateStandardTunnel {
                service_port: 0,
                ..standard_request()
            };
            let bad_key = CreateStandardTunnel {
                private_keys: vec!["garbage".to_string()],
                create_key_pair: false,
                ..standard_request()
            };

            for request in [both, no_host, no_port, bad_key] {
                let err = broker.create_standard_tunnel(request).await.unwrap_err();
                assert!(matches!(err, BrokerError::InvalidArgument(_)), "{:?}", err);
            }
            assert_eq!(broker.ports().allocated_count(PortPool::Standard), 0);
            assert!(broker.list_tunnels(None).is_empty());
        }
    }

    mod ports {
        use super::*;

        #[tokio::test]
        async fn test_exhaustion_and_reuse_after_delete() {
            let (broker, _) = broker(PortRange::new(40300, 40301));

            let first = broker.create_standard_tunnel(standard_request()).await.unwrap();
            let second = broker.create_standard_tunnel(standard_request()).await.unwrap();
            assert_ne!(first.tunnel.bind_port, second.tunnel.bind_port);

            let err = broker.create_standard_tunnel(standard_request()).await.unwrap_err();
            assert!(matches!(err, BrokerError::ResourceExhausted(_)));

            broker.delete_tunnel(&first.tunnel.id).await.unwrap();
            let third = broker.create_standard_tunnel(standard_request()).await.unwrap();
            assert_eq!(third.tunnel.bind_port, first.tunnel.bind_port);

            broker.delete_all().await;
            assert_eq!(broker.ports().allocated_count(PortPool::Standard), 0);
        }
    }

    mod deletion {
        use super::*;

        #[tokio::test]
        async fn test_delete_is_idempotent_and_releases_once() {
            let port = free_port();
            serve(port).await;
            let (broker, handles) = broker(PortRange::new(port, port));
            let created = broker.create_standard_tunnel(standard_request()).await.unwrap();
            let id = created.tunnel.id.clone();
            poll(&broker, &id, |t| t.state == TunnelState::Active).await;

            broker.delete_tunnel(&id).await.unwrap();
            assert!(handles.lock()[0].was_terminated());
            assert!(matches!(broker.get_tunnel(&id), Err(BrokerError::NotFound(_))));

            // The freed port goes to someone else; a second delete must not free it
            let other = broker.create_standard_tunnel(standard_request()).await.unwrap();
            assert_eq!(other.tunnel.bind_port, created.tunnel.bind_port);
            broker.delete_tunnel(&id).await.unwrap();
            assert!(
                broker
                    .ports()
                    .is_allocated(PortPool::Standard, other.tunnel.bind_port)
            );

            broker.delete_tunnel(&other.tunnel.id).await.unwrap();
        }

        /// Holds each new record visible for a while before returning.
        struct SlowCreateStore {
            inner: MemoryTunnelStore,
            stall: Duration,
        }

        impl TunnelStore for SlowCreateStore {
            fn create(&self, tunnel: Tunnel) -> BrokerResult<String> {
                let id = self.inner.create(tunnel)?;
                std::thread::sleep(self.stall);
                Ok(id)
            }
            fn get(&self, id: &str) -> BrokerResult<Tunnel> {
                self.inner.get(id)
            }
            fn list(&self, kind: Option<TunnelKind>) -> Vec<Tunnel> {
                self.inner.list(kind)
            }
            fn transition(
                &self,
                id: &str,
                expected: TunnelState,
                next: TunnelState,
                change: StateChange,
            ) -> BrokerResult<Tunnel> {
                self.inner.transition(id, expected, next, change)
            }
            fn set_error(&self, id: &str, error: Option<String>) -> BrokerResult<Tunnel> {
                self.inner.set_error(id, error)
            }
            fn set_enabled(&self, id: &str, enabled: bool) -> BrokerResult<Tunnel> {
                self.inner.set_enabled(id, enabled)
            }
            fn record_health(
                &self,
                id: &str,
                host: &str,
                port: u16,
                checks: Vec<TunnelHealthcheck>,
            ) -> BrokerResult<Tunnel> {
                self.inner.record_health(id, host, port, checks)
            }
            fn begin_delete(&self, id: &str) -> BrokerResult<DeleteStart> {
                self.inner.begin_delete(id)
            }
            fn finish_delete(&self, id: &str) -> BrokerResult<Tunnel> {
                self.inner.finish_delete(id)
            }
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn test_delete_during_create_releases_port() {
            let config = test_config(PortRange::new(40450, 40450));
            let (factory, handles) = ready_factory(&config);
            let store = SlowCreateStore {
                inner: MemoryTunnelStore::new(),
                stall: Duration::from_millis(300),
            };
            let broker = Arc::new(TunnelBroker::with_parts(
                config,
                Arc::new(store),
                vec![],
                factory,
            ));

            let creating = {
                let broker = broker.clone();
                tokio::spawn(async move { broker.create_standard_tunnel(standard_request()).await })
            };

            let id = loop {
                if let Some(tunnel) = broker.list_tunnels(None).into_iter().next() {
                    break tunnel.id;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            };
            broker.delete_tunnel(&id).await.unwrap();

            let created = creating.await.unwrap().unwrap();
            assert_eq!(created.tunnel.id, id);
            assert!(broker.list_tunnels(None).is_empty());
            assert!(broker.tasks.is_empty());
            assert_eq!(broker.ports().allocated_count(PortPool::Standard), 0);
            // Nothing was launched for the deleted id
            assert!(handles.lock().is_empty());

            let next = broker.create_standard_tunnel(standard_request()).await.unwrap();
            assert_eq!(next.tunnel.bind_port, 40450);
            broker.delete_all().await;
        }

        #[tokio::test]
        async fn test_delete_unknown_id_is_not_found() {
            let (broker, _) = broker(PortRange::new(40500, 40500));
            assert!(matches!(
                broker.delete_tunnel("missing").await,
                Err(BrokerError::NotFound(_))
            ));
        }

        #[tokio::test]
        async fn test_delete_failed_tunnel() {
            let config = test_config(PortRange::new(40600, 40600));
            let factory: ProcessFactory = Arc::new(|_: LaunchPlan| -> Box<dyn ManagedProcess> {
                Box::new(ScriptedProcess::always_exits("Permission denied (publickey)").0)
            });
            let broker = TunnelBroker::with_parts(
                config,
                Arc::new(MemoryTunnelStore::new()),
                vec![],
                factory,
            );
            let created = broker.create_standard_tunnel(standard_request()).await.unwrap();
            let tunnel = poll(&broker, &created.tunnel.id, |t| t.state == TunnelState::Failed).await;
            assert!(tunnel.error.unwrap().contains("Permission denied"));

            broker.delete_tunnel(&created.tunnel.id).await.unwrap();
            assert_eq!(broker.ports().allocated_count(PortPool::Standard), 0);
        }
    }

    mod listing_and_updates {
        use super::*;

        #[tokio::test]
        async fn test_list_filters_by_kind_in_creation_order() {
            let (broker, _) = broker(PortRange::new(40700, 40701));
            let a = broker.create_standard_tunnel(standard_request()).await.unwrap();
            let r = broker
                .create_reverse_tunnel(CreateReverseTunnel {
                    public_keys: vec![],
                    create_key_pair: true,
                })
                .await
                .unwrap();

            let all: Vec<String> = broker.list_tunnels(None).into_iter().map(|t| t.id).collect();
            assert_eq!(all, vec![a.tunnel.id.clone(), r.tunnel.id.clone()]);
            let reverse = broker.list_tunnels(Some(TunnelKind::Reverse));
            assert_eq!(reverse.len(), 1);
            assert_eq!(reverse[0].id, r.tunnel.id);

            broker.delete_all().await;
            assert!(broker.list_tunnels(None).is_empty());
        }

        #[tokio::test]
        async fn test_disable_and_enable() {
            let port = free_port();
            serve(port).await;
            let (broker, handles) = broker(PortRange::new(port, port));
            let created = broker.create_standard_tunnel(standard_request()).await.unwrap();
            let id = created.tunnel.id.clone();
            poll(&broker, &id, |t| t.state == TunnelState::Active).await;

            let updated = broker.set_tunnel_enabled(&id, false).unwrap();
            assert!(!updated.enabled);
            let paused = poll(&broker, &id, |t| t.state == TunnelState::Establishing).await;
            assert!(paused.instances.is_empty());
            assert!(broker.ports().is_allocated(PortPool::Standard, port));

            broker.set_tunnel_enabled(&id, true).unwrap();
            poll(&broker, &id, |t| t.state == TunnelState::Active).await;
            assert_eq!(handles.lock()[0].starts(), 2);

            broker.delete_tunnel(&id).await.unwrap();
        }

        #[tokio::test]
        async fn test_connection_details_only_for_reverse() {
            let (broker, _) = broker(PortRange::new(40900, 40900));
            let standard = broker.create_standard_tunnel(standard_request()).await.unwrap();
            assert!(matches!(
                broker.connection_details(&standard.tunnel.id),
                Err(BrokerError::InvalidArgument(_))
            ));
            assert!(matches!(
                broker.tunnel_traffic(&standard.tunnel.id),
                Err(BrokerError::InvalidArgument(_))
            ));

            let reverse = broker
                .create_reverse_tunnel(CreateReverseTunnel {
                    public_keys: vec![],
                    create_key_pair: true,
                })
                .await
                .unwrap();
            let details = broker.connection_details(&reverse.tunnel.id).unwrap();
            let TunnelPayload::Reverse(payload) = &reverse.tunnel.payload else {
                panic!("expected reverse payload");
            };
            assert_eq!(details.sshd_port, payload.sshd_port);
            assert_eq!(details.tunnel_port, payload.tunnel_port);
            assert!(details.command.contains(&format!("-R {}:", payload.tunnel_port)));
            assert!(details.command.contains(&format!("-p {}", payload.sshd_port)));

            broker.delete_all().await;
        }
    }

    mod reverse {
        use super::*;

        #[tokio::test]
        async fn test_reverse_round_trip_reports_active_instance() {
            let (broker, _) = broker(PortRange::new(41100, 41100));
            let created = broker
                .create_reverse_tunnel(CreateReverseTunnel {
                    public_keys: vec![],
                    create_key_pair: true,
                })
                .await
                .unwrap();
            let private_key = created.private_key.clone().expect("generated private key");
            let TunnelPayload::Reverse(ports) = created.tunnel.payload.clone() else {
                panic!("expected reverse payload");
            };
            assert_eq!(created.tunnel.bind_port, ports.tunnel_port);

            let waiting = poll(&broker, &created.tunnel.id, |t| {
                t.state == TunnelState::Establishing
            })
            .await;
            assert!(waiting.instances.is_empty());
            // The registry only knows the public half
            assert!(
                !serde_json::to_string(&waiting)
                    .unwrap()
                    .contains("PRIVATE KEY")
            );

            let key = russh::keys::decode_secret_key(&private_key, None).unwrap();
            let mut session = peer::connect(ports.sshd_port, key)
                .await
                .unwrap()
                .expect("generated key is trusted");
            session
                .tcpip_forward("localhost", u32::from(ports.tunnel_port))
                .await
                .unwrap();

            let active = poll(&broker, &created.tunnel.id, |t| {
                t.state == TunnelState::Active
                    && t.instances.first().is_some_and(|i| i.status == HealthStatus::Passing)
            })
            .await;
            assert_eq!(active.instances.len(), 1);
            assert_eq!(active.instances[0].port, ports.tunnel_port);

            // The passing TCP check itself went through the relay
            let traffic = broker.tunnel_traffic(&created.tunnel.id).unwrap();
            assert!(traffic.connections >= 1);
            assert_eq!(traffic.forward_requests, 1);
            assert!(matches!(
                broker.tunnel_traffic("missing"),
                Err(BrokerError::NotFound(_))
            ));

            peer::disconnect(&session).await;
            poll(&broker, &created.tunnel.id, |t| t.state == TunnelState::Degraded).await;

            broker.delete_tunnel(&created.tunnel.id).await.unwrap();
            assert_eq!(broker.ports().allocated_count(PortPool::Sshd), 0);
            assert_eq!(broker.ports().allocated_count(PortPool::Reverse), 0);
        }

        #[tokio::test]
        async fn test_reverse_with_supplied_public_key_returns_no_private_key() {
            let (broker, _) = broker(PortRange::new(41200, 41200));
            let key = keys::issue().unwrap();
            let created = broker
                .create_reverse_tunnel(CreateReverseTunnel {
                    public_keys: vec![key.public.openssh.clone()],
                    create_key_pair: false,
                })
                .await
                .unwrap();
            assert!(created.private_key.is_none());
            assert_eq!(created.tunnel.key_fingerprints, vec![key.public.fingerprint]);

            broker.delete_all().await;
        }
    }
}
