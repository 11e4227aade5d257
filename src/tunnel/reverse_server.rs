//! Ephemeral SSH server backing a reverse tunnel.
//!
//! One server runs per reverse tunnel on its `sshd_port`. It accepts only the
//! tunnel's public keys and only a remote-forward request for `tunnel_port`.
//! Once such a forward is granted the server listens on `bind_host:bind_port`
//! and hands every accepted connection to the peer over a `forwarded-tcpip`
//! channel.
//!
//! Only one forward may be held at a time. A second peer session asking for
//! the same port is refused until the first one goes away.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::keys::{Algorithm, PrivateKey, PublicKey};
use russh::server::{self, Auth, Server as _, Session};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::keys::{PublicKeyMaterial, is_trusted};
use super::process::{ExitReport, ManagedProcess, ProcessEvent};
use super::types::TunnelTraffic;

/// Where the server listens and what it forwards.
#[derive(Debug, Clone)]
pub struct ReverseServerSpec {
    pub tunnel_id: String,
    /// Interface the SSH server listens on
    pub listen_host: String,
    pub sshd_port: u16,
    /// Interface the forwarded service is exposed on
    pub bind_host: String,
    pub bind_port: u16,
    /// The only remote-forward port a peer may request
    pub tunnel_port: u16,
}

/// Running traffic totals of one reverse tunnel, kept across sshd restarts.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    connections: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    forward_requests: AtomicU64,
}

impl TrafficCounters {
    pub fn snapshot(&self) -> TunnelTraffic {
        TunnelTraffic {
            connections: self.connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            forward_requests: self.forward_requests.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the accept loop and every peer session.
struct Shared {
    spec: ReverseServerSpec,
    trusted: Vec<PublicKeyMaterial>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    /// Session id currently holding the forward
    active_forward: Mutex<Option<u64>>,
    traffic: Arc<TrafficCounters>,
    cancel: CancellationToken,
}

#[derive(Clone)]
struct ReverseServer {
    shared: Arc<Shared>,
    next_session: Arc<AtomicU64>,
}

impl server::Server for ReverseServer {
    type Handler = PeerSession;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> PeerSession {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        debug!(tunnel_id = %self.shared.spec.tunnel_id, session = id, ?peer_addr, "peer connected");
        PeerSession {
            id,
            shared: self.shared.clone(),
            forward: None,
        }
    }
}

/// One inbound SSH connection.
struct PeerSession {
    id: u64,
    shared: Arc<Shared>,
    forward: Option<CancellationToken>,
}

impl PeerSession {
    fn close_forward(&mut self, reason: &str) {
        let Some(token) = self.forward.take() else {
            return;
        };
        token.cancel();
        {
            let mut active = self.shared.active_forward.lock();
            if *active == Some(self.id) {
                *active = None;
            }
        }
        info!(tunnel_id = %self.shared.spec.tunnel_id, session = self.id, "{}", reason);
        let _ = self.shared.events.send(ProcessEvent::ForwardClosed {
            reason: reason.to_string(),
        });
    }
}

impl server::Handler for PeerSession {
    type Error = russh::Error;

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        if is_trusted(public_key, &self.shared.trusted) {
            debug!(tunnel_id = %self.shared.spec.tunnel_id, user, "peer authenticated");
            return Ok(Auth::Accept);
        }
        warn!(tunnel_id = %self.shared.spec.tunnel_id, user, "rejected untrusted key");
        Ok(Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        })
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let spec = &self.shared.spec;
        self.shared
            .traffic
            .forward_requests
            .fetch_add(1, Ordering::Relaxed);
        if *port != u32::from(spec.tunnel_port) {
            warn!(tunnel_id = %spec.tunnel_id, requested = *port, expected = spec.tunnel_port, "refused forward for foreign port");
            return Ok(false);
        }

        {
            let mut active = self.shared.active_forward.lock();
            if active.is_some() {
                warn!(tunnel_id = %spec.tunnel_id, session = self.id, "forward already held by another session");
                return Ok(false);
            }
            *active = Some(self.id);
        }

        let listen_addr = format!("{}:{}", spec.bind_host, spec.bind_port);
        let listener = match TcpListener::bind(&listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(tunnel_id = %spec.tunnel_id, %listen_addr, "failed to bind forward: {}", e);
                *self.shared.active_forward.lock() = None;
                return Ok(false);
            }
        };

        let token = self.shared.cancel.child_token();
        tokio::spawn(relay_forward(
            listener,
            session.handle(),
            address.to_string(),
            *port,
            token.clone(),
            self.shared.traffic.clone(),
            spec.tunnel_id.clone(),
        ));
        self.forward = Some(token);

        info!(tunnel_id = %spec.tunnel_id, session = self.id, %listen_addr, "reverse forward established");
        let _ = self.shared.events.send(ProcessEvent::Ready {
            host: spec.bind_host.clone(),
            port: spec.bind_port,
        });
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if port != u32::from(self.shared.spec.tunnel_port) || self.forward.is_none() {
            return Ok(false);
        }
        self.close_forward("peer cancelled the forward");
        Ok(true)
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.close_forward("peer session ended");
    }
}

/// Accepts connections on the forwarded port and pipes each one to the peer.
async fn relay_forward(
    listener: TcpListener,
    handle: server::Handle,
    address: String,
    port: u32,
    cancel: CancellationToken,
    traffic: Arc<TrafficCounters>,
    tunnel_id: String,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, origin) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(%tunnel_id, "forward listener failed: {}", e);
                break;
            }
        };

        let handle = handle.clone();
        let address = address.clone();
        let cancel = cancel.clone();
        let traffic = traffic.clone();
        let tunnel_id = tunnel_id.clone();
        tokio::spawn(async move {
            relay_connection(stream, origin, handle, address, port, cancel, traffic, tunnel_id)
                .await;
        });
    }
}

/// Pipes one local connection through a `forwarded-tcpip` channel.
///
/// Byte totals are added when the connection closes on its own.
#[allow(clippy::too_many_arguments)]
async fn relay_connection(
    mut stream: TcpStream,
    origin: SocketAddr,
    handle: server::Handle,
    address: String,
    port: u32,
    cancel: CancellationToken,
    traffic: Arc<TrafficCounters>,
    tunnel_id: String,
) {
    let channel = match handle
        .channel_open_forwarded_tcpip(
            address,
            port,
            origin.ip().to_string(),
            u32::from(origin.port()),
        )
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            debug!(%tunnel_id, %origin, "peer refused forwarded channel: {}", e);
            return;
        }
    };

    traffic.connections.fetch_add(1, Ordering::Relaxed);

    let mut channel_stream = channel.into_stream();
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut stream, &mut channel_stream) => {
            match result {
                Ok((up, down)) => {
                    traffic.bytes_sent.fetch_add(up, Ordering::Relaxed);
                    traffic.bytes_received.fetch_add(down, Ordering::Relaxed);
                    debug!(%tunnel_id, %origin, up, down, "forwarded connection closed");
                }
                Err(e) => debug!(%tunnel_id, %origin, "forwarded connection failed: {}", e),
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<server::Config>,
    mut server: ReverseServer,
    started_at: Instant,
) {
    let shared = server.shared.clone();
    loop {
        let accepted = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer_addr)) => {
                let handler = server.new_client(Some(peer_addr));
                let config = config.clone();
                let cancel = shared.cancel.clone();
                let tunnel_id = shared.spec.tunnel_id.clone();
                tokio::spawn(async move {
                    match server::run_stream(config, stream, handler).await {
                        Ok(session) => {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                result = session => {
                                    if let Err(e) = result {
                                        debug!(%tunnel_id, %peer_addr, "peer session error: {}", e);
                                    }
                                }
                            }
                        }
                        Err(e) => debug!(%tunnel_id, %peer_addr, "ssh handshake failed: {}", e),
                    }
                });
            }
            Err(e) => {
                let _ = shared.events.send(ProcessEvent::Exited(ExitReport {
                    code: None,
                    diagnostic: format!("sshd accept failed: {}", e),
                    uptime: started_at.elapsed(),
                }));
                break;
            }
        }
    }
}

/// The SSH server of one reverse tunnel.
pub struct ReverseServerProcess {
    spec: ReverseServerSpec,
    trusted: Vec<PublicKeyMaterial>,
    keepalive_interval: Duration,
    host_key: Option<PrivateKey>,
    events_tx: mpsc::UnboundedSender<ProcessEvent>,
    events_rx: mpsc::UnboundedReceiver<ProcessEvent>,
    cancel: Option<CancellationToken>,
    accept_task: Option<JoinHandle<()>>,
    traffic: Arc<TrafficCounters>,
}

impl ReverseServerProcess {
    pub fn new(
        spec: ReverseServerSpec,
        trusted: Vec<PublicKeyMaterial>,
        keepalive_interval: Duration,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            spec,
            trusted,
            keepalive_interval,
            host_key: None,
            events_tx,
            events_rx,
            cancel: None,
            accept_task: None,
            traffic: Arc::default(),
        }
    }

    /// Reports traffic into `traffic` instead of private counters.
    pub fn with_traffic(mut self, traffic: Arc<TrafficCounters>) -> Self {
        self.traffic = traffic;
        self
    }

    pub fn traffic(&self) -> TunnelTraffic {
        self.traffic.snapshot()
    }

    /// The host key stays the same across restarts of one tunnel.
    fn host_key(&mut self) -> Result<PrivateKey, String> {
        if let Some(key) = &self.host_key {
            return Ok(key.clone());
        }
        let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
            .map_err(|e| format!("failed to generate host key: {}", e))?;
        self.host_key = Some(key.clone());
        Ok(key)
    }
}

#[async_trait]
impl ManagedProcess for ReverseServerProcess {
    async fn start(&mut self) -> Result<(), String> {
        if self.is_alive() {
            return Ok(());
        }
        // Events from a previous run are stale
        while self.events_rx.try_recv().is_ok() {}

        let host_key = self.host_key()?;
        let listen_addr = format!("{}:{}", self.spec.listen_host, self.spec.sshd_port);
        let listener = TcpListener::bind(&listen_addr)
            .await
            .map_err(|e| format!("failed to bind sshd on {}: {}", listen_addr, e))?;

        let config = Arc::new(server::Config {
            keys: vec![host_key],
            auth_rejection_time: Duration::from_millis(500),
            auth_rejection_time_initial: Some(Duration::ZERO),
            keepalive_interval: Some(self.keepalive_interval),
            ..Default::default()
        });

        let cancel = CancellationToken::new();
        let server = ReverseServer {
            shared: Arc::new(Shared {
                spec: self.spec.clone(),
                trusted: self.trusted.clone(),
                events: self.events_tx.clone(),
                active_forward: Mutex::new(None),
                traffic: self.traffic.clone(),
                cancel: cancel.clone(),
            }),
            next_session: Arc::new(AtomicU64::new(1)),
        };

        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            config,
            server,
            Instant::now(),
        )));
        self.cancel = Some(cancel);
        info!(tunnel_id = %self.spec.tunnel_id, %listen_addr, "reverse sshd listening");
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        self.accept_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    async fn next_event(&mut self) -> ProcessEvent {
        match self.events_rx.recv().await {
            Some(event) => event,
            // Unreachable while self holds a sender
            None => std::future::pending().await,
        }
    }

    async fn terminate(&mut self, grace: Duration) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(mut task) = self.accept_task.take()
            && tokio::time::timeout(grace, &mut task).await.is_err()
        {
            warn!(tunnel_id = %self.spec.tunnel_id, "sshd did not stop within {:?}", grace);
            task.abort();
        }
        debug!(tunnel_id = %self.spec.tunnel_id, "reverse sshd stopped");
    }

    fn name(&self) -> &'static str {
        "reverse-sshd"
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::keys::{accept_public_keys, issue};
    use tokio::io::AsyncReadExt;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .unwrap()
    }

    fn spec() -> ReverseServerSpec {
        let tunnel_port = free_port();
        ReverseServerSpec {
            tunnel_id: "r-1".to_string(),
            listen_host: "127.0.0.1".to_string(),
            sshd_port: free_port(),
            bind_host: "127.0.0.1".to_string(),
            bind_port: tunnel_port,
            tunnel_port,
        }
    }

    async fn next_event(process: &mut ReverseServerProcess) -> ProcessEvent {
        tokio::time::timeout(Duration::from_secs(10), process.next_event())
            .await
            .expect("event within timeout")
    }

    mod round_trip {
        use super::*;

        #[tokio::test]
        async fn test_trusted_peer_forward_becomes_ready_and_relays() {
            let key = issue().unwrap();
            let trusted = accept_public_keys(&[key.public.openssh.clone()]).unwrap();
            let spec = spec();
            let mut process =
                ReverseServerProcess::new(spec.clone(), trusted, Duration::from_secs(30));
            process.start().await.unwrap();
            assert!(process.is_alive());

            let mut peer = peer::connect(spec.sshd_port, key.key.clone())
                .await
                .unwrap()
                .expect("trusted key accepted");
            peer.tcpip_forward("localhost", u32::from(spec.tunnel_port))
                .await
                .unwrap();

            assert_eq!(
                next_event(&mut process).await,
                ProcessEvent::Ready {
                    host: "127.0.0.1".to_string(),
                    port: spec.bind_port,
                }
            );

            let mut conn = TcpStream::connect(("127.0.0.1", spec.bind_port))
                .await
                .unwrap();
            let mut buf = Vec::new();
            tokio::time::timeout(Duration::from_secs(5), conn.read_to_end(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(buf, b"hello");
            drop(conn);

            let mut traffic = process.traffic();
            for _ in 0..100 {
                if traffic.bytes_received == 5 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                traffic = process.traffic();
            }
            assert_eq!(traffic.connections, 1);
            assert_eq!(traffic.bytes_received, 5);
            assert_eq!(traffic.bytes_sent, 0);
            assert_eq!(traffic.forward_requests, 1);

            peer::disconnect(&peer).await;
            assert!(matches!(
                next_event(&mut process).await,
                ProcessEvent::ForwardClosed { .. }
            ));

            process.terminate(Duration::from_secs(1)).await;
            assert!(!process.is_alive());
        }
    }

    mod access_control {
        use super::*;

        #[tokio::test]
        async fn test_untrusted_key_is_rejected() {
            let trusted = accept_public_keys(&[issue().unwrap().public.openssh]).unwrap();
            let spec = spec();
            let mut process =
                ReverseServerProcess::new(spec.clone(), trusted, Duration::from_secs(30));
            process.start().await.unwrap();

            let stranger = issue().unwrap();
            let session = peer::connect(spec.sshd_port, stranger.key).await.unwrap();
            assert!(session.is_none());

            process.terminate(Duration::from_secs(1)).await;
        }

        #[tokio::test]
        async fn test_forward_for_other_port_is_refused() {
            let key = issue().unwrap();
            let trusted = accept_public_keys(&[key.public.openssh.clone()]).unwrap();
            let spec = spec();
            let mut process =
                ReverseServerProcess::new(spec.clone(), trusted, Duration::from_secs(30));
            process.start().await.unwrap();

            let mut peer = peer::connect(spec.sshd_port, key.key.clone())
                .await
                .unwrap()
                .unwrap();
            let other = u32::from(spec.tunnel_port.wrapping_add(1));
            assert!(peer.tcpip_forward("localhost", other).await.is_err());
            // Refused requests still count, nothing was relayed
            assert_eq!(process.traffic().forward_requests, 1);
            assert_eq!(process.traffic().connections, 0);

            peer::disconnect(&peer).await;
            process.terminate(Duration::from_secs(1)).await;
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn test_busy_sshd_port_fails_to_start() {
            let spec = spec();
            let _holder = std::net::TcpListener::bind(("127.0.0.1", spec.sshd_port)).unwrap();
            let mut process = ReverseServerProcess::new(spec, vec![], Duration::from_secs(30));
            let err = process.start().await.unwrap_err();
            assert!(err.contains("failed to bind sshd"));
            assert!(!process.is_alive());
        }

        #[tokio::test]
        async fn test_restart_after_terminate() {
            let spec = spec();
            let mut process = ReverseServerProcess::new(spec, vec![], Duration::from_secs(30));
            process.start().await.unwrap();
            process.terminate(Duration::from_secs(1)).await;
            assert!(!process.is_alive());

            process.start().await.unwrap();
            assert!(process.is_alive());
            process.terminate(Duration::from_secs(1)).await;
        }

        #[test]
        fn test_shared_traffic_counters() {
            let traffic = Arc::new(TrafficCounters::default());
            traffic.connections.fetch_add(2, Ordering::Relaxed);
            let process = ReverseServerProcess::new(spec(), vec![], Duration::from_secs(30))
                .with_traffic(traffic.clone());
            assert_eq!(process.traffic().connections, 2);
            assert_eq!(traffic.snapshot(), process.traffic());
        }
    }
}
