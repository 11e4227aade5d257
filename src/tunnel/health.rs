//! Health probes and the per-tunnel health scheduler.
//!
//! A scheduler task runs for every tunnel. On each tick, and whenever the
//! supervisor reports a new instance, it probes every instance of a live,
//! enabled tunnel and writes the results back as one set per instance. It
//! then nudges the tunnel between ACTIVE and DEGRADED. No other state is ever
//! touched here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::HealthSettings;
use super::error::{BrokerError, BrokerResult};
use super::registry::TunnelStore;
use super::types::{HealthStatus, TunnelHealthcheck, TunnelInstance, TunnelState};

pub const TCP_PROBE_ID: &str = "tcp-connect";
pub const HTTP_PROBE_ID: &str = "http-get";

/// How long the TCP probe waits for the far side to speak or hang up
const READ_WINDOW: Duration = Duration::from_secs(1);

/// Bytes the TCP probe reads at most
const READ_LIMIT: usize = 256;

/// A named check against one `host:port`.
///
/// Probes never fail; problems are reported as a CRITICAL result.
#[async_trait]
pub trait Probe: Send + Sync {
    fn id(&self) -> &'static str;

    async fn check(&self, host: &str, port: u16) -> TunnelHealthcheck;
}

/// Connects, then listens briefly for data or a hang-up.
///
/// A forwarding process accepts the local connection even when the far end
/// is unreachable and closes it right away, so an immediate clean EOF is
/// reported as WARNING rather than PASSING.
pub struct TcpConnectProbe {
    timeout: Duration,
    slow_threshold: Duration,
}

impl TcpConnectProbe {
    pub fn new(timeout: Duration, slow_threshold: Duration) -> Self {
        Self {
            timeout,
            slow_threshold,
        }
    }
}

#[async_trait]
impl Probe for TcpConnectProbe {
    fn id(&self) -> &'static str {
        TCP_PROBE_ID
    }

    async fn check(&self, host: &str, port: u16) -> TunnelHealthcheck {
        let started = Instant::now();
        let mut stream =
            match tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return TunnelHealthcheck::new(
                        TCP_PROBE_ID,
                        HealthStatus::Critical,
                        Some(format!("connect failed: {}", e)),
                    );
                }
                Err(_) => {
                    return TunnelHealthcheck::new(
                        TCP_PROBE_ID,
                        HealthStatus::Critical,
                        Some(format!("connect timed out after {:?}", self.timeout)),
                    );
                }
            };
        let connect_time = started.elapsed();

        let mut buf = [0u8; READ_LIMIT];
        let window = READ_WINDOW.min(self.timeout);
        match tokio::time::timeout(window, stream.read(&mut buf)).await {
            Ok(Err(e)) => TunnelHealthcheck::new(
                TCP_PROBE_ID,
                HealthStatus::Critical,
                Some(format!("read failed: {}", e)),
            ),
            Ok(Ok(0)) => TunnelHealthcheck::new(
                TCP_PROBE_ID,
                HealthStatus::Warning,
                Some("connection closed by the far side".to_string()),
            ),
            _ if connect_time > self.slow_threshold => TunnelHealthcheck::new(
                TCP_PROBE_ID,
                HealthStatus::Warning,
                Some(format!("slow connect: {:?}", connect_time)),
            ),
            // Data or silence
            _ => TunnelHealthcheck::new(TCP_PROBE_ID, HealthStatus::Passing, None),
        }
    }
}

/// `GET http://host:port<path>`.
///
/// 2xx is PASSING, 5xx and transport errors are CRITICAL, anything else or a
/// slow answer is WARNING.
pub struct HttpProbe {
    client: reqwest::Client,
    path: String,
    slow_threshold: Duration,
}

impl HttpProbe {
    pub fn new(path: &str, timeout: Duration, slow_threshold: Duration) -> BrokerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BrokerError::Internal(format!("failed to build http client: {}", e)))?;
        let path = match path.starts_with('/') {
            true => path.to_string(),
            false => format!("/{}", path),
        };
        Ok(Self {
            client,
            path,
            slow_threshold,
        })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    fn id(&self) -> &'static str {
        HTTP_PROBE_ID
    }

    async fn check(&self, host: &str, port: u16) -> TunnelHealthcheck {
        let url = format!("http://{}:{}{}", host, port, self.path);
        let started = Instant::now();
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                return TunnelHealthcheck::new(
                    HTTP_PROBE_ID,
                    HealthStatus::Critical,
                    Some(format!("GET {} failed: {}", url, e)),
                );
            }
        };
        let elapsed = started.elapsed();
        let status = response.status();

        if status.is_server_error() {
            TunnelHealthcheck::new(
                HTTP_PROBE_ID,
                HealthStatus::Critical,
                Some(format!("GET {} returned {}", url, status)),
            )
        } else if !status.is_success() {
            TunnelHealthcheck::new(
                HTTP_PROBE_ID,
                HealthStatus::Warning,
                Some(format!("GET {} returned {}", url, status)),
            )
        } else if elapsed > self.slow_threshold {
            TunnelHealthcheck::new(
                HTTP_PROBE_ID,
                HealthStatus::Warning,
                Some(format!("slow response: {:?}", elapsed)),
            )
        } else {
            TunnelHealthcheck::new(HTTP_PROBE_ID, HealthStatus::Passing, None)
        }
    }
}

/// The probe set for `settings`: TCP always, HTTP when a path is configured.
pub fn default_probes(settings: &HealthSettings) -> BrokerResult<Vec<Arc<dyn Probe>>> {
    let mut probes: Vec<Arc<dyn Probe>> = vec![Arc::new(TcpConnectProbe::new(
        settings.timeout,
        settings.slow_threshold,
    ))];
    if let Some(path) = &settings.http_path {
        probes.push(Arc::new(HttpProbe::new(
            path,
            settings.timeout,
            settings.slow_threshold,
        )?));
    }
    Ok(probes)
}

/// Probes the instances of one tunnel until cancelled.
pub struct HealthScheduler {
    tunnel_id: String,
    store: Arc<dyn TunnelStore>,
    probes: Arc<Vec<Arc<dyn Probe>>>,
    interval: Duration,
    probe_now: Arc<Notify>,
    cancel: CancellationToken,
}

impl HealthScheduler {
    pub fn new(
        tunnel_id: String,
        store: Arc<dyn TunnelStore>,
        probes: Arc<Vec<Arc<dyn Probe>>>,
        interval: Duration,
        probe_now: Arc<Notify>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tunnel_id,
            store,
            probes,
            interval,
            probe_now,
            cancel,
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.probe_now.notified() => {}
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.tick() => result,
            };
            match result {
                Ok(()) => {}
                Err(BrokerError::NotFound(_)) => break,
                // DELETING or a concurrent transition; the next tick re-reads
                Err(e) => debug!(tunnel_id = %self.tunnel_id, "health tick skipped: {}", e),
            }
        }
        debug!(tunnel_id = %self.tunnel_id, "health scheduler stopped");
    }

    /// Probes every instance once and applies the results.
    pub async fn tick(&self) -> BrokerResult<()> {
        let tunnel = self.store.get(&self.tunnel_id)?;
        if !tunnel.enabled || !tunnel.state.is_live() || tunnel.instances.is_empty() {
            return Ok(());
        }

        let results = join_all(
            tunnel
                .instances
                .iter()
                .map(|instance| self.probe_instance(instance)),
        )
        .await;

        let mut latest = None;
        for (host, port, checks) in results {
            latest = Some(
                self.store
                    .record_health(&self.tunnel_id, &host, port, checks)?,
            );
        }

        if let Some(latest) = latest {
            self.nudge(latest.state, latest.has_critical_instance());
        }
        Ok(())
    }

    async fn probe_instance(&self, instance: &TunnelInstance) -> (String, u16, Vec<TunnelHealthcheck>) {
        let checks = join_all(
            self.probes
                .iter()
                .map(|probe| probe.check(&instance.host, instance.port)),
        )
        .await;
        for check in checks.iter().filter(|c| c.status != HealthStatus::Passing) {
            debug!(
                tunnel_id = %self.tunnel_id,
                instance = %instance.address(),
                probe = %check.id,
                status = %check.status,
                message = check.message.as_deref().unwrap_or(""),
                "probe not passing"
            );
        }
        (instance.host.clone(), instance.port, checks)
    }

    fn nudge(&self, state: TunnelState, critical: bool) {
        let next = match (state, critical) {
            (TunnelState::Active, true) => TunnelState::Degraded,
            (TunnelState::Degraded, false) => TunnelState::Active,
            _ => return,
        };
        match self.store.update_state(&self.tunnel_id, state, next) {
            Ok(_) if next == TunnelState::Degraded => {
                warn!(tunnel_id = %self.tunnel_id, "tunnel degraded: critical healthcheck")
            }
            Ok(_) => info!(tunnel_id = %self.tunnel_id, "tunnel recovered"),
            Err(e) => debug!(tunnel_id = %self.tunnel_id, "health nudge lost a race: {}", e),
        }
    }
}
