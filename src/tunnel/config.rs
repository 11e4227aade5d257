//! Broker configuration resolution.
//!
//! Every setting follows the same three-tier priority:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! Unparseable environment values are ignored and the default is used.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `TUNNEL_BIND_HOST` | 127.0.0.1 | Host standard tunnels bind and probes dial |
//! | `TUNNEL_REVERSE_BIND_HOST` | 0.0.0.0 | Host reverse SSH servers listen on |
//! | `TUNNEL_STANDARD_PORT_RANGE` | 40000-40999 | bindPort pool for standard tunnels |
//! | `TUNNEL_REVERSE_PORT_RANGE` | 41000-41999 | bindPort pool for reverse tunnels |
//! | `TUNNEL_SSHD_PORT_RANGE` | 42000-42999 | sshdPort pool for reverse tunnels |
//! | `TUNNEL_SSH_USER` | passage | Default SSH user for standard tunnels |
//! | `TUNNEL_SSH_BINARY` | ssh | OpenSSH client executable |
//! | `TUNNEL_KEY_DIR` | $TMPDIR/tunnel-broker | Private key files and known_hosts |
//! | `TUNNEL_DIAL_TIMEOUT` | 15s | SSH connect timeout in seconds |
//! | `TUNNEL_KEEPALIVE_INTERVAL` | 60s | SSH keepalive interval in seconds |
//! | `TUNNEL_STARTUP_GRACE_MS` | 1500ms | Time a process must survive before readiness |
//! | `TUNNEL_MAX_RESTARTS` | 5 | Restart attempts before FAILED |
//! | `TUNNEL_RESTART_DELAY_MS` | 1000ms | Initial restart backoff in milliseconds |
//! | `TUNNEL_MIN_UPTIME` | 30s | Uptime that resets the restart budget, in seconds |
//! | `TUNNEL_TERMINATE_GRACE` | 5s | Grace period between SIGTERM and kill, in seconds |
//! | `TUNNEL_HEALTHCHECK_INTERVAL` | 30s | Health tick in seconds |
//! | `TUNNEL_HEALTHCHECK_TIMEOUT` | 5s | Per-probe timeout in seconds |
//! | `TUNNEL_HEALTHCHECK_SLOW_MS` | 1000ms | Connect latency reported as WARNING |
//! | `TUNNEL_HEALTHCHECK_HTTP_PATH` | unset | Enables the HTTP GET probe |

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub(crate) const DEFAULT_BIND_HOST: &str = "127.0.0.1";
pub(crate) const DEFAULT_REVERSE_BIND_HOST: &str = "0.0.0.0";
pub(crate) const DEFAULT_STANDARD_PORT_RANGE: PortRange = PortRange::new(40000, 40999);
pub(crate) const DEFAULT_REVERSE_PORT_RANGE: PortRange = PortRange::new(41000, 41999);
pub(crate) const DEFAULT_SSHD_PORT_RANGE: PortRange = PortRange::new(42000, 42999);
pub(crate) const DEFAULT_SSH_USER: &str = "passage";
pub(crate) const DEFAULT_SSH_BINARY: &str = "ssh";
pub(crate) const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 15;
pub(crate) const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 60;
pub(crate) const DEFAULT_STARTUP_GRACE_MS: u64 = 1500;
pub(crate) const DEFAULT_MAX_RESTARTS: u32 = 5;
pub(crate) const DEFAULT_RESTART_DELAY_MS: u64 = 1000;
pub(crate) const DEFAULT_MIN_UPTIME_SECS: u64 = 30;
pub(crate) const DEFAULT_TERMINATE_GRACE_SECS: u64 = 5;
pub(crate) const DEFAULT_HEALTHCHECK_INTERVAL_SECS: u64 = 30;
pub(crate) const DEFAULT_HEALTHCHECK_TIMEOUT_SECS: u64 = 5;
pub(crate) const DEFAULT_HEALTHCHECK_SLOW_MS: u64 = 1000;

/// Restart backoff cap in seconds
pub(crate) const MAX_RESTART_DELAY_SECS: u64 = 30;

pub(crate) const BIND_HOST_ENV_VAR: &str = "TUNNEL_BIND_HOST";
pub(crate) const REVERSE_BIND_HOST_ENV_VAR: &str = "TUNNEL_REVERSE_BIND_HOST";
pub(crate) const STANDARD_PORT_RANGE_ENV_VAR: &str = "TUNNEL_STANDARD_PORT_RANGE";
pub(crate) const REVERSE_PORT_RANGE_ENV_VAR: &str = "TUNNEL_REVERSE_PORT_RANGE";
pub(crate) const SSHD_PORT_RANGE_ENV_VAR: &str = "TUNNEL_SSHD_PORT_RANGE";
pub(crate) const SSH_USER_ENV_VAR: &str = "TUNNEL_SSH_USER";
pub(crate) const SSH_BINARY_ENV_VAR: &str = "TUNNEL_SSH_BINARY";
pub(crate) const KEY_DIR_ENV_VAR: &str = "TUNNEL_KEY_DIR";
pub(crate) const DIAL_TIMEOUT_ENV_VAR: &str = "TUNNEL_DIAL_TIMEOUT";
pub(crate) const KEEPALIVE_INTERVAL_ENV_VAR: &str = "TUNNEL_KEEPALIVE_INTERVAL";
pub(crate) const STARTUP_GRACE_MS_ENV_VAR: &str = "TUNNEL_STARTUP_GRACE_MS";
pub(crate) const MAX_RESTARTS_ENV_VAR: &str = "TUNNEL_MAX_RESTARTS";
pub(crate) const RESTART_DELAY_MS_ENV_VAR: &str = "TUNNEL_RESTART_DELAY_MS";
pub(crate) const MIN_UPTIME_ENV_VAR: &str = "TUNNEL_MIN_UPTIME";
pub(crate) const TERMINATE_GRACE_ENV_VAR: &str = "TUNNEL_TERMINATE_GRACE";
pub(crate) const HEALTHCHECK_INTERVAL_ENV_VAR: &str = "TUNNEL_HEALTHCHECK_INTERVAL";
pub(crate) const HEALTHCHECK_TIMEOUT_ENV_VAR: &str = "TUNNEL_HEALTHCHECK_TIMEOUT";
pub(crate) const HEALTHCHECK_SLOW_MS_ENV_VAR: &str = "TUNNEL_HEALTHCHECK_SLOW_MS";
pub(crate) const HEALTHCHECK_HTTP_PATH_ENV_VAR: &str = "TUNNEL_HEALTHCHECK_HTTP_PATH";

/// An inclusive range of TCP ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            usize::from(self.end - self.start) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

impl FromStr for PortRange {
    type Err = String;

    /// Parses `start-end`, or a single port.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (start, end) = match s.split_once('-') {
            Some((start, end)) => (start.trim(), end.trim()),
            None => (s, s),
        };
        let start: u16 = start
            .parse()
            .map_err(|_| format!("invalid range start: {}", start))?;
        let end: u16 = end
            .parse()
            .map_err(|_| format!("invalid range end: {}", end))?;
        if start == 0 || start > end {
            return Err(format!("invalid port range: {}-{}", start, end));
        }
        Ok(PortRange::new(start, end))
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Resolve any parseable setting with priority: parameter -> env var -> default
fn resolve_parsed<T: FromStr>(param: Option<T>, env_var: &str, default: T) -> T {
    if let Some(value) = param {
        return value;
    }

    if let Ok(raw) = env::var(env_var)
        && let Ok(value) = raw.parse::<T>()
    {
        return value;
    }

    default
}

/// Resolve a string setting with priority: parameter -> env var -> default.
/// Blank environment values count as unset.
pub(crate) fn resolve_string(param: Option<String>, env_var: &str, default: &str) -> String {
    if let Some(value) = param {
        return value;
    }

    if let Ok(value) = env::var(env_var)
        && !value.trim().is_empty()
    {
        return value;
    }

    default.to_string()
}

/// Resolve a port range with priority: parameter -> env var -> default
pub(crate) fn resolve_port_range(
    param: Option<PortRange>,
    env_var: &str,
    default: PortRange,
) -> PortRange {
    resolve_parsed(param, env_var, default)
}

/// Resolve a duration given in seconds with priority: parameter -> env var -> default
pub(crate) fn resolve_secs(param: Option<u64>, env_var: &str, default_secs: u64) -> Duration {
    Duration::from_secs(resolve_parsed(param, env_var, default_secs))
}

/// Resolve a duration given in milliseconds with priority: parameter -> env var -> default
pub(crate) fn resolve_millis(param: Option<u64>, env_var: &str, default_ms: u64) -> Duration {
    Duration::from_millis(resolve_parsed(param, env_var, default_ms))
}

/// Resolve the restart budget with priority: parameter -> env var -> default
pub(crate) fn resolve_max_restarts(max_restarts_param: Option<u32>) -> u32 {
    // Priority 1: Use parameter if provided
    if let Some(max_restarts) = max_restarts_param {
        return max_restarts;
    }

    // Priority 2: Use environment variable if set
    if let Ok(env_restarts) = env::var(MAX_RESTARTS_ENV_VAR)
        && let Ok(restarts) = env_restarts.parse::<u32>()
    {
        return restarts;
    }

    // Priority 3: Default value
    DEFAULT_MAX_RESTARTS
}

/// Resolve the optional HTTP probe path. Unset or blank disables the probe.
pub(crate) fn resolve_http_probe_path(param: Option<String>) -> Option<String> {
    if param.is_some() {
        return param;
    }

    env::var(HEALTHCHECK_HTTP_PATH_ENV_VAR)
        .ok()
        .filter(|path| !path.trim().is_empty())
}

fn default_key_dir() -> PathBuf {
    env::temp_dir().join("tunnel-broker")
}

/// Settings for the SSH processes backing tunnels.
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub default_user: String,
    pub binary: String,
    pub key_dir: PathBuf,
    pub dial_timeout: Duration,
    pub keepalive_interval: Duration,
    pub startup_grace: Duration,
}

/// Restart and teardown policy of the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub max_restarts: u32,
    pub restart_delay: Duration,
    pub max_restart_delay: Duration,
    pub min_uptime: Duration,
    pub terminate_grace: Duration,
}

/// Health scheduler settings.
#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub slow_threshold: Duration,
    pub http_path: Option<String>,
}

/// Resolved broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind_host: String,
    pub reverse_bind_host: String,
    pub standard_ports: PortRange,
    pub reverse_ports: PortRange,
    pub sshd_ports: PortRange,
    pub ssh: SshSettings,
    pub supervisor: SupervisorSettings,
    pub health: HealthSettings,
}

impl BrokerConfig {
    /// Resolves every setting from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind_host: resolve_string(None, BIND_HOST_ENV_VAR, DEFAULT_BIND_HOST),
            reverse_bind_host: resolve_string(
                None,
                REVERSE_BIND_HOST_ENV_VAR,
                DEFAULT_REVERSE_BIND_HOST,
            ),
            standard_ports: resolve_port_range(
                None,
                STANDARD_PORT_RANGE_ENV_VAR,
                DEFAULT_STANDARD_PORT_RANGE,
            ),
            reverse_ports: resolve_port_range(
                None,
                REVERSE_PORT_RANGE_ENV_VAR,
                DEFAULT_REVERSE_PORT_RANGE,
            ),
            sshd_ports: resolve_port_range(None, SSHD_PORT_RANGE_ENV_VAR, DEFAULT_SSHD_PORT_RANGE),
            ssh: SshSettings {
                default_user: resolve_string(None, SSH_USER_ENV_VAR, DEFAULT_SSH_USER),
                binary: resolve_string(None, SSH_BINARY_ENV_VAR, DEFAULT_SSH_BINARY),
                key_dir: env::var(KEY_DIR_ENV_VAR)
                    .ok()
                    .filter(|dir| !dir.trim().is_empty())
                    .map(PathBuf::from)
                    .unwrap_or_else(default_key_dir),
                dial_timeout: resolve_secs(None, DIAL_TIMEOUT_ENV_VAR, DEFAULT_DIAL_TIMEOUT_SECS),
                keepalive_interval: resolve_secs(
                    None,
                    KEEPALIVE_INTERVAL_ENV_VAR,
                    DEFAULT_KEEPALIVE_INTERVAL_SECS,
                ),
                startup_grace: resolve_millis(
                    None,
                    STARTUP_GRACE_MS_ENV_VAR,
                    DEFAULT_STARTUP_GRACE_MS,
                ),
            },
            supervisor: SupervisorSettings {
                max_restarts: resolve_max_restarts(None),
                restart_delay: resolve_millis(
                    None,
                    RESTART_DELAY_MS_ENV_VAR,
                    DEFAULT_RESTART_DELAY_MS,
                ),
                max_restart_delay: Duration::from_secs(MAX_RESTART_DELAY_SECS),
                min_uptime: resolve_secs(None, MIN_UPTIME_ENV_VAR, DEFAULT_MIN_UPTIME_SECS),
                terminate_grace: resolve_secs(
                    None,
                    TERMINATE_GRACE_ENV_VAR,
                    DEFAULT_TERMINATE_GRACE_SECS,
                ),
            },
            health: HealthSettings {
                interval: resolve_secs(
                    None,
                    HEALTHCHECK_INTERVAL_ENV_VAR,
                    DEFAULT_HEALTHCHECK_INTERVAL_SECS,
                ),
                timeout: resolve_secs(
                    None,
                    HEALTHCHECK_TIMEOUT_ENV_VAR,
                    DEFAULT_HEALTHCHECK_TIMEOUT_SECS,
                ),
                slow_threshold: resolve_millis(
                    None,
                    HEALTHCHECK_SLOW_MS_ENV_VAR,
                    DEFAULT_HEALTHCHECK_SLOW_MS,
                ),
                http_path: resolve_http_probe_path(None),
            },
        }
    }
}

impl Default for BrokerConfig {
    /// Built-in defaults, ignoring the environment.
    fn default() -> Self {
        Self {
            bind_host: DEFAULT_BIND_HOST.to_string(),
            reverse_bind_host: DEFAULT_REVERSE_BIND_HOST.to_string(),
            standard_ports: DEFAULT_STANDARD_PORT_RANGE,
            reverse_ports: DEFAULT_REVERSE_PORT_RANGE,
            sshd_ports: DEFAULT_SSHD_PORT_RANGE,
            ssh: SshSettings {
                default_user: DEFAULT_SSH_USER.to_string(),
                binary: DEFAULT_SSH_BINARY.to_string(),
                key_dir: default_key_dir(),
                dial_timeout: Duration::from_secs(DEFAULT_DIAL_TIMEOUT_SECS),
                keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_INTERVAL_SECS),
                startup_grace: Duration::from_millis(DEFAULT_STARTUP_GRACE_MS),
            },
            supervisor: SupervisorSettings {
                max_restarts: DEFAULT_MAX_RESTARTS,
                restart_delay: Duration::from_millis(DEFAULT_RESTART_DELAY_MS),
                max_restart_delay: Duration::from_secs(MAX_RESTART_DELAY_SECS),
                min_uptime: Duration::from_secs(DEFAULT_MIN_UPTIME_SECS),
                terminate_grace: Duration::from_secs(DEFAULT_TERMINATE_GRACE_SECS),
            },
            health: HealthSettings {
                interval: Duration::from_secs(DEFAULT_HEALTHCHECK_INTERVAL_SECS),
                timeout: Duration::from_secs(DEFAULT_HEALTHCHECK_TIMEOUT_SECS),
                slow_threshold: Duration::from_millis(DEFAULT_HEALTHCHECK_SLOW_MS),
                http_path: None,
            },
        }
    }
}
