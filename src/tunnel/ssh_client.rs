//! OpenSSH client subprocess backing a standard tunnel.
//!
//! The process runs `ssh -N -L bind:port:service:port user@bastion`. The broker
//! never touches the forwarded bytes; it only watches the process and the
//! local listening socket.
//!
//! Host keys are trusted on first use (`StrictHostKeyChecking=accept-new`)
//! with a per-tunnel known_hosts file, so a bastion that changes its key
//! mid-life fails the tunnel instead of being silently accepted.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::SshSettings;
use super::process::{ExitReport, ManagedProcess, ProcessEvent};
use super::types::StandardTunnel;

/// Lines of stderr kept for diagnostics
const STDERR_TAIL_LINES: usize = 20;

/// Delay between readiness connects
const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Upper bound on waiting for stderr to reach EOF after ssh exits
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Everything needed to launch the client for one tunnel.
#[derive(Debug, Clone)]
pub struct SshClientSpec {
    pub tunnel_id: String,
    pub bind_host: String,
    pub bind_port: u16,
    pub target: StandardTunnel,
}

/// Builds the OpenSSH argument list.
pub(crate) fn build_ssh_args(
    spec: &SshClientSpec,
    settings: &SshSettings,
    key_files: &[PathBuf],
    known_hosts: &Path,
) -> Vec<String> {
    let mut args = vec![
        "-N".to_string(),
        "-T".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "ExitOnForwardFailure=yes".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-o".to_string(),
        format!("UserKnownHostsFile={}", known_hosts.display()),
        "-o".to_string(),
        "IdentitiesOnly=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", settings.dial_timeout.as_secs().max(1)),
        "-o".to_string(),
        format!(
            "ServerAliveInterval={}",
            settings.keepalive_interval.as_secs().max(1)
        ),
        "-o".to_string(),
        "ServerAliveCountMax=3".to_string(),
    ];

    for key_file in key_files {
        args.push("-i".to_string());
        args.push(key_file.display().to_string());
    }

    args.push("-p".to_string());
    args.push(spec.target.ssh_port.to_string());
    args.push("-L".to_string());
    args.push(format!(
        "{}:{}:{}:{}",
        spec.bind_host, spec.bind_port, spec.target.service_host, spec.target.service_port
    ));
    args.push(format!("{}@{}", spec.target.ssh_user, spec.target.ssh_host));
    args
}

/// Writes `contents` to `path` readable only by the owner.
async fn write_private_file(path: &Path, contents: &str) -> std::io::Result<()> {
    tokio::fs::write(path, contents).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

/// The `ssh` client process of one standard tunnel.
pub struct SshClientProcess {
    spec: SshClientSpec,
    settings: SshSettings,
    private_keys: Vec<String>,
    key_files: Vec<PathBuf>,
    known_hosts: PathBuf,
    child: Option<Child>,
    started_at: Option<Instant>,
    ready_reported: bool,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_reader: Option<JoinHandle<()>>,
}

impl SshClientProcess {
    /// # Arguments
    ///
    /// * `spec` - Where to connect and what to forward
    /// * `settings` - Binary, timeouts and key directory
    /// * `private_keys` - OpenSSH private keys; written to disk only while running
    pub fn new(spec: SshClientSpec, settings: SshSettings, private_keys: Vec<String>) -> Self {
        let known_hosts = settings
            .key_dir
            .join(format!("{}.known_hosts", spec.tunnel_id));
        Self {
            spec,
            settings,
            private_keys,
            key_files: Vec::new(),
            known_hosts,
            child: None,
            started_at: None,
            ready_reported: false,
            stderr_tail: Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES))),
            stderr_reader: None,
        }
    }

    async fn write_key_files(&mut self) -> std::io::Result<()> {
        if !self.key_files.is_empty() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.settings.key_dir).await?;
        for (index, key) in self.private_keys.iter().enumerate() {
            let path = self
                .settings
                .key_dir
                .join(format!("{}-{}.key", self.spec.tunnel_id, index));
            let mut text = key.trim_end().to_string();
            text.push('\n');
            write_private_file(&path, &text).await?;
            self.key_files.push(path);
        }
        Ok(())
    }

    fn remove_files(&mut self) {
        for path in self.key_files.drain(..) {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!(path = %path.display(), "failed to remove key file: {}", e);
            }
        }
        let _ = std::fs::remove_file(&self.known_hosts);
    }

    fn diagnostic(&self) -> String {
        let tail = self.stderr_tail.lock();
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Waits for the stderr reader to hit EOF, then builds the exit report.
    ///
    /// The pipe closes when ssh exits, so the final lines (usually the
    /// actual cause) are in the tail before it is read.
    async fn collect_exit(
        &mut self,
        status: std::io::Result<std::process::ExitStatus>,
    ) -> ExitReport {
        if let Some(reader) = self.stderr_reader.take() {
            let abort = reader.abort_handle();
            if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, reader).await.is_err() {
                debug!(tunnel_id = %self.spec.tunnel_id, "stderr still open after ssh exited");
                abort.abort();
            }
        }
        self.exit_report(status)
    }

    fn exit_report(&mut self, status: std::io::Result<std::process::ExitStatus>) -> ExitReport {
        self.child = None;
        self.ready_reported = false;
        let uptime = self
            .started_at
            .take()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        let (code, fallback) = match status {
            Ok(status) => (status.code(), format!("ssh exited: {}", status)),
            Err(e) => (None, format!("failed to wait for ssh: {}", e)),
        };
        let diagnostic = match self.diagnostic() {
            tail if tail.trim().is_empty() => fallback,
            tail => tail,
        };
        ExitReport {
            code,
            diagnostic,
            uptime,
        }
    }

    fn bind_addr(&self) -> String {
        let host = match self.spec.bind_host.as_str() {
            "0.0.0.0" => "127.0.0.1",
            "::" => "::1",
            other => other,
        };
        format!("{}:{}", host, self.spec.bind_port)
    }

    async fn await_ready(&mut self) -> ProcessEvent {
        let grace = self.settings.startup_grace;
        let addr = self.bind_addr();

        let Some(child) = self.child.as_mut() else {
            return ProcessEvent::Exited(self.exit_report(Ok(Default::default())));
        };

        // The process must survive the grace period before anything else
        let early_exit = tokio::select! {
            status = child.wait() => Some(status),
            _ = tokio::time::sleep(grace) => None,
        };
        if let Some(status) = early_exit {
            return ProcessEvent::Exited(self.collect_exit(status).await);
        }

        let deadline = Instant::now() + self.settings.dial_timeout;
        loop {
            if let Some(child) = self.child.as_mut()
                && let Ok(Some(status)) = child.try_wait()
            {
                return ProcessEvent::Exited(self.collect_exit(Ok(status)).await);
            }
            if TcpStream::connect(&addr).await.is_ok() {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    tunnel_id = %self.spec.tunnel_id,
                    %addr,
                    "ssh is running but the forward is not accepting connections yet"
                );
                break;
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }

        self.ready_reported = true;
        ProcessEvent::Ready {
            host: self.spec.bind_host.clone(),
            port: self.spec.bind_port,
        }
    }
}

#[async_trait]
impl ManagedProcess for SshClientProcess {
    async fn start(&mut self) -> Result<(), String> {
        if self.is_alive() {
            return Ok(());
        }

        self.write_key_files()
            .await
            .map_err(|e| format!("failed to write key files: {}", e))?;

        let args = build_ssh_args(&self.spec, &self.settings, &self.key_files, &self.known_hosts);
        debug!(tunnel_id = %self.spec.tunnel_id, binary = %self.settings.binary, ?args, "spawning ssh");

        let mut child = Command::new(&self.settings.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to spawn {}: {}", self.settings.binary, e))?;

        if let Some(reader) = self.stderr_reader.take() {
            reader.abort();
        }
        self.stderr_tail.lock().clear();
        if let Some(stderr) = child.stderr.take() {
            let tail = self.stderr_tail.clone();
            let tunnel_id = self.spec.tunnel_id.clone();
            self.stderr_reader = Some(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(%tunnel_id, "ssh: {}", line);
                    let mut tail = tail.lock();
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }));
        }

        info!(
            tunnel_id = %self.spec.tunnel_id,
            pid = child.id().unwrap_or_default(),
            bastion = %format!("{}:{}", self.spec.target.ssh_host, self.spec.target.ssh_port),
            bind_port = self.spec.bind_port,
            "ssh client started"
        );
        self.child = Some(child);
        self.started_at = Some(Instant::now());
        self.ready_reported = false;
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn next_event(&mut self) -> ProcessEvent {
        if !self.ready_reported {
            return self.await_ready().await;
        }
        let status = match self.child.as_mut() {
            Some(child) => child.wait().await,
            None => return std::future::pending().await,
        };
        ProcessEvent::Exited(self.collect_exit(status).await)
    }

    async fn terminate(&mut self, grace: Duration) {
        if let Some(mut child) = self.child.take() {
            #[cfg(unix)]
            {
                use nix::sys::signal::{Signal, kill};
                use nix::unistd::Pid;

                match child.id() {
                    #[allow(clippy::cast_possible_wrap)]
                    Some(pid) => {
                        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                    }
                    None => {
                        let _ = child.start_kill();
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }

            match tokio::time::timeout(grace, child.wait()).await {
                Ok(_) => debug!(tunnel_id = %self.spec.tunnel_id, "ssh exited after SIGTERM"),
                Err(_) => {
                    warn!(
                        tunnel_id = %self.spec.tunnel_id,
                        "ssh ignored SIGTERM for {:?}, killing", grace
                    );
                    let _ = child.kill().await;
                }
            }
        }
        if let Some(reader) = self.stderr_reader.take() {
            reader.abort();
        }
        self.started_at = None;
        self.ready_reported = false;
        self.remove_files();
    }

    fn name(&self) -> &'static str {
        "ssh-client"
    }
}

impl Drop for SshClientProcess {
    fn drop(&mut self) {
        self.remove_files();
    }
}
