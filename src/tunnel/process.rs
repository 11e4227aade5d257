//! The narrow interface the supervisor uses to drive whatever backs a tunnel.
//!
//! A standard tunnel is backed by an OpenSSH client subprocess, a reverse
//! tunnel by an in-process SSH server. The supervisor's restart and teardown
//! logic only sees [`ManagedProcess`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

/// How a run of the process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, when the process exited normally
    pub code: Option<i32>,
    /// Human-readable cause, usually the tail of stderr
    pub diagnostic: String,
    /// How long the run lasted
    pub uptime: Duration,
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exited with status {}: {}", code, self.diagnostic),
            None => write!(f, "terminated: {}", self.diagnostic),
        }
    }
}

/// Observable lifecycle signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// Forwarding is up and reachable at `host:port`
    Ready { host: String, port: u16 },
    /// A forwarded session went away but the process lives on
    ForwardClosed { reason: String },
    /// The process is gone
    Exited(ExitReport),
}

/// Start, observe and stop the thing backing one tunnel.
///
/// Implementations must be restartable: `start` may be called again after an
/// `Exited` event.
#[async_trait]
pub trait ManagedProcess: Send {
    /// Launch the process.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - The process was spawned; readiness arrives as an event
    /// * `Err(diagnostic)` - It could not be spawned at all
    async fn start(&mut self) -> Result<(), String>;

    /// Whether the process is currently running.
    fn is_alive(&mut self) -> bool;

    /// Wait for the next lifecycle event. Must be cancel-safe.
    async fn next_event(&mut self) -> ProcessEvent;

    /// Ask the process to stop, force it after `grace`, and release its
    /// resources. Calling it on a stopped process is a no-op.
    async fn terminate(&mut self, grace: Duration);

    /// Short name for logs.
    fn name(&self) -> &'static str;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_report_display() {
        let report = ExitReport {
            code: Some(255),
            diagnostic: "Connection refused".to_string(),
            uptime: Duration::from_secs(1),
        };
        assert_eq!(
            report.to_string(),
            "exited with status 255: Connection refused"
        );

        let killed = ExitReport {
            code: None,
            ..report
        };
        assert!(killed.to_string().starts_with("terminated"));
    }

    #[tokio::test]
    async fn test_scripted_process_replays_events() {
        let (mut process, handle) = fake::ScriptedProcess::always_ready("127.0.0.1", 40000);
        process.start().await.unwrap();
        assert!(process.is_alive());
        assert_eq!(
            process.next_event().await,
            ProcessEvent::Ready {
                host: "127.0.0.1".to_string(),
                port: 40000
            }
        );

        handle.emit(fake::exited("boom"));
        assert!(matches!(process.next_event().await, ProcessEvent::Exited(_)));
        assert!(!process.is_alive());
        assert_eq!(handle.starts(), 1);
    }
}
