//! Per-tunnel process supervisor.
//!
//! The supervisor owns the [`ManagedProcess`] of one tunnel and is the only
//! writer of that tunnel's lifecycle state (apart from the health scheduler's
//! ACTIVE/DEGRADED nudges and the broker's delete).
//!
//! # Restart policy
//!
//! Failures are classified with [`is_retryable_failure`]. Configuration
//! problems (unknown host, rejected key, bad arguments) fail the tunnel at
//! once. Everything else is relaunched with exponential backoff and jitter via
//! the `backon` crate. A run that stayed up for at least `min_uptime` resets
//! the restart budget. When the budget is spent the tunnel goes to FAILED with
//! the last diagnostic as its error.
//!
//! Every registry write is compare-and-swap. A write that loses to a delete
//! (the record is DELETING or gone) stops the supervisor quietly.

use std::sync::Arc;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::SupervisorSettings;
use super::error::{BrokerError, BrokerResult, is_retryable_failure};
use super::process::{ExitReport, ManagedProcess, ProcessEvent};
use super::registry::{StateChange, TunnelStore};
use super::types::{HealthStatus, TunnelHealthcheck, TunnelInstance, TunnelState};

/// Healthcheck id recorded when the backing process dies
pub(crate) const PROCESS_CHECK_ID: &str = "process";

/// Healthcheck id recorded when a reverse forward drops
pub(crate) const FORWARD_CHECK_ID: &str = "forward";

/// Attempts at a read-modify-write before giving up on a busy record
const CAS_ATTEMPTS: usize = 5;

/// Why a supervised run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Cancelled, or the record went away
    Stopped,
    /// The tunnel was disabled
    Disabled,
    /// The tunnel reached FAILED
    Failed,
}

/// Supervises one tunnel until cancelled.
pub struct Supervisor {
    tunnel_id: String,
    process: Box<dyn ManagedProcess>,
    store: Arc<dyn TunnelStore>,
    settings: SupervisorSettings,
    /// Wakes the health scheduler when an instance appears
    probe_now: Arc<Notify>,
    enabled: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(
        tunnel_id: String,
        process: Box<dyn ManagedProcess>,
        store: Arc<dyn TunnelStore>,
        settings: SupervisorSettings,
        probe_now: Arc<Notify>,
        enabled: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tunnel_id,
            process,
            store,
            settings,
            probe_now,
            enabled,
            cancel,
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(self.settings.restart_delay)
            .with_max_delay(self.settings.max_restart_delay)
            .with_max_times(self.settings.max_restarts as usize)
            .with_jitter()
            .build()
    }

    /// Drives the tunnel from CREATING until cancellation, then stops the
    /// process within the terminate grace period.
    pub async fn run(mut self) {
        let started = self
            .store
            .update_state(&self.tunnel_id, TunnelState::Creating, TunnelState::Establishing);
        if let Err(e) = started {
            debug!(tunnel_id = %self.tunnel_id, "not starting supervisor: {}", e);
            return;
        }
        info!(tunnel_id = %self.tunnel_id, process = self.process.name(), "supervisor started");

        loop {
            let enabled = *self.enabled.borrow();
            if !enabled && !self.wait_until_enabled().await {
                break;
            }

            match self.run_enabled().await {
                Outcome::Stopped => break,
                Outcome::Disabled => {
                    self.process.terminate(self.settings.terminate_grace).await;
                    if self.pause().is_err() {
                        break;
                    }
                    info!(tunnel_id = %self.tunnel_id, "tunnel disabled, process stopped");
                }
                Outcome::Failed => {
                    self.process.terminate(self.settings.terminate_grace).await;
                    self.cancel.cancelled().await;
                    break;
                }
            }
        }

        self.process.terminate(self.settings.terminate_grace).await;
        debug!(tunnel_id = %self.tunnel_id, "supervisor stopped");
    }

    /// Returns false when cancelled before the tunnel was re-enabled.
    async fn wait_until_enabled(&mut self) -> bool {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                changed = self.enabled.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                    if *self.enabled.borrow() {
                        info!(tunnel_id = %self.tunnel_id, "tunnel enabled, relaunching");
                        return true;
                    }
                }
            }
        }
    }

    /// Launch, watch and relaunch the process while the tunnel is enabled.
    async fn run_enabled(&mut self) -> Outcome {
        let mut backoff = self.backoff();

        loop {
            let report = match self.process.start().await {
                Ok(()) => match self.watch().await {
                    Ok(report) => report,
                    Err(outcome) => return outcome,
                },
                Err(diagnostic) => ExitReport {
                    code: None,
                    diagnostic,
                    uptime: Default::default(),
                },
            };

            if report.uptime >= self.settings.min_uptime {
                backoff = self.backoff();
            }
            if let Err(outcome) = self.after_exit(&report, &mut backoff).await {
                return outcome;
            }
        }
    }

    /// Follows process events until the process exits.
    async fn watch(&mut self) -> Result<ExitReport, Outcome> {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Outcome::Stopped),
                changed = self.enabled.changed() => {
                    if changed.is_err() {
                        return Err(Outcome::Stopped);
                    }
                    if !*self.enabled.borrow() {
                        return Err(Outcome::Disabled);
                    }
                    continue;
                }
                event = self.process.next_event() => event,
            };

            let applied = match event {
                ProcessEvent::Ready { host, port } => self.on_ready(host, port),
                ProcessEvent::ForwardClosed { reason } => self.on_forward_closed(reason),
                ProcessEvent::Exited(report) => return Ok(report),
            };
            if let Err(e) = applied {
                debug!(tunnel_id = %self.tunnel_id, "stopping supervisor: {}", e);
                return Err(Outcome::Stopped);
            }
        }
    }

    fn on_ready(&self, host: String, port: u16) -> BrokerResult<()> {
        let change = StateChange::instances(vec![TunnelInstance::unprobed(host.clone(), port)])
            .with_error(None);
        let moved = self.transition_from(
            &[
                TunnelState::Establishing,
                TunnelState::Degraded,
                TunnelState::Active,
            ],
            TunnelState::Active,
            |_| change.clone(),
        )?;
        if moved {
            info!(tunnel_id = %self.tunnel_id, %host, port, "tunnel active");
            self.probe_now.notify_one();
        }
        Ok(())
    }

    fn on_forward_closed(&self, reason: String) -> BrokerResult<()> {
        let moved = self.transition_from(
            &[TunnelState::Active, TunnelState::Degraded],
            TunnelState::Degraded,
            |instances| StateChange::instances(mark_critical(instances, FORWARD_CHECK_ID, &reason)),
        )?;
        if moved {
            warn!(tunnel_id = %self.tunnel_id, %reason, "forward closed, waiting for peer");
        }
        Ok(())
    }

    /// Decides between relaunch and FAILED after a run ended.
    async fn after_exit(
        &mut self,
        report: &ExitReport,
        backoff: &mut ExponentialBackoff,
    ) -> Result<(), Outcome> {
        let diagnostic = report.to_string();

        if !is_retryable_failure(&report.diagnostic) {
            warn!(tunnel_id = %self.tunnel_id, %diagnostic, "permanent failure, not retrying");
            return Err(self.fail(diagnostic));
        }

        let Some(delay) = backoff.next() else {
            warn!(
                tunnel_id = %self.tunnel_id,
                max_restarts = self.settings.max_restarts,
                %diagnostic,
                "restart budget exhausted"
            );
            return Err(self.fail(diagnostic));
        };

        warn!(tunnel_id = %self.tunnel_id, %diagnostic, ?delay, "process stopped, relaunching");
        let recorded = self
            .transition_from(
                &[TunnelState::Active, TunnelState::Degraded],
                TunnelState::Degraded,
                |instances| {
                    StateChange::instances(mark_critical(instances, PROCESS_CHECK_ID, &diagnostic))
                        .with_error(Some(diagnostic.clone()))
                },
            )
            .and_then(|moved| match moved {
                true => Ok(()),
                false => self
                    .store
                    .set_error(&self.tunnel_id, Some(diagnostic.clone()))
                    .map(|_| ()),
            });
        if recorded.is_err() {
            return Err(Outcome::Stopped);
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Outcome::Stopped),
            changed = self.enabled.changed() => match changed {
                Ok(()) if !*self.enabled.borrow() => Err(Outcome::Disabled),
                Ok(()) => Ok(()),
                Err(_) => Err(Outcome::Stopped),
            },
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Moves the tunnel to FAILED from whatever state it is in.
    fn fail(&self, diagnostic: String) -> Outcome {
        let result = self.transition_from(
            &[
                TunnelState::Creating,
                TunnelState::Establishing,
                TunnelState::Active,
                TunnelState::Degraded,
            ],
            TunnelState::Failed,
            |_| StateChange::instances(Vec::new()).with_error(Some(diagnostic.clone())),
        );
        match result {
            Ok(true) => Outcome::Failed,
            _ => Outcome::Stopped,
        }
    }

    /// ACTIVE/DEGRADED back to ESTABLISHING after the process was stopped.
    fn pause(&self) -> BrokerResult<()> {
        self.transition_from(
            &[TunnelState::Active, TunnelState::Degraded],
            TunnelState::Establishing,
            |_| StateChange::instances(Vec::new()),
        )
        .map(|_| ())
    }

    /// Re-reads the record and applies `next` if its state is one of `from`.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The transition was applied
    /// * `Ok(false)` - The record is in a state outside `from`
    /// * `Err(_)` - The record is gone or being deleted
    fn transition_from<F>(
        &self,
        from: &[TunnelState],
        next: TunnelState,
        change: F,
    ) -> BrokerResult<bool>
    where
        F: Fn(&[TunnelInstance]) -> StateChange,
    {
        for _ in 0..CAS_ATTEMPTS {
            let tunnel = self.store.get(&self.tunnel_id)?;
            if tunnel.state.is_deleting() {
                return Err(BrokerError::Conflict {
                    id: self.tunnel_id.clone(),
                    expected: from.first().copied().unwrap_or(next),
                    actual: tunnel.state,
                });
            }
            if !from.contains(&tunnel.state) {
                return Ok(false);
            }
            match self.store.transition(
                &self.tunnel_id,
                tunnel.state,
                next,
                change(&tunnel.instances),
            ) {
                Ok(_) => return Ok(true),
                // Lost a race with the health scheduler, re-read
                Err(BrokerError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(BrokerError::Internal(format!(
            "tunnel {} kept changing under the supervisor",
            self.tunnel_id
        )))
    }
}

fn mark_critical(instances: &[TunnelInstance], check_id: &str, message: &str) -> Vec<TunnelInstance> {
    instances
        .iter()
        .cloned()
        .map(|mut instance| {
            instance.apply_healthchecks(vec![TunnelHealthcheck::new(
                check_id,
                HealthStatus::Critical,
                Some(message.to_string()),
            )]);
            instance
        })
        .collect()
}
