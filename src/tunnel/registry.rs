//! Tunnel registry: the single source of truth for tunnel records.
//!
//! All mutations go through compare-and-swap style operations on one record
//! at a time. Records in DELETING reject every write except the final
//! removal, so a late supervisor or scheduler write can never resurrect a
//! tunnel that is being torn down.

use dashmap::DashMap;
use tracing::debug;

use super::error::{BrokerError, BrokerResult};
use super::types::{Tunnel, TunnelHealthcheck, TunnelInstance, TunnelKind, TunnelState};

/// Optional side effects applied together with a state transition.
#[derive(Debug, Clone, Default)]
pub struct StateChange {
    /// Replace the instance list
    pub instances: Option<Vec<TunnelInstance>>,
    /// Replace the error detail (`Some(None)` clears it)
    pub error: Option<Option<String>>,
}

impl StateChange {
    pub fn instances(instances: Vec<TunnelInstance>) -> Self {
        Self {
            instances: Some(instances),
            error: None,
        }
    }

    pub fn error(error: Option<String>) -> Self {
        Self {
            instances: None,
            error: Some(error),
        }
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = Some(error);
        self
    }
}

/// What `begin_delete` found.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteStart {
    /// The tunnel moved to DELETING; the caller owns the teardown
    Started(Tunnel),
    /// Another caller already started the teardown
    InProgress,
    /// The record was already removed
    AlreadyDeleted,
}

/// Storage operations for tunnel records.
///
/// Implementations must be thread-safe (`Send + Sync`) and apply each
/// operation atomically with respect to a single tunnel id.
pub trait TunnelStore: Send + Sync {
    /// Insert a new record. Fails with `AlreadyExists` on id collision.
    fn create(&self, tunnel: Tunnel) -> BrokerResult<String>;

    /// Read a record. Fails with `NotFound`.
    fn get(&self, id: &str) -> BrokerResult<Tunnel>;

    /// All records, oldest first, optionally filtered by kind.
    fn list(&self, kind: Option<TunnelKind>) -> Vec<Tunnel>;

    /// Move `expected -> next` and apply `change` in the same step.
    ///
    /// Fails with `Conflict` when the current state is not `expected`, and
    /// with `Internal` when `expected -> next` is not a state machine edge.
    fn transition(
        &self,
        id: &str,
        expected: TunnelState,
        next: TunnelState,
        change: StateChange,
    ) -> BrokerResult<Tunnel>;

    /// Compare-and-swap on the state alone.
    fn update_state(
        &self,
        id: &str,
        expected: TunnelState,
        next: TunnelState,
    ) -> BrokerResult<Tunnel> {
        self.transition(id, expected, next, StateChange::default())
    }

    /// Update the error detail without changing state.
    fn set_error(&self, id: &str, error: Option<String>) -> BrokerResult<Tunnel>;

    /// Toggle the `enabled` flag.
    fn set_enabled(&self, id: &str, enabled: bool) -> BrokerResult<Tunnel>;

    /// Replace the probe results of the instance at `host:port` as one set.
    fn record_health(
        &self,
        id: &str,
        host: &str,
        port: u16,
        checks: Vec<TunnelHealthcheck>,
    ) -> BrokerResult<Tunnel>;

    /// Mark the tunnel DELETING and drop its instances.
    fn begin_delete(&self, id: &str) -> BrokerResult<DeleteStart>;

    /// Remove a DELETING record once its process is gone.
    fn finish_delete(&self, id: &str) -> BrokerResult<Tunnel>;
}

/// DashMap-based implementation of [`TunnelStore`].
///
/// Removed ids are remembered so repeated deletes stay idempotent.
pub struct MemoryTunnelStore {
    tunnels: DashMap<String, Tunnel>,
    deleted: DashMap<String, ()>,
}

impl MemoryTunnelStore {
    pub fn new() -> Self {
        Self {
            tunnels: DashMap::new(),
            deleted: DashMap::new(),
        }
    }

    fn writable<'a>(
        &'a self,
        id: &str,
    ) -> BrokerResult<dashmap::mapref::one::RefMut<'a, String, Tunnel>> {
        let entry = self
            .tunnels
            .get_mut(id)
            .ok_or_else(|| BrokerError::NotFound(id.to_string()))?;
        if entry.state.is_deleting() {
            return Err(BrokerError::Conflict {
                id: id.to_string(),
                expected: TunnelState::Active,
                actual: entry.state,
            });
        }
        Ok(entry)
    }
}

impl Default for MemoryTunnelStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelStore for MemoryTunnelStore {
    fn create(&self, tunnel: Tunnel) -> BrokerResult<String> {
        use dashmap::mapref::entry::Entry;

        let id = tunnel.id.clone();
        if self.deleted.contains_key(&id) {
            return Err(BrokerError::AlreadyExists(id));
        }
        match self.tunnels.entry(id.clone()) {
            Entry::Occupied(_) => Err(BrokerError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(tunnel);
                debug!(tunnel_id = %id, "tunnel record created");
                Ok(id)
            }
        }
    }

    fn get(&self, id: &str) -> BrokerResult<Tunnel> {
        self.tunnels
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BrokerError::NotFound(id.to_string()))
    }

    fn list(&self, kind: Option<TunnelKind>) -> Vec<Tunnel> {
        let mut tunnels: Vec<Tunnel> = self
            .tunnels
            .iter()
            .filter(|entry| kind.is_none_or(|k| entry.kind() == k))
            .map(|entry| entry.value().clone())
            .collect();
        tunnels.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tunnels
    }

    fn transition(
        &self,
        id: &str,
        expected: TunnelState,
        next: TunnelState,
        change: StateChange,
    ) -> BrokerResult<Tunnel> {
        let mut entry = self
            .tunnels
            .get_mut(id)
            .ok_or_else(|| BrokerError::NotFound(id.to_string()))?;

        if entry.state != expected {
            return Err(BrokerError::Conflict {
                id: id.to_string(),
                expected,
                actual: entry.state,
            });
        }
        if expected != next && !expected.can_transition_to(next) {
            return Err(BrokerError::Internal(format!(
                "illegal transition {} -> {} on tunnel {}",
                expected, next, id
            )));
        }

        entry.state = next;
        if let Some(instances) = change.instances {
            entry.instances = instances;
        }
        if let Some(error) = change.error {
            entry.error = error;
        }
        debug!(tunnel_id = %id, from = %expected, to = %next, "tunnel state updated");
        Ok(entry.value().clone())
    }

    fn set_error(&self, id: &str, error: Option<String>) -> BrokerResult<Tunnel> {
        let mut entry = self.writable(id)?;
        entry.error = error;
        Ok(entry.value().clone())
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> BrokerResult<Tunnel> {
        let mut entry = self.writable(id)?;
        entry.enabled = enabled;
        Ok(entry.value().clone())
    }

    fn record_health(
        &self,
        id: &str,
        host: &str,
        port: u16,
        checks: Vec<TunnelHealthcheck>,
    ) -> BrokerResult<Tunnel> {
        let mut entry = self.writable(id)?;
        if let Some(instance) = entry
            .instances
            .iter_mut()
            .find(|i| i.host == host && i.port == port)
        {
            instance.apply_healthchecks(checks);
        }
        Ok(entry.value().clone())
    }

    fn begin_delete(&self, id: &str) -> BrokerResult<DeleteStart> {
        if self.deleted.contains_key(id) {
            return Ok(DeleteStart::AlreadyDeleted);
        }
        let Some(mut entry) = self.tunnels.get_mut(id) else {
            // Lost a race with finish_delete
            if self.deleted.contains_key(id) {
                return Ok(DeleteStart::AlreadyDeleted);
            }
            return Err(BrokerError::NotFound(id.to_string()));
        };
        if entry.state.is_deleting() {
            return Ok(DeleteStart::InProgress);
        }

        let from = entry.state;
        entry.state = TunnelState::Deleting;
        entry.instances.clear();
        debug!(tunnel_id = %id, %from, "tunnel marked for deletion");
        Ok(DeleteStart::Started(entry.value().clone()))
    }

    fn finish_delete(&self, id: &str) -> BrokerResult<Tunnel> {
        let removed = self
            .tunnels
            .remove_if(id, |_, tunnel| tunnel.state == TunnelState::Deleting);
        match removed {
            Some((id, mut tunnel)) => {
                self.deleted.insert(id.clone(), ());
                tunnel.state = TunnelState::Deleted;
                debug!(tunnel_id = %id, "tunnel record removed");
                Ok(tunnel)
            }
            None => match self.tunnels.get(id) {
                Some(entry) => Err(BrokerError::Conflict {
                    id: id.to_string(),
                    expected: TunnelState::Deleting,
                    actual: entry.state,
                }),
                None => Err(BrokerError::NotFound(id.to_string())),
            },
        }
    }
}
