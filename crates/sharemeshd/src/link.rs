//! Upstream and downstream link slots
//!
//! Each slot runs `Disconnected -> Connecting -> Connected -> Disconnected`.
//! Every `begin_connect` bumps the slot generation; the task driving that
//! attempt passes its generation back on every later transition, so a task
//! resuming after an await cannot touch a slot that has since moved on.

use parking_lot::RwLock;
use sharemesh_core::SharedRecord;
use sharemesh_net::{ConnectionState, PeerHandle, PeerRole};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Slot {
    handle: Option<PeerHandle>,
    generation: u64,
    /// Outbound queue of a connected downstream link
    outbound: Option<mpsc::Sender<SharedRecord>>,
}

impl Slot {
    fn occupant(&self) -> Option<&str> {
        self.handle
            .as_ref()
            .filter(|handle| handle.is_occupying())
            .map(|handle| handle.host.as_str())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.occupant().is_some()
    }
}

/// Holder of the two link directions
#[derive(Debug, Default)]
pub struct LinkManager {
    upstream: RwLock<Slot>,
    downstream: RwLock<Slot>,
}

impl LinkManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, role: PeerRole) -> &RwLock<Slot> {
        match role {
            PeerRole::Upstream => &self.upstream,
            PeerRole::Downstream => &self.downstream,
        }
    }

    /// Snapshot of a slot's handle
    pub fn handle(&self, role: PeerRole) -> Option<PeerHandle> {
        self.slot(role).read().handle.clone()
    }

    /// Current state of a slot
    pub fn state(&self, role: PeerRole) -> ConnectionState {
        self.slot(role)
            .read()
            .handle
            .as_ref()
            .map(|handle| handle.state)
            .unwrap_or_default()
    }

    /// Host holding a slot, if connecting or connected
    pub fn occupant(&self, role: PeerRole) -> Option<String> {
        self.slot(role).read().occupant().map(str::to_string)
    }

    /// Whether a slot needs filling
    pub fn is_vacant(&self, role: PeerRole) -> bool {
        self.occupant(role).is_none()
    }

    /// Peers eligible for `role`: everything except ourselves and the host
    /// holding the opposite slot.
    pub fn candidates(&self, role: PeerRole, peers: &[String], local_host: &str) -> Vec<String> {
        let opposite = self.occupant(role.opposite());
        peers
            .iter()
            .filter(|host| host.as_str() != local_host)
            .filter(|host| opposite.as_deref() != Some(host.as_str()))
            .cloned()
            .collect()
    }

    /// Claim a vacant slot for `host`. Returns the attempt generation, or
    /// `None` if the slot is occupied or `host` holds the opposite slot.
    pub fn begin_connect(&self, role: PeerRole, host: &str) -> Option<u64> {
        if self.occupant(role.opposite()).as_deref() == Some(host) {
            debug!("Not linking {} as {}: already holds the other slot", host, role);
            return None;
        }

        let mut slot = self.slot(role).write();
        if slot.occupant().is_some() {
            return None;
        }
        slot.generation += 1;
        slot.handle = Some(PeerHandle::connecting(host, role));
        slot.outbound = None;
        debug!("{} slot connecting to {}", role, host);
        Some(slot.generation)
    }

    /// `Connecting -> Connected`. Returns false when the attempt is stale.
    pub fn mark_connected(
        &self,
        role: PeerRole,
        generation: u64,
        outbound: Option<mpsc::Sender<SharedRecord>>,
    ) -> bool {
        let mut slot = self.slot(role).write();
        if !slot.is_current(generation) {
            return false;
        }
        slot.outbound = outbound;
        if let Some(handle) = slot.handle.as_mut() {
            handle.state = ConnectionState::Connected;
            handle.last_error = None;
            info!("{} link connected to {}", role, handle.host);
        }
        true
    }

    /// Any state -> `Disconnected`. Returns false when the attempt is stale.
    pub fn mark_disconnected(&self, role: PeerRole, generation: u64, error: Option<String>) -> bool {
        let mut slot = self.slot(role).write();
        if !slot.is_current(generation) {
            return false;
        }
        slot.outbound = None;
        if let Some(handle) = slot.handle.as_mut() {
            handle.state = ConnectionState::Disconnected;
            match &error {
                Some(reason) => warn!("{} link to {} dropped: {}", role, handle.host, reason),
                None => info!("{} link to {} closed", role, handle.host),
            }
            handle.last_error = error;
        }
        true
    }

    /// Queue a record on the downstream link. Returns false if there is no
    /// connected downstream or its queue is full.
    pub fn forward_downstream(&self, record: &SharedRecord) -> bool {
        let slot = self.downstream.read();
        let Some(outbound) = slot.outbound.as_ref() else {
            return false;
        };
        match outbound.try_send(record.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Downstream queue full, dropping record");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}
