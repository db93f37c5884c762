//! # Replicated Access Bridge
//!
//! Two-way adapter between the [`CapabilityStore`](crate::store::CapabilityStore)
//! and the replicated access map.
//!
//! ## Outbound (store → map)
//!
//! | Event | Replicated writes |
//! |-------|-------------------|
//! | revoke | delete the peer's entry (no entry is the canonical "no access") |
//! | grant, no entry yet | create an empty entry, then write every flag |
//! | grant, entry exists | write only the flags whose replicated value differs |
//!
//! Each flag is written on its own. The map merges flags independently, so
//! no ordering between them is assumed.
//!
//! ## Inbound (map → store)
//!
//! Every observed change is resolved against the *full* current entry, never
//! the delta, because several flags may have landed between two
//! notifications. Changes attributed to our own replica origin are dropped:
//! they are the echo of an outbound write and must not feed back into the
//! store.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::capability::{AuthEvent, Capabilities, PeerId};
use crate::protocols::{MapChange, ObserverId, ReplicatedMap};

/// Replicated writes performed for one [`AuthEvent`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutboundWrites {
    pub entries_created: usize,
    pub flags_written: usize,
    pub entries_deleted: usize,
}

impl OutboundWrites {
    pub fn total(&self) -> usize {
        self.entries_created + self.flags_written + self.entries_deleted
    }
}

pub struct ReplicatedAccessBridge {
    map: Arc<dyn ReplicatedMap>,
    observer: Option<ObserverId>,
}

impl ReplicatedAccessBridge {
    pub fn new(map: Arc<dyn ReplicatedMap>) -> Self {
        Self { map, observer: None }
    }

    /// Register a deep observer on the map and return its change stream.
    ///
    /// Attaching twice replaces the previous observer.
    pub fn attach(&mut self) -> mpsc::UnboundedReceiver<MapChange> {
        self.detach();
        let (tx, rx) = mpsc::unbounded_channel();
        self.observer = Some(self.map.observe_deep(tx));
        rx
    }

    /// Remove the deep observer. Returns `false` if none was attached.
    pub fn detach(&mut self) -> bool {
        match self.observer.take() {
            Some(id) => {
                self.map.unobserve(id);
                true
            }
            None => false,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.observer.is_some()
    }

    /// Propagate a local policy change into the replicated map.
    pub fn outbound(&self, event: &AuthEvent) -> OutboundWrites {
        let mut writes = OutboundWrites::default();
        let peer = &event.peer;

        let Some(flags) = &event.capabilities else {
            if self.map.get(peer).is_some() {
                self.map.delete(peer);
                writes.entries_deleted = 1;
            }
            debug!(peer = ?peer, "revocation replicated");
            return writes;
        };

        let current = match self.map.get(peer) {
            Some(record) => record,
            None => {
                self.map.set(peer, Capabilities::new());
                writes.entries_created = 1;
                Capabilities::new()
            }
        };

        for (name, value) in flags.iter() {
            if current.get(name) != Some(value) {
                self.map.set_flag(peer, name, value);
                writes.flags_written += 1;
            }
        }

        debug!(
            peer = ?peer,
            created = writes.entries_created,
            flags = writes.flags_written,
            "grant replicated"
        );
        writes
    }

    /// Resolve an observed change into the peer's full current record.
    ///
    /// Returns `None` for changes that originated from this replica.
    pub fn inbound(&self, change: &MapChange) -> Option<(PeerId, Option<Capabilities>)> {
        if change.origin == self.map.origin() {
            trace!(peer = ?change.peer, "ignoring self-originated change");
            return None;
        }
        Some((change.peer.clone(), self.map.get(&change.peer)))
    }
}

impl Drop for ReplicatedAccessBridge {
    fn drop(&mut self) {
        self.detach();
    }
}
