//! # Capability Store
//!
//! The local peer's belief about every other peer's capabilities.
//!
//! ## State Machine
//!
//! ```text
//! Unknown ──grant──▶ Granted(flags) ──revoke──▶ Revoked
//!                        ▲   │                     │
//!                        └───┴──────grant──────────┘
//! ```
//!
//! Local policy changes (`grant`, `revoke`) require write authority and are
//! published as [`AuthEvent`]s on a queue drained by the replicated access
//! bridge. Changes observed in the replicated map enter through
//! [`CapabilityStore::apply_remote`], which trusts the source and never emits
//! an event, so remote updates cannot echo back out.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::capability::{AuthEvent, Capabilities, PeerId, PeerState};
use crate::error::AccessError;
use crate::keys::KeyBundle;

pub struct CapabilityStore {
    can_administer: bool,
    peers: HashMap<PeerId, PeerState>,
    events: mpsc::UnboundedSender<AuthEvent>,
}

impl CapabilityStore {
    /// Create a store for the given key bundle.
    ///
    /// Returns the store and the receiving end of its event queue.
    pub fn new(keys: &KeyBundle) -> (Self, mpsc::UnboundedReceiver<AuthEvent>) {
        Self::with_authority(keys.can_write())
    }

    pub(crate) fn with_authority(can_administer: bool) -> (Self, mpsc::UnboundedReceiver<AuthEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let store = Self {
            can_administer,
            peers: HashMap::new(),
            events,
        };
        (store, rx)
    }

    pub fn can_administer(&self) -> bool {
        self.can_administer
    }

    /// Grant `flags` to `peer`, overlaying any flags already granted.
    ///
    /// # Errors
    /// `AccessError::Forbidden` if this peer holds no write authority. Nothing
    /// is recorded or emitted in that case.
    pub fn grant(&mut self, peer: PeerId, flags: Capabilities) -> Result<(), AccessError> {
        if !self.can_administer {
            debug!(peer = ?peer, "grant rejected: no write authority");
            return Err(AccessError::Forbidden);
        }

        let state = self.peers.entry(peer.clone()).or_default();
        let mut merged = state.capabilities().cloned().unwrap_or_default();
        merged.overlay(&flags);
        *state = PeerState::Granted(merged);

        trace!(peer = ?peer, flags = ?flags, "capabilities granted");
        self.emit(AuthEvent {
            peer,
            capabilities: Some(flags),
        });
        Ok(())
    }

    /// Revoke every capability of `peer`.
    ///
    /// # Errors
    /// `AccessError::Forbidden` if this peer holds no write authority.
    pub fn revoke(&mut self, peer: &PeerId) -> Result<(), AccessError> {
        if !self.can_administer {
            debug!(peer = ?peer, "revoke rejected: no write authority");
            return Err(AccessError::Forbidden);
        }

        // a peer never granted stays Unknown
        if let Some(state) = self.peers.get_mut(peer) {
            *state = PeerState::Revoked;
        }
        trace!(peer = ?peer, "capabilities revoked");
        self.emit(AuthEvent {
            peer: peer.clone(),
            capabilities: None,
        });
        Ok(())
    }

    /// Apply a record observed in the replicated map.
    ///
    /// `None` means the peer has no entry. Returns `true` if the local view
    /// changed.
    pub fn apply_remote(&mut self, peer: PeerId, flags: Option<Capabilities>) -> bool {
        let next = match flags {
            Some(flags) => PeerState::Granted(flags),
            None => match self.peers.get(&peer) {
                Some(PeerState::Granted(_)) => PeerState::Revoked,
                Some(other) => other.clone(),
                None => PeerState::Unknown,
            },
        };

        let current = self.peers.get(&peer).cloned().unwrap_or_default();
        if current == next {
            return false;
        }

        trace!(peer = ?peer, state = ?next, "applied remote capabilities");
        if next == PeerState::Unknown {
            self.peers.remove(&peer);
        } else {
            self.peers.insert(peer, next);
        }
        true
    }

    pub fn state(&self, peer: &PeerId) -> PeerState {
        self.peers.get(peer).cloned().unwrap_or_default()
    }

    pub fn capabilities(&self, peer: &PeerId) -> Option<&Capabilities> {
        self.peers.get(peer).and_then(PeerState::capabilities)
    }

    /// All peers currently in the `Granted` state.
    pub fn granted(&self) -> impl Iterator<Item = (&PeerId, &Capabilities)> {
        self.peers
            .iter()
            .filter_map(|(peer, state)| state.capabilities().map(|caps| (peer, caps)))
    }

    fn emit(&self, event: AuthEvent) {
        if self.events.send(event).is_err() {
            debug!("auth event queue closed, dropping event");
        }
    }
}
