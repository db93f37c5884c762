//! Collaborator trait definitions.
//!
//! capsync does not own the network or the replication engine. It consumes
//! them through the traits below, so any mesh transport or CRDT engine can
//! be plugged in behind a backend.
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | Network transport | [`Transport`] | start, readiness, error stream |
//! | Discovery | [`Discovery`] | rendezvous registration, discovery stream, dialing |
//! | Replicated map | [`ReplicatedMap`] | shared `peer → capability record` map |
//! | Replication engine | [`ReplicationEngine`] | opens the replicated state for a document |
//!
//! In-process implementations of every trait live in [`crate::memory`].

use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::capability::{Capabilities, PeerId};
use crate::keys::{Identity, KeyBundle};
use crate::token::AuthToken;

// ============================================================================
// Network transport
// ============================================================================

/// Running transport returned by [`Transport::start`].
pub struct TransportHandle {
    /// Network identity of the local node.
    pub node: Identity,
    /// Errors surfaced by the transport while it runs.
    pub errors: mpsc::Receiver<String>,
    ready: watch::Receiver<bool>,
}

impl TransportHandle {
    pub fn new(node: Identity, errors: mpsc::Receiver<String>, ready: watch::Receiver<bool>) -> Self {
        Self { node, errors, ready }
    }

    /// Suspend until the transport reports it is online.
    ///
    /// No timeout is applied; callers wrap this in `tokio::time::timeout` if
    /// they need one.
    pub async fn await_ready(&mut self) -> Result<()> {
        self.ready
            .wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| anyhow!("transport shut down before becoming ready"))
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn start(&self) -> Result<TransportHandle>;
}

// ============================================================================
// Discovery
// ============================================================================

/// A peer found under a rendezvous identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Discovered {
    pub identifier: String,
    pub peer: Identity,
}

#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Announce presence under `identifier`.
    async fn register(&self, identifier: &str) -> Result<()>;

    /// Withdraw a registration made with [`Discovery::register`].
    ///
    /// Unregistering an identifier that is not registered succeeds.
    async fn unregister(&self, identifier: &str) -> Result<()>;

    /// Subscribe to discovery notifications.
    ///
    /// Notifications may repeat for the same peer and may arrive before
    /// [`Discovery::register`] completes.
    fn discoveries(&self) -> mpsc::Receiver<Discovered>;

    /// Open a direct connection to a discovered peer.
    async fn dial(&self, peer: &Identity) -> Result<()>;
}

// ============================================================================
// Replicated access map
// ============================================================================

/// Replica that performed a mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Origin(pub u64);

/// Handle for an observer registered with [`ReplicatedMap::observe_deep`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(pub u64);

/// Notification that the entry for `peer` was added, deleted or had a
/// nested field mutated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapChange {
    pub peer: PeerId,
    pub origin: Origin,
}

/// Replicated `peer → capability record` map.
///
/// Conflict resolution is owned by the implementation: concurrent writes to
/// the same flag resolve last-writer-wins, with no atomicity across flags.
/// Every mutation made through a handle is attributed to that handle's
/// [`ReplicatedMap::origin`].
pub trait ReplicatedMap: Send + Sync + 'static {
    /// Origin tag of mutations made through this handle.
    fn origin(&self) -> Origin;

    fn get(&self, peer: &PeerId) -> Option<Capabilities>;

    /// Create or replace the whole entry for `peer`.
    fn set(&self, peer: &PeerId, record: Capabilities);

    /// Write a single flag, creating the entry if it is missing.
    fn set_flag(&self, peer: &PeerId, name: &str, value: bool);

    fn delete(&self, peer: &PeerId);

    /// Deliver a [`MapChange`] for every mutation, local or remote.
    fn observe_deep(&self, observer: mpsc::UnboundedSender<MapChange>) -> ObserverId;

    /// Returns `false` if the observer was not registered.
    fn unobserve(&self, id: ObserverId) -> bool;
}

/// Replicated document engine.
#[async_trait]
pub trait ReplicationEngine: Send + Sync + 'static {
    /// Open the replicated state of document `name` and return its access map.
    async fn open(&self, name: &str, token: &AuthToken, keys: &KeyBundle) -> Result<Arc<dyn ReplicatedMap>>;
}
