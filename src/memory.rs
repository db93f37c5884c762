//! # In-Process Collaborators
//!
//! Implementations of every collaborator trait that run entirely inside one
//! process:
//!
//! - [`MemoryEngine`] / [`MemoryDocument`] / [`MemoryReplica`]: a replicated
//!   access map shared by any number of replicas. Every replica sees every
//!   write immediately, flags resolve last-writer-wins, and each mutation is
//!   attributed to the replica that made it.
//! - [`MemoryNetwork`] / [`MemoryNode`]: a loopback transport with rendezvous
//!   discovery and dialing, plus hooks to delay readiness, inject transport
//!   errors and make peers unreachable.
//!
//! These back the integration tests and the `demo` subcommand, and are a
//! starting point for embedding capsync without a real mesh.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::capability::{Capabilities, PeerId};
use crate::keys::{Identity, KeyBundle, Keypair};
use crate::protocols::{
    Discovered, Discovery, MapChange, ObserverId, Origin, ReplicatedMap, ReplicationEngine,
    Transport, TransportHandle,
};
use crate::token::AuthToken;

/// Capacity of each discovery subscription.
const DISCOVERY_CHANNEL_CAPACITY: usize = 64;

/// Capacity of each transport error stream.
const ERROR_CHANNEL_CAPACITY: usize = 16;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Replicated map
// ============================================================================

/// Counters of mutations applied to a [`MemoryDocument`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub entries_set: u64,
    pub flags_set: u64,
    pub entries_deleted: u64,
}

#[derive(Default)]
struct DocState {
    entries: BTreeMap<PeerId, Capabilities>,
    observers: HashMap<u64, mpsc::UnboundedSender<MapChange>>,
    next_observer: u64,
    stats: WriteStats,
}

impl DocState {
    fn notify(&mut self, peer: &PeerId, origin: Origin) {
        self.observers.retain(|_, observer| {
            observer
                .send(MapChange {
                    peer: peer.clone(),
                    origin,
                })
                .is_ok()
        });
    }
}

/// Engine hosting any number of named documents.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    documents: Arc<Mutex<HashMap<String, MemoryDocument>>>,
    origins: Arc<AtomicU64>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the document called `name`.
    pub fn document(&self, name: &str) -> MemoryDocument {
        lock(&self.documents)
            .entry(name.to_string())
            .or_insert_with(|| MemoryDocument {
                state: Arc::new(Mutex::new(DocState::default())),
                origins: self.origins.clone(),
            })
            .clone()
    }
}

#[async_trait]
impl ReplicationEngine for MemoryEngine {
    async fn open(&self, name: &str, token: &AuthToken, keys: &KeyBundle) -> Result<Arc<dyn ReplicatedMap>> {
        token
            .verify(keys, &token.node)
            .map_err(|e| anyhow!("refusing to open {}: {}", name, e))?;
        let replica: Arc<dyn ReplicatedMap> = self.document(name).replica();
        debug!(document = name, origin = ?replica.origin(), "opened replica");
        Ok(replica)
    }
}

/// Shared state of one document's access map.
#[derive(Clone)]
pub struct MemoryDocument {
    state: Arc<Mutex<DocState>>,
    origins: Arc<AtomicU64>,
}

impl MemoryDocument {
    /// Create a new replica with its own origin.
    pub fn replica(&self) -> Arc<MemoryReplica> {
        let origin = Origin(self.origins.fetch_add(1, Ordering::Relaxed) + 1);
        Arc::new(MemoryReplica {
            state: self.state.clone(),
            origin,
        })
    }

    pub fn snapshot(&self, peer: &PeerId) -> Option<Capabilities> {
        lock(&self.state).entries.get(peer).cloned()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        lock(&self.state).entries.keys().cloned().collect()
    }

    pub fn stats(&self) -> WriteStats {
        lock(&self.state).stats
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.state).observers.len()
    }
}

/// One replica's view of a [`MemoryDocument`].
pub struct MemoryReplica {
    state: Arc<Mutex<DocState>>,
    origin: Origin,
}

impl ReplicatedMap for MemoryReplica {
    fn origin(&self) -> Origin {
        self.origin
    }

    fn get(&self, peer: &PeerId) -> Option<Capabilities> {
        lock(&self.state).entries.get(peer).cloned()
    }

    fn set(&self, peer: &PeerId, record: Capabilities) {
        let mut state = lock(&self.state);
        state.entries.insert(peer.clone(), record);
        state.stats.entries_set += 1;
        state.notify(peer, self.origin);
    }

    fn set_flag(&self, peer: &PeerId, name: &str, value: bool) {
        let mut state = lock(&self.state);
        state.entries.entry(peer.clone()).or_default().set(name, value);
        state.stats.flags_set += 1;
        trace!(peer = ?peer, flag = name, value, origin = ?self.origin, "flag set");
        state.notify(peer, self.origin);
    }

    fn delete(&self, peer: &PeerId) {
        let mut state = lock(&self.state);
        if state.entries.remove(peer).is_some() {
            state.stats.entries_deleted += 1;
            state.notify(peer, self.origin);
        }
    }

    fn observe_deep(&self, observer: mpsc::UnboundedSender<MapChange>) -> ObserverId {
        let mut state = lock(&self.state);
        state.next_observer += 1;
        let id = state.next_observer;
        state.observers.insert(id, observer);
        ObserverId(id)
    }

    fn unobserve(&self, id: ObserverId) -> bool {
        lock(&self.state).observers.remove(&id.0).is_some()
    }
}

// ============================================================================
// Network
// ============================================================================

#[derive(Default)]
struct NetworkState {
    registrations: HashMap<String, Vec<Identity>>,
    subscribers: HashMap<Identity, Vec<mpsc::Sender<Discovered>>>,
    unreachable: HashSet<Identity>,
    connections: Vec<(Identity, Identity)>,
}

impl NetworkState {
    fn deliver(&mut self, to: Identity, discovered: Discovered) {
        if let Some(subscribers) = self.subscribers.get_mut(&to) {
            subscribers.retain(|tx| match tx.try_send(discovered.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(node = ?to, "discovery subscriber full, dropping notification");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }
}

/// Loopback network shared by any number of [`MemoryNode`]s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a node that becomes ready as soon as it starts.
    pub fn node(&self) -> MemoryNode {
        self.build_node(true)
    }

    /// Create a node that stays not-ready until [`MemoryNode::set_ready`].
    pub fn pending_node(&self) -> MemoryNode {
        self.build_node(false)
    }

    fn build_node(&self, ready: bool) -> MemoryNode {
        let (ready_tx, _) = watch::channel(ready);
        MemoryNode {
            identity: Keypair::generate().identity(),
            network: self.clone(),
            ready: ready_tx,
            errors: Mutex::new(None),
        }
    }

    /// Make dials to `peer` fail until [`MemoryNetwork::set_reachable`].
    pub fn set_unreachable(&self, peer: Identity) {
        lock(&self.state).unreachable.insert(peer);
    }

    pub fn set_reachable(&self, peer: Identity) {
        lock(&self.state).unreachable.remove(&peer);
    }

    /// Number of successful dials from `from` to `to`.
    pub fn connection_count(&self, from: &Identity, to: &Identity) -> usize {
        lock(&self.state)
            .connections
            .iter()
            .filter(|(a, b)| a == from && b == to)
            .count()
    }

    /// Peers registered under `identifier`.
    pub fn registered(&self, identifier: &str) -> Vec<Identity> {
        lock(&self.state)
            .registrations
            .get(identifier)
            .cloned()
            .unwrap_or_default()
    }
}

pub struct MemoryNode {
    identity: Identity,
    network: MemoryNetwork,
    ready: watch::Sender<bool>,
    errors: Mutex<Option<mpsc::Sender<String>>>,
}

impl MemoryNode {
    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    pub fn set_ready(&self) {
        self.ready.send_replace(true);
    }

    /// Emit a transport error on the running transport.
    pub fn inject_error(&self, message: &str) -> Result<()> {
        let guard = lock(&self.errors);
        let Some(tx) = guard.as_ref() else {
            bail!("transport not started");
        };
        tx.try_send(message.to_string())
            .map_err(|_| anyhow!("error stream closed"))
    }

    /// Deliver a discovery notification to this node's subscribers.
    pub fn inject_discovery(&self, discovered: Discovered) {
        lock(&self.network.state).deliver(self.identity, discovered);
    }
}

#[async_trait]
impl Transport for MemoryNode {
    async fn start(&self) -> Result<TransportHandle> {
        let (tx, rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        *lock(&self.errors) = Some(tx);
        debug!(node = ?self.identity, "memory transport started");
        Ok(TransportHandle::new(self.identity, rx, self.ready.subscribe()))
    }
}

#[async_trait]
impl Discovery for MemoryNode {
    async fn register(&self, identifier: &str) -> Result<()> {
        let mut state = lock(&self.network.state);
        let peers = state.registrations.entry(identifier.to_string()).or_default();
        if peers.contains(&self.identity) {
            return Ok(());
        }
        let existing = peers.clone();
        peers.push(self.identity);

        for peer in existing {
            state.deliver(peer, Discovered { identifier: identifier.to_string(), peer: self.identity });
            state.deliver(self.identity, Discovered { identifier: identifier.to_string(), peer });
        }
        Ok(())
    }

    async fn unregister(&self, identifier: &str) -> Result<()> {
        let mut state = lock(&self.network.state);
        if let Some(peers) = state.registrations.get_mut(identifier) {
            peers.retain(|peer| *peer != self.identity);
            if peers.is_empty() {
                state.registrations.remove(identifier);
            }
        }
        Ok(())
    }

    fn discoveries(&self) -> mpsc::Receiver<Discovered> {
        let (tx, rx) = mpsc::channel(DISCOVERY_CHANNEL_CAPACITY);
        lock(&self.network.state)
            .subscribers
            .entry(self.identity)
            .or_default()
            .push(tx);
        rx
    }

    async fn dial(&self, peer: &Identity) -> Result<()> {
        let mut state = lock(&self.network.state);
        if state.unreachable.contains(peer) {
            bail!("peer {} unreachable", peer);
        }
        state.connections.push((self.identity, *peer));
        Ok(())
    }
}
