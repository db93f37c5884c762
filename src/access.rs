//! # Access Actor
//!
//! All capability state of a peer lives on one task:
//!
//! - [`Access`]: public handle, cheap to clone, talks to the actor over a channel
//! - `AccessActor`: owns the [`CapabilityStore`], its auth event queue and the
//!   [`ReplicatedAccessBridge`], and processes local commands and map change
//!   notifications strictly in arrival order
//!
//! Because there is exactly one consumer of every piece of state, neither the
//! store nor the bridge needs a lock.
//!
//! After each local command the actor drains the auth event queue through the
//! bridge before replying, so once `grant().await` returns the replicated map
//! already holds the new flags.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace};

use crate::bridge::ReplicatedAccessBridge;
use crate::capability::{AuthEvent, Capabilities, PeerId, PeerState};
use crate::error::AccessError;
use crate::keys::KeyBundle;
use crate::protocols::{MapChange, ReplicatedMap};
use crate::store::CapabilityStore;

/// Default capacity of the command channel.
pub const DEFAULT_COMMAND_CAPACITY: usize = 256;

/// Default capacity of the update broadcast.
pub const DEFAULT_UPDATE_CAPACITY: usize = 256;

/// A change to the local view of one peer, from either side of the bridge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessUpdate {
    pub peer: PeerId,
    /// `None` once the peer has no capabilities.
    pub capabilities: Option<Capabilities>,
}

enum Command {
    Grant(PeerId, Capabilities, oneshot::Sender<Result<(), AccessError>>),
    Revoke(PeerId, oneshot::Sender<Result<(), AccessError>>),
    GetState(PeerId, oneshot::Sender<PeerState>),
    GetPeers(oneshot::Sender<Vec<(PeerId, Capabilities)>>),
    Quit(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct Access {
    cmd_tx: mpsc::Sender<Command>,
    updates: broadcast::Sender<AccessUpdate>,
    can_administer: bool,
}

impl Access {
    /// Spawn the actor for `keys` over the replicated access map `map`.
    pub fn spawn(keys: &KeyBundle, map: Arc<dyn ReplicatedMap>) -> Self {
        Self::spawn_with_capacity(keys, map, DEFAULT_COMMAND_CAPACITY, DEFAULT_UPDATE_CAPACITY)
    }

    pub fn spawn_with_capacity(
        keys: &KeyBundle,
        map: Arc<dyn ReplicatedMap>,
        command_capacity: usize,
        update_capacity: usize,
    ) -> Self {
        let (store, events) = CapabilityStore::new(keys);
        Self::spawn_store(store, events, map, command_capacity, update_capacity)
    }

    fn spawn_store(
        store: CapabilityStore,
        events: mpsc::UnboundedReceiver<AuthEvent>,
        map: Arc<dyn ReplicatedMap>,
        command_capacity: usize,
        update_capacity: usize,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(command_capacity);
        let (updates, _) = broadcast::channel(update_capacity);
        let can_administer = store.can_administer();

        let mut bridge = ReplicatedAccessBridge::new(map);
        let changes = bridge.attach();
        let actor = AccessActor {
            store,
            events,
            bridge,
            updates: updates.clone(),
        };
        tokio::spawn(actor.run(cmd_rx, changes));

        Self {
            cmd_tx,
            updates,
            can_administer,
        }
    }

    /// Whether this peer holds write authority.
    pub fn can_administer(&self) -> bool {
        self.can_administer
    }

    /// Grant `flags` to `peer`.
    ///
    /// Fails with [`AccessError::Forbidden`] (recoverable via `downcast_ref`)
    /// if this peer holds no write authority.
    pub async fn grant(&self, peer: impl Into<PeerId>, flags: Capabilities) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Grant(peer.into(), flags, tx)).await?;
        rx.await.map_err(|_| anyhow!("access actor closed"))??;
        Ok(())
    }

    /// Revoke every capability of `peer`.
    pub async fn revoke(&self, peer: impl Into<PeerId>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Revoke(peer.into(), tx)).await?;
        rx.await.map_err(|_| anyhow!("access actor closed"))??;
        Ok(())
    }

    pub async fn state(&self, peer: impl Into<PeerId>) -> Result<PeerState> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::GetState(peer.into(), tx)).await?;
        rx.await.map_err(|_| anyhow!("access actor closed"))
    }

    pub async fn capabilities(&self, peer: impl Into<PeerId>) -> Result<Option<Capabilities>> {
        Ok(self.state(peer).await?.capabilities().cloned())
    }

    /// All peers currently granted capabilities, in no particular order.
    pub async fn peers(&self) -> Result<Vec<(PeerId, Capabilities)>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::GetPeers(tx)).await?;
        rx.await.map_err(|_| anyhow!("access actor closed"))
    }

    /// Subscribe to changes of the local view.
    pub fn updates(&self) -> broadcast::Receiver<AccessUpdate> {
        self.updates.subscribe()
    }

    /// Stop the actor and detach its map observer. Safe to call repeatedly.
    pub async fn quit(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Quit(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| anyhow!("access actor closed"))
    }
}

struct AccessActor {
    store: CapabilityStore,
    events: mpsc::UnboundedReceiver<AuthEvent>,
    bridge: ReplicatedAccessBridge,
    updates: broadcast::Sender<AccessUpdate>,
}

impl AccessActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut changes: mpsc::UnboundedReceiver<MapChange>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Grant(peer, flags, reply)) => {
                            let result = self.store.grant(peer.clone(), flags);
                            if result.is_ok() {
                                self.publish(&peer);
                            }
                            self.flush_outbound();
                            let _ = reply.send(result);
                        }
                        Some(Command::Revoke(peer, reply)) => {
                            let result = self.store.revoke(&peer);
                            if result.is_ok() {
                                self.publish(&peer);
                            }
                            self.flush_outbound();
                            let _ = reply.send(result);
                        }
                        Some(Command::GetState(peer, reply)) => {
                            let _ = reply.send(self.store.state(&peer));
                        }
                        Some(Command::GetPeers(reply)) => {
                            let peers = self
                                .store
                                .granted()
                                .map(|(peer, caps)| (peer.clone(), caps.clone()))
                                .collect();
                            let _ = reply.send(peers);
                        }
                        Some(Command::Quit(reply)) => {
                            self.bridge.detach();
                            debug!("access actor quitting");
                            let _ = reply.send(());
                            break;
                        }
                        None => {
                            self.bridge.detach();
                            debug!("access handle dropped, actor quitting");
                            break;
                        }
                    }
                }
                Some(change) = changes.recv() => {
                    self.handle_change(change);
                }
            }
        }
    }

    /// Push every queued auth event through the bridge.
    fn flush_outbound(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            let writes = self.bridge.outbound(&event);
            trace!(peer = ?event.peer, writes = writes.total(), "outbound sync");
        }
    }

    fn handle_change(&mut self, change: MapChange) {
        let Some((peer, record)) = self.bridge.inbound(&change) else {
            return;
        };
        if self.store.apply_remote(peer.clone(), record) {
            debug!(peer = ?peer, origin = ?change.origin, "remote capability change applied");
            self.publish(&peer);
        }
    }

    fn publish(&self, peer: &PeerId) {
        // no subscribers is fine
        let _ = self.updates.send(AccessUpdate {
            peer: peer.clone(),
            capabilities: self.store.capabilities(peer).cloned(),
        });
    }
}
