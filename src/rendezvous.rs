//! # Rendezvous Registration
//!
//! Peers sharing a read secret find one another by registering the hex pad
//! identifier with the discovery collaborator. The registrar then dials every
//! peer discovered under that identifier.
//!
//! ## Dial Discipline
//!
//! - Discovery notifications may repeat; a peer that is connected or being
//!   dialed is tracked in a bounded LRU and not dialed again.
//! - A failed or timed-out dial is non-fatal: it is logged, reported as
//!   [`BackendEvent::DialFailed`], and the peer is forgotten so a later
//!   notification can retry.
//! - Stopping the registrar ends the discovery loop and withdraws the
//!   registration, so a later registration announces the peer afresh. Dials
//!   already in flight are left to finish on their own.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lru::LruCache;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::backend::{self, BackendEvent};
use crate::error::AccessError;
use crate::keys::{Identity, PadIdentifier};
use crate::protocols::{Discovered, Discovery};

/// Default bound on the number of peers tracked for dial deduplication.
pub const DEFAULT_MAX_TRACKED_PEERS: usize = 1024;

/// Default timeout for a single dial attempt.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct RendezvousConfig {
    pub max_tracked_peers: NonZeroUsize,
    pub dial_timeout: Duration,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            max_tracked_peers: NonZeroUsize::new(DEFAULT_MAX_TRACKED_PEERS)
                .unwrap_or(NonZeroUsize::MIN),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DialState {
    Dialing,
    Connected,
}

pub struct RendezvousRegistrar {
    discovery: Arc<dyn Discovery>,
    identifier: String,
    task: JoinHandle<()>,
}

impl RendezvousRegistrar {
    /// Register `pad` with `discovery` and start dialing discovered peers.
    ///
    /// The discovery subscription is opened before registering so no
    /// notification triggered by the registration itself is missed.
    pub async fn register(
        discovery: Arc<dyn Discovery>,
        pad: PadIdentifier,
        local: Identity,
        config: RendezvousConfig,
        events: mpsc::Sender<BackendEvent>,
    ) -> Result<Self> {
        let identifier = pad.to_hex();
        let discoveries = discovery.discoveries();

        let dialer = Dialer {
            discovery: discovery.clone(),
            identifier: identifier.clone(),
            local,
            tracked: LruCache::new(config.max_tracked_peers),
            dial_timeout: config.dial_timeout,
            events,
        };
        let task = tokio::spawn(dialer.run(discoveries));

        if let Err(e) = discovery.register(&identifier).await {
            task.abort();
            return Err(e).context("failed to register rendezvous identifier");
        }
        info!(identifier = %&identifier[..16], "registered rendezvous identifier");

        Ok(Self {
            discovery,
            identifier,
            task,
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Stop reacting to discovery notifications and withdraw the
    /// registration. Idempotent.
    pub async fn stop(&self) {
        self.task.abort();
        match self.discovery.unregister(&self.identifier).await {
            Ok(()) => debug!(identifier = %&self.identifier[..16], "rendezvous registration withdrawn"),
            Err(e) => warn!(error = %e, "failed to withdraw rendezvous registration"),
        }
    }
}

impl Drop for RendezvousRegistrar {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Dialer {
    discovery: Arc<dyn Discovery>,
    identifier: String,
    local: Identity,
    tracked: LruCache<Identity, DialState>,
    dial_timeout: Duration,
    events: mpsc::Sender<BackendEvent>,
}

impl Dialer {
    async fn run(mut self, mut discoveries: mpsc::Receiver<Discovered>) {
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(Identity, Result<()>)>();

        loop {
            tokio::select! {
                discovered = discoveries.recv() => {
                    match discovered {
                        Some(discovered) => self.handle_discovered(discovered, &result_tx),
                        None => {
                            debug!("discovery stream closed, dialer quitting");
                            break;
                        }
                    }
                }
                Some((peer, result)) = result_rx.recv() => {
                    self.handle_dial_result(peer, result);
                }
            }
        }
    }

    fn handle_discovered(
        &mut self,
        discovered: Discovered,
        results: &mpsc::UnboundedSender<(Identity, Result<()>)>,
    ) {
        if discovered.identifier != self.identifier || discovered.peer == self.local {
            return;
        }
        let peer = discovered.peer;
        if self.tracked.get(&peer).is_some() {
            trace!(peer = ?peer, "duplicate discovery, already dialing or connected");
            return;
        }
        self.tracked.put(peer, DialState::Dialing);

        debug!(peer = ?peer, "dialing discovered peer");
        let discovery = self.discovery.clone();
        let results = results.clone();
        let dial_timeout = self.dial_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(dial_timeout, discovery.dial(&peer)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("dial timed out after {:?}", dial_timeout)),
            };
            let _ = results.send((peer, result));
        });
    }

    fn handle_dial_result(&mut self, peer: Identity, result: Result<()>) {
        match result {
            Ok(()) => {
                self.tracked.put(peer, DialState::Connected);
                debug!(peer = ?peer, "connected to discovered peer");
                self.report(BackendEvent::PeerConnected(peer));
            }
            Err(e) => {
                self.tracked.pop(&peer);
                let failure = AccessError::DialFailure {
                    peer: peer.to_hex(),
                    reason: format!("{:#}", e),
                };
                warn!(peer = ?peer, error = %failure, "dial failed");
                self.report(BackendEvent::DialFailed(failure));
            }
        }
    }

    fn report(&self, event: BackendEvent) {
        if !backend::report(&self.events, event) {
            debug!("backend event channel full or closed, dropping rendezvous event");
        }
    }
}
