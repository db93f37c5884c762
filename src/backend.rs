//! # Backend
//!
//! [`Backend`] sequences startup for one document and owns everything that
//! runs afterwards.
//!
//! ## Startup Pipeline
//!
//! Each stage completes before the next begins; the first failure aborts.
//!
//! 1. Derive keys from the options (`MalformedKey` on bad secrets)
//! 2. Start the transport and wait until it reports ready (no timeout here)
//! 3. Forward transport errors, register the rendezvous identifier, dial discovered peers
//! 4. Issue the auth token for the local network identity
//! 5. Open the replicated document state with the token and key bundle
//! 6. Spawn the access actor, which observes the replicated access map and
//!    drives outbound sync from local auth events
//! 7. Emit [`BackendEvent::Started`]
//!
//! ## Quick Start
//!
//! ```ignore
//! let backend = Backend::new(options, transport, discovery, engine);
//! let mut events = backend.events().await?;
//! backend.start().await?;
//!
//! let access = backend.access().context("not started")?;
//! access.grant(peer, Capabilities::new().with(CAN_WRITE, true)).await?;
//!
//! backend.stop().await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::access::{Access, DEFAULT_COMMAND_CAPACITY, DEFAULT_UPDATE_CAPACITY};
use crate::error::AccessError;
use crate::keys::{self, Identity, KeyBundle, PadIdentifier, SymmetricKey};
use crate::protocols::{Discovery, ReplicationEngine, Transport};
use crate::rendezvous::{RendezvousConfig, RendezvousRegistrar};
use crate::token::{self, AuthToken};

/// Default capacity of the backend event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Event slots only `Started` and `Stopped` may fill. Transport errors and
/// rendezvous reports are dropped once the channel is down to this many free
/// slots.
pub const LIFECYCLE_RESERVE: usize = 2;

/// A receiver that can be taken exactly once via `.take()`.
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

/// Signals emitted by a running backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendEvent {
    Started,
    Stopped,
    /// Error surfaced by the transport; the backend keeps running.
    Error(AccessError),
    PeerConnected(Identity),
    DialFailed(AccessError),
}

/// What to open and with which secrets.
#[derive(Clone)]
pub struct BackendOptions {
    /// Document name passed to the replication engine.
    pub name: String,
    /// Base-58 read secret.
    pub read_key: String,
    /// Base-58 write secret, if this peer administers capabilities.
    pub write_key: Option<String>,
}

impl BackendOptions {
    pub fn new(name: impl Into<String>, read_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            read_key: read_key.into(),
            write_key: None,
        }
    }

    pub fn with_write_key(mut self, write_key: impl Into<String>) -> Self {
        self.write_key = Some(write_key.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("backend needs a document name");
        }
        if self.read_key.trim().is_empty() {
            bail!("backend needs a read key");
        }
        Ok(())
    }
}

impl std::fmt::Debug for BackendOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendOptions")
            .field("name", &self.name)
            .field("write_key", &self.write_key.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub command_capacity: usize,
    pub update_capacity: usize,
    pub event_capacity: usize,
    pub rendezvous: RendezvousConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command_capacity: DEFAULT_COMMAND_CAPACITY,
            update_capacity: DEFAULT_UPDATE_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            rendezvous: RendezvousConfig::default(),
        }
    }
}

/// Send a non-lifecycle event without touching the lifecycle reserve.
///
/// Returns `false` if the event was dropped.
pub(crate) fn report(events: &mpsc::Sender<BackendEvent>, event: BackendEvent) -> bool {
    if events.capacity() <= LIFECYCLE_RESERVE {
        return false;
    }
    events.try_send(event).is_ok()
}

/// Forwards transport errors as backend events until dropped.
struct ErrorForwarder {
    task: JoinHandle<()>,
}

impl ErrorForwarder {
    fn spawn(mut errors: mpsc::Receiver<String>, events: mpsc::Sender<BackendEvent>) -> Self {
        let task = tokio::spawn(async move {
            while let Some(message) = errors.recv().await {
                warn!(error = %message, "transport error");
                if events.is_closed() {
                    break;
                }
                if !report(&events, BackendEvent::Error(AccessError::Transport(message))) {
                    debug!("backend event channel full, dropping transport error");
                }
            }
        });
        Self { task }
    }
}

impl Drop for ErrorForwarder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Running {
    keys: KeyBundle,
    node: Identity,
    token: AuthToken,
    access: Access,
    rendezvous: RendezvousRegistrar,
    errors: ErrorForwarder,
}

pub struct Backend {
    options: BackendOptions,
    config: BackendConfig,
    transport: Arc<dyn Transport>,
    discovery: Arc<dyn Discovery>,
    engine: Arc<dyn ReplicationEngine>,
    events_tx: mpsc::Sender<BackendEvent>,
    events_rx: TakeOnce<BackendEvent>,
    starting: AtomicBool,
    running: Mutex<Option<Running>>,
}

impl Backend {
    pub fn new(
        options: BackendOptions,
        transport: Arc<dyn Transport>,
        discovery: Arc<dyn Discovery>,
        engine: Arc<dyn ReplicationEngine>,
    ) -> Self {
        Self::with_config(options, BackendConfig::default(), transport, discovery, engine)
    }

    pub fn with_config(
        options: BackendOptions,
        config: BackendConfig,
        transport: Arc<dyn Transport>,
        discovery: Arc<dyn Discovery>,
        engine: Arc<dyn ReplicationEngine>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(LIFECYCLE_RESERVE + 1));
        Self {
            options,
            config,
            transport,
            discovery,
            engine,
            events_tx,
            events_rx: tokio::sync::Mutex::new(Some(events_rx)),
            starting: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    /// Fresh random symmetric key for out-of-band secret distribution.
    pub fn generate_symmetrical_key() -> SymmetricKey {
        keys::generate_symmetrical_key()
    }

    /// Take the event receiver. Only the first call succeeds.
    pub async fn events(&self) -> Result<mpsc::Receiver<BackendEvent>> {
        self.events_rx
            .lock()
            .await
            .take()
            .context("event receiver already taken")
    }

    /// Run the startup pipeline.
    ///
    /// # Errors
    /// Fails fast on the first stage that fails. Key errors carry
    /// [`AccessError::MalformedKey`], recoverable with `downcast_ref`.
    pub async fn start(&self) -> Result<()> {
        if self.starting.swap(true, Ordering::SeqCst) {
            bail!("backend already started");
        }
        match self.run_pipeline().await {
            Ok(running) => {
                *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(running);
                info!(document = %self.options.name, "backend started");
                self.emit(BackendEvent::Started);
                Ok(())
            }
            Err(e) => {
                self.starting.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn run_pipeline(&self) -> Result<Running> {
        self.options.validate()?;

        let keys = keys::derive(&self.options.read_key, self.options.write_key.as_deref())?;
        debug!(pad = ?keys.pad_identifier(), write = keys.can_write(), "keys derived");

        let mut handle = self.transport.start().await.context("failed to start transport")?;
        handle.await_ready().await?;
        let node = handle.node;
        debug!(node = ?node, "transport ready");

        let errors = ErrorForwarder::spawn(handle.errors, self.events_tx.clone());
        let rendezvous = RendezvousRegistrar::register(
            self.discovery.clone(),
            keys.pad_identifier(),
            node,
            self.config.rendezvous.clone(),
            self.events_tx.clone(),
        )
        .await?;

        let token = token::issue(node, Some(&keys))?;

        let map = self
            .engine
            .open(&self.options.name, &token, &keys)
            .await
            .context("failed to open replicated document")?;

        let access = Access::spawn_with_capacity(
            &keys,
            map,
            self.config.command_capacity,
            self.config.update_capacity,
        );

        Ok(Running {
            keys,
            node,
            token,
            access,
            rendezvous,
            errors,
        })
    }

    /// Detach every subscription and emit [`BackendEvent::Stopped`].
    ///
    /// Calling `stop` on a backend that is not running does nothing.
    pub async fn stop(&self) {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(running) = running else {
            return;
        };

        running.access.quit().await;
        running.rendezvous.stop().await;
        drop(running.errors);
        self.starting.store(false, Ordering::SeqCst);

        info!(document = %self.options.name, "backend stopped");
        self.emit(BackendEvent::Stopped);
    }

    pub fn is_running(&self) -> bool {
        self.with_running(|_| ()).is_some()
    }

    /// Handle to the capability actor, once started.
    pub fn access(&self) -> Option<Access> {
        self.with_running(|r| r.access.clone())
    }

    pub fn token(&self) -> Option<AuthToken> {
        self.with_running(|r| r.token.clone())
    }

    pub fn keys(&self) -> Option<KeyBundle> {
        self.with_running(|r| r.keys.clone())
    }

    pub fn node_identity(&self) -> Option<Identity> {
        self.with_running(|r| r.node)
    }

    pub fn pad_identifier(&self) -> Option<PadIdentifier> {
        self.with_running(|r| r.keys.pad_identifier())
    }

    pub fn public_identity(&self) -> Option<Identity> {
        self.with_running(|r| r.keys.public_identity())
    }

    fn with_running<T>(&self, f: impl FnOnce(&Running) -> T) -> Option<T> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(f)
    }

    /// Emit a lifecycle event into the reserved slots.
    ///
    /// Only dropped when the receiver was never drained across repeated
    /// start/stop cycles, or has been dropped.
    fn emit(&self, event: BackendEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            warn!("dropping lifecycle event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::capability::{CAN_WRITE, Capabilities, PeerId};
    use crate::keys::generate_secret;
    use crate::memory::{MemoryEngine, MemoryNetwork, MemoryNode};

    const WAIT: Duration = Duration::from_secs(2);

    fn backend(network: &MemoryNetwork, engine: &MemoryEngine, options: BackendOptions) -> (Backend, Arc<MemoryNode>) {
        let node = Arc::new(network.node());
        let backend = Backend::new(options, node.clone(), node.clone(), Arc::new(engine.clone()));
        (backend, node)
    }

    async fn next_event(rx: &mut mpsc::Receiver<BackendEvent>) -> BackendEvent {
        timeout(WAIT, rx.recv()).await.expect("timed out").expect("closed")
    }

    #[test]
    fn options_require_name_and_read_key() {
        assert!(BackendOptions::new("", "key").validate().is_err());
        assert!(BackendOptions::new("doc", " ").validate().is_err());
        assert!(BackendOptions::new("doc", "key").validate().is_ok());
    }

    #[tokio::test]
    async fn start_emits_started_and_exposes_state() {
        let (network, engine) = (MemoryNetwork::new(), MemoryEngine::new());
        let options = BackendOptions::new("doc", generate_secret()).with_write_key(generate_secret());
        let (backend, node) = backend(&network, &engine, options);
        let mut events = backend.events().await.unwrap();
        assert!(backend.access().is_none());

        backend.start().await.unwrap();

        assert_eq!(next_event(&mut events).await, BackendEvent::Started);
        assert!(backend.is_running());
        assert_eq!(backend.node_identity(), Some(node.identity()));
        let pad = backend.pad_identifier().unwrap();
        assert_eq!(network.registered(&pad.to_hex()), vec![node.identity()]);

        let token = backend.token().unwrap();
        assert_eq!(token.node, node.identity());
        assert_eq!(Some(token.document), backend.public_identity());
        assert!(token.write_signature.is_some());

        let access = backend.access().unwrap();
        assert!(access.can_administer());
        access.grant("b", Capabilities::new().with(CAN_WRITE, true)).await.unwrap();
        assert_eq!(
            engine.document("doc").snapshot(&PeerId::from("b")),
            Some(Capabilities::new().with(CAN_WRITE, true))
        );
    }

    #[tokio::test]
    async fn malformed_read_key_aborts_start() {
        let (network, engine) = (MemoryNetwork::new(), MemoryEngine::new());
        let (backend, _node) = backend(&network, &engine, BackendOptions::new("doc", "0OIl"));

        let err = backend.start().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AccessError>(),
            Some(AccessError::MalformedKey { kind: crate::error::SecretKind::Read, .. })
        ));
        assert!(!backend.is_running());
        assert_eq!(engine.document("doc").observer_count(), 0);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let (network, engine) = (MemoryNetwork::new(), MemoryEngine::new());
        let (backend, _node) = backend(&network, &engine, BackendOptions::new("doc", generate_secret()));

        backend.start().await.unwrap();
        assert!(backend.start().await.is_err());
    }

    #[tokio::test]
    async fn start_waits_for_transport_readiness() {
        let (network, engine) = (MemoryNetwork::new(), MemoryEngine::new());
        let node = Arc::new(network.pending_node());
        let backend = Arc::new(Backend::new(
            BackendOptions::new("doc", generate_secret()),
            node.clone(),
            node.clone(),
            Arc::new(engine.clone()),
        ));

        let starting = tokio::spawn({
            let backend = backend.clone();
            async move { backend.start().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!starting.is_finished());
        assert_eq!(engine.document("doc").observer_count(), 0);

        node.set_ready();
        timeout(WAIT, starting).await.unwrap().unwrap().unwrap();
        assert!(backend.is_running());
    }

    #[tokio::test]
    async fn transport_errors_become_events() {
        let (network, engine) = (MemoryNetwork::new(), MemoryEngine::new());
        let (backend, node) = backend(&network, &engine, BackendOptions::new("doc", generate_secret()));
        let mut events = backend.events().await.unwrap();
        backend.start().await.unwrap();
        assert_eq!(next_event(&mut events).await, BackendEvent::Started);

        node.inject_error("link down").unwrap();

        assert_eq!(
            next_event(&mut events).await,
            BackendEvent::Error(AccessError::Transport("link down".into()))
        );
        assert!(backend.is_running());
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_detaches() {
        let (network, engine) = (MemoryNetwork::new(), MemoryEngine::new());
        let (backend, _node) = backend(&network, &engine, BackendOptions::new("doc", generate_secret()));
        let mut events = backend.events().await.unwrap();
        backend.start().await.unwrap();
        let access = backend.access().unwrap();
        let _ = access.peers().await;
        assert_eq!(engine.document("doc").observer_count(), 1);

        backend.stop().await;
        backend.stop().await;

        assert_eq!(next_event(&mut events).await, BackendEvent::Started);
        assert_eq!(next_event(&mut events).await, BackendEvent::Stopped);
        assert!(events.try_recv().is_err());
        assert_eq!(engine.document("doc").observer_count(), 0);
        assert!(backend.access().is_none());
    }

    #[tokio::test]
    async fn lifecycle_events_survive_a_full_channel() {
        let (network, engine) = (MemoryNetwork::new(), MemoryEngine::new());
        let node = Arc::new(network.node());
        let config = BackendConfig {
            event_capacity: 4,
            ..BackendConfig::default()
        };
        let backend = Backend::with_config(
            BackendOptions::new("doc", generate_secret()),
            config,
            node.clone(),
            node.clone(),
            Arc::new(engine.clone()),
        );
        let mut events = backend.events().await.unwrap();
        backend.start().await.unwrap();

        for i in 0..6 {
            node.inject_error(&format!("burst {}", i)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        backend.stop().await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.first(), Some(&BackendEvent::Started));
        assert_eq!(seen.last(), Some(&BackendEvent::Stopped));
        assert!(seen.iter().any(|e| matches!(e, BackendEvent::Error(_))));
        assert!(seen.len() <= 4);
    }

    #[tokio::test]
    async fn event_receiver_is_taken_once() {
        let (network, engine) = (MemoryNetwork::new(), MemoryEngine::new());
        let (backend, _node) = backend(&network, &engine, BackendOptions::new("doc", generate_secret()));
        assert!(backend.events().await.is_ok());
        assert!(backend.events().await.is_err());
    }

    #[test]
    fn generated_symmetric_keys_are_distinct() {
        let a = Backend::generate_symmetrical_key();
        let b = Backend::generate_symmetrical_key();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }
}
