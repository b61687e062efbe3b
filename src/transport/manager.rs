//! Transport manager
//!
//! Owns every live [`ManagedTransport`]. It accepts from all factories
//! concurrently, dials on demand with at most one link per peer and type,
//! keeps discovery in sync and redials configured default nodes. The router
//! learns about links through [`TransportEvent`]s and never closes them
//! itself; it asks the manager through [`TransportManager::close_transport`].

use super::{
    BoxTransport, LinkDirection, ManagedTransport, TransportDiscovery, TransportFactory,
    TransportId,
};
use crate::crypto::{KeyPair, PubKey};
use crate::error::{MeshwireError, Result, TransportError};
use crate::shutdown::{pause, stopped, Shutdown};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);
const JOIN_GRACE: Duration = Duration::from_secs(2);

/// Transport manager settings
#[derive(Clone)]
pub struct ManagerConfig {
    /// Identity of the local node
    pub keys: KeyPair,
    /// Link factories, tried in order when discovery has no preference
    pub factories: Vec<Arc<dyn TransportFactory>>,
    /// Discovery registry to keep in sync
    pub discovery: Arc<dyn TransportDiscovery>,
    /// Peers to keep a transport to at all times
    pub default_nodes: Vec<PubKey>,
    /// How often missing default nodes are redialed
    pub reconnect_interval: Duration,
    /// Bound on a single factory dial
    pub dial_timeout: Duration,
    /// Bound on the session handshake
    pub handshake_timeout: Duration,
    /// Whether established transports are advertised as public
    pub public: bool,
}

impl ManagerConfig {
    /// Defaults for the given identity and factories
    pub fn new(
        keys: KeyPair,
        factories: Vec<Arc<dyn TransportFactory>>,
        discovery: Arc<dyn TransportDiscovery>,
    ) -> Self {
        Self {
            keys,
            factories,
            discovery,
            default_nodes: Vec::new(),
            reconnect_interval: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            public: true,
        }
    }
}

/// Lifecycle notification for the router
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A transport was registered (new or replacing a duplicate)
    Established(Arc<ManagedTransport>),
    /// The transport with this id is gone
    Closed {
        /// Id of the removed transport
        id: TransportId,
        /// Peer on the other end
        remote: PubKey,
    },
}

/// Registry and owner of live transports
pub struct TransportManager {
    config: ManagerConfig,
    transports: DashMap<TransportId, Arc<ManagedTransport>>,
    dial_locks: DialLocks,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    shutdown: Shutdown,
    started: AtomicBool,
    closed: AtomicBool,
}

impl TransportManager {
    /// Create a manager; nothing runs until [`start`](Self::start)
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            transports: DashMap::new(),
            dial_locks: DashMap::new(),
            events_tx,
            events_rx: parking_lot::Mutex::new(Some(events_rx)),
            shutdown: Shutdown::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Key of the local node
    pub fn local_pk(&self) -> PubKey {
        self.config.keys.pub_key()
    }

    /// Link types this manager can produce
    pub fn factory_types(&self) -> Vec<&'static str> {
        self.config
            .factories
            .iter()
            .map(|f| f.transport_type())
            .collect()
    }

    /// Take the event stream; only the first caller gets it
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }

    /// Start accepting on every factory and maintaining default nodes
    ///
    /// Starting twice is a no-op.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for factory in &self.config.factories {
            let manager = self.clone();
            let factory = factory.clone();
            self.shutdown
                .add_task(tokio::spawn(async move { manager.accept_loop(factory).await }));
        }

        if !self.config.default_nodes.is_empty() {
            let manager = self.clone();
            self.shutdown
                .add_task(tokio::spawn(async move { manager.maintain_default_nodes().await }));
        }

        info!(
            local = %self.local_pk(),
            factories = self.config.factories.len(),
            default_nodes = self.config.default_nodes.len(),
            "Transport manager started"
        );
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, factory: Arc<dyn TransportFactory>) {
        let transport_type = factory.transport_type();
        let mut stop = self.shutdown.subscribe();
        debug!(transport_type, "Accept loop running");

        loop {
            let accepted = tokio::select! {
                res = factory.accept() => res,
                _ = stopped(&mut stop) => break,
            };

            match accepted {
                Ok(raw) => {
                    let manager = self.clone();
                    tokio::spawn(async move { manager.handle_inbound(raw).await });
                },
                Err(MeshwireError::Transport(TransportError::Closed)) => {
                    debug!(transport_type, "Factory closed, accept loop exiting");
                    break;
                },
                Err(e) => {
                    // One bad peer or socket error must not stop the listener.
                    warn!(transport_type, error = %e, "Failed to accept transport");
                    if !pause(&mut stop, ACCEPT_BACKOFF).await {
                        break;
                    }
                },
            }
        }
    }

    async fn handle_inbound(&self, raw: BoxTransport) {
        let remote = raw.remote_pk();
        let establish = ManagedTransport::establish(
            raw,
            &self.config.keys,
            LinkDirection::Inbound,
            self.config.public,
        );

        match timeout(self.config.handshake_timeout, establish).await {
            Ok(Ok(transport)) => {
                if let Err(e) = self.register(transport).await {
                    debug!(remote = %remote, error = %e, "Dropped inbound transport");
                }
            },
            Ok(Err(e)) => warn!(remote = %remote, error = %e, "Inbound handshake failed"),
            Err(_) => warn!(remote = %remote, "Inbound handshake timed out"),
        }
    }

    /// Insert a fresh transport, resolving duplicates
    ///
    /// Both ends derive the same [`TransportId`], so two links between the
    /// same pair collide here. The one dialed by the lower key wins on both
    /// ends; between two links from the same dialer the newer one wins.
    async fn register(&self, transport: ManagedTransport) -> Result<Arc<ManagedTransport>> {
        let transport = Arc::new(transport);
        if self.is_closed() {
            let _ = transport.close().await;
            return Err(TransportError::Closed.into());
        }

        let id = transport.id();
        let (kept, loser) = match self.transports.entry(id) {
            Entry::Occupied(mut slot) => {
                let existing = slot.get().clone();
                if existing.is_closed() || transport.initiator() <= existing.initiator() {
                    slot.insert(transport.clone());
                    (transport.clone(), Some(existing))
                } else {
                    (existing, Some(transport.clone()))
                }
            },
            Entry::Vacant(slot) => {
                slot.insert(transport.clone());
                (transport.clone(), None)
            },
        };

        if let Some(loser) = loser {
            debug!(
                remote = %loser.remote_pk(),
                initiator = %loser.initiator(),
                "Closing duplicate transport"
            );
            let _ = loser.close().await;
        }

        if !Arc::ptr_eq(&kept, &transport) {
            return Ok(kept);
        }

        // close() may have drained the registry between the check and insert.
        if self.is_closed() {
            self.transports.remove_if(&id, |_, t| Arc::ptr_eq(t, &kept));
            let _ = kept.close().await;
            return Err(TransportError::Closed.into());
        }

        info!(
            remote = %kept.remote_pk(),
            transport_type = kept.transport_type(),
            id = %id,
            direction = ?kept.direction(),
            "Transport established"
        );

        if let Err(e) = self.config.discovery.register(kept.entry()).await {
            warn!(id = %id, error = %e, "Failed to register transport with discovery");
        }
        let _ = self.events_tx.send(TransportEvent::Established(kept.clone()));

        Ok(kept)
    }

    /// Get or create a transport to `remote` over any factory
    ///
    /// A live transport is returned as is. Otherwise factories the peer
    /// advertises in discovery are tried first, then the rest in
    /// configuration order; the first success is recorded.
    ///
    /// # Errors
    ///
    /// [`TransportError::UnknownRemote`] if no factory knows the peer,
    /// [`TransportError::NoFactory`] if no factory is configured, the
    /// single failure if one factory was tried and a combined
    /// [`TransportError::ConnectionFailed`] otherwise.
    pub async fn dial(&self, remote: PubKey) -> Result<Arc<ManagedTransport>> {
        self.dial_with(remote, None).await
    }

    /// Like [`dial`](Self::dial) but only over the given link type
    pub async fn dial_type(&self, remote: PubKey, transport_type: &str) -> Result<Arc<ManagedTransport>> {
        self.dial_with(remote, Some(transport_type)).await
    }

    async fn dial_with(&self, remote: PubKey, only: Option<&str>) -> Result<Arc<ManagedTransport>> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }
        if remote == self.local_pk() {
            return Err(TransportError::ConnectionFailed {
                remote: remote.to_string(),
                reason: "cannot dial the local node".to_string(),
            }
            .into());
        }
        if let Some(existing) = self.live_transport(&remote, only) {
            return Ok(existing);
        }

        let mut stop = self.shutdown.subscribe();
        tokio::select! {
            res = self.dial_locked(remote, only) => res,
            _ = stopped(&mut stop) => Err(TransportError::Cancelled.into()),
        }
    }

    async fn dial_locked(&self, remote: PubKey, only: Option<&str>) -> Result<Arc<ManagedTransport>> {
        let slot = DialSlot::acquire(&self.dial_locks, remote);
        let _guard = slot.lock.lock().await;

        // A concurrent dial or an inbound link may have won while we waited.
        if let Some(existing) = self.live_transport(&remote, only) {
            return Ok(existing);
        }

        let factories = self.dial_order(&remote, only).await;
        if factories.is_empty() {
            return Err(TransportError::NoFactory {
                remote: remote.to_string(),
            }
            .into());
        }

        let mut errors = Vec::new();
        for factory in factories {
            match self.dial_factory(&factory, remote).await {
                Ok(transport) => return Ok(transport),
                Err(e) => {
                    debug!(
                        remote = %remote,
                        transport_type = factory.transport_type(),
                        error = %e,
                        "Dial attempt failed"
                    );
                    errors.push(e);
                },
            }
        }

        let all_unknown = errors
            .iter()
            .all(|e| matches!(e, MeshwireError::Transport(TransportError::UnknownRemote)));
        if all_unknown {
            return Err(TransportError::UnknownRemote.into());
        }
        if errors.len() == 1 {
            return Err(errors.remove(0));
        }

        Err(TransportError::ConnectionFailed {
            remote: remote.to_string(),
            reason: errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        }
        .into())
    }

    async fn dial_factory(
        &self,
        factory: &Arc<dyn TransportFactory>,
        remote: PubKey,
    ) -> Result<Arc<ManagedTransport>> {
        let raw = timeout(self.config.dial_timeout, factory.dial(remote))
            .await
            .map_err(|_| TransportError::Timeout)??;

        let establish = ManagedTransport::establish(
            raw,
            &self.config.keys,
            LinkDirection::Outbound,
            self.config.public,
        );
        let transport = timeout(self.config.handshake_timeout, establish)
            .await
            .map_err(|_| TransportError::Timeout)??;

        self.register(transport).await
    }

    async fn dial_order(&self, remote: &PubKey, only: Option<&str>) -> Vec<Arc<dyn TransportFactory>> {
        let mut order: Vec<Arc<dyn TransportFactory>> = self
            .config
            .factories
            .iter()
            .filter(|f| only.map_or(true, |t| f.transport_type() == t))
            .cloned()
            .collect();

        match self.config.discovery.lookup(remote).await {
            Ok(entries) => {
                // Stable sort keeps configuration order within each group.
                order.sort_by_key(|f| {
                    !entries
                        .iter()
                        .any(|e| e.transport_type == f.transport_type())
                });
            },
            Err(e) => warn!(remote = %remote, error = %e, "Discovery lookup failed"),
        }

        order
    }

    fn live_transport(&self, remote: &PubKey, only: Option<&str>) -> Option<Arc<ManagedTransport>> {
        let local = self.local_pk();
        self.config
            .factories
            .iter()
            .map(|f| f.transport_type())
            .filter(|t| only.map_or(true, |o| o == *t))
            .filter_map(|t| self.transports.get(&TransportId::derive(&local, remote, t)))
            .map(|entry| entry.value().clone())
            .find(|t| !t.is_closed())
    }

    /// Live transport to `remote`, if any
    pub fn transport_to(&self, remote: &PubKey) -> Option<Arc<ManagedTransport>> {
        self.live_transport(remote, None)
    }

    /// Live transport with the given id
    pub fn transport(&self, id: &TransportId) -> Option<Arc<ManagedTransport>> {
        self.transports
            .get(id)
            .map(|entry| entry.value().clone())
            .filter(|t| !t.is_closed())
    }

    /// All registered transports
    pub fn transports(&self) -> Vec<Arc<ManagedTransport>> {
        self.transports.iter().map(|e| e.value().clone()).collect()
    }

    /// Number of registered transports
    pub fn count(&self) -> usize {
        self.transports.len()
    }

    /// Close and forget one transport
    ///
    /// Only the registered instance is removed; closing a duplicate that
    /// already lost the tie-break just closes it.
    pub async fn close_transport(&self, transport: &Arc<ManagedTransport>) -> Result<()> {
        let id = transport.id();
        let removed = self
            .transports
            .remove_if(&id, |_, t| Arc::ptr_eq(t, transport))
            .is_some();

        transport.close().await?;

        if removed {
            info!(remote = %transport.remote_pk(), id = %id, "Transport closed");
            if let Err(e) = self.config.discovery.deregister(&id).await {
                warn!(id = %id, error = %e, "Failed to deregister transport");
            }
            let _ = self.events_tx.send(TransportEvent::Closed {
                id,
                remote: transport.remote_pk(),
            });
        }
        Ok(())
    }

    async fn maintain_default_nodes(self: Arc<Self>) {
        let mut stop = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.reconnect_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                _ = stopped(&mut stop) => break,
            }

            for pk in &self.config.default_nodes {
                if self.transport_to(pk).is_some() {
                    continue;
                }
                match self.dial(*pk).await {
                    Ok(_) => info!(remote = %pk, "Connected to default node"),
                    Err(e) => warn!(remote = %pk, error = %e, "Failed to reach default node"),
                }
                if self.is_closed() {
                    return;
                }
            }
        }
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every factory and transport
    ///
    /// Safe to call concurrently with dials and accepts, on a manager that
    /// never started, and more than once. Errors from individual closes are
    /// collected; teardown always runs to completion.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.signal();

        let mut errors = Vec::new();
        for factory in &self.config.factories {
            if let Err(e) = factory.close().await {
                warn!(transport_type = factory.transport_type(), error = %e, "Failed to close factory");
                errors.push(e);
            }
        }

        let transports: Vec<Arc<ManagedTransport>> = self.transports();
        self.transports.clear();
        for transport in transports {
            if let Err(e) = transport.close().await {
                errors.push(e);
            }
            if let Err(e) = self.config.discovery.deregister(&transport.id()).await {
                warn!(id = %transport.id(), error = %e, "Failed to deregister transport");
            }
            let _ = self.events_tx.send(TransportEvent::Closed {
                id: transport.id(),
                remote: transport.remote_pk(),
            });
        }

        self.shutdown.join_all(JOIN_GRACE).await;
        info!(local = %self.local_pk(), "Transport manager closed");

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(MeshwireError::Multiple(errors)),
        }
    }
}

type DialLocks = DashMap<PubKey, Arc<tokio::sync::Mutex<()>>>;

/// Per-peer dial lock, dropped from the map by its last holder
///
/// Setup requests can name arbitrary keys, so entries must not outlive the
/// dials that created them.
struct DialSlot<'a> {
    locks: &'a DialLocks,
    remote: PubKey,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> DialSlot<'a> {
    fn acquire(locks: &'a DialLocks, remote: PubKey) -> Self {
        let lock = locks.entry(remote).or_default().clone();
        Self { locks, remote, lock }
    }
}

impl Drop for DialSlot<'_> {
    fn drop(&mut self) {
        // The map and this slot are the only holders when nobody else waits.
        self.locks.remove_if(&self.remote, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2
        });
    }
}
