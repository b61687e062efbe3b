//! Node implementation - the main entry point for Meshwire
//!
//! A [`Node`] assembles the pieces a running overlay node needs from a
//! [`NodeConfig`]: the pubkey table and TCP factory, the transport manager,
//! the routing table and route finder, the router and the local app
//! listener.

use crate::app::frame::{app_frame, read_app_frame};
use crate::crypto::{KeyPair, PubKey};
use crate::error::{MeshwireError, Result, RoutingError, TransportError};
use crate::routing::{AppConfig, MemoryRoutingTable, RouteFinder, Router, StaticRouteFinder};
use crate::shutdown::{pause, stopped, Shutdown};
use crate::storage::config::NodeConfig;
use crate::storage::log_store::{new_log_store, LogStore};
use crate::transport::{
    FilePubKeyTable, ManagerConfig, MemoryDiscovery, MemoryPubKeyTable, MessagingDiscovery,
    PubKeyTable, StaticMessagingDiscovery, TcpFactory, TransportDiscovery, TransportFactory,
    TransportManager,
};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

const JOIN_GRACE: Duration = Duration::from_secs(2);
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);
const MAX_RELAY_CANDIDATES: usize = 8;

/// Current operational state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Node has been built but not started
    Created,
    /// Node is routing and accepting apps
    Running,
    /// Node has been closed
    Stopped,
}

/// Builder for [`Node`]
///
/// Without extra factories the node only uses TCP (when
/// `transport.tcp_listen_addr` is set). Discovery defaults to a private
/// in-memory registry and messaging discovery to the servers listed in the
/// configuration.
///
/// # Examples
///
/// ```no_run
/// use meshwire::api::NodeBuilder;
/// use meshwire::storage::NodeConfig;
///
/// # async fn example() -> meshwire::Result<()> {
/// let node = NodeBuilder::new(NodeConfig::generate()).build().await?;
/// node.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct NodeBuilder {
    config: NodeConfig,
    factories: Vec<Arc<dyn TransportFactory>>,
    discovery: Option<Arc<dyn TransportDiscovery>>,
    messaging: Option<Arc<dyn MessagingDiscovery>>,
    finder: Option<Arc<dyn RouteFinder>>,
}

impl NodeBuilder {
    /// Start from a configuration
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            factories: Vec::new(),
            discovery: None,
            messaging: None,
            finder: None,
        }
    }

    /// Add a transport factory next to the configured TCP one
    pub fn with_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    /// Use a shared transport discovery registry
    pub fn with_discovery(mut self, discovery: Arc<dyn TransportDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Use another messaging discovery
    pub fn with_messaging(mut self, messaging: Arc<dyn MessagingDiscovery>) -> Self {
        self.messaging = Some(messaging);
        self
    }

    /// Replace the route finder built from `routing.static_routes`
    pub fn with_route_finder(mut self, finder: Arc<dyn RouteFinder>) -> Self {
        self.finder = Some(finder);
        self
    }

    /// Validate the configuration and assemble the node
    ///
    /// Binds the TCP listener, so this must run inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the pubkey table
    /// cannot be loaded or the TCP address cannot be bound.
    pub async fn build(self) -> Result<Arc<Node>> {
        self.config.validate()?;
        let keys = self.config.keys()?;
        let local_pk = keys.pub_key();

        let mut factories = Vec::new();
        let mut tcp_addr = None;
        if let Some(addr) = &self.config.transport.tcp_listen_addr {
            let table = pubkey_table(&self.config)?;
            let factory = TcpFactory::bind(local_pk, table, addr).await?;
            tcp_addr = Some(factory.local_addr());
            factories.push(Arc::new(factory) as Arc<dyn TransportFactory>);
        }
        factories.extend(self.factories);
        if factories.is_empty() {
            warn!(local = %local_pk, "Node has no transport factories");
        }

        let discovery = self
            .discovery
            .unwrap_or_else(|| Arc::new(MemoryDiscovery::new()));
        let messaging = self.messaging.unwrap_or_else(|| {
            Arc::new(StaticMessagingDiscovery::new(
                self.config.transport.messaging_servers.clone(),
            ))
        });
        let finder = self.finder.unwrap_or_else(|| {
            Arc::new(StaticRouteFinder::new(
                self.config.routing.static_routes.clone(),
            ))
        });

        let mut manager_config = ManagerConfig::new(keys.clone(), factories, discovery);
        manager_config.default_nodes = self.config.transport.default_nodes.clone();
        manager_config.reconnect_interval =
            Duration::from_secs(self.config.transport.reconnect_interval_secs);
        manager_config.dial_timeout = Duration::from_secs(self.config.transport.dial_timeout_secs);
        manager_config.public = self.config.transport.public;
        let manager = TransportManager::new(manager_config);

        let router = Router::new(
            self.config.router_config(),
            manager.clone(),
            Arc::new(MemoryRoutingTable::new()),
            finder,
        );

        Ok(Arc::new(Node {
            config: self.config,
            keys,
            manager,
            router,
            messaging,
            tcp_addr,
            apps_addr: Mutex::new(None),
            app_logs: DashMap::new(),
            state: RwLock::new(NodeState::Created),
            shutdown: Shutdown::new(),
        }))
    }
}

fn pubkey_table(config: &NodeConfig) -> Result<Arc<dyn PubKeyTable>> {
    let table: Arc<dyn PubKeyTable> = match &config.transport.pubkey_table {
        Some(path) => Arc::new(FilePubKeyTable::load(path)?),
        None => Arc::new(MemoryPubKeyTable::new(config.transport.peers.clone())?),
    };
    debug!(entries = table.count(), "Loaded pubkey table");
    Ok(table)
}

/// A running overlay node
pub struct Node {
    config: NodeConfig,
    keys: KeyPair,
    manager: Arc<TransportManager>,
    router: Arc<Router>,
    messaging: Arc<dyn MessagingDiscovery>,
    tcp_addr: Option<SocketAddr>,
    apps_addr: Mutex<Option<SocketAddr>>,
    app_logs: DashMap<String, Arc<dyn LogStore>>,
    state: RwLock<NodeState>,
    shutdown: Shutdown,
}

impl Node {
    // ========================================================================
    // Lifecycle Methods
    // ========================================================================

    /// Start transports, the router and the app listener
    ///
    /// Starting a running node is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the node was closed, or if the app listener
    /// cannot be bound.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write();
            let current = *state;
            match current {
                NodeState::Running => return Ok(()),
                NodeState::Stopped => return Err(RoutingError::Closed.into()),
                NodeState::Created => *state = NodeState::Running,
            }
        }

        self.manager.start()?;

        let router = Arc::clone(&self.router);
        self.shutdown.add_task(tokio::spawn(async move {
            if let Err(e) = router.serve().await {
                warn!(error = %e, "Router stopped with error");
            }
        }));

        if let Some(addr) = &self.config.apps_listen_addr {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| TransportError::InvalidAddress {
                    address: addr.clone(),
                    reason: e.to_string(),
                })?;
            let local_addr = listener.local_addr().map_err(TransportError::Io)?;
            *self.apps_addr.lock() = Some(local_addr);
            info!(address = %local_addr, "App listener started");

            let node = Arc::clone(self);
            self.shutdown
                .add_task(tokio::spawn(async move { node.accept_apps(listener).await }));
        }

        self.log_relay_candidates().await;
        info!(local = %self.local_pk(), "Node started");
        Ok(())
    }

    /// Close the app listener, the router and the transport manager
    ///
    /// Closing twice, or closing a node that never started, is a no-op.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state == NodeState::Stopped {
                return Ok(());
            }
            *state = NodeState::Stopped;
        }
        self.shutdown.signal();

        let mut errors = Vec::new();
        if let Err(e) = self.router.close().await {
            errors.push(e);
        }
        if let Err(e) = self.manager.close().await {
            errors.push(e);
        }
        self.shutdown.join_all(JOIN_GRACE).await;
        info!(local = %self.local_pk(), "Node closed");

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(MeshwireError::Multiple(errors)),
        }
    }

    /// Get the current operational state
    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Key of this node
    pub fn local_pk(&self) -> PubKey {
        self.keys.pub_key()
    }

    /// Configuration the node was built from
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The router
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// The transport manager
    pub fn manager(&self) -> &Arc<TransportManager> {
        &self.manager
    }

    /// Address the TCP factory listens on
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    /// Address the app listener is bound to, once started
    pub fn apps_addr(&self) -> Option<SocketAddr> {
        *self.apps_addr.lock()
    }

    /// Log store of `app`, opened on first use and kept open
    pub fn app_logs(&self, app: &str) -> Result<Arc<dyn LogStore>> {
        if let Some(store) = self.app_logs.get(app) {
            return Ok(store.value().clone());
        }
        let settings = &self.config.log_store;
        let store = new_log_store(&settings.path, app, &settings.kind)?;
        Ok(self
            .app_logs
            .entry(app.to_string())
            .or_insert(store)
            .value()
            .clone())
    }

    // ========================================================================
    // App listener
    // ========================================================================

    async fn accept_apps(self: Arc<Self>, listener: TcpListener) {
        let mut stop = self.shutdown.subscribe();
        loop {
            let accepted = tokio::select! {
                _ = stopped(&mut stop) => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Errors like EMFILE persist; don't spin on them.
                    warn!(error = %e, "App listener accept failed");
                    if !pause(&mut stop, ACCEPT_BACKOFF).await {
                        break;
                    }
                    continue;
                },
            };
            debug!(%peer, "App connected");

            let node = Arc::clone(&self);
            self.shutdown.add_task(tokio::spawn(async move {
                if let Err(e) = node.serve_app_connection(stream).await {
                    warn!(%peer, error = %e, "App connection ended with error");
                }
            }));
        }
        debug!("App listener stopped");
    }

    async fn serve_app_connection(&self, mut stream: TcpStream) -> Result<()> {
        let _ = stream.set_nodelay(true);

        let hello = match tokio::time::timeout(HELLO_TIMEOUT, read_app_frame(&mut stream)).await {
            Ok(Ok(Some(app_frame::Body::Hello(hello)))) => hello,
            Ok(Ok(Some(_))) => {
                warn!("App did not open with a hello");
                return Ok(());
            },
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!("App sent no hello in time");
                return Ok(());
            },
        };

        let port = match u16::try_from(hello.port) {
            Ok(port) => port,
            Err(_) => {
                warn!(app = %hello.name, port = hello.port, "App asked for an invalid port");
                return Ok(());
            },
        };
        let configured = self.config.apps.iter().find(|a| a.name == hello.name);
        if !self.config.apps.is_empty() && configured.is_none() {
            warn!(app = %hello.name, "App is not configured");
            return Ok(());
        }

        let logs = self.app_logs(&hello.name)?;
        if let Some(entry) = configured.filter(|entry| entry.port != port) {
            warn!(app = %hello.name, port, configured = entry.port, "App asked for another port");
            record(
                &*logs,
                &format!("refused port {}: configured for port {}", port, entry.port),
            );
            return Ok(());
        }
        record(&*logs, &format!("serving on port {} ({})", port, hello.version));

        let app = AppConfig::new(hello.name.clone(), hello.version);
        let result = self.router.serve_app(stream, port, app).await;
        match &result {
            Ok(()) => record(&*logs, "disconnected"),
            Err(e) => record(&*logs, &format!("stopped: {}", e)),
        }
        result
    }

    async fn log_relay_candidates(&self) {
        match self.messaging.available_servers(MAX_RELAY_CANDIDATES).await {
            Ok(servers) if servers.is_empty() => debug!("No relay servers available"),
            Ok(servers) => {
                for server in servers {
                    info!(
                        server = %server.pk,
                        address = %server.address,
                        sessions = server.available_sessions,
                        "Relay server available"
                    );
                }
            },
            Err(e) => warn!(error = %e, "Messaging discovery failed"),
        }
    }
}

fn record(logs: &dyn LogStore, line: &str) {
    if let Err(e) = logs.store(Utc::now(), line) {
        warn!(error = %e, "App log write failed");
    }
}
