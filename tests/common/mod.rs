//! Common test helpers and utilities
//!
//! This module provides shared fixtures for integration tests: nodes wired
//! over an in-memory pipe network and apps attached to their routers.

#![allow(dead_code)]

use meshwire::app::{AppClient, AppEvent};
use meshwire::crypto::{KeyPair, PubKey};
use meshwire::routing::{
    AppConfig, MemoryRoutingTable, RouteFinder, Router, RouterConfig, StaticRouteFinder,
};
use meshwire::transport::{
    ManagerConfig, MemoryDiscovery, PipeNetwork, TransportFactory, TransportManager,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::time::timeout;

/// Upper bound on every network wait in the integration tests
pub const WAIT: Duration = Duration::from_secs(5);

/// A manager and router sharing one identity
pub struct TestNode {
    pub pk: PubKey,
    pub manager: Arc<TransportManager>,
    pub router: Arc<Router>,
}

impl TestNode {
    /// Close the router, then the manager
    pub async fn close(&self) {
        self.router.close().await.unwrap();
        self.manager.close().await.unwrap();
    }
}

/// Short timeouts so failure paths finish quickly
pub fn fast_router_config() -> RouterConfig {
    RouterConfig {
        setup_timeout: Duration::from_secs(2),
        teardown_timeout: Duration::from_millis(500),
        sweep_interval: Duration::from_millis(100),
        ..RouterConfig::default()
    }
}

/// Create a key pair from a single repeated seed byte
pub fn keys_from_seed(seed: u8) -> KeyPair {
    KeyPair::from_seed(&[seed; 32])
}

/// Start a node on `network` that routes directly
pub fn spawn_node(network: &PipeNetwork, discovery: &Arc<MemoryDiscovery>) -> TestNode {
    spawn_node_with(
        network,
        discovery,
        KeyPair::generate(),
        Arc::new(StaticRouteFinder::direct()),
    )
}

/// Start a node with the given identity and route finder
pub fn spawn_node_with(
    network: &PipeNetwork,
    discovery: &Arc<MemoryDiscovery>,
    keys: KeyPair,
    finder: Arc<dyn RouteFinder>,
) -> TestNode {
    spawn_configured_node(network, discovery, keys, finder, fast_router_config())
}

/// Start a node with an explicit router configuration
pub fn spawn_configured_node(
    network: &PipeNetwork,
    discovery: &Arc<MemoryDiscovery>,
    keys: KeyPair,
    finder: Arc<dyn RouteFinder>,
    config: RouterConfig,
) -> TestNode {
    let factory: Arc<dyn TransportFactory> = Arc::new(network.factory(keys.pub_key()));
    let manager = TransportManager::new(ManagerConfig::new(
        keys.clone(),
        vec![factory],
        discovery.clone(),
    ));
    manager.start().unwrap();

    let router = Router::new(
        config,
        manager.clone(),
        Arc::new(MemoryRoutingTable::new()),
        finder,
    );
    let serving = router.clone();
    tokio::spawn(async move { serving.serve().await });

    TestNode {
        pk: keys.pub_key(),
        manager,
        router,
    }
}

/// Serve an in-memory app connection on `port` and return its client end
pub async fn attach_app(router: &Arc<Router>, port: u16, name: &str) -> AppClient<DuplexStream> {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let serving = router.clone();
    let app = AppConfig::new(name, "1.0");
    tokio::spawn(async move { serving.serve_app(server, port, app).await });

    wait_until(|| router.bound_ports().contains(&port)).await;
    AppClient::new(client)
}

/// Next event pushed to `app`, failing the test after [`WAIT`]
pub async fn next_event(app: &mut AppClient<DuplexStream>) -> AppEvent {
    timeout(WAIT, app.recv())
        .await
        .expect("timed out waiting for app event")
        .unwrap()
        .expect("app connection closed")
}

/// Poll `condition` until it holds, failing the test after [`WAIT`]
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_from_seed() {
        assert_eq!(keys_from_seed(1).pub_key(), keys_from_seed(1).pub_key());
        assert_ne!(keys_from_seed(1).pub_key(), keys_from_seed(2).pub_key());
    }
}
