//! Node assembly tests
//!
//! Nodes are built from configuration the way the daemon builds them, but
//! share an in-memory pipe network instead of TCP.

mod common;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use common::WAIT;
use meshwire::api::{Node, NodeBuilder, NodeState};
use meshwire::app::{AppClient, AppEvent};
use meshwire::routing::Addr;
use meshwire::storage::{
    load_config, new_log_store, save_config, AppEntry, NodeConfig, FILE_KIND, MEMORY_KIND,
};
use meshwire::transport::{MemoryDiscovery, PipeNetwork, ServerEntry, StaticMessagingDiscovery};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;

fn pipe_config() -> NodeConfig {
    let mut config = NodeConfig::generate();
    config.transport.tcp_listen_addr = None;
    config.apps_listen_addr = Some("127.0.0.1:0".to_string());
    config.log_store.kind = MEMORY_KIND.to_string();
    config.routing.setup_timeout_ms = 2_000;
    config.routing.teardown_timeout_ms = 500;
    config.routing.sweep_interval_ms = 100;
    config
}

async fn build(network: &PipeNetwork, discovery: &Arc<MemoryDiscovery>, config: NodeConfig) -> Arc<Node> {
    let pk = config.node.local_pk;
    NodeBuilder::new(config)
        .with_factory(Arc::new(network.factory(pk)))
        .with_discovery(discovery.clone())
        .build()
        .await
        .unwrap()
}

async fn connect_app(node: &Node, name: &str, port: u16) -> AppClient<tokio::net::TcpStream> {
    let client = AppClient::connect(node.apps_addr().unwrap(), name, "1.0", port)
        .await
        .unwrap();
    timeout(WAIT, async {
        while !node.router().bound_ports().contains(&port) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    client
}

#[tokio::test]
async fn test_apps_talk_across_nodes() {
    let network = PipeNetwork::new();
    let discovery = Arc::new(MemoryDiscovery::new());
    let a = build(&network, &discovery, pipe_config()).await;
    let b = build(&network, &discovery, pipe_config()).await;
    a.start().await.unwrap();
    b.start().await.unwrap();

    let mut chat_a = connect_app(&a, "chat", 1).await;
    let mut chat_b = connect_app(&b, "chat", 1).await;

    let dialed = timeout(WAIT, chat_a.create_loop(Addr::new(b.local_pk(), 1)))
        .await
        .unwrap()
        .unwrap();
    let accepted = match timeout(WAIT, chat_b.recv()).await.unwrap().unwrap() {
        Some(AppEvent::LoopCreated(addr)) => addr,
        other => panic!("unexpected event {:?}", other),
    };

    chat_a.send(&dialed, b"hi b").await.unwrap();
    assert_eq!(
        timeout(WAIT, chat_b.recv()).await.unwrap().unwrap(),
        Some(AppEvent::Data {
            loop_addr: accepted,
            payload: b"hi b".to_vec()
        })
    );

    // Closing the accepting node ends the loop on the dialing side.
    b.close().await.unwrap();
    assert!(matches!(
        timeout(WAIT, chat_a.recv()).await.unwrap().unwrap(),
        Some(AppEvent::LoopClosed { loop_addr, .. }) if loop_addr == dialed
    ));

    a.close().await.unwrap();
}

#[tokio::test]
async fn test_double_close_and_never_started() {
    let network = PipeNetwork::new();
    let discovery = Arc::new(MemoryDiscovery::new());

    let idle = build(&network, &discovery, pipe_config()).await;
    idle.close().await.unwrap();
    idle.close().await.unwrap();
    assert_eq!(idle.state(), NodeState::Stopped);

    let running = build(&network, &discovery, pipe_config()).await;
    running.start().await.unwrap();
    let (x, y) = tokio::join!(running.close(), running.close());
    x.unwrap();
    y.unwrap();
    assert!(running.router().is_closed());
    assert!(running.manager().is_closed());
}

#[tokio::test]
async fn test_reserved_port_refused_through_listener() {
    let network = PipeNetwork::new();
    let discovery = Arc::new(MemoryDiscovery::new());
    let node = build(&network, &discovery, pipe_config()).await;
    node.start().await.unwrap();

    let _chat = connect_app(&node, "chat", 1).await;
    let mut impostor = AppClient::connect(node.apps_addr().unwrap(), "web", "1.0", 2)
        .await
        .unwrap();

    // The node hangs up on an app it cannot bind.
    let next = timeout(WAIT, impostor.recv()).await.unwrap();
    assert!(matches!(next, Ok(None) | Err(_)));
    assert_eq!(node.router().bound_ports(), vec![1]);

    let logs = node.app_logs("web").unwrap();
    let since = Utc::now() - ChronoDuration::minutes(1);
    timeout(WAIT, async {
        loop {
            let lines = logs.logs_since(since).unwrap();
            if lines.last().map(String::as_str) == Some("stopped: can't bind to reserved port 2") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    node.close().await.unwrap();
}

#[tokio::test]
async fn test_configured_app_keeps_its_port() {
    let network = PipeNetwork::new();
    let discovery = Arc::new(MemoryDiscovery::new());
    let mut config = pipe_config();
    config.apps = vec![AppEntry {
        name: "chat".to_string(),
        version: "1.0".to_string(),
        port: 1,
    }];
    let node = build(&network, &discovery, config).await;
    node.start().await.unwrap();

    let mut stray = AppClient::connect(node.apps_addr().unwrap(), "chat", "1.0", 5)
        .await
        .unwrap();
    let next = timeout(WAIT, stray.recv()).await.unwrap();
    assert!(matches!(next, Ok(None) | Err(_)));
    assert!(node.router().bound_ports().is_empty());

    let logs = node.app_logs("chat").unwrap();
    let since = Utc::now() - ChronoDuration::minutes(1);
    timeout(WAIT, async {
        while !logs
            .logs_since(since)
            .unwrap()
            .iter()
            .any(|line| line == "refused port 5: configured for port 1")
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let _chat = connect_app(&node, "chat", 1).await;
    assert_eq!(node.router().bound_ports(), vec![1]);

    node.close().await.unwrap();
}

#[tokio::test]
async fn test_custom_messaging_discovery_is_accepted() {
    let network = PipeNetwork::new();
    let config = pipe_config();
    let pk = config.node.local_pk;
    let servers = vec![ServerEntry {
        pk: common::keys_from_seed(7).pub_key(),
        address: "relay.example:8080".to_string(),
        available_sessions: 3,
    }];

    let node = NodeBuilder::new(config)
        .with_factory(Arc::new(network.factory(pk)))
        .with_messaging(Arc::new(StaticMessagingDiscovery::new(servers)))
        .build()
        .await
        .unwrap();
    node.start().await.unwrap();
    assert_eq!(node.state(), NodeState::Running);
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_config_file_drives_node() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    let mut config = pipe_config();
    config.routing.rule_keep_alive_secs = Some(60);
    save_config(&path, &config).unwrap();

    let loaded = load_config(&path).unwrap();
    assert_eq!(loaded, config);
    assert_eq!(
        loaded.router_config().rule_keep_alive,
        Some(Duration::from_secs(60))
    );

    let network = PipeNetwork::new();
    let node = build(&network, &Arc::new(MemoryDiscovery::new()), loaded).await;
    assert_eq!(node.local_pk(), config.node.local_pk);
    node.close().await.unwrap();
}

#[test]
fn test_file_log_store_range_queries() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("apps.jsonl");
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    let store = new_log_store(&path, "chat", FILE_KIND).unwrap();
    for i in 0..4 {
        store
            .store(t0 + ChronoDuration::milliseconds(250 * i), &format!("entry {}", i))
            .unwrap();
    }

    // Exact timestamp is included.
    assert_eq!(
        store.logs_since(t0 + ChronoDuration::milliseconds(500)).unwrap(),
        vec!["entry 2", "entry 3"]
    );
    // In-between timestamp starts at the next entry.
    assert_eq!(
        store.logs_since(t0 + ChronoDuration::milliseconds(501)).unwrap(),
        vec!["entry 3"]
    );
    drop(store);

    let reopened = new_log_store(&path, "chat", FILE_KIND).unwrap();
    assert_eq!(reopened.logs_since(t0).unwrap().len(), 4);
    let other_app = new_log_store(&path, "ssh", FILE_KIND).unwrap();
    assert!(other_app.logs_since(t0).unwrap().is_empty());
}
