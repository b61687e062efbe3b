//! Discovery collaborators
//!
//! The routing core only consumes discovery through two small contracts:
//! [`TransportDiscovery`] records which transports exist between which nodes,
//! and [`MessagingDiscovery`] lists relay servers. Remote HTTP clients
//! implement these traits outside this crate; the in-memory versions here
//! back tests and single-process meshes.

use super::{TransportEntry, TransportId};
use crate::crypto::PubKey;
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Registry of transports between nodes
#[async_trait]
pub trait TransportDiscovery: Send + Sync {
    /// Record a live transport
    async fn register(&self, entry: &TransportEntry) -> Result<()>;

    /// Forget a transport
    async fn deregister(&self, id: &TransportId) -> Result<()>;

    /// Transports with `pk` as one endpoint
    async fn lookup(&self, pk: &PubKey) -> Result<Vec<TransportEntry>>;
}

/// [`TransportDiscovery`] kept in process memory
///
/// Share one instance between several managers to simulate a common
/// discovery service.
#[derive(Debug, Default)]
pub struct MemoryDiscovery {
    entries: DashMap<TransportId, TransportEntry>,
}

impl MemoryDiscovery {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered transports
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Seed an entry without going through a manager
    pub fn insert(&self, entry: TransportEntry) {
        self.entries.insert(entry.id, entry);
    }
}

#[async_trait]
impl TransportDiscovery for MemoryDiscovery {
    async fn register(&self, entry: &TransportEntry) -> Result<()> {
        self.entries.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn deregister(&self, id: &TransportId) -> Result<()> {
        self.entries.remove(id);
        Ok(())
    }

    async fn lookup(&self, pk: &PubKey) -> Result<Vec<TransportEntry>> {
        let mut found: Vec<TransportEntry> = self
            .entries
            .iter()
            .filter(|e| e.value().has_edge(pk))
            .map(|e| e.value().clone())
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }
}

/// A relay server as listed by messaging discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    /// Server identity
    pub pk: PubKey,
    /// Reachable address
    pub address: String,
    /// Free relay sessions on the server
    pub available_sessions: u32,
}

/// Relay server lookup
#[async_trait]
pub trait MessagingDiscovery: Send + Sync {
    /// Servers with free sessions, at most `max`
    async fn available_servers(&self, max: usize) -> Result<Vec<ServerEntry>>;
}

/// [`MessagingDiscovery`] over a fixed server list
#[derive(Debug, Clone, Default)]
pub struct StaticMessagingDiscovery {
    servers: Vec<ServerEntry>,
}

impl StaticMessagingDiscovery {
    /// Serve the given list
    pub fn new(servers: Vec<ServerEntry>) -> Self {
        Self { servers }
    }
}

#[async_trait]
impl MessagingDiscovery for StaticMessagingDiscovery {
    async fn available_servers(&self, max: usize) -> Result<Vec<ServerEntry>> {
        let mut servers: Vec<ServerEntry> = self
            .servers
            .iter()
            .filter(|s| s.available_sessions > 0)
            .cloned()
            .collect();
        servers.sort_by(|a, b| b.available_sessions.cmp(&a.available_sessions));
        servers.truncate(max);
        Ok(servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::transport::{PIPE_TYPE, TCP_TYPE};

    #[tokio::test]
    async fn test_register_lookup_deregister() {
        let discovery = MemoryDiscovery::new();
        let a = KeyPair::generate().pub_key();
        let b = KeyPair::generate().pub_key();
        let c = KeyPair::generate().pub_key();

        let ab = TransportEntry::new(a, b, TCP_TYPE, true);
        let bc = TransportEntry::new(b, c, PIPE_TYPE, true);
        discovery.register(&ab).await.unwrap();
        discovery.register(&bc).await.unwrap();

        assert_eq!(discovery.lookup(&a).await.unwrap(), vec![ab.clone()]);
        assert_eq!(discovery.lookup(&b).await.unwrap().len(), 2);

        discovery.deregister(&ab.id).await.unwrap();
        assert!(discovery.lookup(&a).await.unwrap().is_empty());
        assert_eq!(discovery.len(), 1);
    }

    #[tokio::test]
    async fn test_available_servers_filters_and_limits() {
        let server = |n: u8, sessions| ServerEntry {
            pk: PubKey::from_bytes([n; 32]),
            address: format!("10.0.0.{}:9090", n),
            available_sessions: sessions,
        };
        let discovery =
            StaticMessagingDiscovery::new(vec![server(1, 0), server(2, 5), server(3, 9)]);

        let servers = discovery.available_servers(1).await.unwrap();
        assert_eq!(servers, vec![server(3, 9)]);

        let servers = discovery.available_servers(10).await.unwrap();
        assert_eq!(servers.len(), 2);
    }
}
