//! Node configuration
//!
//! Configuration is stored as human-readable JSON. Every section has
//! defaults, so a file only needs the node keys; `save_config` always writes
//! the full document.

use crate::crypto::{KeyPair, PubKey, SecKey};
use crate::error::{ConfigError, Result, StorageError};
use crate::routing::{default_reserved_ports, RouterConfig};
use crate::storage::log_store::{FILE_KIND, MEMORY_KIND};
use crate::transport::ServerEntry;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Node identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSection {
    /// Public key (hex)
    pub local_pk: PubKey,
    /// Secret key seed (hex)
    pub local_sk: String,
}

/// Transport settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportSection {
    /// Address the TCP factory listens on; `None` disables TCP
    pub tcp_listen_addr: Option<String>,
    /// Flat pubkey table file (`<pubkey-hex> <host:port>` per line)
    pub pubkey_table: Option<PathBuf>,
    /// Inline pubkey table, used when no file is given
    pub peers: HashMap<PubKey, String>,
    /// Relay servers offered to messaging discovery
    pub messaging_servers: Vec<ServerEntry>,
    /// Peers to keep a transport to
    pub default_nodes: Vec<PubKey>,
    /// Redial interval for default nodes, in seconds
    pub reconnect_interval_secs: u64,
    /// Bound on one dial, in seconds
    pub dial_timeout_secs: u64,
    /// Whether transports are advertised as public
    pub public: bool,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            tcp_listen_addr: Some("0.0.0.0:7777".to_string()),
            pubkey_table: None,
            peers: HashMap::new(),
            messaging_servers: Vec::new(),
            default_nodes: Vec::new(),
            reconnect_interval_secs: 10,
            dial_timeout_secs: 10,
            public: true,
        }
    }
}

/// Routing settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoutingSection {
    /// Bound on a route setup, in milliseconds
    pub setup_timeout_ms: u64,
    /// Bound on a teardown notice, in milliseconds
    pub teardown_timeout_ms: u64,
    /// Sweep interval for expired rules, in milliseconds
    pub sweep_interval_ms: u64,
    /// Idle lifetime of established rules, in seconds; absent keeps rules
    pub rule_keep_alive_secs: Option<u64>,
    /// Frames queued toward an app before backpressure
    pub app_buffer: usize,
    /// Destination to intermediates
    pub static_routes: HashMap<PubKey, Vec<PubKey>>,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            setup_timeout_ms: 10_000,
            teardown_timeout_ms: 5_000,
            sweep_interval_ms: 5_000,
            rule_keep_alive_secs: None,
            app_buffer: 64,
            static_routes: HashMap::new(),
        }
    }
}

/// An app allowed to connect through the app listener
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppEntry {
    /// App name
    pub name: String,
    /// App version
    #[serde(default)]
    pub version: String,
    /// Port reserved for the app
    pub port: u16,
}

/// Log store settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogStoreSection {
    /// `"file"` or `"memory"`
    pub kind: String,
    /// File for the `"file"` kind
    pub path: PathBuf,
}

impl Default for LogStoreSection {
    fn default() -> Self {
        Self {
            kind: FILE_KIND.to_string(),
            path: PathBuf::from("./meshwire-logs.jsonl"),
        }
    }
}

/// Full node configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    /// Identity
    pub node: NodeSection,

    /// Transports
    #[serde(default)]
    pub transport: TransportSection,

    /// Routing
    #[serde(default)]
    pub routing: RoutingSection,

    /// Apps allowed on the app listener; empty allows any app
    #[serde(default)]
    pub apps: Vec<AppEntry>,

    /// Local TCP address apps connect to; `None` disables the listener
    #[serde(default)]
    pub apps_listen_addr: Option<String>,

    /// App log storage
    #[serde(default)]
    pub log_store: LogStoreSection,

    /// Default tracing filter, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl NodeConfig {
    /// Defaults around the given identity
    pub fn new(keys: &KeyPair) -> Self {
        Self {
            node: NodeSection {
                local_pk: keys.pub_key(),
                local_sk: keys.sec_key().to_hex(),
            },
            transport: TransportSection::default(),
            routing: RoutingSection::default(),
            apps: Vec::new(),
            apps_listen_addr: Some("127.0.0.1:3435".to_string()),
            log_store: LogStoreSection::default(),
            log_level: default_log_level(),
        }
    }

    /// Defaults around a fresh identity
    pub fn generate() -> Self {
        Self::new(&KeyPair::generate())
    }

    /// Identity from the node section
    pub fn keys(&self) -> Result<KeyPair> {
        Ok(KeyPair::from_sec_key(SecKey::from_hex(&self.node.local_sk)?))
    }

    /// Router settings derived from the routing and apps sections
    ///
    /// Every configured app gets its port reserved under its name.
    pub fn router_config(&self) -> RouterConfig {
        let mut reserved_ports = default_reserved_ports();
        for app in &self.apps {
            reserved_ports.insert(app.port, app.name.clone());
        }

        RouterConfig {
            setup_timeout: Duration::from_millis(self.routing.setup_timeout_ms),
            teardown_timeout: Duration::from_millis(self.routing.teardown_timeout_ms),
            sweep_interval: Duration::from_millis(self.routing.sweep_interval_ms),
            rule_keep_alive: self.routing.rule_keep_alive_secs.map(Duration::from_secs),
            app_buffer: self.routing.app_buffer,
            reserved_ports,
        }
    }

    /// Check field values and cross-field consistency
    pub fn validate(&self) -> Result<()> {
        let keys = self.keys().map_err(|e| invalid("node.local_sk", e))?;
        if keys.pub_key() != self.node.local_pk {
            return Err(invalid("node.local_pk", "does not match local_sk"));
        }

        if let Some(addr) = &self.transport.tcp_listen_addr {
            addr.parse::<SocketAddr>()
                .map_err(|e| invalid("transport.tcp_listen_addr", e))?;
        }
        if let Some(addr) = &self.apps_listen_addr {
            addr.parse::<SocketAddr>()
                .map_err(|e| invalid("apps_listen_addr", e))?;
        }
        if self.transport.dial_timeout_secs == 0 {
            return Err(invalid("transport.dial_timeout_secs", "must be positive"));
        }
        if self.transport.reconnect_interval_secs == 0 {
            return Err(invalid("transport.reconnect_interval_secs", "must be positive"));
        }

        for (field, value) in [
            ("routing.setup_timeout_ms", self.routing.setup_timeout_ms),
            ("routing.teardown_timeout_ms", self.routing.teardown_timeout_ms),
            ("routing.sweep_interval_ms", self.routing.sweep_interval_ms),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be positive"));
            }
        }
        if self.routing.app_buffer == 0 {
            return Err(invalid("routing.app_buffer", "must be positive"));
        }
        for (dst, via) in &self.routing.static_routes {
            if via.contains(dst) || via.contains(&self.node.local_pk) {
                return Err(invalid("routing.static_routes", format!("route to {} loops", dst)));
            }
        }

        let defaults = default_reserved_ports();
        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for app in &self.apps {
            if app.name.is_empty() {
                return Err(ConfigError::MissingField("apps[].name".to_string()).into());
            }
            if !names.insert(app.name.as_str()) {
                return Err(invalid("apps", format!("app {} listed twice", app.name)));
            }
            if !ports.insert(app.port) {
                return Err(invalid("apps", format!("port {} listed twice", app.port)));
            }
            if let Some(owner) = defaults.get(&app.port) {
                if owner != &app.name {
                    return Err(invalid(
                        "apps",
                        format!("port {} is reserved for {}", app.port, owner),
                    ));
                }
            }
        }

        if self.log_store.kind != FILE_KIND && self.log_store.kind != MEMORY_KIND {
            return Err(StorageError::UnknownKind(self.log_store.kind.clone()).into());
        }
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::MissingField("log_level".to_string()).into());
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: impl ToString) -> crate::error::MeshwireError {
    ConfigError::InvalidField {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Save configuration to a JSON file
///
/// # Example
///
/// ```no_run
/// use meshwire::storage::config::{save_config, NodeConfig};
/// use std::path::Path;
///
/// let config = NodeConfig::generate();
/// save_config(Path::new("config.json"), &config).unwrap();
/// ```
pub fn save_config(path: &Path, config: &NodeConfig) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(StorageError::from)?;
    }

    let json = serde_json::to_string_pretty(config).map_err(StorageError::from)?;
    std::fs::write(path, json).map_err(StorageError::from)?;
    Ok(())
}

/// Load and validate configuration from a JSON file
///
/// # Errors
///
/// Returns an error if:
/// - The file doesn't exist
/// - The file contains invalid JSON
/// - A field fails validation
pub fn load_config(path: &Path) -> Result<NodeConfig> {
    if !path.exists() {
        return Err(StorageError::FileNotFound {
            path: path.to_path_buf(),
        }
        .into());
    }

    let json = std::fs::read_to_string(path).map_err(StorageError::from)?;
    let config: NodeConfig = serde_json::from_str(&json).map_err(StorageError::from)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generated_config_is_valid() {
        let config = NodeConfig::generate();
        config.validate().unwrap();
        assert_eq!(config.keys().unwrap().pub_key(), config.node.local_pk);
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.json");

        let mut config = NodeConfig::generate();
        config.apps.push(AppEntry {
            name: "chat".into(),
            version: "1.0".into(),
            port: 1,
        });
        config.routing.rule_keep_alive_secs = Some(30);

        save_config(&config_path, &config).unwrap();
        assert_eq!(load_config(&config_path).unwrap(), config);
    }

    #[test]
    fn test_minimal_file_gets_defaults() {
        let keys = KeyPair::generate();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        let json = format!(
            r#"{{"node": {{"local_pk": "{}", "local_sk": "{}"}}}}"#,
            keys.pub_key(),
            keys.sec_key().to_hex()
        );
        std::fs::write(&config_path, json).unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(config.routing, RoutingSection::default());
        assert_eq!(config.log_level, "info");
        assert!(config.apps_listen_addr.is_none());
    }

    #[test]
    fn test_load_nonexistent_config() {
        assert!(load_config(Path::new("/nonexistent/config.json")).is_err());
    }

    #[test]
    fn test_invalid_json() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        std::fs::write(&config_path, "not valid json").unwrap();
        assert!(load_config(&config_path).is_err());
    }

    #[test]
    fn test_mismatched_keys_rejected() {
        let mut config = NodeConfig::generate();
        config.node.local_pk = KeyPair::generate().pub_key();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_app_on_foreign_reserved_port_rejected() {
        let mut config = NodeConfig::generate();
        config.apps.push(AppEntry {
            name: "web".into(),
            version: String::new(),
            port: 2,
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reserved for ssh"), "{}", err);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = NodeConfig::generate();
        config.routing.setup_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_log_store_rejected() {
        let mut config = NodeConfig::generate();
        config.log_store.kind = "bbolt".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_router_config_reserves_app_ports() {
        let mut config = NodeConfig::generate();
        config.apps.push(AppEntry {
            name: "echo".into(),
            version: "1".into(),
            port: 40,
        });
        let router = config.router_config();
        assert_eq!(router.reserved_ports.get(&40).map(String::as_str), Some("echo"));
        assert_eq!(router.reserved_ports.get(&2).map(String::as_str), Some("ssh"));
    }
}
