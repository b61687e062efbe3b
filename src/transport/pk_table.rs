//! Public key to network address translation
//!
//! The TCP factory has no way to learn a peer's identity from the socket
//! alone, so it consults a [`PubKeyTable`]: forward lookups map a key to the
//! address to dial, reverse lookups map an inbound peer address back to a key.
//!
//! Reverse lookups only use the IP of the resolved address. Two entries that
//! share a host but differ in port resolve to whichever entry was indexed
//! last; this is documented behavior of the table, not an accident.

use crate::crypto::PubKey;
use crate::error::{Result, StorageError, TransportError};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Translation between remote public keys and TCP addresses
pub trait PubKeyTable: Send + Sync {
    /// Address of the given key, or an empty string if unknown
    fn remote_addr(&self, remote_pk: &PubKey) -> String;

    /// Key of the node at the given address, or the null key if unknown
    fn remote_pk(&self, address: &str) -> PubKey;

    /// Number of entries
    fn count(&self) -> usize;
}

/// Resolve `host:port` text to a socket address
fn resolve(address: &str) -> std::result::Result<SocketAddr, String> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    address
        .to_socket_addrs()
        .map_err(|e| e.to_string())?
        .next()
        .ok_or_else(|| "no addresses resolved".to_string())
}

/// In-memory [`PubKeyTable`]
#[derive(Debug, Clone, Default)]
pub struct MemoryPubKeyTable {
    entries: HashMap<PubKey, String>,
    reverse: HashMap<IpAddr, PubKey>,
}

impl MemoryPubKeyTable {
    /// Build a table from a key to address mapping
    ///
    /// Every address is resolved to build the reverse index.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidAddress`] for the first address that
    /// cannot be resolved; callers must only supply well-formed addresses.
    ///
    /// # Example
    ///
    /// ```
    /// use meshwire::crypto::KeyPair;
    /// use meshwire::transport::{MemoryPubKeyTable, PubKeyTable};
    /// use std::collections::HashMap;
    ///
    /// let pk = KeyPair::generate().pub_key();
    /// let table = MemoryPubKeyTable::new(HashMap::from([(pk, "10.0.0.2:7777".to_string())])).unwrap();
    /// assert_eq!(table.remote_pk("10.0.0.2:7777"), pk);
    /// ```
    pub fn new(entries: HashMap<PubKey, String>) -> Result<Self> {
        let mut reverse = HashMap::with_capacity(entries.len());
        for (pk, address) in &entries {
            let addr = resolve(address).map_err(|reason| TransportError::InvalidAddress {
                address: address.clone(),
                reason,
            })?;
            reverse.insert(addr.ip(), *pk);
        }
        Ok(Self { entries, reverse })
    }
}

impl PubKeyTable for MemoryPubKeyTable {
    fn remote_addr(&self, remote_pk: &PubKey) -> String {
        self.entries.get(remote_pk).cloned().unwrap_or_default()
    }

    fn remote_pk(&self, address: &str) -> PubKey {
        match resolve(address) {
            Ok(addr) => self.reverse.get(&addr.ip()).copied().unwrap_or_default(),
            Err(reason) => {
                debug!(address, %reason, "Reverse lookup of unresolvable address");
                PubKey::default()
            },
        }
    }

    fn count(&self) -> usize {
        self.entries.len()
    }
}

/// [`PubKeyTable`] loaded from a flat file
///
/// Each line holds `<pubkey-hex> <host:port>`. Blank and malformed lines
/// (wrong field count, bad key, unresolvable address) are skipped.
#[derive(Debug, Clone)]
pub struct FilePubKeyTable {
    path: PathBuf,
    table: MemoryPubKeyTable,
}

impl FilePubKeyTable {
    /// Load the table from `path`
    ///
    /// # Errors
    ///
    /// Fails only if the file cannot be read.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::FileNotFound {
                path: path.to_path_buf(),
            },
            _ => StorageError::Io(e),
        })?;

        let mut entries = HashMap::new();
        for (idx, line) in contents.lines().enumerate() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }
            if fields.len() != 2 {
                warn!(line = idx + 1, "Skipping pubkey table line with {} fields", fields.len());
                continue;
            }

            let Ok(pk) = PubKey::from_hex(fields[0]) else {
                warn!(line = idx + 1, "Skipping pubkey table line with bad key");
                continue;
            };

            match resolve(fields[1]) {
                Ok(addr) => {
                    entries.insert(pk, addr.to_string());
                },
                Err(reason) => {
                    warn!(line = idx + 1, %reason, "Skipping pubkey table line with bad address");
                },
            }
        }

        let table = MemoryPubKeyTable::new(entries)?;
        debug!(path = %path.display(), count = table.count(), "Loaded pubkey table");

        Ok(Self {
            path: path.to_path_buf(),
            table,
        })
    }

    /// File the table was loaded from
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PubKeyTable for FilePubKeyTable {
    fn remote_addr(&self, remote_pk: &PubKey) -> String {
        self.table.remote_addr(remote_pk)
    }

    fn remote_pk(&self, address: &str) -> PubKey {
        self.table.remote_pk(address)
    }

    fn count(&self) -> usize {
        self.table.count()
    }
}
