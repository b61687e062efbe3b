//! Transport layer
//!
//! A [`Transport`] is an unframed, bidirectional byte stream between two node
//! identities. [`TransportFactory`] implementations accept inbound and dial
//! outbound transports of one link type (TCP, in-memory pipes). The
//! [`TransportManager`] stacks the authenticated session layer
//! ([`ManagedTransport`]) on top and owns every live link.

pub mod discovery;
pub mod manager;
pub mod pipe;
pub mod pk_table;
pub mod session;
pub mod tcp;

pub use discovery::{
    MemoryDiscovery, MessagingDiscovery, ServerEntry, StaticMessagingDiscovery,
    TransportDiscovery,
};
pub use manager::{ManagerConfig, TransportEvent, TransportManager};
pub use pipe::{PipeFactory, PipeNetwork};
pub use pk_table::{FilePubKeyTable, MemoryPubKeyTable, PubKeyTable};
pub use session::{LinkDirection, ManagedTransport};
pub use tcp::{TcpFactory, TcpTransport};

use crate::crypto::PubKey;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

/// Type name of TCP transports
pub const TCP_TYPE: &str = "tcp";

/// Type name of in-memory pipe transports
pub const PIPE_TYPE: &str = "pipe";

/// Raw link between two nodes
///
/// Implementations do not frame or encrypt; that is the job of
/// [`ManagedTransport`].
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Key of the local node
    fn local_pk(&self) -> PubKey;

    /// Key of the remote node
    fn remote_pk(&self) -> PubKey;

    /// Link type name, e.g. [`TCP_TYPE`]
    fn transport_type(&self) -> &'static str;
}

/// Boxed raw transport as produced by factories
pub type BoxTransport = Box<dyn Transport>;

/// Creates raw transports of one link type
///
/// `accept` and `dial` are cancellation safe: dropping the future abandons
/// the attempt. After [`close`](TransportFactory::close) a blocked `accept`
/// returns [`TransportError::Closed`](crate::error::TransportError::Closed).
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Wait for the next inbound transport
    async fn accept(&self) -> Result<BoxTransport>;

    /// Open a transport to `remote`
    async fn dial(&self, remote: PubKey) -> Result<BoxTransport>;

    /// Stop accepting and release the listener
    async fn close(&self) -> Result<()>;

    /// Key of the local node
    fn local_pk(&self) -> PubKey;

    /// Link type name produced by this factory
    fn transport_type(&self) -> &'static str;
}

/// Identifier of a transport, identical on both ends
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId([u8; 16]);

impl TransportId {
    /// Derive the id of the link between `a` and `b` of the given type
    ///
    /// Argument order does not matter.
    pub fn derive(a: &PubKey, b: &PubKey, transport_type: &str) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };

        let mut hasher = blake3::Hasher::new();
        hasher.update(low.as_bytes());
        hasher.update(high.as_bytes());
        hasher.update(transport_type.as_bytes());

        let mut id = [0u8; 16];
        id.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
        Self(id)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransportId({})", hex::encode(self.0))
    }
}

impl Serialize for TransportId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for TransportId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        let id: [u8; 16] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| serde::de::Error::custom("transport id must be 16 bytes"))?;
        Ok(Self(id))
    }
}

/// Descriptor registered with transport discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportEntry {
    /// Transport id
    pub id: TransportId,
    /// Both endpoint keys, lower key first
    pub edges: [PubKey; 2],
    /// Link type name
    #[serde(rename = "type")]
    pub transport_type: String,
    /// Whether the link may be advertised to other nodes
    pub public: bool,
}

impl TransportEntry {
    /// Build the descriptor of a link between `a` and `b`
    pub fn new(a: PubKey, b: PubKey, transport_type: &str, public: bool) -> Self {
        let edges = if a <= b { [a, b] } else { [b, a] };
        Self {
            id: TransportId::derive(&a, &b, transport_type),
            edges,
            transport_type: transport_type.to_string(),
            public,
        }
    }

    /// Whether `pk` is one of the endpoints
    pub fn has_edge(&self, pk: &PubKey) -> bool {
        self.edges.contains(pk)
    }
}
