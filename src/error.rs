//! Error types for Meshwire
//!
//! Every subsystem has its own error enum; [`MeshwireError`] wraps them so the
//! public API can return a single [`Result`] type.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Meshwire operations
#[derive(Error, Debug)]
pub enum MeshwireError {
    /// Transport-related errors
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Routing table and data path errors
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// Route/loop setup protocol errors
    #[error(transparent)]
    Setup(#[from] SetupError),

    /// Cryptographic errors
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Wire protocol errors
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Storage errors
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Configuration errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Several errors collected while tearing things down
    #[error("{} errors occurred: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<MeshwireError>),
}

fn join_errors(errors: &[MeshwireError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Transport and transport manager errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// No address is known for the remote key, or no key for the remote address
    #[error("unknown remote")]
    UnknownRemote,

    /// Inbound connection came from an address missing in the translation table
    #[error("unknown remote: raddr {address}")]
    UnknownRemoteAddr {
        /// The remote socket address
        address: String,
    },

    /// Address could not be parsed or resolved
    #[error("invalid address {address}: {reason}")]
    InvalidAddress {
        /// The offending address
        address: String,
        /// Why it was rejected
        reason: String,
    },

    /// Connection could not be established
    #[error("failed to connect to {remote}: {reason}")]
    ConnectionFailed {
        /// Remote identity or address
        remote: String,
        /// Failure reason
        reason: String,
    },

    /// Transport or factory has been closed
    #[error("transport closed")]
    Closed,

    /// Transport with the given id is not registered
    #[error("transport {0} not found")]
    NotFound(String),

    /// None of the configured factories could reach the remote
    #[error("no factory could dial {remote}")]
    NoFactory {
        /// Remote identity
        remote: String,
    },

    /// Frame exceeds the session's maximum size
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Frame size
        size: usize,
        /// Maximum allowed
        max: usize,
    },

    /// Peer closed the stream
    #[error("connection reset by peer")]
    ConnectionReset,

    /// Operation was cancelled by shutdown
    #[error("operation cancelled")]
    Cancelled,

    /// Operation did not complete in time
    #[error("transport operation timed out")]
    Timeout,

    /// Underlying socket error
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Routing table and data path errors
#[derive(Error, Debug)]
pub enum RoutingError {
    /// No rule for the given route id
    #[error("route {0} not found")]
    RuleNotFound(u32),

    /// Route id space is exhausted
    #[error("no free route ids")]
    NoFreeRouteIds,

    /// No loop matches the given address pair
    #[error("loop {0} not found")]
    LoopNotFound(String),

    /// Router has been closed
    #[error("router closed")]
    Closed,

    /// The router's event loop is already running
    #[error("router is already serving")]
    AlreadyServing,

    /// Writing to the next hop failed
    #[error("failed to forward on route {route_id}: {reason}")]
    ForwardFailed {
        /// Route the packet was sent on
        route_id: u32,
        /// Failure reason
        reason: String,
    },
}

/// Loop and route setup errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SetupError {
    /// Port belongs to another application
    #[error("can't bind to reserved port {0}")]
    ReservedPort(u16),

    /// An application with this name is already served
    #[error("app {0} is already started")]
    AppAlreadyStarted(String),

    /// The port already has an application bound
    #[error("port {0} is already bound")]
    PortAlreadyBound(u16),

    /// No free ephemeral ports
    #[error("no free ephemeral ports")]
    NoFreePorts,

    /// The destination has no app on the requested port
    #[error("no app bound to port {0}")]
    NoAppBound(u16),

    /// A loop between these addresses is already active
    #[error("loop {0} already exists")]
    LoopExists(String),

    /// A hop along the path could not be reached
    #[error("hop {hop} unreachable: {reason}")]
    Unreachable {
        /// Identity of the unreachable hop
        hop: String,
        /// Failure reason
        reason: String,
    },

    /// A node along the path rejected the setup
    #[error("setup rejected: {0}")]
    Rejected(String),

    /// Confirmation did not arrive in time
    #[error("route setup timed out")]
    Timeout,

    /// Loops to the local node are not routed
    #[error("cannot create loop to self")]
    LoopToSelf,

    /// Request was malformed
    #[error("invalid setup request: {0}")]
    InvalidRequest(String),

    /// Router shut down while the setup was in flight
    #[error("router closed")]
    RouterClosed,
}

/// Cryptographic errors
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Key bytes or text could not be parsed
    #[error("invalid key: {reason}")]
    InvalidKey {
        /// Why the key was rejected
        reason: String,
    },

    /// Signature did not verify
    #[error("signature verification failed")]
    InvalidSignature,

    /// Session handshake failed
    #[error("handshake failed: {reason}")]
    HandshakeFailed {
        /// Failure reason
        reason: String,
    },

    /// Sealing a frame failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// Opening a frame failed (tampered or out of order)
    #[error("decryption failed")]
    DecryptionFailed,
}

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Packet bytes are malformed
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// Unknown packet type byte
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),

    /// prost decode failure
    #[error("failed to decode {message}: {reason}")]
    Decode {
        /// Message kind being decoded
        message: &'static str,
        /// Decoder error
        reason: String,
    },

    /// Message carried no body
    #[error("empty {0} message")]
    EmptyMessage(&'static str),
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// File does not exist
    #[error("file not found: {path}")]
    FileNotFound {
        /// Missing path
        path: PathBuf,
    },

    /// Unknown log store kind
    #[error("no log store of type {0}")]
    UnknownKind(String),

    /// A stored record could not be parsed
    #[error("corrupt record in {path} at line {line}: {reason}")]
    CorruptRecord {
        /// Store file
        path: PathBuf,
        /// 1-based line number
        line: usize,
        /// Parser error
        reason: String,
    },

    /// JSON (de)serialization failure
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying file error
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A field has an invalid value
    #[error("invalid config field {field}: {reason}")]
    InvalidField {
        /// Field path
        field: String,
        /// Why it was rejected
        reason: String,
    },

    /// A required field is missing
    #[error("missing config field {0}")]
    MissingField(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, MeshwireError>;
