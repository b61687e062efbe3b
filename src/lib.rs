//! # Meshwire
//!
//! A mesh overlay node: authenticated transports between public-key
//! identities, multi-hop routes set up across them, and loops that
//! multiplex app connections over those routes.
//!
//! ## Quick Start
//!
//! ```no_run
//! use meshwire::{NodeBuilder, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = NodeBuilder::new(NodeConfig::generate()).build().await?;
//!
//!     node.start().await?;
//!     node.close().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod api;
pub mod app;
pub mod crypto;
pub mod error;
pub mod routing;
pub mod storage;
pub mod transport;

mod shutdown;

// Re-export main types
pub use api::{Node, NodeBuilder, NodeState};
pub use app::{AppClient, AppEvent};
pub use crypto::{KeyPair, PubKey};
pub use error::{
    ConfigError, CryptoError, MeshwireError, ProtocolError, Result, RoutingError, SetupError,
    StorageError, TransportError,
};
pub use routing::{Addr, AppConfig, LoopAddr, RouteId, Router, RouterConfig, RoutingTable};
pub use storage::{LogStore, NodeConfig};
pub use transport::{TransportFactory, TransportManager};
