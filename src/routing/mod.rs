//! Routing subsystem
//!
//! Routes are chains of per-node rules set up hop by hop over managed
//! transports. Each node only knows its own [`RouteId`]s and, for every rule,
//! the transport and route id of the next hop. Loops multiplex app
//! connections over routes; the [`Router`] owns both.
//!
//! # Architecture
//!
//! - **Packet / control**: the framing of routed traffic and the setup
//!   protocol messages
//! - **RoutingTable**: route id to [`RoutingRule`] storage with expiry
//! - **Ports and loops**: app bindings and the loops they own
//! - **Router**: reads transports, switches packets and runs setup/teardown
//!
//! # Example
//!
//! ```no_run
//! use meshwire::crypto::KeyPair;
//! use meshwire::routing::{MemoryRoutingTable, Router, RouterConfig, StaticRouteFinder};
//! use meshwire::transport::{ManagerConfig, MemoryDiscovery, TransportManager};
//! use std::sync::Arc;
//!
//! # async fn example() -> meshwire::error::Result<()> {
//! let keys = KeyPair::generate();
//! let manager = TransportManager::new(ManagerConfig::new(
//!     keys,
//!     Vec::new(),
//!     Arc::new(MemoryDiscovery::new()),
//! ));
//! let router = Router::new(
//!     RouterConfig::default(),
//!     manager.clone(),
//!     Arc::new(MemoryRoutingTable::new()),
//!     Arc::new(StaticRouteFinder::direct()),
//! );
//!
//! manager.start()?;
//! tokio::spawn(async move { router.serve().await });
//! # Ok(())
//! # }
//! ```

mod addr;
pub mod control;
mod finder;
mod loops;
mod packet;
mod ports;
mod router;
mod routing_table;
mod rule;
mod setup;

pub use addr::{Addr, LoopAddr, RouteId, NETWORK_NAME};
pub use finder::{RouteFinder, StaticRouteFinder};
pub use loops::{LoopEntry, LoopTable};
pub use packet::{Packet, PacketType, HEADER_LEN};
pub use ports::{default_reserved_ports, AppSender, PortManager, EPHEMERAL_START};
pub use router::{AppConfig, Router, RouterConfig};
pub use routing_table::{MemoryRoutingTable, RoutingTable};
pub use rule::{RoutingRule, RuleAction};
