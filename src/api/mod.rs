//! High-level API for Meshwire
//!
//! [`NodeBuilder`] turns a [`NodeConfig`](crate::storage::NodeConfig) into a
//! running [`Node`]; lower layers stay reachable through its accessors.

pub mod node;

pub use node::{Node, NodeBuilder, NodeState};
