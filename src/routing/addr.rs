//! Overlay addressing
//!
//! An [`Addr`] names an application endpoint: a node key plus a port on
//! that node. A [`LoopAddr`] names one multiplexed connection from the local
//! node's point of view, and a [`RouteId`] names one hop in a routing table.

use crate::crypto::PubKey;
use crate::error::{ConfigError, MeshwireError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of the overlay network reported by [`Addr::network`]
pub const NETWORK_NAME: &str = "meshwire";

/// Application endpoint on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Addr {
    /// Node identity
    pub pk: PubKey,
    /// Port on that node
    pub port: u16,
}

impl Addr {
    /// Create an address
    pub fn new(pk: PubKey, port: u16) -> Self {
        Self { pk, port }
    }

    /// Network name, for `net.Addr`-style consumers
    pub fn network(&self) -> &'static str {
        NETWORK_NAME
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pk, self.port)
    }
}

impl FromStr for Addr {
    type Err = MeshwireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidField {
            field: "addr".to_string(),
            reason: format!("{}: {}", s, reason),
        };

        let (pk, port) = s.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
        Ok(Self {
            pk: pk.parse()?,
            port,
        })
    }
}

/// One loop as seen from the local node
///
/// `port` is the local port (an app's bound port for accepted loops, an
/// ephemeral port for dialed ones); `remote` is the far endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoopAddr {
    /// Local port
    pub port: u16,
    /// Remote endpoint
    pub remote: Addr,
}

impl LoopAddr {
    /// Create a loop address
    pub fn new(port: u16, remote: Addr) -> Self {
        Self { port, remote }
    }
}

impl fmt::Display for LoopAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.port, self.remote)
    }
}

/// Key of a routing table entry
///
/// Zero never names a rule; it marks a not-yet-known id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteId(pub u32);

impl RouteId {
    /// The unset id
    pub const NONE: RouteId = RouteId(0);

    /// Whether this is [`RouteId::NONE`]
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for RouteId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn test_addr_text_form() {
        let pk = KeyPair::generate().pub_key();
        let addr = Addr::new(pk, 3);

        let text = addr.to_string();
        assert_eq!(text, format!("{}:3", pk));
        assert_eq!(text.parse::<Addr>().unwrap(), addr);
        assert_eq!(addr.network(), "meshwire");
    }

    #[test]
    fn test_addr_parse_errors() {
        assert!("nocolon".parse::<Addr>().is_err());
        assert!("abcd:1".parse::<Addr>().is_err());
        let pk = KeyPair::generate().pub_key();
        assert!(format!("{}:70000", pk).parse::<Addr>().is_err());
    }

    #[test]
    fn test_route_id_none() {
        assert!(RouteId::NONE.is_none());
        assert!(!RouteId(7).is_none());
        assert_eq!(RouteId::from(7).to_string(), "7");
    }
}
