//! Active loops of the local node

use super::addr::{LoopAddr, RouteId};
use crate::error::SetupError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// State of one loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopEntry {
    /// Local app rule carrying the loop, [`RouteId::NONE`] while setting up
    pub rule: RouteId,
    /// App port that owns the loop
    pub owner_port: u16,
}

/// Loop registry keyed by [`LoopAddr`]
#[derive(Debug, Default)]
pub struct LoopTable {
    loops: DashMap<LoopAddr, LoopEntry>,
}

impl LoopTable {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `addr` for `owner_port` before its rule exists
    pub fn reserve(&self, addr: LoopAddr, owner_port: u16) -> Result<(), SetupError> {
        match self.loops.entry(addr) {
            Entry::Occupied(_) => Err(SetupError::LoopExists(addr.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(LoopEntry {
                    rule: RouteId::NONE,
                    owner_port,
                });
                Ok(())
            },
        }
    }

    /// Attach the app rule to a reserved loop
    pub fn activate(&self, addr: &LoopAddr, rule: RouteId) -> bool {
        match self.loops.get_mut(addr) {
            Some(mut entry) => {
                entry.rule = rule;
                true
            },
            None => false,
        }
    }

    /// Look up a loop
    pub fn get(&self, addr: &LoopAddr) -> Option<LoopEntry> {
        self.loops.get(addr).map(|e| *e.value())
    }

    /// Remove a loop
    pub fn remove(&self, addr: &LoopAddr) -> Option<LoopEntry> {
        self.loops.remove(addr).map(|(_, e)| e)
    }

    /// Remove a loop only while it is still carried by `rule`
    pub fn remove_if_rule(&self, addr: &LoopAddr, rule: RouteId) -> Option<LoopEntry> {
        self.loops
            .remove_if(addr, |_, e| e.rule == rule)
            .map(|(_, e)| e)
    }

    /// Loops owned by the app on `owner_port`
    pub fn owned_by(&self, owner_port: u16) -> Vec<LoopAddr> {
        self.loops
            .iter()
            .filter(|e| e.value().owner_port == owner_port)
            .map(|e| *e.key())
            .collect()
    }

    /// Every loop address
    pub fn all(&self) -> Vec<LoopAddr> {
        self.loops.iter().map(|e| *e.key()).collect()
    }

    /// Number of loops
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    /// Whether there are no loops
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PubKey;
    use crate::routing::Addr;

    #[test]
    fn test_reserve_activate_remove() {
        let loops = LoopTable::new();
        let addr = LoopAddr::new(10, Addr::new(PubKey::from_bytes([1; 32]), 1));

        loops.reserve(addr, 10).unwrap();
        assert!(matches!(
            loops.reserve(addr, 10),
            Err(SetupError::LoopExists(_))
        ));
        assert!(loops.get(&addr).unwrap().rule.is_none());

        assert!(loops.activate(&addr, RouteId(4)));
        assert_eq!(loops.get(&addr).unwrap().rule, RouteId(4));
        assert_eq!(loops.owned_by(10), vec![addr]);

        assert!(loops.remove_if_rule(&addr, RouteId(5)).is_none());
        assert!(loops.remove_if_rule(&addr, RouteId(4)).is_some());
        assert!(loops.remove(&addr).is_none());
        assert!(!loops.activate(&addr, RouteId(5)));
        assert!(loops.is_empty());
    }
}
