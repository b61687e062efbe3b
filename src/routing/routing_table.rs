//! Routing table
//!
//! Maps local [`RouteId`]s to [`RoutingRule`]s. Ids are allocated
//! monotonically and never handed out while a live rule holds them. Expired
//! rules are invisible to lookups right away; [`RoutingTable::sweep_expired`]
//! reclaims them in the background.

use super::addr::RouteId;
use super::rule::RoutingRule;
use crate::error::{Result, RoutingError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Storage for routing rules
pub trait RoutingTable: Send + Sync {
    /// Store a rule under a fresh id
    fn add_rule(&self, rule: RoutingRule) -> Result<RouteId>;

    /// Replace the rule under an existing id
    fn set_rule(&self, id: RouteId, rule: RoutingRule) -> Result<()>;

    /// Live rule under `id`
    fn rule(&self, id: RouteId) -> Option<RoutingRule>;

    /// Remove and return the rule under `id`
    fn remove_rule(&self, id: RouteId) -> Option<RoutingRule>;

    /// Every live rule
    fn all_rules(&self) -> Vec<(RouteId, RoutingRule)>;

    /// Push a rule's expiry to `ttl` from now; rules without expiry stay so
    fn touch(&self, id: RouteId, ttl: Duration);

    /// Drop expired rules and return them
    fn sweep_expired(&self) -> Vec<(RouteId, RoutingRule)>;

    /// Number of stored rules, expired ones included until swept
    fn count(&self) -> usize;
}

/// In-memory [`RoutingTable`]
pub struct MemoryRoutingTable {
    rules: DashMap<RouteId, RoutingRule>,
    next_id: AtomicU32,
}

impl MemoryRoutingTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            rules: DashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }
}

impl Default for MemoryRoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingTable for MemoryRoutingTable {
    fn add_rule(&self, rule: RoutingRule) -> Result<RouteId> {
        // Skip zero and ids still held after the counter wraps.
        for _ in 0..u32::MAX {
            let id = RouteId(self.next_id.fetch_add(1, Ordering::Relaxed));
            if id.is_none() {
                continue;
            }
            if let Entry::Vacant(slot) = self.rules.entry(id) {
                slot.insert(rule);
                return Ok(id);
            }
        }
        Err(RoutingError::NoFreeRouteIds.into())
    }

    fn set_rule(&self, id: RouteId, rule: RoutingRule) -> Result<()> {
        match self.rules.get_mut(&id) {
            Some(mut existing) => {
                *existing = rule;
                Ok(())
            },
            None => Err(RoutingError::RuleNotFound(id.0).into()),
        }
    }

    fn rule(&self, id: RouteId) -> Option<RoutingRule> {
        let now = Instant::now();
        self.rules
            .get(&id)
            .map(|r| r.value().clone())
            .filter(|r| !r.is_expired(now))
    }

    fn remove_rule(&self, id: RouteId) -> Option<RoutingRule> {
        self.rules.remove(&id).map(|(_, rule)| rule)
    }

    fn all_rules(&self) -> Vec<(RouteId, RoutingRule)> {
        let now = Instant::now();
        let mut rules: Vec<(RouteId, RoutingRule)> = self
            .rules
            .iter()
            .filter(|r| !r.value().is_expired(now))
            .map(|r| (*r.key(), r.value().clone()))
            .collect();
        rules.sort_by_key(|(id, _)| *id);
        rules
    }

    fn touch(&self, id: RouteId, ttl: Duration) {
        if let Some(mut rule) = self.rules.get_mut(&id) {
            if rule.expire_at.is_some() {
                rule.expire_at = Some(Instant::now() + ttl);
            }
        }
    }

    fn sweep_expired(&self) -> Vec<(RouteId, RoutingRule)> {
        let now = Instant::now();
        let ids: Vec<RouteId> = self
            .rules
            .iter()
            .filter(|r| r.value().is_expired(now))
            .map(|r| *r.key())
            .collect();

        ids.into_iter()
            .filter_map(|id| self.rules.remove_if(&id, |_, rule| rule.is_expired(now)))
            .collect()
    }

    fn count(&self) -> usize {
        self.rules.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PubKey;
    use crate::transport::TransportId;

    fn rule() -> RoutingRule {
        let tid = TransportId::derive(&PubKey::from_bytes([1; 32]), &PubKey::default(), "tcp");
        RoutingRule::forward(tid, RouteId(9))
    }

    #[test]
    fn test_add_and_lookup() {
        let table = MemoryRoutingTable::new();
        let id = table.add_rule(rule()).unwrap();

        assert!(!id.is_none());
        assert_eq!(table.rule(id), Some(rule()));
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn test_removed_rule_is_gone() {
        let table = MemoryRoutingTable::new();
        let id = table.add_rule(rule()).unwrap();

        assert!(table.remove_rule(id).is_some());
        assert!(table.rule(id).is_none());
        assert!(table.remove_rule(id).is_none());
    }

    #[test]
    fn test_ids_are_monotonic_and_unique() {
        let table = MemoryRoutingTable::new();
        let a = table.add_rule(rule()).unwrap();
        let b = table.add_rule(rule()).unwrap();
        table.remove_rule(a);
        let c = table.add_rule(rule()).unwrap();

        assert!(a < b && b < c);
    }

    #[test]
    fn test_wrapped_counter_skips_live_ids() {
        let table = MemoryRoutingTable::new();
        let held = table.add_rule(rule()).unwrap();
        assert_eq!(held, RouteId(1));

        table.next_id.store(u32::MAX, Ordering::Relaxed);
        let last = table.add_rule(rule()).unwrap();
        let wrapped = table.add_rule(rule()).unwrap();

        assert_eq!(last, RouteId(u32::MAX));
        // Zero is skipped and 1 is still held.
        assert_eq!(wrapped, RouteId(2));
    }

    #[test]
    fn test_expired_rule_invisible_then_swept() {
        let table = MemoryRoutingTable::new();
        let live = table.add_rule(rule()).unwrap();
        let expired = table
            .add_rule(rule().with_ttl(Duration::from_millis(0)))
            .unwrap();

        assert!(table.rule(expired).is_none());
        assert_eq!(table.all_rules().len(), 1);
        assert_eq!(table.count(), 2);

        let swept: Vec<RouteId> = table.sweep_expired().into_iter().map(|(id, _)| id).collect();
        assert_eq!(swept, vec![expired]);
        assert_eq!(table.count(), 1);
        assert!(table.rule(live).is_some());
    }

    #[test]
    fn test_touch_extends_only_expiring_rules() {
        let table = MemoryRoutingTable::new();
        let id = table
            .add_rule(rule().with_ttl(Duration::from_millis(0)))
            .unwrap();
        table.touch(id, Duration::from_secs(60));
        assert!(table.rule(id).is_some());

        let permanent = table.add_rule(rule()).unwrap();
        table.touch(permanent, Duration::from_secs(60));
        assert!(table.rule(permanent).unwrap().expire_at.is_none());
    }

    #[test]
    fn test_set_rule_requires_existing() {
        let table = MemoryRoutingTable::new();
        assert!(table.set_rule(RouteId(5), rule()).is_err());

        let id = table.add_rule(rule()).unwrap();
        let mut updated = rule();
        updated.paired = Some(RouteId(3));
        table.set_rule(id, updated.clone()).unwrap();
        assert_eq!(table.rule(id), Some(updated));
    }
}
