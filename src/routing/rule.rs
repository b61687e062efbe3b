//! Routing rules

use super::addr::{Addr, LoopAddr, RouteId};
use crate::transport::TransportId;
use std::time::{Duration, Instant};

/// What to do with a packet arriving on a route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleAction {
    /// Re-send on the next hop
    Forward {
        /// Transport toward the next hop
        next_transport: TransportId,
        /// Route id in the next hop's table
        next_route: RouteId,
    },
    /// Deliver to a local loop
    App {
        /// Local port of the loop
        local_port: u16,
        /// Remote endpoint of the loop
        remote: Addr,
        /// Transport used to answer
        resp_transport: TransportId,
        /// Route id on the first hop of the answer path
        resp_route: RouteId,
    },
}

/// An entry of the routing table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRule {
    /// Packet handling
    pub action: RuleAction,
    /// The opposite direction's rule on the same node, if any
    pub paired: Option<RouteId>,
    /// When the rule stops being valid
    pub expire_at: Option<Instant>,
}

impl RoutingRule {
    /// Forwarding rule
    pub fn forward(next_transport: TransportId, next_route: RouteId) -> Self {
        Self {
            action: RuleAction::Forward {
                next_transport,
                next_route,
            },
            paired: None,
            expire_at: None,
        }
    }

    /// Loop termination rule
    pub fn app(loop_addr: LoopAddr, resp_transport: TransportId, resp_route: RouteId) -> Self {
        Self {
            action: RuleAction::App {
                local_port: loop_addr.port,
                remote: loop_addr.remote,
                resp_transport,
                resp_route,
            },
            paired: None,
            expire_at: None,
        }
    }

    /// Expire `ttl` from now
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expire_at = Some(Instant::now() + ttl);
        self
    }

    /// Whether the rule has expired at `now`
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expire_at.map_or(false, |at| at <= now)
    }

    /// Transport and route id packets leave on
    pub fn next_hop(&self) -> (TransportId, RouteId) {
        match self.action {
            RuleAction::Forward {
                next_transport,
                next_route,
            } => (next_transport, next_route),
            RuleAction::App {
                resp_transport,
                resp_route,
                ..
            } => (resp_transport, resp_route),
        }
    }

    /// Whether packets on this rule leave on `transport`
    pub fn uses_transport(&self, transport: &TransportId) -> bool {
        self.next_hop().0 == *transport
    }

    /// The loop this rule terminates, if it is an app rule
    pub fn loop_addr(&self) -> Option<LoopAddr> {
        match self.action {
            RuleAction::App {
                local_port, remote, ..
            } => Some(LoopAddr::new(local_port, remote)),
            RuleAction::Forward { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PubKey;

    fn tid(n: u8) -> TransportId {
        TransportId::derive(&PubKey::from_bytes([n; 32]), &PubKey::default(), "pipe")
    }

    #[test]
    fn test_next_hop() {
        let fwd = RoutingRule::forward(tid(1), RouteId(5));
        assert_eq!(fwd.next_hop(), (tid(1), RouteId(5)));
        assert!(fwd.uses_transport(&tid(1)));
        assert!(!fwd.uses_transport(&tid(2)));
        assert!(fwd.loop_addr().is_none());

        let lp = LoopAddr::new(10, Addr::new(PubKey::from_bytes([3; 32]), 2));
        let app = RoutingRule::app(lp, tid(2), RouteId(6));
        assert_eq!(app.next_hop(), (tid(2), RouteId(6)));
        assert_eq!(app.loop_addr(), Some(lp));
    }

    #[test]
    fn test_ttl() {
        let rule = RoutingRule::forward(tid(1), RouteId(1)).with_ttl(Duration::from_secs(60));
        let now = Instant::now();
        assert!(!rule.is_expired(now));
        assert!(rule.is_expired(now + Duration::from_secs(61)));
        assert!(!RoutingRule::forward(tid(1), RouteId(1)).is_expired(now));
    }
}
