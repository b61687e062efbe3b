//! In-flight route setups
//!
//! Every node that sends a `SetupRequest` downstream records it here under a
//! request id of its own, together with where the answer has to go: a local
//! waiter on the initiator, or the upstream hop's transport and request id on
//! an intermediate.

use super::addr::RouteId;
use crate::error::SetupError;
use crate::transport::TransportId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Outcome delivered to a local waiter: the first downstream route id
pub(crate) type SetupOutcome = std::result::Result<RouteId, SetupError>;

/// Where the answer to a setup goes
pub(crate) enum Upstream {
    /// The setup was started on this node
    Local(oneshot::Sender<SetupOutcome>),
    /// The setup came from another hop
    Remote {
        /// Transport the request arrived on
        transport: TransportId,
        /// The upstream hop's request id
        request_id: u64,
    },
}

pub(crate) struct PendingSetup {
    pub(crate) upstream: Upstream,
    /// Transport the request was sent on; answers must come back on it
    pub(crate) downstream: TransportId,
    /// Rule installed locally for the reverse direction
    pub(crate) local_rule: RouteId,
    pub(crate) deadline: Instant,
}

pub(crate) struct SetupTable {
    next_id: AtomicU64,
    pending: DashMap<u64, PendingSetup>,
}

impl SetupTable {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
        }
    }

    /// Record a setup and return its request id
    pub(crate) fn register(
        &self,
        upstream: Upstream,
        downstream: TransportId,
        local_rule: RouteId,
        ttl: Duration,
    ) -> u64 {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(
            request_id,
            PendingSetup {
                upstream,
                downstream,
                local_rule,
                deadline: Instant::now() + ttl,
            },
        );
        request_id
    }

    /// Take a setup regardless of where its answer came from
    pub(crate) fn take(&self, request_id: u64) -> Option<PendingSetup> {
        self.pending.remove(&request_id).map(|(_, p)| p)
    }

    /// Take a setup answered on `transport`
    pub(crate) fn take_answered(
        &self,
        request_id: u64,
        transport: &TransportId,
    ) -> Option<PendingSetup> {
        self.pending
            .remove_if(&request_id, |_, p| p.downstream == *transport)
            .map(|(_, p)| p)
    }

    /// Take setups past their deadline
    pub(crate) fn take_expired(&self, now: Instant) -> Vec<PendingSetup> {
        self.take_matching(|p| p.deadline <= now)
    }

    /// Take setups waiting on answers from `transport`
    pub(crate) fn take_by_downstream(&self, transport: &TransportId) -> Vec<PendingSetup> {
        self.take_matching(|p| p.downstream == *transport)
    }

    /// Take every setup
    pub(crate) fn drain(&self) -> Vec<PendingSetup> {
        self.take_matching(|_| true)
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    fn take_matching<F>(&self, pred: F) -> Vec<PendingSetup>
    where
        F: Fn(&PendingSetup) -> bool,
    {
        let ids: Vec<u64> = self
            .pending
            .iter()
            .filter(|e| pred(e.value()))
            .map(|e| *e.key())
            .collect();

        ids.into_iter()
            .filter_map(|id| self.pending.remove_if(&id, |_, p| pred(p)))
            .map(|(_, p)| p)
            .collect()
    }
}
