//! Route setup, teardown and loop multiplexing
//!
//! The router reads every transport the manager hands it, switches data
//! packets by route id and runs the setup protocol:
//!
//! 1. The initiator installs an app rule for the new loop and sends a
//!    `SetupRequest` to the first hop, naming its own rule as the upstream
//!    route.
//! 2. Each intermediate installs a reverse forwarding rule toward the
//!    upstream route and passes the request on with the remaining hops.
//! 3. The destination binds the loop to the app listening on the requested
//!    port and answers `SetupConfirm` with its own app rule.
//! 4. Going back, every intermediate installs the forward rule toward the
//!    confirmed downstream route, pairs it with the reverse one and confirms
//!    upstream with the new id.
//!
//! Rules created before confirmation carry the setup timeout as their TTL,
//! so a setup that stalls anywhere on the path leaves nothing behind.
//! Teardown walks the same rules with `CloseRoute`; a local rule is always
//! removed before the notice is sent, and sending is bounded.

use super::addr::{Addr, LoopAddr, RouteId};
use super::control::{
    control_message::Body as Control, CloseRoute, ControlMessage, SetupConfirm, SetupReject,
    SetupRequest,
};
use super::finder::RouteFinder;
use super::loops::LoopTable;
use super::packet::{Packet, PacketType};
use super::ports::{default_reserved_ports, PortManager};
use super::routing_table::RoutingTable;
use super::rule::{RoutingRule, RuleAction};
use super::setup::{PendingSetup, SetupTable, Upstream};
use crate::app::frame::{
    app_frame, loop_addr_of, read_app_frame, write_app_frame, CreateLoop, Data, LoopClosed,
    LoopConfirmed, LoopCreated, LoopFailed, LoopRef,
};
use crate::crypto::PubKey;
use crate::error::{MeshwireError, Result, RoutingError, SetupError, TransportError};
use crate::shutdown::{stopped, Shutdown};
use crate::transport::{ManagedTransport, TransportEvent, TransportId, TransportManager};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

const JOIN_GRACE: Duration = Duration::from_secs(2);

/// Router settings
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Bound on a whole setup; also the TTL of unconfirmed rules
    pub setup_timeout: Duration,
    /// Bound on delivering a teardown notice
    pub teardown_timeout: Duration,
    /// How often expired rules and setups are swept
    pub sweep_interval: Duration,
    /// Idle lifetime of established rules, refreshed by traffic; `None` keeps
    /// them until teardown
    pub rule_keep_alive: Option<Duration>,
    /// Frames queued toward an app before the router waits
    pub app_buffer: usize,
    /// Port to app-name reservations
    pub reserved_ports: HashMap<u16, String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            setup_timeout: Duration::from_secs(10),
            teardown_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(5),
            rule_keep_alive: None,
            app_buffer: 64,
            reserved_ports: default_reserved_ports(),
        }
    }
}

/// Descriptor of an app served by the router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// App name; one connection per name
    pub name: String,
    /// App version, informational
    pub version: String,
}

impl AppConfig {
    /// Create a descriptor
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// The routing control plane of one node
pub struct Router {
    config: RouterConfig,
    local_pk: PubKey,
    manager: Arc<TransportManager>,
    table: Arc<dyn RoutingTable>,
    finder: Arc<dyn RouteFinder>,
    ports: PortManager,
    loops: LoopTable,
    setups: SetupTable,
    shutdown: Shutdown,
    closed: AtomicBool,
}

impl Router {
    /// Create a router over `manager`; nothing runs until [`serve`](Self::serve)
    pub fn new(
        config: RouterConfig,
        manager: Arc<TransportManager>,
        table: Arc<dyn RoutingTable>,
        finder: Arc<dyn RouteFinder>,
    ) -> Arc<Self> {
        let ports = PortManager::new(config.reserved_ports.clone());
        Arc::new(Self {
            local_pk: manager.local_pk(),
            config,
            manager,
            table,
            finder,
            ports,
            loops: LoopTable::new(),
            setups: SetupTable::new(),
            shutdown: Shutdown::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Key of the local node
    pub fn local_pk(&self) -> PubKey {
        self.local_pk
    }

    /// Process transport events and packets until [`close`](Self::close)
    ///
    /// # Errors
    ///
    /// [`RoutingError::AlreadyServing`] if another task already consumes
    /// the manager's events, [`RoutingError::Closed`] after close.
    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        if self.is_closed() {
            return Err(RoutingError::Closed.into());
        }
        let mut events = self
            .manager
            .take_events()
            .ok_or(RoutingError::AlreadyServing)?;
        let mut stop = self.shutdown.subscribe();
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(local = %self.local_pk, "Router serving");
        loop {
            tokio::select! {
                _ = stopped(&mut stop) => break,
                event = events.recv() => match event {
                    Some(TransportEvent::Established(transport)) => self.spawn_reader(transport),
                    Some(TransportEvent::Closed { id, remote }) => {
                        let router = Arc::clone(self);
                        self.shutdown.add_task(tokio::spawn(async move {
                            router.handle_transport_closed(id, remote).await;
                        }));
                    },
                    None => break,
                },
                _ = sweep.tick() => self.sweep().await,
            }
        }
        debug!(local = %self.local_pk, "Router stopped serving");
        Ok(())
    }

    /// Bind an app connection to `port` and serve it until it disconnects
    ///
    /// The bind happens before any I/O; a reserved, taken or duplicate
    /// binding fails right away and leaves existing bindings alone. When the
    /// connection ends, every loop of the app is torn down and the port is
    /// released.
    pub async fn serve_app<S>(self: &Arc<Self>, conn: S, port: u16, app: AppConfig) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.is_closed() {
            return Err(RoutingError::Closed.into());
        }

        let (tx, mut rx) = mpsc::channel::<app_frame::Body>(self.config.app_buffer.max(1));
        self.ports.bind(port, &app.name, tx.clone())?;
        info!(app = %app.name, version = %app.version, port, "App bound");

        let (mut reader, mut writer) = tokio::io::split(conn);
        let mut writer_task = tokio::spawn(async move {
            while let Some(body) = rx.recv().await {
                if let Err(e) = write_app_frame(&mut writer, body).await {
                    debug!(port, error = %e, "App write failed");
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let mut stop = self.shutdown.subscribe();
        let result = loop {
            let frame = tokio::select! {
                _ = stopped(&mut stop) => break Ok(()),
                frame = read_app_frame(&mut reader) => frame,
            };
            match frame {
                Ok(Some(body)) => self.handle_app_frame(port, &tx, body).await,
                Ok(None) => break Ok(()),
                Err(e) => {
                    warn!(app = %app.name, port, error = %e, "App connection failed");
                    break Err(e);
                },
            }
        };

        for addr in self.loops.owned_by(port) {
            if let Err(e) = self.close_loop(&addr).await {
                debug!(loop_addr = %addr, error = %e, "Loop already gone");
            }
        }
        self.ports.unbind(port);
        drop(tx);

        // In-flight setups may still hold a sender; don't wait for them.
        if timeout(self.config.teardown_timeout, &mut writer_task)
            .await
            .is_err()
        {
            writer_task.abort();
        }

        info!(app = %app.name, port, "App unbound");
        result
    }

    /// Open a loop from the app on `local_port` to `remote`
    ///
    /// The loop gets an ephemeral local port; the returned address is how
    /// the app refers to it afterwards.
    pub async fn create_loop(&self, local_port: u16, remote: Addr) -> Result<LoopAddr> {
        if self.is_closed() {
            return Err(SetupError::RouterClosed.into());
        }
        if remote.pk == self.local_pk {
            return Err(SetupError::LoopToSelf.into());
        }

        let ephemeral = self.ports.alloc_ephemeral(local_port)?;
        let addr = LoopAddr::new(ephemeral, remote);
        if let Err(e) = self.loops.reserve(addr, local_port) {
            self.ports.free_ephemeral(ephemeral);
            return Err(e.into());
        }

        match self.setup_route(addr).await {
            Ok(rule) => {
                self.loops.activate(&addr, rule);
                info!(loop_addr = %addr, route = %rule, "Loop established");
                Ok(addr)
            },
            Err(e) => {
                self.loops.remove(&addr);
                self.ports.free_ephemeral(ephemeral);
                debug!(remote = %remote, error = %e, "Loop setup failed");
                Err(e)
            },
        }
    }

    /// Tear down a local loop
    ///
    /// The local rule goes first; the notice to the next hop is best effort
    /// and bounded by the teardown timeout.
    pub async fn close_loop(&self, addr: &LoopAddr) -> Result<()> {
        let entry = self
            .loops
            .remove(addr)
            .ok_or_else(|| RoutingError::LoopNotFound(addr.to_string()))?;
        self.ports.free_ephemeral(addr.port);

        if let Some(rule) = self.table.remove_rule(entry.rule) {
            let (transport, route) = rule.next_hop();
            self.send_close(transport, route, "loop closed").await;
        }
        info!(loop_addr = %addr, "Loop closed locally");
        Ok(())
    }

    /// Send `payload` on an established loop
    pub async fn send_app_data(&self, addr: &LoopAddr, payload: Vec<u8>) -> Result<()> {
        let entry = self
            .loops
            .get(addr)
            .filter(|e| !e.rule.is_none())
            .ok_or_else(|| RoutingError::LoopNotFound(addr.to_string()))?;
        let rule = self
            .rule(entry.rule)
            .ok_or(RoutingError::RuleNotFound(entry.rule.0))?;
        self.keep_alive(entry.rule, &rule);

        let (transport, route) = rule.next_hop();
        let transport = self
            .manager
            .transport(&transport)
            .ok_or_else(|| TransportError::NotFound(transport.to_string()))?;
        transport
            .write_frame(&Packet::data(route, payload).encode())
            .await
    }

    /// Live rule under `id`
    ///
    /// Rules whose next hop transport is gone are reported as absent.
    pub fn rule(&self, id: RouteId) -> Option<RoutingRule> {
        let rule = self.table.rule(id)?;
        let (transport, _) = rule.next_hop();
        self.manager
            .transport(&transport)
            .filter(|t| !t.is_closed())?;
        Some(rule)
    }

    /// Addresses of all local loops
    pub fn loops(&self) -> Vec<LoopAddr> {
        self.loops.all()
    }

    /// Ports with a bound app
    pub fn bound_ports(&self) -> Vec<u16> {
        self.ports.bound_ports()
    }

    /// Routing table the router writes to
    pub fn table(&self) -> &Arc<dyn RoutingTable> {
        &self.table
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop serving, fail pending setups and tear down every loop
    ///
    /// Closing twice, or closing a router that never served, is a no-op.
    /// The transport manager is left running.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.signal();

        for pending in self.setups.drain() {
            self.table.remove_rule(pending.local_rule);
            if let Upstream::Local(tx) = pending.upstream {
                let _ = tx.send(Err(SetupError::RouterClosed));
            }
        }

        for addr in self.loops.all() {
            let _ = self.close_loop(&addr).await;
        }

        self.shutdown.join_all(JOIN_GRACE).await;
        info!(local = %self.local_pk, "Router closed");
        Ok(())
    }

    // ---- initiator ----

    async fn setup_route(&self, addr: LoopAddr) -> Result<RouteId> {
        let remote = addr.remote;
        let hops = self.finder.find_route(&self.local_pk, &remote.pk).await?;
        let (first, rest) = match hops.split_first() {
            Some((first, rest)) if hops.last() == Some(&remote.pk) => (*first, rest),
            _ => {
                return Err(SetupError::InvalidRequest(format!(
                    "route to {} does not end at the destination",
                    remote.pk
                ))
                .into())
            },
        };

        let transport = self
            .manager
            .dial(first)
            .await
            .map_err(|e| unreachable_hop(&first, e))?;

        let rule_id = self.table.add_rule(
            RoutingRule::app(addr, transport.id(), RouteId::NONE)
                .with_ttl(self.config.setup_timeout),
        )?;
        let (tx, rx) = oneshot::channel();
        let request_id = self.setups.register(
            Upstream::Local(tx),
            transport.id(),
            rule_id,
            self.config.setup_timeout,
        );

        let request = SetupRequest {
            request_id,
            hops: rest.iter().map(|h| h.as_bytes().to_vec()).collect(),
            src_pk: self.local_pk.as_bytes().to_vec(),
            src_port: addr.port as u32,
            dst_pk: remote.pk.as_bytes().to_vec(),
            dst_port: remote.port as u32,
            upstream_route: rule_id.0,
        };
        debug!(request_id, hops = hops.len(), dst = %remote, "Sending setup request");

        if let Err(e) = self
            .write_bounded(&transport, Packet::control(Control::SetupRequest(request)))
            .await
        {
            self.setups.take(request_id);
            self.table.remove_rule(rule_id);
            return Err(unreachable_hop(&first, e).into());
        }

        let outcome = match timeout(self.config.setup_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SetupError::RouterClosed),
            Err(_) => {
                self.setups.take(request_id);
                Err(SetupError::Timeout)
            },
        };

        let downstream = match outcome {
            Ok(route) => route,
            Err(e) => {
                self.table.remove_rule(rule_id);
                return Err(e.into());
            },
        };

        let mut rule = RoutingRule::app(addr, transport.id(), downstream);
        rule.expire_at = self.keep_alive_deadline();
        if let Err(e) = self.table.set_rule(rule_id, rule) {
            // Swept or purged while the confirmation was on its way.
            self.send_close(transport.id(), downstream, "setup abandoned").await;
            return Err(e);
        }
        Ok(rule_id)
    }

    // ---- transport readers ----

    fn spawn_reader(self: &Arc<Self>, transport: Arc<ManagedTransport>) {
        let router = Arc::clone(self);
        let mut stop = self.shutdown.subscribe();
        debug!(remote = %transport.remote_pk(), id = %transport.id(), "Reading transport");

        self.shutdown.add_task(tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = stopped(&mut stop) => return,
                    frame = transport.read_frame() => frame,
                };
                match frame {
                    Ok(frame) => {
                        if let Err(e) = router.handle_frame(&transport, frame).await {
                            debug!(remote = %transport.remote_pk(), error = %e, "Dropped packet");
                        }
                    },
                    Err(e) => {
                        debug!(remote = %transport.remote_pk(), error = %e, "Transport read ended");
                        if let Err(e) = router.manager.close_transport(&transport).await {
                            warn!(remote = %transport.remote_pk(), error = %e, "Failed to close transport");
                        }
                        return;
                    },
                }
            }
        }));
    }

    async fn handle_frame(
        self: &Arc<Self>,
        from: &Arc<ManagedTransport>,
        frame: Vec<u8>,
    ) -> Result<()> {
        let packet = Packet::decode(&frame)?;
        match packet.packet_type {
            PacketType::Data => self.route_data(packet.route_id, packet.payload).await,
            PacketType::Control => match ControlMessage::from_bytes(&packet.payload)? {
                Control::SetupRequest(request) => {
                    let router = Arc::clone(self);
                    let from = Arc::clone(from);
                    self.shutdown.add_task(tokio::spawn(async move {
                        router.handle_setup_request(from, request).await;
                    }));
                    Ok(())
                },
                Control::SetupConfirm(confirm) => self.handle_setup_confirm(from, confirm).await,
                Control::SetupReject(reject) => {
                    self.handle_setup_reject(from, reject).await;
                    Ok(())
                },
                Control::CloseRoute(close) => {
                    self.handle_close_route(from, RouteId(close.route_id), &close.reason)
                        .await;
                    Ok(())
                },
            },
        }
    }

    async fn route_data(&self, route: RouteId, payload: Vec<u8>) -> Result<()> {
        let rule = self
            .rule(route)
            .ok_or(RoutingError::RuleNotFound(route.0))?;
        self.keep_alive(route, &rule);

        match rule.action {
            RuleAction::Forward {
                next_transport,
                next_route,
            } => {
                let transport = self
                    .manager
                    .transport(&next_transport)
                    .ok_or_else(|| TransportError::NotFound(next_transport.to_string()))?;
                transport
                    .write_frame(&Packet::data(next_route, payload).encode())
                    .await
                    .map_err(|e| {
                        RoutingError::ForwardFailed {
                            route_id: route.0,
                            reason: e.to_string(),
                        }
                        .into()
                    })
            },
            RuleAction::App {
                local_port, remote, ..
            } => {
                let addr = LoopAddr::new(local_port, remote);
                let sender = self
                    .ports
                    .sender(local_port)
                    .ok_or_else(|| RoutingError::LoopNotFound(addr.to_string()))?;
                trace!(loop_addr = %addr, len = payload.len(), "Delivering to app");
                // Waits while the app is behind; never drops.
                sender
                    .send(app_frame::Body::Data(Data {
                        loop_ref: Some(addr.into()),
                        payload,
                    }))
                    .await
                    .map_err(|_| RoutingError::LoopNotFound(addr.to_string()).into())
            },
        }
    }

    // ---- setup on intermediate and destination ----

    async fn handle_setup_request(&self, from: Arc<ManagedTransport>, request: SetupRequest) {
        let request_id = request.request_id;
        if let Err(e) = self.process_setup_request(&from, request).await {
            debug!(remote = %from.remote_pk(), request_id, error = %e, "Rejecting setup");
            let reject = SetupReject {
                request_id,
                reason: reject_reason(&e),
            };
            if let Err(e) = self
                .write_bounded(&from, Packet::control(Control::SetupReject(reject)))
                .await
            {
                debug!(remote = %from.remote_pk(), error = %e, "Reject not delivered");
            }
        }
    }

    async fn process_setup_request(
        &self,
        from: &Arc<ManagedTransport>,
        request: SetupRequest,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(SetupError::RouterClosed.into());
        }
        let src = request.src()?;
        let dst = request.dst()?;
        let hops = request.remaining_hops()?;
        let upstream = request.upstream();
        if upstream.is_none() {
            return Err(SetupError::InvalidRequest("missing upstream route".into()).into());
        }

        match hops.split_first() {
            None => {
                self.terminate_route(from, request.request_id, src, dst, upstream)
                    .await
            },
            Some((next, _)) => self.extend_route(from, request, *next, upstream).await,
        }
    }

    async fn extend_route(
        &self,
        from: &Arc<ManagedTransport>,
        mut request: SetupRequest,
        next: PubKey,
        upstream: RouteId,
    ) -> Result<()> {
        let reverse = self.table.add_rule(
            RoutingRule::forward(from.id(), upstream).with_ttl(self.config.setup_timeout),
        )?;

        let transport = match self.manager.dial(next).await {
            Ok(t) => t,
            Err(e) => {
                self.table.remove_rule(reverse);
                return Err(unreachable_hop(&next, e).into());
            },
        };

        let upstream_request = request.request_id;
        let request_id = self.setups.register(
            Upstream::Remote {
                transport: from.id(),
                request_id: upstream_request,
            },
            transport.id(),
            reverse,
            self.config.setup_timeout,
        );

        request.request_id = request_id;
        request.hops.remove(0);
        request.upstream_route = reverse.0;

        if let Err(e) = self
            .write_bounded(&transport, Packet::control(Control::SetupRequest(request)))
            .await
        {
            self.setups.take(request_id);
            self.table.remove_rule(reverse);
            return Err(unreachable_hop(&next, e).into());
        }
        debug!(upstream = %from.remote_pk(), next = %next, reverse = %reverse, "Setup forwarded");
        Ok(())
    }

    async fn terminate_route(
        &self,
        from: &Arc<ManagedTransport>,
        request_id: u64,
        src: Addr,
        dst: Addr,
        upstream: RouteId,
    ) -> Result<()> {
        if dst.pk != self.local_pk {
            return Err(SetupError::InvalidRequest(format!(
                "destination {} is not this node",
                dst.pk
            ))
            .into());
        }
        if !self.ports.is_bound(dst.port) {
            return Err(SetupError::NoAppBound(dst.port).into());
        }
        let sender = self
            .ports
            .sender(dst.port)
            .ok_or(SetupError::NoAppBound(dst.port))?;

        let addr = LoopAddr::new(dst.port, src);
        self.loops.reserve(addr, dst.port)?;

        let mut rule = RoutingRule::app(addr, from.id(), upstream);
        rule.expire_at = self.keep_alive_deadline();
        let rule_id = match self.table.add_rule(rule) {
            Ok(id) => id,
            Err(e) => {
                self.loops.remove(&addr);
                return Err(e);
            },
        };
        self.loops.activate(&addr, rule_id);

        // The app hears about the loop before any data can arrive on it.
        let created = app_frame::Body::LoopCreated(LoopCreated {
            loop_ref: Some(addr.into()),
        });
        if sender.send(created).await.is_err() {
            self.loops.remove(&addr);
            self.table.remove_rule(rule_id);
            return Err(SetupError::NoAppBound(dst.port).into());
        }

        let confirm = SetupConfirm {
            request_id,
            route_id: rule_id.0,
        };
        if let Err(e) = self
            .write_bounded(from, Packet::control(Control::SetupConfirm(confirm)))
            .await
        {
            self.table.remove_rule(rule_id);
            self.drop_loop_entry(addr, rule_id, "setup failed").await;
            return Err(e);
        }

        info!(loop_addr = %addr, route = %rule_id, "Loop accepted");
        Ok(())
    }

    async fn handle_setup_confirm(
        &self,
        from: &Arc<ManagedTransport>,
        confirm: SetupConfirm,
    ) -> Result<()> {
        let downstream = RouteId(confirm.route_id);
        let Some(pending) = self.setups.take_answered(confirm.request_id, &from.id()) else {
            debug!(request_id = confirm.request_id, "Confirmation for unknown setup");
            self.send_close(from.id(), downstream, "setup expired").await;
            return Ok(());
        };

        match pending.upstream {
            Upstream::Local(tx) => {
                if tx.send(Ok(downstream)).is_err() {
                    self.table.remove_rule(pending.local_rule);
                    self.send_close(from.id(), downstream, "setup abandoned").await;
                }
                Ok(())
            },
            Upstream::Remote {
                transport,
                request_id,
            } => {
                self.confirm_hop(from, downstream, pending.local_rule, transport, request_id)
                    .await
            },
        }
    }

    async fn confirm_hop(
        &self,
        from: &Arc<ManagedTransport>,
        downstream: RouteId,
        reverse: RouteId,
        upstream_transport: TransportId,
        upstream_request: u64,
    ) -> Result<()> {
        let Some(mut reverse_rule) = self.table.rule(reverse) else {
            self.send_close(from.id(), downstream, "upstream route gone").await;
            return Err(RoutingError::RuleNotFound(reverse.0).into());
        };

        let mut forward_rule = RoutingRule::forward(from.id(), downstream);
        forward_rule.paired = Some(reverse);
        forward_rule.expire_at = self.keep_alive_deadline();
        let forward = match self.table.add_rule(forward_rule) {
            Ok(id) => id,
            Err(e) => {
                self.table.remove_rule(reverse);
                self.send_close(from.id(), downstream, "no free route ids").await;
                return Err(e);
            },
        };

        reverse_rule.paired = Some(forward);
        reverse_rule.expire_at = self.keep_alive_deadline();
        self.table.set_rule(reverse, reverse_rule)?;

        let confirm = SetupConfirm {
            request_id: upstream_request,
            route_id: forward.0,
        };
        let sent = match self.manager.transport(&upstream_transport) {
            Some(t) => {
                self.write_bounded(&t, Packet::control(Control::SetupConfirm(confirm)))
                    .await
            },
            None => Err(TransportError::NotFound(upstream_transport.to_string()).into()),
        };
        if let Err(e) = sent {
            self.table.remove_rule(forward);
            self.table.remove_rule(reverse);
            self.send_close(from.id(), downstream, "upstream unreachable").await;
            return Err(e);
        }

        debug!(forward = %forward, reverse = %reverse, "Route hop established");
        Ok(())
    }

    async fn handle_setup_reject(&self, from: &Arc<ManagedTransport>, reject: SetupReject) {
        match self.setups.take_answered(reject.request_id, &from.id()) {
            Some(pending) => {
                self.fail_setup(pending, SetupError::Rejected(reject.reason))
                    .await
            },
            None => debug!(request_id = reject.request_id, "Reject for unknown setup"),
        }
    }

    async fn fail_setup(&self, pending: PendingSetup, error: SetupError) {
        self.table.remove_rule(pending.local_rule);
        match pending.upstream {
            Upstream::Local(tx) => {
                let _ = tx.send(Err(error));
            },
            Upstream::Remote {
                transport,
                request_id,
            } => {
                let reject = SetupReject {
                    request_id,
                    reason: setup_reason(&error),
                };
                let sent = match self.manager.transport(&transport) {
                    Some(t) => {
                        self.write_bounded(&t, Packet::control(Control::SetupReject(reject)))
                            .await
                    },
                    None => Err(TransportError::NotFound(transport.to_string()).into()),
                };
                if let Err(e) = sent {
                    debug!(request_id, error = %e, "Reject not relayed upstream");
                }
            },
        }
    }

    // ---- teardown ----

    async fn handle_close_route(&self, from: &Arc<ManagedTransport>, route: RouteId, reason: &str) {
        let Some(rule) = self.table.rule(route) else {
            trace!(route = %route, "Close for unknown route");
            return;
        };
        if !self.close_allowed(&rule, &from.id()) {
            warn!(remote = %from.remote_pk(), route = %route, "Ignoring close from unrelated transport");
            return;
        }
        if self.table.remove_rule(route).is_none() {
            return;
        }

        match rule.action {
            RuleAction::Forward {
                next_transport,
                next_route,
            } => {
                if let Some(paired) = rule.paired {
                    self.table.remove_rule(paired);
                }
                debug!(route = %route, next = %next_route, "Relaying route close");
                self.send_close(next_transport, next_route, reason).await;
            },
            RuleAction::App {
                local_port, remote, ..
            } => {
                self.drop_loop_entry(LoopAddr::new(local_port, remote), route, reason)
                    .await
            },
        }
    }

    // A close must come from the neighbour that knows the route id.
    fn close_allowed(&self, rule: &RoutingRule, from: &TransportId) -> bool {
        match rule.action {
            RuleAction::App { resp_transport, .. } => resp_transport == *from,
            RuleAction::Forward { .. } => match rule.paired.and_then(|p| self.table.rule(p)) {
                Some(paired) => paired.uses_transport(from),
                None => true,
            },
        }
    }

    async fn handle_transport_closed(&self, id: TransportId, remote: PubKey) {
        info!(remote = %remote, id = %id, "Transport closed, purging routes");

        for pending in self.setups.take_by_downstream(&id) {
            let error = SetupError::Unreachable {
                hop: remote.to_string(),
                reason: "transport closed".to_string(),
            };
            self.fail_setup(pending, error).await;
        }

        for (route, rule) in self.table.all_rules() {
            if !rule.uses_transport(&id) || self.table.remove_rule(route).is_none() {
                continue;
            }
            match rule.action {
                RuleAction::Forward { .. } => {
                    let paired = rule.paired.and_then(|p| self.table.remove_rule(p));
                    if let Some(paired) = paired {
                        let (transport, next) = paired.next_hop();
                        self.send_close(transport, next, "transport closed").await;
                    }
                },
                RuleAction::App {
                    local_port, remote, ..
                } => {
                    self.drop_loop_entry(LoopAddr::new(local_port, remote), route, "transport closed")
                        .await
                },
            }
        }
    }

    async fn sweep(&self) {
        for pending in self.setups.take_expired(Instant::now()) {
            self.fail_setup(pending, SetupError::Timeout).await;
        }

        // Paired rules usually expire together; each hop is told once.
        let expired = self.table.sweep_expired();
        let mut handled: HashSet<RouteId> = HashSet::with_capacity(expired.len());
        for (route, rule) in expired {
            if !handled.insert(route) {
                continue;
            }
            debug!(route = %route, "Rule expired");

            let (transport, next) = rule.next_hop();
            self.send_close(transport, next, "route expired").await;

            if let Some(paired) = rule.paired {
                handled.insert(paired);
                if let Some(paired_rule) = self.table.remove_rule(paired) {
                    let (transport, next) = paired_rule.next_hop();
                    self.send_close(transport, next, "route expired").await;
                }
            }

            if let Some(addr) = rule.loop_addr() {
                self.drop_loop_entry(addr, route, "route expired").await;
            }
        }
    }

    // Forget a loop ended from the network side and tell its app.
    async fn drop_loop_entry(&self, addr: LoopAddr, rule: RouteId, reason: &str) {
        if self.loops.remove_if_rule(&addr, rule).is_none() {
            return;
        }
        let sender = self.ports.sender(addr.port);
        self.ports.free_ephemeral(addr.port);
        info!(loop_addr = %addr, reason, "Loop closed");

        if let Some(sender) = sender {
            let closed = app_frame::Body::LoopClosed(LoopClosed {
                loop_ref: Some(addr.into()),
                reason: reason.to_string(),
            });
            if sender
                .send_timeout(closed, self.config.teardown_timeout)
                .await
                .is_err()
            {
                debug!(loop_addr = %addr, "App did not take loop closure");
            }
        }
    }

    async fn send_close(&self, transport: TransportId, route: RouteId, reason: &str) {
        if route.is_none() {
            return;
        }
        let Some(transport) = self.manager.transport(&transport) else {
            debug!(route = %route, "Next hop gone, close not sent");
            return;
        };
        let close = CloseRoute {
            route_id: route.0,
            reason: reason.to_string(),
        };
        if let Err(e) = self
            .write_bounded(&transport, Packet::control(Control::CloseRoute(close)))
            .await
        {
            debug!(route = %route, error = %e, "Close not delivered");
        }
    }

    // ---- app connections ----

    async fn handle_app_frame(
        self: &Arc<Self>,
        port: u16,
        tx: &mpsc::Sender<app_frame::Body>,
        body: app_frame::Body,
    ) {
        match body {
            app_frame::Body::CreateLoop(request) => self.spawn_app_setup(port, tx.clone(), request),
            app_frame::Body::Data(data) => {
                let result = match self.owned_loop(port, &data.loop_ref) {
                    Ok(addr) => self.send_app_data(&addr, data.payload).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    debug!(port, error = %e, "App data not sent");
                }
            },
            app_frame::Body::CloseLoop(close) => {
                let result = match self.owned_loop(port, &close.loop_ref) {
                    Ok(addr) => self.close_loop(&addr).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    debug!(port, error = %e, "App close ignored");
                }
            },
            other => warn!(port, frame = ?other, "Unexpected frame from app"),
        }
    }

    fn spawn_app_setup(
        self: &Arc<Self>,
        port: u16,
        tx: mpsc::Sender<app_frame::Body>,
        request: CreateLoop,
    ) {
        let router = Arc::clone(self);
        self.shutdown.add_task(tokio::spawn(async move {
            let result = match request.remote() {
                Ok(remote) => router.create_loop(port, remote).await,
                Err(e) => Err(e),
            };
            let answer = match result {
                Ok(addr) => app_frame::Body::LoopConfirmed(LoopConfirmed {
                    request_id: request.request_id,
                    loop_ref: Some(addr.into()),
                }),
                Err(e) => app_frame::Body::LoopFailed(LoopFailed {
                    request_id: request.request_id,
                    reason: reject_reason(&e),
                }),
            };
            if tx.send(answer).await.is_err() {
                debug!(port, "App left before its loop answer");
            }
        }));
    }

    fn owned_loop(&self, port: u16, loop_ref: &Option<LoopRef>) -> Result<LoopAddr> {
        let addr = loop_addr_of(loop_ref)?;
        match self.loops.get(&addr) {
            Some(entry) if entry.owner_port == port => Ok(addr),
            _ => Err(RoutingError::LoopNotFound(addr.to_string()).into()),
        }
    }

    // ---- helpers ----

    /// Bounds the wait for room in the transport's send queue
    async fn write_bounded(&self, transport: &Arc<ManagedTransport>, packet: Packet) -> Result<()> {
        match timeout(self.config.teardown_timeout, transport.write_frame(&packet.encode())).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout.into()),
        }
    }

    fn keep_alive_deadline(&self) -> Option<Instant> {
        self.config.rule_keep_alive.map(|ttl| Instant::now() + ttl)
    }

    fn keep_alive(&self, route: RouteId, rule: &RoutingRule) {
        if let Some(ttl) = self.config.rule_keep_alive {
            self.table.touch(route, ttl);
            if let Some(paired) = rule.paired {
                self.table.touch(paired, ttl);
            }
        }
    }
}

fn unreachable_hop(hop: &PubKey, error: MeshwireError) -> SetupError {
    SetupError::Unreachable {
        hop: hop.to_string(),
        reason: error.to_string(),
    }
}

// Reason text relayed upstream; a relayed rejection keeps its original text.
fn setup_reason(error: &SetupError) -> String {
    match error {
        SetupError::Rejected(reason) => reason.clone(),
        other => other.to_string(),
    }
}

fn reject_reason(error: &MeshwireError) -> String {
    match error {
        MeshwireError::Setup(e) => setup_reason(e),
        other => other.to_string(),
    }
}
