//! Server side: the packet router and broadcastable signals.
//!
//! A [`SignalServer`] owns the server transport endpoint and routes every
//! arriving packet to the [`Signal`] or network published under the packet's
//! route. A [`Signal`] fans dispatches out to one, several, or all connected
//! peers and delivers inbound dispatches to its local subscribers.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use beacon_core::{Args, EntityKind, PeerId, Result, SignalError};
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::connection::{Connection, Registry};
use crate::discovery::{Published, Scope};
use crate::entity::{Entity, is_a};
use crate::middleware::{Direction, Middleware, MiddlewareContext, Pipeline, PipelineOutcome};
use crate::transport::{Incoming, Packet, ReplyOutcome, ServerTransport, TransportError};

/// Outcome of a successful fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the transport for this many peers.
    Sent {
        /// Number of peers the packet was sent to.
        recipients: usize,
    },
    /// An outbound stage stopped the dispatch; nothing was sent.
    Vetoed {
        /// Name of the vetoing stage.
        stage: String,
    },
}

impl Delivery {
    /// Number of peers reached (zero when vetoed).
    #[must_use]
    pub fn recipients(&self) -> usize {
        match self {
            Self::Sent { recipients } => *recipients,
            Self::Vetoed { .. } => 0,
        }
    }

    /// Whether middleware vetoed the dispatch.
    #[must_use]
    pub fn is_vetoed(&self) -> bool {
        matches!(self, Self::Vetoed { .. })
    }
}

/// Something that answers network method calls.
pub(crate) trait MethodHost: Send + Sync {
    fn invoke(&self, peer: &PeerId, method: &str, args: Args) -> ReplyOutcome;
}

#[derive(Clone)]
enum Route {
    Signal(Weak<SignalShared>),
    Methods(Weak<dyn MethodHost>),
}

struct ServerInner {
    transport: Arc<dyn ServerTransport>,
    routes: RwLock<HashMap<String, Route>>,
}

impl ServerInner {
    fn receive(&self, peer: &PeerId, incoming: Incoming) {
        let Incoming { seq, packet } = incoming;
        match packet {
            Packet::Dispatch { route, args } => {
                let target = self.routes.read().get(&route).cloned();
                match target.as_ref().and_then(Route::signal) {
                    Some(signal) => signal.receive(peer, seq, args),
                    None => {
                        debug!(%peer, route = %route, seq, "dispatch for unknown route dropped");
                    }
                }
            }
            Packet::Invoke {
                route,
                method,
                call_id,
                args,
            } => {
                let target = self.routes.read().get(&route).cloned();
                let outcome = match target.as_ref().and_then(Route::methods) {
                    Some(host) => host.invoke(peer, &method, args),
                    None => ReplyOutcome::Err {
                        message: format!("no network is dispatched at '{route}'"),
                    },
                };
                self.reply(peer, call_id, outcome);
            }
            Packet::Reply { call_id, .. } => {
                warn!(%peer, call_id, "unexpected reply from peer ignored");
            }
        }
    }

    fn reply(&self, peer: &PeerId, call_id: u64, outcome: ReplyOutcome) {
        let packet = Packet::Reply { call_id, outcome };
        match self.transport.send(peer, &packet) {
            Ok(()) => {}
            Err(TransportError::Rejected(reason)) => {
                warn!(%peer, call_id, reason = %reason, "reply rejected by transport");
                let fallback = Packet::Reply {
                    call_id,
                    outcome: ReplyOutcome::Err {
                        message: format!("reply rejected by transport: {reason}"),
                    },
                };
                if let Err(e) = self.transport.send(peer, &fallback) {
                    debug!(%peer, call_id, error = %e, "fallback reply not delivered");
                }
            }
            Err(e) => debug!(%peer, call_id, error = %e, "reply not delivered"),
        }
    }
}

impl Route {
    fn signal(&self) -> Option<Arc<SignalShared>> {
        match self {
            Self::Signal(weak) => weak.upgrade(),
            Self::Methods(_) => None,
        }
    }

    fn methods(&self) -> Option<Arc<dyn MethodHost>> {
        match self {
            Self::Methods(weak) => weak.upgrade(),
            Self::Signal(_) => None,
        }
    }

    fn is_live(&self) -> bool {
        match self {
            Self::Signal(weak) => weak.strong_count() > 0,
            Self::Methods(weak) => weak.strong_count() > 0,
        }
    }

    fn points_at(&self, owner: *const ()) -> bool {
        match self {
            Self::Signal(weak) => weak.as_ptr().cast::<()>() == owner,
            Self::Methods(weak) => weak.as_ptr().cast::<()>() == owner,
        }
    }
}

/// Server endpoint: routes packets from peers to signals and networks.
///
/// Cheap to clone; clones share the same routing table.
#[derive(Clone)]
pub struct SignalServer {
    inner: Arc<ServerInner>,
}

impl SignalServer {
    /// Take over `transport` and start routing its packets.
    #[must_use]
    pub fn new(transport: Arc<dyn ServerTransport>) -> Self {
        let inner = Arc::new(ServerInner {
            transport,
            routes: RwLock::new(HashMap::new()),
        });
        let weak = Arc::downgrade(&inner);
        inner
            .transport
            .on_receive(Arc::new(move |peer: &PeerId, incoming: Incoming| {
                if let Some(inner) = weak.upgrade() {
                    inner.receive(peer, incoming);
                }
            }));
        debug!("signal server started");
        Self { inner }
    }

    /// Currently connected peers.
    #[must_use]
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.transport.peers()
    }

    /// Whether `peer` is currently connected.
    #[must_use]
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.transport.is_connected(peer)
    }

    pub(crate) fn transport(&self) -> &Arc<dyn ServerTransport> {
        &self.inner.transport
    }

    fn register_signal(&self, route: &str, signal: Weak<SignalShared>) -> Result<()> {
        self.register(route, Route::Signal(signal))
    }

    pub(crate) fn register_methods(&self, route: &str, host: Weak<dyn MethodHost>) -> Result<()> {
        self.register(route, Route::Methods(host))
    }

    fn register(&self, route: &str, target: Route) -> Result<()> {
        let mut routes = self.inner.routes.write();
        if routes.get(route).is_some_and(Route::is_live) {
            debug!(route, "route already taken");
            return Err(SignalError::RouteInUse {
                route: route.to_string(),
            });
        }
        let _ = routes.insert(route.to_string(), target);
        Ok(())
    }

    /// Remove `route` if it still points at `owner`.
    pub(crate) fn unregister(&self, route: &str, owner: *const ()) -> bool {
        let mut routes = self.inner.routes.write();
        if routes.get(route).is_some_and(|r| r.points_at(owner)) {
            let _ = routes.remove(route);
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for SignalServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalServer")
            .field("routes", &self.inner.routes.read().len())
            .finish_non_exhaustive()
    }
}

type InboundEvent = (PeerId, Args);

struct SignalShared {
    name: String,
    route: String,
    scope: Scope,
    server: SignalServer,
    registry: Arc<Registry<InboundEvent>>,
    pipeline: RwLock<Pipeline>,
    destroyed: AtomicBool,
}

impl SignalShared {
    fn receive(&self, peer: &PeerId, seq: u64, args: Args) {
        if self.destroyed.load(Ordering::Acquire) {
            trace!(route = %self.route, %peer, seq, "dispatch for destroyed signal dropped");
            return;
        }
        let pipeline = self.pipeline.read().clone();
        let ctx = MiddlewareContext {
            route: &self.route,
            direction: Direction::Inbound,
            peer: Some(peer),
        };
        match pipeline.run(&ctx, args) {
            PipelineOutcome::Continue(args) => {
                let delivered = self.registry.emit(seq, &(peer.clone(), args));
                trace!(route = %self.route, %peer, seq, delivered, "dispatch delivered");
            }
            PipelineOutcome::Vetoed { stage } => {
                debug!(route = %self.route, %peer, seq, stage = %stage, "inbound dispatch vetoed");
            }
            PipelineOutcome::Failed { stage, message } => {
                warn!(
                    route = %self.route,
                    %peer,
                    seq,
                    stage = %stage,
                    error = %message,
                    "inbound middleware failed, dispatch dropped"
                );
            }
        }
    }

    /// Returns `false` if already shut down.
    fn shutdown(&self) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let connections = self.registry.disconnect_all();
        // Route first: once the name is free a new signal may claim the route.
        let _ = self.server.unregister(&self.route, std::ptr::from_ref(self).cast());
        let _ = self.scope.unpublish(&self.name, &self.route);
        debug!(route = %self.route, connections, "signal destroyed");
        true
    }
}

impl Drop for SignalShared {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Server-side broadcastable signal.
///
/// Cheap to clone; clones refer to the same signal. Dropping the last clone
/// without calling [`destroy`](Self::destroy) still unpublishes the name.
#[derive(Clone)]
pub struct Signal {
    shared: Arc<SignalShared>,
}

impl Signal {
    /// Create a signal and publish it as `name` in `scope`.
    ///
    /// Fails with [`SignalError::DuplicateName`] if `name` is taken there.
    pub fn new(server: &SignalServer, name: impl Into<String>, scope: &Scope) -> Result<Self> {
        let name = name.into();
        let route = scope.route_for(&name);
        scope.publish(&name, Published::signal(route.clone()))?;
        let shared = Arc::new(SignalShared {
            name,
            route,
            scope: scope.clone(),
            server: server.clone(),
            registry: Registry::new(),
            pipeline: RwLock::new(Pipeline::new()),
            destroyed: AtomicBool::new(false),
        });
        // On failure, dropping `shared` unpublishes the name again.
        server.register_signal(&shared.route, Arc::downgrade(&shared))?;
        debug!(route = %shared.route, "signal created");
        Ok(Self { shared })
    }

    /// Name the signal was published under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Route clients address this signal by.
    #[must_use]
    pub fn route(&self) -> &str {
        &self.shared.route
    }

    /// Whether [`destroy`](Self::destroy) has been called.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::Acquire)
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Run `callback` for every dispatch any peer sends to this signal, after
    /// inbound middleware approves it.
    pub fn connect<F>(&self, callback: F) -> Result<Connection>
    where
        F: Fn(&PeerId, &Args) + Send + Sync + 'static,
    {
        self.subscribe(callback, false)
    }

    /// Like [`connect`](Self::connect), but disconnects after the first
    /// delivery.
    pub fn connect_once<F>(&self, callback: F) -> Result<Connection>
    where
        F: Fn(&PeerId, &Args) + Send + Sync + 'static,
    {
        self.subscribe(callback, true)
    }

    fn subscribe<F>(&self, callback: F, once: bool) -> Result<Connection>
    where
        F: Fn(&PeerId, &Args) + Send + Sync + 'static,
    {
        self.ensure_live()?;
        let since = self.shared.server.transport().arrival_mark();
        Ok(self.shared.registry.connect(
            Arc::new(move |(peer, args): &InboundEvent| callback(peer, args)),
            once,
            since,
        ))
    }

    /// Append a middleware stage. Its direction decides which chain it joins.
    pub fn use_middleware<M: Middleware + 'static>(&self, stage: M) -> Result<()> {
        self.ensure_live()?;
        debug!(
            route = %self.shared.route,
            stage = stage.name(),
            direction = %stage.direction(),
            "middleware added"
        );
        self.shared.pipeline.write().add(Arc::new(stage));
        Ok(())
    }

    /// Send `args` to one peer. A peer that is not connected is skipped.
    pub fn fire_for_player(&self, peer: &PeerId, args: Args) -> Result<Delivery> {
        self.fire_to(vec![peer.clone()], Some(peer), args)
    }

    /// Send `args` to each listed peer once. Peers that are not connected
    /// are skipped.
    pub fn fire_for_players(&self, peers: &[PeerId], args: Args) -> Result<Delivery> {
        let mut seen = HashSet::new();
        let targets: Vec<PeerId> = peers.iter().filter(|p| seen.insert(*p)).cloned().collect();
        self.fire_to(targets, None, args)
    }

    /// Send `args` to every connected peer.
    pub fn fire_for_all(&self, args: Args) -> Result<Delivery> {
        self.ensure_live()?;
        let targets = self.shared.server.peers();
        self.fire_to(targets, None, args)
    }

    /// Send `args` to every connected peer not in `excluded`.
    pub fn fire_for_all_except(&self, excluded: &[PeerId], args: Args) -> Result<Delivery> {
        self.ensure_live()?;
        let targets: Vec<PeerId> = self
            .shared
            .server
            .peers()
            .into_iter()
            .filter(|p| !excluded.contains(p))
            .collect();
        self.fire_to(targets, None, args)
    }

    fn fire_to(
        &self,
        targets: Vec<PeerId>,
        single: Option<&PeerId>,
        args: Args,
    ) -> Result<Delivery> {
        self.ensure_live()?;
        let shared = &self.shared;
        let pipeline = shared.pipeline.read().clone();
        let ctx = MiddlewareContext {
            route: &shared.route,
            direction: Direction::Outbound,
            peer: single,
        };
        let args = match pipeline.run(&ctx, args) {
            PipelineOutcome::Continue(args) => args,
            PipelineOutcome::Vetoed { stage } => {
                debug!(route = %shared.route, stage = %stage, "outbound dispatch vetoed");
                return Ok(Delivery::Vetoed { stage });
            }
            PipelineOutcome::Failed { stage, message } => {
                return Err(SignalError::Middleware { stage, message });
            }
        };

        let packet = Packet::Dispatch {
            route: shared.route.clone(),
            args,
        };
        let transport = shared.server.transport();
        transport.validate(&packet)?;

        let mut recipients = 0;
        for peer in &targets {
            match transport.send(peer, &packet) {
                Ok(()) => recipients += 1,
                Err(TransportError::Rejected(reason)) => {
                    return Err(SignalError::TransportRejected { reason });
                }
                Err(e) => trace!(route = %shared.route, %peer, error = %e, "peer skipped"),
            }
        }
        debug!(route = %shared.route, targets = targets.len(), recipients, "fired");
        Ok(Delivery::Sent { recipients })
    }

    /// Disconnect every subscription. The signal stays usable.
    pub fn disconnect_all(&self) -> Result<()> {
        self.ensure_live()?;
        let connections = self.shared.registry.disconnect_all();
        debug!(route = %self.shared.route, connections, "disconnected all");
        Ok(())
    }

    /// Disconnect everything, unpublish the name, and reject later calls.
    /// Idempotent.
    pub fn destroy(&self) {
        let _ = self.shared.shutdown();
    }

    /// Whether `value` is a [`Signal`].
    #[must_use]
    pub fn is_a(value: &dyn Any) -> bool {
        is_a::<Self>(value)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(SignalError::disposed(EntityKind::Signal));
        }
        Ok(())
    }
}

impl Entity for Signal {
    const KIND: EntityKind = EntityKind::Signal;
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("route", &self.shared.route)
            .field("connections", &self.connection_count())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{FnMiddleware, MiddlewareError, Verdict};
    use crate::transport::{ClientTransport, MemoryClientTransport, MemoryNetwork, TransportLimits};
    use assert_matches::assert_matches;
    use beacon_core::args;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Harness {
        net: MemoryNetwork,
        server: SignalServer,
        scope: Scope,
    }

    fn harness() -> Harness {
        let net = MemoryNetwork::new();
        let server = SignalServer::new(net.server());
        Harness {
            net,
            server,
            scope: Scope::root(),
        }
    }

    type Inbox = Arc<Mutex<Vec<Packet>>>;

    fn listen(client: &MemoryClientTransport) -> Inbox {
        let inbox: Inbox = Arc::default();
        let sink = Arc::clone(&inbox);
        client.on_receive(Arc::new(move |incoming: Incoming| {
            sink.lock().push(incoming.packet);
        }));
        inbox
    }

    fn dispatched(inbox: &Inbox) -> Vec<Args> {
        inbox
            .lock()
            .iter()
            .filter_map(|p| match p {
                Packet::Dispatch { args, .. } => Some(args.clone()),
                _ => None,
            })
            .collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn new_publishes_route() {
        let h = harness();
        let signal = Signal::new(&h.server, "Damage", &h.scope).unwrap();
        assert_eq!(signal.name(), "Damage");
        assert_eq!(signal.route(), "/Damage");
        assert_eq!(h.scope.resolve("Damage"), Some(Published::signal("/Damage")));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_name_is_rejected() {
        let h = harness();
        let _first = Signal::new(&h.server, "Damage", &h.scope).unwrap();
        let err = Signal::new(&h.server, "Damage", &h.scope).unwrap_err();
        assert_matches!(err, SignalError::DuplicateName { ref name, .. } if name == "Damage");
    }

    fn count_inbound(signal: &Signal) -> (Arc<Mutex<usize>>, Connection) {
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        let conn = signal
            .connect(move |_peer: &PeerId, _args: &Args| *sink.lock() += 1)
            .unwrap();
        (count, conn)
    }

    #[tokio::test(start_paused = true)]
    async fn slashed_name_cannot_shadow_a_nested_signal() {
        let h = harness();
        let nested = Signal::new(&h.server, "b", &h.scope.child("a").unwrap()).unwrap();
        assert_eq!(nested.route(), "/a/b");
        let err = Signal::new(&h.server, "a/b", &h.scope).unwrap_err();
        assert_matches!(err, SignalError::InvalidName { ref name, .. } if name == "a/b");
        assert_matches!(
            Signal::new(&h.server, "", &h.scope),
            Err(SignalError::InvalidName { .. })
        );
        assert!(h.scope.resolve("a/b").is_none());

        let (count, _conn) = count_inbound(&nested);
        let peer = h.net.connect();
        let packet = Packet::Dispatch {
            route: "/a/b".into(),
            args: args![1],
        };
        peer.send(&packet).unwrap();
        settle().await;
        assert_eq!(*count.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn occupied_route_is_refused_and_left_with_its_owner() {
        let h = harness();
        let other = Scope::root();
        let first = Signal::new(&h.server, "Score", &h.scope).unwrap();
        let (count, _conn) = count_inbound(&first);

        let err = Signal::new(&h.server, "Score", &other).unwrap_err();
        assert_matches!(err, SignalError::RouteInUse { ref route } if route == "/Score");
        assert!(other.resolve("Score").is_none());

        let peer = h.net.connect();
        let packet = Packet::Dispatch {
            route: "/Score".into(),
            args: args![1],
        };
        peer.send(&packet).unwrap();
        settle().await;
        assert_eq!(*count.lock(), 1);

        first.destroy();
        let second = Signal::new(&h.server, "Score", &other).unwrap();
        let (second_count, _conn2) = count_inbound(&second);
        peer.send(&packet).unwrap();
        settle().await;
        assert_eq!(*count.lock(), 1);
        assert_eq!(*second_count.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unregister_ignores_a_route_owned_by_someone_else() {
        let h = harness();
        let signal = Signal::new(&h.server, "Score", &h.scope).unwrap();
        let stranger = 0_u8;
        assert!(!h.server.unregister("/Score", std::ptr::from_ref(&stranger).cast()));
        assert!(h.server.inner.routes.read().contains_key("/Score"));
        assert!(h.server.unregister("/Score", Arc::as_ptr(&signal.shared).cast()));
        assert!(!h.server.inner.routes.read().contains_key("/Score"));
    }

    #[tokio::test(start_paused = true)]
    async fn fire_for_players_reaches_only_listed_peers() {
        let h = harness();
        let signal = Signal::new(&h.server, "Round", &h.scope).unwrap();
        let (p1, p2, p3) = (h.net.connect(), h.net.connect(), h.net.connect());
        let (i1, i2, i3) = (listen(&p1), listen(&p2), listen(&p3));

        let delivery = signal
            .fire_for_players(
                &[p1.local_peer().clone(), p3.local_peer().clone(), p1.local_peer().clone()],
                args!["x"],
            )
            .unwrap();
        settle().await;

        assert_eq!(delivery, Delivery::Sent { recipients: 2 });
        assert_eq!(dispatched(&i1), vec![args!["x"]]);
        assert!(dispatched(&i2).is_empty());
        assert_eq!(dispatched(&i3), vec![args!["x"]]);
    }

    #[tokio::test(start_paused = true)]
    async fn fire_for_all_except_skips_excluded() {
        let h = harness();
        let signal = Signal::new(&h.server, "Chat", &h.scope).unwrap();
        let (a, b) = (h.net.connect(), h.net.connect());
        let (ia, ib) = (listen(&a), listen(&b));

        let delivery = signal
            .fire_for_all_except(&[a.local_peer().clone()], args!["hello"])
            .unwrap();
        settle().await;

        assert_eq!(delivery.recipients(), 1);
        assert!(dispatched(&ia).is_empty());
        assert_eq!(dispatched(&ib), vec![args!["hello"]]);
    }

    #[tokio::test(start_paused = true)]
    async fn fire_for_disconnected_player_is_silently_skipped() {
        let h = harness();
        let signal = Signal::new(&h.server, "Chat", &h.scope).unwrap();
        let gone = h.net.connect();
        assert!(h.net.disconnect(gone.local_peer()));

        let delivery = signal.fire_for_player(gone.local_peer(), args![1]).unwrap();
        assert_eq!(delivery, Delivery::Sent { recipients: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_dispatch_reaches_subscribers_with_sender() {
        let h = harness();
        let signal = Signal::new(&h.server, "Jump", &h.scope).unwrap();
        let seen: Arc<Mutex<Vec<(PeerId, Args)>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let _conn = signal
            .connect(move |peer, args| sink.lock().push((peer.clone(), args.clone())))
            .unwrap();

        let client = h.net.connect();
        client
            .send(&Packet::Dispatch {
                route: "/Jump".into(),
                args: args![2.5],
            })
            .unwrap();
        settle().await;

        assert_eq!(*seen.lock(), vec![(client.local_peer().clone(), args![2.5])]);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_middleware_veto_skips_subscribers() {
        let h = harness();
        let signal = Signal::new(&h.server, "Jump", &h.scope).unwrap();
        signal
            .use_middleware(FnMiddleware::inbound(
                "no-spam",
                |_ctx: &MiddlewareContext<'_>, args: Args| {
                    if args.first_str() == Some("spam") {
                        Ok(Verdict::Stop)
                    } else {
                        Ok(Verdict::Continue(args))
                    }
                },
            ))
            .unwrap();
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        let _conn = signal.connect(move |_, _| *sink.lock() += 1).unwrap();

        let client = h.net.connect();
        for first in ["spam", "ham"] {
            client
                .send(&Packet::Dispatch {
                    route: "/Jump".into(),
                    args: args![first],
                })
                .unwrap();
        }
        settle().await;
        assert_eq!(*count.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_veto_sends_nothing() {
        let h = harness();
        let signal = Signal::new(&h.server, "Chat", &h.scope).unwrap();
        signal
            .use_middleware(FnMiddleware::outbound(
                "mute",
                |_ctx: &MiddlewareContext<'_>, _args: Args| Ok(Verdict::Stop),
            ))
            .unwrap();
        let client = h.net.connect();
        let inbox = listen(&client);

        let delivery = signal.fire_for_all(args!["hi"]).unwrap();
        settle().await;

        assert_eq!(delivery, Delivery::Vetoed { stage: "mute".into() });
        assert!(delivery.is_vetoed());
        assert!(inbox.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_failure_is_surfaced_to_caller() {
        let h = harness();
        let signal = Signal::new(&h.server, "Chat", &h.scope).unwrap();
        signal
            .use_middleware(FnMiddleware::outbound(
                "auth",
                |_ctx: &MiddlewareContext<'_>, _args: Args| Err(MiddlewareError::new("denied")),
            ))
            .unwrap();
        let _client = h.net.connect();

        let err = signal.fire_for_all(args![]).unwrap_err();
        assert_matches!(err, SignalError::Middleware { ref stage, ref message } if stage == "auth" && message == "denied");
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_middleware_sees_single_target() {
        let h = harness();
        let signal = Signal::new(&h.server, "Whisper", &h.scope).unwrap();
        signal
            .use_middleware(FnMiddleware::outbound(
                "address",
                |ctx: &MiddlewareContext<'_>, mut args: Args| {
                    args.push(ctx.peer.map(PeerId::to_string));
                    Ok(Verdict::Continue(args))
                },
            ))
            .unwrap();
        let client = h.net.connect();
        let inbox = listen(&client);

        let _ = signal.fire_for_player(client.local_peer(), args!["psst"]).unwrap();
        settle().await;
        assert_eq!(
            dispatched(&inbox),
            vec![args!["psst", (client.local_peer().to_string())]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_payload_is_rejected() {
        let net = MemoryNetwork::with_limits(TransportLimits {
            max_payload_bytes: 128,
            max_args: 4,
        });
        let server = SignalServer::new(net.server());
        let scope = Scope::root();
        let signal = Signal::new(&server, "Big", &scope).unwrap();

        let err = signal.fire_for_all(args![("z".repeat(500))]).unwrap_err();
        assert_matches!(err, SignalError::TransportRejected { .. });
        let err = signal.fire_for_all(args![1, 2, 3, 4, 5]).unwrap_err();
        assert_matches!(err, SignalError::TransportRejected { .. });
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_rejects_later_calls_and_is_idempotent() {
        let h = harness();
        let signal = Signal::new(&h.server, "Damage", &h.scope).unwrap();
        let conn = signal.connect(|_, _| {}).unwrap();

        signal.destroy();
        signal.destroy();

        assert!(signal.is_destroyed());
        assert!(!conn.connected());
        conn.disconnect();
        assert!(h.scope.resolve("Damage").is_none());
        assert!(signal.fire_for_all(args![]).unwrap_err().is_disposed());
        assert!(signal.connect(|_, _| {}).unwrap_err().is_disposed());
        assert!(signal.disconnect_all().unwrap_err().is_disposed());
        assert!(signal
            .use_middleware(FnMiddleware::inbound(
                "late",
                |_ctx: &MiddlewareContext<'_>, args: Args| Ok(Verdict::Continue(args))
            ))
            .unwrap_err()
            .is_disposed());

        // The name is free again.
        let _again = Signal::new(&h.server, "Damage", &h.scope).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_all_keeps_signal_usable() {
        let h = harness();
        let signal = Signal::new(&h.server, "Damage", &h.scope).unwrap();
        let a = signal.connect(|_, _| {}).unwrap();
        let b = signal.connect_once(|_, _| {}).unwrap();
        assert_eq!(signal.connection_count(), 2);

        signal.disconnect_all().unwrap();
        assert!(!a.connected());
        assert!(!b.connected());
        assert_eq!(signal.connection_count(), 0);

        let c = signal.connect(|_, _| {}).unwrap();
        assert!(c.connected());
        assert_eq!(signal.connection_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_last_clone_unpublishes() {
        let h = harness();
        let signal = Signal::new(&h.server, "Temp", &h.scope).unwrap();
        let clone = signal.clone();
        drop(signal);
        assert!(h.scope.resolve("Temp").is_some());
        drop(clone);
        assert!(h.scope.resolve("Temp").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn invoke_on_unknown_route_gets_error_reply() {
        let h = harness();
        let client = h.net.connect();
        let inbox = listen(&client);
        client
            .send(&Packet::Invoke {
                route: "/Nowhere".into(),
                method: "ping".into(),
                call_id: 9,
                args: args![],
            })
            .unwrap();
        settle().await;

        let packets = inbox.lock();
        assert_matches!(
            packets.as_slice(),
            [Packet::Reply { call_id: 9, outcome: ReplyOutcome::Err { .. } }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn is_a_discriminates_by_type() {
        let h = harness();
        let signal = Signal::new(&h.server, "Damage", &h.scope).unwrap();
        let conn = signal.connect(|_, _| {}).unwrap();
        assert!(Signal::is_a(&signal));
        assert!(!Signal::is_a(&conn));
        assert_eq!(signal.kind(), EntityKind::Signal);
        assert_eq!(crate::entity::kind_of(&conn), Some(EntityKind::Connection));
    }
}
