//! Client side: the peer endpoint and signals bound to remote ones.
//!
//! A [`SignalClient`] owns one client transport endpoint. Each
//! [`ClientSignal`] is bound once, by name, to a signal the server published
//! in a discovery [`Scope`]. Dispatches the server sent before a subscription
//! existed are never replayed to it: every subscription and every `wait`
//! records the endpoint's arrival mark and ignores anything at or below it.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use beacon_core::{Args, EntityKind, PeerId, Result, SignalError};
use beacon_settings::{BeaconSettings, get_settings};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::connection::{Connection, Registry};
use crate::discovery::{Published, Scope};
use crate::entity::{Entity, is_a};
use crate::middleware::{Direction, Middleware, MiddlewareContext, Pipeline, PipelineOutcome};
use crate::server::Delivery;
use crate::transport::{ClientTransport, Incoming, Packet, ReplyOutcome};

/// Timeouts a client applies to its suspension points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// How long `from_parent` waits for a name to be published.
    pub discovery_timeout: Duration,
    /// How long a network method call waits for its reply.
    pub call_timeout: Duration,
}

impl ClientOptions {
    /// Build options from loaded settings.
    #[must_use]
    pub fn from_settings(settings: &BeaconSettings) -> Self {
        Self {
            discovery_timeout: settings.discovery.timeout(),
            call_timeout: settings.network.call_timeout(),
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from_settings(&BeaconSettings::default())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Default)]
struct PendingCalls {
    next_id: u64,
    waiting: HashMap<u64, oneshot::Sender<ReplyOutcome>>,
}

struct PendingCall<'a> {
    calls: &'a Mutex<PendingCalls>,
    call_id: u64,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        let _ = self.calls.lock().waiting.remove(&self.call_id);
    }
}

struct ClientInner {
    transport: Arc<dyn ClientTransport>,
    options: ClientOptions,
    routes: RwLock<HashMap<String, Vec<Weak<ClientSignalShared>>>>,
    calls: Mutex<PendingCalls>,
}

impl ClientInner {
    fn receive(&self, incoming: Incoming) {
        let Incoming { seq, packet } = incoming;
        match packet {
            Packet::Dispatch { route, args } => {
                let targets: Vec<Arc<ClientSignalShared>> = self
                    .routes
                    .read()
                    .get(&route)
                    .map(|bound| bound.iter().filter_map(Weak::upgrade).collect())
                    .unwrap_or_default();
                if targets.is_empty() {
                    trace!(route = %route, seq, "dispatch with no bound client signal dropped");
                }
                for target in targets {
                    target.receive(seq, args.clone());
                }
            }
            Packet::Reply { call_id, outcome } => {
                let waiter = self.calls.lock().waiting.remove(&call_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(outcome);
                    }
                    None => debug!(call_id, "reply for unknown or expired call dropped"),
                }
            }
            Packet::Invoke { call_id, .. } => {
                warn!(call_id, "unexpected invoke from server ignored");
            }
        }
    }
}

/// Peer endpoint: routes packets from the server to bound client signals.
///
/// Cheap to clone; clones share the same endpoint.
#[derive(Clone)]
pub struct SignalClient {
    inner: Arc<ClientInner>,
}

impl SignalClient {
    /// Take over `transport` with options from the global settings.
    #[must_use]
    pub fn new(transport: Arc<dyn ClientTransport>) -> Self {
        Self::with_options(transport, ClientOptions::from_settings(get_settings()))
    }

    /// Take over `transport` with explicit options.
    #[must_use]
    pub fn with_options(transport: Arc<dyn ClientTransport>, options: ClientOptions) -> Self {
        let inner = Arc::new(ClientInner {
            transport,
            options,
            routes: RwLock::new(HashMap::new()),
            calls: Mutex::new(PendingCalls::default()),
        });
        let weak = Arc::downgrade(&inner);
        inner.transport.on_receive(Arc::new(move |incoming: Incoming| {
            if let Some(inner) = weak.upgrade() {
                inner.receive(incoming);
            }
        }));
        debug!(peer = %inner.transport.local_peer(), "signal client started");
        Self { inner }
    }

    /// Identity of this client as the server sees it.
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        self.inner.transport.local_peer()
    }

    /// Timeouts in effect.
    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    fn register(&self, route: &str, signal: Weak<ClientSignalShared>) {
        let mut routes = self.inner.routes.write();
        let bound = routes.entry(route.to_string()).or_default();
        bound.retain(|w| w.strong_count() > 0);
        bound.push(signal);
    }

    fn unregister(&self, route: &str, signal: *const ClientSignalShared) {
        let mut routes = self.inner.routes.write();
        if let Some(bound) = routes.get_mut(route) {
            bound.retain(|w| w.strong_count() > 0 && !std::ptr::eq(w.as_ptr(), signal));
            if bound.is_empty() {
                let _ = routes.remove(route);
            }
        }
    }

    /// Call `method` on the network at `route` and wait for the reply.
    pub(crate) async fn invoke(&self, route: &str, method: &str, args: Args) -> Result<Args> {
        let (call_id, rx) = {
            let mut calls = self.inner.calls.lock();
            calls.next_id += 1;
            let call_id = calls.next_id;
            let (tx, rx) = oneshot::channel();
            let _ = calls.waiting.insert(call_id, tx);
            (call_id, rx)
        };
        // Removes the entry however this future ends, including when dropped.
        let _pending = PendingCall {
            calls: &self.inner.calls,
            call_id,
        };
        let packet = Packet::Invoke {
            route: route.to_string(),
            method: method.to_string(),
            call_id,
            args,
        };
        self.inner.transport.send(&packet)?;
        trace!(route, method, call_id, "invoked");

        let timeout = self.inner.options.call_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ReplyOutcome::Ok { args })) => Ok(args),
            Ok(Ok(ReplyOutcome::Err { message })) => Err(SignalError::Remote {
                method: method.to_string(),
                message,
            }),
            Ok(Err(_)) => Err(SignalError::TransportClosed),
            Err(_) => {
                debug!(route, method, call_id, "call timed out");
                Err(SignalError::CallTimeout {
                    method: method.to_string(),
                    timeout_ms: millis(timeout),
                })
            }
        }
    }
}

impl std::fmt::Debug for SignalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalClient")
            .field("peer", self.peer_id())
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

struct Waiter {
    since: u64,
    tx: oneshot::Sender<Args>,
}

struct ClientSignalShared {
    name: String,
    route: String,
    client: SignalClient,
    registry: Arc<Registry<Args>>,
    pipeline: RwLock<Pipeline>,
    waiters: Mutex<Vec<Waiter>>,
    destroyed: AtomicBool,
}

impl ClientSignalShared {
    fn receive(&self, seq: u64, args: Args) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        let pipeline = self.pipeline.read().clone();
        let ctx = MiddlewareContext {
            route: &self.route,
            direction: Direction::Inbound,
            peer: None,
        };
        let args = match pipeline.run(&ctx, args) {
            PipelineOutcome::Continue(args) => args,
            PipelineOutcome::Vetoed { stage } => {
                debug!(route = %self.route, seq, stage = %stage, "inbound dispatch vetoed");
                return;
            }
            PipelineOutcome::Failed { stage, message } => {
                warn!(
                    route = %self.route,
                    seq,
                    stage = %stage,
                    error = %message,
                    "inbound middleware failed, dispatch dropped"
                );
                return;
            }
        };

        let delivered = self.registry.emit(seq, &args);
        let ready: Vec<Waiter> = {
            let mut waiters = self.waiters.lock();
            let (ready, pending) = std::mem::take(&mut *waiters)
                .into_iter()
                .partition(|w| seq > w.since);
            *waiters = pending;
            ready
        };
        let woken = ready.len();
        for waiter in ready {
            let _ = waiter.tx.send(args.clone());
        }
        trace!(route = %self.route, seq, delivered, woken, "dispatch delivered");
    }

    fn shutdown(&self) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let connections = self.registry.disconnect_all();
        // Dropping the senders wakes pending waits with `Disposed`.
        self.waiters.lock().clear();
        self.client.unregister(&self.route, self);
        debug!(route = %self.route, connections, "client signal destroyed");
        true
    }
}

impl Drop for ClientSignalShared {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Client-side subscriber bound to one remote [`Signal`](crate::Signal).
///
/// Cheap to clone; clones refer to the same binding.
#[derive(Clone)]
pub struct ClientSignal {
    shared: Arc<ClientSignalShared>,
}

impl ClientSignal {
    /// Resolve `name` in `scope`, waiting up to the client's discovery
    /// timeout for it to be published.
    pub async fn from_parent(client: &SignalClient, name: &str, scope: &Scope) -> Result<Self> {
        Self::from_parent_timeout(client, name, scope, client.options().discovery_timeout).await
    }

    /// Resolve `name` in `scope`, waiting up to `timeout`. Fails with
    /// [`SignalError::NotFound`] when the timeout elapses.
    pub async fn from_parent_timeout(
        client: &SignalClient,
        name: &str,
        scope: &Scope,
        timeout: Duration,
    ) -> Result<Self> {
        let entry = scope.wait_for(name, timeout).await?;
        Self::bind(client, name, entry)
    }

    /// Resolve `name` in `scope` without waiting.
    pub fn expect(client: &SignalClient, name: &str, scope: &Scope) -> Result<Self> {
        let entry = scope.resolve(name).ok_or_else(|| SignalError::NotFound {
            name: name.to_string(),
            scope: scope.path().to_string(),
        })?;
        Self::bind(client, name, entry)
    }

    fn bind(client: &SignalClient, name: &str, entry: Published) -> Result<Self> {
        if entry.kind != EntityKind::Signal {
            return Err(SignalError::KindMismatch {
                name: name.to_string(),
                expected: EntityKind::Signal,
                found: entry.kind,
            });
        }
        let shared = Arc::new(ClientSignalShared {
            name: name.to_string(),
            route: entry.route,
            client: client.clone(),
            registry: Registry::new(),
            pipeline: RwLock::new(Pipeline::new()),
            waiters: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        });
        client.register(&shared.route, Arc::downgrade(&shared));
        debug!(route = %shared.route, peer = %client.peer_id(), "client signal bound");
        Ok(Self { shared })
    }

    /// Name the remote signal was resolved by.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Route of the remote signal.
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

    /// Run `callback` for every dispatch the server sends after this call.
    pub fn connect<F>(&self, callback: F) -> Result<Connection>
    where
        F: Fn(&Args) + Send + Sync + 'static,
    {
        self.subscribe(callback, false)
    }

    /// Like [`connect`](Self::connect), but disconnects after the first
    /// delivery.
    pub fn connect_once<F>(&self, callback: F) -> Result<Connection>
    where
        F: Fn(&Args) + Send + Sync + 'static,
    {
        self.subscribe(callback, true)
    }

    fn subscribe<F>(&self, callback: F, once: bool) -> Result<Connection>
    where
        F: Fn(&Args) + Send + Sync + 'static,
    {
        self.ensure_live()?;
        let since = self.shared.client.inner.transport.arrival_mark();
        Ok(self.shared.registry.connect(Arc::new(callback), once, since))
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

    /// Send `args` to the server-side signal.
    pub fn fire(&self, args: Args) -> Result<Delivery> {
        self.ensure_live()?;
        let pipeline = self.shared.pipeline.read().clone();
        let ctx = MiddlewareContext {
            route: &self.shared.route,
            direction: Direction::Outbound,
            peer: None,
        };
        let args = match pipeline.run(&ctx, args) {
            PipelineOutcome::Continue(args) => args,
            PipelineOutcome::Vetoed { stage } => {
                debug!(route = %self.shared.route, stage = %stage, "outbound dispatch vetoed");
                return Ok(Delivery::Vetoed { stage });
            }
            PipelineOutcome::Failed { stage, message } => {
                return Err(SignalError::Middleware { stage, message });
            }
        };
        let packet = Packet::Dispatch {
            route: self.shared.route.clone(),
            args,
        };
        self.shared.client.inner.transport.send(&packet)?;
        trace!(route = %self.shared.route, "fired to server");
        Ok(Delivery::Sent { recipients: 1 })
    }

    /// Suspend until the next dispatch arrives and return its arguments.
    ///
    /// Shares the dispatch with `connect` subscribers rather than consuming
    /// it. Fails with [`SignalError::Disposed`] if the signal is destroyed
    /// while waiting.
    pub async fn wait(&self) -> Result<Args> {
        self.ensure_live()?;
        let (tx, rx) = oneshot::channel();
        {
            let since = self.shared.client.inner.transport.arrival_mark();
            let mut waiters = self.shared.waiters.lock();
            // `shutdown` clears the list under this lock after setting the flag.
            self.ensure_live()?;
            waiters.retain(|w| !w.tx.is_closed());
            waiters.push(Waiter { since, tx });
        }
        rx.await
            .map_err(|_| SignalError::disposed(EntityKind::ClientSignal))
    }

    /// [`wait`](Self::wait) bounded by `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<Args> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| SignalError::WaitTimeout {
                route: self.shared.route.clone(),
                timeout_ms: millis(timeout),
            })?
    }

    /// Disconnect every subscription. The signal stays usable.
    pub fn disconnect_all(&self) -> Result<()> {
        self.ensure_live()?;
        let connections = self.shared.registry.disconnect_all();
        debug!(route = %self.shared.route, connections, "disconnected all");
        Ok(())
    }

    /// Disconnect everything, fail pending waits, and reject later calls.
    /// Idempotent.
    pub fn destroy(&self) {
        let _ = self.shared.shutdown();
    }

    /// Whether `value` is a [`ClientSignal`].
    #[must_use]
    pub fn is_a(value: &dyn Any) -> bool {
        is_a::<Self>(value)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(SignalError::disposed(EntityKind::ClientSignal));
        }
        Ok(())
    }
}

impl Entity for ClientSignal {
    const KIND: EntityKind = EntityKind::ClientSignal;
}

impl std::fmt::Debug for ClientSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSignal")
            .field("route", &self.shared.route)
            .field("connections", &self.connection_count())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
