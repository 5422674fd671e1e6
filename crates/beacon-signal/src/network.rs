//! Networks: named bundles of values, methods and signals.
//!
//! A [`NetworkServer`] collects entries under string keys and then
//! dispatches them as a whole into a parent [`Scope`]. Its signals live in
//! the child scope named after the network. A [`NetworkClient`] resolves the
//! published [`Manifest`], binds a [`ClientSignal`] for every signal, and
//! calls methods with request/reply packets.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use beacon_core::{Args, EntityKind, PeerId, Result, SignalError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::client::{ClientSignal, SignalClient};
use crate::discovery::{Published, Scope};
use crate::entity::{Entity, is_a};
use crate::isolate::isolate;
use crate::server::{MethodHost, Signal, SignalServer};
use crate::transport::ReplyOutcome;

/// What a dispatched network publishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Manifest {
    /// Replicated constants.
    pub values: BTreeMap<String, Value>,
    /// Callable method names, sorted.
    pub methods: Vec<String>,
    /// Signal key to route.
    pub signals: BTreeMap<String, String>,
}

/// Server-side handler for a network method.
pub type MethodHandler =
    Arc<dyn Fn(&PeerId, Args) -> std::result::Result<Args, String> + Send + Sync>;

#[derive(Default)]
struct NetworkState {
    values: BTreeMap<String, Value>,
    methods: BTreeMap<String, MethodHandler>,
    signals: BTreeMap<String, Signal>,
    dispatched: bool,
}

impl NetworkState {
    fn has_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
            || self.methods.contains_key(key)
            || self.signals.contains_key(key)
    }

    fn manifest(&self) -> Manifest {
        Manifest {
            values: self.values.clone(),
            methods: self.methods.keys().cloned().collect(),
            signals: self
                .signals
                .iter()
                .map(|(key, signal)| (key.clone(), signal.route().to_string()))
                .collect(),
        }
    }
}

struct NetworkShared {
    name: String,
    route: String,
    scope: Scope,
    members: Scope,
    server: SignalServer,
    state: Mutex<NetworkState>,
    destroyed: AtomicBool,
}

impl NetworkShared {
    fn shutdown(&self) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let (signals, dispatched) = {
            let mut state = self.state.lock();
            state.methods.clear();
            (std::mem::take(&mut state.signals), state.dispatched)
        };
        for signal in signals.values() {
            signal.destroy();
        }
        // Never dispatched means the name and route may belong to someone else.
        if dispatched {
            let _ = self.server.unregister(&self.route, std::ptr::from_ref(self).cast());
            let _ = self.scope.unpublish(&self.name, &self.route);
        }
        debug!(route = %self.route, signals = signals.len(), dispatched, "network destroyed");
        true
    }
}

impl MethodHost for NetworkShared {
    fn invoke(&self, peer: &PeerId, method: &str, args: Args) -> ReplyOutcome {
        if self.destroyed.load(Ordering::Acquire) {
            return ReplyOutcome::Err {
                message: format!("network '{}' is destroyed", self.name),
            };
        }
        let handler = self.state.lock().methods.get(method).cloned();
        let Some(handler) = handler else {
            debug!(route = %self.route, %peer, method, "unknown method");
            return ReplyOutcome::Err {
                message: format!("unknown method '{method}'"),
            };
        };
        match isolate(|| handler(peer, args)) {
            Ok(Ok(args)) => {
                trace!(route = %self.route, %peer, method, "method returned");
                ReplyOutcome::Ok { args }
            }
            Ok(Err(message)) => ReplyOutcome::Err { message },
            Err(panic) => {
                warn!(route = %self.route, %peer, method, panic = %panic, "method handler panicked");
                ReplyOutcome::Err {
                    message: format!("method panicked: {panic}"),
                }
            }
        }
    }
}

impl Drop for NetworkShared {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Server half of a network.
///
/// Cheap to clone; clones refer to the same network.
#[derive(Clone)]
pub struct NetworkServer {
    shared: Arc<NetworkShared>,
}

impl NetworkServer {
    /// Create an empty network that will be published as `name` in `scope`.
    ///
    /// Fails with [`SignalError::InvalidName`] if `name` is empty or
    /// contains `/`.
    pub fn new(server: &SignalServer, name: impl Into<String>, scope: &Scope) -> Result<Self> {
        let name = name.into();
        let route = scope.route_for(&name);
        let members = scope.child(&name)?;
        debug!(route = %route, "network created");
        Ok(Self {
            shared: Arc::new(NetworkShared {
                name,
                route,
                scope: scope.clone(),
                members,
                server: server.clone(),
                state: Mutex::new(NetworkState::default()),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    /// Network name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Route clients address method calls to.
    #[must_use]
    pub fn route(&self) -> &str {
        &self.shared.route
    }

    /// Whether [`dispatch`](Self::dispatch) has succeeded.
    #[must_use]
    pub fn is_dispatched(&self) -> bool {
        self.shared.state.lock().dispatched
    }

    /// Whether [`destroy`](Self::destroy) has been called.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::Acquire)
    }

    /// Add a constant replicated to every client.
    pub fn append_value(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let mut state = self.shared.state.lock();
        self.check_append(&state, key)?;
        let _ = state.values.insert(key.to_string(), value.into());
        trace!(route = %self.shared.route, key, "value appended");
        Ok(())
    }

    /// Add a method clients can call with [`NetworkClient::invoke`].
    pub fn append_method<F>(&self, key: &str, handler: F) -> Result<()>
    where
        F: Fn(&PeerId, Args) -> std::result::Result<Args, String> + Send + Sync + 'static,
    {
        let mut state = self.shared.state.lock();
        self.check_append(&state, key)?;
        let _ = state.methods.insert(key.to_string(), Arc::new(handler));
        trace!(route = %self.shared.route, key, "method appended");
        Ok(())
    }

    /// Add a signal, published as `key` in the network's own scope.
    pub fn append_signal(&self, key: &str) -> Result<Signal> {
        let mut state = self.shared.state.lock();
        self.check_append(&state, key)?;
        let signal = Signal::new(&self.shared.server, key, &self.shared.members)?;
        let _ = state.signals.insert(key.to_string(), signal.clone());
        Ok(signal)
    }

    /// Signal appended under `key`.
    #[must_use]
    pub fn signal(&self, key: &str) -> Option<Signal> {
        self.shared.state.lock().signals.get(key).cloned()
    }

    /// Publish the manifest and start answering method calls. After this
    /// the network is sealed.
    pub fn dispatch(&self) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        self.ensure_live()?;
        if state.dispatched {
            return Err(SignalError::AlreadyDispatched {
                name: shared.name.clone(),
            });
        }
        let manifest = state.manifest();
        shared
            .scope
            .publish(&shared.name, Published::network(shared.route.clone(), manifest))?;
        let weak: Weak<NetworkShared> = Arc::downgrade(shared);
        let host: Weak<dyn MethodHost> = weak;
        if let Err(e) = shared.server.register_methods(&shared.route, host) {
            let _ = shared.scope.unpublish(&shared.name, &shared.route);
            return Err(e);
        }
        state.dispatched = true;
        debug!(
            route = %shared.route,
            values = state.values.len(),
            methods = state.methods.len(),
            signals = state.signals.len(),
            "network dispatched"
        );
        Ok(())
    }

    /// Unpublish, destroy appended signals, and reject later calls.
    /// Idempotent.
    pub fn destroy(&self) {
        let _ = self.shared.shutdown();
    }

    /// Whether `value` is a [`NetworkServer`].
    #[must_use]
    pub fn is_a(value: &dyn Any) -> bool {
        is_a::<Self>(value)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(SignalError::disposed(EntityKind::NetworkServer));
        }
        Ok(())
    }

    fn check_append(&self, state: &NetworkState, key: &str) -> Result<()> {
        self.ensure_live()?;
        if state.dispatched {
            return Err(SignalError::AlreadyDispatched {
                name: self.shared.name.clone(),
            });
        }
        if state.has_key(key) {
            return Err(SignalError::DuplicateName {
                name: key.to_string(),
                scope: self.shared.members.path().to_string(),
            });
        }
        Ok(())
    }
}

impl Entity for NetworkServer {
    const KIND: EntityKind = EntityKind::NetworkServer;
}

impl std::fmt::Debug for NetworkServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkServer")
            .field("route", &self.shared.route)
            .field("dispatched", &self.is_dispatched())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

struct NetworkClientShared {
    name: String,
    route: String,
    client: SignalClient,
    manifest: Manifest,
    signals: BTreeMap<String, ClientSignal>,
    destroyed: AtomicBool,
}

/// Client half of a network.
///
/// Cheap to clone; clones refer to the same binding.
#[derive(Clone)]
pub struct NetworkClient {
    shared: Arc<NetworkClientShared>,
}

impl NetworkClient {
    /// Resolve the network `name` in `scope`, waiting up to the client's
    /// discovery timeout for it to be dispatched.
    pub async fn from_parent(client: &SignalClient, name: &str, scope: &Scope) -> Result<Self> {
        Self::from_parent_timeout(client, name, scope, client.options().discovery_timeout).await
    }

    /// Resolve the network `name` in `scope`, waiting up to `timeout`.
    pub async fn from_parent_timeout(
        client: &SignalClient,
        name: &str,
        scope: &Scope,
        timeout: Duration,
    ) -> Result<Self> {
        let entry = scope.wait_for(name, timeout).await?;
        Self::bind(client, name, scope, entry)
    }

    /// Resolve the network `name` in `scope` without waiting.
    pub fn expect(client: &SignalClient, name: &str, scope: &Scope) -> Result<Self> {
        let entry = scope.resolve(name).ok_or_else(|| SignalError::NotFound {
            name: name.to_string(),
            scope: scope.path().to_string(),
        })?;
        Self::bind(client, name, scope, entry)
    }

    fn bind(client: &SignalClient, name: &str, scope: &Scope, entry: Published) -> Result<Self> {
        let Published {
            route,
            kind,
            manifest,
        } = entry;
        if kind != EntityKind::NetworkServer {
            return Err(SignalError::KindMismatch {
                name: name.to_string(),
                expected: EntityKind::NetworkServer,
                found: kind,
            });
        }
        let manifest = manifest.unwrap_or_default();
        let members = scope.child(name)?;
        let signals = manifest
            .signals
            .keys()
            .map(|key| Ok((key.clone(), ClientSignal::expect(client, key, &members)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        debug!(route = %route, signals = signals.len(), "network bound");
        Ok(Self {
            shared: Arc::new(NetworkClientShared {
                name: name.to_string(),
                route,
                client: client.clone(),
                manifest,
                signals,
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    /// Network name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Route method calls are addressed to.
    #[must_use]
    pub fn route(&self) -> &str {
        &self.shared.route
    }

    /// Everything the server published.
    #[must_use]
    pub fn manifest(&self) -> &Manifest {
        &self.shared.manifest
    }

    /// Constant appended under `key`.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.shared.manifest.values.get(key)
    }

    /// Bound client signal for the signal appended under `key`.
    #[must_use]
    pub fn signal(&self, key: &str) -> Option<&ClientSignal> {
        self.shared.signals.get(key)
    }

    /// Names of callable methods.
    #[must_use]
    pub fn methods(&self) -> &[String] {
        &self.shared.manifest.methods
    }

    /// Whether [`destroy`](Self::destroy) has been called.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::Acquire)
    }

    /// Call `method` on the server and wait for its result.
    ///
    /// Fails with [`SignalError::Remote`] if the handler fails or the method
    /// does not exist, and with [`SignalError::CallTimeout`] if no reply
    /// arrives in time.
    pub async fn invoke(&self, method: &str, args: Args) -> Result<Args> {
        if self.is_destroyed() {
            return Err(SignalError::disposed(EntityKind::NetworkClient));
        }
        self.shared
            .client
            .invoke(&self.shared.route, method, args)
            .await
    }

    /// Destroy every bound client signal and reject later calls. Idempotent.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        for signal in self.shared.signals.values() {
            signal.destroy();
        }
        debug!(route = %self.shared.route, "network client destroyed");
    }

    /// Whether `value` is a [`NetworkClient`].
    #[must_use]
    pub fn is_a(value: &dyn Any) -> bool {
        is_a::<Self>(value)
    }
}

impl Entity for NetworkClient {
    const KIND: EntityKind = EntityKind::NetworkClient;
}

impl std::fmt::Debug for NetworkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkClient")
            .field("route", &self.shared.route)
            .field("manifest", &self.shared.manifest)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
