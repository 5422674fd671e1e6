//! Connection handles and the subscriber registry behind them.
//!
//! Every `connect` call returns a [`Connection`]. The owning signal keeps a
//! [`Registry`] entry pointing at the same shared state, so flipping the
//! `active` flag from either side is immediately visible to the other.
//!
//! Delivery snapshots the registry and releases the lock before invoking any
//! callback, then re-checks each handle's flag right before calling it. A
//! callback may therefore connect, disconnect itself, disconnect a sibling,
//! or destroy the owner without corrupting the fan-out in progress.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use beacon_core::{ConnectionId, EntityKind};
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::entity::{Entity, is_a};
use crate::isolate::isolate;

/// Something a connection can remove itself from.
pub(crate) trait Detach: Send + Sync {
    fn detach(&self, id: ConnectionId);
}

struct ConnectionState {
    id: ConnectionId,
    active: AtomicBool,
    owner: Weak<dyn Detach>,
}

impl ConnectionState {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Returns `true` if this call flipped the flag.
    fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }
}

/// Revocable subscription token.
///
/// Dropping a `Connection` does not disconnect it; call
/// [`disconnect`](Self::disconnect) or disconnect through the owner.
pub struct Connection {
    state: Arc<ConnectionState>,
}

impl Connection {
    /// Identifier of this subscription within its owner.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.state.id
    }

    /// `true` until [`disconnect`](Self::disconnect) is called, a one-shot
    /// subscription fires, or the owner disconnects all or is destroyed.
    #[must_use]
    pub fn connected(&self) -> bool {
        self.state.is_active()
    }

    /// Stop receiving dispatches. Idempotent.
    pub fn disconnect(&self) {
        if self.state.deactivate() {
            if let Some(owner) = self.state.owner.upgrade() {
                owner.detach(self.state.id);
            }
            trace!(connection = %self.state.id, "disconnected");
        }
    }

    /// Whether `value` is a [`Connection`].
    #[must_use]
    pub fn is_a(value: &dyn Any) -> bool {
        is_a::<Self>(value)
    }
}

impl Entity for Connection {
    const KIND: EntityKind = EntityKind::Connection;
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.state.id)
            .field("connected", &self.connected())
            .finish()
    }
}

/// Callback stored in a registry.
pub(crate) type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Entry<E> {
    state: Arc<ConnectionState>,
    callback: Callback<E>,
    once: bool,
    since: u64,
}

impl<E> Clone for Entry<E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            callback: Arc::clone(&self.callback),
            once: self.once,
            since: self.since,
        }
    }
}

/// Insertion-ordered set of live subscriptions delivering events of type `E`.
pub(crate) struct Registry<E> {
    next_id: AtomicU64,
    entries: Mutex<BTreeMap<ConnectionId, Entry<E>>>,
}

impl<E: 'static> Registry<E> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(0),
            entries: Mutex::new(BTreeMap::new()),
        })
    }

    /// Register `callback`. It only sees events numbered after `since`.
    pub(crate) fn connect(
        self: &Arc<Self>,
        callback: Callback<E>,
        once: bool,
        since: u64,
    ) -> Connection {
        let id = ConnectionId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let weak: Weak<Self> = Arc::downgrade(self);
        let owner: Weak<dyn Detach> = weak;
        let state = Arc::new(ConnectionState {
            id,
            active: AtomicBool::new(true),
            owner,
        });
        let entry = Entry {
            state: Arc::clone(&state),
            callback,
            once,
            since,
        };
        let _ = self.entries.lock().insert(id, entry);
        trace!(connection = %id, once, since, "connected");
        Connection { state }
    }

    /// Deliver event number `seq` to every eligible subscriber, in
    /// registration order. Returns how many callbacks ran to completion.
    pub(crate) fn emit(&self, seq: u64, event: &E) -> usize {
        let snapshot: Vec<Entry<E>> = self.entries.lock().values().cloned().collect();
        let mut delivered = 0;
        for entry in snapshot {
            if seq <= entry.since {
                continue;
            }
            if entry.once {
                // Claim the single delivery before running the callback.
                if !entry.state.deactivate() {
                    continue;
                }
                self.detach(entry.state.id);
            } else if !entry.state.is_active() {
                continue;
            }
            match isolate(|| (entry.callback)(event)) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    warn!(
                        connection = %entry.state.id,
                        seq,
                        panic = %panic,
                        "subscriber panicked"
                    );
                }
            }
        }
        delivered
    }

    /// Deactivate and drop every subscription. Returns how many there were.
    pub(crate) fn disconnect_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.entries.lock());
        for entry in drained.values() {
            let _ = entry.state.deactivate();
        }
        drained.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl<E: 'static> Detach for Registry<E> {
    fn detach(&self, id: ConnectionId) {
        let _ = self.entries.lock().remove(&id);
    }
}

impl<E> fmt::Debug for Registry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("connections", &self.entries.lock().len())
            .finish()
    }
}
