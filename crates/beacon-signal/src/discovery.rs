//! Discovery scopes.
//!
//! A [`Scope`] is a node in a hierarchical namespace. Signals and networks
//! publish themselves under a name in one scope; clients look names up by
//! exact match within that same scope. Lookups can suspend until the name
//! appears, bounded by a timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use beacon_core::{EntityKind, Result, SignalError};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::network::Manifest;

/// What a name resolves to.
#[derive(Clone, Debug, PartialEq)]
pub struct Published {
    /// Route packets for this entity are addressed to.
    pub route: String,
    /// Kind of the published entity.
    pub kind: EntityKind,
    /// Contents of a dispatched network.
    pub manifest: Option<Manifest>,
}

impl Published {
    /// Entry for a server signal.
    #[must_use]
    pub fn signal(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            kind: EntityKind::Signal,
            manifest: None,
        }
    }

    /// Entry for a dispatched network.
    #[must_use]
    pub fn network(route: impl Into<String>, manifest: Manifest) -> Self {
        Self {
            route: route.into(),
            kind: EntityKind::NetworkServer,
            manifest: Some(manifest),
        }
    }
}

struct ScopeInner {
    path: String,
    entries: Mutex<HashMap<String, Published>>,
    children: Mutex<HashMap<String, Scope>>,
    published: Notify,
}

/// Node of the discovery namespace. Cheap to clone.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    /// Create the root of a new namespace.
    #[must_use]
    pub fn root() -> Self {
        Self::with_path("/".to_string())
    }

    fn with_path(path: String) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                path,
                entries: Mutex::new(HashMap::new()),
                children: Mutex::new(HashMap::new()),
                published: Notify::new(),
            }),
        }
    }

    /// Get or create the child scope called `name`.
    ///
    /// Fails with [`SignalError::InvalidName`] if `name` is empty or
    /// contains `/`.
    pub fn child(&self, name: &str) -> Result<Scope> {
        check_name(name)?;
        let mut children = self.inner.children.lock();
        Ok(children
            .entry(name.to_string())
            .or_insert_with(|| Self::with_path(self.route_for(name)))
            .clone())
    }

    /// Absolute path of this scope.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Route of `name` inside this scope.
    #[must_use]
    pub fn route_for(&self, name: &str) -> String {
        if self.inner.path == "/" {
            format!("/{name}")
        } else {
            format!("{}/{name}", self.inner.path)
        }
    }

    /// Publish `entry` under `name`.
    ///
    /// Fails with [`SignalError::InvalidName`] if `name` is empty or contains
    /// `/`, and with [`SignalError::DuplicateName`] if it is taken.
    pub fn publish(&self, name: &str, entry: Published) -> Result<()> {
        check_name(name)?;
        {
            let mut entries = self.inner.entries.lock();
            if entries.contains_key(name) {
                return Err(SignalError::DuplicateName {
                    name: name.to_string(),
                    scope: self.inner.path.clone(),
                });
            }
            debug!(scope = %self.inner.path, name, kind = %entry.kind, "published");
            let _ = entries.insert(name.to_string(), entry);
        }
        self.inner.published.notify_waiters();
        Ok(())
    }

    /// Remove `name` if it is still published with `route`.
    pub fn unpublish(&self, name: &str, route: &str) -> bool {
        let mut entries = self.inner.entries.lock();
        if entries.get(name).is_some_and(|e| e.route == route) {
            let _ = entries.remove(name);
            debug!(scope = %self.inner.path, name, "unpublished");
            true
        } else {
            false
        }
    }

    /// Look `name` up without waiting.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<Published> {
        self.inner.entries.lock().get(name).cloned()
    }

    /// Look `name` up, suspending until it is published or `timeout` elapses.
    pub async fn wait_for(&self, name: &str, timeout: Duration) -> Result<Published> {
        let lookup = async {
            loop {
                // Registered before the check so a publish in between still wakes us.
                let notified = self.inner.published.notified();
                if let Some(entry) = self.resolve(name) {
                    return entry;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, lookup).await.map_err(|_| {
            debug!(scope = %self.inner.path, name, ?timeout, "lookup timed out");
            SignalError::NotFound {
                name: name.to_string(),
                scope: self.inner.path.clone(),
            }
        })
    }

    /// Published names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.entries.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Names are single path segments, so every (scope, name) pair gets a
/// distinct route.
fn check_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name.contains('/') {
        "name contains '/'"
    } else {
        return Ok(());
    };
    Err(SignalError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    })
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("path", &self.inner.path)
            .field("names", &self.names())
            .finish()
    }
}
