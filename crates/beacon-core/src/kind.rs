//! Capability tags for the public entities.
//!
//! Every public entity declares which capability set it implements. Checks
//! such as `Signal::is_a` discriminate by type instead of probing for methods.

use serde::{Deserialize, Serialize};

/// Kind of a public entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    /// Server-side broadcastable signal.
    Signal,
    /// Client-side subscriber bound to one remote signal.
    ClientSignal,
    /// Revocable subscription token.
    Connection,
    /// Server-side bundle of values, methods, and signals.
    NetworkServer,
    /// Client-side view of a dispatched network.
    NetworkClient,
}

impl EntityKind {
    /// Returns all entity kinds.
    #[must_use]
    pub fn all() -> &'static [EntityKind] {
        &[
            Self::Signal,
            Self::ClientSignal,
            Self::Connection,
            Self::NetworkServer,
            Self::NetworkClient,
        ]
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal => write!(f, "Signal"),
            Self::ClientSignal => write!(f, "ClientSignal"),
            Self::Connection => write!(f, "Connection"),
            Self::NetworkServer => write!(f, "NetworkServer"),
            Self::NetworkClient => write!(f, "NetworkClient"),
        }
    }
}
