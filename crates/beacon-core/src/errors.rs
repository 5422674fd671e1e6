//! Error hierarchy for signal operations.
//!
//! [`SignalError`] covers everything a caller of the public API can observe.
//! Middleware vetoes are deliberately absent: a veto is a successful
//! non-delivery and is reported through the fire result instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kind::EntityKind;

/// Coarse classification used for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Failed while creating or resolving an entity.
    Construction,
    /// The entity was used after it was destroyed or sealed.
    Lifecycle,
    /// The transport refused or could not carry the payload.
    Transport,
    /// A middleware stage failed.
    Middleware,
    /// A suspension point gave up waiting.
    Timeout,
    /// The remote side reported a failure.
    Remote,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Construction => "construction",
            Self::Lifecycle => "lifecycle",
            Self::Transport => "transport",
            Self::Middleware => "middleware",
            Self::Timeout => "timeout",
            Self::Remote => "remote",
        };
        f.write_str(s)
    }
}

/// Errors returned by signal, client signal, and network operations.
#[derive(Debug, Error)]
pub enum SignalError {
    /// A name is already published in the target scope.
    #[error("'{name}' is already published in scope '{scope}'")]
    DuplicateName {
        /// Name that collided.
        name: String,
        /// Path of the scope.
        scope: String,
    },

    /// A name is empty or contains the path separator `/`.
    #[error("invalid name '{name}': {reason}")]
    InvalidName {
        /// Name that was rejected.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Another live entity is already routed at this route.
    #[error("route '{route}' is already in use")]
    RouteInUse {
        /// Route that collided.
        route: String,
    },

    /// Discovery did not find the name (immediately or before the timeout).
    #[error("'{name}' was not found in scope '{scope}'")]
    NotFound {
        /// Name that was looked up.
        name: String,
        /// Path of the scope.
        scope: String,
    },

    /// Discovery found the name but it is a different kind of entity.
    #[error("'{name}' is a {found}, expected a {expected}")]
    KindMismatch {
        /// Name that was looked up.
        name: String,
        /// Kind the caller asked for.
        expected: EntityKind,
        /// Kind actually published.
        found: EntityKind,
    },

    /// Operation on a destroyed entity.
    #[error("{entity} has been destroyed")]
    Disposed {
        /// Kind of the destroyed entity.
        entity: EntityKind,
    },

    /// A network was mutated after being dispatched.
    #[error("network '{name}' has already been dispatched")]
    AlreadyDispatched {
        /// Network name.
        name: String,
    },

    /// The transport refused the payload (size, count, or encoding).
    #[error("transport rejected payload: {reason}")]
    TransportRejected {
        /// Reason reported by the transport.
        reason: String,
    },

    /// The local transport endpoint is closed.
    #[error("transport is closed")]
    TransportClosed,

    /// An outbound middleware stage failed.
    #[error("middleware stage '{stage}' failed: {message}")]
    Middleware {
        /// Name of the failing stage.
        stage: String,
        /// Failure message.
        message: String,
    },

    /// `wait` gave up before a dispatch arrived.
    #[error("no dispatch on '{route}' within {timeout_ms}ms")]
    WaitTimeout {
        /// Route of the signal being waited on.
        route: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// A network method call received no reply in time.
    #[error("call to '{method}' timed out after {timeout_ms}ms")]
    CallTimeout {
        /// Method name.
        method: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// A network method call failed on the server.
    #[error("call to '{method}' failed: {message}")]
    Remote {
        /// Method name.
        method: String,
        /// Failure message from the server.
        message: String,
    },
}

impl SignalError {
    /// Shorthand for [`SignalError::Disposed`].
    #[must_use]
    pub fn disposed(entity: EntityKind) -> Self {
        Self::Disposed { entity }
    }

    /// Classify this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::DuplicateName { .. }
            | Self::InvalidName { .. }
            | Self::RouteInUse { .. }
            | Self::NotFound { .. }
            | Self::KindMismatch { .. } => ErrorCategory::Construction,
            Self::Disposed { .. } | Self::AlreadyDispatched { .. } => ErrorCategory::Lifecycle,
            Self::TransportRejected { .. } | Self::TransportClosed => ErrorCategory::Transport,
            Self::Middleware { .. } => ErrorCategory::Middleware,
            Self::WaitTimeout { .. } | Self::CallTimeout { .. } => ErrorCategory::Timeout,
            Self::Remote { .. } => ErrorCategory::Remote,
        }
    }

    /// Whether this is a [`SignalError::Disposed`].
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        matches!(self, Self::Disposed { .. })
    }

    /// Whether this is a [`SignalError::NotFound`].
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type for signal operations.
pub type Result<T> = std::result::Result<T, SignalError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
