//! Capability checks.
//!
//! Each public entity declares its [`EntityKind`] through [`Entity`]. Checks
//! discriminate on the concrete type, never on which methods happen to exist.

use std::any::Any;

use beacon_core::EntityKind;

use crate::client::ClientSignal;
use crate::connection::Connection;
use crate::network::{NetworkClient, NetworkServer};
use crate::server::Signal;

/// A public entity with a fixed capability set.
pub trait Entity: Any {
    /// Capability set this type implements.
    const KIND: EntityKind;

    /// Capability set of this value.
    fn kind(&self) -> EntityKind {
        Self::KIND
    }
}

/// Whether `value` is a `T`.
#[must_use]
pub fn is_a<T: Entity>(value: &dyn Any) -> bool {
    value.is::<T>()
}

/// Kind of `value`, if it is one of the public entities.
#[must_use]
pub fn kind_of(value: &dyn Any) -> Option<EntityKind> {
    if value.is::<Signal>() {
        Some(Signal::KIND)
    } else if value.is::<ClientSignal>() {
        Some(ClientSignal::KIND)
    } else if value.is::<Connection>() {
        Some(Connection::KIND)
    } else if value.is::<NetworkServer>() {
        Some(NetworkServer::KIND)
    } else if value.is::<NetworkClient>() {
        Some(NetworkClient::KIND)
    } else {
        None
    }
}
