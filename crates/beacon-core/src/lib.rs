//! # beacon-core
//!
//! Foundation types, errors, branded IDs, and logging for beacon remote signals.
//!
//! This crate provides the shared vocabulary the other beacon crates depend on:
//!
//! - **Branded IDs**: [`PeerId`] for remote endpoints, [`ConnectionId`] for subscriptions
//! - **Arguments**: [`Args`], the opaque tuple every dispatch carries, and the [`args!`] macro
//! - **Capabilities**: [`EntityKind`] tags used by `is_a` checks
//! - **Errors**: [`SignalError`] hierarchy via `thiserror`
//! - **Logging**: `tracing` subscriber setup and log capture for tests

#![deny(unsafe_code)]

pub mod args;
pub mod errors;
pub mod ids;
pub mod kind;
pub mod logging;

pub use args::Args;
pub use errors::{ErrorCategory, Result, SignalError};
pub use ids::{ConnectionId, PeerId};
pub use kind::EntityKind;

#[doc(hidden)]
pub use serde_json as __serde_json;
