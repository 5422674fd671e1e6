//! # beacon-signal
//!
//! Named, bidirectional remote signals between one server and many peers.
//!
//! - **Server**: [`SignalServer`] routes transport packets; [`Signal`] fans
//!   dispatches out to one, several, or all peers
//! - **Client**: [`SignalClient`] owns a peer endpoint; [`ClientSignal`]
//!   subscribes to, waits on, and fires a server signal
//! - **Middleware**: [`Pipeline`] stages intercept inbound and outbound traffic
//!   and may rewrite or veto it
//! - **Discovery**: [`Scope`] publishes names that clients resolve, optionally
//!   waiting for them to appear
//! - **Networks**: [`NetworkServer`] and [`NetworkClient`] bundle values,
//!   methods and signals under one name
//! - **Transport**: [`ServerTransport`]/[`ClientTransport`] traits and the
//!   in-process [`MemoryNetwork`]

#![deny(unsafe_code)]

pub mod client;
pub mod connection;
pub mod discovery;
pub mod entity;
mod isolate;
pub mod middleware;
pub mod network;
pub mod server;
pub mod transport;

pub use client::{ClientOptions, ClientSignal, SignalClient};
pub use connection::Connection;
pub use discovery::{Published, Scope};
pub use entity::{Entity, is_a, kind_of};
pub use middleware::{
    Direction, FnMiddleware, Middleware, MiddlewareContext, MiddlewareError, Pipeline,
    PipelineOutcome, Verdict,
};
pub use network::{Manifest, MethodHandler, NetworkClient, NetworkServer};
pub use server::{Delivery, Signal, SignalServer};
pub use transport::{
    ClientTransport, MemoryClientTransport, MemoryNetwork, MemoryServerTransport, Packet,
    ServerTransport, TransportError, TransportLimits,
};
