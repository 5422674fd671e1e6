//! Transport channel abstraction.
//!
//! Signals never touch sockets or engine primitives directly. A server talks
//! to its peers through a [`ServerTransport`] and each client talks to the
//! server through a [`ClientTransport`]. Both carry [`Packet`]s, FIFO per
//! sender and receiver pair, with no delivery guarantee beyond "connected and
//! not dropped".
//!
//! Every endpoint numbers the packets that reach it. [`ServerTransport::arrival_mark`]
//! and [`ClientTransport::arrival_mark`] expose the last number handed out so
//! a subscription can ignore anything that arrived before it existed.

pub mod memory;

use std::sync::Arc;

use beacon_core::{Args, PeerId, SignalError};
use beacon_settings::{TransportSettings, get_settings};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::{MemoryClientTransport, MemoryNetwork, MemoryServerTransport};

/// Unit of traffic between a server and a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Packet {
    /// Signal payload, in either direction.
    Dispatch {
        /// Route of the signal (scope path joined with its name).
        route: String,
        /// Argument tuple.
        args: Args,
    },
    /// Client call of a network method.
    Invoke {
        /// Route of the network.
        route: String,
        /// Method key.
        method: String,
        /// Correlates the reply with this call.
        #[serde(rename = "callId")]
        call_id: u64,
        /// Argument tuple.
        args: Args,
    },
    /// Server reply to an [`Packet::Invoke`].
    Reply {
        /// Call being answered.
        #[serde(rename = "callId")]
        call_id: u64,
        /// Result of the call.
        outcome: ReplyOutcome,
    },
}

impl Packet {
    /// Argument tuple carried by this packet, if any.
    #[must_use]
    pub fn args(&self) -> Option<&Args> {
        match self {
            Self::Dispatch { args, .. } | Self::Invoke { args, .. } => Some(args),
            Self::Reply { outcome, .. } => match outcome {
                ReplyOutcome::Ok { args } => Some(args),
                ReplyOutcome::Err { .. } => None,
            },
        }
    }

    /// Short name of the packet type, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dispatch { .. } => "dispatch",
            Self::Invoke { .. } => "invoke",
            Self::Reply { .. } => "reply",
        }
    }
}

/// Result of a network method call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ReplyOutcome {
    /// The handler returned values.
    Ok {
        /// Returned tuple.
        args: Args,
    },
    /// The handler failed or the method does not exist.
    Err {
        /// Failure message.
        message: String,
    },
}

/// A packet together with its arrival number at the receiving endpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct Incoming {
    /// Arrival sequence number, strictly increasing per endpoint.
    pub seq: u64,
    /// Decoded packet.
    pub packet: Packet,
}

/// Transport-level failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The addressed peer is not connected.
    #[error("peer {0} is not reachable")]
    Unreachable(PeerId),
    /// The payload violates the transport's limits or cannot be encoded.
    #[error("{0}")]
    Rejected(String),
    /// The local endpoint has been closed.
    #[error("transport endpoint is closed")]
    Closed,
}

impl From<TransportError> for SignalError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unreachable(peer) => SignalError::TransportRejected {
                reason: format!("peer {peer} is not reachable"),
            },
            TransportError::Rejected(reason) => SignalError::TransportRejected { reason },
            TransportError::Closed => SignalError::TransportClosed,
        }
    }
}

/// Size and arity limits a transport enforces on every packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportLimits {
    /// Maximum encoded size in bytes.
    pub max_payload_bytes: usize,
    /// Maximum number of arguments in one tuple.
    pub max_args: usize,
}

impl Default for TransportLimits {
    /// Limits from the global settings (`transport.*` and `BEACON_MAX_*`).
    fn default() -> Self {
        Self::from(&get_settings().transport)
    }
}

impl From<&TransportSettings> for TransportLimits {
    fn from(settings: &TransportSettings) -> Self {
        Self {
            max_payload_bytes: settings.max_payload_bytes,
            max_args: settings.max_args,
        }
    }
}

impl TransportLimits {
    /// Encode a packet, rejecting it if it exceeds these limits.
    pub fn encode(&self, packet: &Packet) -> Result<Vec<u8>, TransportError> {
        if let Some(args) = packet.args() {
            if args.len() > self.max_args {
                return Err(TransportError::Rejected(format!(
                    "{} arguments exceed the limit of {}",
                    args.len(),
                    self.max_args
                )));
            }
        }
        let bytes =
            serde_json::to_vec(packet).map_err(|e| TransportError::Rejected(e.to_string()))?;
        if bytes.len() > self.max_payload_bytes {
            return Err(TransportError::Rejected(format!(
                "payload of {} bytes exceeds the limit of {}",
                bytes.len(),
                self.max_payload_bytes
            )));
        }
        Ok(bytes)
    }
}

/// Decode a packet produced by [`TransportLimits::encode`].
pub fn decode(bytes: &[u8]) -> Result<Packet, TransportError> {
    serde_json::from_slice(bytes).map_err(|e| TransportError::Rejected(e.to_string()))
}

/// Handler invoked by a server endpoint for every packet from a peer.
pub type ServerReceiver = Arc<dyn Fn(&PeerId, Incoming) + Send + Sync>;

/// Handler invoked by a client endpoint for every packet from the server.
pub type ClientReceiver = Arc<dyn Fn(Incoming) + Send + Sync>;

/// Server side of the transport channel.
pub trait ServerTransport: Send + Sync {
    /// Currently connected peers.
    fn peers(&self) -> Vec<PeerId>;

    /// Whether `peer` is currently connected.
    fn is_connected(&self, peer: &PeerId) -> bool;

    /// Check a packet against the transport's limits without sending it.
    fn validate(&self, packet: &Packet) -> Result<(), TransportError>;

    /// Send a packet to one peer.
    fn send(&self, peer: &PeerId, packet: &Packet) -> Result<(), TransportError>;

    /// Install the handler for packets arriving from peers. Replaces any
    /// previous handler.
    fn on_receive(&self, receiver: ServerReceiver);

    /// Sequence number of the last packet that reached this endpoint.
    fn arrival_mark(&self) -> u64;
}

/// Client side of the transport channel.
pub trait ClientTransport: Send + Sync {
    /// Identity of this endpoint as the server sees it.
    fn local_peer(&self) -> &PeerId;

    /// Check a packet against the transport's limits without sending it.
    fn validate(&self, packet: &Packet) -> Result<(), TransportError>;

    /// Send a packet to the server.
    fn send(&self, packet: &Packet) -> Result<(), TransportError>;

    /// Install the handler for packets arriving from the server. Replaces any
    /// previous handler.
    fn on_receive(&self, receiver: ClientReceiver);

    /// Sequence number of the last packet that reached this endpoint.
    fn arrival_mark(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use beacon_core::args;

    fn dispatch(args: Args) -> Packet {
        Packet::Dispatch {
            route: "/Damage".into(),
            args,
        }
    }

    #[test]
    fn dispatch_wire_format() {
        let json = serde_json::to_value(dispatch(args!["hit", 3])).unwrap();
        assert_eq!(json["type"], "dispatch");
        assert_eq!(json["route"], "/Damage");
        assert_eq!(json["args"], serde_json::json!(["hit", 3]));
    }

    #[test]
    fn invoke_uses_camel_case_call_id() {
        let packet = Packet::Invoke {
            route: "/Shop".into(),
            method: "buy".into(),
            call_id: 7,
            args: args!["sword"],
        };
        let json = serde_json::to_value(&packet).unwrap();
        assert_eq!(json["type"], "invoke");
        assert_eq!(json["callId"], 7);
    }

    #[test]
    fn reply_outcome_is_tagged_by_status() {
        let packet = Packet::Reply {
            call_id: 1,
            outcome: ReplyOutcome::Err {
                message: "nope".into(),
            },
        };
        let json = serde_json::to_value(&packet).unwrap();
        assert_eq!(json["outcome"]["status"], "err");
        assert_eq!(json["outcome"]["message"], "nope");
        assert!(packet.args().is_none());
    }

    #[test]
    fn encode_then_decode_preserves_packet() {
        let packet = dispatch(args!["ok", 1, {"crit": true}]);
        let bytes = TransportLimits::default().encode(&packet).unwrap();
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn encode_rejects_too_many_args() {
        let limits = TransportLimits {
            max_payload_bytes: 1024,
            max_args: 2,
        };
        let err = limits.encode(&dispatch(args![1, 2, 3])).unwrap_err();
        assert_matches!(err, TransportError::Rejected(ref reason) if reason.contains("3 arguments"));
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let limits = TransportLimits {
            max_payload_bytes: 64,
            max_args: 8,
        };
        let big = "x".repeat(100);
        let err = limits.encode(&dispatch(args![big])).unwrap_err();
        assert_matches!(err, TransportError::Rejected(ref reason) if reason.contains("exceeds"));
    }

    #[test]
    fn decode_garbage_is_rejected() {
        assert_matches!(decode(b"not json"), Err(TransportError::Rejected(_)));
    }

    #[test]
    fn transport_errors_map_to_signal_errors() {
        assert_matches!(
            SignalError::from(TransportError::Rejected("too big".into())),
            SignalError::TransportRejected { reason } if reason == "too big"
        );
        assert_matches!(
            SignalError::from(TransportError::Closed),
            SignalError::TransportClosed
        );
    }

    #[test]
    fn limits_follow_settings() {
        let settings = TransportSettings {
            max_payload_bytes: 512,
            max_args: 4,
        };
        let limits = TransportLimits::from(&settings);
        assert_eq!(limits.max_payload_bytes, 512);
        assert_eq!(limits.max_args, 4);
    }
}
