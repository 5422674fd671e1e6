//! In-process transport.
//!
//! [`MemoryNetwork`] wires one server endpoint to any number of client
//! endpoints inside a single process. Every endpoint owns an unbounded FIFO
//! inbox drained by its own Tokio task, so a send never runs the receiver's
//! handlers inline. Packets are JSON-encoded on send (enforcing
//! [`TransportLimits`]) and decoded by the receiving pump.

use std::collections::BTreeMap;
use std::sync::Arc;

use beacon_core::PeerId;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{
    ClientReceiver, ClientTransport, Incoming, Packet, ServerReceiver, ServerTransport,
    TransportError, TransportLimits, decode,
};

/// Identity the server endpoint stamps on packets it sends.
const SERVER_PEER: &str = "server";

type Handler = Arc<dyn Fn(PeerId, Incoming) + Send + Sync>;

struct Frame {
    from: PeerId,
    seq: u64,
    bytes: Vec<u8>,
}

struct InboxState {
    last_seq: u64,
    tx: Option<mpsc::UnboundedSender<Frame>>,
}

/// Receiving side of one endpoint.
struct Inbox {
    state: Mutex<InboxState>,
    handler: Arc<RwLock<Option<Handler>>>,
}

impl Inbox {
    /// Open an inbox and spawn its pump task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    fn open(endpoint: String) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        let handler: Arc<RwLock<Option<Handler>>> = Arc::default();
        let pump_handler = Arc::clone(&handler);

        let _ = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let packet = match decode(&frame.bytes) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!(
                            endpoint = %endpoint,
                            seq = frame.seq,
                            error = %e,
                            "dropping undecodable frame"
                        );
                        continue;
                    }
                };
                let current = pump_handler.read().clone();
                match current {
                    Some(handler) => handler(
                        frame.from,
                        Incoming {
                            seq: frame.seq,
                            packet,
                        },
                    ),
                    None => trace!(
                        endpoint = %endpoint,
                        seq = frame.seq,
                        "no receiver installed, frame dropped"
                    ),
                }
            }
            debug!(endpoint = %endpoint, "inbox drained and closed");
        });

        Arc::new(Self {
            state: Mutex::new(InboxState {
                last_seq: 0,
                tx: Some(tx),
            }),
            handler,
        })
    }

    /// Number and enqueue a frame. The lock is held across both steps so
    /// queue order always matches sequence order.
    fn deliver(&self, from: PeerId, bytes: Vec<u8>) -> Result<u64, TransportError> {
        let mut state = self.state.lock();
        let Some(tx) = state.tx.as_ref() else {
            return Err(TransportError::Closed);
        };
        let seq = state.last_seq + 1;
        tx.send(Frame { from, seq, bytes })
            .map_err(|_| TransportError::Closed)?;
        state.last_seq = seq;
        Ok(seq)
    }

    fn mark(&self) -> u64 {
        self.state.lock().last_seq
    }

    fn set_handler(&self, handler: Handler) {
        *self.handler.write() = Some(handler);
    }

    /// Stop accepting frames. Frames already queued still drain.
    fn close(&self) {
        self.state.lock().tx = None;
    }
}

struct NetworkInner {
    limits: TransportLimits,
    server_peer: PeerId,
    server: Arc<Inbox>,
    clients: Mutex<BTreeMap<PeerId, Arc<Inbox>>>,
}

impl NetworkInner {
    fn client_inbox(&self, peer: &PeerId) -> Option<Arc<Inbox>> {
        self.clients.lock().get(peer).cloned()
    }
}

/// In-process network of one server and many clients.
///
/// Cheap to clone; clones share the same endpoints.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    /// Create a network with the limits configured in the global settings.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(TransportLimits::default())
    }

    /// Create a network with explicit limits.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn with_limits(limits: TransportLimits) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                limits,
                server_peer: PeerId::from(SERVER_PEER),
                server: Inbox::open(SERVER_PEER.to_string()),
                clients: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Limits enforced on every packet.
    #[must_use]
    pub fn limits(&self) -> TransportLimits {
        self.inner.limits
    }

    /// The server endpoint.
    #[must_use]
    pub fn server(&self) -> Arc<MemoryServerTransport> {
        Arc::new(MemoryServerTransport {
            net: Arc::clone(&self.inner),
        })
    }

    /// Connect a new client and return its endpoint.
    #[must_use]
    pub fn connect(&self) -> Arc<MemoryClientTransport> {
        let peer = PeerId::new();
        let inbox = Inbox::open(peer.to_string());
        let _ = self
            .inner
            .clients
            .lock()
            .insert(peer.clone(), Arc::clone(&inbox));
        debug!(%peer, "peer connected");
        Arc::new(MemoryClientTransport {
            peer,
            inbox,
            net: Arc::clone(&self.inner),
        })
    }

    /// Disconnect a client. Returns `false` if it was not connected.
    ///
    /// Packets already queued for the client still drain. Later sends to it
    /// fail with [`TransportError::Unreachable`] and its own sends fail with
    /// [`TransportError::Closed`].
    pub fn disconnect(&self, peer: &PeerId) -> bool {
        let removed = self.inner.clients.lock().remove(peer);
        match removed {
            Some(inbox) => {
                inbox.close();
                debug!(%peer, "peer disconnected");
                true
            }
            None => false,
        }
    }

    /// Currently connected peers.
    #[must_use]
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.clients.lock().keys().cloned().collect()
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("limits", &self.inner.limits)
            .field("peers", &self.inner.clients.lock().len())
            .finish()
    }
}

/// Server endpoint of a [`MemoryNetwork`].
pub struct MemoryServerTransport {
    net: Arc<NetworkInner>,
}

impl ServerTransport for MemoryServerTransport {
    fn peers(&self) -> Vec<PeerId> {
        self.net.clients.lock().keys().cloned().collect()
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.net.clients.lock().contains_key(peer)
    }

    fn validate(&self, packet: &Packet) -> Result<(), TransportError> {
        self.net.limits.encode(packet).map(|_| ())
    }

    fn send(&self, peer: &PeerId, packet: &Packet) -> Result<(), TransportError> {
        let bytes = self.net.limits.encode(packet)?;
        let inbox = self
            .net
            .client_inbox(peer)
            .ok_or_else(|| TransportError::Unreachable(peer.clone()))?;
        let seq = inbox
            .deliver(self.net.server_peer.clone(), bytes)
            .map_err(|_| TransportError::Unreachable(peer.clone()))?;
        trace!(%peer, seq, kind = packet.kind(), "sent to peer");
        Ok(())
    }

    fn on_receive(&self, receiver: ServerReceiver) {
        self.net
            .server
            .set_handler(Arc::new(move |from: PeerId, incoming: Incoming| {
                receiver(&from, incoming);
            }));
    }

    fn arrival_mark(&self) -> u64 {
        self.net.server.mark()
    }
}

/// Client endpoint of a [`MemoryNetwork`].
pub struct MemoryClientTransport {
    peer: PeerId,
    inbox: Arc<Inbox>,
    net: Arc<NetworkInner>,
}

impl ClientTransport for MemoryClientTransport {
    fn local_peer(&self) -> &PeerId {
        &self.peer
    }

    fn validate(&self, packet: &Packet) -> Result<(), TransportError> {
        self.net.limits.encode(packet).map(|_| ())
    }

    fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        if !self.net.clients.lock().contains_key(&self.peer) {
            return Err(TransportError::Closed);
        }
        let bytes = self.net.limits.encode(packet)?;
        let seq = self.net.server.deliver(self.peer.clone(), bytes)?;
        trace!(peer = %self.peer, seq, kind = packet.kind(), "sent to server");
        Ok(())
    }

    fn on_receive(&self, receiver: ClientReceiver) {
        self.inbox
            .set_handler(Arc::new(move |_from: PeerId, incoming: Incoming| {
                receiver(incoming);
            }));
    }

    fn arrival_mark(&self) -> u64 {
        self.inbox.mark()
    }
}

impl std::fmt::Debug for MemoryClientTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryClientTransport")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use beacon_core::{Args, args};
    use std::time::Duration;

    fn dispatch(args: Args) -> Packet {
        Packet::Dispatch {
            route: "/Chat".into(),
            args,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn server_to_client_is_fifo() {
        let net = MemoryNetwork::new();
        let server = net.server();
        let client = net.connect();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        client.on_receive(Arc::new(move |incoming: Incoming| {
            sink.lock().push((incoming.seq, incoming.packet));
        }));

        for n in 0..5 {
            server.send(client.local_peer(), &dispatch(args![n])).unwrap();
        }
        settle().await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 5);
        for (i, (seq, packet)) in seen.iter().enumerate() {
            assert_eq!(*seq, i as u64 + 1);
            assert_eq!(*packet, dispatch(args![i]));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn client_to_server_carries_sender() {
        let net = MemoryNetwork::new();
        let server = net.server();
        let client = net.connect();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        server.on_receive(Arc::new(move |peer: &PeerId, incoming: Incoming| {
            sink.lock().push((peer.clone(), incoming.seq));
        }));

        client.send(&dispatch(args!["hi"])).unwrap();
        settle().await;

        assert_eq!(*seen.lock(), vec![(client.local_peer().clone(), 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn arrival_mark_counts_queued_frames() {
        let net = MemoryNetwork::new();
        let server = net.server();
        let client = net.connect();
        assert_eq!(client.arrival_mark(), 0);

        server.send(client.local_peer(), &dispatch(args![1])).unwrap();
        server.send(client.local_peer(), &dispatch(args![2])).unwrap();

        // Numbered on arrival, before the pump has run.
        assert_eq!(client.arrival_mark(), 2);
        assert_eq!(server.arrival_mark(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_to_unknown_peer_is_unreachable() {
        let net = MemoryNetwork::new();
        let server = net.server();
        let stranger = PeerId::from("stranger");
        assert_matches!(
            server.send(&stranger, &dispatch(args![])),
            Err(TransportError::Unreachable(peer)) if peer == stranger
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_prunes_peer_and_closes_endpoint() {
        let net = MemoryNetwork::new();
        let server = net.server();
        let a = net.connect();
        let b = net.connect();
        assert_eq!(server.peers().len(), 2);

        assert!(net.disconnect(a.local_peer()));
        assert!(!net.disconnect(a.local_peer()));

        assert!(!server.is_connected(a.local_peer()));
        assert!(server.is_connected(b.local_peer()));
        assert_eq!(server.peers(), vec![b.local_peer().clone()]);
        assert_matches!(a.send(&dispatch(args![])), Err(TransportError::Closed));
        assert_matches!(
            server.send(a.local_peer(), &dispatch(args![])),
            Err(TransportError::Unreachable(_))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn queued_frames_drain_after_disconnect() {
        let net = MemoryNetwork::new();
        let server = net.server();
        let client = net.connect();
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        client.on_receive(Arc::new(move |_: Incoming| *sink.lock() += 1));

        server.send(client.local_peer(), &dispatch(args![1])).unwrap();
        assert!(net.disconnect(client.local_peer()));
        settle().await;

        assert_eq!(*count.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_send_is_rejected_before_enqueue() {
        let net = MemoryNetwork::with_limits(TransportLimits {
            max_payload_bytes: 64,
            max_args: 4,
        });
        let server = net.server();
        let client = net.connect();
        let big = "y".repeat(200);

        assert_matches!(
            server.send(client.local_peer(), &dispatch(args![big])),
            Err(TransportError::Rejected(_))
        );
        assert_eq!(client.arrival_mark(), 0);
        assert_matches!(
            server.validate(&dispatch(args![1, 2, 3, 4, 5])),
            Err(TransportError::Rejected(_))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn frames_without_receiver_are_dropped() {
        let net = MemoryNetwork::new();
        let server = net.server();
        let client = net.connect();
        server.send(client.local_peer(), &dispatch(args![1])).unwrap();
        settle().await;

        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        client.on_receive(Arc::new(move |_: Incoming| *sink.lock() += 1));
        settle().await;
        assert_eq!(*count.lock(), 0);
    }
}
