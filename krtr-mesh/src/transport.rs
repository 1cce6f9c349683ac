//! External interfaces (§6): the link-layer adapter the host provides, and
//! the delegate the host consumes events through.

use krtr_proto::{Fingerprint, PeerId};
use std::io;

/// Opaque handle identifying one radio connection, assigned by the adapter.
pub type ConnectionHandle = u64;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("connection {0} not found")]
    ConnectionNotFound(ConnectionHandle),
    #[error("{0}")]
    Other(String),
}

/// The short-range radio transport, provided by the host. The engine treats
/// it as an abstract connection-oriented framed byte exchange plus
/// connectionless advertisement; it never reaches into BLE specifics.
pub trait LinkLayer: Send + Sync {
    /// Writes one already-fragmented frame to an established connection.
    /// The adapter is responsible for chunking to the negotiated MTU.
    fn send_frame(&self, connection: ConnectionHandle, frame: &[u8]) -> Result<(), LinkError>;

    /// Broadcasts one frame to every currently connected peer except
    /// `except`, if given (split-horizon relay, §4.9 step 6).
    fn broadcast_frame(&self, frame: &[u8], except: Option<ConnectionHandle>) -> Result<(), LinkError>;

    /// Begins advertising the mesh service identifier and scanning for
    /// peers doing the same.
    fn start_services(&self) -> Result<(), LinkError>;

    /// Stops advertising/scanning and tears down connections.
    fn stop_services(&self) -> Result<(), LinkError>;
}

/// Inbound frame delivered by the adapter: which connection it arrived on,
/// and the raw bytes (pre fragmentation-reassembly).
pub struct InboundFrame {
    pub connection: ConnectionHandle,
    pub bytes: Vec<u8>,
}

/// Events surfaced upward to the UI/view-model (§6). Only user-addressable
/// outcomes reach this boundary; routing, codec, and cover-traffic failures
/// stay inside the core (§7 propagation policy).
#[derive(Debug, Clone)]
pub enum DelegateEvent {
    PeerDiscovered {
        peer_id: PeerId,
        nickname: Option<String>,
        rssi: Option<i8>,
    },
    PeerConnected {
        peer_id: PeerId,
    },
    PeerDisconnected {
        peer_id: PeerId,
    },
    PeerAuthenticated {
        peer_id: PeerId,
        fingerprint: Fingerprint,
    },
    MessageReceived {
        message: DeliveredMessage,
    },
    PrivateMessageReceived {
        message: DeliveredMessage,
    },
    DeliveryAck {
        message_id: u32,
        peer_id: PeerId,
    },
    ReadReceipt {
        message_id: u32,
        peer_id: PeerId,
    },
    NetworkStatusChanged {
        connected_peers: usize,
        active_peers: usize,
    },
    SendFailed {
        peer_id: PeerId,
        reason: String,
    },
    /// Message types the core routes but does not interpret: version
    /// negotiation, channel key verification/metadata, and ZK proof
    /// exchange all belong to collaborators outside the mesh core (§1).
    OpaqueMessage {
        message_type: u8,
        peer_id: PeerId,
        payload: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub message_id: u32,
    pub sender_id: PeerId,
    pub sender_nickname: Option<String>,
    pub content: String,
    pub timestamp_millis: u64,
    pub channel: Option<String>,
}

/// Consumed by the engine to push events upward and to query host state
/// that the engine itself doesn't own (current nickname, current PeerId).
pub trait Delegate: Send + Sync {
    fn on_event(&self, event: DelegateEvent);
    fn current_nickname(&self) -> Option<String>;
    fn current_user_id(&self) -> PeerId;
}
