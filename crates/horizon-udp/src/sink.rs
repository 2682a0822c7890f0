//! Delivery of received datagrams and receive errors.
//!
//! Both the event loop and a socket's multicast reader deliver through the
//! same [`EventSink`]. The service serializes deliveries per socket, so a
//! sink sees at most one call at a time for a given socket id. Sinks must not
//! call back into the service for the same socket from inside a delivery.

use std::net::{IpAddr, SocketAddr};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::socket::SocketId;

/// Error code reported when a receive error carries no OS code.
pub const UNKNOWN_ERROR_CODE: i32 = -2;

/// A datagram received on a socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiveEvent {
    /// The socket that received the datagram.
    pub socket_id: SocketId,
    /// The datagram payload.
    pub data: Vec<u8>,
    /// Address of the sender.
    pub remote_address: IpAddr,
    /// Port of the sender.
    pub remote_port: u16,
}

impl ReceiveEvent {
    /// Create a receive event from a payload and its source address.
    ///
    /// IPv4-mapped IPv6 sources are reported as IPv4.
    pub fn new(socket_id: SocketId, data: Vec<u8>, source: SocketAddr) -> Self {
        Self {
            socket_id,
            data,
            remote_address: source.ip().to_canonical(),
            remote_port: source.port(),
        }
    }

    /// The sender as a socket address.
    pub fn source(&self) -> SocketAddr {
        SocketAddr::new(self.remote_address, self.remote_port)
    }
}

/// A failed receive on a socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiveErrorEvent {
    /// The socket whose receive failed.
    pub socket_id: SocketId,
    /// Human-readable description.
    pub message: String,
    /// OS error code, or [`UNKNOWN_ERROR_CODE`].
    pub code: i32,
}

impl ReceiveErrorEvent {
    /// Build an error event from an I/O error.
    pub fn from_io(socket_id: SocketId, err: &std::io::Error) -> Self {
        Self {
            socket_id,
            message: err.to_string(),
            code: err.raw_os_error().unwrap_or(UNKNOWN_ERROR_CODE),
        }
    }
}

/// Receiver of socket events.
pub trait EventSink: Send + Sync {
    /// A datagram arrived.
    fn receive(&self, event: ReceiveEvent);

    /// A receive failed.
    fn receive_error(&self, event: ReceiveErrorEvent);
}

/// Events as carried by [`ChannelSink`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketEvent {
    /// See [`EventSink::receive`].
    Receive(ReceiveEvent),
    /// See [`EventSink::receive_error`].
    ReceiveError(ReceiveErrorEvent),
}

impl SocketEvent {
    /// The socket this event belongs to.
    pub fn socket_id(&self) -> SocketId {
        match self {
            Self::Receive(event) => event.socket_id,
            Self::ReceiveError(event) => event.socket_id,
        }
    }
}

/// A sink that forwards every event into an unbounded channel.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: Sender<SocketEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver its events arrive on.
    pub fn new() -> (Self, Receiver<SocketEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    fn forward(&self, event: SocketEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!(target: crate::logging::targets::UDP, "Event receiver dropped, discarding event");
        }
    }
}

impl EventSink for ChannelSink {
    fn receive(&self, event: ReceiveEvent) {
        self.forward(SocketEvent::Receive(event));
    }

    fn receive_error(&self, event: ReceiveErrorEvent) {
        self.forward(SocketEvent::ReceiveError(event));
    }
}
