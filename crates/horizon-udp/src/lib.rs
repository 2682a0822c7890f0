//! UDP socket service for Horizon applications.
//!
//! This crate drives many non-blocking UDP sockets from a single event loop
//! thread, for callers that cannot block on I/O themselves:
//!
//! - **Sockets by id**: create, bind, send, pause/resume and close through
//!   [`UdpService`] using plain [`SocketId`]s
//! - **Queued sends**: datagrams are sent in submission order and each result
//!   is reported once through a [`Pending`] handle
//! - **Multicast**: group membership, TTL and loopback, received on a
//!   dedicated reader thread per socket
//! - **Broadcast**: per-socket `SO_BROADCAST`
//!
//! # Getting Started
//!
//! ```no_run
//! use std::sync::Arc;
//! use horizon_udp::{ChannelSink, ServiceConfig, SocketEvent, SocketProperties, UdpService};
//!
//! let (sink, events) = ChannelSink::new();
//! let service = UdpService::new(ServiceConfig::default(), Arc::new(sink));
//! service.start()?;
//!
//! let socket = service.create(SocketProperties::default())?.socket_id;
//! let local = service.bind(socket, "0.0.0.0", 0)?.wait()?;
//! println!("listening on {local}");
//!
//! for event in events.iter() {
//!     match event {
//!         SocketEvent::Receive(datagram) => {
//!             println!("{} bytes from {}", datagram.data.len(), datagram.source());
//!         }
//!         SocketEvent::ReceiveError(error) => {
//!             eprintln!("socket {}: {} ({})", error.socket_id, error.message, error.code);
//!         }
//!     }
//! }
//! # Ok::<(), horizon_udp::UdpError>(())
//! ```
//!
//! # Threads
//!
//! The event loop thread owns every poller registration; caller threads only
//! post commands to it. A socket that joins a multicast group also gets a
//! reader thread, which delivers through the same per-socket path so the
//! [`EventSink`] never sees two concurrent deliveries for one socket.
//!
//! # Multicast Interface
//!
//! The interface used for outgoing multicast and for the addresses reported
//! by [`UdpService::create`] comes from a pluggable
//! [`InterfaceSelector`](network_info::InterfaceSelector), configured through
//! [`ServiceConfig`].

mod completion;
mod config;
mod error;
mod event_loop;
pub mod logging;
pub mod network_info;
mod queue;
mod registry;
mod service;
mod sink;
mod socket;

pub use completion::{Pending, Responder, completion};
pub use config::{
    CreatedSocket, DEFAULT_BUFFER_SIZE, ServiceConfig, ServiceConfigBuilder, SocketInfo,
    SocketProperties,
};
pub use error::{Result, UdpError};
pub use service::UdpService;
pub use sink::{
    ChannelSink, EventSink, ReceiveErrorEvent, ReceiveEvent, SocketEvent, UNKNOWN_ERROR_CODE,
};
pub use socket::SocketId;
