//! Per-socket state: the non-blocking channel, outbound queue, pause state
//! and the optional multicast sub-state.
//!
//! A socket moves through `created → bound → closed`, and may be upgraded to
//! multicast at any point before close. The upgrade is one-way.

mod channel;
mod handle;
mod multicast;

use std::fmt;

use serde::{Deserialize, Serialize};

pub(crate) use handle::{DeliveryPath, ReadOutcome, SocketHandle, SocketOptions, WriteOutcome};

/// Identity of a socket within one [`UdpService`](crate::UdpService).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SocketId(u32);

impl SocketId {
    /// Wrap a raw id value.
    pub const fn from_raw(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw id value.
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Poll token for this socket.
    pub(crate) fn token(&self) -> mio::Token {
        mio::Token(self.0 as usize)
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
pub(crate) fn test_socket(sink: std::sync::Arc<dyn crate::sink::EventSink>) -> std::sync::Arc<SocketHandle> {
    test_socket_with_id(SocketId::from_raw(0), sink)
}

#[cfg(test)]
pub(crate) fn test_socket_with_id(
    id: SocketId,
    sink: std::sync::Arc<dyn crate::sink::EventSink>,
) -> std::sync::Arc<SocketHandle> {
    SocketHandle::create(
        id,
        &crate::config::SocketProperties::default(),
        SocketOptions::for_tests(),
        sink,
    )
    .expect("failed to create test socket")
}
