//! Configuration and property types.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network_info::{DefaultRouteSelector, InterfaceSelector};
use crate::socket::SocketId;

/// Default receive/send buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default number of readiness events handled per poll.
const DEFAULT_EVENTS_CAPACITY: usize = 256;

/// Default read timeout of a multicast reader's blocking receive.
const DEFAULT_MULTICAST_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for a [`UdpService`](crate::UdpService).
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Name of the event loop thread.
    pub thread_name: String,
    /// Number of readiness events collected per poll.
    pub events_capacity: usize,
    /// Buffer size for sockets created without an explicit `buffer_size`.
    pub default_buffer_size: usize,
    /// Read timeout of the blocking multicast receive. Bounds how long a
    /// close or pause takes to stop a multicast reader.
    pub multicast_poll_interval: Duration,
    /// Policy choosing the interface used for multicast and reported addresses.
    pub interface_selector: Arc<dyn InterfaceSelector>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            thread_name: "horizon-udp-loop".to_string(),
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            default_buffer_size: DEFAULT_BUFFER_SIZE,
            multicast_poll_interval: DEFAULT_MULTICAST_POLL_INTERVAL,
            interface_selector: Arc::new(DefaultRouteSelector),
        }
    }
}

impl ServiceConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::default()
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug, Default)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    /// Set the event loop thread name.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Set the number of readiness events collected per poll.
    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.config.events_capacity = capacity.max(1);
        self
    }

    /// Set the buffer size used when a socket is created without one.
    pub fn default_buffer_size(mut self, size: usize) -> Self {
        self.config.default_buffer_size = size;
        self
    }

    /// Set the multicast reader's receive timeout.
    pub fn multicast_poll_interval(mut self, interval: Duration) -> Self {
        self.config.multicast_poll_interval = interval;
        self
    }

    /// Set the interface selection policy.
    pub fn interface_selector(mut self, selector: impl InterfaceSelector + 'static) -> Self {
        self.config.interface_selector = Arc::new(selector);
        self
    }

    /// Finish building.
    pub fn build(self) -> ServiceConfig {
        self.config
    }
}

/// Partial update of a socket's caller-controlled properties.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketProperties {
    /// Opaque caller-assigned label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Receive/send buffer size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<usize>,
}

impl SocketProperties {
    /// Properties that change nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the buffer size.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }
}

/// Snapshot of a socket's state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketInfo {
    /// Socket id.
    pub socket_id: SocketId,
    /// Receive/send buffer size in bytes.
    pub buffer_size: usize,
    /// Caller-assigned label.
    pub name: String,
    /// Whether delivery is paused.
    pub paused: bool,
    /// Local address, once bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_address: Option<IpAddr>,
    /// Local port, once bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
}

/// Result of creating a socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSocket {
    /// Id of the new socket.
    pub socket_id: SocketId,
    /// IPv4 address of the selected interface (loopback when none).
    pub ipv4: Ipv4Addr,
    /// IPv6 address of the selected interface (loopback when none).
    pub ipv6: Ipv6Addr,
}
