//! Interface selection policies.
//!
//! The interface chosen here is used for `IP_MULTICAST_IF` on new sockets, for
//! multicast group membership, and for the addresses reported by
//! [`UdpService::create`](crate::UdpService::create). Picking "the" interface
//! of a host is a heuristic, so it is a policy the application can replace.

use std::fmt;

use super::interface::NetworkInterface;

/// Chooses the network interface a socket uses for multicast.
pub trait InterfaceSelector: Send + Sync + fmt::Debug {
    /// Pick an interface from `interfaces`, or `None` to use the OS default.
    fn select(&self, interfaces: &[NetworkInterface]) -> Option<NetworkInterface>;
}

/// The interface carrying the OS default route, falling back to
/// [`FirstNonLoopback::default`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRouteSelector;

impl InterfaceSelector for DefaultRouteSelector {
    fn select(&self, interfaces: &[NetworkInterface]) -> Option<NetworkInterface> {
        NetworkInterface::default_index()
            .and_then(|index| interfaces.iter().find(|iface| iface.index == index))
            .filter(|iface| !iface.is_loopback && iface.address_count() > 0)
            .cloned()
            .or_else(|| FirstNonLoopback::default().select(interfaces))
    }
}

/// The first interface that is up, not loopback, and has at least
/// `min_addresses` addresses.
///
/// `min_addresses: 2` reproduces the classic mobile heuristic of requiring
/// both an IPv4 and an IPv6 address.
#[derive(Debug, Clone, Copy)]
pub struct FirstNonLoopback {
    /// Minimum number of addresses (either family) the interface must have.
    pub min_addresses: usize,
}

impl Default for FirstNonLoopback {
    fn default() -> Self {
        Self { min_addresses: 1 }
    }
}

impl InterfaceSelector for FirstNonLoopback {
    fn select(&self, interfaces: &[NetworkInterface]) -> Option<NetworkInterface> {
        interfaces
            .iter()
            .find(|iface| {
                iface.is_up && !iface.is_loopback && iface.address_count() >= self.min_addresses
            })
            .cloned()
    }
}

/// The interface with the given name.
#[derive(Debug, Clone)]
pub struct ByName(pub String);

impl InterfaceSelector for ByName {
    fn select(&self, interfaces: &[NetworkInterface]) -> Option<NetworkInterface> {
        interfaces.iter().find(|iface| iface.name == self.0).cloned()
    }
}

/// The loopback interface. Keeps multicast on the local host.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackOnly;

impl InterfaceSelector for LoopbackOnly {
    fn select(&self, interfaces: &[NetworkInterface]) -> Option<NetworkInterface> {
        interfaces.iter().find(|iface| iface.is_loopback).cloned()
    }
}
