//! Network interface information.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// A network interface on the system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    /// Interface name (e.g., "eth0", "en0", "Wi-Fi").
    pub name: String,
    /// Interface index, as used for IPv6 multicast membership.
    pub index: u32,
    /// Whether the interface is currently up.
    pub is_up: bool,
    /// Whether this is a loopback interface.
    pub is_loopback: bool,
    /// IPv4 addresses assigned to this interface.
    pub ipv4_addresses: Vec<Ipv4Addr>,
    /// IPv6 addresses assigned to this interface.
    pub ipv6_addresses: Vec<Ipv6Addr>,
}

impl NetworkInterface {
    /// Get all network interfaces on the system.
    pub fn list() -> Vec<NetworkInterface> {
        netdev::get_interfaces()
            .into_iter()
            .map(NetworkInterface::from)
            .collect()
    }

    /// Index of the interface carrying the default route, if the OS reports one.
    pub fn default_index() -> Option<u32> {
        netdev::get_default_interface().ok().map(|iface| iface.index)
    }

    /// Get all IP addresses (both v4 and v6) for this interface.
    pub fn all_addresses(&self) -> Vec<IpAddr> {
        let mut addrs: Vec<IpAddr> = self
            .ipv4_addresses
            .iter()
            .map(|addr| IpAddr::V4(*addr))
            .collect();
        addrs.extend(self.ipv6_addresses.iter().map(|addr| IpAddr::V6(*addr)));
        addrs
    }

    /// Number of addresses of either family.
    pub fn address_count(&self) -> usize {
        self.ipv4_addresses.len() + self.ipv6_addresses.len()
    }

    /// First usable IPv4 address. Loopback addresses only count on a
    /// loopback interface.
    pub fn first_ipv4(&self) -> Option<Ipv4Addr> {
        self.ipv4_addresses
            .iter()
            .copied()
            .find(|addr| self.is_loopback || !addr.is_loopback())
    }

    /// First usable IPv6 address. Loopback addresses only count on a
    /// loopback interface.
    pub fn first_ipv6(&self) -> Option<Ipv6Addr> {
        self.ipv6_addresses
            .iter()
            .copied()
            .find(|addr| self.is_loopback || !addr.is_loopback())
    }
}

impl From<netdev::Interface> for NetworkInterface {
    fn from(iface: netdev::Interface) -> Self {
        NetworkInterface {
            name: iface.name.clone(),
            index: iface.index,
            is_up: iface.is_up(),
            is_loopback: iface.is_loopback(),
            ipv4_addresses: iface.ipv4.iter().map(|net| net.addr()).collect(),
            ipv6_addresses: iface.ipv6.iter().map(|net| net.addr()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(v4: &[&str], v6: &[&str]) -> NetworkInterface {
        NetworkInterface {
            name: "test0".into(),
            index: 3,
            is_up: true,
            is_loopback: false,
            ipv4_addresses: v4.iter().map(|a| a.parse().unwrap()).collect(),
            ipv6_addresses: v6.iter().map(|a| a.parse().unwrap()).collect(),
        }
    }

    #[test]
    fn test_all_addresses_v4_first() {
        let iface = iface(&["10.0.0.2"], &["fe80::2"]);
        let addrs = iface.all_addresses();
        assert_eq!(addrs.len(), 2);
        assert!(addrs[0].is_ipv4());
        assert!(addrs[1].is_ipv6());
        assert_eq!(iface.address_count(), 2);
    }

    #[test]
    fn test_first_addresses_skip_loopback() {
        let iface = iface(&["127.0.0.1", "192.168.0.4"], &["::1", "fe80::4"]);
        assert_eq!(iface.first_ipv4(), Some("192.168.0.4".parse().unwrap()));
        assert_eq!(iface.first_ipv6(), Some("fe80::4".parse().unwrap()));
    }

    #[test]
    fn test_loopback_interface_uses_loopback_addresses() {
        let mut lo = iface(&["127.0.0.1"], &["::1"]);
        assert_eq!(lo.first_ipv4(), None);
        lo.is_loopback = true;
        assert_eq!(lo.first_ipv4(), Some(Ipv4Addr::LOCALHOST));
        assert_eq!(lo.first_ipv6(), Some(Ipv6Addr::LOCALHOST));
    }

    #[test]
    fn test_list_contains_loopback() {
        // Only checks that enumeration works; isolated hosts may have nothing else.
        let interfaces = NetworkInterface::list();
        if !interfaces.is_empty() {
            assert!(interfaces.iter().any(|i| i.is_loopback || i.is_up));
        }
    }
}
