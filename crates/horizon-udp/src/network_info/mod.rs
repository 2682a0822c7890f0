//! Network interface enumeration and the policy that picks a socket's
//! multicast interface.

mod interface;
mod selector;

pub use interface::NetworkInterface;
pub use selector::{ByName, DefaultRouteSelector, FirstNonLoopback, InterfaceSelector, LoopbackOnly};
