//! Multicast sub-state and its dedicated reader thread.
//!
//! Multicast reception uses a second, blocking socket bound to the same local
//! port as the primary channel. It is read by one thread per socket, outside
//! the event loop's poll. Once a socket has this state it keeps it until close.

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};

use super::{DeliveryPath, SocketHandle, SocketId};
use crate::error::{Result, UdpError};
use crate::logging::targets;
use crate::network_info::NetworkInterface;
use crate::sink::ReceiveEvent;

/// Secondary multicast socket, group membership and reader lifecycle.
pub(crate) struct MulticastState {
    socket_id: SocketId,
    socket: Mutex<Option<Arc<StdUdpSocket>>>,
    ipv6: bool,
    interface: Option<NetworkInterface>,
    groups: Mutex<HashSet<IpAddr>>,
    loopback: AtomicBool,
    ttl: Mutex<Option<u32>>,
    bound: AtomicBool,
    reader: Mutex<Option<MulticastReader>>,
}

impl MulticastState {
    /// Open the blocking multicast socket. Loopback delivery starts enabled.
    pub(crate) fn open(
        socket_id: SocketId,
        ipv6: bool,
        interface: Option<NetworkInterface>,
        poll_interval: Duration,
    ) -> io::Result<Self> {
        let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_read_timeout(Some(poll_interval))?;
        if ipv6 {
            socket.set_multicast_loop_v6(true)?;
        } else {
            socket.set_multicast_loop_v4(true)?;
            if let Some(addr) = interface.as_ref().and_then(|i| i.first_ipv4())
                && let Err(e) = socket.set_multicast_if_v4(&addr)
            {
                tracing::warn!(target: targets::MULTICAST, socket = %socket_id, %addr, "Failed to set multicast interface: {}", e);
            }
        }

        tracing::debug!(target: targets::MULTICAST, socket = %socket_id, ipv6, "Upgraded socket to multicast");

        Ok(Self {
            socket_id,
            socket: Mutex::new(Some(Arc::new(socket.into()))),
            ipv6,
            interface,
            groups: Mutex::new(HashSet::new()),
            loopback: AtomicBool::new(true),
            ttl: Mutex::new(None),
            bound: AtomicBool::new(false),
            reader: Mutex::new(None),
        })
    }

    /// Take over the options and memberships of a state opened for the other
    /// address family, then close it. Groups the new family cannot join are
    /// dropped with a warning.
    pub(crate) fn carry_over(&self, previous: &MulticastState) {
        if let Some(ttl) = *previous.ttl.lock()
            && let Err(e) = self.set_ttl(ttl)
        {
            tracing::warn!(target: targets::MULTICAST, socket = %self.socket_id, ttl, "Failed to carry over multicast TTL: {}", e);
        }
        if !previous.loopback()
            && let Err(e) = self.set_loopback(false)
        {
            tracing::warn!(target: targets::MULTICAST, socket = %self.socket_id, "Failed to carry over multicast loopback: {}", e);
        }
        for group in previous.groups() {
            if let Err(e) = self.join(group) {
                tracing::warn!(target: targets::MULTICAST, socket = %self.socket_id, %group, "Dropping membership after family change: {}", e);
            }
        }
        previous.close();
    }

    pub(crate) fn is_ipv6(&self) -> bool {
        self.ipv6
    }

    fn socket(&self) -> Result<Arc<StdUdpSocket>> {
        self.socket
            .lock()
            .clone()
            .ok_or_else(|| UdpError::invalid_state("multicast socket is closed"))
    }

    /// Bind to `port` on the unspecified address. A second call is a no-op.
    pub(crate) fn bind(&self, port: u16) -> Result<()> {
        if self.bound.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let addr: SocketAddr = if self.ipv6 {
            (Ipv6Addr::UNSPECIFIED, port).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, port).into()
        };
        let result = self
            .socket()
            .and_then(|socket| Ok(SockRef::from(&*socket).bind(&SockAddr::from(addr))?));
        match result {
            Ok(()) => {
                tracing::debug!(target: targets::MULTICAST, socket = %self.socket_id, %addr, "Bound multicast socket");
                Ok(())
            }
            Err(e) => {
                self.bound.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    fn interface_v4(&self) -> Ipv4Addr {
        self.interface
            .as_ref()
            .and_then(|iface| iface.first_ipv4())
            .unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    fn interface_index(&self) -> u32 {
        self.interface.as_ref().map(|iface| iface.index).unwrap_or(0)
    }

    /// Join `group`. Returns `false` if it was already joined.
    pub(crate) fn join(&self, group: IpAddr) -> Result<bool> {
        let mut groups = self.groups.lock();
        if groups.contains(&group) {
            tracing::warn!(target: targets::MULTICAST, socket = %self.socket_id, %group, "Attempted to join an already joined multicast group");
            return Ok(false);
        }
        let socket = self.socket()?;
        match group {
            IpAddr::V4(group) => socket.join_multicast_v4(&group, &self.interface_v4())?,
            IpAddr::V6(group) => socket.join_multicast_v6(&group, self.interface_index())?,
        }
        groups.insert(group);
        tracing::debug!(target: targets::MULTICAST, socket = %self.socket_id, %group, "Joined multicast group");
        Ok(true)
    }

    /// Leave `group`. Returns `false` if it was not a member.
    pub(crate) fn leave(&self, group: IpAddr) -> Result<bool> {
        let mut groups = self.groups.lock();
        if !groups.contains(&group) {
            return Ok(false);
        }
        let socket = self.socket()?;
        match group {
            IpAddr::V4(group) => socket.leave_multicast_v4(&group, &self.interface_v4())?,
            IpAddr::V6(group) => socket.leave_multicast_v6(&group, self.interface_index())?,
        }
        groups.remove(&group);
        tracing::debug!(target: targets::MULTICAST, socket = %self.socket_id, %group, "Left multicast group");
        Ok(true)
    }

    /// Joined groups, sorted.
    pub(crate) fn groups(&self) -> Vec<IpAddr> {
        let mut groups: Vec<_> = self.groups.lock().iter().copied().collect();
        groups.sort();
        groups
    }

    pub(crate) fn set_ttl(&self, ttl: u32) -> Result<()> {
        let socket = self.socket()?;
        if self.ipv6 {
            SockRef::from(&*socket).set_multicast_hops_v6(ttl)?;
        } else {
            socket.set_multicast_ttl_v4(ttl)?;
        }
        *self.ttl.lock() = Some(ttl);
        Ok(())
    }

    /// Enable or disable loopback delivery; returns the state the OS reports.
    pub(crate) fn set_loopback(&self, enabled: bool) -> Result<bool> {
        let socket = self.socket()?;
        let effective = if self.ipv6 {
            socket.set_multicast_loop_v6(enabled)?;
            socket.multicast_loop_v6()?
        } else {
            socket.set_multicast_loop_v4(enabled)?;
            socket.multicast_loop_v4()?
        };
        self.loopback.store(enabled, Ordering::Release);
        Ok(effective)
    }

    pub(crate) fn loopback(&self) -> bool {
        self.loopback.load(Ordering::Acquire)
    }

    /// Start the reader thread unless one is running.
    pub(crate) fn ensure_reader(self: &Arc<Self>, owner: &Arc<SocketHandle>) -> Result<()> {
        let mut slot = self.reader.lock();
        if slot.as_ref().is_some_and(|reader| reader.is_running()) {
            return Ok(());
        }
        // A previous reader that stopped itself on pause has already exited.
        if let Some(finished) = slot.take() {
            finished.join();
        }

        let socket = self.socket()?;
        let stop = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));
        let ctx = ReaderContext {
            owner: Arc::downgrade(owner),
            state: Arc::downgrade(self),
            socket,
            stop: stop.clone(),
            running: running.clone(),
        };

        let thread = thread::Builder::new()
            .name(format!("horizon-udp-mcast-{}", self.socket_id))
            .spawn(move || ctx.run());
        match thread {
            Ok(thread) => {
                *slot = Some(MulticastReader {
                    stop,
                    running,
                    thread: Some(thread),
                });
                Ok(())
            }
            Err(e) => {
                running.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Read whatever queued up on the multicast socket while no reader was
    /// running and return the newest datagram `keep` accepts.
    ///
    /// Does nothing while a reader is alive, since that reader still owns
    /// the socket.
    pub(crate) fn take_latest(
        &self,
        buffer_size: usize,
        keep: impl Fn(&SocketAddr) -> bool,
    ) -> Result<Option<(Vec<u8>, SocketAddr)>> {
        let slot = self.reader.lock();
        if !self.is_bound() || slot.as_ref().is_some_and(|reader| reader.is_running()) {
            return Ok(None);
        }
        let socket = self.socket()?;
        socket.set_nonblocking(true)?;
        let mut buf = vec![0u8; buffer_size];
        let mut latest = None;
        let mut discarded = 0usize;
        let drained = loop {
            match socket.recv_from(&mut buf) {
                Ok((n, source)) if keep(&source) => {
                    if latest.replace((buf[..n].to_vec(), source)).is_some() {
                        discarded += 1;
                    }
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => break Err(e),
            }
        };
        socket.set_nonblocking(false)?;
        drained?;
        if discarded > 0 {
            tracing::debug!(target: targets::MULTICAST, socket = %self.socket_id, discarded, "Discarded multicast datagrams received while paused");
        }
        Ok(latest)
    }

    #[cfg(test)]
    pub(crate) fn reader_running(&self) -> bool {
        self.reader
            .lock()
            .as_ref()
            .is_some_and(|reader| reader.is_running())
    }

    /// Stop the reader, wait for it, and release the multicast socket. Safe to
    /// call more than once.
    pub(crate) fn close(&self) {
        let reader = self.reader.lock().take();
        if let Some(mut reader) = reader {
            reader.stop.store(true, Ordering::Release);
            reader.join_mut();
        }
        if self.socket.lock().take().is_some() {
            tracing::debug!(target: targets::MULTICAST, socket = %self.socket_id, "Closed multicast socket");
        }
    }
}

/// Handle on a running (or finished) reader thread.
struct MulticastReader {
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MulticastReader {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn join(mut self) {
        self.join_mut();
    }

    fn join_mut(&mut self) {
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!(target: targets::MULTICAST, "Multicast reader thread panicked");
        }
    }
}

/// Everything a reader thread needs. Holds its owner weakly so an abandoned
/// socket does not keep its reader alive.
struct ReaderContext {
    owner: Weak<SocketHandle>,
    state: Weak<MulticastState>,
    socket: Arc<StdUdpSocket>,
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl ReaderContext {
    fn run(self) {
        let mut buf = Vec::new();
        while !self.stop.load(Ordering::Acquire) {
            let (Some(owner), Some(state)) = (self.owner.upgrade(), self.state.upgrade()) else {
                break;
            };
            if owner.is_paused() {
                // Decided under the slot lock so a concurrent resume either
                // sees this reader still running or sees it gone.
                let _slot = state.reader.lock();
                if owner.is_paused() {
                    tracing::debug!(target: targets::MULTICAST, socket = %owner.id(), "Socket paused, multicast reader exiting");
                    self.running.store(false, Ordering::Release);
                    break;
                }
            }

            buf.resize(owner.buffer_size(), 0);
            match self.socket.recv_from(&mut buf) {
                Ok((n, source)) => {
                    let event = ReceiveEvent::new(owner.id(), buf[..n].to_vec(), source);
                    if owner.is_looped_back(state.loopback(), event.remote_address) {
                        tracing::trace!(target: targets::MULTICAST, socket = %owner.id(), %source, "Dropping looped-back multicast datagram");
                        continue;
                    }
                    tracing::trace!(target: targets::MULTICAST, socket = %owner.id(), %source, len = n, "Multicast datagram received");
                    owner.deliver(event, DeliveryPath::Multicast);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    if self.stop.load(Ordering::Acquire) {
                        break;
                    }
                    owner.deliver_error(&e);
                }
            }
        }
        self.running.store(false, Ordering::Release);
    }
}
