//! The socket handle shared between caller threads, the event loop and the
//! multicast reader.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::{Interest, Registry};
use parking_lot::Mutex;

use super::SocketId;
use super::channel::{Channel, set_buffer_sizes};
use super::multicast::MulticastState;
use crate::completion::Responder;
use crate::config::{SocketInfo, SocketProperties};
use crate::error::{Result, UdpError};
use crate::logging::targets;
use crate::network_info::NetworkInterface;
use crate::sink::{EventSink, ReceiveErrorEvent, ReceiveEvent};

/// Service-wide settings a socket is created with.
#[derive(Clone, Debug)]
pub(crate) struct SocketOptions {
    pub(crate) default_buffer_size: usize,
    pub(crate) multicast_poll_interval: Duration,
    pub(crate) interface: Option<NetworkInterface>,
}

impl SocketOptions {
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            default_buffer_size: crate::config::DEFAULT_BUFFER_SIZE,
            multicast_poll_interval: Duration::from_millis(20),
            interface: None,
        }
    }
}

/// Which path a datagram arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DeliveryPath {
    /// Read by the event loop from the primary channel.
    EventLoop,
    /// Read by the socket's multicast reader thread.
    Multicast,
}

/// What the event loop should do after a readable event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// Everything pending was read.
    Drained,
    /// The socket is paused; stop polling readability.
    Paused,
    /// A read failed; re-arm readiness so remaining datagrams are not stranded.
    Rearm,
}

/// What the event loop should do after a writable event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    /// The outbound queue is empty; stop polling writability.
    Drained,
    /// The OS buffer is full; keep polling writability.
    Blocked,
}

/// A queued datagram and whoever waits for its result.
pub(crate) struct SendRequest {
    target: SocketAddr,
    payload: Vec<u8>,
    responder: Option<Responder<usize>>,
}

impl SendRequest {
    fn resolve(self, sent: usize) {
        if let Some(responder) = self.responder {
            responder.resolve(sent);
        }
    }

    fn fail(self, err: UdpError) {
        if let Some(responder) = self.responder {
            responder.fail(err);
        }
    }
}

struct Settings {
    name: String,
    buffer_size: usize,
    broadcast: bool,
}

/// The node's own addresses as reported on create.
#[derive(Clone, Copy, Debug)]
struct LocalAddresses {
    ipv4: Ipv4Addr,
    ipv6: Ipv6Addr,
}

/// One UDP socket.
///
/// Registration with the poller and the interest set live in the event loop,
/// not here; this type only offers the operations the loop drives.
pub(crate) struct SocketHandle {
    id: SocketId,
    channel: Mutex<Channel>,
    settings: Mutex<Settings>,
    bound: AtomicBool,
    paused: AtomicBool,
    closed: AtomicBool,
    outbound: Mutex<VecDeque<SendRequest>>,
    multicast: Mutex<Option<Arc<MulticastState>>>,
    /// Serializes deliveries to the sink and holds the single datagram kept
    /// from the multicast path while paused.
    delivery: Mutex<Option<ReceiveEvent>>,
    sink: Arc<dyn EventSink>,
    local: LocalAddresses,
    interface: Option<NetworkInterface>,
    multicast_poll_interval: Duration,
}

impl SocketHandle {
    /// Open the primary channel and apply `properties`.
    pub(crate) fn create(
        id: SocketId,
        properties: &SocketProperties,
        options: SocketOptions,
        sink: Arc<dyn EventSink>,
    ) -> Result<Arc<Self>> {
        let local = LocalAddresses {
            ipv4: options
                .interface
                .as_ref()
                .and_then(|iface| iface.first_ipv4())
                .unwrap_or(Ipv4Addr::LOCALHOST),
            ipv6: options
                .interface
                .as_ref()
                .and_then(|iface| iface.first_ipv6())
                .unwrap_or(Ipv6Addr::LOCALHOST),
        };
        let handle = Self {
            id,
            channel: Mutex::new(Channel::Closed),
            settings: Mutex::new(Settings {
                name: properties.name.clone().unwrap_or_default(),
                buffer_size: properties.buffer_size.unwrap_or(options.default_buffer_size),
                broadcast: false,
            }),
            bound: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            outbound: Mutex::new(VecDeque::new()),
            multicast: Mutex::new(None),
            delivery: Mutex::new(None),
            sink,
            local,
            interface: options.interface,
            multicast_poll_interval: options.multicast_poll_interval,
        };

        let socket = Channel::open(false)?;
        handle.configure(&socket, false)?;
        *handle.channel.lock() = Channel::Unbound {
            socket,
            ipv6: false,
        };

        tracing::debug!(target: targets::SOCKET, socket = %id, "Created socket");
        Ok(Arc::new(handle))
    }

    /// Apply stored options to a freshly opened channel.
    fn configure(&self, socket: &std::net::UdpSocket, ipv6: bool) -> io::Result<()> {
        let sock = socket2::SockRef::from(socket);
        let (buffer_size, broadcast) = {
            let settings = self.settings.lock();
            (settings.buffer_size, settings.broadcast)
        };
        set_buffer_sizes(&sock, buffer_size)?;
        if broadcast {
            sock.set_broadcast(true)?;
        }
        // Group traffic belongs to the multicast socket; the primary channel
        // only sees groups it joined itself, which is none.
        #[cfg(target_os = "linux")]
        {
            let applied = if ipv6 {
                sock.set_multicast_all_v6(false)
            } else {
                sock.set_multicast_all_v4(false)
            };
            if let Err(e) = applied {
                tracing::warn!(target: targets::SOCKET, socket = %self.id, ipv6, "Failed to limit multicast delivery to joined groups: {}", e);
            }
        }
        if let Some(iface) = &self.interface {
            let applied = if ipv6 {
                sock.set_multicast_if_v6(iface.index)
            } else if let Some(addr) = iface.first_ipv4() {
                sock.set_multicast_if_v4(&addr)
            } else {
                Ok(())
            };
            if let Err(e) = applied {
                tracing::warn!(target: targets::SOCKET, socket = %self.id, interface = %iface.name, "Failed to set multicast interface: {}", e);
            }
        }
        Ok(())
    }

    pub(crate) fn id(&self) -> SocketId {
        self.id
    }

    pub(crate) fn ipv4(&self) -> Ipv4Addr {
        self.local.ipv4
    }

    pub(crate) fn ipv6(&self) -> Ipv6Addr {
        self.local.ipv6
    }

    fn is_own_address(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => v4 == self.local.ipv4,
            IpAddr::V6(v6) => v6 == self.local.ipv6,
        }
    }

    /// Whether a multicast datagram from `source` is this node's own traffic
    /// that must be dropped because loopback is off.
    pub(crate) fn is_looped_back(&self, loopback_enabled: bool, source: IpAddr) -> bool {
        !loopback_enabled && self.is_own_address(source.to_canonical())
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    pub(crate) fn mark_bound(&self) {
        self.bound.store(true, Ordering::Release);
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn buffer_size(&self) -> usize {
        self.settings.lock().buffer_size
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(UdpError::invalid_state(format!("socket {} is closed", self.id)))
        } else {
            Ok(())
        }
    }

    /// Update name and/or buffer size. A new buffer size is applied to the OS
    /// socket immediately, bound or not.
    pub(crate) fn set_properties(&self, properties: &SocketProperties) -> Result<()> {
        self.ensure_open()?;
        if let Some(size) = properties.buffer_size {
            let channel = self.channel.lock();
            set_buffer_sizes(&channel.sock_ref()?, size)?;
            self.settings.lock().buffer_size = size;
        }
        if let Some(name) = &properties.name {
            self.settings.lock().name = name.clone();
        }
        Ok(())
    }

    /// Pause or resume delivery.
    ///
    /// Pausing takes effect lazily on the event loop. Resuming delivers the
    /// newest multicast datagram that arrived while paused, then restarts the
    /// multicast reader. The caller must still ask the loop to re-add read
    /// interest.
    pub(crate) fn set_paused(self: &Arc<Self>, paused: bool) -> Result<()> {
        self.ensure_open()?;
        if paused {
            self.paused.store(true, Ordering::Release);
            tracing::debug!(target: targets::SOCKET, socket = %self.id, "Paused socket");
            return Ok(());
        }

        let multicast = self.multicast();
        {
            let mut kept = self.delivery.lock();
            if let Some(multicast) = &multicast {
                let loopback = multicast.loopback();
                let queued = multicast.take_latest(self.buffer_size(), |source| {
                    !self.is_looped_back(loopback, source.ip())
                });
                match queued {
                    Ok(Some((data, source))) => *kept = Some(ReceiveEvent::new(self.id, data, source)),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(target: targets::MULTICAST, socket = %self.id, "Failed to collect multicast datagrams held while paused: {}", e);
                    }
                }
            }
            self.paused.store(false, Ordering::Release);
            if let Some(event) = kept.take() {
                self.sink.receive(event);
            }
        }
        tracing::debug!(target: targets::SOCKET, socket = %self.id, "Resumed socket");

        if let Some(multicast) = multicast
            && multicast.is_bound()
        {
            multicast.ensure_reader(self)?;
        }
        Ok(())
    }

    /// Bind the primary channel; binds the multicast socket too when present.
    ///
    /// Binding an unbound IPv4 channel to an IPv6 address (or the reverse)
    /// reopens it in the other family with the same options, and the
    /// multicast socket follows. Once the primary channel is bound, a failure
    /// on the multicast side is only logged; the next multicast operation
    /// retries it.
    pub(crate) fn bind(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        self.ensure_open()?;
        let local = {
            let mut channel = self.channel.lock();
            let (socket, ipv6) = match std::mem::replace(&mut *channel, Channel::Closed) {
                Channel::Unbound { socket, ipv6 } => (socket, ipv6),
                other => {
                    *channel = other;
                    return Err(UdpError::invalid_state(format!(
                        "socket {} is already bound",
                        self.id
                    )));
                }
            };

            let want_ipv6 = addr.is_ipv6();
            let socket = if want_ipv6 != ipv6 {
                let reopened = match Channel::open(want_ipv6) {
                    Ok(reopened) => reopened,
                    Err(e) => {
                        *channel = Channel::Unbound { socket, ipv6 };
                        return Err(e.into());
                    }
                };
                if let Err(e) = self.configure(&reopened, want_ipv6) {
                    *channel = Channel::Unbound { socket, ipv6 };
                    return Err(e.into());
                }
                reopened
            } else {
                socket
            };

            if let Err(e) = Channel::bind_reusable(&socket, addr) {
                *channel = Channel::Unbound {
                    socket,
                    ipv6: want_ipv6,
                };
                return Err(e.into());
            }
            let socket = mio::net::UdpSocket::from_std(socket);
            let local = socket.local_addr();
            *channel = Channel::Bound(socket);
            local?
        };
        tracing::debug!(target: targets::SOCKET, socket = %self.id, %local, "Bound socket");

        if let Some(multicast) = self.multicast() {
            let result = self
                .refamily_multicast(multicast, local.is_ipv6())
                .and_then(|multicast| self.attach_multicast(&multicast, local.port()));
            if let Err(e) = result {
                tracing::warn!(target: targets::MULTICAST, socket = %self.id, %local, "Multicast socket not bound, will retry: {}", e);
            }
        }
        Ok(local)
    }

    /// Replace `multicast` with a state of the bound family if they differ.
    fn refamily_multicast(
        &self,
        multicast: Arc<MulticastState>,
        ipv6: bool,
    ) -> Result<Arc<MulticastState>> {
        if multicast.is_ipv6() == ipv6 {
            return Ok(multicast);
        }
        let replacement = Arc::new(MulticastState::open(
            self.id,
            ipv6,
            self.interface.clone(),
            self.multicast_poll_interval,
        )?);
        replacement.carry_over(&multicast);
        *self.multicast.lock() = Some(replacement.clone());
        tracing::debug!(target: targets::MULTICAST, socket = %self.id, ipv6, "Reopened multicast socket for the bound family");
        Ok(replacement)
    }

    /// Bind the multicast socket to the primary channel's port and start its
    /// reader unless paused. Both steps are no-ops once done.
    fn attach_multicast(self: &Arc<Self>, multicast: &Arc<MulticastState>, port: u16) -> Result<()> {
        multicast.bind(port)?;
        if !self.is_paused() {
            multicast.ensure_reader(self)?;
        }
        Ok(())
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.channel.lock().local_addr()
    }

    pub(crate) fn register(&self, registry: &Registry, interest: Interest) -> io::Result<()> {
        registry.register(self.channel.lock().bound_mut()?, self.id.token(), interest)
    }

    pub(crate) fn reregister(&self, registry: &Registry, interest: Interest) -> io::Result<()> {
        registry.reregister(self.channel.lock().bound_mut()?, self.id.token(), interest)
    }

    pub(crate) fn deregister(&self, registry: &Registry) -> io::Result<()> {
        registry.deregister(self.channel.lock().bound_mut()?)
    }

    /// Queue a datagram. Fails without queueing if the socket is not bound.
    pub(crate) fn queue_send(
        &self,
        target: SocketAddr,
        payload: Vec<u8>,
        responder: Option<Responder<usize>>,
    ) -> Result<()> {
        self.ensure_open()?;
        if !self.is_bound() {
            return Err(UdpError::NotBound(self.id));
        }
        self.outbound.lock().push_back(SendRequest {
            target,
            payload,
            responder,
        });
        Ok(())
    }

    pub(crate) fn has_pending_sends(&self) -> bool {
        !self.outbound.lock().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn pending_sends(&self) -> usize {
        self.outbound.lock().len()
    }

    /// Read pending datagrams until the channel would block. Event loop only.
    pub(crate) fn on_readable(&self) -> ReadOutcome {
        loop {
            if self.is_paused() {
                return ReadOutcome::Paused;
            }
            let mut buf = vec![0u8; self.buffer_size()];
            let result = match &*self.channel.lock() {
                Channel::Bound(socket) => socket.recv_from(&mut buf),
                _ => return ReadOutcome::Drained,
            };
            match result {
                Ok((n, source)) => {
                    // Multicast traffic is delivered by the reader thread only.
                    if is_ipv6_peer(&source) && self.multicast.lock().is_some() {
                        tracing::trace!(target: targets::EVENT_LOOP, socket = %self.id, %source, "Skipping datagram owned by the multicast path");
                        continue;
                    }
                    buf.truncate(n);
                    tracing::trace!(target: targets::EVENT_LOOP, socket = %self.id, %source, len = n, "Datagram received");
                    self.deliver(ReceiveEvent::new(self.id, buf, source), DeliveryPath::EventLoop);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::Drained,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.deliver_error(&e);
                    return ReadOutcome::Rearm;
                }
            }
        }
    }

    /// Send queued datagrams in order until the queue is empty or the channel
    /// would block. Event loop only.
    pub(crate) fn on_writable(&self) -> WriteOutcome {
        loop {
            let Some(request) = self.outbound.lock().pop_front() else {
                return WriteOutcome::Drained;
            };
            let result = match &*self.channel.lock() {
                Channel::Bound(socket) => socket.send_to(&request.payload, request.target),
                _ => Err(io::Error::new(io::ErrorKind::NotConnected, "socket is not bound")),
            };
            match result {
                Ok(n) => {
                    tracing::trace!(target: targets::EVENT_LOOP, socket = %self.id, target = %request.target, len = n, "Datagram sent");
                    request.resolve(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.outbound.lock().push_front(request);
                    return WriteOutcome::Blocked;
                }
                Err(e) => {
                    tracing::debug!(target: targets::EVENT_LOOP, socket = %self.id, target = %request.target, "Send failed: {}", e);
                    request.fail(e.into());
                }
            }
        }
    }

    /// Hand a datagram to the sink, or hold it back while paused.
    pub(crate) fn deliver(&self, event: ReceiveEvent, path: DeliveryPath) {
        let mut kept = self.delivery.lock();
        if self.is_paused() {
            match path {
                DeliveryPath::Multicast => *kept = Some(event),
                DeliveryPath::EventLoop => {
                    tracing::trace!(target: targets::EVENT_LOOP, socket = %self.id, "Dropping datagram read while paused");
                }
            }
            return;
        }
        self.sink.receive(event);
    }

    pub(crate) fn deliver_error(&self, err: &io::Error) {
        let _serialized = self.delivery.lock();
        tracing::debug!(target: targets::SOCKET, socket = %self.id, "Receive error: {}", err);
        self.sink.receive_error(ReceiveErrorEvent::from_io(self.id, err));
    }

    /// Close the channel and the multicast socket, stop the reader, and fail
    /// any sends still queued. Deregistration is the event loop's job.
    pub(crate) fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(UdpError::invalid_state(format!(
                "socket {} is already closed",
                self.id
            )));
        }
        *self.channel.lock() = Channel::Closed;
        if let Some(multicast) = self.multicast() {
            multicast.close();
        }
        let stranded: Vec<_> = self.outbound.lock().drain(..).collect();
        for request in stranded {
            request.fail(UdpError::invalid_state("socket closed"));
        }
        tracing::debug!(target: targets::SOCKET, socket = %self.id, "Closed socket");
        Ok(())
    }

    fn multicast(&self) -> Option<Arc<MulticastState>> {
        self.multicast.lock().clone()
    }

    #[cfg(test)]
    pub(crate) fn has_multicast(&self) -> bool {
        self.multicast.lock().is_some()
    }

    /// Get the multicast sub-state, creating it on first use. On a bound
    /// socket this also finishes an earlier multicast bind that failed.
    fn upgrade(self: &Arc<Self>) -> Result<Arc<MulticastState>> {
        self.ensure_open()?;
        let ipv6 = self.channel.lock().is_ipv6();
        let state = {
            let mut slot = self.multicast.lock();
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let state = Arc::new(MulticastState::open(
                        self.id,
                        ipv6,
                        self.interface.clone(),
                        self.multicast_poll_interval,
                    )?);
                    *slot = Some(state.clone());
                    state
                }
            }
        };

        match self.local_addr() {
            Some(local) => {
                let state = self.refamily_multicast(state, local.is_ipv6())?;
                self.attach_multicast(&state, local.port())?;
                Ok(state)
            }
            None => Ok(state),
        }
    }

    pub(crate) fn join_group(self: &Arc<Self>, group: IpAddr) -> Result<()> {
        self.upgrade()?.join(group)?;
        Ok(())
    }

    pub(crate) fn leave_group(&self, group: IpAddr) -> Result<()> {
        self.ensure_open()?;
        if let Some(multicast) = self.multicast() {
            multicast.leave(group)?;
        }
        Ok(())
    }

    pub(crate) fn joined_groups(&self) -> Vec<IpAddr> {
        self.multicast()
            .map(|multicast| multicast.groups())
            .unwrap_or_default()
    }

    /// Set the multicast TTL on both the multicast socket and the primary
    /// channel, which carries outbound multicast.
    pub(crate) fn set_multicast_ttl(self: &Arc<Self>, ttl: u32) -> Result<()> {
        self.upgrade()?.set_ttl(ttl)?;
        let channel = self.channel.lock();
        let sock = channel.sock_ref()?;
        if channel.is_ipv6() {
            sock.set_multicast_hops_v6(ttl)?;
        } else {
            sock.set_multicast_ttl_v4(ttl)?;
        }
        Ok(())
    }

    /// Enable or disable multicast loopback; returns the effective state.
    pub(crate) fn set_multicast_loopback(self: &Arc<Self>, enabled: bool) -> Result<bool> {
        let effective = self.upgrade()?.set_loopback(enabled)?;
        let channel = self.channel.lock();
        let sock = channel.sock_ref()?;
        let applied = if channel.is_ipv6() {
            sock.set_multicast_loop_v6(enabled)
        } else {
            sock.set_multicast_loop_v4(enabled)
        };
        if let Err(e) = applied {
            tracing::warn!(target: targets::SOCKET, socket = %self.id, "Failed to set loopback on primary channel: {}", e);
        }
        Ok(effective)
    }

    pub(crate) fn set_broadcast(&self, enabled: bool) -> Result<()> {
        self.ensure_open()?;
        self.channel.lock().sock_ref()?.set_broadcast(enabled)?;
        self.settings.lock().broadcast = enabled;
        Ok(())
    }

    pub(crate) fn info(&self) -> SocketInfo {
        let local = self.local_addr();
        let settings = self.settings.lock();
        SocketInfo {
            socket_id: self.id,
            buffer_size: settings.buffer_size,
            name: settings.name.clone(),
            paused: self.is_paused(),
            local_address: local.map(|addr| addr.ip()),
            local_port: local.map(|addr| addr.port()),
        }
    }

    #[cfg(test)]
    pub(crate) fn multicast_reader_running(&self) -> bool {
        self.multicast()
            .is_some_and(|multicast| multicast.reader_running())
    }
}

/// A real IPv6 peer, as opposed to an IPv4 peer seen through a mapped address.
fn is_ipv6_peer(source: &SocketAddr) -> bool {
    match source {
        SocketAddr::V6(v6) => v6.ip().to_ipv4_mapped().is_none(),
        SocketAddr::V4(_) => false,
    }
}
