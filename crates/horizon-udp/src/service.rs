//! The public entry point: socket operations by id and loop lifecycle.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::{Poll, Waker};
use parking_lot::Mutex;

use crate::completion::{Pending, completion};
use crate::config::{CreatedSocket, ServiceConfig, SocketInfo, SocketProperties};
use crate::error::{Result, UdpError};
use crate::event_loop::{EventLoop, WAKE_TOKEN};
use crate::logging::targets;
use crate::network_info::NetworkInterface;
use crate::queue::{Command, CommandQueue};
use crate::registry::SocketRegistry;
use crate::sink::EventSink;
use crate::socket::{SocketHandle, SocketId, SocketOptions};

/// A set of UDP sockets driven by one event loop thread.
///
/// Every operation is safe to call from any thread. Operations that need the
/// event loop (bind, send, resume, close) return a [`Pending`] that resolves
/// once the loop has processed them; they are queued while the loop is
/// stopped and run after the next [`start`](Self::start). Close is the
/// exception: with no loop running it closes the socket on the calling thread.
///
/// Events are delivered to the [`EventSink`] from the loop thread and from
/// multicast reader threads. The sink must not call [`stop`](Self::stop).
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use horizon_udp::{ChannelSink, ServiceConfig, SocketProperties, UdpService};
///
/// let (sink, events) = ChannelSink::new();
/// let service = UdpService::new(ServiceConfig::default(), Arc::new(sink));
/// service.start()?;
///
/// let created = service.create(SocketProperties::new().name("echo"))?;
/// service.bind(created.socket_id, "0.0.0.0", 0)?.wait()?;
/// service.send(created.socket_id, "127.0.0.1", 1212, b"Hello".to_vec())?.wait()?;
///
/// let event = events.recv().unwrap();
/// println!("{:?}", event);
/// # Ok::<(), horizon_udp::UdpError>(())
/// ```
pub struct UdpService {
    config: ServiceConfig,
    sink: Arc<dyn EventSink>,
    registry: Arc<SocketRegistry>,
    queue: Arc<CommandQueue>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl UdpService {
    /// Create a stopped service.
    pub fn new(config: ServiceConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            sink,
            registry: Arc::new(SocketRegistry::new()),
            queue: Arc::new(CommandQueue::new()),
            thread: Mutex::new(None),
        }
    }

    /// Start the event loop thread. Does nothing if it is already running.
    ///
    /// Sockets bound under a previous loop are registered with the new one.
    pub fn start(&self) -> Result<()> {
        let mut slot = self.thread.lock();
        if let Some(existing) = slot.take() {
            if !existing.is_finished() {
                *slot = Some(existing);
                return Ok(());
            }
            if existing.join().is_err() {
                tracing::error!(target: targets::SERVICE, "Previous event loop thread panicked");
            }
        }

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let mut event_loop = EventLoop::new(
            poll,
            self.config.events_capacity,
            self.queue.clone(),
            self.registry.clone(),
        );
        for socket in self.registry.all() {
            let id = socket.id();
            if let Err(e) = event_loop.adopt(socket) {
                tracing::warn!(target: targets::SERVICE, socket = %id, "Failed to register socket with event loop: {}", e);
            }
        }

        self.queue.attach_waker(waker);
        let spawned = thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || event_loop.run());
        match spawned {
            Ok(handle) => {
                *slot = Some(handle);
                tracing::debug!(target: targets::SERVICE, sockets = self.registry.len(), "Started UDP service");
                Ok(())
            }
            Err(e) => {
                self.queue.detach_waker();
                Err(e.into())
            }
        }
    }

    /// Stop the event loop and wait for its thread to exit. Commands queued
    /// before the call are processed first. Does nothing if not running.
    pub fn stop(&self) -> Result<()> {
        let Some(handle) = self.thread.lock().take() else {
            return Ok(());
        };
        self.queue.post(Command::Stop);
        if handle.join().is_err() {
            self.queue.detach_waker();
            return Err(UdpError::invalid_state("event loop thread panicked"));
        }
        tracing::debug!(target: targets::SERVICE, "Stopped UDP service");
        Ok(())
    }

    /// Same as [`start`](Self::start).
    pub fn restart(&self) -> Result<()> {
        self.start()
    }

    /// Whether the event loop thread is alive.
    pub fn is_running(&self) -> bool {
        loop_alive(&self.thread.lock())
    }

    fn socket(&self, id: SocketId) -> Result<Arc<SocketHandle>> {
        self.registry.get(id)
    }

    /// Create an unbound socket.
    ///
    /// The reported addresses are those of the interface chosen by the
    /// configured [`InterfaceSelector`](crate::network_info::InterfaceSelector),
    /// or loopback when it chooses none.
    pub fn create(&self, properties: SocketProperties) -> Result<CreatedSocket> {
        let interface = self
            .config
            .interface_selector
            .select(&NetworkInterface::list());
        if let Some(iface) = &interface {
            tracing::trace!(target: targets::SERVICE, interface = %iface.name, addresses = ?iface.all_addresses(), "Selected interface");
        }

        let id = self.registry.allocate_id();
        let socket = SocketHandle::create(
            id,
            &properties,
            SocketOptions {
                default_buffer_size: self.config.default_buffer_size,
                multicast_poll_interval: self.config.multicast_poll_interval,
                interface,
            },
            self.sink.clone(),
        )?;
        let created = CreatedSocket {
            socket_id: id,
            ipv4: socket.ipv4(),
            ipv6: socket.ipv6(),
        };
        self.registry.insert(socket);
        Ok(created)
    }

    /// Change a socket's name and/or buffer size.
    pub fn update(&self, id: SocketId, properties: SocketProperties) -> Result<()> {
        self.socket(id)?.set_properties(&properties)
    }

    /// Pause or resume delivery of received datagrams.
    ///
    /// While paused, datagrams read on the event loop are not delivered and
    /// the multicast path keeps only the most recent one, which is delivered
    /// first on resume.
    pub fn set_paused(&self, id: SocketId, paused: bool) -> Result<Pending<()>> {
        let socket = self.socket(id)?;
        socket.set_paused(paused)?;
        if paused {
            return Ok(Pending::ready(()));
        }
        let (responder, pending) = completion();
        self.queue.post(Command::AddReadInterest {
            socket,
            responder: Some(responder),
        });
        Ok(pending)
    }

    /// Bind a socket. An empty `address` means the IPv4 unspecified address.
    ///
    /// Resolves with the bound local address, which carries the assigned port
    /// when `port` is 0.
    pub fn bind(&self, id: SocketId, address: &str, port: u16) -> Result<Pending<SocketAddr>> {
        let socket = self.socket(id)?;
        let addr = resolve(address, port)?;
        if socket.is_bound() {
            return Err(UdpError::invalid_state(format!("socket {id} is already bound")));
        }
        let (responder, pending) = completion();
        self.queue.post(Command::Bind {
            socket,
            addr,
            responder: Some(responder),
        });
        Ok(pending)
    }

    /// Queue a datagram. Resolves with the number of bytes sent.
    pub fn send(&self, id: SocketId, address: &str, port: u16, payload: Vec<u8>) -> Result<Pending<usize>> {
        let socket = self.socket(id)?;
        let target = resolve(address, port)?;
        let (responder, pending) = completion();
        socket.queue_send(target, payload, Some(responder))?;
        self.post_write_interest(socket);
        Ok(pending)
    }

    /// Queue a datagram nobody waits for. Send failures are only logged.
    pub fn forward(&self, id: SocketId, address: &str, port: u16, payload: Vec<u8>) -> Result<()> {
        let socket = self.socket(id)?;
        let target = resolve(address, port)?;
        socket.queue_send(target, payload, None)?;
        self.post_write_interest(socket);
        Ok(())
    }

    fn post_write_interest(&self, socket: Arc<SocketHandle>) {
        self.queue.post(Command::AddWriteInterest {
            socket,
            responder: None,
        });
    }

    /// Close a socket. The id is invalid as soon as this returns.
    ///
    /// Without a running loop the socket is closed before this returns, so
    /// its multicast reader cannot outlive the call.
    pub fn close(&self, id: SocketId) -> Result<Pending<()>> {
        let thread = self.thread.lock();
        let socket = self.registry.remove(id).ok_or(UdpError::NotFound(id))?;
        if !loop_alive(&thread) {
            return Ok(match socket.close() {
                Ok(()) => Pending::ready(()),
                Err(e) => Pending::failed(e),
            });
        }
        let (responder, pending) = completion();
        self.queue.post(Command::Close {
            socket,
            responder: Some(responder),
        });
        Ok(pending)
    }

    /// Close every socket. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let thread = self.thread.lock();
        let sockets = self.registry.drain();
        let count = sockets.len();
        let running = loop_alive(&thread);
        for socket in sockets {
            if running {
                self.queue.post(Command::Close {
                    socket,
                    responder: None,
                });
            } else if let Err(e) = socket.close() {
                tracing::warn!(target: targets::SERVICE, socket = %socket.id(), "Failed to close socket: {}", e);
            }
        }
        if count > 0 {
            tracing::debug!(target: targets::SERVICE, count, "Closing all sockets");
        }
        count
    }

    /// Snapshot of one socket.
    pub fn info(&self, id: SocketId) -> Result<SocketInfo> {
        Ok(self.socket(id)?.info())
    }

    /// Snapshots of every socket, ordered by id.
    pub fn sockets(&self) -> Vec<SocketInfo> {
        self.registry.all().iter().map(|socket| socket.info()).collect()
    }

    /// Join a multicast group. Joining a group twice is a no-op.
    pub fn join_group(&self, id: SocketId, group: &str) -> Result<()> {
        let socket = self.socket(id)?;
        socket.join_group(parse_group(group)?)
    }

    /// Leave a multicast group. Leaving a group not joined is a no-op.
    pub fn leave_group(&self, id: SocketId, group: &str) -> Result<()> {
        let socket = self.socket(id)?;
        socket.leave_group(parse_group(group)?)
    }

    pub fn set_multicast_ttl(&self, id: SocketId, ttl: u32) -> Result<()> {
        self.socket(id)?.set_multicast_ttl(ttl)
    }

    pub fn set_broadcast(&self, id: SocketId, enabled: bool) -> Result<()> {
        self.socket(id)?.set_broadcast(enabled)
    }

    /// Enable or disable delivery of the socket's own multicast datagrams.
    /// Returns the state the OS reports after the change.
    pub fn set_multicast_loopback(&self, id: SocketId, enabled: bool) -> Result<bool> {
        self.socket(id)?.set_multicast_loopback(enabled)
    }

    /// Joined multicast groups, sorted.
    pub fn joined_groups(&self, id: SocketId) -> Result<Vec<IpAddr>> {
        Ok(self.socket(id)?.joined_groups())
    }
}

impl Drop for UdpService {
    fn drop(&mut self) {
        self.close_all();
        if let Err(e) = self.stop() {
            tracing::error!(target: targets::SERVICE, "Failed to stop UDP service: {}", e);
        }
    }
}

fn loop_alive(thread: &Option<JoinHandle<()>>) -> bool {
    thread.as_ref().is_some_and(|handle| !handle.is_finished())
}

/// Resolve `address` (an IP literal or host name) and `port`.
fn resolve(address: &str, port: u16) -> Result<SocketAddr> {
    if address.is_empty() {
        return Ok((Ipv4Addr::UNSPECIFIED, port).into());
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok((ip, port).into());
    }
    (address, port)
        .to_socket_addrs()
        .map_err(|e| UdpError::invalid_address(format!("{address}: {e}")))?
        .next()
        .ok_or_else(|| UdpError::invalid_address(format!("{address}: no addresses")))
}

fn parse_group(group: &str) -> Result<IpAddr> {
    let addr: IpAddr = group
        .parse()
        .map_err(|_| UdpError::invalid_address(format!("{group}: not an IP address")))?;
    if !addr.is_multicast() {
        return Err(UdpError::invalid_address(format!("{group}: not a multicast address")));
    }
    Ok(addr)
}
