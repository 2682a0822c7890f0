//! The event loop: one thread polling readiness across every bound socket.
//!
//! The loop is the only owner of poller registrations and interest sets.
//! Other threads ask for changes by posting a [`Command`]. Registrations are
//! edge-triggered, so reads and writes drain until the OS would block.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use mio::{Events, Interest, Poll, Token};

use crate::completion::Responder;
use crate::error::Result;
use crate::logging::targets;
use crate::queue::{Command, CommandQueue};
use crate::registry::SocketRegistry;
use crate::socket::{ReadOutcome, SocketHandle, SocketId, WriteOutcome};

/// Token of the waker that interrupts the poll when commands are posted.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// A socket as seen by the poller.
struct Registration {
    socket: Arc<SocketHandle>,
    interest: Option<Interest>,
}

pub(crate) struct EventLoop {
    poll: Poll,
    events: Events,
    queue: Arc<CommandQueue>,
    registry: Arc<SocketRegistry>,
    registrations: HashMap<SocketId, Registration>,
}

impl EventLoop {
    pub(crate) fn new(
        poll: Poll,
        events_capacity: usize,
        queue: Arc<CommandQueue>,
        registry: Arc<SocketRegistry>,
    ) -> Self {
        Self {
            poll,
            events: Events::with_capacity(events_capacity),
            queue,
            registry,
            registrations: HashMap::new(),
        }
    }

    /// Register a socket bound under a previous loop.
    pub(crate) fn adopt(&mut self, socket: Arc<SocketHandle>) -> io::Result<()> {
        if !socket.is_bound() || socket.is_closed() {
            return Ok(());
        }
        if !socket.is_paused() {
            self.add_interest(&socket, Interest::READABLE)?;
        }
        if socket.has_pending_sends() {
            self.add_interest(&socket, Interest::WRITABLE)?;
        }
        Ok(())
    }

    /// Run until a STOP command is processed.
    pub(crate) fn run(mut self) {
        tracing::debug!(target: targets::EVENT_LOOP, sockets = self.registrations.len(), "Event loop started");

        // Commands posted while no loop was running.
        let mut running = self.drain_commands();
        while running {
            if let Err(e) = self.poll.poll(&mut self.events, None) {
                if e.kind() != io::ErrorKind::Interrupted {
                    tracing::error!(target: targets::EVENT_LOOP, "Readiness poll failed: {}", e);
                }
                continue;
            }

            let ready: Vec<_> = self
                .events
                .iter()
                .filter(|event| event.token() != WAKE_TOKEN)
                .map(|event| (event.token(), event.is_readable(), event.is_writable()))
                .collect();
            for (token, readable, writable) in ready {
                self.dispatch(token, readable, writable);
            }

            running = self.drain_commands();
        }

        self.shutdown();
        tracing::debug!(target: targets::EVENT_LOOP, pending = self.queue.len(), "Event loop stopped");
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) {
        let Ok(raw) = u32::try_from(token.0) else {
            return;
        };
        let Some(socket) = self
            .registrations
            .get(&SocketId::from_raw(raw))
            .map(|registration| registration.socket.clone())
        else {
            return;
        };

        if readable {
            let result = match socket.on_readable() {
                ReadOutcome::Drained => Ok(()),
                ReadOutcome::Paused => self.remove_interest(&socket, Interest::READABLE),
                ReadOutcome::Rearm => self.rearm(&socket),
            };
            if let Err(e) = result {
                tracing::error!(target: targets::EVENT_LOOP, socket = %socket.id(), "Failed to update read interest: {}", e);
            }
        }

        if writable && !socket.is_closed() {
            let result = match socket.on_writable() {
                WriteOutcome::Drained => self.remove_interest(&socket, Interest::WRITABLE),
                WriteOutcome::Blocked => Ok(()),
            };
            if let Err(e) = result {
                tracing::error!(target: targets::EVENT_LOOP, socket = %socket.id(), "Failed to update write interest: {}", e);
            }
        }
    }

    /// Process every queued command. Returns `false` once STOP is seen.
    fn drain_commands(&mut self) -> bool {
        while let Some(command) = self.queue.try_next() {
            tracing::trace!(target: targets::EVENT_LOOP, command = command.name(), "Processing command");
            match command {
                Command::Bind {
                    socket,
                    addr,
                    responder,
                } => {
                    let result = socket.bind(addr).and_then(|local| {
                        socket.mark_bound();
                        if !socket.is_paused() {
                            self.add_interest(&socket, Interest::READABLE)?;
                        }
                        Ok(local)
                    });
                    if let Err(e) = &result {
                        tracing::debug!(target: targets::EVENT_LOOP, socket = %socket.id(), %addr, code = ?e.os_code(), "Bind failed: {}", e);
                    }
                    respond(responder, result);
                }
                Command::Close { socket, responder } => {
                    let result = self.close(&socket);
                    respond(responder, result);
                }
                Command::AddReadInterest { socket, responder } => {
                    let result = if socket.is_bound() && !socket.is_closed() && !socket.is_paused()
                    {
                        self.add_interest(&socket, Interest::READABLE)
                            .map_err(Into::into)
                    } else {
                        Ok(())
                    };
                    respond(responder, result);
                }
                Command::AddWriteInterest { socket, responder } => {
                    let result = if socket.is_bound() && !socket.is_closed() && socket.has_pending_sends()
                    {
                        self.add_interest(&socket, Interest::WRITABLE)
                            .map_err(Into::into)
                    } else {
                        Ok(())
                    };
                    respond(responder, result);
                }
                Command::Stop => return false,
            }
        }
        true
    }

    fn close(&mut self, socket: &Arc<SocketHandle>) -> Result<()> {
        if let Some(registration) = self.registrations.remove(&socket.id())
            && registration.interest.is_some()
            && let Err(e) = socket.deregister(self.poll.registry())
        {
            tracing::warn!(target: targets::EVENT_LOOP, socket = %socket.id(), "Failed to deregister socket: {}", e);
        }
        self.registry.remove(socket.id());
        socket.close()
    }

    /// Deregister everything so a later loop with a fresh poller can adopt the
    /// sockets again.
    fn shutdown(&mut self) {
        for (id, registration) in self.registrations.drain() {
            if registration.interest.is_some()
                && let Err(e) = registration.socket.deregister(self.poll.registry())
            {
                tracing::debug!(target: targets::EVENT_LOOP, socket = %id, "Failed to deregister socket: {}", e);
            }
        }
        self.queue.detach_waker();
    }

    fn add_interest(&mut self, socket: &Arc<SocketHandle>, interest: Interest) -> io::Result<()> {
        self.set_interest(socket, |current| {
            Some(current.map_or(interest, |current| current | interest))
        })
    }

    fn remove_interest(&mut self, socket: &Arc<SocketHandle>, interest: Interest) -> io::Result<()> {
        self.set_interest(socket, |current| current.and_then(|current| current.remove(interest)))
    }

    /// Re-register with the current interest so an edge that was not fully
    /// drained fires again.
    fn rearm(&mut self, socket: &Arc<SocketHandle>) -> io::Result<()> {
        self.set_interest(socket, |current| current)
    }

    fn set_interest(
        &mut self,
        socket: &Arc<SocketHandle>,
        update: impl FnOnce(Option<Interest>) -> Option<Interest>,
    ) -> io::Result<()> {
        let registry = self.poll.registry();
        let registration = self
            .registrations
            .entry(socket.id())
            .or_insert_with(|| Registration {
                socket: socket.clone(),
                interest: None,
            });

        let next = update(registration.interest);
        match (registration.interest, next) {
            (None, None) => {}
            (None, Some(interest)) => socket.register(registry, interest)?,
            (Some(_), Some(interest)) => socket.reregister(registry, interest)?,
            (Some(_), None) => socket.deregister(registry)?,
        }
        registration.interest = next;
        Ok(())
    }
}

fn respond<T>(responder: Option<Responder<T>>, result: Result<T>) {
    if let Some(responder) = responder {
        responder.complete(result);
    }
}

#[cfg(test)]
mod tests {
    use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
    use std::thread;
    use std::time::Duration;

    use mio::Waker;

    use super::*;
    use crate::completion::completion;
    use crate::error::UdpError;
    use crate::sink::{ChannelSink, SocketEvent};
    use crate::socket::test_socket_with_id;

    struct Harness {
        queue: Arc<CommandQueue>,
        registry: Arc<SocketRegistry>,
        events: crossbeam_channel::Receiver<SocketEvent>,
        sink: Arc<ChannelSink>,
        thread: Option<thread::JoinHandle<()>>,
    }

    impl Harness {
        fn start() -> Self {
            let (sink, events) = ChannelSink::new();
            let mut harness = Self {
                queue: Arc::new(CommandQueue::new()),
                registry: Arc::new(SocketRegistry::new()),
                events,
                sink: Arc::new(sink),
                thread: None,
            };
            harness.spawn();
            harness
        }

        fn spawn(&mut self) {
            let poll = Poll::new().unwrap();
            let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN).unwrap());
            let mut event_loop = EventLoop::new(poll, 64, self.queue.clone(), self.registry.clone());
            for socket in self.registry.all() {
                event_loop.adopt(socket).unwrap();
            }
            self.queue.attach_waker(waker);
            self.thread = Some(thread::spawn(move || event_loop.run()));
        }

        fn stop(&mut self) {
            self.queue.post(Command::Stop);
            if let Some(thread) = self.thread.take() {
                thread.join().unwrap();
            }
        }

        fn socket(&self) -> Arc<SocketHandle> {
            let socket = test_socket_with_id(self.registry.allocate_id(), self.sink.clone());
            self.registry.insert(socket.clone());
            socket
        }

        fn bind(&self, socket: &Arc<SocketHandle>) -> SocketAddr {
            let (responder, pending) = completion();
            self.queue.post(Command::Bind {
                socket: socket.clone(),
                addr: "127.0.0.1:0".parse().unwrap(),
                responder: Some(responder),
            });
            pending.wait_timeout(Duration::from_secs(5)).unwrap()
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.stop();
        }
    }

    fn peer() -> StdUdpSocket {
        let peer = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        peer
    }

    #[test]
    fn test_bind_then_receive() {
        let harness = Harness::start();
        let socket = harness.socket();
        let local = harness.bind(&socket);
        assert!(socket.is_bound());

        let peer = peer();
        peer.send_to(b"ping", local).unwrap();

        match harness.events.recv_timeout(Duration::from_secs(5)).unwrap() {
            SocketEvent::Receive(event) => {
                assert_eq!(event.socket_id, socket.id());
                assert_eq!(event.data, b"ping");
                assert_eq!(event.source(), peer.local_addr().unwrap());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_write_interest_sends_queued_datagrams() {
        let harness = Harness::start();
        let socket = harness.socket();
        harness.bind(&socket);
        let peer = peer();

        let (responder, pending) = completion();
        socket
            .queue_send(peer.local_addr().unwrap(), b"hello".to_vec(), Some(responder))
            .unwrap();
        harness.queue.post(Command::AddWriteInterest {
            socket: socket.clone(),
            responder: None,
        });

        assert_eq!(pending.wait_timeout(Duration::from_secs(5)), Ok(5));
        let mut buf = [0u8; 16];
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn test_close_removes_and_answers() {
        let harness = Harness::start();
        let socket = harness.socket();
        harness.bind(&socket);

        let (responder, pending) = completion();
        harness.queue.post(Command::Close {
            socket: socket.clone(),
            responder: Some(responder),
        });
        assert_eq!(pending.wait_timeout(Duration::from_secs(5)), Ok(()));
        assert!(socket.is_closed());
        assert_eq!(harness.registry.get(socket.id()).err(), Some(UdpError::NotFound(socket.id())));

        // A second close is answered with an error, not silently ignored.
        let (responder, pending) = completion();
        harness.queue.post(Command::Close {
            socket: socket.clone(),
            responder: Some(responder),
        });
        assert!(matches!(
            pending.wait_timeout(Duration::from_secs(5)),
            Err(UdpError::InvalidState(_))
        ));
    }

    #[test]
    fn test_failed_command_does_not_block_later_ones() {
        let harness = Harness::start();
        let socket = harness.socket();
        harness.bind(&socket);

        let (bind_again, failed) = completion();
        harness.queue.post(Command::Bind {
            socket: socket.clone(),
            addr: "127.0.0.1:0".parse().unwrap(),
            responder: Some(bind_again),
        });
        let (read, ok) = completion();
        harness.queue.post(Command::AddReadInterest {
            socket: socket.clone(),
            responder: Some(read),
        });

        assert!(matches!(
            failed.wait_timeout(Duration::from_secs(5)),
            Err(UdpError::InvalidState(_))
        ));
        assert_eq!(ok.wait_timeout(Duration::from_secs(5)), Ok(()));
    }

    #[test]
    fn test_commands_posted_while_stopped_run_on_restart() {
        let mut harness = Harness::start();
        let socket = harness.socket();
        let local = harness.bind(&socket);
        harness.stop();

        let (responder, pending) = completion();
        harness.queue.post(Command::AddReadInterest {
            socket: socket.clone(),
            responder: Some(responder),
        });
        assert!(pending.try_result().is_none());

        harness.spawn();
        assert_eq!(pending.wait_timeout(Duration::from_secs(5)), Ok(()));

        let peer = peer();
        peer.send_to(b"again", local).unwrap();
        match harness.events.recv_timeout(Duration::from_secs(5)).unwrap() {
            SocketEvent::Receive(event) => assert_eq!(event.data, b"again"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_paused_socket_leaves_datagrams_queued() {
        let harness = Harness::start();
        let socket = harness.socket();
        let local = harness.bind(&socket);
        socket.set_paused(true).unwrap();

        let peer = peer();
        peer.send_to(b"held", local).unwrap();
        assert!(harness.events.recv_timeout(Duration::from_millis(200)).is_err());

        socket.set_paused(false).unwrap();
        harness.queue.post(Command::AddReadInterest {
            socket: socket.clone(),
            responder: None,
        });
        peer.send_to(b"fresh", local).unwrap();

        let mut received = Vec::new();
        for _ in 0..2 {
            match harness.events.recv_timeout(Duration::from_secs(5)).unwrap() {
                SocketEvent::Receive(event) => received.push(event.data),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(received, [b"held".to_vec(), b"fresh".to_vec()]);
    }
}
