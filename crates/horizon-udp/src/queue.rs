//! Control commands and the queue that carries them to the event loop.
//!
//! Any thread may post; only the event loop thread drains. Posting wakes the
//! loop out of its readiness poll when a loop is running. Commands posted while
//! no loop runs stay queued and are processed by the next loop.

use std::net::SocketAddr;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, unbounded};
use mio::Waker;
use parking_lot::Mutex;

use crate::completion::Responder;
use crate::logging::targets;
use crate::socket::SocketHandle;

/// A control instruction executed exclusively on the event loop thread.
pub(crate) enum Command {
    /// Bind the socket and register it for readability.
    Bind {
        socket: Arc<SocketHandle>,
        addr: SocketAddr,
        responder: Option<Responder<SocketAddr>>,
    },
    /// Deregister and close the socket.
    Close {
        socket: Arc<SocketHandle>,
        responder: Option<Responder<()>>,
    },
    /// Add READABLE to the socket's interest set.
    AddReadInterest {
        socket: Arc<SocketHandle>,
        responder: Option<Responder<()>>,
    },
    /// Add WRITABLE to the socket's interest set.
    AddWriteInterest {
        socket: Arc<SocketHandle>,
        responder: Option<Responder<()>>,
    },
    /// Stop the event loop. Nothing queued after it is processed by this loop.
    Stop,
}

impl Command {
    /// Short name for logging.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "bind",
            Self::Close { .. } => "close",
            Self::AddReadInterest { .. } => "add-read-interest",
            Self::AddWriteInterest { .. } => "add-write-interest",
            Self::Stop => "stop",
        }
    }
}

/// Unbounded multi-producer FIFO of [`Command`]s plus the loop's wakeup.
pub(crate) struct CommandQueue {
    tx: Sender<Command>,
    rx: Receiver<Command>,
    waker: Mutex<Option<Arc<Waker>>>,
}

impl CommandQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            waker: Mutex::new(None),
        }
    }

    /// Enqueue a command and wake the loop if one is running.
    pub(crate) fn post(&self, command: Command) {
        tracing::trace!(target: targets::EVENT_LOOP, command = command.name(), "Posting command");
        // The queue owns a receiver, so the channel never disconnects.
        let _ = self.tx.send(command);
        self.wake();
    }

    /// Interrupt the loop's readiness poll.
    pub(crate) fn wake(&self) {
        if let Some(waker) = self.waker.lock().as_ref()
            && let Err(e) = waker.wake()
        {
            tracing::error!(target: targets::EVENT_LOOP, "Failed to wake event loop: {}", e);
        }
    }

    /// Take the next queued command without blocking.
    pub(crate) fn try_next(&self) -> Option<Command> {
        self.rx.try_recv().ok()
    }

    /// Number of queued commands.
    pub(crate) fn len(&self) -> usize {
        self.rx.len()
    }

    /// Install the waker of a freshly started loop.
    pub(crate) fn attach_waker(&self, waker: Arc<Waker>) {
        *self.waker.lock() = Some(waker);
    }

    /// Remove the waker when the loop exits.
    pub(crate) fn detach_waker(&self) {
        self.waker.lock().take();
    }
}
