//! One-shot completion handles for operations finished on the event loop.
//!
//! A caller receives a [`Pending`] immediately and never blocks on socket
//! I/O; the event loop holds the matching [`Responder`] and answers it exactly
//! once. Consuming `self` in [`Responder::complete`] makes a second answer
//! impossible, and dropping an unanswered responder resolves the pending side
//! with [`UdpError::Cancelled`].
//!
//! ```ignore
//! let pending = service.send(id, "127.0.0.1", 9000, b"ping".to_vec())?;
//! let bytes_sent = pending.wait_timeout(Duration::from_secs(1))?;
//! ```

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};

use crate::error::{Result, UdpError};

/// Create a connected responder / pending pair.
pub fn completion<T>() -> (Responder<T>, Pending<T>) {
    let (tx, rx) = bounded(1);
    (Responder { tx }, Pending { rx })
}

/// The answering side of a completion.
#[derive(Debug)]
pub struct Responder<T> {
    tx: Sender<Result<T>>,
}

impl<T> Responder<T> {
    /// Report the outcome of the operation.
    pub fn complete(self, result: Result<T>) {
        // The caller may have dropped its Pending; nobody is left to tell.
        let _ = self.tx.send(result);
    }

    /// Report success.
    pub fn resolve(self, value: T) {
        self.complete(Ok(value));
    }

    /// Report failure.
    pub fn fail(self, err: UdpError) {
        self.complete(Err(err));
    }
}

/// The waiting side of a completion.
#[derive(Debug)]
pub struct Pending<T> {
    rx: Receiver<Result<T>>,
}

impl<T> Pending<T> {
    /// A pending value that is already resolved.
    pub fn ready(value: T) -> Self {
        Self::finished(Ok(value))
    }

    /// A pending value that has already failed.
    pub fn failed(err: UdpError) -> Self {
        Self::finished(Err(err))
    }

    fn finished(result: Result<T>) -> Self {
        let (responder, pending) = completion();
        responder.complete(result);
        pending
    }

    /// Block until the operation completes.
    pub fn wait(self) -> Result<T> {
        self.rx.recv().unwrap_or(Err(UdpError::Cancelled))
    }

    /// Block until the operation completes or the timeout elapses.
    pub fn wait_timeout(self, timeout: Duration) -> Result<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(UdpError::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(UdpError::Cancelled),
        }
    }

    /// Take the result if it is available, without blocking.
    pub fn try_result(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(UdpError::Cancelled)),
        }
    }
}
