//! The socket table: id allocation and id → socket lookup.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::error::{Result, UdpError};
use crate::socket::{SocketHandle, SocketId};

/// Concurrent mapping from socket id to socket.
///
/// Ids are assigned monotonically and never reused for the lifetime of the
/// registry. One registry belongs to one [`UdpService`](crate::UdpService).
#[derive(Default)]
pub(crate) struct SocketRegistry {
    next_id: AtomicU32,
    sockets: Mutex<HashMap<SocketId, Arc<SocketHandle>>>,
}

impl SocketRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reserve the next id.
    pub(crate) fn allocate_id(&self) -> SocketId {
        SocketId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn insert(&self, socket: Arc<SocketHandle>) {
        self.sockets.lock().insert(socket.id(), socket);
    }

    /// Look up a socket, failing with `NotFound`.
    pub(crate) fn get(&self, id: SocketId) -> Result<Arc<SocketHandle>> {
        self.sockets
            .lock()
            .get(&id)
            .cloned()
            .ok_or(UdpError::NotFound(id))
    }

    /// Remove a socket, returning it if it was present.
    pub(crate) fn remove(&self, id: SocketId) -> Option<Arc<SocketHandle>> {
        self.sockets.lock().remove(&id)
    }

    /// Remove every socket.
    pub(crate) fn drain(&self) -> Vec<Arc<SocketHandle>> {
        let mut sockets: Vec<_> = self.sockets.lock().drain().map(|(_, s)| s).collect();
        sockets.sort_by_key(|s| s.id());
        sockets
    }

    /// All sockets, ordered by id.
    pub(crate) fn all(&self) -> Vec<Arc<SocketHandle>> {
        let mut sockets: Vec<_> = self.sockets.lock().values().cloned().collect();
        sockets.sort_by_key(|s| s.id());
        sockets
    }

    pub(crate) fn len(&self) -> usize {
        self.sockets.lock().len()
    }
}
