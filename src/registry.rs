//! Registry of connected clients.
//!
//! Every connection task registers its `ClientHandle` on accept and removes
//! it when its receive loop ends. The dispatcher reads a snapshot on every
//! broadcast. All three operations go through one mutex, held only for the
//! map operation itself.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

/// Process-unique client identity, allocated in accept order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u64);

impl ClientId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A send to a client whose writer has already gone away.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("client {0} is closed")]
pub struct SendError(pub ClientId);

/// Registry errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("client {0} is not registered")]
    NotFound(ClientId),
}

/// Send side of one client connection.
///
/// Messages are queued to the connection's writer task, which owns the
/// WebSocket sink. Cloning is cheap; clones share the same queue.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    peer: SocketAddr,
    outbound: mpsc::Sender<Message>,
}

impl ClientHandle {
    pub fn new(id: ClientId, peer: SocketAddr, outbound: mpsc::Sender<Message>) -> Self {
        Self { id, peer, outbound }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue a message for this client.
    ///
    /// Waits while the client's queue is full. Fails once the writer task
    /// has stopped, i.e. the connection is closed.
    pub async fn send(&self, msg: Message) -> Result<(), SendError> {
        self.outbound.send(msg).await.map_err(|_| SendError(self.id))
    }
}

/// The set of currently connected clients.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<BTreeMap<ClientId, ClientHandle>>,
    id_counter: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh client id.
    pub fn next_id(&self) -> ClientId {
        ClientId(self.id_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ClientId, ClientHandle>> {
        // The map stays consistent even if a holder panicked mid-operation.
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a client. Registering an id twice keeps a single entry.
    pub fn register(&self, handle: ClientHandle) {
        let (id, peer) = (handle.id, handle.peer);
        let total = {
            let mut clients = self.lock();
            clients.insert(id, handle);
            clients.len()
        };
        info!(client = %id, peer = %peer, total, "Client connected");
    }

    /// Remove a client.
    pub fn unregister(&self, id: ClientId) -> Result<ClientHandle, RegistryError> {
        let (removed, total) = {
            let mut clients = self.lock();
            let removed = clients.remove(&id);
            (removed, clients.len())
        };

        match removed {
            Some(handle) => {
                info!(client = %id, peer = %handle.peer, total, "Client disconnected");
                Ok(handle)
            }
            None => Err(RegistryError::NotFound(id)),
        }
    }

    /// Point-in-time copy of the membership, in id order.
    pub fn snapshot(&self) -> Vec<ClientHandle> {
        self.lock().values().cloned().collect()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Number of connected clients.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Scoped membership: registers on creation, unregisters on drop.
///
/// Dropping runs on every exit path of the owning task, so the client is
/// removed exactly once.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ClientRegistry>,
    id: ClientId,
}

impl Registration {
    pub fn new(registry: Arc<ClientRegistry>, handle: ClientHandle) -> Self {
        let id = handle.id();
        registry.register(handle);
        Self { registry, id }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Err(e) = self.registry.unregister(self.id) {
            debug!(error = %e, "Ignoring unregister of unknown client");
        }
    }
}
