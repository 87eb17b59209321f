//! # Client Broadcast Set
//!
//! The fan-out half of the relay. Every connected client is represented by the
//! sending half of a bounded channel; the receiving half is drained by the
//! client's own socket task. A broadcast therefore never waits on any socket:
//! it pushes one `Arc` of the serialized envelope into every channel and
//! returns, and each client task writes at its own pace.
//!
//! ## Guarantees
//!
//! - **Ordering**: broadcasts are serialized by the client-set lock and every
//!   channel is FIFO, so each client sees envelopes in collector order.
//! - **Failure isolation**: a send that fails means the client task is gone or
//!   has fallen `queue_capacity` frames behind. Either way the client is
//!   dropped from the set with `retain` and the remaining clients still receive
//!   the frame. Dropping the sender ends the client's socket task once it has
//!   drained what is already queued.
//! - **Shared payload**: the text is serialized once and every queue holds an
//!   `Arc` of it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};

/// Identity of a connected client.
pub type ClientId = u64;

/// A serialized envelope shared by every client.
pub type Frame = Arc<str>;

/// Frames a client may fall behind before it is evicted.
pub const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 1024;

/// # Client Set
///
/// Manages registration, deregistration and broadcasting for client connections.
#[derive(Debug)]
pub struct ClientSet {
    clients: Mutex<HashMap<ClientId, mpsc::Sender<Frame>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl Default for ClientSet {
    fn default() -> Self {
        Self::with_queue_capacity(DEFAULT_CLIENT_QUEUE_CAPACITY)
    }
}

impl ClientSet {
    /// Creates an empty set with the default per-client queue capacity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty set whose clients may lag at most `capacity` frames
    /// (at least one).
    pub fn with_queue_capacity(capacity: usize) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            queue_capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ClientId, mpsc::Sender<Frame>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Add Client
    ///
    /// Registers a new client and returns its identity together with the
    /// receiver its socket task must drain.
    pub fn add(&self) -> (ClientId, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock().insert(id, tx);
        log::info!("Client {} connected", id);
        (id, rx)
    }

    /// Removes a client. Removing an unknown id is a no-op.
    pub fn remove(&self, id: ClientId) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            log::info!("Client {} removed", id);
        }
        removed
    }

    /// Current membership count.
    pub fn size(&self) -> usize {
        self.lock().len()
    }

    /// # Broadcast
    ///
    /// Queues `frame` for every member. Members whose task has gone away, or
    /// whose queue is full, are removed. Returns the number of members the
    /// frame was queued for.
    pub fn broadcast(&self, frame: Frame) -> usize {
        let mut clients = self.lock();
        clients.retain(|id, sender| match sender.try_send(Arc::clone(&frame)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::info!("Client {} fell {} frames behind. Evicting it.", id, self.queue_capacity);
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::info!("Client {} is gone. Removing it from the broadcast set.", id);
                false
            }
        });
        clients.len()
    }
}
