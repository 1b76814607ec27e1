use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify};

use crate::model::envelope::Role;
use crate::model::propagated::{CloseReason, Propagated};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    /// Allocate a fresh, process-unique id.
    pub fn next() -> ClientId {
        static ID_COUNTER: AtomicU64 = AtomicU64::new(0);
        ClientId(ID_COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Deref for ClientId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<u64> for ClientId {
    fn from(id: u64) -> Self {
        ClientId(id)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a client is in its connection lifecycle, as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Connected, no role yet.
    Unassigned,
    /// Holds (or held until vacated) a session slot.
    Declared(Role),
    /// Lost its slot to a newer connection and is being closed.
    Superseded(Role),
}

impl ClientState {
    pub fn role(&self) -> Option<Role> {
        match self {
            ClientState::Unassigned => None,
            ClientState::Declared(r) | ClientState::Superseded(r) => Some(*r),
        }
    }
}

/// Send entry point to a client's connection task.
///
/// Other tasks never touch a client's socket; they enqueue onto its outbound
/// queue or trip its eviction notifier.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub id: ClientId,
    pub connected_at: DateTime<Utc>,
    tx: mpsc::Sender<Propagated>,
    eviction: Arc<Eviction>,
}

/// First eviction reason wins; later calls only re-notify.
#[derive(Debug, Default)]
struct Eviction {
    notify: Notify,
    reason: OnceLock<CloseReason>,
}

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue at capacity; the message was dropped.
    Full,
    /// The connection task is gone.
    Closed,
}

impl ClientHandle {
    pub fn new(id: ClientId, tx: mpsc::Sender<Propagated>) -> ClientHandle {
        ClientHandle {
            id,
            connected_at: Utc::now(),
            tx,
            eviction: Arc::new(Eviction::default()),
        }
    }

    /// Enqueue without waiting. Safe to call while holding the registry lock.
    pub fn deliver(&self, msg: Propagated) -> Delivery {
        match self.tx.try_send(msg) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Tell the owning task to close its connection for `reason`.
    pub fn evict(&self, reason: CloseReason) {
        let _ = self.eviction.reason.set(reason);
        self.eviction.notify.notify_one();
    }

    /// Resolves once [`ClientHandle::evict`] has been called, with the first
    /// reason given.
    pub async fn evicted(&self) -> CloseReason {
        self.eviction.notify.notified().await;
        self.eviction
            .reason
            .get()
            .copied()
            .unwrap_or(CloseReason::RoleSuperseded)
    }
}
