//! Session registry
//!
//! The only state shared between connection tasks. Tracks every connected
//! client, the role it declared, and the single sender/receiver session. All
//! operations take one short-lived lock, never held across an `.await` or a
//! socket write: cross-client deliveries are non-blocking queue pushes.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::client::{ClientHandle, ClientId, ClientState, Delivery};
use crate::model::envelope::{Envelope, Role};
use crate::model::propagated::{CloseReason, Propagated};

/// A role declaration that was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejected {
    #[error("a role was already declared on this connection")]
    AlreadyDeclared,
    #[error("client is not registered")]
    UnknownClient,
}

impl Rejected {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejected::AlreadyDeclared => "AlreadyDeclared",
            Rejected::UnknownClient => "UnknownClient",
        }
    }
}

/// The client has no peer yet. Expected while waiting; not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("not paired")]
pub struct NotPaired;

/// Outcome of a successful role declaration.
#[derive(Debug)]
pub struct SlotAssignment {
    pub role: Role,
    /// Previous occupant of the slot, already marked superseded. The caller
    /// is responsible for disconnecting it.
    pub superseded: Option<ClientHandle>,
    /// The counterpart, if the session is now complete.
    pub peer: Option<ClientId>,
    /// Whether a buffered offer was handed to the new receiver.
    pub replayed_offer: bool,
}

/// Where a routed envelope ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    Delivered(ClientId),
    /// Peer's queue was full; dropped and the peer evicted.
    Dropped(ClientId),
    /// Not paired; the offer was kept for replay.
    Buffered,
}

/// Registry policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct RegistryOptions {
    /// Buffer the latest unpaired offer and replay it when a receiver pairs.
    pub replay_offer: bool,
    /// Send `PeerLeft` to the remaining client when its counterpart goes away.
    pub notify_peer_left: bool,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            replay_offer: true,
            notify_peer_left: true,
        }
    }
}

#[derive(Debug)]
struct ClientEntry {
    state: ClientState,
    handle: ClientHandle,
}

/// The single sender/receiver pairing.
#[derive(Debug, Default)]
struct Session {
    sender: Option<ClientId>,
    receiver: Option<ClientId>,
    pending_offer: Option<Value>,
}

impl Session {
    fn slot(&self, role: Role) -> Option<ClientId> {
        match role {
            Role::Sender => self.sender,
            Role::Receiver => self.receiver,
        }
    }

    fn slot_mut(&mut self, role: Role) -> &mut Option<ClientId> {
        match role {
            Role::Sender => &mut self.sender,
            Role::Receiver => &mut self.receiver,
        }
    }

    fn role_of(&self, id: ClientId) -> Option<Role> {
        if self.sender == Some(id) {
            Some(Role::Sender)
        } else if self.receiver == Some(id) {
            Some(Role::Receiver)
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    clients: HashMap<ClientId, ClientEntry>,
    session: Session,
}

impl RegistryState {
    /// Clear a slot, notifying whoever sat in the opposite one.
    fn vacate(&mut self, role: Role, notify: bool) -> Option<ClientId> {
        *self.session.slot_mut(role) = None;
        if role == Role::Sender {
            self.session.pending_offer = None;
        }

        let peer = self.session.slot(role.counterpart())?;
        if notify {
            if let Some(entry) = self.clients.get(&peer) {
                if entry.handle.deliver(Propagated::PeerLeft) != Delivery::Queued {
                    debug!("Client({}) did not take PeerLeft", peer);
                }
            }
        }
        Some(peer)
    }
}

/// Snapshot of who holds which slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub sender: Option<ClientId>,
    pub receiver: Option<ClientId>,
    pub pending_offer: bool,
    pub clients: usize,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    options: RegistryOptions,
    inner: Mutex<RegistryState>,
}

impl SessionRegistry {
    pub fn new(options: RegistryOptions) -> SessionRegistry {
        SessionRegistry {
            options,
            inner: Mutex::new(RegistryState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // Every operation leaves the state consistent before it can panic,
        // so a poisoned lock still guards valid data.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a freshly connected client as `Unassigned`.
    pub fn register(&self, handle: ClientHandle) {
        let id = handle.id;
        let mut state = self.lock();
        state.clients.insert(
            id,
            ClientEntry {
                state: ClientState::Unassigned,
                handle,
            },
        );
        debug!("Client({}) registered ({} connected)", id, state.clients.len());
    }

    /// Claim `role` in the session for `id`.
    ///
    /// An occupied slot is taken over: the previous occupant is marked
    /// superseded and returned so the caller can close it.
    pub fn declare_role(&self, id: ClientId, role: Role) -> Result<SlotAssignment, Rejected> {
        let mut state = self.lock();

        let Some(entry) = state.clients.get_mut(&id) else {
            return Err(Rejected::UnknownClient);
        };
        if entry.state != ClientState::Unassigned {
            return Err(Rejected::AlreadyDeclared);
        }
        entry.state = ClientState::Declared(role);

        let previous = state.session.slot(role).filter(|prev| *prev != id);
        let mut superseded = None;
        if let Some(prev) = previous {
            state.vacate(role, self.options.notify_peer_left);
            if let Some(prev_entry) = state.clients.get_mut(&prev) {
                prev_entry.state = ClientState::Superseded(role);
                superseded = Some(prev_entry.handle.clone());
            }
        }
        *state.session.slot_mut(role) = Some(id);

        let peer = state.session.slot(role.counterpart());

        let mut replayed_offer = false;
        if role == Role::Receiver && self.options.replay_offer {
            if let Some(offer) = state.session.pending_offer.take() {
                // Pushed under the lock so the replay precedes anything the
                // sender forwards after seeing the pairing.
                if let Some(entry) = state.clients.get(&id) {
                    replayed_offer = entry
                        .handle
                        .deliver(Propagated::Relay(Envelope::Offer(offer)))
                        == Delivery::Queued;
                }
            }
        }

        Ok(SlotAssignment {
            role,
            superseded,
            peer,
            replayed_offer,
        })
    }

    /// The other slot's occupant, if both slots are filled and `id` holds one.
    pub fn peer_of(&self, id: ClientId) -> Result<ClientId, NotPaired> {
        let state = self.lock();
        let role = state.session.role_of(id).ok_or(NotPaired)?;
        state.session.slot(role.counterpart()).ok_or(NotPaired)
    }

    /// Route a negotiation envelope from `from` to its peer.
    ///
    /// The push happens inside the critical section, so envelopes from one
    /// client reach its peer's queue in the order this is called.
    pub fn forward(&self, from: ClientId, envelope: Envelope) -> Result<Forwarded, NotPaired> {
        let mut state = self.lock();
        let role = state.session.role_of(from).ok_or(NotPaired)?;

        let peer = state
            .session
            .slot(role.counterpart())
            .and_then(|peer| state.clients.get(&peer))
            .map(|entry| entry.handle.clone());

        let Some(peer) = peer else {
            if role == Role::Sender && self.options.replay_offer {
                if let Envelope::Offer(offer) = envelope {
                    state.session.pending_offer = Some(offer);
                    return Ok(Forwarded::Buffered);
                }
            }
            return Err(NotPaired);
        };

        if matches!(envelope, Envelope::Offer(_)) {
            state.session.pending_offer = None;
        }

        match peer.deliver(Propagated::Relay(envelope)) {
            Delivery::Queued => Ok(Forwarded::Delivered(peer.id)),
            // The lagging peer is closed; its counterpart gets PeerLeft once
            // that teardown removes it.
            Delivery::Full => {
                warn!(
                    "Client({}) outbound queue full, dropping envelope and evicting",
                    peer.id
                );
                peer.evict(CloseReason::SlowConsumer);
                Ok(Forwarded::Dropped(peer.id))
            }
            // The peer's task is tearing down and will clear its slot.
            Delivery::Closed => Err(NotPaired),
        }
    }

    /// Forget `id`, clearing whichever slot it held. Idempotent.
    ///
    /// Returns the peer it was paired with, if any; that peer has been sent
    /// `PeerLeft` when the policy is enabled.
    pub fn remove(&self, id: ClientId) -> Option<ClientId> {
        let mut state = self.lock();
        state.clients.remove(&id)?;

        let role = state.session.role_of(id)?;
        state.vacate(role, self.options.notify_peer_left)
    }

    pub fn state_of(&self, id: ClientId) -> Option<ClientState> {
        self.lock().clients.get(&id).map(|entry| entry.state)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.lock();
        SessionSnapshot {
            sender: state.session.sender,
            receiver: state.session.receiver,
            pending_offer: state.session.pending_offer.is_some(),
            clients: state.clients.len(),
        }
    }
}
