//! Per-match observer set: who receives what the engine publishes

use std::collections::HashMap;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ws::protocol::ServerMsg;

/// Outbound channel of one WebSocket session
pub type Outbox = mpsc::Sender<ServerMsg>;

struct Slot {
    outbox: Outbox,
    epoch: u64,
}

/// Sessions currently attached to a match, keyed by identity
#[derive(Default)]
pub struct Observers {
    slots: HashMap<Uuid, Slot>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an identity to a session; replaces any older binding
    pub fn attach(&mut self, identity: Uuid, outbox: Outbox, epoch: u64) -> bool {
        self.slots
            .insert(identity, Slot { outbox, epoch })
            .is_some()
    }

    /// Unbind, but only if `epoch` is still the bound one
    pub fn detach(&mut self, identity: Uuid, epoch: u64) -> bool {
        match self.slots.get(&identity) {
            Some(slot) if slot.epoch == epoch => {
                self.slots.remove(&identity);
                true
            }
            _ => false,
        }
    }

    /// Unbind everyone, returning who was attached
    pub fn detach_all(&mut self) -> Vec<Uuid> {
        self.slots.drain().map(|(identity, _)| identity).collect()
    }

    /// Drop slots whose session is gone
    pub fn prune_closed(&mut self) -> Vec<Uuid> {
        let closed: Vec<Uuid> = self
            .slots
            .iter()
            .filter(|(_, s)| s.outbox.is_closed())
            .map(|(id, _)| *id)
            .collect();
        for id in &closed {
            self.slots.remove(id);
        }
        closed
    }

    pub fn is_attached(&self, identity: Uuid) -> bool {
        self.slots.contains_key(&identity)
    }

    pub fn epoch(&self, identity: Uuid) -> Option<u64> {
        self.slots.get(&identity).map(|s| s.epoch)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn identities(&self) -> Vec<Uuid> {
        self.slots.keys().copied().collect()
    }

    /// Same message to every observer
    pub fn broadcast(&self, msg: &ServerMsg) {
        for (identity, slot) in &self.slots {
            deliver(*identity, &slot.outbox, msg.clone());
        }
    }

    /// Per-observer message
    pub fn broadcast_with(&self, mut build: impl FnMut(Uuid) -> ServerMsg) {
        for (identity, slot) in &self.slots {
            deliver(*identity, &slot.outbox, build(*identity));
        }
    }

    /// Targeted send; false if the identity is not attached
    pub fn send_to(&self, identity: Uuid, msg: ServerMsg) -> bool {
        match self.slots.get(&identity) {
            Some(slot) => deliver(identity, &slot.outbox, msg),
            None => false,
        }
    }
}

fn deliver(identity: Uuid, outbox: &Outbox, msg: ServerMsg) -> bool {
    match outbox.try_send(msg) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(identity = %identity, "Session outbox full, dropping message");
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(identity = %identity, "Session outbox closed");
            false
        }
    }
}
