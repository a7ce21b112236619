//! Connected sessions and their authority epochs

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::game::Outbox;
use crate::ws::protocol::ServerMsg;

struct SessionEntry {
    epoch: u64,
    display_name: String,
    outbox: Outbox,
}

/// One live session per identity. Every registration gets a fresh epoch;
/// only the holder of the current epoch may act for the identity.
#[derive(Default)]
pub struct SessionHub {
    sessions: DashMap<Uuid, SessionEntry>,
    next_epoch: AtomicU64,
}

impl SessionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, replacing (and revoking) any older one
    pub fn register(&self, identity: Uuid, display_name: String, outbox: Outbox) -> u64 {
        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.sessions.insert(
            identity,
            SessionEntry {
                epoch,
                display_name,
                outbox,
            },
        );
        if let Some(old) = previous {
            info!(identity = %identity, old_epoch = old.epoch, epoch, "Session replaced");
            let _ = old.outbox.try_send(ServerMsg::Error {
                code: "session_replaced".to_string(),
                message: "Signed in from another connection".to_string(),
            });
        }
        epoch
    }

    /// Remove the session if `epoch` is still current
    pub fn unregister(&self, identity: Uuid, epoch: u64) -> bool {
        let removed = self
            .sessions
            .remove_if(&identity, |_, entry| entry.epoch == epoch)
            .is_some();
        if removed {
            debug!(identity = %identity, epoch, "Session unregistered");
        }
        removed
    }

    pub fn is_current(&self, identity: Uuid, epoch: u64) -> bool {
        self.sessions
            .get(&identity)
            .is_some_and(|entry| entry.epoch == epoch)
    }

    pub fn is_connected(&self, identity: Uuid) -> bool {
        self.sessions
            .get(&identity)
            .is_some_and(|entry| !entry.outbox.is_closed())
    }

    /// Current epoch and outbox
    pub fn current(&self, identity: Uuid) -> Option<(u64, Outbox)> {
        self.sessions
            .get(&identity)
            .map(|entry| (entry.epoch, entry.outbox.clone()))
    }

    pub fn display_name(&self, identity: Uuid) -> Option<String> {
        self.sessions
            .get(&identity)
            .map(|entry| entry.display_name.clone())
    }

    pub fn set_display_name(&self, identity: Uuid, display_name: &str) {
        if let Some(mut entry) = self.sessions.get_mut(&identity) {
            entry.display_name = display_name.to_string();
        }
    }

    /// Best-effort send to the identity's current session
    pub fn send(&self, identity: Uuid, msg: ServerMsg) -> bool {
        self.sessions
            .get(&identity)
            .is_some_and(|entry| entry.outbox.try_send(msg).is_ok())
    }

    pub fn connected_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn newer_session_revokes_the_older_epoch() {
        let hub = SessionHub::new();
        let identity = Uuid::new_v4();
        let (old_tx, mut old_rx) = mpsc::channel(4);
        let (new_tx, _new_rx) = mpsc::channel(4);

        let first = hub.register(identity, "Ana".into(), old_tx);
        let second = hub.register(identity, "Ana".into(), new_tx);
        assert!(second > first);
        assert!(!hub.is_current(identity, first));
        assert!(hub.is_current(identity, second));
        assert!(matches!(old_rx.try_recv(), Ok(ServerMsg::Error { .. })));

        // The old connection closing must not drop the new one
        assert!(!hub.unregister(identity, first));
        assert!(hub.is_connected(identity));
        assert!(hub.unregister(identity, second));
        assert!(!hub.is_connected(identity));
    }

    #[test]
    fn closed_outbox_counts_as_disconnected() {
        let hub = SessionHub::new();
        let identity = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(4);
        hub.register(identity, "Ana".into(), tx);

        drop(rx);
        assert!(!hub.is_connected(identity));
        assert!(!hub.send(identity, ServerMsg::Draw));
    }
}
