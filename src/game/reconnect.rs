//! Rebinding a returning identity to the combatant it already owns

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use super::engine::EngineCommand;
use super::instance::MatchRegistry;
use super::observers::Outbox;

/// Result of a reattach attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReattachOutcome {
    /// Bound to an existing combatant in this match
    Reattached(Uuid),
    /// No combatant found; the normal lobby flow applies
    SpawnAllowed,
    /// The hinted match already started without this identity
    Refused,
}

pub struct ReconnectionResolver {
    registry: Arc<MatchRegistry>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl ReconnectionResolver {
    pub fn new(registry: Arc<MatchRegistry>) -> Self {
        Self {
            registry,
            locks: DashMap::new(),
        }
    }

    /// Scan live instances for a combatant owned by `identity` and hand it
    /// to the new session. Serialised per identity.
    pub async fn try_reattach(
        &self,
        identity: Uuid,
        hint: Option<Uuid>,
        epoch: u64,
        outbox: Outbox,
    ) -> ReattachOutcome {
        let lock = self.locks.entry(identity).or_default().clone();
        let outcome = {
            let _guard = lock.lock().await;
            self.resolve(identity, hint, epoch, outbox).await
        };
        drop(lock);
        self.locks
            .remove_if(&identity, |_, l| Arc::strong_count(l) == 1);
        outcome
    }

    async fn resolve(
        &self,
        identity: Uuid,
        hint: Option<Uuid>,
        epoch: u64,
        outbox: Outbox,
    ) -> ReattachOutcome {
        // A live membership wins over matches the identity walked away from
        let candidates = match self.registry.match_of(identity) {
            Some(current) => vec![current],
            None => self.registry.handles(),
        };
        for handle in candidates {
            if !handle.record.has_member(identity)
                || handle.status.finished()
                || handle.status.closing()
            {
                continue;
            }

            let (reply, found) = oneshot::channel();
            let attach = EngineCommand::Attach {
                identity,
                epoch,
                outbox: outbox.clone(),
                reply,
            };
            if handle.send(attach).await.is_err() {
                continue;
            }
            if let Ok(true) = found.await {
                self.registry.bind_member(identity, handle.id);
                info!(
                    identity = %identity,
                    match_id = %handle.id,
                    epoch,
                    "Reattached to running match"
                );
                return ReattachOutcome::Reattached(handle.id);
            }
        }

        match hint.and_then(|id| self.registry.get(&id)) {
            Some(handle) if handle.status.started() => {
                debug!(identity = %identity, match_id = %handle.id, "Reattach refused");
                ReattachOutcome::Refused
            }
            _ => ReattachOutcome::SpawnAllowed,
        }
    }
}
