//! Two-phase admission for gated queues
//!
//! Every candidate is checked twice before a match is created. Nothing is
//! consumed until the match is known to start, so a failed batch can be put
//! back in the queue without side effects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::{with_timeout, ProfileService};

use super::queue::QueuedPlayer;

/// A resource a player must hold to enter a match
#[async_trait]
pub trait AdmissionGate: Send + Sync + 'static {
    /// Whether the player currently qualifies. Errors count as `false`.
    async fn check(&self, user_id: Uuid) -> bool;

    /// Spend the resource once the match is guaranteed to start
    async fn consume(&self, user_id: Uuid);
}

/// Ranked tickets held in the profile document
pub struct TicketGate {
    store: Arc<dyn ProfileService>,
    timeout: Duration,
}

impl TicketGate {
    pub fn new(store: Arc<dyn ProfileService>, timeout: Duration) -> Self {
        Self { store, timeout }
    }
}

#[async_trait]
impl AdmissionGate for TicketGate {
    async fn check(&self, user_id: Uuid) -> bool {
        match with_timeout(self.timeout, self.store.ticket_count(user_id)).await {
            Ok(tickets) => tickets >= 1,
            Err(e) => {
                warn!(identity = %user_id, error = %e, "Ticket check failed");
                false
            }
        }
    }

    async fn consume(&self, user_id: Uuid) {
        match with_timeout(self.timeout, self.store.consume_ticket(user_id)).await {
            Ok(true) => {}
            Ok(false) => warn!(identity = %user_id, "No ticket left to consume"),
            Err(e) => warn!(identity = %user_id, error = %e, "Ticket consumption failed"),
        }
    }
}

/// Result of running a candidate batch through the gate
#[derive(Debug)]
pub enum AdmissionVerdict {
    /// Every candidate passed both phases
    Admitted(Vec<QueuedPlayer>),
    /// At least one candidate failed; nothing was consumed
    RolledBack {
        rejected: Vec<QueuedPlayer>,
        requeue: Vec<QueuedPlayer>,
    },
}

pub struct AdmissionSaga<G: AdmissionGate> {
    gate: Arc<G>,
}

impl<G: AdmissionGate> AdmissionSaga<G> {
    pub fn new(gate: G) -> Self {
        Self {
            gate: Arc::new(gate),
        }
    }

    /// Ids of the candidates that fail the gate
    pub async fn check_all(&self, candidates: &[QueuedPlayer]) -> Vec<Uuid> {
        let checks = candidates.iter().map(|c| {
            let gate = self.gate.clone();
            let id = c.user_id;
            async move { (id, gate.check(id).await) }
        });
        join_all(checks)
            .await
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(id, _)| id)
            .collect()
    }

    /// Check, then confirm (gate again plus connectivity). Any failure rolls
    /// the whole batch back.
    pub async fn commit_or_rollback(
        &self,
        candidates: Vec<QueuedPlayer>,
        is_connected: impl Fn(Uuid) -> bool,
    ) -> AdmissionVerdict {
        let failed = self.check_all(&candidates).await;
        if !failed.is_empty() {
            return rollback(candidates, &failed, "check");
        }

        let mut failed = self.check_all(&candidates).await;
        let gone: Vec<Uuid> = candidates
            .iter()
            .map(|c| c.user_id)
            .filter(|id| !is_connected(*id) && !failed.contains(id))
            .collect();
        failed.extend(gone);
        if !failed.is_empty() {
            return rollback(candidates, &failed, "confirm");
        }

        AdmissionVerdict::Admitted(candidates)
    }

    /// Future that consumes the gate for every admitted player
    pub fn consumer(&self, user_ids: Vec<Uuid>) -> BoxFuture<'static, ()> {
        let gate = self.gate.clone();
        async move {
            for id in user_ids {
                gate.consume(id).await;
            }
        }
        .boxed()
    }
}

fn rollback(candidates: Vec<QueuedPlayer>, failed: &[Uuid], phase: &str) -> AdmissionVerdict {
    let (rejected, requeue): (Vec<_>, Vec<_>) = candidates
        .into_iter()
        .partition(|c| failed.contains(&c.user_id));
    info!(
        phase,
        rejected = rejected.len(),
        requeued = requeue.len(),
        "Admission rolled back"
    );
    AdmissionVerdict::RolledBack { rejected, requeue }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::profiles::PlayerProfile;
    use crate::store::InMemoryProfileStore;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn seeded(store: &InMemoryProfileStore, tickets: u32) -> QueuedPlayer {
        let id = Uuid::new_v4();
        store.put(PlayerProfile {
            tickets,
            ..PlayerProfile::new(id)
        });
        QueuedPlayer::new(id, "P".into(), Instant::now())
    }

    #[tokio::test]
    async fn all_ticket_holders_are_admitted_without_spending() {
        let store = Arc::new(InMemoryProfileStore::new());
        let a = seeded(&store, 1);
        let b = seeded(&store, 2);
        let saga = AdmissionSaga::new(TicketGate::new(store.clone(), Duration::from_secs(3)));

        let verdict = saga.commit_or_rollback(vec![a.clone(), b.clone()], |_| true).await;
        assert!(matches!(verdict, AdmissionVerdict::Admitted(ref p) if p.len() == 2));
        assert_eq!(store.snapshot(a.user_id).unwrap().tickets, 1);

        saga.consumer(vec![a.user_id, b.user_id]).await;
        assert_eq!(store.snapshot(a.user_id).unwrap().tickets, 0);
        assert_eq!(store.snapshot(b.user_id).unwrap().tickets, 1);
    }

    #[tokio::test]
    async fn missing_ticket_rejects_only_that_candidate() {
        let store = Arc::new(InMemoryProfileStore::new());
        let broke = seeded(&store, 0);
        let a = seeded(&store, 1);
        let b = seeded(&store, 1);
        let saga = AdmissionSaga::new(TicketGate::new(store.clone(), Duration::from_secs(3)));

        match saga
            .commit_or_rollback(vec![a.clone(), broke.clone(), b.clone()], |_| true)
            .await
        {
            AdmissionVerdict::RolledBack { rejected, requeue } => {
                assert_eq!(rejected.len(), 1);
                assert_eq!(rejected[0].user_id, broke.user_id);
                let order: Vec<Uuid> = requeue.iter().map(|p| p.user_id).collect();
                assert_eq!(order, vec![a.user_id, b.user_id]);
            }
            other => panic!("expected rollback, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_between_phases_rolls_back_without_consumption() {
        let store = Arc::new(InMemoryProfileStore::new());
        let a = seeded(&store, 1);
        let gone = seeded(&store, 1);
        let saga = AdmissionSaga::new(TicketGate::new(store.clone(), Duration::from_secs(3)));

        let disconnected: HashSet<Uuid> = [gone.user_id].into();
        let verdict = saga
            .commit_or_rollback(vec![a.clone(), gone.clone()], |id| !disconnected.contains(&id))
            .await;

        match verdict {
            AdmissionVerdict::RolledBack { rejected, requeue } => {
                assert_eq!(rejected[0].user_id, gone.user_id);
                assert_eq!(requeue[0].user_id, a.user_id);
            }
            other => panic!("expected rollback, got {other:?}"),
        }
        assert_eq!(store.snapshot(a.user_id).unwrap().tickets, 1);
        assert_eq!(store.snapshot(gone.user_id).unwrap().tickets, 1);
    }

    #[tokio::test]
    async fn unreachable_store_fails_closed() {
        let store = Arc::new(InMemoryProfileStore::new());
        let a = seeded(&store, 5);
        store.set_unavailable(true);
        let saga = AdmissionSaga::new(TicketGate::new(store, Duration::from_secs(3)));

        assert_eq!(saga.check_all(&[a.clone()]).await, vec![a.user_id]);
    }

    struct CountingGate {
        checks: AtomicUsize,
        consumed: AtomicUsize,
    }

    #[async_trait]
    impl AdmissionGate for CountingGate {
        async fn check(&self, _user_id: Uuid) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            true
        }

        async fn consume(&self, _user_id: Uuid) {
            self.consumed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn both_phases_run_before_admission() {
        let saga = AdmissionSaga::new(CountingGate {
            checks: AtomicUsize::new(0),
            consumed: AtomicUsize::new(0),
        });
        let players = vec![
            QueuedPlayer::new(Uuid::new_v4(), "A".into(), Instant::now()),
            QueuedPlayer::new(Uuid::new_v4(), "B".into(), Instant::now()),
        ];

        let verdict = tokio_test::block_on(saga.commit_or_rollback(players, |_| true));
        assert!(matches!(verdict, AdmissionVerdict::Admitted(_)));
        assert_eq!(saga.gate.checks.load(Ordering::SeqCst), 4);
        assert_eq!(saga.gate.consumed.load(Ordering::SeqCst), 0);
    }
}
