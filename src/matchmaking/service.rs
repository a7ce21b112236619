//! Matchmaking service - owns the mode queues and turns full batches into
//! match instances

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GameTuning;
use crate::game::{InstanceManager, MatchMember};
use crate::store::ProfileService;
use crate::ws::protocol::{GameMode, ServerMsg};
use crate::ws::session::SessionHub;

use super::admission::{AdmissionSaga, AdmissionVerdict, TicketGate};
use super::queue::{ModeQueue, QueuedPlayer};

const SCHEDULER_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("{0} matches cannot be queued for")]
    NotQueueable(GameMode),

    #[error("Already searching for a {0} match")]
    AlreadyQueued(GameMode),

    #[error("Already in a match")]
    InMatch,

    #[error("No active connection")]
    NotConnected,
}

/// Matchmaking service
pub struct MatchmakingService {
    queues: HashMap<GameMode, Mutex<ModeQueue>>,
    /// Players pulled from a queue whose match is still being formed
    forming: DashSet<Uuid>,
    sessions: Arc<SessionHub>,
    instances: Arc<InstanceManager>,
    admission: AdmissionSaga<TicketGate>,
}

impl MatchmakingService {
    pub fn new(
        tuning: &GameTuning,
        sessions: Arc<SessionHub>,
        instances: Arc<InstanceManager>,
        store: Arc<dyn ProfileService>,
    ) -> Self {
        let queues = GameMode::QUEUED
            .iter()
            .map(|&mode| (mode, Mutex::new(ModeQueue::new(tuning.settings_for(mode)))))
            .collect();

        Self {
            queues,
            forming: DashSet::new(),
            sessions,
            instances,
            admission: AdmissionSaga::new(TicketGate::new(store, tuning.store_timeout)),
        }
    }

    /// Join a mode queue. Returns the queue size after joining.
    pub async fn enqueue(
        &self,
        user_id: Uuid,
        display_name: String,
        mode: GameMode,
    ) -> Result<usize, QueueError> {
        let queue = self.queues.get(&mode).ok_or(QueueError::NotQueueable(mode))?;
        if !self.sessions.is_connected(user_id) {
            return Err(QueueError::NotConnected);
        }
        if self.instances.registry().match_of(user_id).is_some() || self.forming.contains(&user_id)
        {
            return Err(QueueError::InMatch);
        }
        if let Some(existing) = self.queued_mode(user_id) {
            return Err(QueueError::AlreadyQueued(existing));
        }

        let now = Instant::now();
        let (size, formed) = {
            let mut queue = queue.lock();
            let formed = queue.enqueue(QueuedPlayer::new(user_id, display_name, now), now);
            (queue.len(), formed)
        };
        info!(identity = %user_id, mode = %mode, queue_size = size, "Player joined queue");

        if let Some(batch) = formed {
            self.launch(mode, batch).await;
        }
        self.broadcast_status(mode);
        Ok(size)
    }

    /// Leave whichever queue the player is in
    pub fn dequeue(&self, user_id: Uuid) -> bool {
        for (mode, queue) in &self.queues {
            let removed = queue.lock().dequeue(user_id).is_some();
            if removed {
                info!(identity = %user_id, mode = %mode, "Player left queue");
                self.broadcast_status(*mode);
                return true;
            }
        }
        false
    }

    pub fn queued_mode(&self, user_id: Uuid) -> Option<GameMode> {
        self.queues
            .iter()
            .find(|(_, q)| q.lock().contains(user_id))
            .map(|(mode, _)| *mode)
    }

    pub fn queue_size(&self, mode: GameMode) -> usize {
        self.queues.get(&mode).map(|q| q.lock().len()).unwrap_or(0)
    }

    pub fn total_queued(&self) -> usize {
        self.queues.values().map(|q| q.lock().len()).sum()
    }

    /// Spawn one scheduler task per queued mode
    pub fn spawn_schedulers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        GameMode::QUEUED
            .iter()
            .map(|&mode| {
                let service = self.clone();
                tokio::spawn(async move { service.run_mode(mode).await })
            })
            .collect()
    }

    async fn run_mode(&self, mode: GameMode) {
        let mut interval = tokio::time::interval(SCHEDULER_PERIOD);
        loop {
            interval.tick().await;
            self.tick(mode).await;
        }
    }

    /// One scheduler step: purge disconnected players, advance the countdown,
    /// form a match on expiry and report queue status
    pub async fn tick(&self, mode: GameMode) {
        let Some(queue) = self.queues.get(&mode) else {
            return;
        };
        let now = Instant::now();
        let (purged, formed) = {
            let mut queue = queue.lock();
            let purged = queue.retain(|p| self.sessions.is_connected(p.user_id));
            (purged, queue.tick(now))
        };
        for player in &purged {
            debug!(identity = %player.user_id, mode = %mode, "Purged disconnected player from queue");
        }

        if let Some(batch) = formed {
            self.launch(mode, batch).await;
        }
        self.broadcast_status(mode);
    }

    /// Turn a batch into a match, running ranked admission first. A rollback
    /// that refills the queue to capacity launches the next batch straight away.
    async fn launch(&self, mode: GameMode, batch: Vec<QueuedPlayer>) {
        let mut next = Some(batch);
        while let Some(batch) = next.take() {
            next = self.launch_batch(mode, batch).await;
        }
    }

    async fn launch_batch(
        &self,
        mode: GameMode,
        batch: Vec<QueuedPlayer>,
    ) -> Option<Vec<QueuedPlayer>> {
        let mut refilled = None;
        for player in &batch {
            self.forming.insert(player.user_id);
        }
        let ids: Vec<Uuid> = batch.iter().map(|p| p.user_id).collect();

        let admitted = if mode == GameMode::Ranked {
            let verdict = self
                .admission
                .commit_or_rollback(batch, |id| self.sessions.is_connected(id))
                .await;
            match verdict {
                AdmissionVerdict::Admitted(players) => Some(players),
                AdmissionVerdict::RolledBack { rejected, requeue } => {
                    for player in &rejected {
                        self.sessions.send(
                            player.user_id,
                            ServerMsg::LobbyNotice {
                                message: "A ranked ticket is required to play ranked".to_string(),
                            },
                        );
                    }
                    if let Some(queue) = self.queues.get(&mode) {
                        refilled = queue.lock().requeue_front(requeue, Instant::now());
                    }
                    None
                }
            }
        } else {
            Some(batch)
        };

        if let Some(players) = admitted {
            self.create_match(mode, players);
        }
        for id in ids {
            self.forming.remove(&id);
        }
        refilled
    }

    fn create_match(&self, mode: GameMode, players: Vec<QueuedPlayer>) {
        let on_start = (mode == GameMode::Ranked)
            .then(|| self.admission.consumer(players.iter().map(|p| p.user_id).collect()));
        let members: Vec<MatchMember> = players
            .iter()
            .map(|p| MatchMember {
                identity: p.user_id,
                display_name: p.display_name.clone(),
            })
            .collect();

        let longest_wait = players
            .iter()
            .map(|p| p.queued_at.elapsed())
            .max()
            .unwrap_or_default();

        match self.instances.create(members, mode, None, on_start) {
            Ok(handle) => {
                info!(
                    match_id = %handle.id,
                    mode = %mode,
                    player_count = players.len(),
                    longest_wait_secs = longest_wait.as_secs(),
                    "Match formed from queue"
                );
            }
            Err(e) => {
                warn!(mode = %mode, error = %e, "Failed to create match");
                for player in &players {
                    self.sessions.send(
                        player.user_id,
                        ServerMsg::LobbyNotice {
                            message: "Could not start the match, please search again".to_string(),
                        },
                    );
                }
            }
        }
    }

    fn broadcast_status(&self, mode: GameMode) {
        let Some(queue) = self.queues.get(&mode) else {
            return;
        };
        let (members, size, seconds_remaining) = {
            let queue = queue.lock();
            (queue.user_ids(), queue.len(), queue.seconds_remaining(Instant::now()))
        };
        for user_id in members {
            self.sessions.send(
                user_id,
                ServerMsg::QueueStatus {
                    mode,
                    size,
                    seconds_remaining,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::MatchRegistry;
    use crate::store::profiles::PlayerProfile;
    use crate::store::InMemoryProfileStore;
    use tokio::sync::mpsc;

    struct Fixture {
        service: MatchmakingService,
        sessions: Arc<SessionHub>,
        registry: Arc<MatchRegistry>,
        store: Arc<InMemoryProfileStore>,
    }

    fn fixture() -> Fixture {
        let tuning = Arc::new(GameTuning::default());
        let registry = Arc::new(MatchRegistry::new());
        let sessions = Arc::new(SessionHub::new());
        let store = Arc::new(InMemoryProfileStore::new());
        let instances = Arc::new(InstanceManager::new(
            registry.clone(),
            sessions.clone(),
            store.clone(),
            tuning.clone(),
        ));
        Fixture {
            service: MatchmakingService::new(&tuning, sessions.clone(), instances, store.clone()),
            sessions,
            registry,
            store,
        }
    }

    fn connect(f: &Fixture) -> (Uuid, mpsc::Receiver<ServerMsg>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(10_000);
        f.sessions.register(id, "P".into(), tx);
        (id, rx)
    }

    fn notices(rx: &mut mpsc::Receiver<ServerMsg>) -> Vec<ServerMsg> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn practice_countdown_expires_into_a_match() {
        let f = fixture();
        let (id, mut rx) = connect(&f);

        f.service.enqueue(id, "Ana".into(), GameMode::Practice).await.unwrap();
        assert!(notices(&mut rx).iter().any(|m| matches!(
            m,
            ServerMsg::QueueStatus { mode: GameMode::Practice, size: 1, seconds_remaining: Some(15) }
        )));

        tokio::time::advance(Duration::from_secs(15)).await;
        f.service.tick(GameMode::Practice).await;

        assert!(f.registry.match_of(id).is_some());
        assert_eq!(f.service.queue_size(GameMode::Practice), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicates_and_custom_mode_are_rejected() {
        let f = fixture();
        let (id, _rx) = connect(&f);

        f.service.enqueue(id, "Ana".into(), GameMode::Casual).await.unwrap();
        assert_eq!(
            f.service.enqueue(id, "Ana".into(), GameMode::Practice).await,
            Err(QueueError::AlreadyQueued(GameMode::Casual))
        );
        assert_eq!(
            f.service.enqueue(id, "Ana".into(), GameMode::Custom).await,
            Err(QueueError::NotQueueable(GameMode::Custom))
        );
        assert!(f.service.dequeue(id));
        assert!(!f.service.dequeue(id));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_players_are_purged_before_formation() {
        let f = fixture();
        let (stays, _rx_a) = connect(&f);
        let (leaves, rx_b) = connect(&f);

        f.service.enqueue(stays, "A".into(), GameMode::Casual).await.unwrap();
        f.service.enqueue(leaves, "B".into(), GameMode::Casual).await.unwrap();
        drop(rx_b);

        tokio::time::advance(Duration::from_secs(40)).await;
        f.service.tick(GameMode::Casual).await;

        // One player left: below the casual minimum, nothing forms
        assert!(f.registry.match_of(stays).is_none());
        assert_eq!(f.service.queue_size(GameMode::Casual), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ranked_without_tickets_rolls_back() {
        let f = fixture();
        let mut players = Vec::new();
        for tickets in [1, 1, 0] {
            let (id, rx) = connect(&f);
            f.store.put(PlayerProfile {
                tickets,
                ..PlayerProfile::new(id)
            });
            players.push((id, rx));
        }
        for (id, _) in &players {
            f.service.enqueue(*id, "P".into(), GameMode::Ranked).await.unwrap();
        }

        tokio::time::advance(Duration::from_secs(30)).await;
        f.service.tick(GameMode::Ranked).await;

        let (broke, broke_rx) = &mut players[2];
        assert!(f.registry.match_of(*broke).is_none());
        assert!(notices(broke_rx)
            .iter()
            .any(|m| matches!(m, ServerMsg::LobbyNotice { .. })));
        assert_eq!(f.service.queue_size(GameMode::Ranked), 2);
        assert_eq!(f.store.snapshot(players[0].0).unwrap().tickets, 1);
    }
}
