//! Match instances: records, handles, the registry and the manager that
//! creates, aborts and tears them down

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{GameTuning, MATCH_CAPACITY};
use crate::store::ProfileService;
use crate::ws::protocol::GameMode;
use crate::ws::session::SessionHub;

use super::action::{roll_modifier, RoundRules};
use super::combatant::{Combatant, Personality};
use super::engine::{EngineCommand, EngineExit, EngineSetup, RoundEngine};
use super::names::NameGenerator;
use super::observers::Observers;
use super::round::RoundState;
use super::scoring::ScoringAggregator;

/// Static facts about a match
#[derive(Debug)]
pub struct MatchRecord {
    pub id: Uuid,
    pub mode: GameMode,
    /// Room admin (custom rooms only)
    pub admin: Option<Uuid>,
    /// Human identities seated at creation
    pub members: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    instance_name: OnceLock<String>,
}

impl MatchRecord {
    pub fn new(id: Uuid, mode: GameMode, admin: Option<Uuid>, members: Vec<Uuid>) -> Self {
        Self {
            id,
            mode,
            admin,
            members,
            created_at: Utc::now(),
            instance_name: OnceLock::new(),
        }
    }

    /// Name of the execution context; assigned on first call and fixed afterwards
    pub fn instance_name(&self) -> &str {
        self.instance_name.get_or_init(|| {
            let id = self.id.simple().to_string();
            format!("arena-{}", &id[..8])
        })
    }

    pub fn has_member(&self, identity: Uuid) -> bool {
        self.members.contains(&identity)
    }
}

/// Counters the engine publishes for everyone else to read
#[derive(Debug, Default)]
pub struct InstanceStatus {
    pub round: AtomicU32,
    pub alive: AtomicUsize,
    /// Human sessions attached
    pub attached: AtomicUsize,
    pub started: AtomicBool,
    pub finished: AtomicBool,
    /// Engine is shutting down; no new attachments
    pub closing: AtomicBool,
}

impl InstanceStatus {
    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn attached(&self) -> usize {
        self.attached.load(Ordering::Relaxed)
    }
}

/// Handle to a running match
#[derive(Clone)]
pub struct MatchHandle {
    pub id: Uuid,
    pub record: Arc<MatchRecord>,
    pub commands: mpsc::Sender<EngineCommand>,
    pub status: Arc<InstanceStatus>,
    pub cancel: CancellationToken,
}

impl MatchHandle {
    pub fn attached_count(&self) -> usize {
        self.status.attached()
    }

    pub async fn send(&self, command: EngineCommand) -> Result<(), InstanceError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| InstanceError::Closed(self.id))
    }
}

/// Registry of all live matches and of which identity plays where
#[derive(Default)]
pub struct MatchRegistry {
    matches: DashMap<Uuid, MatchHandle>,
    memberships: DashMap<Uuid, Uuid>,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.get(id).map(|m| m.value().clone())
    }

    /// Register a handle and route its members to it
    pub fn insert(&self, handle: MatchHandle) {
        for identity in &handle.record.members {
            self.memberships.insert(*identity, handle.id);
        }
        self.matches.insert(handle.id, handle);
    }

    /// Drop a handle and every membership still pointing at it
    pub fn remove(&self, id: &Uuid) -> Option<MatchHandle> {
        self.memberships.retain(|_, match_id| *match_id != *id);
        self.matches.remove(id).map(|(_, h)| h)
    }

    pub fn handles(&self) -> Vec<MatchHandle> {
        self.matches.iter().map(|m| m.value().clone()).collect()
    }

    /// Match an identity is routed to
    pub fn match_of(&self, identity: Uuid) -> Option<MatchHandle> {
        let match_id = *self.memberships.get(&identity)?;
        self.get(&match_id)
    }

    pub fn bind_member(&self, identity: Uuid, match_id: Uuid) {
        self.memberships.insert(identity, match_id);
    }

    /// Stop routing `identity` to `match_id`
    pub fn unbind_member(&self, identity: Uuid, match_id: Uuid) {
        self.memberships.remove_if(&identity, |_, current| *current == match_id);
    }

    pub fn active_matches(&self) -> usize {
        self.matches.len()
    }

    pub fn total_players(&self) -> usize {
        self.matches
            .iter()
            .map(|m| m.value().attached_count())
            .sum()
    }

    /// Cancel every engine (process shutdown)
    pub fn shutdown(&self) {
        for entry in self.matches.iter() {
            entry.value().cancel.cancel();
        }
    }
}

/// A human about to be seated
#[derive(Debug, Clone)]
pub struct MatchMember {
    pub identity: Uuid,
    pub display_name: String,
}

/// Fill the arena with bots up to capacity
pub fn fill_with_bots<R: Rng + ?Sized>(
    combatants: &mut Vec<Combatant>,
    rules: &RoundRules,
    rng: &mut R,
) -> usize {
    let mut names = NameGenerator::with_taken(combatants.iter().map(|c| c.name.as_str()));
    let mut added = 0;
    while combatants.len() < MATCH_CAPACITY {
        let seat = combatants.len();
        let name = names.next(rng);
        combatants.push(Combatant::bot(
            seat,
            name,
            Personality::random(rng),
            rules.max_health,
            rules.starting_ammo,
        ));
        added += 1;
    }
    added
}

/// Creates and aborts match instances
pub struct InstanceManager {
    registry: Arc<MatchRegistry>,
    sessions: Arc<SessionHub>,
    store: Arc<dyn ProfileService>,
    tuning: Arc<GameTuning>,
}

impl InstanceManager {
    pub fn new(
        registry: Arc<MatchRegistry>,
        sessions: Arc<SessionHub>,
        store: Arc<dyn ProfileService>,
        tuning: Arc<GameTuning>,
    ) -> Self {
        Self {
            registry,
            sessions,
            store,
            tuning,
        }
    }

    pub fn registry(&self) -> &Arc<MatchRegistry> {
        &self.registry
    }

    /// Seat the members, fill with bots, register and spawn the engine
    pub fn create(
        &self,
        members: Vec<MatchMember>,
        mode: GameMode,
        admin: Option<Uuid>,
        on_start: Option<BoxFuture<'static, ()>>,
    ) -> Result<MatchHandle, InstanceError> {
        if members.is_empty() {
            return Err(InstanceError::NoMembers);
        }
        if members.len() > MATCH_CAPACITY {
            return Err(InstanceError::TooManyMembers(members.len()));
        }
        if let Some(member) = members
            .iter()
            .find(|m| self.registry.match_of(m.identity).is_some())
        {
            return Err(InstanceError::AlreadyInMatch(member.identity));
        }

        let match_id = Uuid::new_v4();
        let seed: u64 = rand::random();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let modifier = roll_modifier(&mut rng);
        let rules = RoundRules::for_modifier(modifier, self.tuning.mission_chance);

        let mut combatants: Vec<Combatant> = members
            .iter()
            .enumerate()
            .map(|(seat, m)| {
                Combatant::human(
                    seat,
                    m.identity,
                    m.display_name.clone(),
                    rules.max_health,
                    rules.starting_ammo,
                )
            })
            .collect();
        let bots = fill_with_bots(&mut combatants, &rules, &mut rng);

        // Relocate members: bind every connected session as an observer
        let mut observers = Observers::new();
        for combatant in &mut combatants {
            let Some(identity) = combatant.identity else {
                continue;
            };
            match self.sessions.current(identity) {
                Some((epoch, outbox)) => {
                    combatant.authority_epoch = epoch;
                    observers.attach(identity, outbox, epoch);
                }
                None => {
                    warn!(match_id = %match_id, identity = %identity, "Member has no session, seating as AFK");
                    combatant.afk = true;
                }
            }
        }

        let record = Arc::new(MatchRecord::new(
            match_id,
            mode,
            admin,
            members.iter().map(|m| m.identity).collect(),
        ));
        let instance_name = record.instance_name().to_string();

        let scoring = ScoringAggregator::new(
            match_id,
            self.tuning.settings_for(mode).ranked_scoring,
            &combatants,
            self.store.clone(),
            self.tuning.store_timeout,
            self.tuning.ranked_win_bonus,
        );
        let state = RoundState::new(match_id, combatants, modifier, rules, seed);

        let (commands, command_rx) = mpsc::channel(256);
        let status = Arc::new(InstanceStatus::default());
        let cancel = CancellationToken::new();
        let handle = MatchHandle {
            id: match_id,
            record: record.clone(),
            commands,
            status: status.clone(),
            cancel: cancel.clone(),
        };

        let engine = RoundEngine::new(
            EngineSetup {
                state,
                mode,
                instance_name: instance_name.clone(),
                settings: self.tuning.settings_for(mode),
                tuning: self.tuning.clone(),
                observers,
                scoring,
                status,
                cancel,
                on_start,
                seed,
            },
            command_rx,
        );

        self.registry.insert(handle.clone());
        info!(
            match_id = %match_id,
            instance = %instance_name,
            mode = %mode,
            humans = members.len(),
            bots,
            modifier = ?modifier,
            "Created match instance"
        );

        let registry = self.registry.clone();
        tokio::spawn(async move {
            let exit = engine.run().await;
            registry.remove(&match_id);
            match exit {
                EngineExit::Finished(outcome) => {
                    info!(match_id = %match_id, outcome = ?outcome, "Instance torn down")
                }
                EngineExit::Aborted(reason) => {
                    info!(match_id = %match_id, reason = %reason, "Instance aborted")
                }
                EngineExit::Cancelled => info!(match_id = %match_id, "Instance cancelled"),
            }
        });

        Ok(handle)
    }

    /// Abort a match that has not started round 1
    pub async fn abort(&self, match_id: Uuid, reason: &str) -> Result<(), InstanceError> {
        let handle = self
            .registry
            .get(&match_id)
            .ok_or(InstanceError::NotFound(match_id))?;
        if handle.status.started() {
            return Err(InstanceError::AlreadyStarted);
        }

        let (reply, result) = oneshot::channel();
        handle
            .send(EngineCommand::Abort {
                reason: reason.to_string(),
                reply,
            })
            .await?;
        result.await.map_err(|_| InstanceError::Closed(match_id))?
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstanceError {
    #[error("match {0} not found")]
    NotFound(Uuid),

    #[error("match already started")]
    AlreadyStarted,

    #[error("match {0} is shutting down")]
    Closed(Uuid),

    #[error("a match needs at least one member")]
    NoMembers,

    #[error("{0} members exceed match capacity")]
    TooManyMembers(usize),

    #[error("{0} is already in a match")]
    AlreadyInMatch(Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryProfileStore;
    use crate::ws::protocol::ServerMsg;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::time::Instant;

    fn manager() -> (InstanceManager, Arc<SessionHub>) {
        let sessions = Arc::new(SessionHub::new());
        let manager = InstanceManager::new(
            Arc::new(MatchRegistry::new()),
            sessions.clone(),
            Arc::new(InMemoryProfileStore::new()),
            Arc::new(GameTuning::default()),
        );
        (manager, sessions)
    }

    fn member(name: &str) -> MatchMember {
        MatchMember {
            identity: Uuid::new_v4(),
            display_name: name.to_string(),
        }
    }

    #[test]
    fn instance_name_is_assigned_once() {
        let record = MatchRecord::new(Uuid::new_v4(), GameMode::Casual, None, vec![]);
        let first = record.instance_name().to_string();
        assert!(first.starts_with("arena-"));
        assert_eq!(record.instance_name(), first);
    }

    #[test]
    fn bots_fill_to_capacity_with_unique_names() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let rules = RoundRules::default();
        let mut combatants = vec![Combatant::human(0, Uuid::new_v4(), "Ana".into(), 3, 0)];

        assert_eq!(fill_with_bots(&mut combatants, &rules, &mut rng), 5);
        assert_eq!(combatants.len(), MATCH_CAPACITY);
        let names: HashSet<&str> = combatants.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names.len(), MATCH_CAPACITY);
        assert!(combatants.iter().enumerate().all(|(i, c)| c.seat == i));
        assert!(combatants[1..].iter().all(|c| c.is_bot() && c.personality.is_some()));
    }

    #[test]
    fn registry_routes_members_until_removed() {
        let registry = MatchRegistry::new();
        let (commands, _rx) = mpsc::channel(1);
        let identity = Uuid::new_v4();
        let record = Arc::new(MatchRecord::new(Uuid::new_v4(), GameMode::Casual, None, vec![identity]));
        let handle = MatchHandle {
            id: record.id,
            record: record.clone(),
            commands,
            status: Arc::new(InstanceStatus::default()),
            cancel: CancellationToken::new(),
        };

        registry.insert(handle);
        assert_eq!(registry.match_of(identity).map(|h| h.id), Some(record.id));

        registry.unbind_member(identity, Uuid::new_v4());
        assert!(registry.match_of(identity).is_some());

        registry.remove(&record.id);
        assert!(registry.match_of(identity).is_none());
        assert_eq!(registry.active_matches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn create_then_abort_before_start() {
        let (manager, sessions) = manager();
        let ana = member("Ana");
        let (tx, mut rx) = mpsc::channel(64);
        sessions.register(ana.identity, "Ana".into(), tx);

        let handle = manager
            .create(vec![ana.clone()], GameMode::Practice, None, None)
            .unwrap();
        assert!(manager.registry().match_of(ana.identity).is_some());
        assert!(matches!(
            manager.create(vec![ana.clone()], GameMode::Practice, None, None),
            Err(InstanceError::AlreadyInMatch(_))
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.abort(handle.id, "cancelled").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(manager.registry().get(&handle.id).is_none());
        assert!(manager.registry().match_of(ana.identity).is_none());

        let mut saw_found = false;
        let mut saw_abort = false;
        while let Ok(msg) = rx.try_recv() {
            match msg {
                ServerMsg::MatchFound { combatants, .. } => {
                    saw_found = true;
                    assert_eq!(combatants.len(), MATCH_CAPACITY);
                }
                ServerMsg::MatchAborted { .. } => saw_abort = true,
                _ => {}
            }
        }
        assert!(saw_found && saw_abort);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_match_tears_down_after_the_grace_window() {
        let (manager, sessions) = manager();
        let ana = member("Ana");
        let (tx, _rx) = mpsc::channel(1_024);
        let epoch = sessions.register(ana.identity, "Ana".into(), tx);

        let handle = manager
            .create(vec![ana.clone()], GameMode::Practice, None, None)
            .unwrap();
        handle
            .send(EngineCommand::ToggleReady { identity: ana.identity, epoch })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.status.started());
        handle
            .send(EngineCommand::Detach { identity: ana.identity, epoch })
            .await
            .unwrap();

        let step = Duration::from_millis(50);
        while !handle.status.finished() {
            tokio::time::sleep(step).await;
        }
        let finished_at = Instant::now();
        assert!(manager.registry().get(&handle.id).is_some());

        while manager.registry().get(&handle.id).is_some() {
            tokio::time::sleep(step).await;
        }
        let lingered = finished_at.elapsed();

        let tuning = GameTuning::default();
        assert!(lingered + step >= tuning.teardown_grace);
        assert!(lingered < tuning.teardown_grace + tuning.teardown_poll);
        assert!(manager.registry().match_of(ana.identity).is_none());
    }
}
