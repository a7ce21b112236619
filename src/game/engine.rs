//! Async round driver for one match instance
//!
//! Owns the `RoundState` and the observer set, and is the only place they
//! are mutated. Commands from sessions arrive on an mpsc channel and are
//! processed during every suspension point: the waiting room, the decision
//! window, the pauses between execution stages and the teardown linger.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{GameTuning, ModeSettings};
use crate::util::time::seconds_until;
use crate::ws::protocol::{
    ActionKind, GameMode, LeaderboardColumns, PhaseKind, ServerMsg,
};

use super::bot::BotTuning;
use super::combatant::CombatantId;
use super::instance::{InstanceError, InstanceStatus};
use super::observers::{Observers, Outbox};
use super::round::{ExecutionStage, Outcome, RoundState, SubmitError};
use super::scoring::{self, ScoringAggregator};

/// Commands sessions (and the instance manager) send to a running engine
pub enum EngineCommand {
    /// Bind a session to the identity's combatant; replies whether one exists
    Attach {
        identity: Uuid,
        epoch: u64,
        outbox: Outbox,
        reply: oneshot::Sender<bool>,
    },
    /// Session closed
    Detach { identity: Uuid, epoch: u64 },
    /// Player left on purpose; gets sent back to the lobby
    Leave { identity: Uuid, epoch: u64 },
    ToggleReady { identity: Uuid, epoch: u64 },
    Submit {
        identity: Uuid,
        epoch: u64,
        kind: ActionKind,
        target: Option<CombatantId>,
    },
    /// Abort before round 1
    Abort {
        reason: String,
        reply: oneshot::Sender<Result<(), InstanceError>>,
    },
}

/// How the engine stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineExit {
    Finished(Outcome),
    Aborted(String),
    Cancelled,
}

/// Interrupts a phase
#[derive(Debug)]
enum Stop {
    Cancelled,
    Aborted(String),
}

/// Everything needed to start an engine
pub struct EngineSetup {
    pub state: RoundState,
    pub mode: GameMode,
    pub instance_name: String,
    pub settings: ModeSettings,
    pub tuning: Arc<GameTuning>,
    pub observers: Observers,
    pub scoring: ScoringAggregator,
    pub status: Arc<InstanceStatus>,
    pub cancel: CancellationToken,
    /// Runs once the match leaves the waiting room (ticket consumption)
    pub on_start: Option<BoxFuture<'static, ()>>,
    pub seed: u64,
}

pub struct RoundEngine {
    state: RoundState,
    mode: GameMode,
    instance_name: String,
    settings: ModeSettings,
    tuning: Arc<GameTuning>,
    bot_tuning: BotTuning,
    observers: Observers,
    scoring: ScoringAggregator,
    status: Arc<InstanceStatus>,
    cancel: CancellationToken,
    on_start: Option<BoxFuture<'static, ()>>,
    commands: mpsc::Receiver<EngineCommand>,
    commands_open: bool,
    rng: ChaCha8Rng,
    ready: HashSet<Uuid>,
    started: bool,
    abort_requested: Option<String>,
    decision_deadline: Option<Instant>,
    final_board: Option<LeaderboardColumns>,
}

impl RoundEngine {
    pub fn new(setup: EngineSetup, commands: mpsc::Receiver<EngineCommand>) -> Self {
        let bot_tuning = BotTuning {
            retarget_chance: setup.tuning.bot_retarget_chance,
        };
        Self {
            state: setup.state,
            mode: setup.mode,
            instance_name: setup.instance_name,
            settings: setup.settings,
            tuning: setup.tuning,
            bot_tuning,
            observers: setup.observers,
            scoring: setup.scoring,
            status: setup.status,
            cancel: setup.cancel,
            on_start: setup.on_start,
            commands,
            commands_open: true,
            rng: ChaCha8Rng::seed_from_u64(setup.seed ^ 0x5eed),
            ready: HashSet::new(),
            started: false,
            abort_requested: None,
            decision_deadline: None,
            final_board: None,
        }
    }

    fn match_id(&self) -> Uuid {
        self.state.match_id
    }

    /// Drive the match from the waiting room to teardown
    pub async fn run(mut self) -> EngineExit {
        self.sync_status();
        self.announce();

        let exit = match self.wait_for_players().await {
            Ok(()) => match self.play().await {
                Ok(outcome) => {
                    self.finish(outcome).await;
                    EngineExit::Finished(outcome)
                }
                Err(Stop::Cancelled) => EngineExit::Cancelled,
                Err(Stop::Aborted(reason)) => EngineExit::Aborted(reason),
            },
            Err(Stop::Aborted(reason)) => {
                self.abort_now(&reason);
                return EngineExit::Aborted(reason);
            }
            Err(Stop::Cancelled) => EngineExit::Cancelled,
        };

        if matches!(exit, EngineExit::Finished(_)) {
            self.linger().await;
        }
        self.status.closing.store(true, Ordering::SeqCst);
        exit
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    fn sync_status(&self) {
        self.status.round.store(self.state.round(), Ordering::Relaxed);
        self.status
            .alive
            .store(self.state.alive_count(), Ordering::Relaxed);
        self.status
            .attached
            .store(self.observers.len(), Ordering::Relaxed);
    }

    fn match_found(&self, identity: Uuid) -> Option<ServerMsg> {
        let seat = self.state.combatant_for(identity)?.seat;
        Some(ServerMsg::MatchFound {
            match_id: self.match_id(),
            instance: self.instance_name.clone(),
            mode: self.mode,
            modifier: self.state.modifier,
            seat,
            combatants: self.state.infos(),
        })
    }

    fn announce(&self) {
        for identity in self.observers.identities() {
            if let Some(msg) = self.match_found(identity) {
                self.observers.send_to(identity, msg);
            }
        }
    }

    fn phase_msg(&self, identity: Uuid) -> ServerMsg {
        let phase = self.state.phase();
        let alive = self
            .state
            .combatant_for(identity)
            .is_some_and(|c| c.alive);
        ServerMsg::Phase {
            phase,
            round: self.state.round(),
            priority_seat: self.state.priority_holder(),
            actions_enabled: phase == PhaseKind::Decision && alive,
        }
    }

    fn publish_phase(&self) {
        self.observers.broadcast_with(|identity| self.phase_msg(identity));
    }

    fn publish_events(&mut self) {
        let events = self.state.take_events();
        if !events.is_empty() {
            self.observers.broadcast(&ServerMsg::RoundEvents {
                round: self.state.round(),
                events,
            });
        }
    }

    fn publish_state(&self) {
        self.observers.broadcast(&ServerMsg::CombatantState {
            round: self.state.round(),
            combatants: self.state.infos(),
        });
    }

    /// Everything a freshly (re)attached session needs, sent to it alone
    fn send_refresh(&self, identity: Uuid) {
        if let Some(msg) = self.match_found(identity) {
            self.observers.send_to(identity, msg);
        }
        self.observers.send_to(identity, self.phase_msg(identity));
        if let (PhaseKind::Decision, Some(deadline)) = (self.state.phase(), self.decision_deadline) {
            self.observers.send_to(
                identity,
                ServerMsg::TimerTick {
                    seconds_remaining: seconds_until(deadline, Instant::now()),
                },
            );
        }
        self.observers.send_to(
            identity,
            ServerMsg::CombatantState {
                round: self.state.round(),
                combatants: self.state.infos(),
            },
        );
        if let Some(mission) = self.state.combatant_for(identity).and_then(|c| c.mission) {
            self.observers.send_to(
                identity,
                ServerMsg::MissionAssigned {
                    kind: mission.kind,
                    round: mission.assigned_round,
                },
            );
        }
        if let Some(board) = &self.final_board {
            self.observers
                .send_to(identity, ServerMsg::Leaderboard(board.clone()));
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Attach {
                identity,
                epoch,
                outbox,
                reply,
            } => {
                let found = self.attach(identity, epoch, outbox);
                let _ = reply.send(found);
            }
            EngineCommand::Detach { identity, epoch } => self.detach(identity, epoch, false),
            EngineCommand::Leave { identity, epoch } => self.detach(identity, epoch, true),
            EngineCommand::ToggleReady { identity, epoch } => self.toggle_ready(identity, epoch),
            EngineCommand::Submit {
                identity,
                epoch,
                kind,
                target,
            } => {
                if let Err(e) = self.submit(identity, epoch, kind, target) {
                    debug!(
                        match_id = %self.match_id(),
                        identity = %identity,
                        error = %e,
                        "Submission rejected"
                    );
                    if e != SubmitError::StaleSession {
                        self.observers.send_to(
                            identity,
                            ServerMsg::Error {
                                code: e.code().to_string(),
                                message: e.to_string(),
                            },
                        );
                    }
                }
            }
            EngineCommand::Abort { reason, reply } => {
                if self.started {
                    let _ = reply.send(Err(InstanceError::AlreadyStarted));
                } else {
                    self.abort_requested = Some(reason);
                    let _ = reply.send(Ok(()));
                }
            }
        }
        self.sync_status();
    }

    fn attach(&mut self, identity: Uuid, epoch: u64, outbox: Outbox) -> bool {
        let Some(combatant) = self.state.combatant_for_mut(identity) else {
            return false;
        };
        // Newer sessions always win; the old epoch is revoked
        combatant.authority_epoch = epoch;
        let id = combatant.id;
        self.observers.attach(identity, outbox, epoch);
        if self.started {
            self.state.set_afk(id, false);
        }
        info!(
            match_id = %self.match_id(),
            identity = %identity,
            epoch,
            "Session attached to combatant"
        );
        self.send_refresh(identity);
        true
    }

    fn detach(&mut self, identity: Uuid, epoch: u64, leaving: bool) {
        if leaving && self.observers.epoch(identity) == Some(epoch) {
            self.observers.send_to(identity, ServerMsg::ReturnToLobby);
        }
        if !self.observers.detach(identity, epoch) {
            return;
        }
        let alive_id = self
            .state
            .combatant_for(identity)
            .filter(|c| c.alive)
            .map(|c| c.id);
        if let Some(id) = alive_id {
            if self.started && self.state.phase() != PhaseKind::Finished {
                self.state.set_afk(id, true);
            }
        }
        info!(
            match_id = %self.match_id(),
            identity = %identity,
            leaving,
            "Session detached"
        );
    }

    fn toggle_ready(&mut self, identity: Uuid, epoch: u64) {
        if self.started || self.observers.epoch(identity) != Some(epoch) {
            return;
        }
        if !self.ready.remove(&identity) {
            self.ready.insert(identity);
        }
        debug!(
            match_id = %self.match_id(),
            identity = %identity,
            ready = self.ready.contains(&identity),
            "Ready toggled"
        );
    }

    fn submit(
        &mut self,
        identity: Uuid,
        epoch: u64,
        kind: ActionKind,
        target: Option<CombatantId>,
    ) -> Result<(), SubmitError> {
        let combatant = self
            .state
            .combatant_for(identity)
            .ok_or(SubmitError::UnknownCombatant)?;
        if combatant.authority_epoch != epoch {
            return Err(SubmitError::StaleSession);
        }
        let id = combatant.id;
        self.state.submit(id, kind, target)
    }

    // ------------------------------------------------------------------
    // Suspension points
    // ------------------------------------------------------------------

    /// Process commands until `deadline`
    async fn pump_until(&mut self, deadline: Instant) -> Result<(), Stop> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Stop::Cancelled),
                _ = time::sleep_until(deadline) => return Ok(()),
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => self.commands_open = false,
                },
            }
        }
    }

    fn humans(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.state.combatants.iter().filter_map(|c| c.identity)
    }

    /// Every attached human is ready. Members seated without a session do
    /// not hold the match back; they start AFK.
    fn all_ready(&self) -> bool {
        let mut attached = self
            .humans()
            .filter(|identity| self.observers.is_attached(*identity))
            .peekable();
        attached.peek().is_some() && attached.all(|identity| self.ready.contains(&identity))
    }

    async fn wait_for_players(&mut self) -> Result<(), Stop> {
        self.publish_phase();
        let deadline = Instant::now() + self.tuning.waiting_timeout;

        loop {
            if let Some(reason) = self.abort_requested.take() {
                return Err(Stop::Aborted(reason));
            }
            if self.all_ready() {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Stop::Cancelled),
                _ = time::sleep_until(deadline) => {
                    warn!(
                        match_id = %self.match_id(),
                        ready = self.ready.len(),
                        "Players not ready in time"
                    );
                    return Err(Stop::Aborted("Not every player was ready in time".to_string()));
                }
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => self.commands_open = false,
                },
            }
        }

        self.started = true;
        self.status.started.store(true, Ordering::SeqCst);
        let absent: Vec<CombatantId> = self
            .state
            .combatants
            .iter()
            .filter(|c| c.identity.is_some_and(|i| !self.observers.is_attached(i)))
            .map(|c| c.id)
            .collect();
        for id in absent {
            self.state.set_afk(id, true);
        }
        if let Some(on_start) = self.on_start.take() {
            tokio::spawn(on_start);
        }
        info!(
            match_id = %self.match_id(),
            mode = %self.mode,
            modifier = ?self.state.modifier,
            "Match started"
        );
        Ok(())
    }

    fn abort_now(&mut self, reason: &str) {
        info!(match_id = %self.match_id(), reason, "Match aborted");
        self.observers.broadcast(&ServerMsg::MatchAborted {
            reason: reason.to_string(),
        });
        self.observers.broadcast(&ServerMsg::ReturnToLobby);
        self.observers.detach_all();
        self.status.closing.store(true, Ordering::SeqCst);
        self.sync_status();
    }

    async fn play(&mut self) -> Result<Outcome, Stop> {
        loop {
            self.decision_phase().await?;
            if let Some(outcome) = self.execution_phase().await? {
                return Ok(outcome);
            }
        }
    }

    async fn decision_phase(&mut self) -> Result<(), Stop> {
        let start = self.state.begin_round();
        self.sync_status();
        info!(
            match_id = %self.match_id(),
            round = start.round,
            priority = ?start.priority_holder,
            "Round started"
        );
        self.publish_phase();
        self.publish_events();

        if let Some((holder, mission)) = start.mission {
            if let Some(identity) = self.state.combatants[holder].identity {
                self.observers.send_to(
                    identity,
                    ServerMsg::MissionAssigned {
                        kind: mission.kind,
                        round: mission.assigned_round,
                    },
                );
            }
        }

        let window = self.settings.decision_window;
        let opened = Instant::now();
        let close_at = opened + window;
        self.decision_deadline = Some(close_at);
        self.observers.broadcast(&ServerMsg::TimerTick {
            seconds_remaining: seconds_until(close_at, opened),
        });

        // Bots answer at a random instant inside the window
        let latest = (window.as_millis() as u64 * 9 / 10).max(1);
        let mut schedule: Vec<(Instant, CombatantId)> = self
            .state
            .combatants
            .iter()
            .filter(|c| c.alive && c.is_bot())
            .map(|c| c.id)
            .collect::<Vec<_>>()
            .into_iter()
            .map(|id| (opened + Duration::from_millis(self.rng.gen_range(0..latest)), id))
            .collect();
        schedule.sort();

        let watchdog = window + self.tuning.watchdog_grace;
        match time::timeout(watchdog, self.run_window(close_at, schedule)).await {
            Ok(result) => result?,
            Err(_) => warn!(
                match_id = %self.match_id(),
                round = self.state.round(),
                "Decision watchdog fired, forcing defaults"
            ),
        }

        self.decision_deadline = None;
        let defaulted = self.state.close_decision();
        debug!(
            match_id = %self.match_id(),
            round = self.state.round(),
            defaulted,
            "Decision window closed"
        );
        Ok(())
    }

    async fn run_window(
        &mut self,
        close_at: Instant,
        schedule: Vec<(Instant, CombatantId)>,
    ) -> Result<(), Stop> {
        let mut ticker = time::interval_at(
            Instant::now() + Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let mut next_bot = 0;

        loop {
            let bot_due = schedule.get(next_bot).map(|(at, _)| *at);
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Stop::Cancelled),
                _ = time::sleep_until(close_at) => return Ok(()),
                _ = ticker.tick() => {
                    let remaining = seconds_until(close_at, Instant::now());
                    if remaining > 0 {
                        self.observers.broadcast(&ServerMsg::TimerTick { seconds_remaining: remaining });
                    }
                }
                _ = time::sleep_until(bot_due.unwrap_or(close_at)), if bot_due.is_some() => {
                    let (_, bot) = schedule[next_bot];
                    next_bot += 1;
                    self.state.submit_for_bot(bot, &self.bot_tuning);
                }
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => self.commands_open = false,
                },
            }
        }
    }

    async fn execution_phase(&mut self) -> Result<Option<Outcome>, Stop> {
        self.publish_phase();
        let budget = Instant::now() + self.tuning.execution_budget;
        let mut rushed = false;

        for (i, stage) in ExecutionStage::ORDER.into_iter().enumerate() {
            self.state.run_stage(stage);
            self.publish_events();

            let last = i + 1 == ExecutionStage::ORDER.len();
            if last || rushed {
                continue;
            }
            let pause_end = Instant::now() + self.tuning.stage_pause;
            match time::timeout_at(budget, self.pump_until(pause_end)).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(
                        match_id = %self.match_id(),
                        round = self.state.round(),
                        stage = ?stage,
                        "Execution watchdog fired, running remaining stages without pauses"
                    );
                    rushed = true;
                }
            }
        }

        if self.state.has_pending_deaths() && !rushed {
            let buffer_end = Instant::now() + self.tuning.elimination_buffer;
            self.pump_until(buffer_end).await?;
        }
        for (id, order) in self.state.flush_eliminations() {
            info!(
                match_id = %self.match_id(),
                round = self.state.round(),
                seat = id,
                order,
                "Combatant eliminated"
            );
        }
        self.publish_events();
        self.publish_state();

        let outcome = self.state.check_termination();
        self.sync_status();
        Ok(outcome)
    }

    async fn finish(&mut self, outcome: Outcome) {
        self.status.finished.store(true, Ordering::SeqCst);
        self.publish_phase();

        match outcome {
            Outcome::Win(id) => {
                let winner = &self.state.combatants[id];
                info!(
                    match_id = %self.match_id(),
                    round = self.state.round(),
                    seat = winner.seat,
                    "Match won"
                );
                self.observers.broadcast(&ServerMsg::Victory {
                    seat: winner.seat,
                    name: winner.name.clone(),
                });
            }
            Outcome::Draw => {
                info!(match_id = %self.match_id(), round = self.state.round(), "Match drawn");
                self.observers.broadcast(&ServerMsg::Draw);
            }
        }

        let observers = &self.observers;
        let rows = self
            .scoring
            .finalize(&self.state.combatants, outcome, |identity| {
                observers.is_attached(identity)
            })
            .await;
        let board = scoring::columns(&rows);
        self.observers
            .broadcast(&ServerMsg::Leaderboard(board.clone()));
        self.final_board = Some(board);
    }

    /// Keep serving sessions after the result until none are attached.
    ///
    /// Waits the grace window, then re-checks every poll interval; past the
    /// hard cap the remaining sessions are sent back to the lobby.
    async fn linger(&mut self) {
        let grace_end = Instant::now() + self.tuning.teardown_grace;
        if self.pump_until(grace_end).await.is_err() {
            return;
        }
        let hard_cap = grace_end + self.tuning.teardown_max_wait;

        loop {
            self.observers.prune_closed();
            self.sync_status();
            if self.observers.is_empty() {
                info!(match_id = %self.match_id(), "No sessions attached, tearing down");
                return;
            }
            let now = Instant::now();
            if now >= hard_cap {
                warn!(
                    match_id = %self.match_id(),
                    attached = self.observers.len(),
                    "Teardown wait exceeded, returning sessions to lobby"
                );
                self.observers.broadcast(&ServerMsg::ReturnToLobby);
                self.observers.detach_all();
                self.sync_status();
                return;
            }
            debug!(
                match_id = %self.match_id(),
                attached = self.observers.len(),
                "Teardown skipped, sessions still attached"
            );
            let next_poll = (now + self.tuning.teardown_poll).min(hard_cap);
            if self.pump_until(next_poll).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::action::RoundRules;
    use crate::game::combatant::{Combatant, Personality};
    use crate::store::InMemoryProfileStore;
    use crate::ws::protocol::ModifierKind;

    struct Harness {
        commands: mpsc::Sender<EngineCommand>,
        status: Arc<InstanceStatus>,
        inbox: mpsc::Receiver<ServerMsg>,
        engine: RoundEngine,
    }

    fn harness(human: Uuid, bots: usize) -> Harness {
        let mut combatants = vec![Combatant::human(0, human, "Ana".into(), 3, 0)];
        for seat in 1..=bots {
            combatants.push(Combatant::bot(
                seat,
                format!("Bot{seat}"),
                Personality::ALL[seat % 4],
                3,
                0,
            ));
        }
        combatants[0].authority_epoch = 1;

        let match_id = Uuid::new_v4();
        let rules = RoundRules::for_modifier(ModifierKind::Classic, 0.6);
        let scoring = ScoringAggregator::new(
            match_id,
            false,
            &combatants,
            Arc::new(InMemoryProfileStore::new()),
            Duration::from_secs(1),
            25,
        );
        let state = RoundState::new(match_id, combatants, ModifierKind::Classic, rules, 7);

        let (out_tx, inbox) = mpsc::channel(20_000);
        let mut observers = Observers::new();
        observers.attach(human, out_tx, 1);

        let tuning = Arc::new(GameTuning::default());
        let status = Arc::new(InstanceStatus::default());
        let (commands, rx) = mpsc::channel(64);
        let engine = RoundEngine::new(
            EngineSetup {
                state,
                mode: GameMode::Practice,
                instance_name: "arena-test".into(),
                settings: tuning.practice,
                tuning,
                observers,
                scoring,
                status: status.clone(),
                cancel: CancellationToken::new(),
                on_start: None,
                seed: 7,
            },
            rx,
        );
        Harness {
            commands,
            status,
            inbox,
            engine,
        }
    }

    fn drain(inbox: &mut mpsc::Receiver<ServerMsg>) -> Vec<ServerMsg> {
        let mut out = Vec::new();
        while let Ok(msg) = inbox.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_room_timeout_aborts() {
        let human = Uuid::new_v4();
        let mut h = harness(human, 5);

        let exit = h.engine.run().await;
        assert!(matches!(exit, EngineExit::Aborted(_)));

        let msgs = drain(&mut h.inbox);
        assert!(msgs.iter().any(|m| matches!(m, ServerMsg::MatchAborted { .. })));
        assert!(matches!(msgs.last(), Some(ServerMsg::ReturnToLobby)));
        assert!(!h.status.started.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_is_rejected_once_started() {
        let human = Uuid::new_v4();
        let h = harness(human, 5);
        let commands = h.commands.clone();
        let task = tokio::spawn(h.engine.run());

        commands
            .send(EngineCommand::ToggleReady { identity: human, epoch: 1 })
            .await
            .unwrap();
        time::sleep(Duration::from_millis(100)).await;

        let (tx, rx) = oneshot::channel();
        commands
            .send(EngineCommand::Abort { reason: "test".into(), reply: tx })
            .await
            .unwrap();
        assert!(matches!(rx.await.unwrap(), Err(InstanceError::AlreadyStarted)));
        assert!(h.status.started.load(Ordering::SeqCst));
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn abort_before_start_returns_members_to_lobby() {
        let human = Uuid::new_v4();
        let mut h = harness(human, 5);
        let commands = h.commands.clone();
        let task = tokio::spawn(h.engine.run());

        let (tx, rx) = oneshot::channel();
        commands
            .send(EngineCommand::Abort { reason: "host left".into(), reply: tx })
            .await
            .unwrap();
        assert!(rx.await.unwrap().is_ok());
        assert_eq!(task.await.unwrap(), EngineExit::Aborted("host left".into()));

        let msgs = drain(&mut h.inbox);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, ServerMsg::MatchAborted { reason } if reason == "host left")));
    }

    #[tokio::test(start_paused = true)]
    async fn bot_match_runs_to_completion_and_publishes_leaderboard() {
        let human = Uuid::new_v4();
        let mut h = harness(human, 5);
        let commands = h.commands.clone();
        let status = h.status.clone();
        let task = tokio::spawn(h.engine.run());

        commands
            .send(EngineCommand::ToggleReady { identity: human, epoch: 1 })
            .await
            .unwrap();

        let exit = task.await.unwrap();
        assert!(matches!(exit, EngineExit::Finished(_)));
        assert!(status.finished.load(Ordering::SeqCst));
        assert!(status.closing.load(Ordering::SeqCst));

        let msgs = drain(&mut h.inbox);
        let board = msgs.iter().find_map(|m| match m {
            ServerMsg::Leaderboard(cols) => Some(cols.clone()),
            _ => None,
        });
        assert_eq!(board.expect("leaderboard published").names.len(), 6);
        // Still attached after the result: sent back to the lobby at the hard cap
        assert!(matches!(msgs.last(), Some(ServerMsg::ReturnToLobby)));
    }

    #[tokio::test(start_paused = true)]
    async fn reattach_revokes_the_old_epoch_and_clears_afk() {
        let human = Uuid::new_v4();
        let h = harness(human, 5);
        let commands = h.commands.clone();
        let _task = tokio::spawn(h.engine.run());

        commands
            .send(EngineCommand::ToggleReady { identity: human, epoch: 1 })
            .await
            .unwrap();
        time::sleep(Duration::from_millis(100)).await;
        commands
            .send(EngineCommand::Detach { identity: human, epoch: 1 })
            .await
            .unwrap();

        let (new_tx, mut new_rx) = mpsc::channel(1_000);
        let (reply, found) = oneshot::channel();
        commands
            .send(EngineCommand::Attach {
                identity: human,
                epoch: 2,
                outbox: new_tx,
                reply,
            })
            .await
            .unwrap();
        assert!(found.await.unwrap());

        let refresh = drain(&mut new_rx);
        assert!(matches!(refresh.first(), Some(ServerMsg::MatchFound { seat: 0, .. })));
        let state = refresh.iter().find_map(|m| match m {
            ServerMsg::CombatantState { combatants, .. } => Some(combatants[0].clone()),
            _ => None,
        });
        let me = state.expect("state refresh");
        assert!(!me.afk);
        assert_eq!(me.health, 3);

        // The old session can no longer act
        commands
            .send(EngineCommand::Submit {
                identity: human,
                epoch: 1,
                kind: ActionKind::Reload,
                target: None,
            })
            .await
            .unwrap();
        commands
            .send(EngineCommand::Submit {
                identity: human,
                epoch: 2,
                kind: ActionKind::Attack,
                target: Some(1),
            })
            .await
            .unwrap();
        time::sleep(Duration::from_millis(10)).await;
        let msgs = drain(&mut new_rx);
        let errors: Vec<&str> = msgs
            .iter()
            .filter_map(|m| match m {
                ServerMsg::Error { code, .. } => Some(code.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec!["insufficient_ammo"]);
    }
}
