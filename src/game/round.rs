//! Round state machine: decision bookkeeping, staged execution, elimination
//! ordering and termination. Pure state; the async driver lives in `engine`.

use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ws::protocol::{ActionKind, CombatantInfo, GameEvent, ModifierKind, PhaseKind};

use super::action::{ActionSubmission, RoundRules, SubmissionBook};
use super::bot::{self, BotContext, BotDecision, BotTuning};
use super::combatant::{Combatant, CombatantId, RoundFlags};
use super::mission::{self, MissionCycle, QuickMission};
use super::priority::{next_alive_seat, proximity, PriorityHistory};

/// How a match ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Win(CombatantId),
    Draw,
}

/// Execution stages, in resolution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStage {
    Defend,
    ReloadAndIdle,
    Attacks,
    Missions,
    ClearFlags,
}

impl ExecutionStage {
    pub const ORDER: [ExecutionStage; 5] = [
        ExecutionStage::Defend,
        ExecutionStage::ReloadAndIdle,
        ExecutionStage::Attacks,
        ExecutionStage::Missions,
        ExecutionStage::ClearFlags,
    ];
}

/// Summary of a freshly opened decision phase
#[derive(Debug, Clone, Copy)]
pub struct RoundStart {
    pub round: u32,
    pub priority_holder: Option<CombatantId>,
    pub mission: Option<(CombatantId, QuickMission)>,
}

/// A death waiting for the elimination flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingDeath {
    victim: CombatantId,
    killer: Option<CombatantId>,
}

/// Authoritative state of one match
pub struct RoundState {
    pub match_id: Uuid,
    pub combatants: Vec<Combatant>,
    pub rules: RoundRules,
    pub modifier: ModifierKind,
    round: u32,
    phase: PhaseKind,
    priority_holder: Option<CombatantId>,
    history: PriorityHistory,
    missions: MissionCycle,
    submissions: SubmissionBook,
    pending_deaths: Vec<PendingDeath>,
    elimination_counter: u32,
    events: Vec<GameEvent>,
    rng: ChaCha8Rng,
}

impl RoundState {
    pub fn new(
        match_id: Uuid,
        combatants: Vec<Combatant>,
        modifier: ModifierKind,
        rules: RoundRules,
        seed: u64,
    ) -> Self {
        Self {
            match_id,
            combatants,
            rules,
            modifier,
            round: 0,
            phase: PhaseKind::WaitingForPlayers,
            priority_holder: None,
            history: PriorityHistory::new(),
            missions: MissionCycle::default(),
            submissions: SubmissionBook::default(),
            pending_deaths: Vec::new(),
            elimination_counter: 0,
            events: vec![GameEvent::ModifierSelected { modifier }],
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn phase(&self) -> PhaseKind {
        self.phase
    }

    pub fn priority_holder(&self) -> Option<CombatantId> {
        self.priority_holder
    }

    #[cfg(test)]
    pub fn history(&self) -> &PriorityHistory {
        &self.history
    }

    pub fn alive_count(&self) -> usize {
        self.combatants.iter().filter(|c| c.alive).count()
    }

    pub fn alive_ids(&self) -> Vec<CombatantId> {
        self.combatants
            .iter()
            .filter(|c| c.alive)
            .map(|c| c.id)
            .collect()
    }

    /// Combatant owned by a human identity
    pub fn combatant_for(&self, identity: Uuid) -> Option<&Combatant> {
        self.combatants.iter().find(|c| c.is_owned_by(identity))
    }

    pub fn combatant_for_mut(&mut self, identity: Uuid) -> Option<&mut Combatant> {
        self.combatants.iter_mut().find(|c| c.is_owned_by(identity))
    }

    #[cfg(test)]
    pub fn submission(&self, id: CombatantId) -> Option<&ActionSubmission> {
        self.submissions.get(id)
    }

    pub fn infos(&self) -> Vec<CombatantInfo> {
        self.combatants.iter().map(Combatant::info).collect()
    }

    /// Drain events produced since the last call
    pub fn take_events(&mut self) -> Vec<GameEvent> {
        std::mem::take(&mut self.events)
    }

    /// Mark a combatant AFK (disconnect) or back (reattach)
    pub fn set_afk(&mut self, id: CombatantId, afk: bool) {
        if let Some(c) = self.combatants.get_mut(id) {
            if c.afk != afk {
                c.afk = afk;
                if !afk {
                    c.afk_rounds = 0;
                }
                self.events.push(GameEvent::AfkChanged { seat: c.seat, afk });
            }
        }
    }

    // ------------------------------------------------------------------
    // Decision phase
    // ------------------------------------------------------------------

    /// Open the next decision phase
    pub fn begin_round(&mut self) -> RoundStart {
        self.round += 1;
        self.phase = PhaseKind::Decision;

        self.priority_holder = match self.priority_holder {
            None => {
                let alive = self.alive_ids();
                if alive.is_empty() {
                    None
                } else {
                    Some(alive[self.rng.gen_range(0..alive.len())])
                }
            }
            Some(current) => next_alive_seat(&self.combatants, current),
        };
        if let Some(holder) = self.priority_holder {
            self.history.push(holder);
        }

        self.submissions.clear();
        let round = self.round;
        for c in &mut self.combatants {
            c.flags = RoundFlags::default();
            if c.mission.is_some_and(|m| m.assigned_round < round) {
                c.mission = None;
            }
        }

        let mut assigned = None;
        if self.rules.is_mission_round(round) && self.rng.gen_bool(self.rules.mission_chance) {
            assigned = self
                .missions
                .assign(&mut self.combatants, round, &mut self.rng);
        }

        debug!(
            match_id = %self.match_id,
            round,
            priority = ?self.priority_holder,
            "Decision phase opened"
        );

        RoundStart {
            round,
            priority_holder: self.priority_holder,
            mission: assigned,
        }
    }

    /// Record a human submission; the previous one stays on error
    pub fn submit(
        &mut self,
        id: CombatantId,
        kind: ActionKind,
        target: Option<CombatantId>,
    ) -> Result<(), SubmitError> {
        if self.phase != PhaseKind::Decision {
            return Err(SubmitError::NotAccepting);
        }
        let combatant = self
            .combatants
            .get(id)
            .ok_or(SubmitError::UnknownCombatant)?;
        if !combatant.alive {
            return Err(SubmitError::Eliminated);
        }

        let target = if kind.is_attack() {
            let target = target.ok_or(SubmitError::InvalidTarget)?;
            let valid = target != id && self.combatants.get(target).is_some_and(|t| t.alive);
            if !valid {
                return Err(SubmitError::InvalidTarget);
            }
            if combatant.ammo < self.rules.cost(kind) {
                return Err(SubmitError::InsufficientAmmo);
            }
            Some(target)
        } else {
            None
        };

        self.submissions.put(id, kind, target);
        Ok(())
    }

    /// Let a bot pick and submit its action
    pub fn submit_for_bot(&mut self, id: CombatantId, tuning: &BotTuning) -> Option<BotDecision> {
        if self.phase != PhaseKind::Decision {
            return None;
        }
        let me = self.combatants.get(id).filter(|c| c.alive && c.is_bot())?;
        let ctx = BotContext {
            me,
            combatants: &self.combatants,
            rules: &self.rules,
        };
        let decision = bot::decide(&ctx, &mut self.rng, tuning);
        self.submissions.put(id, decision.kind, decision.target);
        Some(decision)
    }

    /// Close the window: every alive combatant without a submission gets None
    pub fn close_decision(&mut self) -> usize {
        let alive = self.alive_ids();
        let filled = self.submissions.fill_missing(alive);
        self.phase = PhaseKind::Execution;
        filled
    }

    // ------------------------------------------------------------------
    // Execution phase
    // ------------------------------------------------------------------

    /// Run one execution stage; failures are per entry and never abort the stage
    pub fn run_stage(&mut self, stage: ExecutionStage) {
        match stage {
            ExecutionStage::Defend => self.resolve_defends(),
            ExecutionStage::ReloadAndIdle => self.resolve_reloads_and_idles(),
            ExecutionStage::Attacks => {
                self.resolve_attacks();
                self.apply_afk_attrition();
            }
            ExecutionStage::Missions => self.resolve_missions(),
            ExecutionStage::ClearFlags => {
                for c in &mut self.combatants {
                    c.flags = RoundFlags::default();
                }
            }
        }
    }

    fn living_mut(&mut self, id: CombatantId) -> Result<&mut Combatant, ResolutionError> {
        let c = self
            .combatants
            .get_mut(id)
            .ok_or(ResolutionError::Missing(id))?;
        if c.alive {
            Ok(c)
        } else {
            Err(ResolutionError::NotAlive(id))
        }
    }

    fn log_entry_failure(&self, stage: ExecutionStage, err: &ResolutionError) {
        warn!(
            match_id = %self.match_id,
            round = self.round,
            stage = ?stage,
            error = %err,
            "Skipping entry during resolution"
        );
    }

    fn resolve_defends(&mut self) {
        for s in self.submissions.of_kinds(&[ActionKind::Defend]) {
            if let Err(e) = self.resolve_defend(s.combatant) {
                self.log_entry_failure(ExecutionStage::Defend, &e);
            }
        }
    }

    fn resolve_defend(&mut self, id: CombatantId) -> Result<(), ResolutionError> {
        let streak = self.living_mut(id)?.defend_streak;
        let chance = self.rules.defend_chance(streak).clamp(0.0, 1.0);
        let success = self.rng.gen_bool(chance);

        let c = self.living_mut(id)?;
        if success {
            c.flags.blocking = true;
            c.defend_streak += 1;
        }
        let seat = c.seat;
        self.events.push(GameEvent::Defended { seat, success });
        Ok(())
    }

    fn resolve_reloads_and_idles(&mut self) {
        for s in self
            .submissions
            .of_kinds(&[ActionKind::Reload, ActionKind::None])
        {
            if let Err(e) = self.resolve_reload_or_idle(&s) {
                self.log_entry_failure(ExecutionStage::ReloadAndIdle, &e);
            }
        }
    }

    fn resolve_reload_or_idle(&mut self, s: &ActionSubmission) -> Result<(), ResolutionError> {
        let max_ammo = self.rules.max_ammo;
        let amount = self.rules.reload_amount;
        let c = self.living_mut(s.combatant)?;
        c.defend_streak = 0;

        if s.kind == ActionKind::Reload {
            c.ammo = c.ammo.saturating_add(amount).min(max_ammo);
            c.stats.reloads += 1;
            c.flags.reloaded = true;
            let (seat, ammo) = (c.seat, c.ammo);
            self.events.push(GameEvent::Reloaded { seat, ammo });
        } else {
            c.flags.idle = true;
        }
        Ok(())
    }

    fn resolve_attacks(&mut self) {
        let attacks = self
            .submissions
            .of_kinds(&[ActionKind::Attack, ActionKind::HeavyAttack]);

        // Everyone fires first; grouping by seat keeps resolution order stable
        let mut by_target: BTreeMap<CombatantId, Vec<ActionSubmission>> = BTreeMap::new();
        for s in attacks {
            match self.fire(&s) {
                Ok(target) => by_target.entry(target).or_default().push(s),
                Err(e) => self.log_entry_failure(ExecutionStage::Attacks, &e),
            }
        }

        for (target, shots) in by_target {
            self.land_shots(target, shots);
        }
    }

    /// Spend ammo and record the shot; returns the target
    fn fire(&mut self, s: &ActionSubmission) -> Result<CombatantId, ResolutionError> {
        let target = s.target.ok_or(ResolutionError::MissingTarget(s.combatant))?;
        let target_alive = self.combatants.get(target).is_some_and(|t| t.alive);
        if target == s.combatant || !target_alive {
            return Err(ResolutionError::InvalidTarget {
                attacker: s.combatant,
                target,
            });
        }

        let cost = self.rules.cost(s.kind);
        let attacker = self.living_mut(s.combatant)?;
        if attacker.ammo < cost {
            return Err(ResolutionError::InsufficientAmmo(s.combatant));
        }
        attacker.ammo -= cost;
        attacker.stats.shots += 1;
        attacker.defend_streak = 0;
        let attacker_seat = attacker.seat;

        let victim = &mut self.combatants[target];
        victim.remember_attacker(s.combatant);
        self.events.push(GameEvent::Shot {
            attacker: attacker_seat,
            target: victim.seat,
            heavy: s.kind == ActionKind::HeavyAttack,
        });
        Ok(target)
    }

    fn land_shots(&mut self, target: CombatantId, shots: Vec<ActionSubmission>) {
        let blocking = self.combatants[target].flags.blocking;

        let mut landing = Vec::with_capacity(shots.len());
        for s in shots {
            if blocking && s.kind == ActionKind::Attack {
                let defender = &mut self.combatants[target];
                defender.stats.blocks += 1;
                defender.flags.blocked_attack = true;
                self.events.push(GameEvent::Blocked {
                    attacker: s.combatant,
                    defender: target,
                });
            } else {
                landing.push(s);
            }
        }
        if landing.is_empty() {
            return;
        }

        if self.rules.damage_accumulates {
            self.history.order(&mut landing);
        } else {
            landing = self.history.tie_break(&landing).copied().into_iter().collect();
        }
        for s in landing {
            let damage = self.rules.damage(s.kind);
            self.apply_hit(s.combatant, target, damage);
        }
    }

    fn apply_hit(&mut self, attacker: CombatantId, target: CombatantId, damage: u8) {
        let victim = &mut self.combatants[target];
        if victim.health == 0 {
            return;
        }
        let dealt = damage.min(victim.health);
        victim.health -= dealt;
        let lethal = victim.health == 0;
        if lethal {
            victim.killed_by = Some(attacker);
            self.pending_deaths.push(PendingDeath {
                victim: target,
                killer: Some(attacker),
            });
        }

        let shooter = &mut self.combatants[attacker];
        shooter.stats.damage += u32::from(dealt);
        shooter.flags.dealt_damage = true;
        if lethal {
            shooter.stats.kills += 1;
        }

        self.events.push(GameEvent::Hit {
            attacker,
            target,
            damage: dealt,
        });
    }

    /// AFK combatants past the limit drop out with no kill credit
    fn apply_afk_attrition(&mut self) {
        let limit = self.rules.afk_rounds_before_elimination;
        for c in self.combatants.iter_mut().filter(|c| c.alive && c.afk) {
            c.afk_rounds += 1;
            if c.afk_rounds >= limit && c.health > 0 {
                c.health = 0;
                self.pending_deaths.push(PendingDeath {
                    victim: c.id,
                    killer: None,
                });
            }
        }
    }

    fn resolve_missions(&mut self) {
        let rules = self.rules.clone();
        for c in &mut self.combatants {
            // Cleared whatever the outcome
            let Some(mut m) = c.mission.take() else {
                continue;
            };
            let success = c.alive && c.health > 0 && m.is_met(&c.flags);
            if success {
                m.completed = true;
                mission::apply_reward(c, m.kind, &rules);
            }
            self.events.push(GameEvent::MissionResolved {
                seat: c.seat,
                kind: m.kind,
                success,
            });
        }
    }

    /// Whether deaths are waiting for the flush
    pub fn has_pending_deaths(&self) -> bool {
        !self.pending_deaths.is_empty()
    }

    /// Commit buffered deaths in priority-proximity order.
    ///
    /// If the batch would leave nobody alive and contains the priority
    /// holder, the holder is spared at 1 health and its killer loses the
    /// kill credit. Returns (combatant, elimination order) pairs.
    pub fn flush_eliminations(&mut self) -> Vec<(CombatantId, u32)> {
        let mut pending = std::mem::take(&mut self.pending_deaths);
        if pending.is_empty() {
            return Vec::new();
        }

        if pending.len() >= self.alive_count() {
            if let Some(holder) = self.priority_holder {
                if let Some(pos) = pending.iter().position(|d| d.victim == holder) {
                    let spared = pending.remove(pos);
                    let c = &mut self.combatants[holder];
                    c.health = 1;
                    c.killed_by = None;
                    if let Some(killer) = spared.killer {
                        let k = &mut self.combatants[killer];
                        k.stats.kills = k.stats.kills.saturating_sub(1);
                    }
                    self.events.push(GameEvent::Revived { seat: holder });
                }
            }
        }

        let seats = self.combatants.len();
        let anchor = self.priority_holder.unwrap_or(0);
        pending.sort_by_key(|d| proximity(anchor, d.victim, seats));

        let mut committed = Vec::with_capacity(pending.len());
        for death in pending {
            let c = &mut self.combatants[death.victim];
            if !c.alive {
                continue;
            }
            self.elimination_counter += 1;
            c.alive = false;
            c.health = 0;
            c.mission = None;
            c.elimination_order = self.elimination_counter;
            self.events.push(GameEvent::Eliminated {
                seat: c.seat,
                killer: death.killer,
                order: c.elimination_order,
            });
            committed.push((c.id, c.elimination_order));
        }
        committed
    }

    /// End the match when at most one combatant is alive (or the round limit hit)
    pub fn check_termination(&mut self) -> Option<Outcome> {
        let alive = self.alive_ids();
        let outcome = match alive.as_slice() {
            [] => Some(Outcome::Draw),
            [winner] => Some(Outcome::Win(*winner)),
            _ if self.round >= self.rules.round_limit => Some(Outcome::Draw),
            _ => None,
        };
        if outcome.is_some() {
            self.phase = PhaseKind::Finished;
        }
        outcome
    }

    /// Run a whole execution phase without pauses
    #[cfg(test)]
    pub fn resolve_round(&mut self) -> Option<Outcome> {
        self.close_decision();
        for stage in ExecutionStage::ORDER {
            self.run_stage(stage);
        }
        self.flush_eliminations();
        self.check_termination()
    }
}

/// Rejected submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("Actions are not being accepted right now")]
    NotAccepting,

    #[error("You are not part of this match")]
    UnknownCombatant,

    #[error("You have been eliminated")]
    Eliminated,

    #[error("Invalid target")]
    InvalidTarget,

    #[error("Not enough ammo")]
    InsufficientAmmo,

    #[error("This session no longer controls the combatant")]
    StaleSession,
}

impl SubmitError {
    pub fn code(&self) -> &'static str {
        match self {
            SubmitError::NotAccepting => "not_accepting",
            SubmitError::UnknownCombatant => "unknown_combatant",
            SubmitError::Eliminated => "eliminated",
            SubmitError::InvalidTarget => "invalid_target",
            SubmitError::InsufficientAmmo => "insufficient_ammo",
            SubmitError::StaleSession => "stale_session",
        }
    }
}

/// Per-entry resolution failures (logged, never fatal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("combatant {0} does not exist")]
    Missing(CombatantId),

    #[error("combatant {0} is not alive")]
    NotAlive(CombatantId),

    #[error("combatant {0} attacked without a target")]
    MissingTarget(CombatantId),

    #[error("combatant {attacker} targeted invalid seat {target}")]
    InvalidTarget {
        attacker: CombatantId,
        target: CombatantId,
    },

    #[error("combatant {0} cannot afford the attack")]
    InsufficientAmmo(CombatantId),
}
