//! Bot decision making
//!
//! Pure: one call per bot per round, all randomness from the caller's RNG.

use rand::Rng;

use crate::ws::protocol::{ActionKind, MissionKind};

use super::action::RoundRules;
use super::combatant::{Combatant, CombatantId, Personality};

/// Ammo below which thrifty personalities reload first
const RELOAD_THRESHOLD: u8 = 2;

/// Defend odds a defensive bot is willing to gamble on
const MIN_DEFEND_ODDS: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct BotTuning {
    /// Chance an attack is re-aimed at a different random enemy
    pub retarget_chance: f64,
}

impl Default for BotTuning {
    fn default() -> Self {
        Self {
            retarget_chance: 0.7,
        }
    }
}

/// Everything a bot may look at
pub struct BotContext<'a> {
    pub me: &'a Combatant,
    pub combatants: &'a [Combatant],
    pub rules: &'a RoundRules,
}

impl<'a> BotContext<'a> {
    fn enemies(&self) -> Vec<&'a Combatant> {
        self.combatants
            .iter()
            .filter(|c| c.alive && c.id != self.me.id)
            .collect()
    }

    fn can_afford(&self, kind: ActionKind) -> bool {
        self.me.ammo >= self.rules.cost(kind)
    }

    /// Strongest attack the bot can pay for
    fn strongest_attack(&self) -> Option<ActionKind> {
        if self.can_afford(ActionKind::HeavyAttack) {
            Some(ActionKind::HeavyAttack)
        } else if self.can_afford(ActionKind::Attack) {
            Some(ActionKind::Attack)
        } else {
            None
        }
    }

    /// Remembered attackers that are alive and armed
    fn is_threatened(&self) -> bool {
        self.me.memory.iter().any(|&id| {
            self.combatants
                .get(id)
                .is_some_and(|c| c.alive && c.ammo >= self.rules.attack_cost)
        })
    }

    fn last_living_attacker(&self) -> Option<CombatantId> {
        self.me
            .memory
            .iter()
            .rev()
            .copied()
            .find(|&id| id != self.me.id && self.combatants.get(id).is_some_and(|c| c.alive))
    }
}

/// What a bot submits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BotDecision {
    pub kind: ActionKind,
    pub target: Option<CombatantId>,
}

impl BotDecision {
    fn idle() -> Self {
        Self {
            kind: ActionKind::None,
            target: None,
        }
    }

    fn plain(kind: ActionKind) -> Self {
        Self { kind, target: None }
    }

    fn attack(kind: ActionKind, target: CombatantId) -> Self {
        Self {
            kind,
            target: Some(target),
        }
    }
}

/// Pick this round's action for the bot in `ctx`
pub fn decide<R: Rng + ?Sized>(ctx: &BotContext<'_>, rng: &mut R, tuning: &BotTuning) -> BotDecision {
    let enemies = ctx.enemies();
    if enemies.is_empty() {
        return BotDecision::idle();
    }

    if skips_for_mission(ctx) {
        return BotDecision::idle();
    }

    // A heavy hit on a 1-health enemy cannot be blocked; never re-aim it
    if let Some(decision) = finishing_move(ctx, &enemies) {
        return guard(ctx, decision, &enemies);
    }

    let mut decision = by_personality(ctx, &enemies);

    if decision.kind.is_attack()
        && enemies.len() > 1
        && rng.gen_bool(tuning.retarget_chance.clamp(0.0, 1.0))
    {
        let others: Vec<CombatantId> = enemies
            .iter()
            .map(|c| c.id)
            .filter(|&id| Some(id) != decision.target)
            .collect();
        decision.target = Some(others[rng.gen_range(0..others.len())]);
    }

    guard(ctx, decision, &enemies)
}

fn skips_for_mission(ctx: &BotContext<'_>) -> bool {
    let Some(mission) = ctx.me.mission else {
        return false;
    };
    if mission.kind != MissionKind::DoNothing {
        return false;
    }
    let banked = ctx.me.ammo >= RELOAD_THRESHOLD;
    let safe = ctx.me.health >= ctx.rules.max_health.saturating_sub(1) && ctx.me.memory.is_empty();
    banked || safe
}

fn finishing_move(ctx: &BotContext<'_>, enemies: &[&Combatant]) -> Option<BotDecision> {
    if !ctx.can_afford(ActionKind::HeavyAttack) {
        return None;
    }
    enemies
        .iter()
        .filter(|c| c.health == 1)
        .min_by_key(|c| c.seat)
        .map(|c| BotDecision::attack(ActionKind::HeavyAttack, c.id))
}

fn weakest(enemies: &[&Combatant]) -> CombatantId {
    enemies
        .iter()
        .min_by_key(|c| (c.health, c.seat))
        .map(|c| c.id)
        .unwrap_or_default()
}

fn best_armed(enemies: &[&Combatant]) -> CombatantId {
    enemies
        .iter()
        .max_by_key(|c| (c.ammo, std::cmp::Reverse(c.seat)))
        .map(|c| c.id)
        .unwrap_or_default()
}

fn by_personality(ctx: &BotContext<'_>, enemies: &[&Combatant]) -> BotDecision {
    let personality = ctx.me.personality.unwrap_or(Personality::Tactical);
    match personality {
        Personality::Defensive => {
            let odds = ctx.rules.defend_chance(ctx.me.defend_streak);
            if ctx.is_threatened() && odds >= MIN_DEFEND_ODDS {
                BotDecision::plain(ActionKind::Defend)
            } else if ctx.me.ammo < RELOAD_THRESHOLD && ctx.me.ammo < ctx.rules.max_ammo {
                BotDecision::plain(ActionKind::Reload)
            } else {
                BotDecision::attack(ActionKind::Attack, weakest(enemies))
            }
        }
        Personality::Vengeful => {
            let target = ctx.last_living_attacker().unwrap_or_else(|| weakest(enemies));
            match ctx.strongest_attack() {
                Some(kind) => BotDecision::attack(kind, target),
                None => BotDecision::plain(ActionKind::Reload),
            }
        }
        Personality::Tactical => {
            if ctx.me.ammo < RELOAD_THRESHOLD {
                BotDecision::plain(ActionKind::Reload)
            } else if ctx.can_afford(ActionKind::HeavyAttack) {
                BotDecision::attack(ActionKind::HeavyAttack, weakest(enemies))
            } else {
                BotDecision::attack(ActionKind::Attack, best_armed(enemies))
            }
        }
        Personality::Aggressive => match ctx.strongest_attack() {
            Some(kind) => BotDecision::attack(kind, weakest(enemies)),
            None => BotDecision::plain(ActionKind::Reload),
        },
    }
}

/// Never attack without ammo or at an invalid target
fn guard(ctx: &BotContext<'_>, decision: BotDecision, enemies: &[&Combatant]) -> BotDecision {
    if !decision.kind.is_attack() {
        return BotDecision::plain(decision.kind);
    }
    if !ctx.can_afford(decision.kind) {
        return BotDecision::plain(ActionKind::Reload);
    }

    let valid = decision
        .target
        .is_some_and(|t| enemies.iter().any(|c| c.id == t));
    if valid {
        return decision;
    }
    match enemies.first() {
        Some(fallback) => BotDecision::attack(decision.kind, fallback.id),
        None => BotDecision::idle(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::mission::QuickMission;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn arena(personality: Personality, ammo: u8) -> Vec<Combatant> {
        let mut combatants: Vec<Combatant> = (0..4)
            .map(|i| Combatant::bot(i, format!("B{i}"), Personality::Tactical, 3, 0))
            .collect();
        combatants[0].personality = Some(personality);
        combatants[0].ammo = ammo;
        combatants
    }

    fn run(combatants: &[Combatant], retarget_chance: f64, seed: u64) -> BotDecision {
        let rules = RoundRules::default();
        let ctx = BotContext {
            me: &combatants[0],
            combatants,
            rules: &rules,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        decide(&ctx, &mut rng, &BotTuning { retarget_chance })
    }

    #[test]
    fn finishing_move_is_never_retargeted() {
        let mut combatants = arena(Personality::Defensive, 3);
        combatants[2].health = 1;

        for seed in 0..20 {
            let d = run(&combatants, 1.0, seed);
            assert_eq!(d, BotDecision::attack(ActionKind::HeavyAttack, 2));
        }
    }

    #[test]
    fn do_nothing_mission_with_banked_ammo_idles() {
        let mut combatants = arena(Personality::Aggressive, 2);
        combatants[0].mission = Some(QuickMission::new(MissionKind::DoNothing, 2));

        assert_eq!(run(&combatants, 0.0, 1).kind, ActionKind::None);
    }

    #[test]
    fn bots_without_ammo_never_attack() {
        for personality in Personality::ALL {
            let mut combatants = arena(personality, 0);
            combatants[1].memory.push_back(0);
            combatants[0].memory.push_back(1);
            combatants[1].ammo = 0;
            for seed in 0..10 {
                let d = run(&combatants, 0.7, seed);
                assert!(!d.kind.is_attack(), "{personality:?} attacked with no ammo");
            }
        }
    }

    #[test]
    fn vengeful_hunts_last_attacker() {
        let mut combatants = arena(Personality::Vengeful, 1);
        combatants[0].remember_attacker(3);
        combatants[0].remember_attacker(2);

        assert_eq!(run(&combatants, 0.0, 3), BotDecision::attack(ActionKind::Attack, 2));

        combatants[2].alive = false;
        assert_eq!(run(&combatants, 0.0, 3), BotDecision::attack(ActionKind::Attack, 3));
    }

    #[test]
    fn defensive_defends_while_threatened() {
        let mut combatants = arena(Personality::Defensive, 0);
        combatants[0].remember_attacker(1);
        combatants[1].ammo = 2;
        assert_eq!(run(&combatants, 0.0, 1).kind, ActionKind::Defend);

        // Odds too low to gamble
        combatants[0].defend_streak = 3;
        assert_eq!(run(&combatants, 0.0, 1).kind, ActionKind::Reload);
    }

    #[test]
    fn tactical_balances_reload_and_attack() {
        let combatants = arena(Personality::Tactical, 1);
        assert_eq!(run(&combatants, 0.0, 1).kind, ActionKind::Reload);

        let mut combatants = arena(Personality::Tactical, 2);
        combatants[3].ammo = 4;
        assert_eq!(run(&combatants, 0.0, 1), BotDecision::attack(ActionKind::Attack, 3));
    }

    #[test]
    fn retarget_picks_a_different_living_enemy() {
        let mut combatants = arena(Personality::Aggressive, 1);
        combatants[1].health = 2;

        for seed in 0..20 {
            let d = run(&combatants, 1.0, seed);
            assert_eq!(d.kind, ActionKind::Attack);
            let target = d.target.unwrap();
            assert_ne!(target, 1);
            assert_ne!(target, 0);
        }
    }

    #[test]
    fn no_enemies_means_no_action() {
        let mut combatants = arena(Personality::Aggressive, 5);
        for c in combatants.iter_mut().skip(1) {
            c.alive = false;
        }
        assert_eq!(run(&combatants, 0.7, 1), BotDecision::idle());
    }
}
