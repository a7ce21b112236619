//! Quick missions: short side objectives evaluated in the round they are handed out

use std::collections::HashSet;

use rand::Rng;

use crate::ws::protocol::MissionKind;

use super::action::RoundRules;
use super::combatant::{Combatant, CombatantId, RoundFlags};

/// A mission held by one combatant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuickMission {
    pub kind: MissionKind,
    pub assigned_round: u32,
    pub completed: bool,
}

impl QuickMission {
    pub fn new(kind: MissionKind, assigned_round: u32) -> Self {
        Self {
            kind,
            assigned_round,
            completed: false,
        }
    }

    /// Whether the round flags satisfy the objective
    pub fn is_met(&self, flags: &RoundFlags) -> bool {
        match self.kind {
            MissionKind::DoNothing => flags.idle,
            MissionKind::LandHit => flags.dealt_damage,
            MissionKind::BlockAttack => flags.blocked_attack,
            MissionKind::Reload => flags.reloaded,
        }
    }
}

const KINDS: [MissionKind; 4] = [
    MissionKind::DoNothing,
    MissionKind::LandHit,
    MissionKind::BlockAttack,
    MissionKind::Reload,
];

/// Tracks who already received a mission in the current cycle
#[derive(Debug, Default)]
pub struct MissionCycle {
    served: HashSet<CombatantId>,
}

impl MissionCycle {
    /// Draw one recipient without replacement and hand them a mission.
    ///
    /// Eligible: alive, no active mission, not served this cycle. When
    /// nobody is eligible but someone lacks a mission, the cycle resets.
    pub fn assign<R: Rng + ?Sized>(
        &mut self,
        combatants: &mut [Combatant],
        round: u32,
        rng: &mut R,
    ) -> Option<(CombatantId, QuickMission)> {
        let mut eligible = self.eligible(combatants);
        if eligible.is_empty() {
            let any_without = combatants.iter().any(|c| c.alive && c.mission.is_none());
            if !any_without {
                return None;
            }
            self.served.clear();
            eligible = self.eligible(combatants);
        }

        let recipient = eligible[rng.gen_range(0..eligible.len())];
        let mission = QuickMission::new(KINDS[rng.gen_range(0..KINDS.len())], round);
        combatants[recipient].mission = Some(mission);
        self.served.insert(recipient);
        Some((recipient, mission))
    }

    fn eligible(&self, combatants: &[Combatant]) -> Vec<CombatantId> {
        combatants
            .iter()
            .filter(|c| c.alive && c.mission.is_none() && !self.served.contains(&c.id))
            .map(|c| c.id)
            .collect()
    }

    pub fn served(&self) -> usize {
        self.served.len()
    }
}

/// Apply the reward for a completed mission
pub fn apply_reward(combatant: &mut Combatant, kind: MissionKind, rules: &RoundRules) {
    match kind {
        MissionKind::DoNothing => {
            combatant.ammo = combatant.ammo.saturating_add(2).min(rules.max_ammo);
        }
        MissionKind::LandHit => {
            combatant.health = combatant.health.saturating_add(1).min(rules.max_health);
        }
        MissionKind::BlockAttack => {
            combatant.ammo = combatant.ammo.saturating_add(1).min(rules.max_ammo);
            combatant.defend_streak = 0;
        }
        MissionKind::Reload => {
            combatant.ammo = combatant.ammo.saturating_add(1).min(rules.max_ammo);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::combatant::Personality;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn bots(n: usize) -> Vec<Combatant> {
        (0..n)
            .map(|i| Combatant::bot(i, format!("B{i}"), Personality::Tactical, 3, 0))
            .collect()
    }

    #[test]
    fn every_alive_combatant_is_served_before_the_cycle_resets() {
        let mut combatants = bots(4);
        let mut cycle = MissionCycle::default();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut seen = HashSet::new();

        for round in 0..4 {
            let (id, _) = cycle.assign(&mut combatants, round, &mut rng).unwrap();
            assert!(seen.insert(id), "combatant {id} served twice in one cycle");
            combatants[id].mission = None;
        }
        assert_eq!(cycle.served(), 4);

        // Everyone served: next draw starts a fresh cycle
        assert!(cycle.assign(&mut combatants, 4, &mut rng).is_some());
        assert_eq!(cycle.served(), 1);
    }

    #[test]
    fn dead_and_busy_combatants_are_skipped() {
        let mut combatants = bots(3);
        combatants[0].alive = false;
        combatants[1].mission = Some(QuickMission::new(MissionKind::Reload, 1));
        let mut cycle = MissionCycle::default();
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let (id, _) = cycle.assign(&mut combatants, 2, &mut rng).unwrap();
        assert_eq!(id, 2);
        assert!(cycle.assign(&mut combatants, 2, &mut rng).is_none());
    }

    #[test]
    fn block_reward_resets_defend_streak() {
        let rules = RoundRules::default();
        let mut c = Combatant::bot(0, "B".into(), Personality::Defensive, 3, 0);
        c.defend_streak = 3;

        apply_reward(&mut c, MissionKind::BlockAttack, &rules);
        assert_eq!(c.defend_streak, 0);
        assert_eq!(c.ammo, 1);
    }

    #[test]
    fn rewards_respect_caps() {
        let rules = RoundRules::default();
        let mut c = Combatant::bot(0, "B".into(), Personality::Defensive, 3, 5);

        apply_reward(&mut c, MissionKind::LandHit, &rules);
        apply_reward(&mut c, MissionKind::DoNothing, &rules);
        assert_eq!(c.health, rules.max_health);
        assert_eq!(c.ammo, rules.max_ammo);
    }
}
