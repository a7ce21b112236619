//! Action submissions and the rules that price and resolve them

use std::collections::HashMap;

use rand::Rng;

use crate::ws::protocol::{ActionKind, ModifierKind};

use super::combatant::CombatantId;

/// One combatant's action for the current round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionSubmission {
    pub combatant: CombatantId,
    pub kind: ActionKind,
    pub target: Option<CombatantId>,
    /// Order of the latest write within the round (tie-break fallback)
    pub seq: u64,
}

/// Submissions for the round in progress
#[derive(Debug, Default)]
pub struct SubmissionBook {
    entries: HashMap<CombatantId, ActionSubmission>,
    next_seq: u64,
}

impl SubmissionBook {
    /// Record or overwrite a combatant's action
    pub fn put(&mut self, combatant: CombatantId, kind: ActionKind, target: Option<CombatantId>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            combatant,
            ActionSubmission {
                combatant,
                kind,
                target,
                seq,
            },
        );
    }

    pub fn get(&self, combatant: CombatantId) -> Option<&ActionSubmission> {
        self.entries.get(&combatant)
    }

    /// Default every listed combatant without a submission to None
    pub fn fill_missing(&mut self, combatants: impl IntoIterator<Item = CombatantId>) -> usize {
        let mut filled = 0;
        for id in combatants {
            if !self.entries.contains_key(&id) {
                self.put(id, ActionKind::None, None);
                filled += 1;
            }
        }
        filled
    }

    /// Submissions of the given kinds, in submission order
    pub fn of_kinds(&self, kinds: &[ActionKind]) -> Vec<ActionSubmission> {
        let mut picked: Vec<ActionSubmission> = self
            .entries
            .values()
            .filter(|s| kinds.contains(&s.kind))
            .copied()
            .collect();
        picked.sort_by_key(|s| s.seq);
        picked
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Match rules, derived from the modifier
#[derive(Debug, Clone)]
pub struct RoundRules {
    pub max_health: u8,
    pub starting_ammo: u8,
    pub max_ammo: u8,
    pub attack_cost: u8,
    pub attack_damage: u8,
    pub heavy_cost: u8,
    pub heavy_damage: u8,
    pub reload_amount: u8,
    /// Several attackers on one target all deal damage
    pub damage_accumulates: bool,
    /// Defend success chance by consecutive-defend index
    pub defend_table: Vec<f64>,
    /// First round that may hand out a mission
    pub first_mission_round: u32,
    /// Rounds between mission rounds
    pub mission_interval: u32,
    pub mission_chance: f64,
    pub afk_rounds_before_elimination: u32,
    pub round_limit: u32,
}

impl Default for RoundRules {
    fn default() -> Self {
        Self {
            max_health: 3,
            starting_ammo: 0,
            max_ammo: 6,
            attack_cost: 1,
            attack_damage: 1,
            heavy_cost: 3,
            heavy_damage: 2,
            reload_amount: 1,
            damage_accumulates: false,
            defend_table: vec![1.0, 0.75, 0.5, 0.25],
            first_mission_round: 2,
            mission_interval: 3,
            mission_chance: 0.6,
            afk_rounds_before_elimination: 3,
            round_limit: 100,
        }
    }
}

impl RoundRules {
    /// Rules for a match played under `modifier`
    pub fn for_modifier(modifier: ModifierKind, mission_chance: f64) -> Self {
        let mut rules = Self {
            mission_chance,
            ..Self::default()
        };
        match modifier {
            ModifierKind::Classic => {}
            ModifierKind::Bloodbath => rules.damage_accumulates = true,
            ModifierKind::Overcharged => rules.reload_amount = 2,
            ModifierKind::Brittle => rules.defend_table = vec![0.75, 0.5, 0.25, 0.0],
            ModifierKind::Armory => rules.starting_ammo = 2,
            ModifierKind::Bargain => rules.heavy_cost = 2,
        }
        rules
    }

    /// Ammo an action costs (0 for non-attacks)
    pub fn cost(&self, kind: ActionKind) -> u8 {
        match kind {
            ActionKind::Attack => self.attack_cost,
            ActionKind::HeavyAttack => self.heavy_cost,
            _ => 0,
        }
    }

    pub fn damage(&self, kind: ActionKind) -> u8 {
        match kind {
            ActionKind::Attack => self.attack_damage,
            ActionKind::HeavyAttack => self.heavy_damage,
            _ => 0,
        }
    }

    /// Chance the next Defend succeeds at the given streak
    pub fn defend_chance(&self, streak: usize) -> f64 {
        let last = self.defend_table.len().saturating_sub(1);
        self.defend_table
            .get(streak.min(last))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn is_mission_round(&self, round: u32) -> bool {
        round >= self.first_mission_round
            && (round - self.first_mission_round) % self.mission_interval.max(1) == 0
    }
}

/// Pick the match modifier
pub fn roll_modifier<R: Rng + ?Sized>(rng: &mut R) -> ModifierKind {
    const ALL: [ModifierKind; 6] = [
        ModifierKind::Classic,
        ModifierKind::Bloodbath,
        ModifierKind::Overcharged,
        ModifierKind::Brittle,
        ModifierKind::Armory,
        ModifierKind::Bargain,
    ];
    ALL[rng.gen_range(0..ALL.len())]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_keeps_one_submission_with_newer_seq() {
        let mut book = SubmissionBook::default();
        book.put(0, ActionKind::Reload, None);
        book.put(1, ActionKind::Defend, None);
        book.put(0, ActionKind::Attack, Some(1));

        assert_eq!(book.len(), 2);
        let s = book.get(0).unwrap();
        assert_eq!(s.kind, ActionKind::Attack);
        assert!(s.seq > book.get(1).unwrap().seq);
    }

    #[test]
    fn fill_missing_defaults_to_none() {
        let mut book = SubmissionBook::default();
        book.put(2, ActionKind::Reload, None);

        assert_eq!(book.fill_missing([0, 1, 2]), 2);
        assert_eq!(book.get(0).unwrap().kind, ActionKind::None);
        assert_eq!(book.get(2).unwrap().kind, ActionKind::Reload);
    }

    #[test]
    fn defend_chance_clamps_to_last_entry() {
        let rules = RoundRules::default();
        assert_eq!(rules.defend_chance(0), 1.0);
        assert_eq!(rules.defend_chance(3), 0.25);
        assert_eq!(rules.defend_chance(9), 0.25);
    }

    #[test]
    fn mission_rounds_start_at_two_then_every_three() {
        let rules = RoundRules::default();
        let rounds: Vec<u32> = (1..=11).filter(|r| rules.is_mission_round(*r)).collect();
        assert_eq!(rounds, vec![2, 5, 8, 11]);
    }

    #[test]
    fn modifiers_adjust_rules() {
        assert!(RoundRules::for_modifier(ModifierKind::Bloodbath, 0.6).damage_accumulates);
        assert_eq!(RoundRules::for_modifier(ModifierKind::Bargain, 0.6).heavy_cost, 2);
        assert_eq!(RoundRules::for_modifier(ModifierKind::Armory, 0.6).starting_ammo, 2);
        assert!(!RoundRules::for_modifier(ModifierKind::Classic, 0.6).damage_accumulates);
    }
}
