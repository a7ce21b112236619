//! Combatants: per-match entities owned by the round state arena

use std::collections::VecDeque;

use rand::Rng;
use uuid::Uuid;

use crate::ws::protocol::CombatantInfo;

use super::mission::QuickMission;

/// Index into a match's combatant arena (equal to the seat index)
pub type CombatantId = usize;

/// How many recent attackers a combatant remembers
pub const ATTACKER_MEMORY: usize = 5;

/// Bot play style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Personality {
    /// Defends while threatened, reloads otherwise
    Defensive,
    /// Hunts whoever hit it last
    Vengeful,
    /// Balances reloads and attacks by ammo thresholds
    Tactical,
    /// Strongest affordable attack every round
    Aggressive,
}

impl Personality {
    pub const ALL: [Personality; 4] = [
        Personality::Defensive,
        Personality::Vengeful,
        Personality::Tactical,
        Personality::Aggressive,
    ];

    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::ALL[rng.gen_range(0..Self::ALL.len())]
    }
}

/// Stat counters used for scoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CombatStats {
    pub shots: u32,
    pub reloads: u32,
    pub damage: u32,
    pub blocks: u32,
    pub kills: u32,
}

/// Flags recorded during one round, cleared at the end of execution
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundFlags {
    /// Defend succeeded this round
    pub blocking: bool,
    /// An incoming attack was stopped
    pub blocked_attack: bool,
    /// Dealt damage to someone
    pub dealt_damage: bool,
    pub reloaded: bool,
    /// Submitted (or defaulted to) None
    pub idle: bool,
}

/// A participant's in-match entity (human-backed or bot)
#[derive(Debug, Clone)]
pub struct Combatant {
    pub id: CombatantId,
    /// Owning identity; None for bots
    pub identity: Option<Uuid>,
    pub name: String,
    pub health: u8,
    pub ammo: u8,
    pub alive: bool,
    /// 0 until eliminated, then the value of the match's elimination counter
    pub elimination_order: u32,
    pub stats: CombatStats,
    pub afk: bool,
    /// Consecutive rounds spent AFK
    pub afk_rounds: u32,
    pub personality: Option<Personality>,
    pub seat: usize,
    /// Consecutive successful defends (index into the defend table)
    pub defend_streak: usize,
    pub mission: Option<QuickMission>,
    /// Recent attackers, most recent last
    pub memory: VecDeque<CombatantId>,
    pub flags: RoundFlags,
    /// Session epoch currently allowed to act for this combatant
    pub authority_epoch: u64,
    /// Attacker credited with this combatant's elimination
    pub killed_by: Option<CombatantId>,
}

impl Combatant {
    pub fn human(id: CombatantId, identity: Uuid, name: String, health: u8, ammo: u8) -> Self {
        Self::new(id, Some(identity), name, health, ammo, None)
    }

    pub fn bot(
        id: CombatantId,
        name: String,
        personality: Personality,
        health: u8,
        ammo: u8,
    ) -> Self {
        Self::new(id, None, name, health, ammo, Some(personality))
    }

    fn new(
        id: CombatantId,
        identity: Option<Uuid>,
        name: String,
        health: u8,
        ammo: u8,
        personality: Option<Personality>,
    ) -> Self {
        Self {
            id,
            identity,
            name,
            health,
            ammo,
            alive: true,
            elimination_order: 0,
            stats: CombatStats::default(),
            afk: false,
            afk_rounds: 0,
            personality,
            seat: id,
            defend_streak: 0,
            mission: None,
            memory: VecDeque::with_capacity(ATTACKER_MEMORY),
            flags: RoundFlags::default(),
            authority_epoch: 0,
            killed_by: None,
        }
    }

    pub fn is_bot(&self) -> bool {
        self.identity.is_none()
    }

    pub fn is_owned_by(&self, identity: Uuid) -> bool {
        self.identity == Some(identity)
    }

    /// Remember an attacker, dropping the oldest past the memory limit
    pub fn remember_attacker(&mut self, attacker: CombatantId) {
        self.memory.retain(|&a| a != attacker);
        self.memory.push_back(attacker);
        while self.memory.len() > ATTACKER_MEMORY {
            self.memory.pop_front();
        }
    }

    /// Most recent attacker still in memory
    pub fn last_attacker(&self) -> Option<CombatantId> {
        self.memory.back().copied()
    }

    pub fn info(&self) -> CombatantInfo {
        CombatantInfo {
            seat: self.seat,
            name: self.name.clone(),
            is_bot: self.is_bot(),
            health: self.health,
            ammo: self.ammo,
            alive: self.alive,
            elimination_order: self.elimination_order,
            afk: self.afk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attacker_memory_is_bounded_and_deduplicated() {
        let mut c = Combatant::bot(0, "Bot".into(), Personality::Vengeful, 3, 0);

        for attacker in [1, 2, 3, 4, 5, 2] {
            c.remember_attacker(attacker);
        }
        assert_eq!(c.memory.len(), ATTACKER_MEMORY);
        assert_eq!(c.last_attacker(), Some(2));

        c.remember_attacker(6);
        assert_eq!(c.memory.len(), ATTACKER_MEMORY);
        assert!(!c.memory.contains(&1));
    }
}
