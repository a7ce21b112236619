//! Priority token rotation and the tie-break oracle built on its history

use std::collections::VecDeque;

use super::action::ActionSubmission;
use super::combatant::{Combatant, CombatantId};

/// Maximum remembered priority holders
pub const PRIORITY_HISTORY_LEN: usize = 7;

/// Recent priority holders, most recent last
#[derive(Debug, Clone, Default)]
pub struct PriorityHistory {
    holders: VecDeque<CombatantId>,
}

impl PriorityHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a holder list (oldest first); only the last 7 are kept
    #[cfg(test)]
    pub fn from_holders(holders: impl IntoIterator<Item = CombatantId>) -> Self {
        let mut history = Self::new();
        for holder in holders {
            history.push(holder);
        }
        history
    }

    pub fn push(&mut self, holder: CombatantId) {
        self.holders.push_back(holder);
        while self.holders.len() > PRIORITY_HISTORY_LEN {
            self.holders.pop_front();
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.holders.len()
    }

    #[cfg(test)]
    pub fn current(&self) -> Option<CombatantId> {
        self.holders.back().copied()
    }

    /// How recently `id` held priority: 0 = current holder, None = not in history
    pub fn recency(&self, id: CombatantId) -> Option<usize> {
        self.holders.iter().rev().position(|&h| h == id)
    }

    /// Pick the one attacker whose hit lands when damage does not accumulate.
    ///
    /// The most recent priority holder among the attackers wins; attackers
    /// never seen in the history fall back to submission order.
    pub fn tie_break<'a>(&self, attackers: &'a [ActionSubmission]) -> Option<&'a ActionSubmission> {
        attackers.iter().min_by_key(|s| self.rank(s))
    }

    /// Sort attackers in tie-break order (winner first)
    pub fn order(&self, attackers: &mut [ActionSubmission]) {
        attackers.sort_by_key(|s| self.rank(s));
    }

    fn rank(&self, s: &ActionSubmission) -> (usize, u64) {
        (
            self.recency(s.combatant).unwrap_or(PRIORITY_HISTORY_LEN),
            s.seq,
        )
    }
}

/// Next alive seat strictly after `current`, wrapping; `current` itself if it is the only one
pub fn next_alive_seat(combatants: &[Combatant], current: CombatantId) -> Option<CombatantId> {
    let n = combatants.len();
    if n == 0 {
        return None;
    }
    (1..=n)
        .map(|step| (current + step) % n)
        .find(|&seat| combatants[seat].alive)
}

/// Forward seat distance from the priority holder (holder = 0)
pub fn proximity(holder: CombatantId, seat: CombatantId, seats: usize) -> usize {
    if seats == 0 {
        return 0;
    }
    (seat + seats - holder % seats) % seats
}
