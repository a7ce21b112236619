//! Leaderboard aggregation, points and end-of-match persistence

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::store::{with_timeout, ProfileService, StoreError};
use crate::ws::protocol::LeaderboardColumns;

use super::combatant::{CombatStats, Combatant};
use super::round::Outcome;

/// Ranked placement points, winner first. Sums to zero for a full match.
pub const RANKED_PLACEMENT_POINTS: [i64; 6] = [50, 25, 10, -10, -25, -50];

/// Stable leaderboard key: humans by identity, bots by seat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowKey {
    Human(Uuid),
    Bot(usize),
}

impl RowKey {
    pub fn of(combatant: &Combatant) -> Self {
        match combatant.identity {
            Some(identity) => RowKey::Human(identity),
            None => RowKey::Bot(combatant.seat),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeaderboardRow {
    pub identity: Option<Uuid>,
    pub name: String,
    pub seat: usize,
    pub stats: CombatStats,
    pub points: i64,
    pub elimination_order: u32,
    pub alive: bool,
    pub disconnected: bool,
}

impl LeaderboardRow {
    fn from_combatant(c: &Combatant, connected: bool) -> Self {
        Self {
            identity: c.identity,
            name: c.name.clone(),
            seat: c.seat,
            stats: c.stats,
            points: 0,
            elimination_order: c.elimination_order,
            alive: c.alive,
            disconnected: c.identity.is_some() && !connected,
        }
    }
}

pub fn ranked_points(placement: usize, kills: u32) -> i64 {
    let base = RANKED_PLACEMENT_POINTS
        .get(placement)
        .or(RANKED_PLACEMENT_POINTS.last())
        .copied()
        .unwrap_or_default();
    base + 5 * i64::from(kills)
}

pub fn casual_points(stats: &CombatStats) -> i64 {
    let activity = stats.reloads + stats.shots + stats.damage + stats.blocks;
    100 * i64::from(stats.kills) + 5 * i64::from(activity)
}

/// Column-wise form sent to clients
pub fn columns(rows: &[LeaderboardRow]) -> LeaderboardColumns {
    let mut cols = LeaderboardColumns::default();
    for row in rows {
        cols.names.push(row.name.clone());
        cols.kills.push(row.stats.kills);
        cols.shots.push(row.stats.shots);
        cols.reloads.push(row.stats.reloads);
        cols.damage.push(row.stats.damage);
        cols.blocks.push(row.stats.blocks);
        cols.points.push(row.points);
        cols.disconnected.push(row.disconnected);
    }
    cols
}

/// Builds the match leaderboard and pushes ranked results to the profile store
pub struct ScoringAggregator {
    match_id: Uuid,
    ranked: bool,
    starters: HashSet<RowKey>,
    snapshot: HashMap<RowKey, LeaderboardRow>,
    finalized: Option<Vec<LeaderboardRow>>,
    store: Arc<dyn ProfileService>,
    store_timeout: Duration,
    win_bonus: i64,
}

impl ScoringAggregator {
    pub fn new(
        match_id: Uuid,
        ranked: bool,
        starters: &[Combatant],
        store: Arc<dyn ProfileService>,
        store_timeout: Duration,
        win_bonus: i64,
    ) -> Self {
        Self {
            match_id,
            ranked,
            starters: starters.iter().map(RowKey::of).collect(),
            snapshot: HashMap::new(),
            finalized: None,
            store,
            store_timeout,
            win_bonus,
        }
    }

    #[cfg(test)]
    pub fn is_finalized(&self) -> bool {
        self.finalized.is_some()
    }

    /// Merge live combatants into the carried snapshot and return sorted, scored rows.
    ///
    /// Starters missing from `live` keep their last row, flagged disconnected.
    pub fn rebuild(
        &mut self,
        live: &[Combatant],
        is_connected: impl Fn(Uuid) -> bool,
    ) -> Vec<LeaderboardRow> {
        let mut seen = HashSet::new();
        for c in live {
            let key = RowKey::of(c);
            if !self.starters.contains(&key) {
                continue;
            }
            let connected = c.identity.map(&is_connected).unwrap_or(true);
            self.snapshot
                .insert(key, LeaderboardRow::from_combatant(c, connected));
            seen.insert(key);
        }
        for (key, row) in self.snapshot.iter_mut() {
            if !seen.contains(key) {
                row.disconnected = true;
            }
        }

        let mut rows: Vec<LeaderboardRow> = self.snapshot.values().cloned().collect();
        rows.sort_by(|a, b| {
            b.alive
                .cmp(&a.alive)
                .then(b.elimination_order.cmp(&a.elimination_order))
                .then(a.seat.cmp(&b.seat))
        });

        for (placement, row) in rows.iter_mut().enumerate() {
            row.points = if self.ranked {
                ranked_points(placement, row.stats.kills)
            } else {
                casual_points(&row.stats)
            };
        }
        rows
    }

    /// Compute the final leaderboard and persist ranked results. Runs once;
    /// later calls return the same rows without touching the store.
    pub async fn finalize(
        &mut self,
        live: &[Combatant],
        outcome: Outcome,
        is_connected: impl Fn(Uuid) -> bool,
    ) -> Vec<LeaderboardRow> {
        if let Some(rows) = &self.finalized {
            return rows.clone();
        }
        let rows = self.rebuild(live, is_connected);

        if self.ranked {
            for row in &rows {
                let Some(identity) = row.identity else {
                    continue;
                };
                self.apply_ranked_delta(identity, row.points).await;
            }

            if let Outcome::Win(winner) = outcome {
                let winner_identity = live.get(winner).and_then(|c| c.identity);
                if let Some(identity) = winner_identity {
                    let grant = self.store.grant_coins(identity, self.win_bonus);
                    match with_timeout(self.store_timeout, grant).await {
                        Ok(()) => info!(
                            match_id = %self.match_id,
                            identity = %identity,
                            bonus = self.win_bonus,
                            "Granted ranked win bonus"
                        ),
                        Err(e) => warn!(
                            match_id = %self.match_id,
                            identity = %identity,
                            error = %e,
                            "Skipping ranked win bonus"
                        ),
                    }
                }
            }
        }

        info!(
            match_id = %self.match_id,
            rows = rows.len(),
            ranked = self.ranked,
            "Scoring finalized"
        );
        self.finalized = Some(rows.clone());
        rows
    }

    async fn apply_ranked_delta(&self, identity: Uuid, delta: i64) {
        let timeout = self.store_timeout;
        let points: Result<(), StoreError> = async {
            let current = with_timeout(timeout, self.store.ranked_points(identity)).await?;
            let updated = (current + delta).max(0);
            with_timeout(timeout, self.store.set_ranked_points(identity, updated)).await
        }
        .await;
        if let Err(e) = points {
            warn!(
                match_id = %self.match_id,
                identity = %identity,
                delta,
                error = %e,
                "Failed to persist ranked points"
            );
        }

        if let Err(e) = with_timeout(timeout, self.store.mark_played_ranked(identity)).await {
            warn!(
                match_id = %self.match_id,
                identity = %identity,
                error = %e,
                "Failed to mark ranked participation"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::game::combatant::Personality;
    use crate::store::profiles::PlayerProfile;
    use crate::store::{InMemoryProfileStore, Wallet};

    fn lineup(humans: &[Uuid]) -> Vec<Combatant> {
        (0..6)
            .map(|seat| match humans.get(seat) {
                Some(id) => Combatant::human(seat, *id, format!("P{seat}"), 3, 0),
                None => Combatant::bot(seat, format!("B{seat}"), Personality::Tactical, 3, 0),
            })
            .collect()
    }

    /// Eliminate seats in the given order; the rest stay alive
    fn eliminate(combatants: &mut [Combatant], order: &[usize]) {
        for (i, seat) in order.iter().enumerate() {
            combatants[*seat].alive = false;
            combatants[*seat].health = 0;
            combatants[*seat].elimination_order = i as u32 + 1;
        }
    }

    fn aggregator(
        ranked: bool,
        combatants: &[Combatant],
        store: Arc<dyn ProfileService>,
    ) -> ScoringAggregator {
        ScoringAggregator::new(
            Uuid::new_v4(),
            ranked,
            combatants,
            store,
            Duration::from_millis(500),
            25,
        )
    }

    #[test]
    fn ranked_placements_sum_to_zero() {
        let total: i64 = (0..6).map(|p| ranked_points(p, 0)).sum();
        assert_eq!(total, 0);
        assert_eq!(ranked_points(0, 2), 60);
    }

    #[test]
    fn casual_points_reward_kills_and_activity() {
        let stats = CombatStats {
            shots: 4,
            reloads: 3,
            damage: 2,
            blocks: 1,
            kills: 2,
        };
        assert_eq!(casual_points(&stats), 250);
    }

    #[test]
    fn rows_are_ordered_winner_first_then_latest_eliminated() {
        let mut combatants = lineup(&[]);
        eliminate(&mut combatants, &[4, 0, 5, 1, 2]);
        let mut agg = aggregator(true, &combatants, Arc::new(InMemoryProfileStore::new()));

        let rows = agg.rebuild(&combatants, |_| true);
        let seats: Vec<usize> = rows.iter().map(|r| r.seat).collect();
        assert_eq!(seats, vec![3, 2, 1, 5, 0, 4]);
        assert_eq!(rows[0].points, 50);
        assert_eq!(rows[5].points, -50);
    }

    #[test]
    fn disconnected_humans_keep_their_row() {
        let human = Uuid::new_v4();
        let mut combatants = lineup(&[human]);
        combatants[0].stats.kills = 1;
        let mut agg = aggregator(false, &combatants, Arc::new(InMemoryProfileStore::new()));

        agg.rebuild(&combatants, |_| true);
        // Live set without the human: carried row stays, flagged
        let rows = agg.rebuild(&combatants[1..], |_| true);
        let row = rows.iter().find(|r| r.identity == Some(human)).unwrap();
        assert!(row.disconnected);
        assert_eq!(row.stats.kills, 1);

        let rows = agg.rebuild(&combatants, |id| id != human);
        assert!(rows.iter().find(|r| r.identity == Some(human)).unwrap().disconnected);
    }

    #[tokio::test]
    async fn finalize_is_idempotent_and_clamps_at_zero() {
        let winner = Uuid::new_v4();
        let loser = Uuid::new_v4();
        let store = Arc::new(InMemoryProfileStore::new());
        store.put(PlayerProfile {
            ranked_points: 100,
            ..PlayerProfile::new(winner)
        });
        store.put(PlayerProfile {
            ranked_points: 20,
            ..PlayerProfile::new(loser)
        });

        let mut combatants = lineup(&[winner, loser]);
        eliminate(&mut combatants, &[1, 2, 3, 4, 5]);
        let mut agg = aggregator(true, &combatants, store.clone());

        agg.finalize(&combatants, Outcome::Win(0), |_| true).await;
        let rows = agg.finalize(&combatants, Outcome::Win(0), |_| true).await;
        assert_eq!(rows.len(), 6);

        let w = store.snapshot(winner).unwrap();
        assert_eq!(w.ranked_points, 150);
        assert_eq!(w.coins, 25);
        assert!(w.has_played_ranked);

        let l = store.snapshot(loser).unwrap();
        assert_eq!(l.ranked_points, 0);
        assert!(l.has_played_ranked);
    }

    #[tokio::test]
    async fn unreachable_store_does_not_block_results() {
        let human = Uuid::new_v4();
        let store = Arc::new(InMemoryProfileStore::new());
        store.set_unavailable(true);
        let combatants = lineup(&[human]);
        let mut agg = aggregator(true, &combatants, store.clone());

        let rows = agg.finalize(&combatants, Outcome::Draw, |_| false).await;
        assert_eq!(rows.len(), 6);
        assert!(agg.is_finalized());
    }

    /// Profile store whose ranked points cannot be read
    struct PointsOffline(InMemoryProfileStore);

    #[async_trait]
    impl ProfileService for PointsOffline {
        async fn get_profile(&self, user_id: Uuid) -> Result<Option<PlayerProfile>, StoreError> {
            self.0.get_profile(user_id).await
        }
        async fn ticket_count(&self, user_id: Uuid) -> Result<u32, StoreError> {
            self.0.ticket_count(user_id).await
        }
        async fn consume_ticket(&self, user_id: Uuid) -> Result<bool, StoreError> {
            self.0.consume_ticket(user_id).await
        }
        async fn wallet(&self, user_id: Uuid) -> Result<Wallet, StoreError> {
            self.0.wallet(user_id).await
        }
        async fn grant_coins(&self, user_id: Uuid, amount: i64) -> Result<(), StoreError> {
            self.0.grant_coins(user_id, amount).await
        }
        async fn ranked_points(&self, _user_id: Uuid) -> Result<i64, StoreError> {
            Err(StoreError::Unavailable)
        }
        async fn set_ranked_points(&self, user_id: Uuid, points: i64) -> Result<(), StoreError> {
            self.0.set_ranked_points(user_id, points).await
        }
        async fn nickname(&self, user_id: Uuid) -> Result<Option<String>, StoreError> {
            self.0.nickname(user_id).await
        }
        async fn set_nickname(&self, user_id: Uuid, nickname: &str) -> Result<(), StoreError> {
            self.0.set_nickname(user_id, nickname).await
        }
        async fn mark_played_ranked(&self, user_id: Uuid) -> Result<(), StoreError> {
            self.0.mark_played_ranked(user_id).await
        }
        async fn top_ranked(&self, limit: usize) -> Result<Vec<PlayerProfile>, StoreError> {
            self.0.top_ranked(limit).await
        }
    }

    #[tokio::test]
    async fn participation_is_recorded_when_points_fail() {
        let human = Uuid::new_v4();
        let store = Arc::new(PointsOffline(InMemoryProfileStore::new()));
        let combatants = lineup(&[human]);
        let mut agg = aggregator(true, &combatants, store.clone());

        agg.finalize(&combatants, Outcome::Draw, |_| true).await;

        let profile = store.0.snapshot(human).unwrap();
        assert!(profile.has_played_ranked);
        assert_eq!(profile.ranked_points, 0);
    }
}
