//! In-memory profile store for local development and tests

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use super::profiles::{PlayerProfile, ProfileService, StoreError, Wallet};

/// Profile documents held in a concurrent map
#[derive(Default)]
pub struct InMemoryProfileStore {
    profiles: DashMap<Uuid, PlayerProfile>,
    unavailable: AtomicBool,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or replace a profile document
    #[cfg(test)]
    pub fn put(&self, profile: PlayerProfile) {
        self.profiles.insert(profile.id, profile);
    }

    /// Simulate an unreachable store: every call fails
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Copy of a stored profile
    pub fn snapshot(&self, user_id: Uuid) -> Option<PlayerProfile> {
        self.profiles.get(&user_id).map(|p| p.clone())
    }

    fn guard(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }

    fn with_profile<T>(
        &self,
        user_id: Uuid,
        f: impl FnOnce(&mut PlayerProfile) -> T,
    ) -> Result<T, StoreError> {
        self.guard()?;
        let mut entry = self
            .profiles
            .entry(user_id)
            .or_insert_with(|| PlayerProfile::new(user_id));
        Ok(f(entry.value_mut()))
    }
}

#[async_trait]
impl ProfileService for InMemoryProfileStore {
    async fn get_profile(&self, user_id: Uuid) -> Result<Option<PlayerProfile>, StoreError> {
        self.guard()?;
        Ok(self.snapshot(user_id))
    }

    async fn ticket_count(&self, user_id: Uuid) -> Result<u32, StoreError> {
        self.guard()?;
        Ok(self.profiles.get(&user_id).map(|p| p.tickets).unwrap_or(0))
    }

    async fn consume_ticket(&self, user_id: Uuid) -> Result<bool, StoreError> {
        self.with_profile(user_id, |p| {
            if p.tickets == 0 {
                false
            } else {
                p.tickets -= 1;
                true
            }
        })
    }

    async fn wallet(&self, user_id: Uuid) -> Result<Wallet, StoreError> {
        self.with_profile(user_id, |p| Wallet {
            coins: p.coins,
            tickets: p.tickets,
        })
    }

    async fn grant_coins(&self, user_id: Uuid, amount: i64) -> Result<(), StoreError> {
        self.with_profile(user_id, |p| p.coins += amount)
    }

    async fn ranked_points(&self, user_id: Uuid) -> Result<i64, StoreError> {
        self.with_profile(user_id, |p| p.ranked_points)
    }

    async fn set_ranked_points(&self, user_id: Uuid, points: i64) -> Result<(), StoreError> {
        self.with_profile(user_id, |p| p.ranked_points = points)
    }

    async fn nickname(&self, user_id: Uuid) -> Result<Option<String>, StoreError> {
        self.guard()?;
        Ok(self.profiles.get(&user_id).and_then(|p| p.nickname.clone()))
    }

    async fn set_nickname(&self, user_id: Uuid, nickname: &str) -> Result<(), StoreError> {
        self.with_profile(user_id, |p| p.nickname = Some(nickname.to_string()))
    }

    async fn mark_played_ranked(&self, user_id: Uuid) -> Result<(), StoreError> {
        self.with_profile(user_id, |p| p.has_played_ranked = true)
    }

    async fn top_ranked(&self, limit: usize) -> Result<Vec<PlayerProfile>, StoreError> {
        self.guard()?;
        let mut all: Vec<PlayerProfile> = self.profiles.iter().map(|p| p.clone()).collect();
        all.sort_by(|a, b| b.ranked_points.cmp(&a.ranked_points));
        all.truncate(limit);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn consume_ticket_stops_at_zero() {
        let store = InMemoryProfileStore::new();
        let id = Uuid::new_v4();
        store.put(PlayerProfile {
            tickets: 1,
            ..PlayerProfile::new(id)
        });

        assert!(store.consume_ticket(id).await.unwrap());
        assert!(!store.consume_ticket(id).await.unwrap());
        assert_eq!(store.ticket_count(id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryProfileStore::new();
        store.set_unavailable(true);

        let id = Uuid::new_v4();
        assert!(matches!(
            store.ticket_count(id).await,
            Err(StoreError::Unavailable)
        ));
        assert!(store.grant_coins(id, 5).await.is_err());
    }

    #[tokio::test]
    async fn top_ranked_is_sorted_and_limited() {
        let store = InMemoryProfileStore::new();
        for points in [10, 40, 20] {
            store.put(PlayerProfile {
                ranked_points: points,
                ..PlayerProfile::new(Uuid::new_v4())
            });
        }

        let top = store.top_ranked(2).await.unwrap();
        let points: Vec<i64> = top.iter().map(|p| p.ranked_points).collect();
        assert_eq!(points, vec![40, 20]);
    }
}
