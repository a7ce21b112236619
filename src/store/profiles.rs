//! Player profile documents: tickets, wallet, ranked points, nickname

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::supabase::{SupabaseClient, SupabaseError};

/// Profile document as stored per user
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub id: Uuid,
    pub nickname: Option<String>,
    #[serde(default)]
    pub tickets: u32,
    #[serde(default)]
    pub coins: i64,
    #[serde(default)]
    pub ranked_points: i64,
    #[serde(default)]
    pub has_played_ranked: bool,
    #[serde(default)]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl PlayerProfile {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

/// Wallet balances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub coins: i64,
    pub tickets: u32,
}

/// Opaque get/patch-by-id access to the per-user document store
#[async_trait]
pub trait ProfileService: Send + Sync {
    /// Fetch a profile document, if one exists
    async fn get_profile(&self, user_id: Uuid) -> Result<Option<PlayerProfile>, StoreError>;

    /// Number of ranked tickets held
    async fn ticket_count(&self, user_id: Uuid) -> Result<u32, StoreError>;

    /// Spend one ticket; Ok(false) when none is left
    async fn consume_ticket(&self, user_id: Uuid) -> Result<bool, StoreError>;

    /// Wallet balances
    async fn wallet(&self, user_id: Uuid) -> Result<Wallet, StoreError>;

    /// Add coins to the wallet
    async fn grant_coins(&self, user_id: Uuid, amount: i64) -> Result<(), StoreError>;

    async fn ranked_points(&self, user_id: Uuid) -> Result<i64, StoreError>;

    async fn set_ranked_points(&self, user_id: Uuid, points: i64) -> Result<(), StoreError>;

    async fn nickname(&self, user_id: Uuid) -> Result<Option<String>, StoreError>;

    async fn set_nickname(&self, user_id: Uuid, nickname: &str) -> Result<(), StoreError>;

    async fn mark_played_ranked(&self, user_id: Uuid) -> Result<(), StoreError>;

    /// Up to `limit` profiles ordered by ranked points, highest first
    async fn top_ranked(&self, limit: usize) -> Result<Vec<PlayerProfile>, StoreError>;
}

/// Run a store call under a deadline; elapsed maps to `StoreError::Timeout`
pub async fn with_timeout<T, F>(deadline: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .map_err(|_| StoreError::Timeout)?
}

/// Profile store backed by the Supabase `profiles` table
#[derive(Clone)]
pub struct SupabaseProfileStore {
    client: SupabaseClient,
}

#[derive(Serialize)]
struct TicketsPatch {
    tickets: u32,
}

#[derive(Serialize)]
struct CoinsPatch {
    coins: i64,
}

#[derive(Serialize)]
struct RankedPointsPatch {
    ranked_points: i64,
}

#[derive(Serialize)]
struct NicknamePatch<'a> {
    nickname: &'a str,
}

#[derive(Serialize)]
struct PlayedRankedPatch {
    has_played_ranked: bool,
}

impl SupabaseProfileStore {
    pub fn new(client: SupabaseClient) -> Self {
        Self { client }
    }

    async fn require(&self, user_id: Uuid) -> Result<PlayerProfile, StoreError> {
        self.get_profile(user_id)
            .await?
            .ok_or(StoreError::NotFound(user_id))
    }
}

#[async_trait]
impl ProfileService for SupabaseProfileStore {
    async fn get_profile(&self, user_id: Uuid) -> Result<Option<PlayerProfile>, StoreError> {
        let query = format!("id=eq.{}", user_id);
        Ok(self.client.get_one("profiles", &query).await?)
    }

    async fn ticket_count(&self, user_id: Uuid) -> Result<u32, StoreError> {
        Ok(self.require(user_id).await?.tickets)
    }

    async fn consume_ticket(&self, user_id: Uuid) -> Result<bool, StoreError> {
        let profile = self.require(user_id).await?;
        if profile.tickets == 0 {
            return Ok(false);
        }

        // Guarded on the value we read so concurrent spends cannot both succeed
        let query = format!("id=eq.{}&tickets=eq.{}", user_id, profile.tickets);
        let matched = self
            .client
            .update_matched(
                "profiles",
                &query,
                &TicketsPatch {
                    tickets: profile.tickets - 1,
                },
            )
            .await?;
        Ok(matched == 1)
    }

    async fn wallet(&self, user_id: Uuid) -> Result<Wallet, StoreError> {
        let profile = self.require(user_id).await?;
        Ok(Wallet {
            coins: profile.coins,
            tickets: profile.tickets,
        })
    }

    async fn grant_coins(&self, user_id: Uuid, amount: i64) -> Result<(), StoreError> {
        let profile = self.require(user_id).await?;
        let query = format!("id=eq.{}", user_id);
        self.client
            .update(
                "profiles",
                &query,
                &CoinsPatch {
                    coins: profile.coins + amount,
                },
            )
            .await?;
        Ok(())
    }

    async fn ranked_points(&self, user_id: Uuid) -> Result<i64, StoreError> {
        Ok(self.require(user_id).await?.ranked_points)
    }

    async fn set_ranked_points(&self, user_id: Uuid, points: i64) -> Result<(), StoreError> {
        let query = format!("id=eq.{}", user_id);
        self.client
            .update(
                "profiles",
                &query,
                &RankedPointsPatch {
                    ranked_points: points,
                },
            )
            .await?;
        Ok(())
    }

    async fn nickname(&self, user_id: Uuid) -> Result<Option<String>, StoreError> {
        Ok(self.get_profile(user_id).await?.and_then(|p| p.nickname))
    }

    async fn set_nickname(&self, user_id: Uuid, nickname: &str) -> Result<(), StoreError> {
        if self.get_profile(user_id).await?.is_none() {
            let mut profile = PlayerProfile::new(user_id);
            profile.nickname = Some(nickname.to_string());
            let _: PlayerProfile = self.client.insert("profiles", &profile).await?;
            return Ok(());
        }

        let query = format!("id=eq.{}", user_id);
        self.client
            .update("profiles", &query, &NicknamePatch { nickname })
            .await?;
        Ok(())
    }

    async fn mark_played_ranked(&self, user_id: Uuid) -> Result<(), StoreError> {
        let query = format!("id=eq.{}", user_id);
        self.client
            .update(
                "profiles",
                &query,
                &PlayedRankedPatch {
                    has_played_ranked: true,
                },
            )
            .await?;
        Ok(())
    }

    async fn top_ranked(&self, limit: usize) -> Result<Vec<PlayerProfile>, StoreError> {
        let query = format!("order=ranked_points.desc&limit={}", limit);
        Ok(self.client.get("profiles", &query).await?)
    }
}

/// Profile store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Supabase error: {0}")]
    Supabase(#[from] SupabaseError),

    #[error("Profile store call timed out")]
    Timeout,

    #[error("Profile not found: {0}")]
    NotFound(Uuid),

    #[error("Profile store unavailable")]
    Unavailable,
}
