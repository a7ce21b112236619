//! Application state shared across routes

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::game::{InstanceManager, MatchRegistry, ReconnectionResolver};
use crate::matchmaking::{MatchmakingService, RoomService};
use crate::store::{InMemoryProfileStore, ProfileService, SupabaseClient, SupabaseProfileStore};
use crate::ws::session::SessionHub;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn ProfileService>,
    pub sessions: Arc<SessionHub>,
    pub match_registry: Arc<MatchRegistry>,
    pub instances: Arc<InstanceManager>,
    pub resolver: Arc<ReconnectionResolver>,
    pub matchmaking: Arc<MatchmakingService>,
    pub rooms: Arc<RoomService>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let store: Arc<dyn ProfileService> =
            match (&config.supabase_url, &config.supabase_service_role_key) {
                (Some(url), Some(key)) => {
                    info!("Using Supabase profile store");
                    Arc::new(SupabaseProfileStore::new(SupabaseClient::new(url, key)))
                }
                _ => {
                    warn!("Supabase not configured, profiles are kept in memory and lost on restart");
                    Arc::new(InMemoryProfileStore::new())
                }
            };
        Self::with_store(config, store)
    }

    /// Wire every service around the given profile store
    pub fn with_store(config: Config, store: Arc<dyn ProfileService>) -> Self {
        let config = Arc::new(config);
        let tuning = Arc::new(config.tuning.clone());

        let sessions = Arc::new(SessionHub::new());
        let match_registry = Arc::new(MatchRegistry::new());
        let instances = Arc::new(InstanceManager::new(
            match_registry.clone(),
            sessions.clone(),
            store.clone(),
            tuning.clone(),
        ));
        let resolver = Arc::new(ReconnectionResolver::new(match_registry.clone()));
        let matchmaking = Arc::new(MatchmakingService::new(
            &tuning,
            sessions.clone(),
            instances.clone(),
            store.clone(),
        ));
        let rooms = Arc::new(RoomService::new(sessions.clone(), instances.clone()));

        Self {
            config,
            store,
            sessions,
            match_registry,
            instances,
            resolver,
            matchmaking,
            rooms,
        }
    }
}
