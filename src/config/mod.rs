//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::ws::protocol::GameMode;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit JSON log lines (`LOG_FORMAT=json`)
    pub log_json: bool,

    /// Supabase project URL (None = in-memory profile store)
    pub supabase_url: Option<String>,
    /// Supabase service role key (bypasses RLS - server only!)
    pub supabase_service_role_key: Option<String>,
    /// Supabase JWT secret for token verification
    pub supabase_jwt_secret: String,

    /// Public base URL for callbacks
    pub public_base_url: String,
    /// Allowed client origin for CORS
    pub client_origin: String,

    /// Gameplay and lifecycle tuning
    pub tuning: GameTuning,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Render provides PORT env var, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_json: env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")),

            supabase_url: env::var("SUPABASE_URL").ok(),
            supabase_service_role_key: env::var("SUPABASE_SERVICE_ROLE_KEY").ok(),
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .map_err(|_| ConfigError::Missing("SUPABASE_JWT_SECRET"))?,

            public_base_url: env::var("PUBLIC_BASE_URL")
                .map_err(|_| ConfigError::Missing("PUBLIC_BASE_URL"))?,
            client_origin: env::var("CLIENT_ORIGIN")
                .map_err(|_| ConfigError::Missing("CLIENT_ORIGIN"))?,

            tuning: GameTuning::from_env()?,
        })
    }
}

/// Per-mode queue and round timing
#[derive(Clone, Copy, Debug)]
pub struct ModeSettings {
    /// Queue size at which the countdown starts
    pub min_players: usize,
    /// Countdown length once `min_players` is reached
    pub countdown: Duration,
    /// Length of each decision window
    pub decision_window: Duration,
    /// Ranked placement scoring instead of casual activity scoring
    pub ranked_scoring: bool,
}

/// Maximum combatants per match, humans and bots together
pub const MATCH_CAPACITY: usize = 6;

/// Gameplay and lifecycle tuning
#[derive(Clone, Debug)]
pub struct GameTuning {
    pub practice: ModeSettings,
    pub casual: ModeSettings,
    pub ranked: ModeSettings,
    pub custom: ModeSettings,

    /// How long WaitingForPlayers may last before the match is aborted
    pub waiting_timeout: Duration,
    /// Extra time past the decision window before the watchdog forces defaults
    pub watchdog_grace: Duration,
    /// Hard budget for a whole execution phase
    pub execution_budget: Duration,
    /// Pause between execution stages (lets clients animate)
    pub stage_pause: Duration,
    /// Buffer before simultaneous deaths are committed
    pub elimination_buffer: Duration,
    /// Delay between scoring and the first teardown attempt
    pub teardown_grace: Duration,
    /// Interval between teardown attempts while sessions remain attached
    pub teardown_poll: Duration,
    /// After this long, remaining sessions are sent back to the lobby
    pub teardown_max_wait: Duration,
    /// Deadline for every profile store call
    pub store_timeout: Duration,

    /// Chance a mission round actually hands out a mission
    pub mission_chance: f64,
    /// Chance a bot re-aims its attack at a different enemy
    pub bot_retarget_chance: f64,
    /// Coins granted to the ranked winner
    pub ranked_win_bonus: i64,
    /// Number of profile documents scanned for the global leaderboard
    pub leaderboard_scan_limit: usize,
}

impl GameTuning {
    pub fn settings_for(&self, mode: GameMode) -> ModeSettings {
        match mode {
            GameMode::Practice => self.practice,
            GameMode::Casual => self.casual,
            GameMode::Ranked => self.ranked,
            GameMode::Custom => self.custom,
        }
    }

    fn from_env() -> Result<Self, ConfigError> {
        let mut tuning = Self::default();

        if let Some(secs) = parse_env::<u64>("TEARDOWN_GRACE_SECS")? {
            tuning.teardown_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64>("WAITING_TIMEOUT_SECS")? {
            tuning.waiting_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_env::<u64>("STORE_TIMEOUT_MS")? {
            tuning.store_timeout = Duration::from_millis(ms);
        }
        if let Some(chance) = parse_env::<f64>("BOT_RETARGET_CHANCE")? {
            if !(0.0..=1.0).contains(&chance) {
                return Err(ConfigError::Invalid("BOT_RETARGET_CHANCE"));
            }
            tuning.bot_retarget_chance = chance;
        }
        if let Some(limit) = parse_env::<usize>("LEADERBOARD_SCAN_LIMIT")? {
            tuning.leaderboard_scan_limit = limit;
        }

        Ok(tuning)
    }
}

impl Default for GameTuning {
    fn default() -> Self {
        Self {
            practice: ModeSettings {
                min_players: 1,
                countdown: Duration::from_secs(15),
                decision_window: Duration::from_secs(5),
                ranked_scoring: false,
            },
            casual: ModeSettings {
                min_players: 2,
                countdown: Duration::from_secs(40),
                decision_window: Duration::from_secs(10),
                ranked_scoring: false,
            },
            ranked: ModeSettings {
                min_players: 3,
                countdown: Duration::from_secs(30),
                decision_window: Duration::from_secs(8),
                ranked_scoring: true,
            },
            custom: ModeSettings {
                min_players: 1,
                countdown: Duration::ZERO,
                decision_window: Duration::from_secs(10),
                ranked_scoring: false,
            },
            waiting_timeout: Duration::from_secs(15),
            watchdog_grace: Duration::from_secs(3),
            execution_budget: Duration::from_secs(8),
            stage_pause: Duration::from_millis(600),
            elimination_buffer: Duration::from_millis(50),
            teardown_grace: Duration::from_secs(5),
            teardown_poll: Duration::from_secs(3),
            teardown_max_wait: Duration::from_secs(60),
            store_timeout: Duration::from_secs(3),
            mission_chance: 0.6,
            bot_retarget_chance: 0.7,
            ranked_win_bonus: 25,
            leaderboard_scan_limit: 100,
        }
    }
}

fn parse_env<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(key)),
        Err(_) => Ok(None),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_settings_follow_the_mode_table() {
        let tuning = GameTuning::default();

        assert_eq!(tuning.settings_for(GameMode::Casual).min_players, 2);
        assert_eq!(
            tuning.settings_for(GameMode::Casual).countdown,
            Duration::from_secs(40)
        );
        assert!(tuning.settings_for(GameMode::Ranked).ranked_scoring);
        assert!(!tuning.settings_for(GameMode::Practice).ranked_scoring);
        assert_eq!(tuning.settings_for(GameMode::Practice).min_players, 1);
    }
}
