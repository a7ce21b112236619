//! Time utilities

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Server start time for uptime tracking
static SERVER_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(Instant::now);
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Whole seconds left until `deadline`, rounded up so a running timer never shows 0
pub fn seconds_until(deadline: tokio::time::Instant, now: tokio::time::Instant) -> u32 {
    let remaining = deadline.saturating_duration_since(now);
    let millis = remaining.as_millis() as u64;
    millis.div_ceil(1000) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_until_rounds_up() {
        let now = tokio::time::Instant::now();

        assert_eq!(seconds_until(now + Duration::from_millis(1500), now), 2);
        assert_eq!(seconds_until(now + Duration::from_secs(3), now), 3);
        assert_eq!(seconds_until(now, now + Duration::from_secs(1)), 0);
    }
}
