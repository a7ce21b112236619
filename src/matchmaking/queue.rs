//! Per-mode matchmaking queue with its countdown

use std::collections::VecDeque;

use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{ModeSettings, MATCH_CAPACITY};
use crate::util::time::seconds_until;

/// Player waiting in a mode queue
#[derive(Debug, Clone)]
pub struct QueuedPlayer {
    pub user_id: Uuid,
    pub display_name: String,
    pub queued_at: Instant,
}

impl QueuedPlayer {
    pub fn new(user_id: Uuid, display_name: String, now: Instant) -> Self {
        Self {
            user_id,
            display_name,
            queued_at: now,
        }
    }
}

/// FIFO queue for one mode. Time is always passed in so the countdown can be
/// driven deterministically.
#[derive(Debug)]
pub struct ModeQueue {
    settings: ModeSettings,
    queue: VecDeque<QueuedPlayer>,
    countdown: Option<Instant>,
}

impl ModeQueue {
    pub fn new(settings: ModeSettings) -> Self {
        Self {
            settings,
            queue: VecDeque::new(),
            countdown: None,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn contains(&self, user_id: Uuid) -> bool {
        self.queue.iter().any(|p| p.user_id == user_id)
    }

    pub fn user_ids(&self) -> Vec<Uuid> {
        self.queue.iter().map(|p| p.user_id).collect()
    }

    pub fn countdown_running(&self) -> bool {
        self.countdown.is_some()
    }

    /// Whole seconds left on the countdown, if one runs
    pub fn seconds_remaining(&self, now: Instant) -> Option<u32> {
        self.countdown.map(|deadline| seconds_until(deadline, now))
    }

    /// Append a player. Reaching capacity forms a match immediately and
    /// returns it.
    pub fn enqueue(&mut self, player: QueuedPlayer, now: Instant) -> Option<Vec<QueuedPlayer>> {
        if self.contains(player.user_id) {
            return None;
        }
        self.queue.push_back(player);
        self.form_if_full(now)
    }

    /// Remove a player, cancelling the countdown if the queue falls below
    /// the minimum
    pub fn dequeue(&mut self, user_id: Uuid) -> Option<QueuedPlayer> {
        let pos = self.queue.iter().position(|p| p.user_id == user_id)?;
        let removed = self.queue.remove(pos);
        if self.queue.len() < self.settings.min_players {
            self.countdown = None;
        }
        removed
    }

    /// Drop every player for whom `keep` returns false
    pub fn retain(&mut self, mut keep: impl FnMut(&QueuedPlayer) -> bool) -> Vec<QueuedPlayer> {
        let mut removed = Vec::new();
        self.queue.retain(|p| {
            if keep(p) {
                true
            } else {
                removed.push(p.clone());
                false
            }
        });
        if self.queue.len() < self.settings.min_players {
            self.countdown = None;
        }
        removed
    }

    /// Put players back at the front, keeping their relative order. Like
    /// `enqueue`, a queue that is now at capacity forms a match at once.
    pub fn requeue_front(
        &mut self,
        players: Vec<QueuedPlayer>,
        now: Instant,
    ) -> Option<Vec<QueuedPlayer>> {
        for player in players.into_iter().rev() {
            if !self.contains(player.user_id) {
                self.queue.push_front(player);
            }
        }
        self.form_if_full(now)
    }

    /// Advance the countdown. On expiry with enough players, form a match
    /// from the front of the queue and start a fresh countdown if enough
    /// remain.
    pub fn tick(&mut self, now: Instant) -> Option<Vec<QueuedPlayer>> {
        let deadline = self.countdown?;
        if now < deadline {
            return None;
        }
        self.countdown = None;
        if self.queue.len() < self.settings.min_players {
            return None;
        }
        let formed = self.take(MATCH_CAPACITY);
        self.rearm(now);
        Some(formed)
    }

    fn form_if_full(&mut self, now: Instant) -> Option<Vec<QueuedPlayer>> {
        if self.queue.len() < MATCH_CAPACITY {
            self.rearm(now);
            return None;
        }
        self.countdown = None;
        let formed = self.take(MATCH_CAPACITY);
        self.rearm(now);
        Some(formed)
    }

    fn take(&mut self, count: usize) -> Vec<QueuedPlayer> {
        let count = count.min(self.queue.len());
        self.queue.drain(..count).collect()
    }

    fn rearm(&mut self, now: Instant) {
        if self.countdown.is_none() && self.queue.len() >= self.settings.min_players {
            self.countdown = Some(now + self.settings.countdown);
        }
    }
}
