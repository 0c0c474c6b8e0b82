//! Process-wide flags and counters shared between the queue and its callers.

use crate::config::Settings;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Anti-spam bookkeeping for unprivileged requesters.
///
/// Plays are counted per window; hitting the limit starts a cooldown.
#[derive(Debug)]
pub struct RateLimiter {
    origin: Instant,
    enabled: bool,
    max_plays: u32,
    window_ms: u64,
    cooldown_ms: u64,
    played: AtomicU32,
    window_started_ms: AtomicU64,
    blocked_until_ms: AtomicU64,
}

impl RateLimiter {
    pub fn new(enabled: bool, max_plays: u32, window: Duration, cooldown: Duration) -> Self {
        Self {
            origin: Instant::now(),
            enabled,
            max_plays: max_plays.max(1),
            window_ms: window.as_millis() as u64,
            cooldown_ms: cooldown.as_millis() as u64,
            played: AtomicU32::new(0),
            window_started_ms: AtomicU64::new(0),
            blocked_until_ms: AtomicU64::new(0),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.enable_anti_spam,
            settings.max_spam_per_interval,
            Duration::from_secs_f64(settings.spam_check_interval_secs.max(0.0)),
            Duration::from_secs_f64(settings.anti_spam_cooldown_secs.max(0.0)),
        )
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Counts one play. Returns `true` when this play started a cooldown.
    pub fn record_play(&self) -> bool {
        self.record_play_at(self.now_ms())
    }

    pub fn is_blocked(&self) -> bool {
        self.is_blocked_at(self.now_ms())
    }

    pub fn record_play_at(&self, now_ms: u64) -> bool {
        if !self.enabled {
            return false;
        }

        let started = self.window_started_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(started) >= self.window_ms
            && self
                .window_started_ms
                .compare_exchange(started, now_ms, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.played.store(0, Ordering::Release);
        }

        let count = self.played.fetch_add(1, Ordering::AcqRel) + 1;
        if count < self.max_plays {
            return false;
        }

        self.blocked_until_ms
            .fetch_max(now_ms.saturating_add(self.cooldown_ms), Ordering::AcqRel);
        self.played.store(0, Ordering::Release);
        self.window_started_ms.store(now_ms, Ordering::Release);
        tracing::info!(
            plays = count,
            cooldown_secs = self.cooldown_ms as f64 / 1000.0,
            "anti-spam cooldown started"
        );
        true
    }

    pub fn is_blocked_at(&self, now_ms: u64) -> bool {
        self.enabled && now_ms < self.blocked_until_ms.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct SharedState {
    playback_enabled: AtomicBool,
    worker_active: AtomicBool,
    pub rate_limiter: RateLimiter,
}

impl SharedState {
    pub fn new(settings: &Settings) -> Self {
        Self {
            playback_enabled: AtomicBool::new(true),
            worker_active: AtomicBool::new(false),
            rate_limiter: RateLimiter::from_settings(settings),
        }
    }

    pub fn playback_enabled(&self) -> bool {
        self.playback_enabled.load(Ordering::Acquire)
    }

    pub fn set_playback_enabled(&self, enabled: bool) {
        self.playback_enabled.store(enabled, Ordering::Release);
    }

    /// Claims the single worker slot. Only one caller wins until it is released.
    pub fn try_claim_worker(&self) -> bool {
        self.worker_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release_worker(&self) {
        self.worker_active.store(false, Ordering::Release);
    }

    pub fn is_worker_active(&self) -> bool {
        self.worker_active.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(max: u32) -> RateLimiter {
        RateLimiter::new(true, max, Duration::from_secs(20), Duration::from_secs(60))
    }

    #[test]
    fn limit_within_window_starts_cooldown() {
        let rl = limiter(3);
        assert!(!rl.record_play_at(1_000));
        assert!(!rl.record_play_at(2_000));
        assert!(!rl.is_blocked_at(2_000));
        assert!(rl.record_play_at(3_000));
        assert!(rl.is_blocked_at(3_000));
        assert!(rl.is_blocked_at(62_999));
        assert!(!rl.is_blocked_at(63_000));
    }

    #[test]
    fn window_rollover_resets_the_count() {
        let rl = limiter(3);
        assert!(!rl.record_play_at(1_000));
        assert!(!rl.record_play_at(2_000));
        // Next window: the two earlier plays no longer count.
        assert!(!rl.record_play_at(25_000));
        assert!(!rl.record_play_at(26_000));
        assert!(!rl.is_blocked_at(26_000));
    }

    #[test]
    fn disabled_limiter_never_blocks() {
        let rl = RateLimiter::new(false, 1, Duration::from_secs(20), Duration::from_secs(60));
        for t in 0..10 {
            assert!(!rl.record_play_at(t));
        }
        assert!(!rl.is_blocked_at(5));
    }

    #[test]
    fn exactly_one_worker_claim_succeeds() {
        let state = Arc::new(SharedState::new(&Settings::default()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = state.clone();
                std::thread::spawn(move || state.try_claim_worker())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert!(state.is_worker_active());
        state.release_worker();
        assert!(state.try_claim_worker());
    }

    #[test]
    fn playback_toggle_round_trips() {
        let state = SharedState::new(&Settings::default());
        assert!(state.playback_enabled());
        state.set_playback_enabled(false);
        assert!(!state.playback_enabled());
    }
}
