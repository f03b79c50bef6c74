//! Sliding-window rate limiting for destructive actions.
//!
//! Attempts are recorded as store rows and counted over the trailing
//! window. When the ceiling is hit the caller waits with randomized
//! exponential backoff, each delay capped at the window length, for a
//! bounded number of attempts before the action is refused.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tracing::{debug, warn};

use gantry_store::StateStore;

use crate::error::{WorkerError, WorkerResult};

/// Store-backed sliding-window limiter for one action.
pub struct RateLimiter {
    store: StateStore,
    action: String,
    /// Max attempts inside one window.
    ceiling: u32,
    window: Duration,
    /// Backoff rounds before giving up.
    backoff_attempts: u32,
}

impl RateLimiter {
    pub fn new(
        store: StateStore,
        action: impl Into<String>,
        ceiling: u32,
        window: Duration,
        backoff_attempts: u32,
    ) -> Self {
        Self {
            store,
            action: action.into(),
            ceiling,
            window,
            backoff_attempts,
        }
    }

    /// Take one slot, waiting out the window with jittered backoff if the
    /// ceiling is currently hit.
    pub async fn acquire(&self) -> WorkerResult<()> {
        let window_ms = self.window.as_millis() as u64;
        for attempt in 0..=self.backoff_attempts {
            let now = epoch_millis();
            let since = now.saturating_sub(window_ms);
            let in_window = self.store.count_rate_events(&self.action, since)?;
            if in_window < self.ceiling {
                self.store.record_rate_event(&self.action, now)?;
                // Entries that have slid out of every window are dead weight.
                self.store.prune_rate_events(since)?;
                return Ok(());
            }
            if attempt == self.backoff_attempts {
                break;
            }
            let delay = self.backoff_delay(attempt);
            debug!(
                action = %self.action,
                in_window,
                delay_ms = delay.as_millis() as u64,
                "rate ceiling hit, backing off"
            );
            tokio::time::sleep(delay).await;
        }

        warn!(action = %self.action, "rate limit exhausted");
        Err(WorkerError::RateLimited(self.action.clone()))
    }

    /// Exponential delay with uniform jitter in [half, full], capped at the
    /// window length.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let window_ms = self.window.as_millis().max(1) as u64;
        let base_ms = (window_ms / 8).max(1);
        let exp_ms = base_ms.saturating_mul(1 << attempt.min(16)).min(window_ms);
        let jittered = rand::thread_rng().gen_range(exp_ms / 2 + 1..=exp_ms.max(1));
        Duration::from_millis(jittered)
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(ceiling: u32, window: Duration, backoff: u32) -> (RateLimiter, StateStore) {
        let store = StateStore::open_in_memory().unwrap();
        let limiter = RateLimiter::new(store.clone(), "delete_device", ceiling, window, backoff);
        (limiter, store)
    }

    #[tokio::test]
    async fn under_ceiling_acquires_immediately() {
        let (limiter, store) = limiter(2, Duration::from_secs(60), 0);

        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();
        assert_eq!(store.count_rate_events("delete_device", 0).unwrap(), 2);
    }

    #[tokio::test]
    async fn over_ceiling_with_no_backoff_is_refused() {
        let (limiter, _store) = limiter(1, Duration::from_secs(60), 0);

        limiter.acquire().await.unwrap();
        let err = limiter.acquire().await.unwrap_err();
        assert!(matches!(err, WorkerError::RateLimited(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_delays_are_bounded_by_the_window() {
        let (limiter, _store) = limiter(1, Duration::from_secs(10), 3);
        limiter.acquire().await.unwrap();

        // Paused clock: sleeps auto-advance, so this terminates quickly in
        // real time while virtual time stays within attempts * window.
        let start = tokio::time::Instant::now();
        let err = limiter.acquire().await.unwrap_err();
        assert!(matches!(err, WorkerError::RateLimited(_)));
        assert!(start.elapsed() <= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn events_outside_the_window_do_not_count() {
        let (limiter, store) = limiter(1, Duration::from_secs(10), 0);
        // An attempt recorded long before the window opened.
        store.record_rate_event("delete_device", 1_000).unwrap();

        limiter.acquire().await.unwrap();
    }

    #[test]
    fn delay_never_exceeds_window() {
        let store = StateStore::open_in_memory().unwrap();
        let limiter =
            RateLimiter::new(store, "delete_device", 1, Duration::from_secs(10), 8);
        for attempt in 0..8 {
            assert!(limiter.backoff_delay(attempt) <= Duration::from_secs(10));
        }
    }
}
