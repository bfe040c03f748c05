use chrono::Utc;
use dashmap::DashMap;

use crate::models::user::UserId;

/// Fixed-window request counter keyed by (action, user). Windows live in
/// process; counters reset when the wall clock crosses a window boundary.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: DashMap<(&'static str, UserId), (i64, u32)>,
}

impl RateLimiter {
    pub fn new() -> RateLimiter {
        RateLimiter::default()
    }

    /// Counts one hit and reports whether the caller is still within
    /// `limit` hits per `window_secs`. A zero limit or window disables
    /// the check.
    pub fn allow(&self, action: &'static str, user: UserId, limit: u32, window_secs: u64) -> bool {
        if limit == 0 || window_secs == 0 {
            return true;
        }

        let now = Utc::now().timestamp();
        let window = now - now.rem_euclid(window_secs as i64);

        let mut entry = self.windows.entry((action, user)).or_insert((window, 0));
        let (start, count) = *entry;
        if start != window {
            *entry = (window, 1);
            return true;
        }
        *entry = (start, count + 1);

        if count + 1 > limit {
            tracing::warn!(action, user, limit, "rate limit exceeded");
            false
        } else {
            true
        }
    }
}
