use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

/// One provider's fixed request-count window.
#[derive(Debug, Clone, Copy)]
struct RateWindow {
    window_start: Instant,
    count: u32,
}

/// Fixed-window rate counter, keyed by provider id.
///
/// `check` is increment-or-reject: the caller that gets `false` must skip
/// that provider for the rest of the window, not fail the whole request.
#[derive(Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one slot in the provider's window if available.
    ///
    /// The window resets once `window` has elapsed since it was started.
    pub fn check(&self, provider: &str, limit: u32, window: Duration) -> bool {
        let now = Instant::now();
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            // A poisoned counter fails closed: callers skip the provider.
            Err(_) => return false,
        };

        let entry = windows.entry(provider.to_string()).or_insert(RateWindow {
            window_start: now,
            count: 0,
        });

        if now.duration_since(entry.window_start) > window {
            entry.window_start = now;
            entry.count = 0;
        }

        if entry.count >= limit {
            debug!(provider, limit, "Rate limit exhausted");
            return false;
        }

        entry.count += 1;
        true
    }
}
