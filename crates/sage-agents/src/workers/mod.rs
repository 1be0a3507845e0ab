//! Concrete worker agents, one per analysis facet.
//!
//! Each worker reads whatever facet data the cache holds, applies its
//! heuristic interpretation, and returns a [`SourceReport`] payload. The
//! scoring rules are deliberately simple; the orchestration contract
//! (exactly one terminal message, progress events, provider rate limiting)
//! is what matters here.

pub mod fundamentals;
pub mod sentiment;
pub mod technical;

pub use fundamentals::FundamentalsWorker;
pub use sentiment::SentimentWorker;
pub use technical::TechnicalWorker;

use std::time::Duration;

use rust_decimal::Decimal;

use crate::worker::WorkerContext;

/// How long a computed facet report stays servable from cache.
const FACET_TTL: Duration = Duration::from_secs(60);

fn facet_cache_key(source_id: &str, symbol: &str) -> String {
    format!("facet:{source_id}:{symbol}")
}

/// Read `{"value": <f64>}` from a cached entry.
async fn cached_value(ctx: &WorkerContext, key: &str) -> Option<f64> {
    ctx.get_cached::<serde_json::Value>(key)
        .await
        .and_then(|v| v.get("value").and_then(|f| f.as_f64()))
}

/// Read `{"score": <f64>}` from a cached entry.
async fn cached_score(ctx: &WorkerContext, key: &str) -> Option<f64> {
    ctx.get_cached::<serde_json::Value>(key)
        .await
        .and_then(|v| v.get("score").and_then(|f| f.as_f64()))
}

fn to_score(value: f64) -> Decimal {
    Decimal::from_f64_retain(value.clamp(0.0, 1.0))
        .unwrap_or(Decimal::new(50, 2))
        .round_dp(2)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use sage_bus::MessageBus;
    use sage_cache::{RateLimiter, TtlCache};
    use sage_models::config::SageConfig;

    use crate::worker::WorkerContext;

    /// A context with a seeded cache and an events subscriber kept alive so
    /// progress publishes do not fail.
    pub(crate) async fn seeded_ctx(
        entries: &[(&str, serde_json::Value)],
    ) -> (Arc<WorkerContext>, Arc<MessageBus>) {
        let bus = Arc::new(MessageBus::new(16));
        let cache = Arc::new(TtlCache::new(100));
        for (key, value) in entries {
            cache
                .insert(key, value, Duration::from_secs(300))
                .await
                .unwrap();
        }

        let config = SageConfig::default();
        let ctx = Arc::new(WorkerContext::new(
            bus.clone(),
            cache,
            Arc::new(RateLimiter::new()),
            config.bus,
            config.rate_limits,
        ));
        (ctx, bus)
    }
}
