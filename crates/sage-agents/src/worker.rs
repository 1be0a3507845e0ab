use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sage_bus::{BusError, MessageBus};
use sage_cache::{RateLimiter, TtlCache};
use sage_models::config::{BusConfig, RateLimitConfig};
use sage_models::{AgentMessage, MessageKind};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::AgentError;

/// One validated fan-out request, as seen by a worker handler.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub correlation_id: Uuid,
    pub symbol: String,
}

/// Shared services every worker handler gets: progress emission, the
/// rate-limit gate, and the read-through cache.
pub struct WorkerContext {
    bus: Arc<MessageBus>,
    cache: Arc<TtlCache>,
    limiter: Arc<RateLimiter>,
    bus_config: BusConfig,
    rate_limits: Vec<RateLimitConfig>,
}

impl WorkerContext {
    pub fn new(
        bus: Arc<MessageBus>,
        cache: Arc<TtlCache>,
        limiter: Arc<RateLimiter>,
        bus_config: BusConfig,
        rate_limits: Vec<RateLimitConfig>,
    ) -> Self {
        Self {
            bus,
            cache,
            limiter,
            bus_config,
            rate_limits,
        }
    }

    /// Publish a progress event. Best effort: a missing relay is not a
    /// worker failure.
    pub fn emit_progress(&self, correlation_id: Uuid, source_id: &str, percent: u8, message: &str) {
        let msg = AgentMessage::progress(correlation_id, source_id, percent, message);
        if let Err(e) = self.bus.publish(&self.bus_config.events_topic, msg) {
            debug!(correlation_id = %correlation_id, error = %e, "Progress event not delivered");
        }
    }

    /// Consume one slot of the provider's configured window.
    ///
    /// `false` means the provider is exhausted for this window and must be
    /// skipped; an unconfigured provider is unlimited.
    pub fn check_rate_limit(&self, provider: &str) -> bool {
        match self.rate_limits.iter().find(|r| r.provider == provider) {
            Some(config) => self.limiter.check(
                provider,
                config.limit,
                Duration::from_millis(config.window_ms),
            ),
            None => {
                debug!(provider, "No rate limit configured");
                true
            }
        }
    }

    pub async fn get_cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.cache.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    pub async fn set_cached<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        if let Err(e) = self.cache.insert(key, value, ttl).await {
            warn!(key, error = %e, "Cache write failed");
        }
    }
}

/// Capability interface implemented by every concrete worker.
///
/// The shared loop in [`run_worker`] handles subscription, validation and
/// result publication; implementations only compute their facet payload.
#[async_trait]
pub trait WorkerAgent: Send + Sync {
    fn name(&self) -> &str;
    fn source_id(&self) -> &str;

    async fn analyze(
        &self,
        request: &WorkerRequest,
        ctx: &WorkerContext,
    ) -> Result<serde_json::Value, AgentError>;
}

/// The shared worker loop: subscribe -> validate -> handle -> publish.
///
/// Publishes exactly one `Success` or `Error` per accepted request, carrying
/// the request's correlation id. Handler errors are converted to `Error`
/// messages; nothing in here is allowed to take the process down.
pub async fn run_worker(
    agent: Arc<dyn WorkerAgent>,
    ctx: Arc<WorkerContext>,
    cancel: CancellationToken,
) -> Result<(), AgentError> {
    let topic = ctx.bus_config.request_topic(agent.source_id());
    let mut rx = ctx.bus.subscribe(&topic)?;
    info!(worker = agent.name(), topic, "Worker subscribed");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(worker = agent.name(), "Worker shutting down");
                return Ok(());
            }
            received = rx.recv() => {
                match received {
                    Ok(msg) => handle_message(agent.as_ref(), &ctx, msg).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(worker = agent.name(), skipped, "Worker lagged, requests lost");
                    }
                    Err(RecvError::Closed) => {
                        warn!(worker = agent.name(), "Request topic closed");
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn handle_message(agent: &dyn WorkerAgent, ctx: &WorkerContext, msg: AgentMessage) {
    if msg.kind != MessageKind::Request {
        debug!(worker = agent.name(), kind = ?msg.kind, "Ignoring non-request message");
        return;
    }
    if let Err(field) = msg.validate() {
        warn!(worker = agent.name(), field, "Discarding invalid request");
        return;
    }
    let Some(symbol) = msg.symbol() else {
        return;
    };

    let request = WorkerRequest {
        correlation_id: msg.correlation_id,
        symbol: symbol.to_string(),
    };

    let result = agent.analyze(&request, ctx).await;
    let out = match result {
        Ok(payload) => {
            AgentMessage::success(request.correlation_id, agent.source_id(), payload)
        }
        Err(e) => {
            warn!(
                worker = agent.name(),
                correlation_id = %request.correlation_id,
                error = %e,
                "Worker handler failed"
            );
            AgentMessage::error(request.correlation_id, agent.source_id(), &e.to_string())
        }
    };

    match ctx.bus.publish(&ctx.bus_config.results_topic, out) {
        Ok(_) => {}
        Err(BusError::NoSubscribers(topic)) => {
            error!(
                worker = agent.name(),
                correlation_id = %request.correlation_id,
                topic,
                "Result published into the void, no aggregator listening"
            );
        }
        Err(e) => {
            error!(
                worker = agent.name(),
                correlation_id = %request.correlation_id,
                error = %e,
                "Failed to publish result"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FailingWorker, ScriptedWorker};
    use sage_models::config::SageConfig;

    fn test_ctx(bus: Arc<MessageBus>) -> Arc<WorkerContext> {
        let config = SageConfig::default();
        Arc::new(WorkerContext::new(
            bus,
            Arc::new(TtlCache::new(100)),
            Arc::new(RateLimiter::new()),
            config.bus,
            config.rate_limits,
        ))
    }

    #[tokio::test]
    async fn worker_publishes_success_with_same_correlation_id() {
        let bus = Arc::new(MessageBus::new(16));
        let ctx = test_ctx(bus.clone());
        let mut results = bus.subscribe("analysis.results").unwrap();

        let cancel = CancellationToken::new();
        let worker: Arc<dyn WorkerAgent> =
            Arc::new(ScriptedWorker::new("technical", serde_json::json!({"score": "0.7"})));
        let handle = tokio::spawn(run_worker(worker, ctx, cancel.clone()));
        tokio::task::yield_now().await;

        let id = Uuid::new_v4();
        bus.publish(
            "analysis.req.technical",
            AgentMessage::request(id, "gateway", "AAPL"),
        )
        .unwrap();

        let out = results.recv().await.unwrap();
        assert_eq!(out.correlation_id, id);
        assert_eq!(out.source_id, "technical");
        assert_eq!(out.kind, MessageKind::Success);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handler_error_becomes_error_message() {
        let bus = Arc::new(MessageBus::new(16));
        let ctx = test_ctx(bus.clone());
        let mut results = bus.subscribe("analysis.results").unwrap();

        let cancel = CancellationToken::new();
        let worker: Arc<dyn WorkerAgent> = Arc::new(FailingWorker::new("sentiment"));
        tokio::spawn(run_worker(worker, ctx, cancel.clone()));
        tokio::task::yield_now().await;

        let id = Uuid::new_v4();
        bus.publish(
            "analysis.req.sentiment",
            AgentMessage::request(id, "gateway", "AAPL"),
        )
        .unwrap();

        let out = results.recv().await.unwrap();
        assert_eq!(out.kind, MessageKind::Error);
        assert_eq!(out.correlation_id, id);
        assert!(out.payload["error"].as_str().unwrap().contains("injected failure"));

        cancel.cancel();
    }

    #[tokio::test]
    async fn invalid_request_is_discarded() {
        let bus = Arc::new(MessageBus::new(16));
        let ctx = test_ctx(bus.clone());
        let mut results = bus.subscribe("analysis.results").unwrap();

        let cancel = CancellationToken::new();
        let worker: Arc<dyn WorkerAgent> =
            Arc::new(ScriptedWorker::new("technical", serde_json::json!({})));
        tokio::spawn(run_worker(worker, ctx, cancel.clone()));
        tokio::task::yield_now().await;

        // Request without a symbol fails validation.
        let mut bad = AgentMessage::request(Uuid::new_v4(), "gateway", "AAPL");
        bad.payload = serde_json::json!({});
        bus.publish("analysis.req.technical", bad).unwrap();

        // A valid request after it still gets handled.
        let id = Uuid::new_v4();
        bus.publish(
            "analysis.req.technical",
            AgentMessage::request(id, "gateway", "AAPL"),
        )
        .unwrap();

        let out = results.recv().await.unwrap();
        assert_eq!(out.correlation_id, id);

        cancel.cancel();
    }

    #[tokio::test]
    async fn non_request_kinds_are_ignored() {
        let bus = Arc::new(MessageBus::new(16));
        let ctx = test_ctx(bus.clone());
        let mut results = bus.subscribe("analysis.results").unwrap();

        let cancel = CancellationToken::new();
        let worker: Arc<dyn WorkerAgent> =
            Arc::new(ScriptedWorker::new("technical", serde_json::json!({})));
        tokio::spawn(run_worker(worker, ctx, cancel.clone()));
        tokio::task::yield_now().await;

        bus.publish(
            "analysis.req.technical",
            AgentMessage::progress(Uuid::new_v4(), "elsewhere", 50, "noise"),
        )
        .unwrap();

        let id = Uuid::new_v4();
        bus.publish(
            "analysis.req.technical",
            AgentMessage::request(id, "gateway", "AAPL"),
        )
        .unwrap();

        let out = results.recv().await.unwrap();
        assert_eq!(out.correlation_id, id);

        cancel.cancel();
    }

    #[tokio::test]
    async fn unconfigured_provider_is_unlimited() {
        let bus = Arc::new(MessageBus::new(16));
        let ctx = test_ctx(bus);
        for _ in 0..100 {
            assert!(ctx.check_rate_limit("unheard-of"));
        }
    }
}
