//! SAGE - Symbol Analysis Gateway Engine
//!
//! Multi-agent stock analysis over an in-process message bus: an HTTP
//! gateway fans each request out to worker agents, an aggregator collects
//! their reports under a deadline, and a relay streams progress and the
//! consolidated result to WebSocket observers.
//!
//! # Library Usage
//!
//! ```rust,no_run
//! use sage::{bootstrap, build_router};
//! use sage_models::config::SageConfig;
//!
//! let app = bootstrap(&SageConfig::default());
//! let router = build_router(app.state.clone());
//! ```

pub mod gateway;
pub mod relay;
pub mod ws;

pub use sage_agents as agents;
pub use sage_bus as bus;
pub use sage_cache as cache;
pub use sage_models as models;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use sage_agents::{AgentError, AgentRegistry, Aggregator, CompositeConsolidator, RequestStore, WorkerContext};
use sage_bus::MessageBus;
use sage_cache::{RateLimiter, TtlCache};
use sage_models::config::{BusConfig, SageConfig};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::relay::EventRelay;

/// Shared handles behind every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<MessageBus>,
    pub cache: Arc<TtlCache>,
    pub aggregator: Aggregator,
    pub relay: Arc<EventRelay>,
    /// Source ids the gateway fans out to (the enabled roster).
    pub fan_out: Vec<String>,
    pub bus_config: BusConfig,
}

/// A bootstrapped instance: router state plus the background task set.
pub struct App {
    pub state: AppState,
    pub tasks: JoinSet<Result<(), AgentError>>,
    pub cancel: CancellationToken,
}

/// Build the shared state without spawning anything.
pub fn build_state(config: &SageConfig) -> AppState {
    let bus = Arc::new(MessageBus::new(config.bus.channel_capacity));
    let cache = Arc::new(TtlCache::new(config.cache.max_capacity));

    let aggregator = Aggregator::new(
        bus.clone(),
        Arc::new(RequestStore::new()),
        Arc::new(CompositeConsolidator::new()),
        config.bus.clone(),
        config.expected_sources(),
        &config.aggregation,
    );

    let relay = Arc::new(EventRelay::new(
        bus.clone(),
        cache.clone(),
        &config.bus.events_topic,
        &config.aggregation,
        &config.cache,
    ));

    AppState {
        bus,
        cache,
        aggregator,
        relay,
        fan_out: config.expected_sources(),
        bus_config: config.bus.clone(),
    }
}

/// Wire the whole pipeline: workers, aggregator and relay loops, all racing
/// one root cancellation token.
pub fn bootstrap(config: &SageConfig) -> App {
    let state = build_state(config);
    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    // The relay and aggregator must subscribe before the first request can
    // be accepted; subscription happens synchronously inside `run` before
    // the first await, and spawning is immediate, so ordering holds once
    // the server starts polling.
    let relay = Arc::clone(&state.relay);
    let relay_cancel = cancel.clone();
    tasks.spawn(async move { relay.run(relay_cancel).await.map_err(AgentError::from) });

    let aggregator = state.aggregator.clone();
    let aggregator_cancel = cancel.clone();
    tasks.spawn(async move { aggregator.run(aggregator_cancel).await });

    let ctx = Arc::new(WorkerContext::new(
        state.bus.clone(),
        state.cache.clone(),
        Arc::new(RateLimiter::new()),
        config.bus.clone(),
        config.rate_limits.clone(),
    ));
    let registry = AgentRegistry::from_config(config);
    registry.spawn_all(ctx, &mut tasks, &cancel);

    App {
        state,
        tasks,
        cancel,
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/analyze/:symbol", post(gateway::analyze))
        .route("/status/:correlation_id", get(gateway::status))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
