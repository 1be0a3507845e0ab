//! Fans analysis events out to interested observers.
//!
//! The relay is the only consumer of the events topic. It multiplexes
//! progress and terminal events to per-correlation observer channels,
//! enforces monotonic progress, and caches terminal results so an observer
//! arriving shortly after completion still gets an answer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use sage_bus::MessageBus;
use sage_cache::TtlCache;
use sage_models::config::{AggregationConfig, CacheConfig};
use sage_models::{AgentMessage, MessageKind};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What observers receive, already shaped for the wire.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayEvent {
    #[serde(rename_all = "camelCase")]
    Progress {
        correlation_id: Uuid,
        source_id: String,
        percent: u8,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Completed {
        correlation_id: Uuid,
        symbol: String,
        result: serde_json::Value,
        duration_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        correlation_id: Uuid,
        error: String,
    },
}

impl RelayEvent {
    fn is_terminal(&self) -> bool {
        !matches!(self, RelayEvent::Progress { .. })
    }
}

/// One observer's attachment to a correlation id; used to detach again.
pub struct SubscriptionHandle {
    pub correlation_id: Uuid,
    token: u64,
}

struct RelayState {
    next_token: u64,
    observers: HashMap<Uuid, HashMap<u64, mpsc::UnboundedSender<RelayEvent>>>,
    /// Highest percent seen per correlation id and source.
    progress: HashMap<Uuid, HashMap<String, u8>>,
    /// Terminal events retained through their grace window.
    finished: HashMap<Uuid, RelayEvent>,
}

pub struct EventRelay {
    state: Mutex<RelayState>,
    bus: Arc<MessageBus>,
    cache: Arc<TtlCache>,
    events_topic: String,
    result_ttl: Duration,
    success_grace: Duration,
    error_grace: Duration,
}

impl EventRelay {
    pub fn new(
        bus: Arc<MessageBus>,
        cache: Arc<TtlCache>,
        events_topic: &str,
        aggregation: &AggregationConfig,
        cache_config: &CacheConfig,
    ) -> Self {
        Self {
            state: Mutex::new(RelayState {
                next_token: 0,
                observers: HashMap::new(),
                progress: HashMap::new(),
                finished: HashMap::new(),
            }),
            bus,
            cache,
            events_topic: events_topic.to_string(),
            result_ttl: Duration::from_secs(cache_config.result_ttl_seconds),
            success_grace: Duration::from_secs(aggregation.success_grace_seconds),
            error_grace: Duration::from_secs(aggregation.error_grace_seconds),
        }
    }

    /// Attach an observer to a correlation id.
    ///
    /// If the request already finished within its grace window, the cached
    /// terminal event is delivered immediately.
    pub fn subscribe(
        &self,
        correlation_id: Uuid,
    ) -> (SubscriptionHandle, mpsc::UnboundedReceiver<RelayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();

        if let Some(terminal) = state.finished.get(&correlation_id) {
            let _ = tx.send(terminal.clone());
        }

        let token = state.next_token;
        state.next_token += 1;
        state
            .observers
            .entry(correlation_id)
            .or_default()
            .insert(token, tx);

        (
            SubscriptionHandle {
                correlation_id,
                token,
            },
            rx,
        )
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut state = self.lock();
        if let Some(observers) = state.observers.get_mut(&handle.correlation_id) {
            observers.remove(&handle.token);
            if observers.is_empty() {
                state.observers.remove(&handle.correlation_id);
                // Progress tracking lives and dies with the observer set.
                state.progress.remove(&handle.correlation_id);
            }
        }
    }

    pub fn observer_count(&self, correlation_id: Uuid) -> usize {
        self.lock()
            .observers
            .get(&correlation_id)
            .map_or(0, |o| o.len())
    }

    /// Consume the events topic until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), sage_bus::BusError> {
        let mut rx = self.bus.subscribe(&self.events_topic)?;
        info!(topic = %self.events_topic, "Relay subscribed");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Relay shutting down");
                    return Ok(());
                }
                received = rx.recv() => {
                    match received {
                        Ok(msg) => self.handle_event(msg).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Relay lagged, events lost");
                        }
                        Err(RecvError::Closed) => {
                            warn!("Events topic closed");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    pub async fn handle_event(self: &Arc<Self>, msg: AgentMessage) {
        match msg.kind {
            MessageKind::Progress => self.handle_progress(msg),
            MessageKind::Success => self.handle_completed(msg).await,
            MessageKind::Error => self.handle_error(msg),
            MessageKind::Request => {
                debug!("Ignoring request message on events topic");
            }
        }
    }

    fn handle_progress(&self, msg: AgentMessage) {
        let percent = msg
            .payload
            .get("percent")
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
            .min(100) as u8;
        let message = msg
            .payload
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let mut state = self.lock();
        if state.finished.contains_key(&msg.correlation_id) {
            debug!(correlation_id = %msg.correlation_id, "Progress after terminal, dropped");
            return;
        }
        // Track nothing for unobserved ids. A request aborted before its
        // terminal (failed fan-out) still has workers emitting progress;
        // recording a high-water mark for it would leak forever.
        if !state.observers.contains_key(&msg.correlation_id) {
            debug!(correlation_id = %msg.correlation_id, "Progress with no observers, dropped");
            return;
        }

        // Percent never goes backwards for a given source; stale
        // out-of-order frames are dropped rather than re-ordered.
        let last = state
            .progress
            .entry(msg.correlation_id)
            .or_default()
            .entry(msg.source_id.clone())
            .or_insert(0);
        if percent < *last {
            debug!(
                correlation_id = %msg.correlation_id,
                source_id = %msg.source_id,
                percent,
                last = *last,
                "Regressive progress dropped"
            );
            return;
        }
        *last = percent;

        let event = RelayEvent::Progress {
            correlation_id: msg.correlation_id,
            source_id: msg.source_id,
            percent,
            message,
        };
        Self::deliver(&mut state, msg.correlation_id, event);
    }

    async fn handle_completed(self: &Arc<Self>, msg: AgentMessage) {
        let symbol = msg
            .payload
            .get("symbol")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let duration_ms = msg
            .payload
            .get("duration_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        if !symbol.is_empty() {
            if let Err(e) = self
                .cache
                .insert(&format!("result:{symbol}"), &msg.payload, self.result_ttl)
                .await
            {
                warn!(symbol, error = %e, "Failed to cache terminal result");
            }
        }

        let event = RelayEvent::Completed {
            correlation_id: msg.correlation_id,
            symbol,
            result: msg.payload,
            duration_ms,
        };
        self.finish(msg.correlation_id, event, self.success_grace);
    }

    fn handle_error(self: &Arc<Self>, msg: AgentMessage) {
        let error = msg
            .payload
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("unspecified failure")
            .to_string();

        let event = RelayEvent::Error {
            correlation_id: msg.correlation_id,
            error,
        };
        self.finish(msg.correlation_id, event, self.error_grace);
    }

    /// Record a terminal event, deliver it, and arm the grace sweep.
    fn finish(self: &Arc<Self>, id: Uuid, event: RelayEvent, grace: Duration) {
        debug_assert!(event.is_terminal());
        {
            let mut state = self.lock();
            state.progress.remove(&id);
            state.finished.insert(id, event.clone());
            Self::deliver(&mut state, id, event);
        }

        let relay = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut state = relay.lock();
            state.finished.remove(&id);
            state.observers.remove(&id);
            debug!(correlation_id = %id, "Relay bookkeeping swept");
        });
    }

    /// Fan an event out to the id's observers, pruning dead channels.
    fn deliver(state: &mut MutexGuard<'_, RelayState>, id: Uuid, event: RelayEvent) {
        let Some(observers) = state.observers.get_mut(&id) else {
            debug!(correlation_id = %id, "Event with no observers, dropped");
            return;
        };
        observers.retain(|_, tx| tx.send(event.clone()).is_ok());
        if observers.is_empty() {
            state.observers.remove(&id);
            state.progress.remove(&id);
        }
    }

    #[cfg(test)]
    fn tracked_progress_ids(&self) -> usize {
        self.lock().progress.len()
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sage_models::config::SageConfig;

    fn test_relay() -> Arc<EventRelay> {
        let config = SageConfig::default();
        let aggregation = AggregationConfig {
            timeout_ms: 5_000,
            success_grace_seconds: 300,
            error_grace_seconds: 60,
        };
        Arc::new(EventRelay::new(
            Arc::new(MessageBus::new(16)),
            Arc::new(TtlCache::new(100)),
            &config.bus.events_topic,
            &aggregation,
            &config.cache,
        ))
    }

    fn terminal_payload(symbol: &str) -> serde_json::Value {
        serde_json::json!({
            "symbol": symbol,
            "composite_score": "0.71",
            "duration_ms": 1234,
        })
    }

    #[tokio::test]
    async fn progress_is_multicast_to_all_observers() {
        let relay = test_relay();
        let id = Uuid::new_v4();
        let (_h1, mut rx1) = relay.subscribe(id);
        let (_h2, mut rx2) = relay.subscribe(id);

        relay
            .handle_event(AgentMessage::progress(id, "technical", 40, "working"))
            .await;

        for rx in [&mut rx1, &mut rx2] {
            let event = rx.recv().await.unwrap();
            assert_eq!(
                event,
                RelayEvent::Progress {
                    correlation_id: id,
                    source_id: "technical".to_string(),
                    percent: 40,
                    message: "working".to_string(),
                }
            );
        }
    }

    #[tokio::test]
    async fn regressive_progress_is_dropped() {
        let relay = test_relay();
        let id = Uuid::new_v4();
        let (_h, mut rx) = relay.subscribe(id);

        relay
            .handle_event(AgentMessage::progress(id, "technical", 60, "later"))
            .await;
        relay
            .handle_event(AgentMessage::progress(id, "technical", 30, "earlier"))
            .await;
        relay
            .handle_event(AgentMessage::progress(id, "technical", 90, "almost"))
            .await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, RelayEvent::Progress { percent: 60, .. }));
        assert!(matches!(second, RelayEvent::Progress { percent: 90, .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn per_source_progress_tracks_independently() {
        let relay = test_relay();
        let id = Uuid::new_v4();
        let (_h, mut rx) = relay.subscribe(id);

        relay
            .handle_event(AgentMessage::progress(id, "technical", 80, "a"))
            .await;
        // Lower percent, but a different source, so it goes through.
        relay
            .handle_event(AgentMessage::progress(id, "sentiment", 20, "b"))
            .await;

        rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, RelayEvent::Progress { percent: 20, .. }));
    }

    #[tokio::test]
    async fn terminal_caches_result_and_serves_late_subscriber() {
        let relay = test_relay();
        let id = Uuid::new_v4();

        let (_h, mut rx) = relay.subscribe(id);
        relay
            .handle_event(AgentMessage::success(id, "aggregator", terminal_payload("AAPL")))
            .await;

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, RelayEvent::Completed { duration_ms: 1234, .. }));

        // The result landed in the cache under the symbol key.
        let cached: Option<serde_json::Value> = relay.cache.get("result:AAPL").await.unwrap();
        assert_eq!(cached.unwrap()["symbol"], "AAPL");

        // An observer arriving after the fact gets the terminal right away.
        let (_h2, mut late) = relay.subscribe(id);
        let replay = late.recv().await.unwrap();
        assert!(matches!(replay, RelayEvent::Completed { .. }));
    }

    #[tokio::test]
    async fn error_terminal_carries_reason() {
        let relay = test_relay();
        let id = Uuid::new_v4();
        let (_h, mut rx) = relay.subscribe(id);

        relay
            .handle_event(AgentMessage::error(id, "aggregator", "zero coverage: no data"))
            .await;

        let event = rx.recv().await.unwrap();
        match event {
            RelayEvent::Error { error, .. } => assert!(error.contains("zero coverage")),
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn progress_after_terminal_is_dropped() {
        let relay = test_relay();
        let id = Uuid::new_v4();
        let (_h, mut rx) = relay.subscribe(id);

        relay
            .handle_event(AgentMessage::success(id, "aggregator", terminal_payload("AAPL")))
            .await;
        relay
            .handle_event(AgentMessage::progress(id, "fundamentals", 90, "straggler"))
            .await;

        rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn finished_entry_swept_after_grace() {
        let relay = test_relay();
        let id = Uuid::new_v4();

        relay
            .handle_event(AgentMessage::error(id, "aggregator", "zero coverage: no data"))
            .await;

        // Let the spawned sweep task register its sleep before advancing.
        tokio::task::yield_now().await;
        // Error grace is 60s; after it, a new subscriber sees nothing.
        tokio::time::advance(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        let (_h, mut rx) = relay.subscribe(id);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn abandoned_request_progress_leaves_no_state() {
        // A request aborted after partial fan-out gets no terminal event,
        // but the workers that did receive it still emit progress.
        let relay = test_relay();
        let id = Uuid::new_v4();

        relay
            .handle_event(AgentMessage::progress(id, "technical", 10, "starting"))
            .await;
        relay
            .handle_event(AgentMessage::progress(id, "technical", 90, "finishing"))
            .await;
        assert_eq!(relay.tracked_progress_ids(), 0);

        // A later observer starts from a clean slate; the unobserved 90
        // left no high-water mark to suppress its stream.
        let (_h, mut rx) = relay.subscribe(id);
        relay
            .handle_event(AgentMessage::progress(id, "technical", 10, "retry"))
            .await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, RelayEvent::Progress { percent: 10, .. }));
    }

    #[tokio::test]
    async fn last_unsubscribe_clears_progress_tracking() {
        let relay = test_relay();
        let id = Uuid::new_v4();
        let (handle, _rx) = relay.subscribe(id);

        relay
            .handle_event(AgentMessage::progress(id, "technical", 50, "halfway"))
            .await;
        assert_eq!(relay.tracked_progress_ids(), 1);

        relay.unsubscribe(&handle);
        assert_eq!(relay.tracked_progress_ids(), 0);
    }

    #[tokio::test]
    async fn dropped_receivers_clear_progress_tracking() {
        let relay = test_relay();
        let id = Uuid::new_v4();
        let (_handle, rx) = relay.subscribe(id);

        relay
            .handle_event(AgentMessage::progress(id, "technical", 30, "going"))
            .await;
        assert_eq!(relay.tracked_progress_ids(), 1);

        // Socket gone without an unsubscribe: the next frame prunes the
        // dead channel and the bookkeeping with it.
        drop(rx);
        relay
            .handle_event(AgentMessage::progress(id, "technical", 60, "going"))
            .await;
        assert_eq!(relay.tracked_progress_ids(), 0);
        assert_eq!(relay.observer_count(id), 0);
    }

    #[tokio::test]
    async fn unsubscribe_detaches_one_observer() {
        let relay = test_relay();
        let id = Uuid::new_v4();
        let (h1, mut rx1) = relay.subscribe(id);
        let (_h2, mut rx2) = relay.subscribe(id);
        assert_eq!(relay.observer_count(id), 2);

        relay.unsubscribe(&h1);
        assert_eq!(relay.observer_count(id), 1);

        relay
            .handle_event(AgentMessage::progress(id, "technical", 10, "go"))
            .await;
        assert!(rx1.try_recv().is_err());
        assert!(rx2.recv().await.is_some());
    }
}
