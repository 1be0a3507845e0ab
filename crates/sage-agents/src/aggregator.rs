use std::sync::Arc;
use std::time::Duration;

use sage_bus::MessageBus;
use sage_models::config::{AggregationConfig, BusConfig};
use sage_models::{AgentMessage, MessageKind};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::consolidate::{ConsolidationInput, Consolidator};
use crate::error::AgentError;
use crate::store::{MergeOutcome, RequestState, RequestStore, SourceOutcome};

pub const AGGREGATOR_SOURCE_ID: &str = "aggregator";

/// Fan-in combinator: accumulates worker outputs per correlation id and
/// emits exactly one terminal event per request, on threshold or deadline.
#[derive(Clone)]
pub struct Aggregator {
    bus: Arc<MessageBus>,
    store: Arc<RequestStore>,
    consolidator: Arc<dyn Consolidator>,
    bus_config: BusConfig,
    expected_sources: Vec<String>,
    timeout: Duration,
    success_grace: Duration,
}

impl Aggregator {
    pub fn new(
        bus: Arc<MessageBus>,
        store: Arc<RequestStore>,
        consolidator: Arc<dyn Consolidator>,
        bus_config: BusConfig,
        expected_sources: Vec<String>,
        aggregation: &AggregationConfig,
    ) -> Self {
        Self {
            bus,
            store,
            consolidator,
            bus_config,
            expected_sources,
            timeout: Duration::from_millis(aggregation.timeout_ms),
            success_grace: Duration::from_secs(aggregation.success_grace_seconds),
        }
    }

    pub fn store(&self) -> &Arc<RequestStore> {
        &self.store
    }

    /// Register a new request and arm its one-shot deadline timer.
    ///
    /// The timer races against the request's cancellation token, which
    /// `begin_completion` cancels on early completion, so a finished request
    /// keeps no live timer referencing it.
    pub fn register(&self, symbol: &str) -> Uuid {
        let (id, cancel) = self
            .store
            .insert(symbol, self.expected_sources.clone());
        info!(correlation_id = %id, symbol, "Request registered");

        let aggregator = self.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(correlation_id = %id, "Deadline timer cancelled");
                }
                _ = tokio::time::sleep(timeout) => {
                    aggregator.attempt_complete(id, "timeout");
                }
            }
        });

        id
    }

    /// Tear down a request that never got dispatched (publish failure).
    pub fn abort(&self, id: Uuid) {
        // Claiming completion cancels the timer; then drop the bookkeeping.
        let _ = self.store.begin_completion(id);
        self.store.remove(id);
        debug!(correlation_id = %id, "Request aborted before dispatch");
    }

    /// Consume worker terminal messages until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), AgentError> {
        let mut rx = self.bus.subscribe(&self.bus_config.results_topic)?;
        info!(topic = %self.bus_config.results_topic, "Aggregator subscribed");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Aggregator shutting down");
                    return Ok(());
                }
                received = rx.recv() => {
                    match received {
                        Ok(msg) => self.handle_result(msg),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Aggregator lagged, worker results lost");
                        }
                        Err(RecvError::Closed) => {
                            warn!("Results topic closed");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn handle_result(&self, msg: AgentMessage) {
        let outcome = match msg.kind {
            MessageKind::Success => SourceOutcome::Success(msg.payload),
            MessageKind::Error => {
                let cause = msg
                    .payload
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unspecified worker failure");
                SourceOutcome::Failed(cause.to_string())
            }
            _ => {
                debug!(kind = ?msg.kind, "Ignoring non-terminal message on results topic");
                return;
            }
        };

        match self.store.merge(msg.correlation_id, &msg.source_id, outcome) {
            MergeOutcome::ThresholdReached => {
                self.attempt_complete(msg.correlation_id, "threshold");
            }
            MergeOutcome::Accepted => {
                debug!(
                    correlation_id = %msg.correlation_id,
                    source_id = %msg.source_id,
                    "Worker result merged"
                );
            }
            MergeOutcome::Stale => {
                debug!(
                    correlation_id = %msg.correlation_id,
                    source_id = %msg.source_id,
                    "Late worker result for finished request, discarded"
                );
            }
            MergeOutcome::Unknown => {
                debug!(
                    correlation_id = %msg.correlation_id,
                    source_id = %msg.source_id,
                    "Result for unknown correlation id, discarded"
                );
            }
        }
    }

    /// Attempt the Pending -> Completing transition and, on winning it, run
    /// consolidation and publish the single terminal event.
    fn attempt_complete(&self, id: Uuid, trigger: &str) {
        let Some(snapshot) = self.store.begin_completion(id) else {
            // The other trigger already claimed this request.
            debug!(correlation_id = %id, trigger, "Completion already claimed");
            return;
        };

        let successes = snapshot
            .received
            .values()
            .filter(|o| o.is_success())
            .count();

        if successes == 0 {
            self.store.finish(id, RequestState::Dropped);
            self.store.remove(id);
            warn!(
                correlation_id = %id,
                symbol = %snapshot.symbol,
                trigger,
                "Zero coverage, dropping request"
            );
            let event = AgentMessage::error(
                id,
                AGGREGATOR_SOURCE_ID,
                &format!(
                    "zero coverage: no worker produced data for {} before the deadline",
                    snapshot.symbol
                ),
            );
            self.publish_terminal(id, event);
            return;
        }

        let input = ConsolidationInput {
            correlation_id: id,
            symbol: &snapshot.symbol,
            received: &snapshot.received,
            expected_sources: &snapshot.expected_sources,
            elapsed_ms: snapshot.elapsed_ms,
        };
        let analysis = self.consolidator.consolidate(&input);
        self.store.finish(id, RequestState::Completed);

        info!(
            correlation_id = %id,
            symbol = %snapshot.symbol,
            trigger,
            coverage = %format!("{}/{}", analysis.coverage.received, analysis.coverage.expected),
            elapsed_ms = snapshot.elapsed_ms,
            "Request completed"
        );

        match serde_json::to_value(&analysis) {
            Ok(payload) => {
                let event = AgentMessage::success(id, AGGREGATOR_SOURCE_ID, payload);
                self.publish_terminal(id, event);
            }
            Err(e) => {
                warn!(correlation_id = %id, error = %e, "Failed to serialize analysis");
            }
        }

        // Keep the bookkeeping queryable via /status for the grace window.
        let store = Arc::clone(&self.store);
        let grace = self.success_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            store.remove(id);
            debug!(correlation_id = %id, "Request bookkeeping swept");
        });
    }

    fn publish_terminal(&self, id: Uuid, event: AgentMessage) {
        if let Err(e) = self.bus.publish(&self.bus_config.events_topic, event) {
            warn!(correlation_id = %id, error = %e, "Terminal event not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consolidate::CompositeConsolidator;
    use crate::test_support::report_payload;
    use rust_decimal_macros::dec;
    use sage_models::config::SageConfig;
    use sage_models::ConsolidatedAnalysis;

    fn test_aggregator(bus: Arc<MessageBus>, timeout_ms: u64) -> Aggregator {
        let config = SageConfig::default();
        let aggregation = AggregationConfig {
            timeout_ms,
            success_grace_seconds: 60,
            error_grace_seconds: 10,
        };
        let expected_sources = config.expected_sources();
        Aggregator::new(
            bus,
            Arc::new(RequestStore::new()),
            Arc::new(CompositeConsolidator::new()),
            config.bus,
            expected_sources,
            &aggregation,
        )
    }

    fn success(id: Uuid, source: &str, score: rust_decimal::Decimal) -> AgentMessage {
        AgentMessage::success(id, source, report_payload(source, score))
    }

    #[tokio::test(start_paused = true)]
    async fn early_full_completion_beats_deadline() {
        let bus = Arc::new(MessageBus::new(16));
        let mut events = bus.subscribe("analysis.events").unwrap();
        let aggregator = test_aggregator(bus, 5_000);

        let id = aggregator.register("AAPL");
        aggregator.handle_result(success(id, "technical", dec!(0.80)));
        aggregator.handle_result(success(id, "sentiment", dec!(0.60)));
        aggregator.handle_result(success(id, "fundamentals", dec!(0.70)));

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, MessageKind::Success);
        assert_eq!(event.correlation_id, id);

        let analysis: ConsolidatedAnalysis = serde_json::from_value(event.payload).unwrap();
        assert!(analysis.coverage.is_full());
        // No second event when the (cancelled) deadline would have fired.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_with_partial_coverage_completes() {
        let bus = Arc::new(MessageBus::new(16));
        let mut events = bus.subscribe("analysis.events").unwrap();
        let aggregator = test_aggregator(bus, 5_000);

        let id = aggregator.register("AAPL");
        aggregator.handle_result(success(id, "technical", dec!(0.80)));

        tokio::time::advance(Duration::from_millis(5_001)).await;
        tokio::task::yield_now().await;

        let event = events.recv().await.unwrap();
        let analysis: ConsolidatedAnalysis = serde_json::from_value(event.payload).unwrap();
        assert_eq!(analysis.coverage.received, 1);
        assert_eq!(analysis.coverage.expected, 3);
        assert_eq!(
            analysis.missing_sources,
            vec!["fundamentals", "sentiment"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn zero_coverage_emits_error_and_frees_state() {
        let bus = Arc::new(MessageBus::new(16));
        let mut events = bus.subscribe("analysis.events").unwrap();
        let aggregator = test_aggregator(bus, 5_000);

        let id = aggregator.register("AAPL");
        tokio::time::advance(Duration::from_millis(5_001)).await;
        tokio::task::yield_now().await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, MessageKind::Error);
        assert!(event.payload["error"]
            .as_str()
            .unwrap()
            .contains("zero coverage"));
        assert!(aggregator.store().status(id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn all_workers_failed_is_zero_coverage() {
        let bus = Arc::new(MessageBus::new(16));
        let mut events = bus.subscribe("analysis.events").unwrap();
        let aggregator = test_aggregator(bus, 5_000);

        let id = aggregator.register("AAPL");
        for source in ["technical", "sentiment", "fundamentals"] {
            aggregator.handle_result(AgentMessage::error(id, source, "provider down"));
        }

        // Threshold is reached by the failures, so completion runs early,
        // but there is no data to consolidate.
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, MessageKind::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn late_result_after_completion_is_discarded() {
        let bus = Arc::new(MessageBus::new(16));
        let mut events = bus.subscribe("analysis.events").unwrap();
        let aggregator = test_aggregator(bus, 5_000);

        let id = aggregator.register("AAPL");
        aggregator.handle_result(success(id, "technical", dec!(0.80)));
        tokio::time::advance(Duration::from_millis(5_001)).await;
        tokio::task::yield_now().await;
        let first = events.recv().await.unwrap();

        // Straggler arrives after the deadline completion.
        aggregator.handle_result(success(id, "sentiment", dec!(0.10)));
        assert!(events.try_recv().is_err());

        let analysis: ConsolidatedAnalysis = serde_json::from_value(first.payload).unwrap();
        assert_eq!(analysis.coverage.received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_request_swept_after_grace() {
        let bus = Arc::new(MessageBus::new(16));
        let _events = bus.subscribe("analysis.events").unwrap();
        let aggregator = test_aggregator(bus, 5_000);

        let id = aggregator.register("AAPL");
        aggregator.handle_result(success(id, "technical", dec!(0.80)));
        aggregator.handle_result(success(id, "sentiment", dec!(0.60)));
        aggregator.handle_result(success(id, "fundamentals", dec!(0.70)));
        tokio::task::yield_now().await;

        assert_eq!(
            aggregator.store().status(id).unwrap().state,
            RequestState::Completed
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        assert!(aggregator.store().status(id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_cancels_timer_and_removes() {
        let bus = Arc::new(MessageBus::new(16));
        let mut events = bus.subscribe("analysis.events").unwrap();
        let aggregator = test_aggregator(bus, 5_000);

        let id = aggregator.register("AAPL");
        aggregator.abort(id);

        assert!(aggregator.store().status(id).is_none());
        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        // No zero-coverage event from the (cancelled) timer.
        assert!(events.try_recv().is_err());
    }
}
