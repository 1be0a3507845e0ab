//! Test support: scripted worker agents and an invocation-counting
//! consolidator, for exercising the fan-out/fan-in machinery without real
//! data providers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sage_models::{ConsolidatedAnalysis, SourceReport};

use crate::consolidate::{CompositeConsolidator, ConsolidationInput, Consolidator};
use crate::error::AgentError;
use crate::worker::{WorkerAgent, WorkerContext, WorkerRequest};

/// Build a well-formed worker success payload for a source.
pub fn report_payload(source_id: &str, score: Decimal) -> serde_json::Value {
    serde_json::to_value(SourceReport {
        source_id: source_id.to_string(),
        score,
        summary: format!("scripted {source_id} report"),
        data: serde_json::json!({}),
    })
    .unwrap_or_default()
}

/// A worker that instantly returns a canned payload.
pub struct ScriptedWorker {
    source_id: String,
    name: String,
    payload: serde_json::Value,
}

impl ScriptedWorker {
    pub fn new(source_id: &str, payload: serde_json::Value) -> Self {
        Self {
            source_id: source_id.to_string(),
            name: format!("scripted_{source_id}"),
            payload,
        }
    }
}

#[async_trait]
impl WorkerAgent for ScriptedWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn analyze(
        &self,
        _request: &WorkerRequest,
        _ctx: &WorkerContext,
    ) -> Result<serde_json::Value, AgentError> {
        Ok(self.payload.clone())
    }
}

/// A worker whose handler always fails.
pub struct FailingWorker {
    source_id: String,
    name: String,
}

impl FailingWorker {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            name: format!("failing_{source_id}"),
        }
    }
}

#[async_trait]
impl WorkerAgent for FailingWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn analyze(
        &self,
        _request: &WorkerRequest,
        _ctx: &WorkerContext,
    ) -> Result<serde_json::Value, AgentError> {
        Err(AgentError::Handler("injected failure".to_string()))
    }
}

/// A worker that responds with a fixed score after a delay.
///
/// With a paused tokio clock this makes deadline races reproducible.
pub struct SlowWorker {
    source_id: String,
    name: String,
    delay: Duration,
    score: Decimal,
}

impl SlowWorker {
    pub fn new(source_id: &str, delay: Duration, score: Decimal) -> Self {
        Self {
            source_id: source_id.to_string(),
            name: format!("slow_{source_id}"),
            delay,
            score,
        }
    }
}

#[async_trait]
impl WorkerAgent for SlowWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn analyze(
        &self,
        request: &WorkerRequest,
        ctx: &WorkerContext,
    ) -> Result<serde_json::Value, AgentError> {
        ctx.emit_progress(request.correlation_id, &self.source_id, 10, "starting");
        tokio::time::sleep(self.delay).await;
        ctx.emit_progress(request.correlation_id, &self.source_id, 90, "finishing");
        Ok(report_payload(&self.source_id, self.score))
    }
}

/// Wraps the real consolidator and counts invocations, so tests can assert
/// the at-most-once guarantee.
#[derive(Default)]
pub struct CountingConsolidator {
    inner: CompositeConsolidator,
    calls: AtomicUsize,
}

impl CountingConsolidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Consolidator for CountingConsolidator {
    fn consolidate(&self, input: &ConsolidationInput<'_>) -> ConsolidatedAnalysis {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.consolidate(input)
    }
}
