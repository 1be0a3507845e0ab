use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle of a correlation request.
///
/// `Pending -> Completing -> Completed` or `Pending -> Completing -> Dropped`,
/// exactly once. The transition out of `Pending` happens only inside
/// [`RequestStore::begin_completion`].
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    Pending,
    Completing,
    Completed,
    Dropped,
}

/// What one expected source contributed: data, or a failure reason.
///
/// Failures count toward the completion threshold (every roster member has
/// reported) but not toward coverage.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceOutcome {
    Success(serde_json::Value),
    Failed(String),
}

impl SourceOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SourceOutcome::Success(_))
    }
}

/// Per-request state owned exclusively by the store.
struct CorrelationRequest {
    symbol: String,
    created_at: DateTime<Utc>,
    started: Instant,
    expected_sources: HashSet<String>,
    received: HashMap<String, SourceOutcome>,
    state: RequestState,
    /// Elapsed time frozen at the moment completion was claimed.
    final_elapsed_ms: Option<u64>,
    /// Cancels the one-shot deadline timer on early completion.
    cancel: CancellationToken,
}

/// Result of merging one worker message.
#[derive(Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Merged; still waiting on at least one source.
    Accepted,
    /// Merged, and every expected source has now reported.
    ThresholdReached,
    /// The request already left `Pending`; the message was discarded.
    Stale,
    /// No such correlation id (never registered, or already swept).
    Unknown,
}

/// Everything the completion path needs, snapshotted under the store lock.
pub struct CompletionSnapshot {
    pub symbol: String,
    pub created_at: DateTime<Utc>,
    pub expected_sources: HashSet<String>,
    pub received: HashMap<String, SourceOutcome>,
    pub elapsed_ms: u64,
}

/// Status view served by `GET /status/{id}`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusSnapshot {
    pub symbol: String,
    pub state: RequestState,
    pub elapsed_ms: u64,
}

/// The request-state table: correlation id -> in-flight request.
///
/// All mutation goes through these operations; the `Pending` check-and-set in
/// `begin_completion` is what keeps the threshold trigger and the deadline
/// timer from both running consolidation.
#[derive(Default)]
pub struct RequestStore {
    inner: Mutex<HashMap<Uuid, CorrelationRequest>>,
}

impl RequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a request shell and mint its correlation id.
    ///
    /// Returns the id and the token the deadline timer should race against.
    pub fn insert(&self, symbol: &str, expected_sources: Vec<String>) -> (Uuid, CancellationToken) {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let request = CorrelationRequest {
            symbol: symbol.to_string(),
            created_at: Utc::now(),
            started: Instant::now(),
            expected_sources: expected_sources.into_iter().collect(),
            received: HashMap::new(),
            state: RequestState::Pending,
            final_elapsed_ms: None,
            cancel: cancel.clone(),
        };

        let mut inner = self.lock();
        inner.insert(id, request);
        (id, cancel)
    }

    /// Merge one worker outcome, last-write-wins per source id.
    pub fn merge(&self, id: Uuid, source_id: &str, outcome: SourceOutcome) -> MergeOutcome {
        let mut inner = self.lock();
        let Some(request) = inner.get_mut(&id) else {
            return MergeOutcome::Unknown;
        };

        if request.state != RequestState::Pending {
            return MergeOutcome::Stale;
        }

        request.received.insert(source_id.to_string(), outcome);

        if request.received.len() >= request.expected_sources.len() {
            MergeOutcome::ThresholdReached
        } else {
            MergeOutcome::Accepted
        }
    }

    /// Atomically claim the completion of a request.
    ///
    /// Only the first caller to observe `Pending` gets a snapshot back; the
    /// state moves to `Completing` and the deadline timer is cancelled before
    /// the lock is released. Any later caller (the losing trigger, a retry, a
    /// duplicate) gets `None` and must do nothing.
    pub fn begin_completion(&self, id: Uuid) -> Option<CompletionSnapshot> {
        let mut inner = self.lock();
        let request = inner.get_mut(&id)?;

        if request.state != RequestState::Pending {
            return None;
        }
        request.state = RequestState::Completing;
        request.cancel.cancel();
        let elapsed_ms = request.started.elapsed().as_millis() as u64;
        request.final_elapsed_ms = Some(elapsed_ms);

        Some(CompletionSnapshot {
            symbol: request.symbol.clone(),
            created_at: request.created_at,
            expected_sources: request.expected_sources.clone(),
            received: request.received.clone(),
            elapsed_ms,
        })
    }

    /// Record the terminal state after consolidation (or the drop decision).
    pub fn finish(&self, id: Uuid, state: RequestState) {
        debug_assert!(matches!(
            state,
            RequestState::Completed | RequestState::Dropped
        ));
        let mut inner = self.lock();
        if let Some(request) = inner.get_mut(&id) {
            request.state = state;
        }
    }

    /// Remove a request's bookkeeping entirely.
    pub fn remove(&self, id: Uuid) {
        let mut inner = self.lock();
        inner.remove(&id);
    }

    pub fn status(&self, id: Uuid) -> Option<StatusSnapshot> {
        let inner = self.lock();
        inner.get(&id).map(|request| StatusSnapshot {
            symbol: request.symbol.clone(),
            state: request.state,
            // Finished requests report their completion duration, not wall
            // time since submission.
            elapsed_ms: request
                .final_elapsed_ms
                .unwrap_or_else(|| request.started.elapsed().as_millis() as u64),
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CorrelationRequest>> {
        // Poisoning only happens if a holder panicked; the table is still
        // consistent because every mutation completes under the lock.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
