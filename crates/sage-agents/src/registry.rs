//! Maps worker configuration entries to concrete agents and spawns their
//! loops.

use std::sync::Arc;

use sage_models::config::SageConfig;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::AgentError;
use crate::worker::{run_worker, WorkerAgent, WorkerContext};
use crate::workers::{FundamentalsWorker, SentimentWorker, TechnicalWorker};

/// The set of worker agents built from configuration.
///
/// Unknown `source_id` values are skipped with a warning; disabled entries
/// are skipped silently. The gateway fans out only to the agents that
/// actually made it into the registry.
pub struct AgentRegistry {
    workers: Vec<Arc<dyn WorkerAgent>>,
}

impl AgentRegistry {
    pub fn from_config(config: &SageConfig) -> Self {
        let mut workers: Vec<Arc<dyn WorkerAgent>> = Vec::new();
        for entry in &config.workers {
            if !entry.enabled {
                info!(worker = %entry.name, "Worker disabled, skipping");
                continue;
            }
            let agent: Arc<dyn WorkerAgent> = match entry.source_id.as_str() {
                TechnicalWorker::SOURCE_ID => Arc::new(TechnicalWorker::new(&entry.name)),
                SentimentWorker::SOURCE_ID => Arc::new(SentimentWorker::new(&entry.name)),
                FundamentalsWorker::SOURCE_ID => Arc::new(FundamentalsWorker::new(&entry.name)),
                other => {
                    warn!(worker = %entry.name, source_id = other, "Unknown worker source, skipping");
                    continue;
                }
            };
            workers.push(agent);
        }
        Self { workers }
    }

    pub fn workers(&self) -> &[Arc<dyn WorkerAgent>] {
        &self.workers
    }

    /// Source ids of every registered worker, the fan-out target list.
    pub fn source_ids(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.source_id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Spawn one loop per registered worker into the caller's task set.
    pub fn spawn_all(
        &self,
        ctx: Arc<WorkerContext>,
        tasks: &mut JoinSet<Result<(), AgentError>>,
        cancel: &CancellationToken,
    ) {
        for agent in &self.workers {
            info!(worker = agent.name(), source_id = agent.source_id(), "Spawning worker");
            tasks.spawn(run_worker(
                Arc::clone(agent),
                Arc::clone(&ctx),
                cancel.clone(),
            ));
        }
    }
}
