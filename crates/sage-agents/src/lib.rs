pub mod aggregator;
pub mod consolidate;
pub mod error;
pub mod registry;
pub mod store;
pub mod worker;
pub mod workers;

pub mod test_support;

pub use aggregator::{Aggregator, AGGREGATOR_SOURCE_ID};
pub use consolidate::{CompositeConsolidator, ConsolidationInput, Consolidator};
pub use error::AgentError;
pub use registry::AgentRegistry;
pub use store::{MergeOutcome, RequestState, RequestStore, SourceOutcome, StatusSnapshot};
pub use worker::{run_worker, WorkerAgent, WorkerContext, WorkerRequest};
pub use workers::{FundamentalsWorker, SentimentWorker, TechnicalWorker};
