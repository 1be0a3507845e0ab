pub mod analysis;
pub mod config;
pub mod envelope;

pub use analysis::{ConsolidatedAnalysis, Coverage, Recommendation, SourceReport};
pub use envelope::{AgentMessage, MessageKind};
