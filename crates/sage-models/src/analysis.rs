use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One worker's contribution to an analysis (the `success` payload).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceReport {
    pub source_id: String,
    /// 0.0 to 1.0 facet score from this worker.
    pub score: Decimal,
    pub summary: String,
    /// Worker-specific structured detail.
    pub data: serde_json::Value,
}

/// How much of the expected worker roster actually contributed data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Coverage {
    pub received: u32,
    pub expected: u32,
}

impl Coverage {
    pub fn fraction(&self) -> f64 {
        if self.expected == 0 {
            0.0
        } else {
            f64::from(self.received) / f64::from(self.expected)
        }
    }

    pub fn is_full(&self) -> bool {
        self.received >= self.expected
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Buy,
    Hold,
    Sell,
}

/// The consolidated result published once per correlation id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsolidatedAnalysis {
    pub correlation_id: Uuid,
    pub symbol: String,
    /// Weighted composite of the contributing facet scores, 0.0 to 1.0.
    pub composite_score: Decimal,
    pub recommendation: Recommendation,
    pub coverage: Coverage,
    pub reports: Vec<SourceReport>,
    /// Expected sources that contributed nothing before the deadline.
    pub missing_sources: Vec<String>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}
