use std::collections::{HashMap, HashSet};

use chrono::Utc;
use rust_decimal::Decimal;
use sage_models::{ConsolidatedAnalysis, Coverage, Recommendation, SourceReport};
use uuid::Uuid;

use crate::store::SourceOutcome;

/// Accumulated state handed to the domain layer, exactly once per request.
pub struct ConsolidationInput<'a> {
    pub correlation_id: Uuid,
    pub symbol: &'a str,
    pub received: &'a HashMap<String, SourceOutcome>,
    pub expected_sources: &'a HashSet<String>,
    pub elapsed_ms: u64,
}

/// Seam between the aggregator and the scoring domain layer.
///
/// The aggregator guarantees at most one call per correlation id; the
/// implementation only has to turn the received map into one result.
pub trait Consolidator: Send + Sync {
    fn consolidate(&self, input: &ConsolidationInput<'_>) -> ConsolidatedAnalysis;
}

/// Default consolidation: weighted composite of the contributing facet
/// scores, with recommendation bands.
pub struct CompositeConsolidator {
    /// source id -> weight (hundredths). Unknown sources get `default_weight`.
    weights: HashMap<String, Decimal>,
    default_weight: Decimal,
}

impl Default for CompositeConsolidator {
    fn default() -> Self {
        let mut weights = HashMap::new();
        weights.insert("technical".to_string(), Decimal::new(40, 2));
        weights.insert("sentiment".to_string(), Decimal::new(25, 2));
        weights.insert("fundamentals".to_string(), Decimal::new(35, 2));
        Self {
            weights,
            default_weight: Decimal::new(25, 2),
        }
    }
}

impl CompositeConsolidator {
    pub fn new() -> Self {
        Self::default()
    }

    fn weight(&self, source_id: &str) -> Decimal {
        self.weights
            .get(source_id)
            .copied()
            .unwrap_or(self.default_weight)
    }
}

fn recommendation_for(score: Decimal) -> Recommendation {
    if score >= Decimal::new(65, 2) {
        Recommendation::Buy
    } else if score <= Decimal::new(35, 2) {
        Recommendation::Sell
    } else {
        Recommendation::Hold
    }
}

impl Consolidator for CompositeConsolidator {
    fn consolidate(&self, input: &ConsolidationInput<'_>) -> ConsolidatedAnalysis {
        let mut reports: Vec<SourceReport> = Vec::new();
        for (source_id, outcome) in input.received {
            if let SourceOutcome::Success(payload) = outcome {
                let report = serde_json::from_value(payload.clone()).unwrap_or_else(|_| {
                    // A worker that published a malformed payload still
                    // contributed; score it neutral rather than dropping it.
                    SourceReport {
                        source_id: source_id.clone(),
                        score: Decimal::new(50, 2),
                        summary: "unparseable worker payload".to_string(),
                        data: payload.clone(),
                    }
                });
                reports.push(report);
            }
        }
        reports.sort_by(|a, b| a.source_id.cmp(&b.source_id));

        let mut weighted_sum = Decimal::ZERO;
        let mut weight_total = Decimal::ZERO;
        for report in &reports {
            let w = self.weight(&report.source_id);
            weighted_sum += report.score * w;
            weight_total += w;
        }
        let composite_score = if weight_total.is_zero() {
            Decimal::new(50, 2)
        } else {
            (weighted_sum / weight_total).round_dp(4)
        };

        let mut missing_sources: Vec<String> = input
            .expected_sources
            .iter()
            .filter(|s| {
                !input
                    .received
                    .get(*s)
                    .is_some_and(SourceOutcome::is_success)
            })
            .cloned()
            .collect();
        missing_sources.sort();

        ConsolidatedAnalysis {
            correlation_id: input.correlation_id,
            symbol: input.symbol.to_string(),
            composite_score,
            recommendation: recommendation_for(composite_score),
            coverage: Coverage {
                received: reports.len() as u32,
                expected: input.expected_sources.len() as u32,
            },
            reports,
            missing_sources,
            completed_at: Utc::now(),
            duration_ms: input.elapsed_ms,
        }
    }
}
