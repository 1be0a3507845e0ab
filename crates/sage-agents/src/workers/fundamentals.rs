use async_trait::async_trait;
use sage_models::SourceReport;

use super::{cached_value, facet_cache_key, to_score, FACET_TTL};
use crate::error::AgentError;
use crate::worker::{WorkerAgent, WorkerContext, WorkerRequest};

/// Valuation facet: P/E ratio and earnings growth.
pub struct FundamentalsWorker {
    name: String,
}

impl FundamentalsWorker {
    pub const SOURCE_ID: &'static str = "fundamentals";

    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl WorkerAgent for FundamentalsWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_id(&self) -> &str {
        Self::SOURCE_ID
    }

    async fn analyze(
        &self,
        request: &WorkerRequest,
        ctx: &WorkerContext,
    ) -> Result<serde_json::Value, AgentError> {
        let symbol = &request.symbol;
        let facet_key = facet_cache_key(Self::SOURCE_ID, symbol);
        if let Some(report) = ctx.get_cached::<SourceReport>(&facet_key).await {
            ctx.emit_progress(request.correlation_id, Self::SOURCE_ID, 100, "cached");
            return Ok(serde_json::to_value(report)?);
        }

        ctx.emit_progress(
            request.correlation_id,
            Self::SOURCE_ID,
            20,
            "evaluating valuation",
        );

        let mut score = 0.50f64;
        let mut notes: Vec<String> = Vec::new();

        if !ctx.check_rate_limit("filings") {
            notes.push("filings provider window exhausted, cached data only".to_string());
        }

        let pe = cached_value(ctx, &format!("fundamentals:pe:{symbol}")).await;
        if let Some(pe) = pe {
            if pe <= 0.0 {
                score -= 0.20;
                notes.push(format!("negative earnings, P/E {pe:.1} (-0.20)"));
            } else if pe < 15.0 {
                score += 0.10;
                notes.push(format!("P/E {pe:.1} attractive (+0.10)"));
            } else if pe > 40.0 {
                score -= 0.15;
                notes.push(format!("P/E {pe:.1} stretched (-0.15)"));
            } else {
                notes.push(format!("P/E {pe:.1} fair"));
            }
        }

        ctx.emit_progress(
            request.correlation_id,
            Self::SOURCE_ID,
            65,
            "evaluating growth",
        );

        let growth = cached_value(ctx, &format!("fundamentals:eps_growth:{symbol}")).await;
        if let Some(growth) = growth {
            if growth > 0.10 {
                score += 0.15;
                notes.push(format!("EPS growth {:.0}% strong (+0.15)", growth * 100.0));
            } else if growth < 0.0 {
                score -= 0.10;
                notes.push(format!("EPS shrinking {:.0}% (-0.10)", growth * 100.0));
            } else {
                notes.push(format!("EPS growth {:.0}% modest", growth * 100.0));
            }
        }

        if notes.is_empty() {
            notes.push("no fundamental data available, neutral".to_string());
        }

        let report = SourceReport {
            source_id: Self::SOURCE_ID.to_string(),
            score: to_score(score),
            summary: notes.join("; "),
            data: serde_json::json!({
                "pe_ratio": pe,
                "eps_growth": growth,
            }),
        };
        ctx.set_cached(&facet_key, &report, FACET_TTL).await;

        ctx.emit_progress(request.correlation_id, Self::SOURCE_ID, 100, "done");
        Ok(serde_json::to_value(report)?)
    }
}
