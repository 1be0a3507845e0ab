use async_trait::async_trait;
use sage_models::SourceReport;

use super::{cached_score, facet_cache_key, to_score, FACET_TTL};
use crate::error::AgentError;
use crate::worker::{WorkerAgent, WorkerContext, WorkerRequest};

/// News/social sentiment facet.
pub struct SentimentWorker {
    name: String,
}

impl SentimentWorker {
    pub const SOURCE_ID: &'static str = "sentiment";

    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

/// Step adjustment for a -1..1 sentiment score.
fn adjustment(score: f64) -> f64 {
    if score > 0.5 {
        0.10
    } else if score > 0.2 {
        0.05
    } else if score < -0.5 {
        -0.10
    } else if score < -0.2 {
        -0.05
    } else {
        0.0
    }
}

#[async_trait]
impl WorkerAgent for SentimentWorker {
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
            15,
            "scoring news sentiment",
        );

        let mut score = 0.50f64;
        let mut notes: Vec<String> = Vec::new();

        if !ctx.check_rate_limit("news") {
            notes.push("news provider window exhausted, cached data only".to_string());
        }

        let news = cached_score(ctx, &format!("sentiment:news:{symbol}")).await;
        if let Some(news) = news {
            let adj = adjustment(news);
            score += adj;
            notes.push(format!("news sentiment {news:.2} ({adj:+.2})"));
        }

        ctx.emit_progress(
            request.correlation_id,
            Self::SOURCE_ID,
            70,
            "scoring social sentiment",
        );

        let social = cached_score(ctx, &format!("sentiment:social:{symbol}")).await;
        if let Some(social) = social {
            // Social chatter is noisier, weight it down.
            let adj = adjustment(social) * 0.6;
            score += adj;
            notes.push(format!("social sentiment {social:.2} ({adj:+.2})"));
        }

        if notes.is_empty() {
            notes.push("no sentiment data available, neutral".to_string());
        }

        let report = SourceReport {
            source_id: Self::SOURCE_ID.to_string(),
            score: to_score(score),
            summary: notes.join("; "),
            data: serde_json::json!({
                "news_score": news,
                "social_score": social,
            }),
        };
        ctx.set_cached(&facet_key, &report, FACET_TTL).await;

        ctx.emit_progress(request.correlation_id, Self::SOURCE_ID, 100, "done");
        Ok(serde_json::to_value(report)?)
    }
}
