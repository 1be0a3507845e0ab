use async_trait::async_trait;
use sage_models::SourceReport;

use super::{cached_value, facet_cache_key, to_score, FACET_TTL};
use crate::error::AgentError;
use crate::worker::{WorkerAgent, WorkerContext, WorkerRequest};

/// Price-action facet: RSI, moving-average crossover, MACD.
pub struct TechnicalWorker {
    name: String,
}

impl TechnicalWorker {
    pub const SOURCE_ID: &'static str = "technical";

    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl WorkerAgent for TechnicalWorker {
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
            10,
            "reading indicators",
        );

        let mut score = 0.50f64;
        let mut notes: Vec<String> = Vec::new();

        // One upstream refresh per request; exhaustion degrades to whatever
        // is already cached instead of failing the request.
        if !ctx.check_rate_limit("quotes") {
            notes.push("quotes provider window exhausted, cached data only".to_string());
        }

        if let Some(rsi) = cached_value(ctx, &format!("indicator:rsi_14:{symbol}")).await {
            if rsi < 30.0 {
                score += 0.15;
                notes.push(format!("RSI {rsi:.0} oversold (+0.15)"));
            } else if rsi > 70.0 {
                score -= 0.15;
                notes.push(format!("RSI {rsi:.0} overbought (-0.15)"));
            } else {
                notes.push(format!("RSI {rsi:.0} neutral"));
            }
        }

        ctx.emit_progress(
            request.correlation_id,
            Self::SOURCE_ID,
            55,
            "evaluating trend",
        );

        let sma = cached_value(ctx, &format!("indicator:sma_20:{symbol}")).await;
        let ema = cached_value(ctx, &format!("indicator:ema_20:{symbol}")).await;
        if let (Some(ema), Some(sma)) = (ema, sma) {
            if ema > sma {
                score += 0.10;
                notes.push("EMA above SMA, golden cross (+0.10)".to_string());
            } else if ema < sma {
                score -= 0.10;
                notes.push("EMA below SMA, death cross (-0.10)".to_string());
            }
        }

        let macd = cached_value(ctx, &format!("indicator:macd_hist:{symbol}")).await;
        if let Some(hist) = macd {
            if hist > 0.0 {
                score += 0.08;
                notes.push("MACD histogram positive (+0.08)".to_string());
            } else if hist < 0.0 {
                score -= 0.08;
                notes.push("MACD histogram negative (-0.08)".to_string());
            }
        }

        if notes.is_empty() {
            notes.push("no technical data available, neutral".to_string());
        }

        let report = SourceReport {
            source_id: Self::SOURCE_ID.to_string(),
            score: to_score(score),
            summary: notes.join("; "),
            data: serde_json::json!({
                "rsi_consulted": true,
                "notes": notes,
            }),
        };
        ctx.set_cached(&facet_key, &report, FACET_TTL).await;

        ctx.emit_progress(request.correlation_id, Self::SOURCE_ID, 100, "done");
        Ok(serde_json::to_value(report)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::tests::seeded_ctx;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn request() -> WorkerRequest {
        WorkerRequest {
            correlation_id: Uuid::new_v4(),
            symbol: "AAPL".to_string(),
        }
    }

    #[tokio::test]
    async fn oversold_golden_cross_scores_bullish() {
        let (ctx, _bus) = seeded_ctx(&[
            ("indicator:rsi_14:AAPL", serde_json::json!({"value": 28.0})),
            ("indicator:sma_20:AAPL", serde_json::json!({"value": 150.0})),
            ("indicator:ema_20:AAPL", serde_json::json!({"value": 152.0})),
        ])
        .await;

        let worker = TechnicalWorker::new("technical_analyst");
        let payload = worker.analyze(&request(), &ctx).await.unwrap();
        let report: SourceReport = serde_json::from_value(payload).unwrap();

        // 0.50 + 0.15 + 0.10 = 0.75
        assert_eq!(report.score, dec!(0.75));
        assert!(report.summary.contains("oversold"));
        assert!(report.summary.contains("golden cross"));
    }

    #[tokio::test]
    async fn overbought_death_cross_scores_bearish() {
        let (ctx, _bus) = seeded_ctx(&[
            ("indicator:rsi_14:AAPL", serde_json::json!({"value": 78.0})),
            ("indicator:sma_20:AAPL", serde_json::json!({"value": 150.0})),
            ("indicator:ema_20:AAPL", serde_json::json!({"value": 145.0})),
            ("indicator:macd_hist:AAPL", serde_json::json!({"value": -0.4})),
        ])
        .await;

        let worker = TechnicalWorker::new("technical_analyst");
        let payload = worker.analyze(&request(), &ctx).await.unwrap();
        let report: SourceReport = serde_json::from_value(payload).unwrap();

        // 0.50 - 0.15 - 0.10 - 0.08 = 0.17
        assert_eq!(report.score, dec!(0.17));
    }

    #[tokio::test]
    async fn no_data_is_neutral() {
        let (ctx, _bus) = seeded_ctx(&[]).await;

        let worker = TechnicalWorker::new("technical_analyst");
        let payload = worker.analyze(&request(), &ctx).await.unwrap();
        let report: SourceReport = serde_json::from_value(payload).unwrap();

        assert_eq!(report.score, dec!(0.50));
        assert!(report.summary.contains("neutral"));
    }

    #[tokio::test]
    async fn second_call_serves_cached_report() {
        let (ctx, _bus) = seeded_ctx(&[(
            "indicator:rsi_14:AAPL",
            serde_json::json!({"value": 28.0}),
        )])
        .await;

        let worker = TechnicalWorker::new("technical_analyst");
        let first = worker.analyze(&request(), &ctx).await.unwrap();
        let second = worker.analyze(&request(), &ctx).await.unwrap();
        assert_eq!(first, second);
    }
}
