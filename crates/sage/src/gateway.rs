//! HTTP entry point: request intake and status queries.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use sage_models::AgentMessage;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::AppState;

pub const GATEWAY_SOURCE_ID: &str = "gateway";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeAccepted {
    correlation_id: Uuid,
    symbol: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    correlation_id: Uuid,
    symbol: String,
    state: sage_agents::RequestState,
    elapsed_ms: u64,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn valid_symbol(symbol: &str) -> bool {
    (1..=5).contains(&symbol.len()) && symbol.bytes().all(|b| b.is_ascii_uppercase())
}

/// `POST /analyze/:symbol` — validate, register, fan out, reply 202.
///
/// The 202 goes out before any worker has responded; the correlation id is
/// the caller's handle for `/status` and the event stream.
pub async fn analyze(State(state): State<AppState>, Path(symbol): Path<String>) -> Response {
    if !valid_symbol(&symbol) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "symbol must be 1-5 uppercase ASCII letters",
        );
    }

    let id = state.aggregator.register(&symbol);

    for source in &state.fan_out {
        let topic = state.bus_config.request_topic(source);
        let request = AgentMessage::request(id, GATEWAY_SOURCE_ID, &symbol);
        if let Err(e) = state.bus.publish(&topic, request) {
            warn!(correlation_id = %id, topic, error = %e, "Fan-out failed, dropping request");
            state.aggregator.abort(id);
            return error_response(
                StatusCode::BAD_GATEWAY,
                &format!("analysis pipeline unavailable: {e}"),
            );
        }
    }

    info!(correlation_id = %id, symbol, workers = state.fan_out.len(), "Analysis dispatched");
    (
        StatusCode::ACCEPTED,
        Json(AnalyzeAccepted {
            correlation_id: id,
            symbol,
        }),
    )
        .into_response()
}

/// `GET /status/:correlation_id` — in-flight or recently finished requests
/// only; swept requests are a 404.
pub async fn status(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.aggregator.store().status(id) {
        Some(snapshot) => Json(StatusResponse {
            correlation_id: id,
            symbol: snapshot.symbol,
            state: snapshot.state,
            elapsed_ms: snapshot.elapsed_ms,
        })
        .into_response(),
        None => error_response(StatusCode::NOT_FOUND, "unknown or expired correlation id"),
    }
}
