use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of an [`AgentMessage`] on the bus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Progress,
    Success,
    Error,
}

/// The message envelope every bus payload travels in.
///
/// Immutable once published; the same correlation id binds a request to all
/// messages produced while servicing it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMessage {
    pub correlation_id: Uuid,
    pub source_id: String,
    pub kind: MessageKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AgentMessage {
    fn new(
        correlation_id: Uuid,
        source_id: &str,
        kind: MessageKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            correlation_id,
            source_id: source_id.to_string(),
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// A fan-out request for `symbol`, addressed to a worker topic.
    pub fn request(correlation_id: Uuid, source_id: &str, symbol: &str) -> Self {
        Self::new(
            correlation_id,
            source_id,
            MessageKind::Request,
            serde_json::json!({ "symbol": symbol }),
        )
    }

    pub fn progress(correlation_id: Uuid, source_id: &str, percent: u8, message: &str) -> Self {
        Self::new(
            correlation_id,
            source_id,
            MessageKind::Progress,
            serde_json::json!({ "percent": percent.min(100), "message": message }),
        )
    }

    pub fn success(correlation_id: Uuid, source_id: &str, payload: serde_json::Value) -> Self {
        Self::new(correlation_id, source_id, MessageKind::Success, payload)
    }

    pub fn error(correlation_id: Uuid, source_id: &str, cause: &str) -> Self {
        Self::new(
            correlation_id,
            source_id,
            MessageKind::Error,
            serde_json::json!({ "error": cause }),
        )
    }

    /// Validate the required envelope fields.
    ///
    /// Returns the name of the first missing/invalid field, so the caller can
    /// log a useful discard reason.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.correlation_id.is_nil() {
            return Err("correlation_id");
        }
        if self.source_id.is_empty() {
            return Err("source_id");
        }
        if self.kind == MessageKind::Request && self.symbol().is_none() {
            return Err("payload.symbol");
        }
        Ok(())
    }

    /// The symbol carried in a request payload, if present.
    pub fn symbol(&self) -> Option<&str> {
        self.payload.get("symbol").and_then(|v| v.as_str())
    }
}
