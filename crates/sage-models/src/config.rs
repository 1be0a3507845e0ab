use serde::{Deserialize, Serialize};

/// Top-level configuration for SAGE.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SageConfig {
    pub server: ServerConfig,
    pub bus: BusConfig,
    pub aggregation: AggregationConfig,
    pub cache: CacheConfig,
    pub workers: Vec<WorkerConfig>,
    pub rate_limits: Vec<RateLimitConfig>,
}

impl Default for SageConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            bus: BusConfig::default(),
            aggregation: AggregationConfig::default(),
            cache: CacheConfig::default(),
            workers: vec![
                WorkerConfig::enabled("technical"),
                WorkerConfig::enabled("sentiment"),
                WorkerConfig::enabled("fundamentals"),
            ],
            rate_limits: vec![
                RateLimitConfig::new("quotes", 60, 60_000),
                RateLimitConfig::new("news", 30, 60_000),
                RateLimitConfig::new("filings", 10, 60_000),
            ],
        }
    }
}

impl SageConfig {
    /// Source ids of the enabled worker roster (the expected-sources set).
    pub fn expected_sources(&self) -> Vec<String> {
        self.workers
            .iter()
            .filter(|w| w.enabled)
            .map(|w| w.source_id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Topic names and channel sizing for the in-process bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusConfig {
    pub channel_capacity: usize,
    /// Per-worker fan-out topics are `{request_topic_prefix}.{source_id}`.
    pub request_topic_prefix: String,
    /// Worker terminal messages, consumed by the aggregator.
    pub results_topic: String,
    /// Progress and aggregator terminal events, consumed by the relay.
    pub events_topic: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            request_topic_prefix: "analysis.req".to_string(),
            results_topic: "analysis.results".to_string(),
            events_topic: "analysis.events".to_string(),
        }
    }
}

impl BusConfig {
    pub fn request_topic(&self, source_id: &str) -> String {
        format!("{}.{source_id}", self.request_topic_prefix)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregationConfig {
    /// Per-request deadline. A slow worker simply misses the window.
    pub timeout_ms: u64,
    /// How long completed-request bookkeeping stays queryable via /status.
    pub success_grace_seconds: u64,
    /// Shorter retention for requests that ended in a terminal error.
    pub error_grace_seconds: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            success_grace_seconds: 300,
            error_grace_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    pub max_capacity: u64,
    /// TTL for terminal results cached under `result:{symbol}`.
    pub result_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            result_ttl_seconds: 3_600,
        }
    }
}

/// Configuration for a single worker agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    pub name: String,
    pub source_id: String,
    pub enabled: bool,
}

impl WorkerConfig {
    fn enabled(source_id: &str) -> Self {
        Self {
            name: format!("{source_id}_analyst"),
            source_id: source_id.to_string(),
            enabled: true,
        }
    }
}

/// A fixed-window rate-limit tuple for one upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    pub provider: String,
    pub limit: u32,
    pub window_ms: u64,
}

impl RateLimitConfig {
    fn new(provider: &str, limit: u32, window_ms: u64) -> Self {
        Self {
            provider: provider.to_string(),
            limit,
            window_ms,
        }
    }
}
