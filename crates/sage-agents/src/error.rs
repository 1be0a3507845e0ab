use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Invalid message: missing {0}")]
    Validation(&'static str),

    #[error("Bus error: {0}")]
    Bus(#[from] sage_bus::BusError),

    #[error("Cache error: {0}")]
    Cache(#[from] sage_cache::CacheError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
