use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cache not available: {0}")]
    Unavailable(String),
}
