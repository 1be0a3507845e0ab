use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("No subscribers on topic: {0}")]
    NoSubscribers(String),

    #[error("Bus not available: {0}")]
    Unavailable(String),
}
