pub mod bus;
pub mod error;

pub use bus::MessageBus;
pub use error::BusError;
