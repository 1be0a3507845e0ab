pub mod error;
pub mod memory;
pub mod rate_limit;

pub use error::CacheError;
pub use memory::TtlCache;
pub use rate_limit::RateLimiter;
