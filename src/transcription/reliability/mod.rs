//! Reliability Module
//!
//! Per-provider rate limiting, circuit breaking and retry.

mod circuit_breaker;
mod guarded;
mod rate_limiter;
mod retry;

pub use circuit_breaker::*;
pub use guarded::*;
pub use rate_limiter::*;
pub use retry::*;
