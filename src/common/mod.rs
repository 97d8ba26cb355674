//! Shared infrastructure for the brokerage client
//!
//! - Circuit breaker to stop hammering a failing venue
//! - Token-bucket rate limiter to stay inside API quotas

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
