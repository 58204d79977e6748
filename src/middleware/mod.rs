//! Middleware for observability and admission control.
//!
//! This module provides:
//! - Request logging with latency tracking
//! - Rate limiting per client IP address

pub mod logging;
pub mod rate_limit;

pub use logging::request_logging;
pub use rate_limit::{rate_limit_middleware, RateDecision, RateLimiter};
