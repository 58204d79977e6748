//! Gatehouse Library
//!
//! Request gating for HTTP services: rate limiting, bearer token and operator credential
//! checks, cache-aside user resolution and role precedence, wired into an axum router.
//! The binary in main.rs only reads configuration and serves `api::create_router`.

pub mod accounts;
pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod middleware;
pub mod notify;
pub mod pipeline;
pub mod resolver;
pub mod store;

pub use config::GateConfig;
pub use error::{GateError, Scheme};
pub use pipeline::{Deadline, RequestPipeline};
