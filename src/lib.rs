//! Tollgate - per-identity, per-route rate limiting for HTTP services
//!
//! Every authenticated request is checked against a token bucket scoped to
//! the caller and the route it targets. Buckets live in a shared store
//! (in-process or redis) and are updated with compare-and-set, so concurrent
//! requests from one caller cannot overspend.

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
