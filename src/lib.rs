//! Bulwark - Request Guard Pipeline
//!
//! This crate puts a guard pipeline in front of an axum application:
//! sliding-window rate limiting (in process or in a shared Redis store),
//! per-route circuit breaking, content validation, DDoS heuristics and
//! security response headers.

pub mod breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod guard;
pub mod http;
pub mod metrics;
pub mod ratelimit;
pub mod store;
