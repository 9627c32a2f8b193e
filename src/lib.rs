//! Turnstile - Per-Client Rate Limiting Service
//!
//! This crate implements per-client admission control with token buckets.
//! Each client identifier gets its own bucket on first use; a background
//! reaper reclaims buckets that have gone idle. An HTTP front end resolves
//! client identity from request headers and rejects over-limit callers.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
