//! Tollgate - Per-key HTTP request rate admission
//!
//! This crate decides, for each inbound HTTP request, whether it may proceed
//! or must be rejected as over-limit. Requests are keyed by client address,
//! path, method and optional header, basic-auth and context discriminators,
//! and every key is metered by its own token bucket held in an expiring
//! in-memory store. Serving HTTP is left to the caller.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod replay;
