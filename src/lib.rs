//! Tollgate - Multi-tenant Rate Limiting Engine
//!
//! This crate decides, per request, whether a caller identified by tenant,
//! user, IP and endpoint may proceed under a set of overlapping rules. Four
//! algorithms are supported (token bucket, sliding window log, fixed window,
//! leaky bucket); all counter state lives in a shared [`store::CounterStore`]
//! so any number of engine instances enforce the same limits.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
pub mod telemetry;
