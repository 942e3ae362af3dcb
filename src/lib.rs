//! Ratewatch - Sliding-Window Request Accounting
//!
//! This crate counts the requests a service received over a trailing time
//! window and admits or rejects further requests per client. Counters are
//! approximate sliding windows kept in a fixed-size ring of per-tick deltas,
//! and their state can be snapshotted to disk and recovered after a restart.

pub mod app;
pub mod config;
pub mod error;
pub mod http;
pub mod lifetime;
pub mod ratelimit;
