//! Observability: structured logging and metrics.
//!
//! Logging goes through `tracing` with an env-filter; metrics go through the
//! `metrics` facade. With the `prometheus` feature enabled the recorded
//! metrics are exported on `/metrics`.

pub mod metrics;
mod tracing_init;

pub use tracing_init::{LogFormat, init_tracing};
