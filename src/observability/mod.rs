//! # Observability
//!
//! Prometheus metrics for the background pipeline. Logging is plain `tracing`,
//! configured at startup in `runtime::initialization`.

pub mod metrics;
