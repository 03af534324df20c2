//! # Metrics Module
//!
//! Prometheus metrics for monitoring the controller, organized by responsibility.
//!
//! ## Sub-modules
//!
//! - `registry` - Metrics registry setup, registration and text encoding
//! - `controller_metrics` - Queue and reconciliation metrics (reconciliations, requeues, drops)
//! - `generate_metrics` - Generator and downstream resource metrics

pub mod controller_metrics;
pub mod generate_metrics;
pub mod registry;

pub use controller_metrics::*;
pub use generate_metrics::*;
pub use registry::*;
