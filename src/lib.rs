//! # Kyverno Background Controller
//!
//! Reconciles Kyverno `UpdateRequest` records: the durable work items that
//! admission handling leaves behind when a policy needs follow-up work outside
//! the request path.
//!
//! ## Overview
//!
//! 1. **Generator** - creates or re-pends one UR per (type, policy, trigger)
//! 2. **Background controller** - claims URs and runs generate, CEL generate
//!    or mutate-existing work, retrying through a rate-limited queue
//! 3. **Cleanup controller** - owns the policy finalizer, deletes downstream
//!    resources of deleted policies and retires orphaned URs
//! 4. **Admission dispatch** - turns admission events into URs or drift
//!    corrections
//!
//! The rule engine, the admission transport and policy schema validation are
//! external collaborators behind the [`engine::Engine`] trait and the
//! [`webhook`] entry points.

pub mod client;
pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod engine;
pub mod error;
pub mod event;
pub mod labels;
pub mod observability;
pub mod policy;
pub mod runtime;
pub mod webhook;

pub use error::{Error, Result};
