//! # Controllers
//!
//! The UR pipeline: the generator produces records at admission time, the
//! background controller claims and executes them, and the cleanup controller
//! retires them together with their downstream resources.

pub mod backoff;
pub mod background;
pub mod cleanup;
pub mod generate;
pub mod generator;
pub mod mutate;
pub mod queue;
pub mod updater;
