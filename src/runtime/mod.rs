//! # Runtime Module
//!
//! Process runtime for the background controller: initialization, the
//! metrics/probe server, watches and watch error handling.

pub mod error_policy;
pub mod initialization;
pub mod server;
pub mod watch;

pub use error_policy::*;
pub use initialization::*;
pub use server::{start_server, ServerState};
pub use watch::spawn_watches;
