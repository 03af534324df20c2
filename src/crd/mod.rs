//! # Custom Resource Definitions
//!
//! CRD types read and written by the background controller.
//!
//! - `UpdateRequest` is owned by this controller: it is the durable work-queue record.
//! - `ClusterPolicy`, `Policy` and `GeneratingPolicy` are read-only inputs, except for
//!   the cleanup finalizer.

mod generating_policy;
mod policy;
mod update_request;

pub use generating_policy::*;
pub use policy::*;
pub use update_request::*;
