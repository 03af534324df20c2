//! # Admission Dispatch
//!
//! Entry points called from the admission webhook after policy matching. They
//! decide which background work an admission event implies and hand it to the
//! [`Generator`](crate::controller::generator::Generator) as detached tasks.
//! Nothing here fails or delays the admission response: errors are logged and
//! surfaced as events.

pub mod generation;

use crate::crd::{
    AdmissionRequestInfo, AdmissionRequestSnapshot, Operation, RequestInfo, UpdateRequestContext,
};
use serde_json::Value;
use tokio::task::JoinHandle;

/// An admission request as seen by the background dispatch
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub request: AdmissionRequestSnapshot,
    pub user_info: RequestInfo,
}

impl AdmissionRequest {
    pub fn operation(&self) -> Operation {
        self.request.operation
    }

    /// The object the request is about: the old object for DELETE
    pub fn resource(&self) -> Option<&Value> {
        match self.request.operation {
            Operation::Delete => self.request.old_object.as_ref(),
            _ => self.request.object.as_ref(),
        }
    }

    /// UR context carrying the full admission snapshot
    pub fn context(&self) -> UpdateRequestContext {
        UpdateRequestContext {
            user_info: self.user_info.clone(),
            admission_request_info: AdmissionRequestInfo {
                admission_request: Some(self.request.clone()),
                operation: Some(self.request.operation),
            },
        }
    }
}

/// Background tasks started for one admission request
#[derive(Debug, Default)]
pub struct Dispatched {
    tasks: Vec<JoinHandle<()>>,
}

impl Dispatched {
    pub(crate) fn push(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task; admission handlers never call this
    pub async fn wait(self) {
        futures::future::join_all(self.tasks).await;
    }
}
