//! # Events
//!
//! Success and failure notices about background work. Events are the only
//! user-visible failure surface besides UR status.

use crate::constants::CONTROLLER_NAME;
use crate::crd::ResourceSpec;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event as KubeEvent, EventType, Recorder, Reporter};
use kube::Client;
use std::sync::{Mutex, PoisonError};
use tracing::warn;

pub const REASON_POLICY_APPLIED: &str = "PolicyApplied";
pub const REASON_POLICY_ERROR: &str = "PolicyError";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// An event about an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub reason: &'static str,
    pub action: &'static str,
    pub note: String,
    pub regarding: ResourceSpec,
}

impl Event {
    pub fn applied(regarding: ResourceSpec, note: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Normal,
            reason: REASON_POLICY_APPLIED,
            action: "Generate",
            note: note.into(),
            regarding,
        }
    }

    pub fn failed(regarding: ResourceSpec, note: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Warning,
            reason: REASON_POLICY_ERROR,
            action: "Generate",
            note: note.into(),
            regarding,
        }
    }

    #[must_use]
    pub fn with_action(mut self, action: &'static str) -> Self {
        self.action = action;
        self
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish without failing the caller
    async fn emit(&self, event: Event);
}

/// Publishes events through the Kubernetes events API
pub struct KubeEventSink {
    recorder: Recorder,
}

impl std::fmt::Debug for KubeEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventSink").finish_non_exhaustive()
    }
}

impl KubeEventSink {
    pub fn new(client: Client, instance: &str) -> Self {
        let reporter = Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: Some(instance.to_string()),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

fn object_reference(spec: &ResourceSpec) -> ObjectReference {
    ObjectReference {
        api_version: Some(spec.api_version.clone()),
        kind: Some(spec.kind.clone()),
        name: Some(spec.name.clone()),
        namespace: (!spec.namespace.is_empty()).then(|| spec.namespace.clone()),
        uid: (!spec.uid.is_empty()).then(|| spec.uid.clone()),
        ..Default::default()
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn emit(&self, event: Event) {
        let kube_event = KubeEvent {
            type_: match event.kind {
                EventKind::Normal => EventType::Normal,
                EventKind::Warning => EventType::Warning,
            },
            reason: event.reason.to_string(),
            note: Some(event.note.clone()),
            action: event.action.to_string(),
            secondary: None,
        };
        if let Err(e) = self
            .recorder
            .publish(&kube_event, &object_reference(&event.regarding))
            .await
        {
            warn!(regarding = %event.regarding, error = %e, "failed to publish event");
        }
    }
}

/// Keeps emitted events in memory
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn warnings(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind == EventKind::Warning)
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn emit(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_reference_omits_empty_fields() {
        let reference = object_reference(&ResourceSpec::new("v1", "Namespace", "", "team-a"));
        assert_eq!(reference.namespace, None);
        assert_eq!(reference.uid, None);
        assert_eq!(reference.name.as_deref(), Some("team-a"));
    }

    #[tokio::test]
    async fn test_recording_sink_filters_warnings() {
        let sink = RecordingEventSink::new();
        let target = ResourceSpec::new("v1", "ConfigMap", "default", "cm");
        sink.emit(Event::applied(target.clone(), "created")).await;
        sink.emit(Event::failed(target, "boom")).await;
        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.warnings().len(), 1);
        assert_eq!(sink.warnings()[0].reason, REASON_POLICY_ERROR);
    }
}
