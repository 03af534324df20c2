//! # Errors
//!
//! Error taxonomy for UpdateRequest processing.
//!
//! The background pipeline makes retry decisions from the error class alone:
//!
//! - **NotFound**: the UR, policy or trigger is already gone. Terminal, never retried.
//! - **Conflict**: an optimistic write raced another writer. Retried.
//! - **Transient**: any other API or transport failure. Propagated and retried.
//! - **RuleFailed**: a policy rule did not pass. Recorded on the UR and retried up to the ceiling.

use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while producing, reconciling or cleaning up UpdateRequests
#[derive(Debug, Error)]
pub enum Error {
    /// Object does not exist
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    /// Optimistic concurrency check failed
    #[error("conflict updating {kind} '{name}': {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    /// Object already exists on create
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: String, name: String },

    /// Any other API status response
    #[error("API request failed ({code}): {message}")]
    Api { code: u16, message: String },

    /// Transport or client-side error from kube
    #[error("Kubernetes client error: {0}")]
    Kube(#[source] kube::Error),

    /// One or more rules did not pass
    #[error("{0}")]
    RuleFailed(String),

    /// Trigger is missing and the UR is waiting for the orphan threshold
    #[error("trigger {0} not found, will retry")]
    TriggerNotReady(String),

    /// Policy reference is neither `name` nor `namespace/name`
    #[error("invalid policy key '{0}'")]
    InvalidPolicyKey(String),

    /// Annotation holds a value that cannot be parsed
    #[error("invalid value '{value}' for annotation {key}")]
    InvalidAnnotation { key: String, value: String },

    /// Object could not be converted to or from JSON
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rule engine collaborator failed
    #[error("engine error: {0}")]
    Engine(String),
}

impl Error {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn conflict(
        kind: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Conflict {
            kind: kind.into(),
            name: name.into(),
            message: message.into(),
        }
    }

    /// Classify a kube client error for the given object
    pub fn from_kube(err: kube::Error, kind: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(api_err) if api_err.code == 404 => Error::not_found(kind, name),
            kube::Error::Api(api_err)
                if api_err.code == 409 && api_err.reason == "AlreadyExists" =>
            {
                Error::AlreadyExists {
                    kind: kind.to_string(),
                    name: name.to_string(),
                }
            }
            kube::Error::Api(api_err) if api_err.code == 409 => {
                Error::conflict(kind, name, api_err.message.clone())
            }
            kube::Error::Api(api_err) => Error::Api {
                code: api_err.code,
                message: api_err.message.clone(),
            },
            other => Error::Kube(other),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    /// Transient errors must never be masked by cached state
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Api { code, .. } => *code == 429 || *code >= 500,
            Error::Kube(_) | Error::Conflict { .. } | Error::TriggerNotReady(_) => true,
            _ => false,
        }
    }

    /// Short machine-readable label for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "not_found",
            Error::Conflict { .. } => "conflict",
            Error::AlreadyExists { .. } => "already_exists",
            Error::Api { .. } => "api",
            Error::Kube(_) => "transport",
            Error::RuleFailed(_) => "rule_failed",
            Error::TriggerNotReady(_) => "trigger_not_ready",
            Error::InvalidPolicyKey(_) => "invalid_policy_key",
            Error::InvalidAnnotation { .. } => "invalid_annotation",
            Error::Serialization(_) => "serialization",
            Error::Engine(_) => "engine",
        }
    }
}
