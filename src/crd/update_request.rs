//! # UpdateRequest
//!
//! The durable work-queue record for background generate and mutate actions.
//!
//! ```yaml
//! apiVersion: kyverno.io/v2
//! kind: UpdateRequest
//! metadata:
//!   generateName: ur-
//!   namespace: kyverno
//!   labels:
//!     generate.kyverno.io/policy-name: add-networkpolicy
//!     generate.kyverno.io/resource-kind: Namespace
//!     generate.kyverno.io/resource-name: team-a
//! spec:
//!   requestType: generate
//!   policy: add-networkpolicy
//!   ruleContext:
//!     - rule: default-deny
//!       trigger:
//!         apiVersion: v1
//!         kind: Namespace
//!         name: team-a
//!       synchronize: true
//! status:
//!   state: Pending
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// UpdateRequest spec
#[derive(kube::CustomResource, Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "UpdateRequest",
    group = "kyverno.io",
    version = "v2",
    namespaced,
    status = "UpdateRequestStatus",
    shortname = "ur",
    printcolumn = r#"{"name":"Policy", "type":"string", "jsonPath":".spec.policy"}, {"name":"RuleType", "type":"string", "jsonPath":".spec.requestType"}, {"name":"Status", "type":"string", "jsonPath":".status.state"}, {"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequestSpec {
    /// Type of background action
    pub request_type: RequestType,
    /// Owning policy: `name` for cluster policies, `namespace/name` for namespaced ones
    pub policy: String,
    /// Single trigger identity, kept for mutate requests written by older producers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceSpec>,
    /// One entry per rule that produced this intent
    #[serde(default)]
    pub rule_context: Vec<RuleContext>,
    /// Requester identity and admission snapshot
    #[serde(default)]
    pub context: UpdateRequestContext,
}

/// Background action kind
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize, schemars::JsonSchema,
)]
pub enum RequestType {
    #[serde(rename = "mutate")]
    Mutate,
    #[default]
    #[serde(rename = "generate")]
    Generate,
    /// Produced by a CEL-based GeneratingPolicy
    #[serde(rename = "celgenerate")]
    CelGenerate,
}

impl RequestType {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::Mutate => "mutate",
            RequestType::Generate => "generate",
            RequestType::CelGenerate => "celgenerate",
        }
    }

    /// Generate and CEL generate share the generate label family
    pub fn is_generate(self) -> bool {
        matches!(self, RequestType::Generate | RequestType::CelGenerate)
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a Kubernetes object
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
}

impl ResourceSpec {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            uid: String::new(),
        }
    }

    /// Build an identity from a raw object
    pub fn from_object(obj: &serde_json::Value) -> Self {
        let field = |path: &[&str]| {
            path.iter()
                .try_fold(obj, |v, key| v.get(key))
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            api_version: field(&["apiVersion"]),
            kind: field(&["kind"]),
            namespace: field(&["metadata", "namespace"]),
            name: field(&["metadata", "name"]),
            uid: field(&["metadata", "uid"]),
        }
    }

    /// API group, empty for the core group
    pub fn group(&self) -> &str {
        self.api_version
            .split_once('/')
            .map_or("", |(group, _)| group)
    }

    pub fn version(&self) -> &str {
        self.api_version
            .split_once('/')
            .map_or(self.api_version.as_str(), |(_, version)| version)
    }

    /// Same object regardless of uid
    pub fn same_object(&self, other: &ResourceSpec) -> bool {
        self.api_version == other.api_version
            && self.kind == other.kind
            && self.namespace == other.namespace
            && self.name == other.name
    }
}

impl fmt::Display for ResourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}/{}", self.api_version, self.kind, self.name)
        } else {
            write!(
                f,
                "{}/{}/{}/{}",
                self.api_version, self.kind, self.namespace, self.name
            )
        }
    }
}

/// Per-rule intent carried by a UR
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuleContext {
    pub rule: String,
    #[serde(default)]
    pub trigger: ResourceSpec,
    /// Delete downstream resources instead of generating them
    #[serde(default)]
    pub delete_downstream: bool,
    #[serde(default)]
    pub synchronize: bool,
    #[serde(default)]
    pub cache_restore: bool,
}

/// Request context replayed by the executors
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequestContext {
    #[serde(default)]
    pub user_info: RequestInfo,
    #[serde(default)]
    pub admission_request_info: AdmissionRequestInfo,
}

/// Requester identity
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestInfo {
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub cluster_roles: Vec<String>,
    #[serde(default)]
    pub user_info: UserInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequestInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admission_request: Option<AdmissionRequestSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
}

/// Admission operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Connect,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Connect => "CONNECT",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
}

impl GroupVersionKind {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// Snapshot of the triggering admission request
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequestSnapshot {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub kind: GroupVersionKind,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub_resource: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_object: Option<serde_json::Value>,
}

/// UpdateRequest status
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequestStatus {
    /// Claim token of the worker currently processing this UR, empty when unclaimed
    #[serde(default)]
    pub handler: String,
    /// RFC 3339 time the current handler took its claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<String>,
    /// Empty until the Generator sets Pending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<UrState>,
    #[serde(default)]
    pub message: String,
    /// Downstream resources written on behalf of this UR
    #[serde(default)]
    pub generated_resources: Vec<ResourceSpec>,
}

/// UR state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub enum UrState {
    Pending,
    Completed,
    Failed,
    Skip,
}

impl UrState {
    pub fn as_str(self) -> &'static str {
        match self {
            UrState::Pending => "Pending",
            UrState::Completed => "Completed",
            UrState::Failed => "Failed",
            UrState::Skip => "Skip",
        }
    }
}

impl fmt::Display for UrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl UpdateRequest {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn state(&self) -> Option<UrState> {
        self.status.as_ref().and_then(|s| s.state)
    }

    pub fn handler(&self) -> &str {
        self.status.as_ref().map_or("", |s| s.handler.as_str())
    }

    /// When the current claim was taken; `None` for unclaimed or unstamped URs
    pub fn claimed_at(&self) -> Option<DateTime<Utc>> {
        let stamp = self.status.as_ref()?.claimed_at.as_deref()?;
        DateTime::parse_from_rfc3339(stamp)
            .ok()
            .map(|at| at.with_timezone(&Utc))
    }

    pub fn generated_resources(&self) -> &[ResourceSpec] {
        self.status
            .as_ref()
            .map_or(&[], |s| s.generated_resources.as_slice())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Admission operation recorded with the request
    pub fn operation(&self) -> Option<Operation> {
        let info = &self.spec.context.admission_request_info;
        info.operation
            .or_else(|| info.admission_request.as_ref().map(|r| r.operation))
    }

    /// Trigger identities in rule order, falling back to `spec.resource`
    pub fn triggers(&self) -> Vec<&ResourceSpec> {
        if self.spec.rule_context.is_empty() {
            self.spec.resource.iter().collect()
        } else {
            self.spec.rule_context.iter().map(|rc| &rc.trigger).collect()
        }
    }
}
