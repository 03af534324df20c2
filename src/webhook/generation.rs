//! # Generate Dispatch
//!
//! Three paths run for every admitted request:
//!
//! - **trigger**: the resource matches generate policies. Passing rules become
//!   a generate UR; on UPDATE, synchronize rules that stopped passing have
//!   their downstream deleted right away.
//! - **non-trigger**: the resource is a clone source or a synchronized
//!   downstream resource, detected by labels alone. Drift bumps the owning UR
//!   instead of re-running rule matching.
//! - **generating policies**: CEL policies whose match constraints select the
//!   request become `celgenerate` URs.
//!
//! Dry-run requests have no side effects.

use super::{AdmissionRequest, Dispatched};
use crate::client::Clients;
use crate::controller::generate::{clone, downstream, pattern};
use crate::controller::generator::Generator;
use crate::controller::updater;
use crate::crd::{
    AnyPolicy, GeneratingPolicy, Operation, RequestType, ResourceSpec, Rule, RuleContext,
    UpdateRequestContext, UpdateRequestSpec,
};
use crate::engine::{Engine, PolicyContext, RuleStatus, RuleType};
use crate::event::{Event, EventSink};
use crate::labels::{
    clone_policies, is_synchronized_downstream, trigger_from_downstream, DedupKey, Labels,
    CLONE_POLICY_NAME_LABEL, CLONE_SOURCE_LABEL, DOWNSTREAM_POLICY_NAMESPACE_LABEL,
    DOWNSTREAM_POLICY_NAME_LABEL, DOWNSTREAM_RULE_NAME_LABEL,
};
use crate::policy::{compute_rules, find_rule};
use crate::Result;
use kube::ResourceExt;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument, Level};

/// Turns admission events into background work
pub struct GenerationHandler {
    clients: Clients,
    engine: Arc<dyn Engine>,
    events: Arc<dyn EventSink>,
    generator: Arc<Generator>,
}

impl std::fmt::Debug for GenerationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationHandler")
            .field("generator", &self.generator)
            .finish_non_exhaustive()
    }
}

/// Labels of a JSON object, empty when unset
fn value_labels(object: &Value) -> Labels {
    object
        .pointer("/metadata/labels")
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Delete what `rule` generated for `trigger`, recorded on its URs or found by label
async fn delete_rule_downstream(
    clients: &Clients,
    policy_key: &str,
    rule: &Rule,
    trigger: &ResourceSpec,
) -> Result<()> {
    let selector = DedupKey::new(RequestType::Generate, policy_key, Some(trigger)).labels();
    let recorded: Vec<ResourceSpec> = clients
        .urs
        .list(&selector)
        .await?
        .iter()
        .filter(|ur| ur.spec.policy == policy_key)
        .flat_map(|ur| ur.generated_resources().to_vec())
        .collect();
    let targets = downstream::rule_targets(
        clients.resources.as_ref(),
        policy_key,
        rule,
        Some(trigger),
        &recorded,
    )
    .await?;
    downstream::delete_all(clients.resources.as_ref(), &targets, "rule-failed").await?;
    Ok(())
}

/// Policy key recorded on a downstream resource
fn downstream_policy_key(labels: &Labels) -> Option<String> {
    let name = labels.get(DOWNSTREAM_POLICY_NAME_LABEL)?;
    Some(match labels.get(DOWNSTREAM_POLICY_NAMESPACE_LABEL) {
        Some(namespace) if !namespace.is_empty() => format!("{namespace}/{name}"),
        _ => name.clone(),
    })
}

impl GenerationHandler {
    pub fn new(
        clients: Clients,
        engine: Arc<dyn Engine>,
        events: Arc<dyn EventSink>,
        generator: Arc<Generator>,
    ) -> Self {
        Self {
            clients,
            engine,
            events,
            generator,
        }
    }

    /// Dispatch background work for one admission request
    ///
    /// `policies` are the generate policies matched for the request and
    /// `generating` the CEL generating policies whose match constraints select it.
    pub async fn handle(
        &self,
        req: &AdmissionRequest,
        policies: &[AnyPolicy],
        generating: &[Arc<GeneratingPolicy>],
    ) -> Dispatched {
        let span = tracing::span!(
            Level::INFO,
            "controller.webhook.generate",
            uid = %req.request.uid,
            operation = req.operation().as_str(),
            kind = %req.request.kind.kind,
            name = %req.request.name
        );
        self.dispatch(req, policies, generating).instrument(span).await
    }

    async fn dispatch(
        &self,
        req: &AdmissionRequest,
        policies: &[AnyPolicy],
        generating: &[Arc<GeneratingPolicy>],
    ) -> Dispatched {
        let mut dispatched = Dispatched::default();
        if req.request.dry_run {
            debug!("dry-run request, no background work");
            return dispatched;
        }
        let Some(resource) = req.resource() else {
            return dispatched;
        };

        self.handle_non_trigger(req, resource, policies, &mut dispatched);

        for policy in policies.iter().filter(|p| p.has_generate_rules()) {
            if let Err(e) = self.handle_trigger(req, resource, policy, &mut dispatched).await {
                warn!(policy = %policy.key(), error = %e, "❌ failed to dispatch generate rules");
                self.events
                    .emit(Event::failed(
                        ResourceSpec::from_object(resource),
                        format!("policy {} background dispatch failed: {e}", policy.key()),
                    ))
                    .await;
            }
        }

        for policy in generating {
            self.handle_generating(req, resource, policy, &mut dispatched);
        }
        dispatched
    }

    /// Generate rules of one policy against the request's resource
    async fn handle_trigger(
        &self,
        req: &AdmissionRequest,
        resource: &Value,
        policy: &AnyPolicy,
        dispatched: &mut Dispatched,
    ) -> Result<()> {
        let trigger = ResourceSpec::from_object(resource);
        let rules = compute_rules(policy);
        let mut contexts: Vec<RuleContext> = Vec::new();
        let mut regressed: Vec<Rule> = Vec::new();

        let ctx = PolicyContext::new(policy.clone())
            .with_new_resource(Some(resource.clone()))
            .with_old_resource(req.request.old_object.clone())
            .with_operation(Some(req.operation()))
            .with_user_info(req.user_info.clone());

        match req.operation() {
            Operation::Delete => {
                let delete_triggered: Vec<&Rule> =
                    rules.iter().filter(|r| r.has_generate() && r.fires_on_delete()).collect();
                if !delete_triggered.is_empty() {
                    let responses = self.engine.apply_background_checks(&ctx).await?;
                    for rule in &delete_triggered {
                        let passed = responses.iter().any(|r| {
                            r.name == rule.name
                                && r.rule_type == RuleType::Generation
                                && r.passed()
                        });
                        if passed {
                            contexts.push(rule_context(rule, &trigger, false));
                        }
                    }
                }
                for rule in rules.iter().filter(|r| !r.fires_on_delete()) {
                    if rule.generate.as_ref().is_some_and(|g| g.synchronize) {
                        contexts.push(rule_context(rule, &trigger, true));
                    }
                }
            }
            Operation::Create | Operation::Update => {
                let responses = self.engine.apply_background_checks(&ctx).await?;
                for response in responses
                    .iter()
                    .filter(|r| r.rule_type == RuleType::Generation)
                {
                    let Some(rule) = rules.iter().find(|r| r.name == response.name) else {
                        continue;
                    };
                    if response.status == RuleStatus::Pass {
                        contexts.push(rule_context(rule, &trigger, false));
                    } else if req.operation() == Operation::Update
                        && rule.generate.as_ref().is_some_and(|g| g.synchronize)
                    {
                        debug!(
                            rule = %rule.name,
                            status = %response.status,
                            "synchronized rule no longer passes"
                        );
                        regressed.push(rule.clone());
                    }
                }
            }
            Operation::Connect => {}
        }

        let spec = if contexts.is_empty() {
            None
        } else {
            info!(policy = %policy.key(), rules = contexts.len(), "queueing generate request");
            Some(UpdateRequestSpec {
                request_type: RequestType::Generate,
                policy: policy.key(),
                resource: None,
                rule_context: contexts,
                context: req.context(),
            })
        };
        // the regressed rules' downstream must be gone before the UR is produced
        if regressed.is_empty() {
            if let Some(spec) = spec {
                dispatched.push(self.generator.apply(spec));
            }
        } else {
            dispatched.push(self.spawn_downstream_deletion(policy, regressed, &trigger, spec));
        }
        Ok(())
    }

    /// Delete what failing synchronized rules generated for a trigger, then queue `then`
    fn spawn_downstream_deletion(
        &self,
        policy: &AnyPolicy,
        rules: Vec<Rule>,
        trigger: &ResourceSpec,
        then: Option<UpdateRequestSpec>,
    ) -> tokio::task::JoinHandle<()> {
        let clients = self.clients.clone();
        let generator = Arc::clone(&self.generator);
        let policy_key = policy.key();
        let trigger = trigger.clone();
        tokio::spawn(async move {
            for rule in &rules {
                if let Err(e) =
                    delete_rule_downstream(&clients, &policy_key, rule, &trigger).await
                {
                    warn!(
                        policy = %policy_key,
                        rule = %rule.name,
                        error = %e,
                        "failed to delete downstream of failing rule"
                    );
                }
            }
            if let Some(spec) = then {
                if let Err(e) = generator.apply_and_wait(spec).await {
                    error!(error = %e, "❌ giving up on update request after retry budget");
                }
            }
        })
    }

    /// Clone sources and synchronized downstream resources, recognised by label
    fn handle_non_trigger(
        &self,
        req: &AdmissionRequest,
        resource: &Value,
        policies: &[AnyPolicy],
        dispatched: &mut Dispatched,
    ) {
        let labels = value_labels(resource);

        if req.operation() == Operation::Update && labels.contains_key(CLONE_POLICY_NAME_LABEL) {
            for policy in clone_policies(&labels) {
                dispatched.push(self.spawn_policy_bump(policy));
            }
        }

        if !is_synchronized_downstream(&labels) {
            return;
        }
        let (Some(policy_key), Some(rule_name), Some(trigger)) = (
            downstream_policy_key(&labels),
            labels.get(DOWNSTREAM_RULE_NAME_LABEL).cloned(),
            trigger_from_downstream(&labels),
        ) else {
            return;
        };

        match req.operation() {
            Operation::Delete => {
                info!(policy = %policy_key, rule = %rule_name, "synchronized downstream deleted");
                let spec = regenerate_spec(&policy_key, &rule_name, trigger);
                dispatched.push(self.generator.apply(spec));
            }
            Operation::Update => {
                let known = policies.iter().find(|p| p.key() == policy_key).cloned();
                dispatched.push(self.spawn_drift_check(
                    known,
                    policy_key,
                    rule_name,
                    trigger,
                    resource.clone(),
                    labels,
                ));
            }
            Operation::Create | Operation::Connect => {}
        }
    }

    /// Bump every generate UR of a policy after its clone source changed
    fn spawn_policy_bump(&self, policy: String) -> tokio::task::JoinHandle<()> {
        let clients = self.clients.clone();
        tokio::spawn(async move {
            let selector = DedupKey::for_policy(RequestType::Generate, &policy).labels();
            let urs = match clients.urs.list(&selector).await {
                Ok(urs) => urs,
                Err(e) => {
                    warn!(%policy, error = %e, "failed to list update requests for clone source");
                    return;
                }
            };
            for ur in urs {
                let name = ur.name_any();
                if let Err(e) = updater::bump(clients.urs.as_ref(), &name).await {
                    warn!(ur.name = %name, error = %e, "failed to bump update request");
                }
            }
        })
    }

    /// Compare an updated downstream resource with what its rule declares
    fn spawn_drift_check(
        &self,
        known: Option<AnyPolicy>,
        policy_key: String,
        rule_name: String,
        trigger: ResourceSpec,
        live: Value,
        labels: Labels,
    ) -> tokio::task::JoinHandle<()> {
        let clients = self.clients.clone();
        let generator = Arc::clone(&self.generator);
        tokio::spawn(async move {
            let result = async {
                let policy = match known {
                    Some(policy) => policy,
                    None => clients.policies.get_policy(&policy_key).await?,
                };
                let rule = find_rule(&policy, &rule_name);
                let Some(generation) = rule.and_then(|r| r.generate) else {
                    return Ok(());
                };
                let in_sync = match labels.get(CLONE_SOURCE_LABEL) {
                    Some(source_name) => {
                        let namespace = generation
                            .clone
                            .as_ref()
                            .map(|c| c.namespace.clone())
                            .or_else(|| generation.clone_list.as_ref().map(|l| l.namespace.clone()))
                            .unwrap_or_default();
                        let identity = ResourceSpec::from_object(&live);
                        let source = ResourceSpec::new(
                            identity.api_version,
                            identity.kind,
                            namespace,
                            source_name,
                        );
                        match clients.resources.get(&source).await {
                            Ok(obj) => clone::in_sync(&live, &serde_json::to_value(&obj)?),
                            // nothing to restore from
                            Err(e) if e.is_not_found() => true,
                            Err(e) => return Err(e),
                        }
                    }
                    None => generation
                        .data
                        .as_ref()
                        .is_none_or(|data| pattern::validate(&live, data).is_ok()),
                };
                if in_sync {
                    return Ok(());
                }

                info!(policy = %policy_key, rule = %rule_name, "downstream drifted");
                let selector =
                    DedupKey::new(RequestType::Generate, &policy_key, Some(&trigger)).labels();
                let owners: Vec<_> = clients
                    .urs
                    .list(&selector)
                    .await?
                    .into_iter()
                    .filter(|ur| ur.spec.policy == policy_key)
                    .collect();
                if owners.is_empty() {
                    generator
                        .apply_and_wait(regenerate_spec(&policy_key, &rule_name, trigger))
                        .await?;
                } else {
                    for ur in owners {
                        updater::bump(clients.urs.as_ref(), &ur.name_any()).await?;
                    }
                }
                Ok(())
            }
            .await;
            if let Err(e) = result {
                warn!(policy = %policy_key, error = %e, "drift check failed");
            }
        })
    }

    /// CEL generating policy dispatch
    fn handle_generating(
        &self,
        req: &AdmissionRequest,
        resource: &Value,
        policy: &GeneratingPolicy,
        dispatched: &mut Dispatched,
    ) {
        let delete_downstream = match req.operation() {
            Operation::Create | Operation::Update => false,
            Operation::Delete if policy.spec.matches_delete() => false,
            Operation::Delete if policy.spec.synchronize_enabled() => true,
            Operation::Delete | Operation::Connect => return,
        };
        let name = policy.name_any();
        dispatched.push(self.generator.apply(UpdateRequestSpec {
            request_type: RequestType::CelGenerate,
            policy: name.clone(),
            resource: None,
            rule_context: vec![RuleContext {
                rule: name,
                trigger: ResourceSpec::from_object(resource),
                delete_downstream,
                synchronize: policy.spec.synchronize_enabled(),
                cache_restore: false,
            }],
            context: req.context(),
        }));
    }
}

fn rule_context(rule: &Rule, trigger: &ResourceSpec, delete_downstream: bool) -> RuleContext {
    RuleContext {
        rule: rule.name.clone(),
        trigger: trigger.clone(),
        delete_downstream,
        synchronize: rule.generate.as_ref().is_some_and(|g| g.synchronize),
        cache_restore: false,
    }
}

/// Spec that re-runs one rule for a trigger, without an admission snapshot
fn regenerate_spec(policy_key: &str, rule: &str, trigger: ResourceSpec) -> UpdateRequestSpec {
    UpdateRequestSpec {
        request_type: RequestType::Generate,
        policy: policy_key.to_string(),
        resource: None,
        rule_context: vec![RuleContext {
            rule: rule.to_string(),
            trigger,
            delete_downstream: false,
            synchronize: true,
            cache_restore: false,
        }],
        context: UpdateRequestContext::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::downstream_labels;

    #[test]
    fn test_downstream_policy_key() {
        let trigger = ResourceSpec::new("v1", "Namespace", "", "team-a");
        let cluster = downstream_labels("p", "r", Some(&trigger), true);
        assert_eq!(downstream_policy_key(&cluster).as_deref(), Some("p"));
        let namespaced = downstream_labels("team-a/p", "r", Some(&trigger), true);
        assert_eq!(downstream_policy_key(&namespaced).as_deref(), Some("team-a/p"));
    }

    #[test]
    fn test_value_labels_skips_non_strings() {
        let labels = value_labels(&serde_json::json!({"metadata": {"labels": {"a": "1", "b": 2}}}));
        assert_eq!(labels.len(), 1);
        assert_eq!(labels["a"], "1");
    }
}
