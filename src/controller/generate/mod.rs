//! # Generate Executor
//!
//! Processes one claimed generate UR: for every rule context it resolves the
//! trigger, asks the engine whether the rule applies, and creates, updates or
//! deletes downstream resources accordingly.
//!
//! ## Rule outcomes
//!
//! - **applied**: downstream written (data, clone or cloneList mode) or
//!   deleted for a `deleteDownstream` context
//! - **skipped**: the engine did not select the rule for this trigger
//! - **failed**: the rule is missing, the engine reported a non-pass status,
//!   or a clone source does not exist
//!
//! Any failure marks the UR Failed and is returned so the queue retries it.
//! Transient API errors are returned without a status write.

pub mod cel;
pub mod clone;
pub mod downstream;
pub mod pattern;
pub mod trigger;

use crate::client::{object_identity, object_labels, Clients};
use crate::controller::updater;
use crate::crd::{
    AnyPolicy, CloneFrom, CloneList, Generation, Operation, ResourceSpec, Rule, RuleContext,
    UpdateRequest,
};
use crate::engine::{Engine, PolicyContext, RuleStatus, RuleType};
use crate::event::{Event, EventSink};
use crate::labels::{
    clone_policies, downstream_labels, label_value, policy_name, Labels, CLONE_POLICY_NAME_LABEL,
    CLONE_SOURCE_LABEL,
};
use crate::policy::compute_rules;
use crate::{Error, Result};
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, Instrument, Level};

/// What processing the rule contexts of one UR produced
#[derive(Debug, Default)]
pub(crate) struct Outcome {
    /// Recorded downstream after this run, including what was written
    pub generated: Vec<ResourceSpec>,
    pub written: Vec<ResourceSpec>,
    pub failures: Vec<(ResourceSpec, String)>,
    pub applied: usize,
}

impl Outcome {
    fn starting_from(ur: &UpdateRequest) -> Self {
        Self {
            generated: ur.generated_resources().to_vec(),
            ..Self::default()
        }
    }

    fn forget(&mut self, deleted: &[ResourceSpec]) {
        self.generated
            .retain(|g| !deleted.iter().any(|d| d.same_object(g)));
    }

    /// Persist the outcome on the UR and publish events
    pub(crate) async fn finish(
        mut self,
        clients: &Clients,
        events: &dyn EventSink,
        ur: &UpdateRequest,
        source: &str,
    ) -> Result<()> {
        let name = ur.name_any();
        self.generated = updater::merge_resources(&self.generated, &self.written);

        if !self.failures.is_empty() {
            let message = self
                .failures
                .iter()
                .map(|(_, m)| m.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            updater::mark_failed(clients.urs.as_ref(), &name, &message, &self.generated).await?;
            for (regarding, note) in self.failures {
                events.emit(Event::failed(regarding, note)).await;
            }
            return Err(Error::RuleFailed(message));
        }

        if self.applied == 0 {
            debug!(ur.name = %name, "no rule applied");
            updater::mark_skipped(clients.urs.as_ref(), &name).await?;
            return Ok(());
        }

        updater::mark_completed(clients.urs.as_ref(), &name, &self.generated).await?;
        for target in self.written {
            events
                .emit(Event::applied(target, format!("resource generated by {source}")))
                .await;
        }
        Ok(())
    }
}

/// Executes classic (`ClusterPolicy` / `Policy`) generate rules
pub struct GenerateExecutor {
    clients: Clients,
    engine: Arc<dyn Engine>,
    events: Arc<dyn EventSink>,
    orphan_retry_threshold: u32,
}

impl std::fmt::Debug for GenerateExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerateExecutor")
            .field("orphan_retry_threshold", &self.orphan_retry_threshold)
            .finish_non_exhaustive()
    }
}

impl GenerateExecutor {
    pub fn new(
        clients: Clients,
        engine: Arc<dyn Engine>,
        events: Arc<dyn EventSink>,
        orphan_retry_threshold: u32,
    ) -> Self {
        Self {
            clients,
            engine,
            events,
            orphan_retry_threshold,
        }
    }

    pub async fn process(&self, ur: &UpdateRequest) -> Result<()> {
        let span = tracing::span!(
            Level::INFO,
            "controller.generate.process",
            ur.name = %ur.name_any(),
            policy = %ur.spec.policy
        );
        self.process_rules(ur).instrument(span).await
    }

    async fn process_rules(&self, ur: &UpdateRequest) -> Result<()> {
        let policy = self.clients.policies.get_policy(&ur.spec.policy).await?;
        let rules = compute_rules(&policy);
        let mut outcome = Outcome::starting_from(ur);

        for rc in &ur.spec.rule_context {
            let Some(rule) = rules.iter().find(|r| r.name == rc.rule) else {
                outcome.failures.push((
                    rc.trigger.clone(),
                    format!("rule {} not found in policy {}", rc.rule, policy.key()),
                ));
                continue;
            };

            if rc.delete_downstream {
                let targets = downstream::rule_targets(
                    self.clients.resources.as_ref(),
                    &policy.key(),
                    rule,
                    Some(&rc.trigger),
                    &outcome.generated,
                )
                .await?;
                let deleted = downstream::delete_all(
                    self.clients.resources.as_ref(),
                    &targets,
                    "delete-downstream",
                )
                .await?;
                outcome.forget(&deleted);
                outcome.applied += 1;
                continue;
            }

            let Some(trigger) =
                trigger::load(self.clients.resources.as_ref(), ur, &rc.trigger).await?
            else {
                if ur.operation() == Some(Operation::Delete) {
                    debug!(rule = %rc.rule, trigger = %rc.trigger, "trigger deleted, skipping");
                    continue;
                }
                return trigger::handle_missing(
                    &self.clients,
                    ur,
                    &rc.trigger,
                    self.orphan_retry_threshold,
                )
                .await;
            };

            match self
                .apply_rule(ur, &policy, rule, rc, &trigger, &outcome.generated)
                .await
            {
                Ok(Some(written)) => {
                    outcome.applied += 1;
                    outcome.written.extend(written);
                }
                Ok(None) => debug!(rule = %rule.name, "rule not applicable to trigger"),
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => outcome
                    .failures
                    .push((ResourceSpec::from_object(&trigger), e.to_string())),
            }
        }

        let source = format!("policy {}", policy.key());
        outcome
            .finish(&self.clients, self.events.as_ref(), ur, &source)
            .await
    }

    /// Evaluate one rule and write its downstream; `None` when it does not apply
    async fn apply_rule(
        &self,
        ur: &UpdateRequest,
        policy: &AnyPolicy,
        rule: &Rule,
        rc: &RuleContext,
        trigger: &Value,
        previously: &[ResourceSpec],
    ) -> Result<Option<Vec<ResourceSpec>>> {
        let old_resource = ur
            .spec
            .context
            .admission_request_info
            .admission_request
            .as_ref()
            .and_then(|s| s.old_object.clone());
        let ctx = PolicyContext::new(policy.clone())
            .with_new_resource(Some(trigger.clone()))
            .with_old_resource(old_resource)
            .with_operation(ur.operation())
            .with_user_info(ur.spec.context.user_info.clone());

        let responses = self.engine.apply_background_checks(&ctx).await?;
        let Some(response) = responses
            .into_iter()
            .find(|r| r.name == rule.name && r.rule_type == RuleType::Generation)
        else {
            return Ok(None);
        };
        match response.status {
            RuleStatus::Pass => {}
            RuleStatus::Skip => return Ok(None),
            status if response.message.is_empty() => {
                return Err(Error::RuleFailed(format!("rule {} {status}", rule.name)));
            }
            _ => {
                return Err(Error::RuleFailed(format!(
                    "rule {}: {}",
                    rule.name, response.message
                )));
            }
        }

        let generation = response
            .generation
            .or_else(|| rule.generate.clone())
            .ok_or_else(|| Error::RuleFailed(format!("rule {} has no generate body", rule.name)))?;
        let mut trigger_spec = ResourceSpec::from_object(trigger);
        if trigger_spec.name.is_empty() {
            trigger_spec.clone_from(&rc.trigger);
        }
        let labels = downstream_labels(
            &policy.key(),
            &rule.name,
            Some(&trigger_spec),
            generation.synchronize,
        );

        let written = if let Some(list) = &generation.clone_list {
            self.generate_clone_list(&policy.key(), &generation, list, &labels, previously)
                .await?
        } else if let Some(clone) = generation.clone.as_ref().filter(|c| !c.name.is_empty()) {
            self.generate_clone(&policy.key(), &generation, clone, &labels, previously)
                .await?
        } else {
            self.generate_data(&generation, &labels, previously).await?
        };
        Ok(Some(written))
    }

    async fn generate_data(
        &self,
        generation: &Generation,
        labels: &Labels,
        previously: &[ResourceSpec],
    ) -> Result<Vec<ResourceSpec>> {
        let target = ResourceSpec::new(
            &generation.api_version,
            &generation.kind,
            &generation.namespace,
            &generation.name,
        );
        let data = generation
            .data
            .clone()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        let desired = downstream::build_object(&target, &data, labels)?;
        let written = downstream::write(
            self.clients.resources.as_ref(),
            desired,
            generation.synchronize,
            previously,
            |live| pattern::validate(live, &data).is_ok() && downstream::has_labels(live, labels),
        )
        .await?;
        Ok(written.into_iter().collect())
    }

    async fn generate_clone(
        &self,
        policy_key: &str,
        generation: &Generation,
        clone: &CloneFrom,
        labels: &Labels,
        previously: &[ResourceSpec],
    ) -> Result<Vec<ResourceSpec>> {
        let source = ResourceSpec::new(
            &generation.api_version,
            &generation.kind,
            &clone.namespace,
            &clone.name,
        );
        let target = ResourceSpec::new(
            &generation.api_version,
            &generation.kind,
            &generation.namespace,
            &generation.name,
        );
        if source.same_object(&target) {
            debug!(%source, "clone source is its own target, skipping");
            return Ok(Vec::new());
        }
        let source_obj = match self.clients.resources.get(&source).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => {
                return Err(Error::RuleFailed(format!("clone source {source} not found")));
            }
            Err(e) => return Err(e),
        };
        let written = self
            .clone_into(
                policy_key,
                source_obj,
                &target,
                generation.synchronize,
                labels,
                previously,
            )
            .await?;
        Ok(written.into_iter().collect())
    }

    async fn generate_clone_list(
        &self,
        policy_key: &str,
        generation: &Generation,
        list: &CloneList,
        labels: &Labels,
        previously: &[ResourceSpec],
    ) -> Result<Vec<ResourceSpec>> {
        let mut written = Vec::new();
        for entry in &list.kinds {
            let Some((api_version, kind)) = entry.rsplit_once('/') else {
                return Err(Error::RuleFailed(format!(
                    "cloneList kind {entry} is not in apiVersion/kind form"
                )));
            };
            let sources = self
                .clients
                .resources
                .list(api_version, kind, &list.namespace, list.selector.as_deref())
                .await?;
            for source in sources {
                let target =
                    ResourceSpec::new(api_version, kind, &generation.namespace, source.name_any());
                if object_identity(&source).same_object(&target) {
                    continue;
                }
                if let Some(spec) = self
                    .clone_into(
                        policy_key,
                        source,
                        &target,
                        generation.synchronize,
                        labels,
                        previously,
                    )
                    .await?
                {
                    written.push(spec);
                }
            }
        }
        Ok(written)
    }

    async fn clone_into(
        &self,
        policy_key: &str,
        source: DynamicObject,
        target: &ResourceSpec,
        synchronize: bool,
        labels: &Labels,
        previously: &[ResourceSpec],
    ) -> Result<Option<ResourceSpec>> {
        if synchronize {
            self.label_clone_source(policy_key, &source).await?;
        }
        let source_value = serde_json::to_value(&source)?;
        let content = clone::retarget(&source_value, &target.namespace, &target.name);
        let mut labels = labels.clone();
        labels.insert(CLONE_SOURCE_LABEL.to_string(), label_value(&source.name_any()));
        let desired = downstream::build_object(target, &content, &labels)?;
        downstream::write(
            self.clients.resources.as_ref(),
            desired,
            synchronize,
            previously,
            |live| clone::in_sync(live, &source_value) && downstream::has_labels(live, &labels),
        )
        .await
    }

    /// Record the policy on the clone source so source updates reach its URs
    async fn label_clone_source(&self, policy_key: &str, source: &DynamicObject) -> Result<()> {
        let mut labels = object_labels(source);
        let mut policies = clone_policies(&labels);
        let name = policy_name(policy_key);
        if policies.iter().any(|p| p == name) {
            return Ok(());
        }
        policies.push(name.to_string());
        labels.insert(CLONE_POLICY_NAME_LABEL.to_string(), policies.join(","));
        let mut updated = source.clone();
        updated.metadata.labels = Some(labels);
        self.clients.resources.update(&updated).await?;
        info!(source = %object_identity(source), policy = name, "labelled clone source");
        Ok(())
    }
}
