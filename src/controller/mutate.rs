//! # Mutate-Existing Executor
//!
//! Applies mutate-existing rules in the background. The engine computes the
//! patched targets; this executor writes them back and records the outcome.

use crate::client::{object_identity, Clients};
use crate::controller::updater;
use crate::crd::{ResourceSpec, UpdateRequest};
use crate::engine::{Engine, PolicyContext, RuleStatus};
use crate::event::{Event, EventSink};
use crate::observability::metrics;
use crate::policy::compute_rules;
use crate::{Error, Result};
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info, Instrument, Level};

pub struct MutateExecutor {
    clients: Clients,
    engine: Arc<dyn Engine>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for MutateExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutateExecutor").finish_non_exhaustive()
    }
}

impl MutateExecutor {
    pub fn new(clients: Clients, engine: Arc<dyn Engine>, events: Arc<dyn EventSink>) -> Self {
        Self {
            clients,
            engine,
            events,
        }
    }

    pub async fn process(&self, ur: &UpdateRequest) -> Result<()> {
        let span = tracing::span!(
            Level::INFO,
            "controller.mutate.process",
            ur.name = %ur.name_any(),
            policy = %ur.spec.policy
        );
        self.process_rules(ur).instrument(span).await
    }

    async fn process_rules(&self, ur: &UpdateRequest) -> Result<()> {
        let name = ur.name_any();
        let policy = self.clients.policies.get_policy(&ur.spec.policy).await?;

        // legacy URs carry a single resource and apply every mutate rule
        let work: Vec<(String, ResourceSpec)> = if ur.spec.rule_context.is_empty() {
            let Some(resource) = ur.spec.resource.clone() else {
                return Err(Error::RuleFailed(format!(
                    "update request {name} has neither rule contexts nor a resource"
                )));
            };
            compute_rules(&policy)
                .into_iter()
                .filter(|rule| rule.mutate.is_some())
                .map(|rule| (rule.name, resource.clone()))
                .collect()
        } else {
            ur.spec
                .rule_context
                .iter()
                .map(|rc| (rc.rule.clone(), rc.trigger.clone()))
                .collect()
        };

        let mut failures: Vec<(ResourceSpec, String)> = Vec::new();
        let mut patched: Vec<ResourceSpec> = Vec::new();
        for (rule, trigger) in work {
            let object = match self.clients.resources.get(&trigger).await {
                Ok(obj) => serde_json::to_value(&obj)?,
                Err(e) if e.is_not_found() => {
                    debug!(%rule, %trigger, "trigger gone, skipping mutate rule");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let ctx = PolicyContext::new(policy.clone())
                .with_new_resource(Some(object))
                .with_operation(ur.operation())
                .with_user_info(ur.spec.context.user_info.clone());

            let responses = match self.engine.mutate_existing(&ctx, &rule).await {
                Ok(responses) => responses,
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    failures.push((trigger, e.to_string()));
                    continue;
                }
            };
            for response in responses {
                match response.status {
                    RuleStatus::Pass => {
                        for target in &response.patched_targets {
                            self.clients.resources.update(target).await?;
                            metrics::increment_downstream_writes("mutate");
                            let identity = object_identity(target);
                            info!(
                                rule = %response.name,
                                target = %identity,
                                "✅ mutated existing resource"
                            );
                            patched.push(identity);
                        }
                    }
                    RuleStatus::Skip => debug!(rule = %response.name, "mutate rule skipped"),
                    status => failures.push((
                        trigger.clone(),
                        format!("rule {} {status}: {}", response.name, response.message),
                    )),
                }
            }
        }

        if !failures.is_empty() {
            let message = failures
                .iter()
                .map(|(_, m)| m.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            updater::mark_failed(self.clients.urs.as_ref(), &name, &message, &[]).await?;
            for (regarding, note) in failures {
                self.events
                    .emit(Event::failed(regarding, note).with_action("Mutate"))
                    .await;
            }
            return Err(Error::RuleFailed(message));
        }

        updater::mark_completed(self.clients.urs.as_ref(), &name, &[]).await?;
        for target in patched {
            self.events
                .emit(
                    Event::applied(target, format!("resource mutated by policy {}", policy.key()))
                        .with_action("Mutate"),
                )
                .await;
        }
        Ok(())
    }
}
