//! # Effective Rules
//!
//! Computes the rule set a policy actually enforces, including the pod-controller
//! variants generated for rules that match `Pod`, and the downstream retention
//! decision used when a policy is deleted.

use crate::crd::{AnyPolicy, Rule};
use crate::labels::AUTOGEN_CONTROLLERS_ANNOTATION;
use serde_json::Value;

const POD_CONTROLLERS: &[&str] = &[
    "DaemonSet",
    "Deployment",
    "Job",
    "StatefulSet",
    "ReplicaSet",
    "ReplicationController",
];
const CRONJOB: &str = "CronJob";

fn matches_pods(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.iter().any(|(k, v)| {
            (k == "kinds"
                && v.as_array()
                    .is_some_and(|kinds| kinds.iter().any(|kind| kind.as_str() == Some("Pod"))))
                || matches_pods(v)
        }),
        Value::Array(items) => items.iter().any(matches_pods),
        _ => false,
    }
}

fn replace_pod_kind(value: &Value, controllers: &[&str]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let replaced = match v.as_array() {
                        Some(kinds) if k == "kinds" => Value::Array(
                            kinds
                                .iter()
                                .flat_map(|kind| {
                                    if kind.as_str() == Some("Pod") {
                                        controllers.iter().map(|c| Value::from(*c)).collect()
                                    } else {
                                        vec![kind.clone()]
                                    }
                                })
                                .collect(),
                        ),
                        _ => replace_pod_kind(v, controllers),
                    };
                    (k.clone(), replaced)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| replace_pod_kind(item, controllers))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Controllers selected by the autogen annotation; `None` disables autogen
fn autogen_controllers(policy: &AnyPolicy) -> Option<Vec<&str>> {
    match policy.annotation(AUTOGEN_CONTROLLERS_ANNOTATION) {
        Some("none") => None,
        Some(list) if !list.is_empty() => Some(
            list.split(',')
                .map(str::trim)
                .filter(|c| POD_CONTROLLERS.contains(c) || *c == CRONJOB)
                .collect(),
        ),
        _ => Some(
            POD_CONTROLLERS
                .iter()
                .copied()
                .chain(std::iter::once(CRONJOB))
                .collect(),
        ),
    }
}

/// Declared rules followed by their autogen variants
pub fn compute_rules(policy: &AnyPolicy) -> Vec<Rule> {
    let rules = &policy.spec().rules;
    let mut effective = rules.clone();
    let Some(controllers) = autogen_controllers(policy) else {
        return effective;
    };
    let (cronjob, others): (Vec<&str>, Vec<&str>) =
        controllers.into_iter().partition(|c| *c == CRONJOB);

    for rule in rules {
        let Some(match_block) = rule.match_resources.as_ref().filter(|m| matches_pods(m)) else {
            continue;
        };
        if !others.is_empty() {
            effective.push(Rule {
                name: format!("autogen-{}", rule.name),
                match_resources: Some(replace_pod_kind(match_block, &others)),
                ..rule.clone()
            });
        }
        if !cronjob.is_empty() {
            effective.push(Rule {
                name: format!("autogen-cronjob-{}", rule.name),
                match_resources: Some(replace_pod_kind(match_block, &cronjob)),
                ..rule.clone()
            });
        }
    }
    effective
}

/// Look up a rule by name in the effective rule set
pub fn find_rule(policy: &AnyPolicy, name: &str) -> Option<Rule> {
    compute_rules(policy).into_iter().find(|r| r.name == name)
}

/// Whether deleting the policy leaves this rule's downstream resources in place
pub fn retains_downstream(rule: &Rule) -> bool {
    rule.generate
        .as_ref()
        .is_some_and(|g| (g.is_clone() && g.synchronize) || g.orphan_downstream_on_policy_delete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ClusterPolicy, CloneFrom, Generation, PolicySpec};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn pod_rule(name: &str) -> Rule {
        Rule {
            name: name.to_string(),
            match_resources: Some(serde_json::json!({
                "any": [{"resources": {"kinds": ["Pod"]}}]
            })),
            generate: Some(Generation::default()),
            ..Default::default()
        }
    }

    fn policy(rules: Vec<Rule>, annotation: Option<&str>) -> AnyPolicy {
        let mut p = ClusterPolicy::new(
            "p",
            PolicySpec {
                rules,
                ..Default::default()
            },
        );
        if let Some(value) = annotation {
            p.metadata.annotations = Some(BTreeMap::from([(
                AUTOGEN_CONTROLLERS_ANNOTATION.to_string(),
                value.to_string(),
            )]));
        }
        AnyPolicy::Cluster(Arc::new(p))
    }

    #[test]
    fn test_autogen_adds_controller_variants() {
        let rules = compute_rules(&policy(vec![pod_rule("gen")], None));
        let names: Vec<_> = rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["gen", "autogen-gen", "autogen-cronjob-gen"]);
        let kinds = &rules[1].match_resources.as_ref().unwrap()["any"][0]["resources"]["kinds"];
        assert_eq!(kinds.as_array().unwrap().len(), POD_CONTROLLERS.len());
        assert_eq!(
            rules[2].match_resources.as_ref().unwrap()["any"][0]["resources"]["kinds"][0],
            "CronJob"
        );
    }

    #[test]
    fn test_autogen_disabled_by_annotation() {
        let rules = compute_rules(&policy(vec![pod_rule("gen")], Some("none")));
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn test_autogen_respects_controller_list() {
        let rules = compute_rules(&policy(vec![pod_rule("gen")], Some("Deployment")));
        assert_eq!(rules.len(), 2);
        let autogen = policy(vec![pod_rule("gen")], Some("Deployment"));
        assert!(find_rule(&autogen, "autogen-gen").is_some());
    }

    #[test]
    fn test_non_pod_rules_are_not_expanded() {
        let mut rule = pod_rule("ns");
        rule.match_resources =
            Some(serde_json::json!({"any": [{"resources": {"kinds": ["Namespace"]}}]}));
        assert_eq!(compute_rules(&policy(vec![rule], None)).len(), 1);
    }

    #[test]
    fn test_retention() {
        let mut clone = pod_rule("clone");
        clone.generate = Some(Generation {
            synchronize: true,
            clone: Some(CloneFrom {
                namespace: "default".to_string(),
                name: "src".to_string(),
            }),
            ..Default::default()
        });
        assert!(retains_downstream(&clone));

        let mut data = pod_rule("data");
        data.generate = Some(Generation {
            synchronize: true,
            data: Some(serde_json::json!({})),
            ..Default::default()
        });
        assert!(!retains_downstream(&data));

        data.generate.as_mut().unwrap().orphan_downstream_on_policy_delete = true;
        assert!(retains_downstream(&data));
    }
}
