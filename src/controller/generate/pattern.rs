//! # Pattern Matching
//!
//! Structural subset match of a live object against a generate rule's `data`.
//! Used to detect drift on synchronized downstream resources.
//!
//! - objects: every pattern key must be present and match
//! - arrays: equal lengths compare index by index, otherwise every pattern
//!   element must match some resource element
//! - strings: `*` and `?` wildcards; a lone `*` only requires presence
//! - other scalars: equality, with numbers compared by value

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Path of the first element that does not match
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("resource does not match pattern at {path}")]
pub struct Mismatch {
    pub path: String,
}

/// Check `resource` against `pattern`
pub fn validate(resource: &Value, pattern: &Value) -> Result<(), Mismatch> {
    validate_at(resource, pattern, "/")
}

fn mismatch(path: &str) -> Mismatch {
    Mismatch {
        path: path.to_string(),
    }
}

fn child(path: &str, segment: &str) -> String {
    if path.ends_with('/') {
        format!("{path}{segment}")
    } else {
        format!("{path}/{segment}")
    }
}

fn validate_at(resource: &Value, pattern: &Value, path: &str) -> Result<(), Mismatch> {
    match pattern {
        Value::Object(expected) => {
            let Value::Object(actual) = resource else {
                return Err(mismatch(path));
            };
            for (key, value) in expected {
                let path = child(path, key);
                match actual.get(key) {
                    Some(found) => validate_at(found, value, &path)?,
                    None if value.is_null() => {}
                    None => return Err(mismatch(&path)),
                }
            }
            Ok(())
        }
        Value::Array(expected) => {
            let Value::Array(actual) = resource else {
                return Err(mismatch(path));
            };
            if expected.len() == actual.len() {
                for (index, (found, value)) in actual.iter().zip(expected).enumerate() {
                    validate_at(found, value, &child(path, &index.to_string()))?;
                }
                return Ok(());
            }
            for (index, value) in expected.iter().enumerate() {
                let path = child(path, &index.to_string());
                if !actual.iter().any(|found| validate_at(found, value, &path).is_ok()) {
                    return Err(mismatch(&path));
                }
            }
            Ok(())
        }
        Value::String(expected) => {
            if scalar_matches(resource, expected) {
                Ok(())
            } else {
                Err(mismatch(path))
            }
        }
        Value::Number(expected) => match resource {
            Value::Number(found) if found.as_f64() == expected.as_f64() => Ok(()),
            _ => Err(mismatch(path)),
        },
        Value::Bool(_) | Value::Null => {
            if resource == pattern {
                Ok(())
            } else {
                Err(mismatch(path))
            }
        }
    }
}

fn scalar_matches(resource: &Value, expected: &str) -> bool {
    if expected == "*" {
        return !resource.is_null();
    }
    let found = match resource {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return false,
    };
    if expected.contains(['*', '?']) {
        wildcard(expected).is_some_and(|re| re.is_match(&found))
    } else {
        found == expected
    }
}

fn wildcard(pattern: &str) -> Option<Regex> {
    let escaped = regex::escape(pattern)
        .replace(r"\*", ".*")
        .replace(r"\?", ".");
    Regex::new(&format!("^{escaped}$")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subset_matches() {
        let live = json!({
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "labels": {"a": "1", "extra": "x"}},
            "data": {"key": "value", "other": "ignored"}
        });
        let pattern = json!({"metadata": {"labels": {"a": "1"}}, "data": {"key": "value"}});
        assert!(validate(&live, &pattern).is_ok());
    }

    #[test]
    fn test_drift_reports_path() {
        let live = json!({"data": {"key": "changed"}});
        let err = validate(&live, &json!({"data": {"key": "value"}})).unwrap_err();
        assert_eq!(err.path, "/data/key");

        let missing =
            validate(&json!({"data": {}}), &json!({"data": {"key": "value"}})).unwrap_err();
        assert_eq!(missing.path, "/data/key");
    }

    #[test]
    fn test_wildcards() {
        assert!(validate(&json!({"image": "nginx:1.25"}), &json!({"image": "nginx:*"})).is_ok());
        assert!(validate(&json!({"image": "redis:7"}), &json!({"image": "nginx:*"})).is_err());
        assert!(validate(&json!({"tier": "a1"}), &json!({"tier": "a?"})).is_ok());
        assert!(validate(&json!({"any": 5}), &json!({"any": "*"})).is_ok());
        assert!(validate(&json!({}), &json!({"any": "*"})).is_err());
    }

    #[test]
    fn test_arrays() {
        let live = json!({"ports": [{"port": 80}, {"port": 443}, {"port": 8080}]});
        assert!(validate(&live, &json!({"ports": [{"port": 443}]})).is_ok());
        assert!(validate(&live, &json!({"ports": [{"port": 22}]})).is_err());
        let ordered = json!({"args": ["a", "b"]});
        assert!(validate(&ordered, &json!({"args": ["a", "b"]})).is_ok());
        assert!(validate(&ordered, &json!({"args": ["b", "a"]})).is_err());
    }

    #[test]
    fn test_numbers_compare_by_value() {
        assert!(validate(&json!({"replicas": 3}), &json!({"replicas": 3.0})).is_ok());
        assert!(validate(&json!({"replicas": "3"}), &json!({"replicas": 3})).is_err());
        assert!(validate(&json!({"count": 3}), &json!({"count": "3"})).is_ok());
    }
}
