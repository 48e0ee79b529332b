//! Label selectors used to partition a single watch stream into logical
//! topics.
//!
//! Only equality requirements are supported. A selector is built once,
//! validated at construction time and immutable afterwards.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Errors returned when a selector requirement cannot be built.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    /// The label key is not a valid Kubernetes qualified name.
    #[error("invalid label key {key:?}: {reason}")]
    InvalidKey {
        /// The offending key.
        key: String,
        /// Why the key was rejected.
        reason: &'static str,
    },
    /// The label value is not a valid Kubernetes label value.
    #[error("invalid label value {value:?} for key {key:?}: {reason}")]
    InvalidValue {
        /// The key the value was supplied for.
        key: String,
        /// The offending value.
        value: String,
        /// Why the value was rejected.
        reason: &'static str,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Requirement {
    key: String,
    value: String,
}

/// A conjunction of label-equality requirements.
///
/// A selector with zero requirements matches nothing; supplying one is a
/// caller error, so the only constructors start from a requirement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// Builds a selector matching resources labeled with `key=value`.
    pub fn match_label(
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, SelectorError> {
        let selector = Selector {
            requirements: Vec::new(),
        };
        selector.and(key, value)
    }

    /// Adds another `key=value` requirement to the conjunction.
    pub fn and(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, SelectorError> {
        let key = key.into();
        let value = value.into();
        if let Err(reason) = validate_key(&key) {
            return Err(SelectorError::InvalidKey { key, reason });
        }
        if let Err(reason) = validate_value(&value) {
            return Err(SelectorError::InvalidValue { key, value, reason });
        }
        self.requirements.push(Requirement { key, value });
        Ok(self)
    }

    /// Evaluates the selector against a resource's label set.
    ///
    /// Every requirement must be satisfied. An empty selector matches
    /// nothing.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        if self.requirements.is_empty() {
            return false;
        }
        self.requirements
            .iter()
            .all(|r| labels.get(&r.key).map_or(false, |v| *v == r.value))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for r in &self.requirements {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}={}", r.key, r.value)?;
            first = false;
        }
        Ok(())
    }
}

const MAX_NAME_LEN: usize = 63;
const MAX_PREFIX_LEN: usize = 253;

// Validates the name segment of a label key or a non-empty label value:
// at most 63 characters, alphanumeric at both ends, with '-', '_' and '.'
// allowed in between.
fn validate_name_segment(segment: &str) -> Result<(), &'static str> {
    if segment.is_empty() {
        return Err("must not be empty");
    }
    if segment.len() > MAX_NAME_LEN {
        return Err("must be no more than 63 characters");
    }
    let first = segment.chars().next().unwrap();
    let last = segment.chars().last().unwrap();
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        return Err("must start and end with an alphanumeric character");
    }
    if !segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err("contains characters outside [A-Za-z0-9-_.]");
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<(), &'static str> {
    match key.split_once('/') {
        None => validate_name_segment(key),
        Some((prefix, name)) => {
            if prefix.is_empty() {
                return Err("prefix part must not be empty");
            }
            if prefix.len() > MAX_PREFIX_LEN {
                return Err("prefix part must be no more than 253 characters");
            }
            if !prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
            {
                return Err("prefix part is not a valid DNS subdomain");
            }
            if name.contains('/') {
                return Err("contains more than one '/'");
            }
            validate_name_segment(name)
        }
    }
}

fn validate_value(value: &str) -> Result<(), &'static str> {
    // Empty label values are legal in Kubernetes.
    if value.is_empty() {
        return Ok(());
    }
    validate_name_segment(value)
}

#[cfg(test)]
mod test {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn matches_equal_label() {
        let selector = Selector::match_label("monitoring", "alert").unwrap();
        assert!(selector.matches(&labels(&[("monitoring", "alert")])));
    }

    #[test]
    fn does_not_match_different_value() {
        let selector = Selector::match_label("monitoring", "alert").unwrap();
        assert!(!selector.matches(&labels(&[("monitoring", "dashboard")])));
    }

    #[test]
    fn does_not_match_missing_key() {
        let selector = Selector::match_label("monitoring", "alert").unwrap();
        assert!(!selector.matches(&labels(&[("app", "monitoring")])));
        assert!(!selector.matches(&BTreeMap::new()));
    }

    #[test]
    fn conjunction_requires_all_requirements() {
        let selector = Selector::match_label("app", "monitoring")
            .unwrap()
            .and("component", "kapacitor")
            .unwrap();
        assert!(selector.matches(&labels(&[
            ("app", "monitoring"),
            ("component", "kapacitor"),
            ("extra", "ignored"),
        ])));
        assert!(!selector.matches(&labels(&[("app", "monitoring")])));
    }

    #[test]
    fn empty_selector_matches_nothing() {
        let selector = Selector {
            requirements: Vec::new(),
        };
        assert!(!selector.matches(&labels(&[("monitoring", "alert")])));
        assert!(!selector.matches(&BTreeMap::new()));
    }

    #[test]
    fn rejects_invalid_keys() {
        assert!(matches!(
            Selector::match_label("", "alert"),
            Err(SelectorError::InvalidKey { .. })
        ));
        assert!(matches!(
            Selector::match_label("spaced key", "alert"),
            Err(SelectorError::InvalidKey { .. })
        ));
        assert!(matches!(
            Selector::match_label("-leading", "alert"),
            Err(SelectorError::InvalidKey { .. })
        ));
        let too_long = "a".repeat(64);
        assert!(matches!(
            Selector::match_label(too_long, "alert"),
            Err(SelectorError::InvalidKey { .. })
        ));
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            Selector::match_label("monitoring", "has spaces"),
            Err(SelectorError::InvalidValue { .. })
        ));
        assert!(matches!(
            Selector::match_label("monitoring", "trailing-"),
            Err(SelectorError::InvalidValue { .. })
        ));
    }

    #[test]
    fn accepts_prefixed_keys_and_empty_values() {
        let selector = Selector::match_label("example.com/monitoring", "").unwrap();
        assert!(selector.matches(&labels(&[("example.com/monitoring", "")])));
    }

    #[test]
    fn renders_as_label_selector_string() {
        let selector = Selector::match_label("monitoring", "rollup")
            .unwrap()
            .and("app", "monitoring")
            .unwrap();
        assert_eq!(selector.to_string(), "monitoring=rollup,app=monitoring");
    }
}
