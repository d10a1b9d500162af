//! Declaration masking
//!
//! Drops sensitive fields from a declaration before it is stored on a task.
//! Matching is by key name against an explicit deny-list; values are never
//! inspected.

use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use std::sync::LazyLock;
use tracing::debug;

/// Field-name patterns dropped by the default rules
pub const DEFAULT_PATTERNS: &[&str] = &[r"pass(word|phrase)", r"secret", r"private_?key", r"ssh_?key"];

static DEFAULT_RULES: LazyLock<MaskRules> = LazyLock::new(|| {
    MaskRules::new(DEFAULT_PATTERNS).unwrap_or_else(|_| MaskRules { matchers: Vec::new() })
});

/// Set of case-insensitive field-name matchers
#[derive(Debug, Clone)]
pub struct MaskRules {
    matchers: Vec<Regex>,
}

impl Default for MaskRules {
    fn default() -> Self {
        DEFAULT_RULES.clone()
    }
}

impl MaskRules {
    /// Build rules from regex patterns, matched case-insensitively anywhere in the key
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let matchers = patterns
            .iter()
            .map(|p| RegexBuilder::new(p.as_ref()).case_insensitive(true).build())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { matchers })
    }

    /// Whether a key names sensitive material
    pub fn is_sensitive(&self, key: &str) -> bool {
        self.matchers.iter().any(|m| m.is_match(key))
    }

    /// Return a masked deep copy of `value`
    pub fn mask(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(self.mask_object(map)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| match item {
                        Value::Object(map) => Value::Object(self.mask_object(map)),
                        other => other.clone(),
                    })
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn mask_object(&self, map: &Map<String, Value>) -> Map<String, Value> {
        let mut out = Map::with_capacity(map.len());
        for (key, value) in map {
            if self.is_sensitive(key) {
                debug!(%key, "mask_object: dropping sensitive field");
                continue;
            }
            out.insert(key.clone(), self.mask(value));
        }
        out
    }
}

/// Mask with the default rules
pub fn mask(value: &Value) -> Value {
    DEFAULT_RULES.mask(value)
}
