//! CP-006: Mapping rules and resolution results.

use crate::core::types::Value;
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Translates one source resource type into a target primitive.
///
/// `source_type` may contain glob wildcards (`mysql_*`). Renames apply to
/// property keys; unknown properties pass through unchanged. Value
/// transforms are keyed by the *source* property name and map the
/// lowercased scalar value to a replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MappingRule {
    pub source_type: String,
    pub target_primitive: String,
    #[serde(default)]
    pub property_renames: IndexMap<String, String>,
    #[serde(default)]
    pub value_transforms: IndexMap<String, IndexMap<String, String>>,
    /// Higher wins among rules of equal specificity.
    #[serde(default)]
    pub precedence: i32,
}

impl MappingRule {
    pub fn new(source_type: impl Into<String>, target_primitive: impl Into<String>) -> Self {
        Self {
            source_type: source_type.into(),
            target_primitive: target_primitive.into(),
            property_renames: IndexMap::new(),
            value_transforms: IndexMap::new(),
            precedence: 0,
        }
    }

    pub fn rename(mut self, from: &str, to: &str) -> Self {
        self.property_renames.insert(from.to_string(), to.to_string());
        self
    }

    pub fn transform(mut self, property: &str, table: &[(&str, &str)]) -> Self {
        let entry = self
            .value_transforms
            .entry(property.to_string())
            .or_default();
        for (raw, target) in table {
            entry.insert(raw.to_lowercase(), (*target).to_string());
        }
        self
    }

    pub fn with_precedence(mut self, precedence: i32) -> Self {
        self.precedence = precedence;
        self
    }

    /// True if `source_type` contains glob metacharacters.
    pub fn is_wildcard(&self) -> bool {
        self.source_type.contains(['*', '?', '['])
    }

    /// Length of the literal prefix before the first wildcard.
    pub fn literal_prefix_len(&self) -> usize {
        self.source_type
            .find(['*', '?', '['])
            .unwrap_or(self.source_type.len())
    }

    /// Apply renames and value transforms. Property order is preserved.
    pub fn apply(&self, properties: &IndexMap<String, Value>) -> IndexMap<String, Value> {
        let mut out = IndexMap::with_capacity(properties.len());
        for (key, value) in properties {
            let value = self
                .value_transforms
                .get(key)
                .and_then(|table| value.lookup_key().and_then(|k| table.get(&k)))
                .map(|target| Value::string(target.clone()))
                .unwrap_or_else(|| value.clone());
            let key = self
                .property_renames
                .get(key)
                .cloned()
                .unwrap_or_else(|| key.clone());
            out.insert(key, value);
        }
        out
    }
}

/// A resolved target invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetInvocation {
    pub primitive: String,
    pub properties: IndexMap<String, Value>,
    /// `source_type` of the rule that matched.
    pub rule: String,
}

/// Outcome of resolving a declaration. `Unmapped` is a normal result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
    Mapped(TargetInvocation),
    Unmapped,
}

impl Resolution {
    pub fn is_mapped(&self) -> bool {
        matches!(self, Self::Mapped(_))
    }

    pub fn invocation(&self) -> Option<&TargetInvocation> {
        match self {
            Self::Mapped(inv) => Some(inv),
            Self::Unmapped => None,
        }
    }
}
