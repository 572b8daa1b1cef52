//! CP-007: Mapping registry. Built once, shared read-only.
//!
//! Lookup order: exact type → wildcard with the longest literal prefix →
//! `Unmapped`. Within one specificity the highest `precedence` wins, then
//! the rule registered last (so a mapping file overrides the defaults).

use super::defaults::default_rules;
use super::rule::{MappingRule, Resolution, TargetInvocation};
use crate::core::types::Value;
use crate::error::{ConvertError, Result};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Immutable rule table. Wrap in `Arc` to share across sessions.
#[derive(Debug, Clone, Default)]
pub struct MappingRegistry {
    rules: Vec<MappingRule>,
    exact: FxHashMap<String, usize>,
    /// Sorted best-first.
    wildcards: Vec<(glob::Pattern, usize)>,
}

impl MappingRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Registry with only the built-in rules.
    pub fn with_defaults() -> Self {
        Self::builder().defaults().build()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules in registration order.
    pub fn rules(&self) -> &[MappingRule] {
        &self.rules
    }

    /// The rule that would apply to `resource_type`.
    pub fn lookup(&self, resource_type: &str) -> Option<&MappingRule> {
        if let Some(&i) = self.exact.get(resource_type) {
            return Some(&self.rules[i]);
        }
        self.wildcards
            .iter()
            .find(|(pattern, _)| pattern.matches(resource_type))
            .map(|&(_, i)| &self.rules[i])
    }

    /// Resolve a declaration. Pure in `(type, properties, self)`.
    pub fn resolve(&self, resource_type: &str, properties: &IndexMap<String, Value>) -> Resolution {
        match self.lookup(resource_type) {
            Some(rule) => Resolution::Mapped(TargetInvocation {
                primitive: rule.target_primitive.clone(),
                properties: rule.apply(properties),
                rule: rule.source_type.clone(),
            }),
            None => Resolution::Unmapped,
        }
    }
}

/// Result of loading a mapping file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    /// One message per skipped record.
    pub skipped: Vec<String>,
}

/// Collects rules, then freezes them into a `MappingRegistry`.
#[derive(Debug, Clone, Default)]
pub struct RegistryBuilder {
    rules: Vec<MappingRule>,
}

impl RegistryBuilder {
    /// Register the built-in rules.
    pub fn defaults(mut self) -> Self {
        self.rules.extend(default_rules());
        self
    }

    pub fn rule(mut self, rule: MappingRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn push(&mut self, rule: MappingRule) {
        self.rules.push(rule);
    }

    /// Load rules from a JSON or YAML file. Malformed records are skipped
    /// with a warning; a file that cannot be read or parsed at all is a
    /// configuration error.
    pub fn load_file(&mut self, path: &Path) -> Result<LoadReport> {
        let content = std::fs::read_to_string(path).map_err(|e| ConvertError::io(path, e))?;
        let is_json = path.extension().is_some_and(|e| e == "json");
        let doc: serde_json::Value = if is_json {
            serde_json::from_str(&content).map_err(|e| ConvertError::MappingFile {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        } else {
            serde_yaml_ng::from_str(&content).map_err(|e| ConvertError::MappingFile {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        };
        let report = self
            .load_document(doc)
            .map_err(|message| ConvertError::MappingFile {
                path: path.to_path_buf(),
                message,
            })?;
        info!(
            path = %path.display(),
            loaded = report.loaded,
            skipped = report.skipped.len(),
            "loaded mapping rules"
        );
        Ok(report)
    }

    /// Load an already-parsed document: a list of rule records, an object
    /// with a `rules` list, or the legacy `{type: {ansible_module,
    /// property_mapping}}` map.
    pub fn load_document(&mut self, doc: serde_json::Value) -> std::result::Result<LoadReport, String> {
        let mut report = LoadReport::default();
        let candidates: Vec<(String, std::result::Result<MappingRule, String>)> = match doc {
            serde_json::Value::Array(records) => records_to_rules(records),
            serde_json::Value::Object(mut map) => match map.remove("rules") {
                Some(serde_json::Value::Array(records)) => records_to_rules(records),
                Some(_) => return Err("`rules` must be a list".to_string()),
                None => map
                    .into_iter()
                    .map(|(source_type, entry)| {
                        let rule = legacy_rule(&source_type, entry);
                        (source_type, rule)
                    })
                    .collect(),
            },
            serde_json::Value::Null => Vec::new(),
            _ => return Err("expected a list of rules or a map of resource types".to_string()),
        };

        for (label, candidate) in candidates {
            match candidate.and_then(validate) {
                Ok(rule) => {
                    debug!(source_type = %rule.source_type, target = %rule.target_primitive, "registered rule");
                    self.rules.push(rule);
                    report.loaded += 1;
                }
                Err(reason) => {
                    warn!(record = %label, reason = %reason, "skipping malformed mapping record");
                    report.skipped.push(format!("{}: {}", label, reason));
                }
            }
        }
        Ok(report)
    }

    pub fn build(self) -> MappingRegistry {
        let mut exact: FxHashMap<String, usize> = FxHashMap::default();
        let mut wildcards = Vec::new();

        for (i, rule) in self.rules.iter().enumerate() {
            if rule.is_wildcard() {
                match glob::Pattern::new(&rule.source_type) {
                    Ok(p) => wildcards.push((p, i)),
                    Err(e) => warn!(source_type = %rule.source_type, error = %e, "invalid wildcard"),
                }
                continue;
            }
            let better = match exact.get(&rule.source_type) {
                // later registration wins ties
                Some(&j) => rule.precedence >= self.rules[j].precedence,
                None => true,
            };
            if better {
                exact.insert(rule.source_type.clone(), i);
            }
        }

        let rules = &self.rules;
        wildcards.sort_by(|(_, a), (_, b)| {
            let (ra, rb) = (&rules[*a], &rules[*b]);
            rb.literal_prefix_len()
                .cmp(&ra.literal_prefix_len())
                .then(rb.precedence.cmp(&ra.precedence))
                .then(b.cmp(a))
        });

        MappingRegistry {
            rules: self.rules,
            exact,
            wildcards,
        }
    }
}

fn records_to_rules(
    records: Vec<serde_json::Value>,
) -> Vec<(String, std::result::Result<MappingRule, String>)> {
    records
        .into_iter()
        .enumerate()
        .map(|(i, record)| {
            let label = record
                .get("source_type")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("record #{}", i + 1));
            let rule = serde_json::from_value::<MappingRule>(record).map_err(|e| e.to_string());
            (label, rule)
        })
        .collect()
}

fn legacy_rule(source_type: &str, entry: serde_json::Value) -> std::result::Result<MappingRule, String> {
    let target = entry
        .get("ansible_module")
        .or_else(|| entry.get("target_primitive"))
        .and_then(|v| v.as_str())
        .ok_or("missing `ansible_module`")?;
    let mut rule = MappingRule::new(source_type, target);

    let Some(props) = entry.get("property_mapping") else {
        return Ok(rule);
    };
    let props = props
        .as_object()
        .ok_or("`property_mapping` must be a map")?;
    for (from, to) in props {
        if from == "value_mapping" {
            let tables = to.as_object().ok_or("`value_mapping` must be a map")?;
            for (prop, table) in tables {
                let table = table
                    .as_object()
                    .ok_or_else(|| format!("value_mapping for `{}` must be a map", prop))?;
                let entry = rule.value_transforms.entry(prop.clone()).or_default();
                for (raw, target) in table {
                    let target = match target {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    entry.insert(raw.to_lowercase(), target);
                }
            }
            continue;
        }
        let to = to
            .as_str()
            .ok_or_else(|| format!("rename target for `{}` must be a string", from))?;
        rule.property_renames.insert(from.clone(), to.to_string());
    }
    if let Some(p) = entry.get("precedence").and_then(|v| v.as_i64()) {
        rule.precedence = i32::try_from(p).map_err(|_| "precedence out of range".to_string())?;
    }
    Ok(rule)
}

fn validate(rule: MappingRule) -> std::result::Result<MappingRule, String> {
    if rule.source_type.trim().is_empty() {
        return Err("empty source_type".to_string());
    }
    if rule.target_primitive.trim().is_empty() {
        return Err("empty target_primitive".to_string());
    }
    if rule.is_wildcard() {
        glob::Pattern::new(&rule.source_type).map_err(|e| e.to_string())?;
    }
    Ok(rule)
}
