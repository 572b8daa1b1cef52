//! CP-016: Feedback synthesis.
//!
//! Turns a validation report into a correction directive for the next
//! generation request. Pure and deterministic: the same report and history
//! always give the same directive.
//!
//! Items are built only from the latest report, so a category fixed in an
//! earlier attempt never comes back as an instruction. History is used to
//! mark categories that keep recurring and to note which ones were fixed
//! since the previous attempt.

use super::session::ConversionAttempt;
use crate::oracle::{Diagnostic, Severity, ValidationReport};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Instruction used when the report gives nothing actionable.
pub const GENERIC_INSTRUCTION: &str = "The previous output was rejected without usable \
    diagnostics. Retry with stricter defaults: fully-qualified module names, a name on every \
    task, explicit state on every module, and each file in its own path= fenced block.";

const MAX_LOCATIONS: usize = 8;
const MAX_MESSAGES: usize = 5;

/// Corrective instruction per diagnostic category.
const INSTRUCTIONS: &[(&str, &str)] = &[
    ("yaml", "Emit syntactically valid YAML: two-space indentation, no tabs, and quote any value that starts with '{{' or contains ': '."),
    ("fqcn", "Use fully-qualified collection names for every module (ansible.builtin.package, not package)."),
    ("name", "Give every task and handler a short descriptive name."),
    ("notify", "Every notify entry must equal the name (or a listen topic) of a handler defined in handlers/main.yml."),
    ("required-file", "Always include tasks/main.yml and meta/main.yml in the output."),
    ("schema", "Task and handler files must be YAML lists of mappings, each task calling exactly one module."),
    ("output", "Put every file in its own fenced block whose info string is `yaml path=<relative path inside the role>`."),
    ("syntax-check", "The role must pass ansible-playbook --syntax-check; fix the reported errors."),
    ("no-changed-when", "Add changed_when, creates or removes to every command and shell task."),
    ("risky-file-permissions", "Set an explicit mode on every file, copy and template task."),
    ("var-naming", "Variable names must be lowercase snake_case and prefixed with the role name."),
    ("jinja", "Use spaces inside Jinja delimiters: {{ var }}."),
    ("no-free-form", "Pass module arguments as a mapping instead of the free-form string."),
    ("lint", "ansible-lint failed to process the role; make sure every file is valid YAML with the standard role layout."),
];

fn instruction_for(category: &str) -> String {
    INSTRUCTIONS
        .iter()
        .find(|(c, _)| *c == category)
        .map(|(_, i)| i.to_string())
        .unwrap_or_else(|| format!("Fix every reported {} issue.", category))
}

/// Diagnostics of one category from the latest report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackItem {
    pub category: String,
    pub severity: Severity,
    pub occurrences: usize,
    /// Distinct offending locations, in report order.
    pub locations: Vec<String>,
    /// Distinct messages, in report order.
    pub messages: Vec<String>,
    pub instruction: String,
    /// Also reported after an earlier attempt.
    pub recurring: bool,
}

/// Structured correction directive attached to the next request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackDirective {
    /// Attempt whose report this directive answers.
    pub attempt: u32,
    /// One item per category, sorted by category.
    pub items: Vec<FeedbackItem>,
    /// Categories blocking the previous attempt that are now gone.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolved: Vec<String>,
    /// Set when nothing actionable was reported.
    #[serde(default)]
    pub generic: bool,
}

impl FeedbackDirective {
    pub fn generic(attempt: u32) -> Self {
        Self {
            attempt,
            generic: true,
            ..Self::default()
        }
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|i| i.category.as_str())
    }

    /// Prompt text for the generator.
    pub fn render(&self) -> String {
        let mut out = format!(
            "The output of attempt {} failed validation. Return the COMPLETE corrected role, every file again.\n",
            self.attempt
        );
        if self.generic {
            out.push_str(GENERIC_INSTRUCTION);
            out.push('\n');
            return out;
        }
        for item in &self.items {
            out.push_str(&format!(
                "\n## {} ({} {}, {} occurrence{})\n",
                item.category,
                item.severity,
                if item.recurring { "recurring" } else { "new" },
                item.occurrences,
                if item.occurrences == 1 { "" } else { "s" }
            ));
            out.push_str(&format!("Fix: {}\n", item.instruction));
            if item.recurring {
                out.push_str("This was reported before and is still present; change the approach.\n");
            }
            if !item.locations.is_empty() {
                out.push_str(&format!("Where: {}\n", item.locations.join(", ")));
            }
            for m in &item.messages {
                out.push_str(&format!("- {}\n", m));
            }
        }
        if !self.resolved.is_empty() {
            out.push_str(&format!(
                "\nAlready fixed, leave that code as it is: {}\n",
                self.resolved.join(", ")
            ));
        }
        out
    }
}

/// Build the directive for `report`, the result of attempt `history.len()`.
pub fn synthesize(report: &ValidationReport, history: &[ConversionAttempt]) -> FeedbackDirective {
    let attempt = history.last().map(|a| a.number).unwrap_or(1);

    let mut groups: BTreeMap<&str, Vec<&Diagnostic>> = BTreeMap::new();
    for d in report.blocking() {
        groups.entry(d.category()).or_default().push(d);
    }
    if groups.is_empty() {
        return FeedbackDirective::generic(attempt);
    }

    // Categories seen in reports before the latest one.
    let earlier: &[ConversionAttempt] = match history.split_last() {
        Some((_, rest)) => rest,
        None => &[],
    };
    let seen_before: BTreeSet<String> = earlier
        .iter()
        .filter_map(|a| a.report.as_ref())
        .flat_map(|r| r.blocking().map(|d| d.category().to_string()))
        .collect();
    let previous: BTreeSet<String> = earlier
        .last()
        .and_then(|a| a.report.as_ref())
        .map(|r| r.blocking().map(|d| d.category().to_string()).collect())
        .unwrap_or_default();

    let items = groups
        .into_iter()
        .map(|(category, diags)| {
            let severity = diags
                .iter()
                .map(|d| d.severity)
                .max()
                .unwrap_or(Severity::Warning);
            FeedbackItem {
                category: category.to_string(),
                severity,
                occurrences: diags.len(),
                locations: distinct(diags.iter().filter_map(|d| d.location.as_deref()), MAX_LOCATIONS),
                messages: distinct(diags.iter().map(|d| d.message.as_str()), MAX_MESSAGES),
                instruction: instruction_for(category),
                recurring: seen_before.contains(category),
            }
        })
        .collect::<Vec<_>>();

    let current: BTreeSet<&str> = items.iter().map(|i| i.category.as_str()).collect();
    let resolved = previous
        .into_iter()
        .filter(|c| !current.contains(c.as_str()))
        .collect();

    FeedbackDirective {
        attempt,
        items,
        resolved,
        generic: false,
    }
}

fn distinct<'a>(values: impl Iterator<Item = &'a str>, cap: usize) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for v in values {
        if out.len() == cap {
            break;
        }
        if seen.insert(v) {
            out.push(v.to_string());
        }
    }
    out
}
