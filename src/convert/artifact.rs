//! CP-013: Candidate artifact trees and response parsing.
//!
//! Generator responses carry files as fenced blocks whose info string names
//! the path:
//!
//! ````text
//! ```yaml path=tasks/main.yml
//! - name: Install nginx
//!   ...
//! ```
//! ````
//!
//! As a fallback, `# Tasks` / `# Handlers` / `# Defaults` headings followed
//! by a YAML fence are accepted. A response with neither is a content defect
//! reported as an `output[delimiter]` diagnostic.

use crate::oracle::{Diagnostic, Severity};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path};
use std::sync::LazyLock;

static PATH_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?ms)^```[ \t]*[A-Za-z0-9_+.-]*[ \t]+(?:path|file)=["']?([^\s"'`]+)["']?[^\n]*\n(.*?)^```[ \t]*$"#,
    )
    .expect("valid regex")
});

static SECTION_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?msi)^#{1,3}[ \t]*(tasks|handlers|defaults|vars)\b[^\n]*\n\s*```[ \t]*(?:ya?ml)?[ \t]*\n(.*?)^```[ \t]*$",
    )
    .expect("valid regex")
});

/// A set of role files keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactTree {
    files: BTreeMap<String, String>,
}

impl ArtifactTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.files.insert(path.into(), content.into());
    }

    /// Insert only if `path` is not present yet.
    pub fn insert_missing(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.files.entry(path.into()).or_insert_with(|| content.into());
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Files in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_str()))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Plain (non-atomic) write of every file under `dir`, for scratch copies.
    pub fn write_to(&self, dir: &Path) -> std::io::Result<()> {
        for (path, content) in self.iter() {
            let target = dir.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, content)?;
        }
        Ok(())
    }
}

/// Files recovered from a response plus any content defects found.
#[derive(Debug, Clone, Default)]
pub struct ParsedResponse {
    pub tree: ArtifactTree,
    pub defects: Vec<Diagnostic>,
}

/// Split generator output into an artifact tree.
pub fn parse_response(text: &str) -> ParsedResponse {
    let mut parsed = ParsedResponse::default();

    for caps in PATH_FENCE.captures_iter(text) {
        let path = caps[1].trim_start_matches("./").to_string();
        if let Some(reason) = unsafe_path(&path) {
            parsed.defects.push(
                Diagnostic::error("output[path]", format!("rejected file path: {}", reason))
                    .at(path),
            );
            continue;
        }
        parsed.tree.insert(path, normalize(&caps[2]));
    }

    if parsed.tree.is_empty() {
        for caps in SECTION_FENCE.captures_iter(text) {
            let dir = caps[1].to_lowercase();
            parsed
                .tree
                .insert_missing(format!("{}/main.yml", dir), normalize(&caps[2]));
        }
    }

    if parsed.tree.is_empty() {
        parsed.defects.push(Diagnostic::new(
            Severity::Error,
            "output[delimiter]",
            "response contained no file blocks; emit each file as a fenced block \
             whose info string carries path=<relative path>",
        ));
    }
    parsed
}

fn normalize(body: &str) -> String {
    let mut s = body.trim_end().to_string();
    s.push('\n');
    s
}

/// Why a generated path must not be written, if it must not.
fn unsafe_path(path: &str) -> Option<&'static str> {
    let p = Path::new(path);
    if path.is_empty() {
        return Some("empty path");
    }
    if p.is_absolute() || path.starts_with('/') || path.starts_with('\\') {
        return Some("absolute path");
    }
    if p.components().any(|c| matches!(c, Component::ParentDir)) {
        return Some("path escapes the role directory");
    }
    if path.starts_with(".cookport") {
        return Some("reserved directory");
    }
    None
}
