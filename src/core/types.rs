//! CP-001: Resource model extracted from Chef cookbooks.
//!
//! Everything the extractor produces lives here: values, declarations,
//! guards, notification edges, recipe units and the parsed cookbook. All types
//! derive Serialize/Deserialize so the model can be dumped by `cookport
//! extract` and embedded in generation requests.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Declaration type used for spans the extractor could not recognize.
pub const UNPARSED_TYPE: &str = "__unparsed__";

// ============================================================================
// Values
// ============================================================================

/// A literal scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Scalar {
    String(String),
    Symbol(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Nil,
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) | Self::Symbol(s) => write!(f, "{}", s),
            Self::Integer(n) => write!(f, "{}", n),
            Self::Float(x) => write!(f, "{}", x),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Nil => write!(f, "nil"),
        }
    }
}

/// A property value. Anything the value parser cannot classify is kept
/// verbatim as `Raw`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Scalar(Scalar),
    /// Variable or node attribute reference, dotted (`node.nginx.port`).
    Reference(String),
    Map(IndexMap<String, Value>),
    List(Vec<Value>),
    Raw(String),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Self::Scalar(Scalar::String(s.into()))
    }

    pub fn symbol(s: impl Into<String>) -> Self {
        Self::Scalar(Scalar::Symbol(s.into()))
    }

    /// The plain text of a string or symbol scalar.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Scalar(Scalar::String(s)) | Self::Scalar(Scalar::Symbol(s)) => Some(s),
            _ => None,
        }
    }

    /// Key used for value-transform lookups: scalars render lowercased,
    /// anything else has no key.
    pub fn lookup_key(&self) -> Option<String> {
        match self {
            Self::Scalar(Scalar::Nil) => None,
            Self::Scalar(s) => Some(s.to_string().to_lowercase()),
            _ => None,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw(_))
    }

    /// Render back to a Ruby-like literal for prompts and CLI output.
    pub fn to_source(&self) -> String {
        match self {
            Self::Scalar(Scalar::String(s)) => format!("'{}'", s.replace('\'', "\\'")),
            Self::Scalar(Scalar::Symbol(s)) => format!(":{}", s),
            Self::Scalar(other) => other.to_string(),
            Self::Reference(r) => r.clone(),
            Self::Map(m) => {
                let parts: Vec<String> = m
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v.to_source()))
                    .collect();
                format!("{{ {} }}", parts.join(", "))
            }
            Self::List(items) => {
                let parts: Vec<String> = items.iter().map(Value::to_source).collect();
                format!("[{}]", parts.join(", "))
            }
            Self::Raw(r) => r.clone(),
        }
    }
}

// ============================================================================
// Declarations
// ============================================================================

/// Contiguous region of a source file, 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    pub file: String,
    pub start_line: usize,
    pub end_line: usize,
}

impl fmt::Display for SourceSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start_line == self.end_line {
            write!(f, "{}:{}", self.file, self.start_line)
        } else {
            write!(f, "{}:{}-{}", self.file, self.start_line, self.end_line)
        }
    }
}

/// Kind of condition governing a declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardKind {
    /// Enclosing `if` / `elsif` branch.
    If,
    /// Enclosing `unless` block.
    Unless,
    /// `else` branch; the expression lists the conditions that did not hold.
    Else,
    /// `case`/`when` branch.
    When,
    /// Enclosing iteration (`.each`, `for`, `while`).
    Loop,
    /// `begin`/`rescue` branch.
    Rescue,
    /// Any other wrapping block (`with_run_context :root do`).
    Block,
    /// Resource-level `only_if`.
    OnlyIf,
    /// Resource-level `not_if`.
    NotIf,
}

impl fmt::Display for GuardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::If => "if",
            Self::Unless => "unless",
            Self::Else => "else",
            Self::When => "when",
            Self::Loop => "loop",
            Self::Rescue => "rescue",
            Self::Block => "block",
            Self::OnlyIf => "only_if",
            Self::NotIf => "not_if",
        };
        write!(f, "{}", s)
    }
}

/// A guard condition attached to a declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guard {
    pub kind: GuardKind,
    pub expression: String,
}

impl Guard {
    pub fn new(kind: GuardKind, expression: impl Into<String>) -> Self {
        Self {
            kind,
            expression: expression.into(),
        }
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.expression)
    }
}

/// When a notified handler runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timing {
    Immediate,
    #[default]
    Delayed,
}

/// Direction of an edge as written in the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// `notifies`: this declaration triggers the target.
    #[default]
    Notifies,
    /// `subscribes`: the target triggers this declaration.
    Subscribes,
}

/// A notification or subscription between resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEdge {
    /// Target reference, normalized to `type[name]` when possible.
    pub target: String,
    pub action: String,
    pub timing: Timing,
    #[serde(default)]
    pub kind: EdgeKind,
}

/// A single extracted resource declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDeclaration {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    pub properties: IndexMap<String, Value>,
    #[serde(default)]
    pub guards: Vec<Guard>,
    #[serde(default)]
    pub notifies: Vec<NotificationEdge>,
    pub span: SourceSpan,
    /// Body statements that were not understood, verbatim.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unparsed: Vec<String>,
    /// Set when the block terminator was missing.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
}

impl ResourceDeclaration {
    pub fn is_unparsed(&self) -> bool {
        self.resource_type == UNPARSED_TYPE
    }

    /// `type[name]`, the form notification targets use.
    pub fn reference(&self) -> String {
        format!("{}[{}]", self.resource_type, self.name)
    }

    /// The `action` property as a list of action names.
    pub fn actions(&self) -> Vec<String> {
        match self.properties.get("action") {
            Some(Value::List(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(v) => v.as_str().map(|s| vec![s.to_string()]).unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

// ============================================================================
// Recipe units and cookbooks
// ============================================================================

/// Everything extracted from one source file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipeUnit {
    /// Recipe name (file stem).
    pub name: String,
    /// File path relative to the cookbook root.
    pub file: String,
    pub declarations: Vec<ResourceDeclaration>,
    /// Node attribute assignments, keyed by dotted path.
    #[serde(default)]
    pub attributes: IndexMap<String, Value>,
    /// Local variable assignments.
    #[serde(default)]
    pub variables: IndexMap<String, Value>,
    /// Template sources referenced by `template` declarations.
    #[serde(default)]
    pub templates: Vec<String>,
    /// `include_recipe` targets.
    #[serde(default)]
    pub includes: Vec<String>,
    /// Original text, passed to the generator as literal context.
    #[serde(default, skip_serializing)]
    pub source: String,
}

impl RecipeUnit {
    /// Declarations that resolved to a real resource type.
    pub fn resources(&self) -> impl Iterator<Item = &ResourceDeclaration> {
        self.declarations.iter().filter(|d| !d.is_unparsed())
    }

    /// Find a declaration by its `type[name]` reference.
    pub fn find(&self, reference: &str) -> Option<&ResourceDeclaration> {
        self.declarations.iter().find(|d| d.reference() == reference)
    }
}

/// A cookbook dependency from `metadata.rb`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    #[serde(default)]
    pub constraint: Option<String>,
}

/// Parsed `metadata.rb`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookbookMetadata {
    pub name: Option<String>,
    pub version: Option<String>,
    pub maintainer: Option<String>,
    pub maintainer_email: Option<String>,
    pub license: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub supports: Vec<String>,
}

/// A template or static file shipped with the cookbook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookbookFile {
    /// Path relative to `templates/` or `files/`.
    pub path: String,
    /// Text content; `None` for binary files.
    #[serde(default, skip_serializing)]
    pub content: Option<String>,
}

/// A custom resource defined under `resources/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomResourceDef {
    /// Resource type name recipes use (`<cookbook>_<file>` unless overridden).
    pub name: String,
    pub file: String,
    #[serde(default)]
    pub properties: Vec<String>,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub default_action: Option<String>,
}

/// A cookbook and everything extracted from it. Immutable once loaded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedCookbook {
    pub name: String,
    pub path: PathBuf,
    pub metadata: CookbookMetadata,
    pub recipes: Vec<RecipeUnit>,
    /// Attribute files, extracted with the same extractor.
    #[serde(default)]
    pub attribute_files: Vec<RecipeUnit>,
    #[serde(default)]
    pub templates: Vec<CookbookFile>,
    #[serde(default)]
    pub files: Vec<CookbookFile>,
    #[serde(default)]
    pub custom_resources: Vec<CustomResourceDef>,
    #[serde(default)]
    pub libraries: Vec<String>,
}

impl ParsedCookbook {
    /// All declarations across recipes, in recipe then source order.
    pub fn declarations(&self) -> impl Iterator<Item = &ResourceDeclaration> {
        self.recipes.iter().flat_map(|r| r.declarations.iter())
    }

    /// Attribute defaults merged across attribute files and recipes,
    /// attribute files first.
    pub fn attribute_defaults(&self) -> IndexMap<String, Value> {
        let mut merged = IndexMap::new();
        for unit in self.attribute_files.iter().chain(self.recipes.iter()) {
            for (k, v) in &unit.attributes {
                merged.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        merged
    }
}

// ============================================================================
// Tests
// ============================================================================
