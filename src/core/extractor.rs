//! CP-004: Resource extraction from recipe text.
//!
//! `extract` turns one recipe file into a `RecipeUnit`. It never fails:
//! anything it cannot recognize becomes an `__unparsed__` declaration that
//! carries the raw text of its span. Control flow is flattened: declarations
//! inside `if`/`case`/loops are emitted in source order with the governing
//! conditions recorded as guards.

use super::lexer::{self, Block, BlockKind, LogicalLine, Node};
use super::types::{
    EdgeKind, Guard, GuardKind, NotificationEdge, RecipeUnit, ResourceDeclaration, Scalar,
    SourceSpan, Timing, Value, UNPARSED_TYPE,
};
use super::values::{self, parse_value, split_top_level};
use indexmap::IndexMap;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use tracing::debug;

/// Chef built-in resource types recognized even in single-line form.
pub const BUILTIN_RESOURCES: &[&str] = &[
    "apt_package",
    "apt_repository",
    "apt_update",
    "archive_file",
    "bash",
    "chef_gem",
    "cookbook_file",
    "cron",
    "cron_d",
    "csh",
    "directory",
    "dnf_package",
    "execute",
    "file",
    "gem_package",
    "git",
    "group",
    "homebrew_package",
    "hostname",
    "http_request",
    "link",
    "locale",
    "log",
    "mount",
    "ohai",
    "package",
    "perl",
    "powershell_script",
    "python",
    "reboot",
    "remote_directory",
    "remote_file",
    "route",
    "ruby",
    "ruby_block",
    "script",
    "selinux_state",
    "service",
    "snap_package",
    "ssh_known_hosts_entry",
    "swap_file",
    "sysctl",
    "systemd_unit",
    "template",
    "timezone",
    "user",
    "yum_package",
    "yum_repository",
    "zypper_package",
];

/// Words that look like `word arg do` but never start a resource.
const NOT_RESOURCES: &[&str] = &[
    "action",
    "action_class",
    "block",
    "converge_by",
    "define_method",
    "fail",
    "if",
    "include_recipe",
    "lambda",
    "lazy",
    "load_current_value",
    "loop",
    "not_if",
    "only_if",
    "p",
    "pp",
    "print",
    "proc",
    "property",
    "puts",
    "raise",
    "require",
    "require_relative",
    "return",
    "unless",
    "until",
    "while",
    "with_run_context",
];

static RESOURCE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z_][a-z0-9_]*)(?:\s*\((.*)\)|\s+(\S.*))$").expect("valid regex")
});

static PROPERTY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z_][A-Za-z0-9_]*)(?:\s*\((.*)\)|\s+(\S.*))$").expect("valid regex")
});

static LOOP_HEAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\.(each|each_with_index|each_pair|each_key|each_value|each_slice|map|times|upto|downto|step|select|reject)\b",
    )
    .expect("valid regex")
});

static ATTRIBUTE_ASSIGN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:node\.)?(default|override|normal|force_default|force_override|set|default_unless|set_unless|normal_unless|override_unless)((?:\s*\[[^\[\]]+\])+)\s*(?:\|\|)?=\s*(.*)$",
    )
    .expect("valid regex")
});

static VARIABLE_ASSIGN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z_][A-Za-z0-9_]*)\s*(?:\|\|)?=\s*(.*)$").expect("valid regex")
});

static INCLUDE_RECIPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^include_recipe\s*\(?\s*['"]([^'"]+)['"]"#).expect("valid regex")
});

static RESOURCES_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"resources\(\s*:?([a-z_]+)\s*(?:=>|:)\s*['"]([^'"]+)['"]\s*\)"#)
        .expect("valid regex")
});

static HEREDOC_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^<<[~-]?['"]?[A-Z_][A-Z0-9_]*['"]?$"#).expect("valid regex")
});

static HEREDOC_OPENER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<<[~-]|<<['"]"#).expect("valid regex"));

/// Per-file extraction context.
#[derive(Debug, Clone, Default)]
pub struct FileContext {
    /// Path relative to the cookbook root, used in spans.
    pub file: String,
    /// Extra resource types (custom resources of this cookbook).
    pub resource_types: Vec<String>,
}

impl FileContext {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            resource_types: Vec::new(),
        }
    }

    pub fn with_resource_types(mut self, types: impl IntoIterator<Item = String>) -> Self {
        self.resource_types.extend(types);
        self
    }

    fn is_known(&self, resource_type: &str) -> bool {
        BUILTIN_RESOURCES.contains(&resource_type)
            || self.resource_types.iter().any(|t| t == resource_type)
    }
}

/// Extract declarations and file-level metadata from one recipe file.
pub fn extract(source: &str, ctx: &FileContext) -> RecipeUnit {
    let tree = lexer::block_tree(lexer::logical_lines(source));
    let name = Path::new(&ctx.file)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut extraction = Extraction {
        ctx,
        physical: source.lines().collect(),
        unit: RecipeUnit {
            name,
            file: ctx.file.clone(),
            source: source.to_string(),
            ..Default::default()
        },
        pending: None,
    };
    extraction.walk(&tree, &[]);
    extraction.flush();

    let unit = extraction.unit;
    debug!(
        file = %ctx.file,
        declarations = unit.declarations.len(),
        unparsed = unit.declarations.iter().filter(|d| d.is_unparsed()).count(),
        "extracted recipe"
    );
    unit
}

struct PendingRaw {
    start: usize,
    end: usize,
    guards: Vec<Guard>,
}

struct Extraction<'a> {
    ctx: &'a FileContext,
    physical: Vec<&'a str>,
    unit: RecipeUnit,
    pending: Option<PendingRaw>,
}

impl Extraction<'_> {
    fn walk(&mut self, nodes: &[Node], guards: &[Guard]) {
        for node in nodes {
            match node {
                Node::Stmt(line) => self.statement(line, guards),
                Node::Stray(line) => self.raw(line.start, line.end, guards),
                Node::Block(block) => self.block(block, guards),
            }
        }
    }

    fn block(&mut self, block: &Block, guards: &[Guard]) {
        let guards = &scoped(guards, block.modifier.iter().map(modifier_guard).collect());
        match &block.kind {
            BlockKind::Do { head, params } => {
                self.do_block(block, head, params.as_deref(), guards)
            }
            BlockKind::Opaque => self.raw(block.header.start, block.end_line, guards),
            _ => {
                for (branch, extra) in block.branches.iter().zip(branch_guards(block)) {
                    let scoped = scoped(guards, extra);
                    self.walk(&branch.children, &scoped);
                }
            }
        }
    }

    fn do_block(&mut self, block: &Block, head: &str, params: Option<&str>, guards: &[Guard]) {
        let described = match params {
            Some(p) => format!("{} |{}|", head, p),
            None => head.to_string(),
        };
        if head == "loop" || LOOP_HEAD.is_match(head) {
            let scoped = scoped(guards, vec![Guard::new(GuardKind::Loop, described)]);
            for child in block.children() {
                self.walk(std::slice::from_ref(child), &scoped);
            }
            return;
        }
        if let Some((rtype, arg)) = resource_header(head) {
            if !NOT_RESOURCES.contains(&rtype) {
                self.resource(block, rtype, arg, guards);
                return;
            }
        }
        let scoped = scoped(guards, vec![Guard::new(GuardKind::Block, described)]);
        for child in block.children() {
            self.walk(std::slice::from_ref(child), &scoped);
        }
    }

    fn statement(&mut self, line: &LogicalLine, guards: &[Guard]) {
        let (text, modifier) = lexer::split_modifier(&line.text);
        let guards = &scoped(guards, modifier.iter().map(modifier_guard).collect());

        if let Some(inline) = lexer::split_inline_do(text) {
            if self.inline_block(line, &inline, guards) {
                return;
            }
        }

        if let Some(caps) = ATTRIBUTE_ASSIGN.captures(text) {
            if let (Some(path), Some(value)) = (values::index_path(&caps[2]), assigned(&caps[3])) {
                self.flush();
                let value = heredoc_value(line, value).unwrap_or_else(|| parse_value(value));
                self.unit.attributes.insert(path.join("."), value);
                return;
            }
        }

        if let Some(caps) = INCLUDE_RECIPE.captures(text) {
            self.flush();
            self.unit.includes.push(caps[1].to_string());
            return;
        }

        if let Some(caps) = VARIABLE_ASSIGN.captures(text) {
            if let Some(value) = assigned(caps.get(2).map_or("", |m| m.as_str())) {
                self.flush();
                let value = heredoc_value(line, value).unwrap_or_else(|| parse_value(value));
                self.unit.variables.insert(caps[1].to_string(), value);
                return;
            }
        }

        if let Some((rtype, arg)) = resource_header(text) {
            if self.ctx.is_known(rtype) {
                self.flush();
                let parts = split_top_level(arg, ',');
                let mut decl = self.declaration(rtype, arg, line.start, line.end, guards);
                for part in parts.iter().skip(1) {
                    match values::split_pair(part) {
                        Some((key, value)) => {
                            decl.properties.insert(key, parse_value(value));
                        }
                        None => decl.unparsed.push((*part).to_string()),
                    }
                }
                self.push(decl);
                return;
            }
        }

        self.raw(line.start, line.end, guards);
    }

    /// A one-line `do ... end`: a loop over statements or a resource with
    /// `;`-separated properties. Returns false for anything else.
    fn inline_block(
        &mut self,
        line: &LogicalLine,
        inline: &lexer::InlineDo<'_>,
        guards: &[Guard],
    ) -> bool {
        let parts: Vec<LogicalLine> = split_top_level(inline.body, ';')
            .into_iter()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| LogicalLine {
                text: p.to_string(),
                start: line.start,
                end: line.end,
                heredocs: Vec::new(),
            })
            .collect();

        if inline.head == "loop" || LOOP_HEAD.is_match(inline.head) {
            let described = match inline.params {
                Some(p) => format!("{} |{}|", inline.head, p),
                None => inline.head.to_string(),
            };
            let scoped = scoped(guards, vec![Guard::new(GuardKind::Loop, described)]);
            for part in &parts {
                self.statement(part, &scoped);
            }
            return true;
        }

        let Some((rtype, arg)) = resource_header(inline.head) else {
            return false;
        };
        if NOT_RESOURCES.contains(&rtype) {
            return false;
        }
        self.flush();
        let mut decl = self.declaration(rtype, arg, line.start, line.end, guards);
        for part in &parts {
            self.body_statement(&mut decl, part);
        }
        self.push(decl);
        true
    }

    fn resource(&mut self, block: &Block, rtype: &str, arg: &str, guards: &[Guard]) {
        self.flush();
        let mut decl = self.declaration(rtype, arg, block.header.start, block.end_line, guards);
        decl.partial = !block.closed;

        let mut nested = Vec::new();
        for node in block.children() {
            match node {
                Node::Stmt(line) => self.body_statement(&mut decl, line),
                Node::Stray(line) => decl.unparsed.push(self.text(line.start, line.end)),
                Node::Block(inner) => self.body_block(&mut decl, inner, &mut nested),
            }
        }
        self.push(decl);

        for (inner, inner_type, inner_arg) in nested {
            self.resource(inner, inner_type, inner_arg, guards);
        }
    }

    fn body_statement(&mut self, decl: &mut ResourceDeclaration, line: &LogicalLine) {
        let text = line.text.as_str();
        let word = leading_word(text);
        let rest = text[word.len()..].trim();

        match word {
            "notifies" | "subscribes" => match parse_edge(word, rest) {
                Some(edge) => decl.notifies.push(edge),
                None => decl.unparsed.push(self.text(line.start, line.end)),
            },
            "only_if" | "not_if" if !rest.is_empty() => {
                let kind = if word == "only_if" {
                    GuardKind::OnlyIf
                } else {
                    GuardKind::NotIf
                };
                decl.guards.push(Guard::new(kind, guard_expression(rest)));
            }
            _ => match property(text) {
                Some((key, arg)) => {
                    let value = heredoc_value(line, arg).unwrap_or_else(|| parse_value(arg));
                    decl.properties.insert(key.to_string(), value);
                }
                None => decl.unparsed.push(self.text(line.start, line.end)),
            },
        }
    }

    fn body_block<'t>(
        &mut self,
        decl: &mut ResourceDeclaration,
        inner: &'t Block,
        nested: &mut Vec<(&'t Block, &'t str, &'t str)>,
    ) {
        let BlockKind::Do { head, .. } = &inner.kind else {
            decl.unparsed.push(self.text(inner.header.start, inner.end_line));
            return;
        };
        let word = leading_word(head);
        if word == "only_if" || word == "not_if" {
            let kind = if word == "only_if" {
                GuardKind::OnlyIf
            } else {
                GuardKind::NotIf
            };
            let body = self.interior(inner);
            decl.guards.push(Guard::new(kind, body));
            return;
        }
        if let Some((rtype, arg)) = resource_header(head) {
            let quoted_name = matches!(
                parse_value(split_top_level(arg, ',').first().copied().unwrap_or("")),
                Value::Scalar(Scalar::String(_))
            ) || arg.starts_with('"');
            if !NOT_RESOURCES.contains(&rtype) && (self.ctx.is_known(rtype) || quoted_name) {
                nested.push((inner, rtype, arg));
                return;
            }
        }
        if !word.is_empty() {
            let text = self.text(inner.header.start, inner.end_line);
            decl.properties.insert(word.to_string(), Value::Raw(text));
        } else {
            decl.unparsed.push(self.text(inner.header.start, inner.end_line));
        }
    }

    fn declaration(
        &self,
        rtype: &str,
        arg: &str,
        start: usize,
        end: usize,
        guards: &[Guard],
    ) -> ResourceDeclaration {
        ResourceDeclaration {
            resource_type: rtype.to_string(),
            name: resource_name(arg, rtype, start),
            properties: IndexMap::new(),
            guards: guards.to_vec(),
            notifies: Vec::new(),
            span: self.span(start, end),
            unparsed: Vec::new(),
            partial: false,
        }
    }

    fn push(&mut self, decl: ResourceDeclaration) {
        if decl.resource_type == "template" {
            let source = decl
                .properties
                .get("source")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| default_template_source(&decl.name));
            if !self.unit.templates.contains(&source) {
                self.unit.templates.push(source);
            }
        }
        self.unit.declarations.push(decl);
    }

    /// Record an unrecognized span, merging it with the previous one when
    /// nothing recognized sits between them and the guards match.
    fn raw(&mut self, start: usize, end: usize, guards: &[Guard]) {
        if let Some(pending) = &mut self.pending {
            if pending.guards == guards && pending.end < start {
                pending.end = end;
                return;
            }
        }
        self.flush();
        self.pending = Some(PendingRaw {
            start,
            end,
            guards: guards.to_vec(),
        });
    }

    fn flush(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let text = self.text(pending.start, pending.end);
        let mut properties = IndexMap::new();
        properties.insert("source".to_string(), Value::Raw(text));
        self.unit.declarations.push(ResourceDeclaration {
            resource_type: UNPARSED_TYPE.to_string(),
            name: format!("{}:{}", self.ctx.file, pending.start),
            properties,
            guards: pending.guards,
            notifies: Vec::new(),
            span: self.span(pending.start, pending.end),
            unparsed: Vec::new(),
            partial: false,
        });
    }

    fn span(&self, start: usize, end: usize) -> SourceSpan {
        SourceSpan {
            file: self.ctx.file.clone(),
            start_line: start,
            end_line: end.max(start),
        }
    }

    /// Physical lines `start..=end` (1-based), verbatim.
    fn text(&self, start: usize, end: usize) -> String {
        let from = start.saturating_sub(1).min(self.physical.len());
        let to = end.min(self.physical.len()).max(from);
        self.physical[from..to].join("\n")
    }

    /// Lines strictly between a block's header and its `end`, trimmed.
    fn interior(&self, block: &Block) -> String {
        let last = if block.closed {
            block.end_line.saturating_sub(1)
        } else {
            block.end_line
        };
        self.text(block.header.end + 1, last)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

fn modifier_guard(modifier: &lexer::Modifier) -> Guard {
    let kind = if modifier.keyword == "unless" {
        GuardKind::Unless
    } else {
        GuardKind::If
    };
    Guard::new(kind, modifier.condition.clone())
}

fn scoped(outer: &[Guard], extra: Vec<Guard>) -> Vec<Guard> {
    let mut guards = outer.to_vec();
    guards.extend(extra);
    guards
}

/// Guards contributed by each arm of a control block.
fn branch_guards(block: &Block) -> Vec<Vec<Guard>> {
    let mut prior: Vec<String> = Vec::new();
    let subject = block
        .branches
        .first()
        .map(|b| b.condition.clone())
        .unwrap_or_default();

    block
        .branches
        .iter()
        .map(|branch| {
            let cond = branch.condition.clone();
            match (&block.kind, branch.keyword.as_str()) {
                (BlockKind::If, "if") => {
                    prior.push(cond.clone());
                    vec![Guard::new(GuardKind::If, cond)]
                }
                (BlockKind::Unless, "unless") => {
                    prior.push(format!("!({})", cond));
                    vec![Guard::new(GuardKind::Unless, cond)]
                }
                (BlockKind::If | BlockKind::Unless, "elsif") => {
                    let guards = vec![
                        Guard::new(GuardKind::Else, prior.join(" || ")),
                        Guard::new(GuardKind::If, cond.clone()),
                    ];
                    prior.push(cond);
                    guards
                }
                (BlockKind::Case, "when") => {
                    let expr = if subject.is_empty() {
                        cond
                    } else {
                        format!("{} == {}", subject, cond)
                    };
                    prior.push(expr.clone());
                    vec![Guard::new(GuardKind::When, expr)]
                }
                (BlockKind::If | BlockKind::Unless | BlockKind::Case, "else") => {
                    vec![Guard::new(GuardKind::Else, prior.join(" || "))]
                }
                (BlockKind::Loop, _) => vec![Guard::new(GuardKind::Loop, block.header.text.clone())],
                (_, "rescue") => {
                    let expr = if cond.is_empty() {
                        "StandardError".to_string()
                    } else {
                        cond
                    };
                    vec![Guard::new(GuardKind::Rescue, expr)]
                }
                _ => Vec::new(),
            }
        })
        .collect()
}

fn leading_word(text: &str) -> &str {
    let end = text
        .char_indices()
        .find(|&(_, c)| !(c.is_ascii_alphanumeric() || c == '_'))
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    &text[..end]
}

/// The right-hand side of an assignment, unless the `=` was really `==`,
/// `=~` or `=>`.
fn assigned(rhs: &str) -> Option<&str> {
    let rhs = rhs.trim();
    if rhs.is_empty() || rhs.starts_with(['=', '~', '>']) {
        return None;
    }
    Some(rhs)
}

/// `type 'name'` / `type('name')` → `(type, arg)`.
fn resource_header(text: &str) -> Option<(&str, &str)> {
    let caps = RESOURCE_HEADER.captures(text)?;
    let rtype = caps.get(1)?.as_str();
    let arg = caps.get(2).or_else(|| caps.get(3))?.as_str().trim();
    if arg.is_empty() || arg.starts_with(['=', '.', '?', '+', '*', '/', '<', '|', '&', '-']) {
        return None;
    }
    Some((rtype, arg))
}

/// `key value` / `key(value)` → `(key, value)`.
fn property(text: &str) -> Option<(&str, &str)> {
    let caps = PROPERTY.captures(text)?;
    let key = caps.get(1)?.as_str();
    let arg = caps.get(2).or_else(|| caps.get(3))?.as_str().trim();
    if arg.starts_with(['=', '+', '-', '*', '/', '<', '|', '&', '?', '.'])
        && !arg.starts_with("->")
        && !arg.starts_with("<<")
    {
        return None;
    }
    Some((key, arg))
}

fn resource_name(arg: &str, rtype: &str, line: usize) -> String {
    let first = split_top_level(arg, ',').first().copied().unwrap_or("").trim();
    let name = match parse_value(first) {
        Value::Scalar(s) => s.to_string(),
        Value::Reference(r) => r,
        _ => first
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .unwrap_or(first)
            .to_string(),
    };
    if name.trim().is_empty() {
        format!("{}@{}", rtype, line)
    } else {
        name
    }
}

fn default_template_source(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    format!("{}.erb", base)
}

fn parse_edge(word: &str, rest: &str) -> Option<NotificationEdge> {
    let args = rest
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .unwrap_or(rest);
    let parts = split_top_level(args, ',');
    if parts.len() < 2 {
        return None;
    }

    let action = match parse_value(parts[0]) {
        Value::Scalar(s) => s.to_string(),
        _ => return None,
    };
    let target = match parse_value(parts[1]) {
        Value::Scalar(Scalar::String(s)) => s,
        _ => match RESOURCES_CALL.captures(parts[1]) {
            Some(caps) => format!("{}[{}]", &caps[1], &caps[2]),
            None => unquote(parts[1].trim()).to_string(),
        },
    };
    let timing = match parts.get(2).map(|p| parse_value(p)) {
        Some(v) if matches!(v.as_str(), Some("immediately" | "immediate" | "before")) => {
            Timing::Immediate
        }
        _ => Timing::Delayed,
    };
    let kind = if word == "subscribes" {
        EdgeKind::Subscribes
    } else {
        EdgeKind::Notifies
    };
    Some(NotificationEdge {
        target,
        action,
        timing,
        kind,
    })
}

/// Strip one pair of matching quotes, keeping `#{...}` text as written.
fn unquote(text: &str) -> &str {
    for q in ['"', '\''] {
        if let Some(inner) = text.strip_prefix(q).and_then(|t| t.strip_suffix(q)) {
            return inner;
        }
    }
    text
}

fn guard_expression(rest: &str) -> String {
    let rest = rest.trim();
    if let Some(inner) = rest.strip_prefix('{').and_then(|r| r.strip_suffix('}')) {
        return inner.trim().to_string();
    }
    match parse_value(rest) {
        Value::Scalar(Scalar::String(s)) => s,
        _ => rest.to_string(),
    }
}

/// A heredoc opener used as a value resolves to its collected body.
fn heredoc_value(line: &LogicalLine, arg: &str) -> Option<Value> {
    let arg = arg.trim();
    if !HEREDOC_TOKEN.is_match(arg) {
        return None;
    }
    let pos = line.text.find(arg)?;
    let index = HEREDOC_OPENER.find_iter(&line.text[..pos]).count();
    line.heredocs.get(index).map(|body| Value::string(body.clone()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ctx() -> FileContext {
        FileContext::new("recipes/default.rb")
    }

    fn types(unit: &RecipeUnit) -> Vec<&str> {
        unit.declarations
            .iter()
            .map(|d| d.resource_type.as_str())
            .collect()
    }

    const WEB_RECIPE: &str = r#"package 'nginx' do
  action :install
end

directory '/var/www/html' do
  owner 'www-data'
  mode '0755'
  recursive true
end

template '/etc/nginx/nginx.conf' do
  source 'nginx.conf.erb'
  variables(port: node['nginx']['port'])
  notifies :reload, 'service[nginx]', :delayed
end

service 'nginx' do
  action [:enable, :start]
end
"#;

    #[test]
    fn test_cp004_web_recipe_four_declarations() {
        let unit = extract(WEB_RECIPE, &ctx());
        assert_eq!(types(&unit), vec!["package", "directory", "template", "service"]);
        assert_eq!(unit.name, "default");

        let template = &unit.declarations[2];
        assert_eq!(template.name, "/etc/nginx/nginx.conf");
        assert_eq!(template.notifies.len(), 1);
        let edge = &template.notifies[0];
        assert_eq!(edge.target, "service[nginx]");
        assert_eq!(edge.action, "reload");
        assert_eq!(edge.timing, Timing::Delayed);
        assert_eq!(edge.kind, EdgeKind::Notifies);

        let edges: usize = unit.declarations.iter().map(|d| d.notifies.len()).sum();
        assert_eq!(edges, 1);
        assert_eq!(unit.templates, vec!["nginx.conf.erb"]);
    }

    #[test]
    fn test_cp004_properties_and_spans() {
        let unit = extract(WEB_RECIPE, &ctx());
        let package = &unit.declarations[0];
        assert_eq!((package.span.start_line, package.span.end_line), (1, 3));
        assert_eq!(package.properties["action"], Value::symbol("install"));

        let dir = &unit.declarations[1];
        assert_eq!(dir.properties["mode"], Value::string("0755"));
        assert_eq!(dir.properties["recursive"], Value::Scalar(Scalar::Bool(true)));
        let keys: Vec<_> = dir.properties.keys().collect();
        assert_eq!(keys, vec!["owner", "mode", "recursive"]);

        let Value::Map(vars) = &unit.declarations[2].properties["variables"] else {
            panic!("variables should be a map")
        };
        assert_eq!(vars["port"], Value::Reference("node.nginx.port".into()));

        let service = &unit.declarations[3];
        assert_eq!(service.actions(), vec!["enable", "start"]);
    }

    #[test]
    fn test_cp004_if_else_guards() {
        let src = "if platform_family?('debian')\n  package 'apache2'\nelse\n  package 'httpd'\nend\n";
        let unit = extract(src, &ctx());
        assert_eq!(unit.declarations.len(), 2);
        assert_eq!(
            unit.declarations[0].guards,
            vec![Guard::new(GuardKind::If, "platform_family?('debian')")]
        );
        assert_eq!(
            unit.declarations[1].guards,
            vec![Guard::new(GuardKind::Else, "platform_family?('debian')")]
        );
    }

    #[test]
    fn test_cp004_case_when_guards() {
        let src = "case node['platform']\nwhen 'ubuntu'\n  package 'apache2'\nwhen 'centos'\n  package 'httpd'\nend\n";
        let unit = extract(src, &ctx());
        assert_eq!(unit.declarations.len(), 2);
        assert_eq!(
            unit.declarations[1].guards[0],
            Guard::new(GuardKind::When, "node['platform'] == 'centos'")
        );
    }

    #[test]
    fn test_cp004_loop_flattened() {
        let src = "%w(git curl).each do |pkg|\n  package pkg do\n    action :install\n  end\nend\n";
        let unit = extract(src, &ctx());
        assert_eq!(types(&unit), vec!["package"]);
        let decl = &unit.declarations[0];
        assert_eq!(decl.name, "pkg");
        assert_eq!(
            decl.guards,
            vec![Guard::new(GuardKind::Loop, "%w(git curl).each |pkg|")]
        );
    }

    #[test]
    fn test_cp004_resource_guards_and_subscribes() {
        let src = r#"execute 'apt-get update' do
  command 'apt-get update'
  only_if { ::File.exist?('/usr/bin/apt-get') }
  not_if 'test -f /tmp/done'
  subscribes :run, 'template[/etc/apt/sources.list]', :immediately
end
"#;
        let unit = extract(src, &ctx());
        let decl = &unit.declarations[0];
        assert_eq!(
            decl.guards,
            vec![
                Guard::new(GuardKind::OnlyIf, "::File.exist?('/usr/bin/apt-get')"),
                Guard::new(GuardKind::NotIf, "test -f /tmp/done"),
            ]
        );
        assert_eq!(decl.notifies[0].kind, EdgeKind::Subscribes);
        assert_eq!(decl.notifies[0].timing, Timing::Immediate);
    }

    #[test]
    fn test_cp004_only_if_block_form() {
        let src = "service 'x' do\n  only_if do\n    node['x']['enabled']\n  end\nend\n";
        let unit = extract(src, &ctx());
        assert_eq!(
            unit.declarations[0].guards,
            vec![Guard::new(GuardKind::OnlyIf, "node['x']['enabled']")]
        );
    }

    #[test]
    fn test_cp004_resources_call_target() {
        let src = "template '/a' do\n  notifies :restart, resources(service: 'nginx')\nend\n";
        let unit = extract(src, &ctx());
        assert_eq!(unit.declarations[0].notifies[0].target, "service[nginx]");
    }

    #[test]
    fn test_cp004_unrecognized_becomes_unparsed_verbatim() {
        let src = "package 'a'\nChef::Log.info('hello')\nputs node.name\npackage 'b'\n";
        let unit = extract(src, &ctx());
        assert_eq!(types(&unit), vec!["package", UNPARSED_TYPE, "package"]);
        let raw = &unit.declarations[1];
        assert_eq!(raw.name, "recipes/default.rb:2");
        assert_eq!((raw.span.start_line, raw.span.end_line), (2, 3));
        assert_eq!(
            raw.properties["source"],
            Value::Raw("Chef::Log.info('hello')\nputs node.name".into())
        );
    }

    #[test]
    fn test_cp004_def_block_opaque() {
        let src = "def helper(x)\n  x * 2\nend\npackage 'z'\n";
        let unit = extract(src, &ctx());
        assert_eq!(types(&unit), vec![UNPARSED_TYPE, "package"]);
        assert_eq!(unit.declarations[0].span.end_line, 3);
    }

    #[test]
    fn test_cp004_unclosed_block_is_partial() {
        let src = "package 'nginx' do\n  action :install\n";
        let unit = extract(src, &ctx());
        assert_eq!(unit.declarations.len(), 1);
        assert!(unit.declarations[0].partial);
        assert_eq!(unit.declarations[0].span.end_line, 2);
    }

    #[test]
    fn test_cp004_unknown_body_lines_preserved() {
        let src = "file '/tmp/x' do\n  content 'hi'\n  Chef::Log.warn('x')\nend\n";
        let unit = extract(src, &ctx());
        let decl = &unit.declarations[0];
        assert_eq!(decl.unparsed, vec!["  Chef::Log.warn('x')"]);
        assert_eq!(decl.properties["content"], Value::string("hi"));
    }

    #[test]
    fn test_cp004_nested_resource_marker_emitted_after_parent() {
        let src = "my_app 'site' do\n  port 80\n  template '/etc/site.conf' do\n    source 'site.erb'\n  end\nend\n";
        let unit = extract(src, &ctx());
        assert_eq!(types(&unit), vec!["my_app", "template"]);
        assert!(!unit.declarations[0].properties.contains_key("template"));
        assert_eq!(unit.declarations[1].span.start_line, 3);
        assert_eq!(unit.templates, vec!["site.erb"]);
    }

    #[test]
    fn test_cp004_property_block_kept_raw() {
        let src = "ruby_block 'x' do\n  block do\n    puts 1\n  end\nend\n";
        let unit = extract(src, &ctx());
        assert_eq!(unit.declarations.len(), 1);
        assert!(unit.declarations[0].properties["block"].is_raw());
    }

    #[test]
    fn test_cp004_heredoc_property() {
        let src = "bash 'build' do\n  code <<-EOH\n    make\n  EOH\nend\n";
        let unit = extract(src, &ctx());
        assert_eq!(unit.declarations[0].properties["code"], Value::string("    make"));
    }

    #[test]
    fn test_cp004_attributes_variables_includes() {
        let src = "default['nginx']['port'] = 80\nnode.override[:nginx][:user] = 'www'\ninclude_recipe 'apt::default'\nconf_dir = '/etc/nginx'\n";
        let unit = extract(src, &FileContext::new("attributes/default.rb"));
        assert!(unit.declarations.is_empty());
        assert_eq!(unit.attributes["nginx.port"], Value::Scalar(Scalar::Integer(80)));
        assert_eq!(unit.attributes["nginx.user"], Value::string("www"));
        assert_eq!(unit.includes, vec!["apt::default"]);
        assert_eq!(unit.variables["conf_dir"], Value::string("/etc/nginx"));
    }

    #[test]
    fn test_cp004_comparison_is_not_assignment() {
        let unit = extract("x == 1\n", &ctx());
        assert_eq!(types(&unit), vec![UNPARSED_TYPE]);
    }

    #[test]
    fn test_cp004_single_line_known_and_custom() {
        let c = ctx().with_resource_types(vec!["myapp_site".to_string()]);
        let unit = extract("package 'curl'\nmyapp_site 'blog'\nfrobnicate 'x'\n", &c);
        assert_eq!(types(&unit), vec!["package", "myapp_site", UNPARSED_TYPE]);
    }

    #[test]
    fn test_cp004_unknown_block_type_still_declaration() {
        let unit = extract("mysql_database 'app' do\n  connection mysql_conn\nend\n", &ctx());
        assert_eq!(types(&unit), vec!["mysql_database"]);
        assert_eq!(
            unit.declarations[0].properties["connection"],
            Value::Reference("mysql_conn".into())
        );
    }

    #[test]
    fn test_cp004_template_default_source() {
        let unit = extract("template '/etc/motd' do\n  mode '0644'\nend\n", &ctx());
        assert_eq!(unit.templates, vec!["motd.erb"]);
    }

    #[test]
    fn test_cp004_stray_end_unparsed() {
        let unit = extract("package 'a'\nend\n", &ctx());
        assert_eq!(types(&unit), vec!["package", UNPARSED_TYPE]);
    }

    #[test]
    fn test_cp004_wrapping_block_guard() {
        let src = "with_run_context :root do\n  package 'x'\nend\n";
        let unit = extract(src, &ctx());
        assert_eq!(
            unit.declarations[0].guards,
            vec![Guard::new(GuardKind::Block, "with_run_context :root")]
        );
    }

    #[test]
    fn test_cp004_modifier_if_single_line() {
        let src = "package 'curl' if node['install_curl']
service 'ntp' unless node['virtual']
";
        let unit = extract(src, &ctx());
        assert_eq!(types(&unit), vec!["package", "service"]);
        assert_eq!(unit.declarations[0].name, "curl");
        assert_eq!(
            unit.declarations[0].guards,
            vec![Guard::new(GuardKind::If, "node['install_curl']")]
        );
        assert_eq!(unit.declarations[1].name, "ntp");
        assert_eq!(
            unit.declarations[1].guards,
            vec![Guard::new(GuardKind::Unless, "node['virtual']")]
        );
    }

    #[test]
    fn test_cp004_end_modifier_guards_block() {
        let src = "package 'git' do
  action :install
end if node['git']

service 'nginx' do
  action :start
end
";
        let unit = extract(src, &ctx());
        assert_eq!(types(&unit), vec!["package", "service"]);

        let git = &unit.declarations[0];
        assert!(!git.partial);
        assert_eq!((git.span.start_line, git.span.end_line), (1, 3));
        assert_eq!(git.guards, vec![Guard::new(GuardKind::If, "node['git']")]);

        let nginx = &unit.declarations[1];
        assert!(nginx.guards.is_empty());
        assert!(!nginx.partial);
    }

    #[test]
    fn test_cp004_modifier_inside_if_block_stacks() {
        let src = "if platform?('ubuntu')
  package 'ufw' unless node['firewall'] == 'none'
end
";
        let unit = extract(src, &ctx());
        assert_eq!(
            unit.declarations[0].guards,
            vec![
                Guard::new(GuardKind::If, "platform?('ubuntu')"),
                Guard::new(GuardKind::Unless, "node['firewall'] == 'none'"),
            ]
        );
    }

    #[test]
    fn test_cp004_one_line_do_block() {
        let src = "service 'nginx' do action :restart end
package 'a'
";
        let unit = extract(src, &ctx());
        assert_eq!(types(&unit), vec!["service", "package"]);
        let decl = &unit.declarations[0];
        assert_eq!(decl.name, "nginx");
        assert_eq!(decl.properties.get("action"), Some(&Value::symbol("restart")));
        assert!(decl.unparsed.is_empty());
    }

    #[test]
    fn test_cp004_one_line_do_block_with_semicolons_and_modifier() {
        let src = "file '/etc/motd' do; content 'hi'; mode '0644'; end if node['motd']
";
        let unit = extract(src, &ctx());
        let decl = &unit.declarations[0];
        assert_eq!(decl.resource_type, "file");
        assert_eq!(decl.name, "/etc/motd");
        assert_eq!(decl.properties.get("content"), Some(&Value::string("hi")));
        assert_eq!(decl.properties.get("mode"), Some(&Value::string("0644")));
        assert_eq!(decl.guards, vec![Guard::new(GuardKind::If, "node['motd']")]);
    }

    #[test]
    fn test_cp004_one_line_loop() {
        let src = "%w(git curl).each do |pkg| package pkg end
";
        let unit = extract(src, &ctx());
        assert_eq!(types(&unit), vec!["package"]);
        assert_eq!(
            unit.declarations[0].guards,
            vec![Guard::new(GuardKind::Loop, "%w(git curl).each |pkg|")]
        );
    }

    #[test]
    fn test_cp004_interpolated_notify_target_unquoted() {
        let src = "template '/a' do
  notifies :restart, \"service[#{svc}]\", :immediately
end
";
        let unit = extract(src, &ctx());
        let edge = &unit.declarations[0].notifies[0];
        assert_eq!(edge.target, "service[#{svc}]");
        assert_eq!(edge.timing, Timing::Immediate);
    }

    const TYPES: &[&str] = &["package", "service", "template", "mysql_database", "myapp_thing"];

    proptest! {
        #[test]
        fn test_cp004_never_panics(src in "\\PC{0,200}") {
            let unit = extract(&src, &ctx());
            for d in &unit.declarations {
                prop_assert!(!d.resource_type.is_empty());
                prop_assert!(!d.name.is_empty());
                prop_assert!(d.span.start_line <= d.span.end_line);
            }
        }

        #[test]
        fn test_cp004_never_panics_rubyish(
            lines in prop::collection::vec(
                prop::sample::select(vec![
                    "package 'x' do", "end", "if y", "else", "  action :install",
                    "notifies :restart, 'service[a]'", "code <<-EOH", "EOH", "x = [",
                    "'unterminated", "case z", "when 1", "%w(a b).each do |p|", "}",
                    "only_if { true }", "def f", "# comment", "",
                ]),
                0..40,
            )
        ) {
            let src = lines.join("\n");
            let _ = extract(&src, &ctx());
        }

        #[test]
        fn test_cp004_counts_every_declaration(
            decls in prop::collection::vec((0..TYPES.len(), "[a-z]{1,8}", 0usize..3), 0..20)
        ) {
            let mut src = String::new();
            for (t, name, props) in &decls {
                src.push_str(&format!("{} '{}' do\n", TYPES[*t], name));
                for i in 0..*props {
                    src.push_str(&format!("  prop{} 'v{}'\n", i, i));
                }
                src.push_str("end\n\n");
            }
            let unit = extract(&src, &ctx());
            prop_assert_eq!(unit.resources().count(), decls.len());
            prop_assert_eq!(unit.declarations.len(), decls.len());
        }
    }
}
