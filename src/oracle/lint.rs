//! CP-014: Validation gateway backed by built-in role checks and, when
//! available, `ansible-lint` / `ansible-playbook --syntax-check`.
//!
//! Built-in checks always run:
//! - required files (`tasks/main.yml`, `meta/main.yml`)
//! - YAML syntax of every `.yml` / `.yaml` file
//! - task and handler files are lists of mappings
//! - module names are fully qualified (`ansible.builtin.copy`, not `copy`)
//! - tasks have names
//! - every `notify` target matches a handler `name` or `listen`

use super::exec::{self, ExecError};
use super::{Diagnostic, GatewayError, Severity, ValidationGateway, ValidationReport};
use crate::config::ValidationConfig;
use crate::convert::artifact::ArtifactTree;
use regex::Regex;
use serde_yaml_ng::Value as Yaml;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};

pub const REQUIRED_FILES: &[&str] = &["tasks/main.yml", "meta/main.yml"];

const SCRATCH_ROLE: &str = "candidate";

/// Keys that are task keywords rather than module invocations.
const TASK_KEYWORDS: &[&str] = &[
    "name", "when", "notify", "register", "become", "become_user", "become_method", "tags",
    "loop", "loop_control", "vars", "ignore_errors", "changed_when", "failed_when", "block",
    "rescue", "always", "listen", "delegate_to", "environment", "args", "no_log", "until",
    "retries", "delay", "run_once", "check_mode", "diff", "any_errors_fatal", "collections",
    "debugger", "throttle", "timeout", "module_defaults", "local_action", "action",
    "ignore_unreachable", "delegate_facts", "connection", "port", "remote_user",
];

static LINT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<path>[^:\s]+):(?P<line>\d+)(?::\d+)?:\s*\[?(?P<code>[A-Za-z][\w-]*(?:\[[^\]]*\])?)\]?:?\s*(?P<msg>.*)$")
        .expect("valid regex")
});

/// Gateway that checks a candidate role.
#[derive(Debug, Clone)]
pub struct LintGateway {
    config: ValidationConfig,
    timeout: Duration,
}

impl LintGateway {
    pub fn new(config: ValidationConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }

    /// Built-in checks only; never spawns anything.
    pub fn builtin_only() -> Self {
        Self::new(
            ValidationConfig {
                ansible_lint: String::new(),
                require_external_lint: false,
                syntax_check: false,
            },
            Duration::from_secs(60),
        )
    }

    fn wants_external(&self) -> bool {
        !self.config.ansible_lint.is_empty() || self.config.syntax_check
    }

    fn run_external(&self, artifact: &ArtifactTree) -> Result<Vec<Diagnostic>, GatewayError> {
        let scratch = tempfile::tempdir()
            .map_err(|e| GatewayError::Unavailable(format!("scratch dir: {}", e)))?;
        let role_dir = scratch.path().join("roles").join(SCRATCH_ROLE);
        artifact
            .write_to(&role_dir)
            .map_err(|e| GatewayError::Unavailable(format!("scratch copy: {}", e)))?;

        let mut out = Vec::new();
        if !self.config.ansible_lint.is_empty() {
            if let Some(found) = self.tool(
                &self.config.ansible_lint,
                &["-p", "--nocolor", "."],
                &role_dir,
            )? {
                out.extend(parse_lint_output(&found));
            }
        }
        if self.config.syntax_check {
            let playbook = format!(
                "- hosts: localhost\n  gather_facts: false\n  roles:\n    - {}\n",
                SCRATCH_ROLE
            );
            std::fs::write(scratch.path().join("site.yml"), playbook)
                .map_err(|e| GatewayError::Unavailable(format!("scratch playbook: {}", e)))?;
            if let Some(found) = self.tool(
                "ansible-playbook",
                &["--syntax-check", "site.yml"],
                scratch.path(),
            )? {
                if !found.success() {
                    let detail = last_lines(&found.stderr, 5);
                    out.push(Diagnostic::error("syntax-check[failed]", detail));
                }
            }
        }
        Ok(out)
    }

    /// Run one external tool. `Ok(None)` means it is absent and optional.
    fn tool(
        &self,
        program: &str,
        args: &[&str],
        cwd: &Path,
    ) -> Result<Option<exec::ExecOutput>, GatewayError> {
        match exec::run(program, args, Some(cwd), self.timeout) {
            Ok(out) => Ok(Some(out)),
            Err(ExecError::Timeout { timeout, .. }) => Err(GatewayError::Timeout(timeout)),
            Err(e) if e.is_not_found() && !self.config.require_external_lint => {
                warn!(program, "not installed, skipping external check");
                Ok(None)
            }
            Err(e) => Err(GatewayError::Unavailable(e.to_string())),
        }
    }
}

impl ValidationGateway for LintGateway {
    fn validate(&self, artifact: &ArtifactTree) -> Result<ValidationReport, GatewayError> {
        let mut diagnostics = check_role(artifact);
        if self.wants_external() {
            diagnostics.extend(self.run_external(artifact)?);
        }
        debug!(count = diagnostics.len(), "validation finished");
        Ok(ValidationReport::from_diagnostics(diagnostics))
    }
}

// ============================================================================
// Built-in checks
// ============================================================================

/// All built-in checks over a candidate role.
pub fn check_role(tree: &ArtifactTree) -> Vec<Diagnostic> {
    let mut out = Vec::new();

    for required in REQUIRED_FILES {
        if !tree.contains(required) {
            out.push(
                Diagnostic::error("required-file[missing]", format!("{} is missing", required))
                    .at(*required),
            );
        }
    }

    let mut handlers = BTreeSet::new();
    let mut notified: Vec<(String, String)> = Vec::new();

    for (path, content) in tree.iter() {
        if !is_yaml(path) {
            continue;
        }
        let doc = match serde_yaml_ng::from_str::<Yaml>(content) {
            Ok(doc) => doc,
            Err(e) => {
                let loc = match e.location() {
                    Some(l) => format!("{}:{}", path, l.line()),
                    None => path.to_string(),
                };
                out.push(Diagnostic::error("yaml[syntax]", e.to_string()).at(loc));
                continue;
            }
        };

        let is_tasks = path.starts_with("tasks/");
        let is_handlers = path.starts_with("handlers/");
        if !(is_tasks || is_handlers) {
            continue;
        }
        let Some(items) = task_list(&doc, path, &mut out) else {
            continue;
        };
        for (i, task) in items.iter().enumerate() {
            let loc = format!("{}#{}", path, i + 1);
            check_task(task, &loc, &mut out, &mut notified);
            if is_handlers {
                collect_handler_names(task, &mut handlers);
            }
        }
    }

    for (target, loc) in notified {
        if !handlers.contains(&target) {
            out.push(
                Diagnostic::error(
                    "notify[missing-handler]",
                    format!("notify target '{}' matches no handler name or listen", target),
                )
                .at(loc),
            );
        }
    }
    out
}

fn is_yaml(path: &str) -> bool {
    path.ends_with(".yml") || path.ends_with(".yaml")
}

/// The document as a list of mappings; pushes a schema diagnostic otherwise.
fn task_list<'a>(doc: &'a Yaml, path: &str, out: &mut Vec<Diagnostic>) -> Option<Vec<&'a Yaml>> {
    match doc {
        Yaml::Null => Some(Vec::new()),
        Yaml::Sequence(items) => {
            let mut tasks = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                if item.is_mapping() {
                    tasks.push(item);
                } else {
                    out.push(
                        Diagnostic::error("schema[tasks]", "each task must be a mapping")
                            .at(format!("{}#{}", path, i + 1)),
                    );
                }
            }
            Some(tasks)
        }
        _ => {
            out.push(
                Diagnostic::error("schema[tasks]", "task file must be a list of tasks").at(path),
            );
            None
        }
    }
}

fn check_task(
    task: &Yaml,
    loc: &str,
    out: &mut Vec<Diagnostic>,
    notified: &mut Vec<(String, String)>,
) {
    let Some(map) = task.as_mapping() else {
        return;
    };
    let keys: Vec<&str> = map.keys().filter_map(Yaml::as_str).collect();

    let is_block = keys.contains(&"block");
    if !is_block && !keys.contains(&"name") {
        out.push(Diagnostic::warning("name[missing]", "all tasks should be named").at(loc));
    }

    let modules: Vec<&str> = keys
        .iter()
        .copied()
        .filter(|k| !TASK_KEYWORDS.contains(k) && !k.starts_with("with_"))
        .collect();
    if !is_block && modules.is_empty() && !keys.contains(&"action") && !keys.contains(&"local_action") {
        out.push(Diagnostic::error("schema[tasks]", "task has no module").at(loc));
    }
    if modules.len() > 1 {
        out.push(
            Diagnostic::error(
                "schema[tasks]",
                format!("task calls more than one module: {}", modules.join(", ")),
            )
            .at(loc),
        );
    }
    for module in modules {
        if !module.contains('.') {
            out.push(
                Diagnostic::warning(
                    "fqcn[action]",
                    format!(
                        "use the fully-qualified collection name for '{}' (for example ansible.builtin.{})",
                        module, module
                    ),
                )
                .at(loc),
            );
        }
    }

    if let Some(notify) = map.get("notify") {
        for target in string_list(notify) {
            notified.push((target, loc.to_string()));
        }
    }

    for section in ["block", "rescue", "always"] {
        if let Some(Yaml::Sequence(inner)) = map.get(section) {
            for (i, t) in inner.iter().enumerate() {
                check_task(t, &format!("{}/{}#{}", loc, section, i + 1), out, notified);
            }
        }
    }
}

fn collect_handler_names(handler: &Yaml, names: &mut BTreeSet<String>) {
    for key in ["name", "listen"] {
        if let Some(v) = handler.get(key) {
            names.extend(string_list(v));
        }
    }
}

fn string_list(v: &Yaml) -> Vec<String> {
    match v {
        Yaml::String(s) => vec![s.clone()],
        Yaml::Sequence(items) => items
            .iter()
            .filter_map(Yaml::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

// ============================================================================
// External tool output
// ============================================================================

/// Parse `ansible-lint -p` output into diagnostics.
pub fn parse_lint_output(out: &exec::ExecOutput) -> Vec<Diagnostic> {
    let mut diags: Vec<Diagnostic> = out
        .stdout
        .lines()
        .chain(out.stderr.lines())
        .filter_map(|line| {
            let caps = LINT_LINE.captures(line.trim())?;
            let code = caps["code"].to_string();
            let severity = if code.starts_with("syntax-check")
                || code.starts_with("load-failure")
                || code.starts_with("internal-error")
            {
                Severity::Error
            } else {
                Severity::Warning
            };
            Some(
                Diagnostic::new(severity, code, caps["msg"].trim())
                    .at(format!("{}:{}", &caps["path"], &caps["line"])),
            )
        })
        .collect();

    if diags.is_empty() && !out.success() {
        diags.push(Diagnostic::error(
            "lint[failed]",
            last_lines(&out.stderr, 5),
        ));
    }
    diags
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    let tail = lines[start..].join("\n");
    if tail.is_empty() {
        "tool exited with an error and no output".to_string()
    } else {
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role(tasks: &str, handlers: Option<&str>) -> ArtifactTree {
        let mut tree = ArtifactTree::new();
        tree.insert("tasks/main.yml", tasks);
        tree.insert("meta/main.yml", "galaxy_info:\n  role_name: web\n");
        if let Some(h) = handlers {
            tree.insert("handlers/main.yml", h);
        }
        tree
    }

    fn codes(diags: &[Diagnostic]) -> Vec<&str> {
        diags.iter().map(|d| d.code.as_str()).collect()
    }

    #[test]
    fn test_cp014_clean_role() {
        let tree = role(
            "- name: Install nginx\n  ansible.builtin.package:\n    name: nginx\n  notify: Reload nginx\n",
            Some("- name: Reload nginx\n  ansible.builtin.service:\n    name: nginx\n    state: reloaded\n"),
        );
        let report = LintGateway::builtin_only().validate(&tree).unwrap();
        assert!(report.is_clean(), "{:?}", report.diagnostics);
    }

    #[test]
    fn test_cp014_required_files() {
        let mut tree = ArtifactTree::new();
        tree.insert("tasks/main.yml", "[]\n");
        let diags = check_role(&tree);
        assert_eq!(codes(&diags), vec!["required-file[missing]"]);
        assert_eq!(diags[0].location.as_deref(), Some("meta/main.yml"));
    }

    #[test]
    fn test_cp014_yaml_syntax_with_line() {
        let tree = role("- name: a\n  ansible.builtin.debug:\n   msg: [unclosed\n", None);
        let diags = check_role(&tree);
        let d = diags.iter().find(|d| d.code == "yaml[syntax]").unwrap();
        assert!(d.location.as_deref().unwrap().starts_with("tasks/main.yml:"));
    }

    #[test]
    fn test_cp014_short_module_name_is_warning() {
        let tree = role("- name: Install\n  package:\n    name: nginx\n", None);
        let diags = check_role(&tree);
        assert_eq!(codes(&diags), vec!["fqcn[action]"]);
        assert_eq!(diags[0].severity, Severity::Warning);
        assert!(diags[0].message.contains("fully-qualified"));
        let report = ValidationReport::from_diagnostics(diags);
        assert!(report.ok);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_cp014_missing_handler() {
        let tree = role(
            "- name: Configure\n  ansible.builtin.template:\n    src: a.j2\n    dest: /a\n  notify:\n    - Restart app\n",
            Some("- name: Reload nginx\n  listen: web restart\n  ansible.builtin.debug:\n    msg: x\n"),
        );
        let diags = check_role(&tree);
        assert_eq!(codes(&diags), vec!["notify[missing-handler]"]);
        assert!(diags[0].message.contains("Restart app"));
    }

    #[test]
    fn test_cp014_listen_satisfies_notify() {
        let tree = role(
            "- name: Configure\n  ansible.builtin.debug:\n    msg: x\n  notify: web restart\n",
            Some("- name: Reload nginx\n  listen: web restart\n  ansible.builtin.debug:\n    msg: x\n"),
        );
        assert!(check_role(&tree).is_empty());
    }

    #[test]
    fn test_cp014_block_recursion_and_names() {
        let tree = role(
            "- block:\n    - ansible.builtin.debug:\n        msg: x\n    - name: inner\n      command: ls\n  when: x\n",
            None,
        );
        let diags = check_role(&tree);
        let c = codes(&diags);
        assert!(c.contains(&"name[missing]"));
        assert!(c.contains(&"fqcn[action]"));
        let fq = diags.iter().find(|d| d.code == "fqcn[action]").unwrap();
        assert_eq!(fq.location.as_deref(), Some("tasks/main.yml#1/block#2"));
    }

    #[test]
    fn test_cp014_tasks_must_be_list() {
        let tree = role("name: not a list\n", None);
        let diags = check_role(&tree);
        assert_eq!(codes(&diags), vec!["schema[tasks]"]);
    }

    #[test]
    fn test_cp014_parse_lint_output() {
        let out = exec::ExecOutput {
            exit_code: 2,
            stdout: "tasks/main.yml:3:5: fqcn[action-core]: Use FQCN for builtin module actions (copy).\ntasks/main.yml:9: [E301] Commands should not change things\n".to_string(),
            stderr: "Failed: 2 failure(s)\n".to_string(),
        };
        let diags = parse_lint_output(&out);
        assert_eq!(diags.len(), 2);
        assert_eq!(diags[0].code, "fqcn[action-core]");
        assert_eq!(diags[0].location.as_deref(), Some("tasks/main.yml:3"));
        assert_eq!(diags[1].code, "E301");
    }

    #[test]
    fn test_cp014_unparsed_failure_is_error() {
        let out = exec::ExecOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "boom\n".to_string(),
        };
        let diags = parse_lint_output(&out);
        assert_eq!(codes(&diags), vec!["lint[failed]"]);
    }

    #[test]
    fn test_cp014_missing_linter_optional_vs_required() {
        let tree = role("- name: a\n  ansible.builtin.debug:\n    msg: x\n", None);
        let optional = LintGateway::new(
            ValidationConfig {
                ansible_lint: "cookport-no-such-linter".to_string(),
                require_external_lint: false,
                syntax_check: false,
            },
            Duration::from_secs(5),
        );
        assert!(optional.validate(&tree).unwrap().is_clean());

        let required = LintGateway::new(
            ValidationConfig {
                ansible_lint: "cookport-no-such-linter".to_string(),
                require_external_lint: true,
                syntax_check: false,
            },
            Duration::from_secs(5),
        );
        assert!(matches!(
            required.validate(&tree),
            Err(GatewayError::Unavailable(_))
        ));
    }

    #[test]
    fn test_cp014_idempotent() {
        let tree = role("- package:\n    name: x\n", None);
        let gw = LintGateway::builtin_only();
        assert_eq!(gw.validate(&tree).unwrap(), gw.validate(&tree).unwrap());
    }
}
