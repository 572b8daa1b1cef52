//! CP-017: Generation requests.
//!
//! A request carries everything the generator sees for one attempt: recipe
//! source text, per-declaration resolution hints (mapped and unresolved),
//! attribute defaults, templates, custom resources, worked examples and, on
//! repair cycles, the feedback directive.

use super::feedback::FeedbackDirective;
use crate::core::types::{
    CookbookMetadata, CustomResourceDef, Guard, NotificationEdge, ParsedCookbook, SourceSpan,
    Timing, Value,
};
use crate::mapping::{MappingRegistry, Resolution};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

// ============================================================================
// Request
// ============================================================================

/// One recipe's literal source and the spans the extractor left raw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeContext {
    pub name: String,
    pub file: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unparsed: Vec<SourceSpan>,
}

/// A declaration together with what the registry made of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionHint {
    /// `type[name]`
    pub reference: String,
    pub resource_type: String,
    pub span: SourceSpan,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guards: Vec<Guard>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notifies: Vec<NotificationEdge>,
    pub resolution: Resolution,
}

/// A worked Chef → Ansible conversion shown to the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FewShotExample {
    pub chef: &'static str,
    pub ansible: &'static str,
}

/// Full payload for one generation call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub cookbook: String,
    pub attempt: u32,
    pub metadata: CookbookMetadata,
    pub recipes: Vec<RecipeContext>,
    pub hints: Vec<ResolutionHint>,
    pub defaults: IndexMap<String, Value>,
    pub templates: Vec<String>,
    pub files: Vec<String>,
    pub custom_resources: Vec<CustomResourceDef>,
    pub examples: Vec<FewShotExample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<FeedbackDirective>,
}

/// Rendered system and user prompts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl GenerationRequest {
    /// First-attempt request for `cookbook`. Every declaration yields one
    /// hint; unmapped types are kept as unresolved hints.
    pub fn build(
        cookbook: &ParsedCookbook,
        registry: &MappingRegistry,
        examples_per_request: usize,
    ) -> Self {
        let recipes = cookbook
            .recipes
            .iter()
            .map(|r| RecipeContext {
                name: r.name.clone(),
                file: r.file.clone(),
                source: r.source.clone(),
                unparsed: r
                    .declarations
                    .iter()
                    .filter(|d| d.is_unparsed())
                    .map(|d| d.span.clone())
                    .collect(),
            })
            .collect();

        let hints = cookbook
            .declarations()
            .filter(|d| !d.is_unparsed())
            .map(|d| ResolutionHint {
                reference: d.reference(),
                resource_type: d.resource_type.clone(),
                span: d.span.clone(),
                guards: d.guards.clone(),
                notifies: d.notifies.clone(),
                resolution: registry.resolve(&d.resource_type, &d.properties),
            })
            .collect();

        Self {
            cookbook: cookbook.name.clone(),
            attempt: 1,
            metadata: cookbook.metadata.clone(),
            recipes,
            hints,
            defaults: cookbook.attribute_defaults(),
            templates: cookbook.templates.iter().map(|t| t.path.clone()).collect(),
            files: cookbook.files.iter().map(|f| f.path.clone()).collect(),
            custom_resources: cookbook.custom_resources.clone(),
            examples: FEW_SHOT.iter().take(examples_per_request).copied().collect(),
            feedback: None,
        }
    }

    /// Copy of this request for a repair attempt.
    pub fn with_feedback(&self, attempt: u32, feedback: FeedbackDirective) -> Self {
        Self {
            attempt,
            feedback: Some(feedback),
            ..self.clone()
        }
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &ResolutionHint> {
        self.hints.iter().filter(|h| !h.resolution.is_mapped())
    }

    pub fn prompt(&self) -> Prompt {
        Prompt {
            system: SYSTEM_PROMPT.to_string(),
            user: self.render_user(),
        }
    }

    fn render_user(&self) -> String {
        let mut out = String::new();

        if !self.examples.is_empty() {
            out.push_str("Here are worked conversions:\n\n");
            for (i, ex) in self.examples.iter().enumerate() {
                let _ = write!(
                    out,
                    "Example {}:\nCHEF:\n```ruby\n{}\n```\nANSIBLE:\n```yaml\n{}\n```\n\n",
                    i + 1,
                    ex.chef.trim(),
                    ex.ansible.trim()
                );
            }
        }

        let _ = writeln!(
            out,
            "Convert the Chef cookbook `{}` into an Ansible role named `{}`.\n",
            self.cookbook, self.cookbook
        );

        for recipe in &self.recipes {
            let _ = writeln!(out, "## Recipe {} ({})\n```ruby\n{}\n```", recipe.name, recipe.file, recipe.source.trim_end());
            if !recipe.unparsed.is_empty() {
                let spans: Vec<String> = recipe.unparsed.iter().map(|s| s.to_string()).collect();
                let _ = writeln!(
                    out,
                    "Not understood by the extractor, convert by reading the source: {}",
                    spans.join(", ")
                );
            }
            out.push('\n');
        }

        if !self.hints.is_empty() {
            out.push_str("## Resource hints\n");
            for hint in &self.hints {
                out.push_str(&render_hint(hint));
            }
            out.push('\n');
        }

        if !self.defaults.is_empty() {
            out.push_str("## Attribute defaults (put these in defaults/main.yml)\n");
            for (k, v) in &self.defaults {
                let _ = writeln!(out, "- {} = {}", k, v.to_source());
            }
            out.push('\n');
        }

        if !self.templates.is_empty() {
            let _ = writeln!(
                out,
                "## Templates (already copied to templates/ with .erb renamed to .j2)\n{}\n",
                self.templates.join(", ")
            );
        }
        if !self.files.is_empty() {
            let _ = writeln!(
                out,
                "## Static files (already copied to files/)\n{}\n",
                self.files.join(", ")
            );
        }

        if !self.custom_resources.is_empty() {
            out.push_str("## Custom resources defined by this cookbook\n");
            for cr in &self.custom_resources {
                let _ = writeln!(
                    out,
                    "- {} (properties: {}; actions: {})",
                    cr.name,
                    cr.properties.join(", "),
                    cr.actions.join(", ")
                );
            }
            out.push('\n');
        }

        if !self.metadata.dependencies.is_empty() {
            let deps: Vec<&str> = self.metadata.dependencies.iter().map(|d| d.name.as_str()).collect();
            let _ = writeln!(out, "Depends on cookbooks: {}\n", deps.join(", "));
        }

        if let Some(feedback) = &self.feedback {
            out.push_str("## Corrections required\n");
            out.push_str(&feedback.render());
            out.push('\n');
        }

        out.push_str(OUTPUT_CONVENTION);
        out
    }
}

fn render_hint(hint: &ResolutionHint) -> String {
    let mut line = format!("- {} at {}: ", hint.reference, hint.span);
    match &hint.resolution {
        Resolution::Mapped(inv) => {
            let props: Vec<String> = inv
                .properties
                .iter()
                .map(|(k, v)| format!("{}: {}", k, v.to_source()))
                .collect();
            let _ = write!(line, "use {} {{ {} }}", inv.primitive, props.join(", "));
        }
        Resolution::Unmapped => {
            line.push_str("UNRESOLVED, no known mapping; pick the closest module and explain nothing");
        }
    }
    if !hint.guards.is_empty() {
        let guards: Vec<String> = hint.guards.iter().map(|g| g.to_string()).collect();
        let _ = write!(line, "; guarded by [{}]", guards.join("; "));
    }
    for edge in &hint.notifies {
        let timing = match edge.timing {
            Timing::Immediate => "immediately",
            Timing::Delayed => "delayed",
        };
        let _ = write!(line, "; {:?} {} {} ({})", edge.kind, edge.target, edge.action, timing);
    }
    line.push('\n');
    line
}

// ============================================================================
// Prompt text
// ============================================================================

const SYSTEM_PROMPT: &str = "You are an expert in Chef and Ansible. You convert Chef cookbooks \
into Ansible roles that pass ansible-lint. Use fully-qualified collection names for every \
module, name every task, turn Chef notifications into notify plus handlers, turn guards into \
when conditions, and keep node attributes as role defaults.";

const OUTPUT_CONVENTION: &str = "## Output format\n\
Return every file of the role as its own fenced block whose info string carries the relative \
path, for example:\n\
```yaml path=tasks/main.yml\n- name: Install nginx\n  ansible.builtin.package:\n    name: nginx\n    state: present\n```\n\
Always include tasks/main.yml and meta/main.yml. Put handlers in handlers/main.yml and only \
include handlers that are notified. Put defaults in defaults/main.yml. Templates use .j2 \
under templates/.\n";

/// Worked conversions, in the order they are offered.
pub const FEW_SHOT: &[FewShotExample] = &[
    FewShotExample {
        chef: "package 'nginx' do\n  action :install\nend",
        ansible: "- name: Install nginx\n  ansible.builtin.package:\n    name: nginx\n    state: present",
    },
    FewShotExample {
        chef: "template '/etc/nginx/nginx.conf' do\n  source 'nginx.conf.erb'\n  variables(\n    server_name: node['nginx']['server_name']\n  )\n  notifies :reload, 'service[nginx]'\nend",
        ansible: "# tasks/main.yml\n- name: Configure nginx\n  ansible.builtin.template:\n    src: nginx.conf.j2\n    dest: /etc/nginx/nginx.conf\n  vars:\n    server_name: \"{{ nginx_server_name }}\"\n  notify: Reload nginx\n\n# handlers/main.yml\n- name: Reload nginx\n  ansible.builtin.service:\n    name: nginx\n    state: reloaded",
    },
    FewShotExample {
        chef: "if platform_family?('debian')\n  package 'apt-transport-https'\nend",
        ansible: "- name: Install apt-transport-https\n  ansible.builtin.package:\n    name: apt-transport-https\n    state: present\n  when: ansible_facts['os_family'] == 'Debian'",
    },
    FewShotExample {
        chef: "service 'nginx' do\n  action [:enable, :start]\nend",
        ansible: "- name: Enable and start nginx\n  ansible.builtin.service:\n    name: nginx\n    state: started\n    enabled: true",
    },
    FewShotExample {
        chef: "directory '/var/www/html' do\n  owner 'www-data'\n  group 'www-data'\n  mode '0755'\n  recursive true\n  action :create\nend",
        ansible: "- name: Create web root\n  ansible.builtin.file:\n    path: /var/www/html\n    state: directory\n    owner: www-data\n    group: www-data\n    mode: '0755'\n    recurse: true",
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::extractor::{extract, FileContext};
    use crate::core::types::RecipeUnit;
    use crate::mapping::MappingRule;

    fn cookbook(source: &str) -> ParsedCookbook {
        let unit: RecipeUnit = extract(source, &FileContext::new("recipes/default.rb"));
        ParsedCookbook {
            name: "web".to_string(),
            recipes: vec![unit],
            ..ParsedCookbook::default()
        }
    }

    #[test]
    fn test_cp017_unmapped_kept_as_unresolved_hint() {
        let cb = cookbook("package 'nginx'\nfrobnicate_widget 'w1' do\n  level 3\nend\n");
        let registry = MappingRegistry::with_defaults();
        let req = GenerationRequest::build(&cb, &registry, 3);
        assert_eq!(req.hints.len(), 2);
        let unresolved: Vec<_> = req.unresolved().collect();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].reference, "frobnicate_widget[w1]");
        assert!(req.prompt().user.contains("frobnicate_widget[w1]"));
        assert!(req.prompt().user.contains("UNRESOLVED"));
    }

    #[test]
    fn test_cp017_mapped_hint_rendering() {
        let cb = cookbook("service 'nginx' do\n  action [:enable, :start]\nend\n");
        let registry = MappingRegistry::builder()
            .rule(
                MappingRule::new("service", "ansible.builtin.service").rename("action", "state"),
            )
            .build();
        let req = GenerationRequest::build(&cb, &registry, 0);
        let user = req.prompt().user;
        assert!(user.contains("use ansible.builtin.service { state: [:enable, :start] }"));
        assert!(!user.contains("Example 1"));
    }

    #[test]
    fn test_cp017_examples_capped() {
        let cb = cookbook("package 'x'\n");
        let registry = MappingRegistry::with_defaults();
        assert_eq!(GenerationRequest::build(&cb, &registry, 3).examples.len(), 3);
        assert_eq!(GenerationRequest::build(&cb, &registry, 99).examples.len(), FEW_SHOT.len());
    }

    #[test]
    fn test_cp017_feedback_only_on_repair() {
        let cb = cookbook("package 'x'\n");
        let registry = MappingRegistry::with_defaults();
        let first = GenerationRequest::build(&cb, &registry, 1);
        assert!(first.feedback.is_none());
        assert!(!first.prompt().user.contains("Corrections required"));

        let repair = first.with_feedback(2, FeedbackDirective::generic(1));
        assert_eq!(repair.attempt, 2);
        assert_eq!(repair.hints, first.hints);
        assert!(repair.prompt().user.contains("Corrections required"));
    }

    #[test]
    fn test_cp017_guards_and_notifications_in_hints() {
        let cb = cookbook(
            "if platform_family?('debian')\n  template '/etc/app.conf' do\n    source 'app.erb'\n    notifies :restart, 'service[app]', :immediately\n  end\nend\n",
        );
        let req = GenerationRequest::build(&cb, &MappingRegistry::with_defaults(), 0);
        let user = req.prompt().user;
        assert!(user.contains("guarded by [if platform_family?('debian')]"));
        assert!(user.contains("service[app] restart (immediately)"));
    }

    #[test]
    fn test_cp017_unparsed_spans_listed() {
        let cb = cookbook("package 'a'\nputs 'hi'\n");
        let req = GenerationRequest::build(&cb, &MappingRegistry::with_defaults(), 0);
        assert_eq!(req.recipes[0].unparsed.len(), 1);
        assert_eq!(req.recipes[0].unparsed[0].start_line, 2);
        assert!(req.prompt().user.contains("Not understood by the extractor"));
        assert!(req.hints.iter().all(|h| h.resource_type != crate::core::types::UNPARSED_TYPE));
    }
}
