//! CP-024: Completing a generated candidate into a full role.
//!
//! Generated files always win. Assembly only adds what is missing:
//! `meta/main.yml` from cookbook metadata, `defaults/main.yml` from attribute
//! defaults, templates (`.erb` → `.j2`, content verbatim), static files and
//! a README.

use super::artifact::ArtifactTree;
use crate::core::types::{ParsedCookbook, Scalar, Value};
use serde_yaml_ng::{Mapping, Value as Yaml};
use std::fmt::Write as _;
use tracing::warn;

/// Add the files a role needs that the generator did not emit.
pub fn complete(mut tree: ArtifactTree, cookbook: &ParsedCookbook) -> ArtifactTree {
    if !tree.contains("meta/main.yml") {
        match serde_yaml_ng::to_string(&meta(cookbook)) {
            Ok(text) => tree.insert("meta/main.yml", text),
            Err(e) => warn!(cookbook = %cookbook.name, error = %e, "cannot render meta/main.yml"),
        }
    }

    let defaults = cookbook.attribute_defaults();
    if !defaults.is_empty() && !tree.contains("defaults/main.yml") {
        let mut map = Mapping::new();
        for (key, value) in &defaults {
            map.insert(Yaml::String(variable_name(key)), to_yaml(value));
        }
        match serde_yaml_ng::to_string(&Yaml::Mapping(map)) {
            Ok(text) => tree.insert("defaults/main.yml", format!("---\n{}", text)),
            Err(e) => warn!(cookbook = %cookbook.name, error = %e, "cannot render defaults"),
        }
    }

    for template in &cookbook.templates {
        if let Some(content) = &template.content {
            tree.insert_missing(template_path(&template.path), content.clone());
        }
    }
    for file in &cookbook.files {
        if let Some(content) = &file.content {
            tree.insert_missing(format!("files/{}", strip_default(&file.path)), content.clone());
        }
    }

    if !tree.contains("README.md") {
        tree.insert("README.md", readme(cookbook));
    }
    tree
}

/// `default/nginx.conf.erb` → `templates/nginx.conf.j2`
pub fn template_path(source: &str) -> String {
    let rel = strip_default(source);
    let rel = rel.strip_suffix(".erb").map(|s| format!("{}.j2", s)).unwrap_or_else(|| rel.to_string());
    format!("templates/{}", rel)
}

fn strip_default(path: &str) -> &str {
    path.strip_prefix("default/").unwrap_or(path)
}

/// `nginx.port` → `nginx_port`
pub fn variable_name(dotted: &str) -> String {
    dotted
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

fn meta(cookbook: &ParsedCookbook) -> Yaml {
    let md = &cookbook.metadata;
    let mut info = Mapping::new();
    let mut put = |k: &str, v: Option<&String>| {
        if let Some(v) = v {
            info.insert(Yaml::String(k.to_string()), Yaml::String(v.clone()));
        }
    };
    put("role_name", Some(&variable_name(&cookbook.name)));
    put("author", md.maintainer.as_ref());
    put("description", md.description.as_ref());
    put("license", md.license.as_ref());
    info.insert(
        Yaml::String("min_ansible_version".into()),
        Yaml::String("2.14".into()),
    );
    if !md.supports.is_empty() {
        let platforms = md
            .supports
            .iter()
            .map(|p| {
                let mut m = Mapping::new();
                m.insert(Yaml::String("name".into()), Yaml::String(platform_name(p)));
                Yaml::Mapping(m)
            })
            .collect();
        info.insert(Yaml::String("platforms".into()), Yaml::Sequence(platforms));
    }

    let deps = md
        .dependencies
        .iter()
        .map(|d| Yaml::String(d.name.clone()))
        .collect();
    let mut root = Mapping::new();
    root.insert(Yaml::String("galaxy_info".into()), Yaml::Mapping(info));
    root.insert(Yaml::String("dependencies".into()), Yaml::Sequence(deps));
    Yaml::Mapping(root)
}

fn platform_name(chef: &str) -> String {
    match chef {
        "redhat" | "rhel" | "centos" | "rocky" | "almalinux" => "EL".to_string(),
        "mac_os_x" => "MacOSX".to_string(),
        other => {
            let mut c = other.chars();
            match c.next() {
                Some(f) => f.to_uppercase().chain(c).collect(),
                None => String::new(),
            }
        }
    }
}

/// Extracted value → YAML. References become Jinja expressions.
pub fn to_yaml(value: &Value) -> Yaml {
    match value {
        Value::Scalar(Scalar::String(s)) | Value::Scalar(Scalar::Symbol(s)) => Yaml::String(s.clone()),
        Value::Scalar(Scalar::Integer(n)) => Yaml::Number((*n).into()),
        Value::Scalar(Scalar::Float(x)) => Yaml::Number((*x).into()),
        Value::Scalar(Scalar::Bool(b)) => Yaml::Bool(*b),
        Value::Scalar(Scalar::Nil) => Yaml::Null,
        Value::Reference(r) => {
            let name = variable_name(r.strip_prefix("node.").unwrap_or(r));
            Yaml::String(format!("{{{{ {} }}}}", name))
        }
        Value::Map(m) => Yaml::Mapping(
            m.iter()
                .map(|(k, v)| (Yaml::String(k.clone()), to_yaml(v)))
                .collect(),
        ),
        Value::List(items) => Yaml::Sequence(items.iter().map(to_yaml).collect()),
        Value::Raw(r) => Yaml::String(r.clone()),
    }
}

fn readme(cookbook: &ParsedCookbook) -> String {
    let md = &cookbook.metadata;
    let mut out = format!("# {}\n\n", variable_name(&cookbook.name));
    if let Some(desc) = &md.description {
        let _ = writeln!(out, "{}\n", desc);
    }
    let _ = writeln!(
        out,
        "Converted from the Chef cookbook `{}`{} by cookport.\n",
        cookbook.name,
        md.version
            .as_ref()
            .map(|v| format!(" (version {})", v))
            .unwrap_or_default()
    );
    let recipes: Vec<&str> = cookbook.recipes.iter().map(|r| r.name.as_str()).collect();
    if !recipes.is_empty() {
        let _ = writeln!(out, "Source recipes: {}\n", recipes.join(", "));
    }
    if !md.dependencies.is_empty() {
        out.push_str("## Dependencies\n\n");
        for d in &md.dependencies {
            match &d.constraint {
                Some(c) => {
                    let _ = writeln!(out, "- {} ({})", d.name, c);
                }
                None => {
                    let _ = writeln!(out, "- {}", d.name);
                }
            }
        }
        out.push('\n');
    }
    out.push_str("Template placeholders were copied verbatim and still use ERB syntax.\n");
    out
}
