//! CP-005: Cookbook discovery and loading.
//!
//! A cookbook is any directory holding a `metadata.rb`. Loading reads the
//! metadata, custom resource definitions, recipes, attribute files,
//! templates, static files and library names. Custom resources are parsed
//! first so their names count as known resource types while extracting
//! recipes.

use super::extractor::{extract, FileContext};
use super::types::{
    CookbookFile, CookbookMetadata, CustomResourceDef, Dependency, ParsedCookbook, RecipeUnit,
};
use crate::error::{ConvertError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

static META_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)^\s*(name|version|maintainer|maintainer_email|license|description)\s*\(?\s*['"]([^'"]*)['"]"#,
    )
    .expect("valid regex")
});

static META_DEPENDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*depends\s*\(?\s*['"]([^'"]+)['"](?:\s*,\s*['"]([^'"]+)['"])?"#)
        .expect("valid regex")
});

static META_SUPPORTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*supports\s*\(?\s*['"]([^'"]+)['"]"#).expect("valid regex")
});

static RESOURCE_PROPERTY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:property|attribute)\s*\(?\s*:([A-Za-z_][A-Za-z0-9_]*)")
        .expect("valid regex")
});

static RESOURCE_ACTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*action\s*\(?\s*:([A-Za-z_][A-Za-z0-9_]*)\s*\)?\s*do\b")
        .expect("valid regex")
});

static RESOURCE_ACTIONS_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*actions\s+(.+)$").expect("valid regex"));

static RESOURCE_DEFAULT_ACTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*default_action\s*\(?\s*:([A-Za-z_][A-Za-z0-9_]*)").expect("valid regex")
});

static RESOURCE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:resource_name|provides)\s*\(?\s*:([A-Za-z_][A-Za-z0-9_]*)")
        .expect("valid regex")
});

static SYMBOL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":([A-Za-z_][A-Za-z0-9_]*)").expect("valid regex"));

/// A cookbook found on disk, not yet loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookbookLocation {
    pub name: String,
    pub path: PathBuf,
}

/// Find every cookbook under `root`, sorted by path.
pub fn find_cookbooks(root: &Path) -> Result<Vec<CookbookLocation>> {
    if !root.is_dir() {
        return Err(ConvertError::io(
            root,
            std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
        ));
    }
    let mut found = Vec::new();
    for path in glob_files(root, "**/metadata.rb")? {
        let Some(dir) = path.parent() else { continue };
        let content = read_text(&path)?;
        let name = parse_metadata(&content)
            .name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| dir_name(dir));
        found.push(CookbookLocation {
            name,
            path: dir.to_path_buf(),
        });
    }
    found.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(root = %root.display(), cookbooks = found.len(), "discovered cookbooks");
    Ok(found)
}

/// Parse `metadata.rb` text.
pub fn parse_metadata(content: &str) -> CookbookMetadata {
    let mut meta = CookbookMetadata::default();
    for caps in META_FIELD.captures_iter(content) {
        let value = Some(caps[2].to_string());
        let slot = match &caps[1] {
            "name" => &mut meta.name,
            "version" => &mut meta.version,
            "maintainer" => &mut meta.maintainer,
            "maintainer_email" => &mut meta.maintainer_email,
            "license" => &mut meta.license,
            "description" => &mut meta.description,
            _ => continue,
        };
        if slot.is_none() {
            *slot = value;
        }
    }
    meta.dependencies = META_DEPENDS
        .captures_iter(content)
        .map(|c| Dependency {
            name: c[1].to_string(),
            constraint: c.get(2).map(|m| m.as_str().to_string()),
        })
        .collect();
    meta.supports = META_SUPPORTS
        .captures_iter(content)
        .map(|c| c[1].to_string())
        .collect();
    meta
}

/// Parse a custom resource definition (`resources/<file>.rb`).
pub fn parse_custom_resource(cookbook: &str, file: &str, content: &str) -> CustomResourceDef {
    let stem = Path::new(file)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = RESOURCE_NAME
        .captures(content)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| format!("{}_{}", cookbook.replace('-', "_"), stem));

    let properties = RESOURCE_PROPERTY
        .captures_iter(content)
        .map(|c| c[1].to_string())
        .collect();

    let mut actions: Vec<String> = RESOURCE_ACTION
        .captures_iter(content)
        .map(|c| c[1].to_string())
        .collect();
    for caps in RESOURCE_ACTIONS_LIST.captures_iter(content) {
        for sym in SYMBOL.captures_iter(&caps[1]) {
            if !actions.iter().any(|a| a == &sym[1]) {
                actions.push(sym[1].to_string());
            }
        }
    }

    let default_action = RESOURCE_DEFAULT_ACTION
        .captures(content)
        .map(|c| c[1].to_string())
        .or_else(|| actions.first().cloned());

    CustomResourceDef {
        name,
        file: file.to_string(),
        properties,
        actions,
        default_action,
    }
}

/// Load everything the converter needs from one cookbook directory.
pub fn load_cookbook(path: &Path) -> Result<ParsedCookbook> {
    let metadata_path = path.join("metadata.rb");
    let metadata = if metadata_path.is_file() {
        parse_metadata(&read_text(&metadata_path)?)
    } else {
        warn!(cookbook = %path.display(), "metadata.rb missing, using directory name");
        CookbookMetadata::default()
    };
    let name = metadata
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| dir_name(path));

    let mut custom_resources = Vec::new();
    for file in glob_files(path, "resources/*.rb")? {
        let rel = relative(path, &file);
        custom_resources.push(parse_custom_resource(&name, &rel, &read_text(&file)?));
    }
    let known: Vec<String> = custom_resources.iter().map(|r| r.name.clone()).collect();

    let recipes = extract_dir(path, "recipes/*.rb", &known)?;
    let attribute_files = extract_dir(path, "attributes/*.rb", &known)?;
    let templates = collect_files(path, "templates")?;
    let files = collect_files(path, "files")?;
    let libraries = glob_files(path, "libraries/*.rb")?
        .iter()
        .map(|f| relative(path, f))
        .collect();

    let cookbook = ParsedCookbook {
        name,
        path: path.to_path_buf(),
        metadata,
        recipes,
        attribute_files,
        templates,
        files,
        custom_resources,
        libraries,
    };
    info!(
        cookbook = %cookbook.name,
        recipes = cookbook.recipes.len(),
        declarations = cookbook.declarations().count(),
        templates = cookbook.templates.len(),
        "loaded cookbook"
    );
    Ok(cookbook)
}

fn extract_dir(root: &Path, pattern: &str, known: &[String]) -> Result<Vec<RecipeUnit>> {
    let mut units = Vec::new();
    for file in glob_files(root, pattern)? {
        let rel = relative(root, &file);
        let ctx = FileContext::new(rel).with_resource_types(known.iter().cloned());
        units.push(extract(&read_text(&file)?, &ctx));
    }
    Ok(units)
}

fn collect_files(root: &Path, dir: &str) -> Result<Vec<CookbookFile>> {
    let base = root.join(dir);
    let mut out = Vec::new();
    for file in glob_files(root, &format!("{}/**/*", dir))? {
        let bytes = std::fs::read(&file).map_err(|e| ConvertError::io(&file, e))?;
        out.push(CookbookFile {
            path: relative(&base, &file),
            content: String::from_utf8(bytes).ok(),
        });
    }
    Ok(out)
}

/// Files matching `pattern` under `root`, sorted.
fn glob_files(root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let escaped = glob::Pattern::escape(&root.to_string_lossy());
    let full = format!("{}/{}", escaped.trim_end_matches('/'), pattern);
    let paths = glob::glob(&full).map_err(|e| ConvertError::Parse(format!("{}: {}", full, e)))?;
    let mut files: Vec<PathBuf> = paths
        .filter_map(|entry| match entry {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(error = %e, "skipping unreadable path");
                None
            }
        })
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    Ok(files)
}

fn read_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).map_err(|e| ConvertError::io(path, e))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cookbook".to_string())
}
