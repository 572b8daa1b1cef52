//! CP-026: CLI subcommands: convert, extract, resolve, rules, validate, init,
//! completions.

use crate::audit::eventlog::AUDIT_DIR;
use crate::config::{ConverterConfig, CONFIG_FILE, INIT_TEMPLATE};
use crate::convert::artifact::ArtifactTree;
use crate::convert::batch;
use crate::convert::{
    CancelToken, ConcludedSession, GenerationRequest, Orchestrator, Outcome, Settings,
};
use crate::core::cookbook::{self, CookbookLocation};
use crate::core::types::ParsedCookbook;
use crate::error::{ConvertError, Result};
use crate::mapping::{MappingRegistry, MappingRule, Resolution};
use crate::oracle::anthropic::AnthropicGenerator;
use crate::oracle::lint::LintGateway;
use crate::oracle::{Diagnostic, ValidationGateway};
use crate::output::role;
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "cookport",
    version,
    about = "Convert Chef cookbooks into validated Ansible roles"
)]
pub struct Cli {
    /// More log output (-v info, -vv debug); COOKPORT_LOG overrides
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Convert cookbooks into Ansible roles
    Convert(ConvertArgs),

    /// Print the structural model extracted from cookbooks
    Extract {
        /// Cookbook directory, or a directory containing cookbooks
        input: PathBuf,

        /// Emit JSON instead of YAML
        #[arg(long)]
        json: bool,
    },

    /// Show how each resource declaration resolves against the mapping rules
    Resolve {
        /// Cookbook directory, or a directory containing cookbooks
        input: PathBuf,

        /// Path to cookport.toml
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Extra mapping rules (JSON or YAML)
        #[arg(short, long)]
        mapping: Option<PathBuf>,

        /// Only list unmapped declarations
        #[arg(long)]
        unmapped: bool,
    },

    /// List mapping rules
    Rules {
        /// Path to cookport.toml
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Extra mapping rules (JSON or YAML)
        #[arg(short, long)]
        mapping: Option<PathBuf>,

        /// Print the JSON Schema of a mapping rule instead
        #[arg(long)]
        schema: bool,
    },

    /// Validate an existing role directory
    Validate {
        /// Role directory
        role: PathBuf,

        /// Path to cookport.toml
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Built-in checks only; never run ansible-lint
        #[arg(long)]
        builtin_lint: bool,
    },

    /// Write a default cookport.toml
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Print shell completions
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ConvertArgs {
    /// Cookbook directory, or a directory containing cookbooks
    pub input: PathBuf,

    /// Where roles are written, one directory per cookbook
    #[arg(short, long, default_value = "roles")]
    pub output: PathBuf,

    /// Path to cookport.toml
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Extra mapping rules (JSON or YAML)
    #[arg(short, long)]
    pub mapping: Option<PathBuf>,

    /// Convert only the named cookbook (repeatable)
    #[arg(long = "only")]
    pub only: Vec<String>,

    /// Generation attempts per cookbook
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Cookbooks converted at once
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Generator model
    #[arg(long)]
    pub model: Option<String>,

    /// Built-in checks only; never run ansible-lint
    #[arg(long)]
    pub builtin_lint: bool,

    /// Show what would be sent without calling the generator
    #[arg(long)]
    pub dry_run: bool,
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Convert(args) => cmd_convert(&args),
        Commands::Extract { input, json } => cmd_extract(&input, json),
        Commands::Resolve {
            input,
            config,
            mapping,
            unmapped,
        } => cmd_resolve(&input, config.as_deref(), mapping.as_deref(), unmapped),
        Commands::Rules {
            config,
            mapping,
            schema,
        } => cmd_rules(config.as_deref(), mapping.as_deref(), schema),
        Commands::Validate {
            role,
            config,
            builtin_lint,
        } => cmd_validate(&role, config.as_deref(), builtin_lint),
        Commands::Init { path } => cmd_init(&path),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "cookport", &mut std::io::stdout());
            Ok(())
        }
    }
}

// ============================================================================
// convert
// ============================================================================

fn cmd_convert(args: &ConvertArgs) -> Result<()> {
    let config = convert_config(args)?;
    let registry = load_registry(&config, args.mapping.as_deref())?;
    let cookbooks = load_inputs(&args.input, &args.only)?;

    if args.dry_run {
        for cb in &cookbooks {
            print_plan(cb, &registry, config.generator.examples_per_request);
        }
        return Ok(());
    }

    let api_key = config.api_key()?;
    let timeout = config.conversion.call_timeout();
    let generator = AnthropicGenerator::new(config.generator.clone(), api_key, timeout);
    let gateway = if args.builtin_lint {
        LintGateway::builtin_only()
    } else {
        LintGateway::new(config.validation.clone(), timeout)
    };
    let orchestrator = Orchestrator::new(
        Arc::new(generator),
        Arc::new(gateway),
        Arc::new(registry),
        Settings::from_config(&config),
    );

    println!(
        "Converting {} cookbook(s) with {} ({} worker(s), {} attempt(s) each)",
        cookbooks.len(),
        config.generator.model,
        config.conversion.workers,
        config.conversion.max_repair_attempts
    );
    let sessions = batch::run_blocking(
        orchestrator,
        cookbooks,
        config.conversion.workers,
        CancelToken::new(),
    )?;
    report_sessions(&args.output, &sessions)
}

/// Config file values with command-line overrides applied.
fn convert_config(args: &ConvertArgs) -> Result<ConverterConfig> {
    let mut config = ConverterConfig::load_or_default(args.config.as_deref())?;
    if let Some(n) = args.max_attempts {
        if n == 0 {
            return Err(ConvertError::config("--max-attempts must be at least 1"));
        }
        config.conversion.max_repair_attempts = n;
    }
    if let Some(n) = args.workers {
        if n == 0 {
            return Err(ConvertError::config("--workers must be at least 1"));
        }
        config.conversion.workers = n;
    }
    if let Some(model) = &args.model {
        config.generator.model = model.clone();
    }
    Ok(config)
}

fn print_plan(cb: &ParsedCookbook, registry: &MappingRegistry, examples: usize) {
    let request = GenerationRequest::build(cb, registry, examples);
    let unresolved: Vec<_> = request.unresolved().collect();
    println!(
        "{}: {} recipe(s), {} declaration(s), {} unresolved, {} template(s)",
        cb.name,
        request.recipes.len(),
        request.hints.len(),
        unresolved.len(),
        request.templates.len()
    );
    for hint in unresolved {
        println!("  UNRESOLVED {} at {}", hint.reference, hint.span);
    }
    let prompt = request.prompt();
    println!(
        "  prompt: {} bytes system, {} bytes user",
        prompt.system.len(),
        prompt.user.len()
    );
}

fn report_sessions(output: &Path, sessions: &[ConcludedSession]) -> Result<()> {
    let mut failed = 0;
    for session in sessions {
        let written = role::write_role(output, session)?;
        let attempts = session.attempts.len();
        if session.outcome.is_success() {
            println!(
                "  OK   {} -> {} ({} attempt(s), {})",
                session.cookbook,
                written.dir.display(),
                attempts,
                written.fingerprint.as_deref().unwrap_or("-")
            );
        } else {
            failed += 1;
            let note = if written.files > 0 {
                "best effort written"
            } else {
                "nothing written"
            };
            println!(
                "  FAIL {} ({}; {} attempt(s), {})",
                session.cookbook,
                session.outcome.label(),
                attempts,
                note
            );
            if let Some(diags) = failure_diagnostics(session) {
                for d in diags.iter().take(10) {
                    println!("         {}", d);
                }
                if diags.len() > 10 {
                    println!("         ... {} more", diags.len() - 10);
                }
            }
        }
    }

    let total = sessions.len();
    println!();
    println!(
        "Converted {} of {} cookbook(s); history under <role>/{}/",
        total - failed,
        total,
        AUDIT_DIR
    );
    if failed > 0 {
        return Err(ConvertError::SessionsFailed { failed, total });
    }
    Ok(())
}

fn failure_diagnostics(session: &ConcludedSession) -> Option<&[Diagnostic]> {
    match &session.outcome {
        Outcome::Failed(f) if !f.diagnostics.is_empty() => {
            Some(&f.diagnostics)
        }
        _ => None,
    }
}

// ============================================================================
// extract / resolve / rules
// ============================================================================

fn cmd_extract(input: &Path, json: bool) -> Result<()> {
    let cookbooks = load_inputs(input, &[])?;
    let text = if json {
        serde_json::to_string_pretty(&cookbooks)?
    } else {
        serde_yaml_ng::to_string(&cookbooks)?
    };
    println!("{}", text);
    Ok(())
}

fn cmd_resolve(
    input: &Path,
    config: Option<&Path>,
    mapping: Option<&Path>,
    unmapped_only: bool,
) -> Result<()> {
    let config = ConverterConfig::load_or_default(config)?;
    let registry = load_registry(&config, mapping)?;
    let cookbooks = load_inputs(input, &[])?;

    let mut total = 0;
    let mut unmapped = 0;
    for cb in &cookbooks {
        println!("{}:", cb.name);
        for decl in cb.declarations() {
            if decl.is_unparsed() {
                println!("  {}  UNPARSED", decl.span);
                continue;
            }
            total += 1;
            match registry.resolve(&decl.resource_type, &decl.properties) {
                Resolution::Mapped(inv) => {
                    if !unmapped_only {
                        println!("  {}  {} -> {}", decl.span, decl.reference(), inv.primitive);
                    }
                }
                Resolution::Unmapped => {
                    unmapped += 1;
                    println!("  {}  {} -> UNMAPPED", decl.span, decl.reference());
                }
            }
        }
    }
    println!();
    println!("{} declaration(s), {} unmapped", total, unmapped);
    Ok(())
}

fn cmd_rules(config: Option<&Path>, mapping: Option<&Path>, schema: bool) -> Result<()> {
    if schema {
        let schema = schemars::schema_for!(MappingRule);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }
    let config = ConverterConfig::load_or_default(config)?;
    let registry = load_registry(&config, mapping)?;
    for rule in registry.rules() {
        let mut extras = Vec::new();
        if !rule.property_renames.is_empty() {
            extras.push(format!("{} rename(s)", rule.property_renames.len()));
        }
        if !rule.value_transforms.is_empty() {
            extras.push(format!("{} transform(s)", rule.value_transforms.len()));
        }
        if rule.precedence != 0 {
            extras.push(format!("precedence {}", rule.precedence));
        }
        let extras = if extras.is_empty() {
            String::new()
        } else {
            format!("  ({})", extras.join(", "))
        };
        println!("{:<24} -> {}{}", rule.source_type, rule.target_primitive, extras);
    }
    println!();
    println!("{} rule(s)", registry.len());
    Ok(())
}

// ============================================================================
// validate / init
// ============================================================================

fn cmd_validate(role_dir: &Path, config: Option<&Path>, builtin_lint: bool) -> Result<()> {
    let config = ConverterConfig::load_or_default(config)?;
    let tree = load_role(role_dir)?;
    let gateway = if builtin_lint {
        LintGateway::builtin_only()
    } else {
        LintGateway::new(config.validation.clone(), config.conversion.call_timeout())
    };
    let report = gateway
        .validate(&tree)
        .map_err(|e| ConvertError::Gateway(e.to_string()))?;

    for d in &report.diagnostics {
        eprintln!("  {}", d);
    }
    if report.is_clean() {
        println!("OK: {} ({} files)", role_dir.display(), tree.len());
        Ok(())
    } else {
        Err(ConvertError::Rejected(report.blocking().count()))
    }
}

fn cmd_init(path: &Path) -> Result<()> {
    let config_path = path.join(CONFIG_FILE);
    if config_path.exists() {
        return Err(ConvertError::config(format!(
            "{} already exists",
            config_path.display()
        )));
    }
    std::fs::create_dir_all(path).map_err(|e| ConvertError::io(path, e))?;
    std::fs::write(&config_path, INIT_TEMPLATE).map_err(|e| ConvertError::io(&config_path, e))?;

    println!("Initialized cookport at {}", path.display());
    println!("  Created: {}", config_path.display());
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// Defaults, then `conversion.mapping_file`, then `--mapping`.
fn load_registry(config: &ConverterConfig, extra: Option<&Path>) -> Result<MappingRegistry> {
    let mut builder = MappingRegistry::builder().defaults();
    let files = config
        .conversion
        .mapping_file
        .as_deref()
        .into_iter()
        .chain(extra);
    for file in files {
        let report = builder.load_file(file)?;
        if !report.skipped.is_empty() {
            eprintln!(
                "warning: {}: skipped {} rule(s)",
                file.display(),
                report.skipped.len()
            );
        }
    }
    Ok(builder.build())
}

/// A single cookbook directory or every cookbook below `input`.
fn load_inputs(input: &Path, only: &[String]) -> Result<Vec<ParsedCookbook>> {
    let locations = if input.join("metadata.rb").is_file() {
        let name = cookbook::parse_metadata(
            &std::fs::read_to_string(input.join("metadata.rb"))
                .map_err(|e| ConvertError::io(input.join("metadata.rb"), e))?,
        )
        .name
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| {
            input
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
        vec![CookbookLocation {
            name,
            path: input.to_path_buf(),
        }]
    } else {
        cookbook::find_cookbooks(input)?
    };
    if locations.is_empty() {
        return Err(ConvertError::NoCookbooks(input.to_path_buf()));
    }

    for wanted in only {
        if !locations.iter().any(|l| &l.name == wanted) {
            return Err(ConvertError::config(format!(
                "--only {}: no such cookbook under {}",
                wanted,
                input.display()
            )));
        }
    }
    locations
        .iter()
        .filter(|l| only.is_empty() || only.contains(&l.name))
        .map(|l| cookbook::load_cookbook(&l.path))
        .collect()
}

/// Read a role directory into a tree, skipping the audit directory and
/// non-UTF-8 files.
fn load_role(dir: &Path) -> Result<ArtifactTree> {
    if !dir.is_dir() {
        return Err(ConvertError::io(
            dir,
            std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
        ));
    }
    let pattern = format!(
        "{}/**/*",
        glob::Pattern::escape(&dir.to_string_lossy()).trim_end_matches('/')
    );
    let entries = glob::glob(&pattern).map_err(|e| ConvertError::Parse(e.to_string()))?;
    let mut tree = ArtifactTree::new();
    for entry in entries.flatten() {
        if !entry.is_file() {
            continue;
        }
        let Ok(rel) = entry.strip_prefix(dir) else {
            continue;
        };
        if rel.components().next().is_some_and(|c| c.as_os_str() == AUDIT_DIR) {
            continue;
        }
        let bytes = std::fs::read(&entry).map_err(|e| ConvertError::io(&entry, e))?;
        if let Ok(text) = String::from_utf8(bytes) {
            tree.insert(rel.to_string_lossy().replace('\\', "/"), text);
        }
    }
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;

    const METADATA: &str = "name 'web'\nversion '1.0.0'\nsupports 'ubuntu'\n";
    const RECIPE: &str = r#"package 'nginx'

service 'nginx' do
  action [:enable, :start]
end

acme_widget 'thing' do
  size 3
end
"#;

    fn cookbook_dir(root: &Path, dir: &str) -> PathBuf {
        let cb = root.join(dir);
        std::fs::create_dir_all(cb.join("recipes")).unwrap();
        std::fs::write(cb.join("metadata.rb"), METADATA.replace("web", dir)).unwrap();
        std::fs::write(cb.join("recipes/default.rb"), RECIPE).unwrap();
        cb
    }

    fn convert_args(input: &Path, output: &Path) -> ConvertArgs {
        ConvertArgs {
            input: input.to_path_buf(),
            output: output.to_path_buf(),
            config: None,
            mapping: None,
            only: Vec::new(),
            max_attempts: None,
            workers: None,
            model: None,
            builtin_lint: true,
            dry_run: false,
        }
    }

    #[test]
    fn test_cp026_init() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("project");
        cmd_init(&sub).unwrap();
        let written = std::fs::read_to_string(sub.join(CONFIG_FILE)).unwrap();
        assert!(ConverterConfig::parse(&written).is_ok());
    }

    #[test]
    fn test_cp026_init_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "exists").unwrap();
        assert!(cmd_init(dir.path()).is_err());
    }

    #[test]
    fn test_cp026_load_single_and_many() {
        let dir = tempfile::tempdir().unwrap();
        let web = cookbook_dir(dir.path(), "web");
        cookbook_dir(dir.path(), "db");

        let one = load_inputs(&web, &[]).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].name, "web");
        assert_eq!(one[0].declarations().count(), 3);

        let all = load_inputs(dir.path(), &[]).unwrap();
        let names: Vec<_> = all.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["db", "web"]);

        let only = load_inputs(dir.path(), &["db".to_string()]).unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].name, "db");
    }

    #[test]
    fn test_cp026_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_inputs(dir.path(), &[]),
            Err(ConvertError::NoCookbooks(_))
        ));
        cookbook_dir(dir.path(), "web");
        assert!(matches!(
            load_inputs(dir.path(), &["nope".to_string()]),
            Err(ConvertError::Configuration(_))
        ));
    }

    #[test]
    fn test_cp026_extract_resolve_rules() {
        let dir = tempfile::tempdir().unwrap();
        let web = cookbook_dir(dir.path(), "web");
        cmd_extract(&web, false).unwrap();
        cmd_extract(&web, true).unwrap();
        cmd_resolve(&web, None, None, true).unwrap();
        cmd_rules(None, None, false).unwrap();
        cmd_rules(None, None, true).unwrap();
    }

    #[test]
    fn test_cp026_mapping_file_layers_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mapping = dir.path().join("rules.yaml");
        std::fs::write(
            &mapping,
            "- source_type: acme_widget\n  target_primitive: acme.widgets.widget\n",
        )
        .unwrap();
        let registry = load_registry(&ConverterConfig::default(), Some(&mapping)).unwrap();
        assert!(registry.lookup("acme_widget").is_some());
        assert!(registry.lookup("package").is_some());
    }

    #[test]
    fn test_cp026_convert_dry_run_needs_no_key() {
        let dir = tempfile::tempdir().unwrap();
        let web = cookbook_dir(dir.path(), "web");
        let config = dir.path().join(CONFIG_FILE);
        std::fs::write(&config, "[generator]\napi_key_env = \"COOKPORT_TEST_KEY_UNSET\"\n")
            .unwrap();
        let mut args = convert_args(&web, &dir.path().join("out"));
        args.config = Some(config.clone());
        args.dry_run = true;
        cmd_convert(&args).unwrap();
        assert!(!dir.path().join("out").exists());

        args.dry_run = false;
        let err = cmd_convert(&args).unwrap_err();
        assert!(matches!(err, ConvertError::Configuration(_)));
    }

    #[test]
    fn test_cp026_convert_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = convert_args(dir.path(), dir.path());
        args.max_attempts = Some(5);
        args.workers = Some(2);
        args.model = Some("m".into());
        let config = convert_config(&args).unwrap();
        assert_eq!(config.conversion.max_repair_attempts, 5);
        assert_eq!(config.conversion.workers, 2);
        assert_eq!(config.generator.model, "m");

        args.workers = Some(0);
        assert!(convert_config(&args).is_err());
    }

    #[test]
    fn test_cp026_validate_role_dir() {
        let dir = tempfile::tempdir().unwrap();
        let role_dir = dir.path().join("web");
        std::fs::create_dir_all(role_dir.join("tasks")).unwrap();
        std::fs::write(
            role_dir.join("tasks/main.yml"),
            "- name: Install nginx\n  ansible.builtin.package:\n    name: nginx\n",
        )
        .unwrap();
        assert!(matches!(
            cmd_validate(&role_dir, None, true),
            Err(ConvertError::Rejected(1))
        ));

        std::fs::create_dir_all(role_dir.join("meta")).unwrap();
        std::fs::write(role_dir.join("meta/main.yml"), "galaxy_info:\n  role_name: web\n").unwrap();
        cmd_validate(&role_dir, None, true).unwrap();
    }

    #[test]
    fn test_cp026_load_role_skips_audit_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(AUDIT_DIR)).unwrap();
        std::fs::create_dir_all(dir.path().join("tasks")).unwrap();
        std::fs::write(dir.path().join(AUDIT_DIR).join("history.json"), "{}").unwrap();
        std::fs::write(dir.path().join("tasks/main.yml"), "[]\n").unwrap();
        std::fs::write(dir.path().join("tasks/blob.bin"), [0xffu8, 0xfe]).unwrap();
        let tree = load_role(dir.path()).unwrap();
        assert_eq!(tree.paths().collect::<Vec<_>>(), vec!["tasks/main.yml"]);
    }

    #[test]
    fn test_cp026_report_failed_sessions() {
        use crate::convert::session::{ConversionSession, Failure, FailureReason};
        let dir = tempfile::tempdir().unwrap();
        let failed = ConversionSession::new("web").conclude(Outcome::Failed(Failure {
            reason: FailureReason::ValidationExhausted,
            artifact: None,
            diagnostics: vec![Diagnostic::error("yaml[syntax]", "bad")],
        }));
        let err = report_sessions(dir.path(), &[failed]).unwrap_err();
        assert!(matches!(
            err,
            ConvertError::SessionsFailed { failed: 1, total: 1 }
        ));
        assert!(role::history_path(&dir.path().join("web")).exists());
    }

    #[test]
    fn test_cp026_cli_parses() {
        let cli = Cli::try_parse_from(["cookport", "-vv", "convert", "cb", "--only", "a", "--dry-run"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Convert(args) => {
                assert_eq!(args.only, vec!["a"]);
                assert!(args.dry_run);
                assert_eq!(args.output, PathBuf::from("roles"));
            }
            other => panic!("unexpected {:?}", other),
        }
        Cli::command().debug_assert();
    }
}
