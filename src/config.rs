//! CP-009: Converter configuration (`cookport.toml`).
//!
//! Every field has a default, so an empty or partial file is valid. CLI
//! flags are layered on top by the caller.

use crate::error::{ConvertError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "cookport.toml";

// ============================================================================
// Sections
// ============================================================================

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConverterConfig {
    pub generator: GeneratorConfig,
    pub validation: ValidationConfig,
    pub conversion: ConversionConfig,
}

/// Generation service settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneratorConfig {
    pub model: String,
    pub endpoint: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// Worked conversions included in each prompt
    pub examples_per_request: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            model: "claude-3-7-sonnet-20250219".to_string(),
            endpoint: "https://api.anthropic.com/v1/messages".to_string(),
            max_tokens: 4096,
            temperature: 0.2,
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            examples_per_request: 3,
        }
    }
}

/// Validation gateway settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidationConfig {
    /// Path or name of the ansible-lint binary; empty disables it
    pub ansible_lint: String,
    /// Treat a missing ansible-lint as gateway unavailability
    pub require_external_lint: bool,
    /// Run `ansible-playbook --syntax-check` against the role
    pub syntax_check: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            ansible_lint: "ansible-lint".to_string(),
            require_external_lint: false,
            syntax_check: false,
        }
    }
}

/// Repair loop and scheduling bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConversionConfig {
    pub max_repair_attempts: u32,
    pub max_transport_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub call_timeout_secs: u64,
    pub workers: usize,
    /// Extra mapping rules layered over the defaults
    pub mapping_file: Option<PathBuf>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            max_repair_attempts: 3,
            max_transport_retries: 4,
            backoff_initial_ms: 500,
            backoff_max_ms: 8000,
            call_timeout_secs: 120,
            workers: 4,
            mapping_file: None,
        }
    }
}

impl ConversionConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

// ============================================================================
// Loading
// ============================================================================

impl ConverterConfig {
    /// Parse TOML text and check the bounds.
    pub fn parse(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConvertError::config(format!("invalid config: {}", e)))?;
        config.check()?;
        Ok(config)
    }

    /// Read a config file. A missing file is an error; use [`load_or_default`]
    /// when the file is optional.
    ///
    /// [`load_or_default`]: ConverterConfig::load_or_default
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ConvertError::io(path, e))?;
        Self::parse(&text).map_err(|e| match e {
            ConvertError::Configuration(msg) => {
                ConvertError::Configuration(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// `path` if given, else `./cookport.toml` if present, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let local = Path::new(CONFIG_FILE);
                if local.is_file() {
                    Self::load(local)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    fn check(&self) -> Result<()> {
        let c = &self.conversion;
        if c.max_repair_attempts == 0 {
            return Err(ConvertError::config("conversion.max_repair_attempts must be at least 1"));
        }
        if c.workers == 0 {
            return Err(ConvertError::config("conversion.workers must be at least 1"));
        }
        if c.call_timeout_secs == 0 {
            return Err(ConvertError::config("conversion.call_timeout_secs must be at least 1"));
        }
        if c.backoff_max_ms < c.backoff_initial_ms {
            return Err(ConvertError::config(
                "conversion.backoff_max_ms must not be below backoff_initial_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.generator.temperature) {
            return Err(ConvertError::config("generator.temperature must be within 0.0..=1.0"));
        }
        Ok(())
    }

    /// Read the API key from the configured environment variable.
    pub fn api_key(&self) -> Result<String> {
        let var = &self.generator.api_key_env;
        match std::env::var(var) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(ConvertError::config(format!(
                "no API key: set {} or change generator.api_key_env",
                var
            ))),
        }
    }
}

/// Commented config written by `cookport init`.
pub const INIT_TEMPLATE: &str = r#"# cookport configuration

[generator]
model = "claude-3-7-sonnet-20250219"
endpoint = "https://api.anthropic.com/v1/messages"
max_tokens = 4096
temperature = 0.2
api_key_env = "ANTHROPIC_API_KEY"
examples_per_request = 3

[validation]
# empty string disables the external linter
ansible_lint = "ansible-lint"
require_external_lint = false
syntax_check = false

[conversion]
max_repair_attempts = 3
max_transport_retries = 4
backoff_initial_ms = 500
backoff_max_ms = 8000
call_timeout_secs = 120
workers = 4
# mapping_file = "mappings.yaml"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cp009_empty_is_default() {
        let config = ConverterConfig::parse("").unwrap();
        assert_eq!(config, ConverterConfig::default());
        assert_eq!(config.conversion.max_repair_attempts, 3);
        assert_eq!(config.conversion.backoff_max_ms, 8000);
    }

    #[test]
    fn test_cp009_init_template_matches_defaults() {
        let config = ConverterConfig::parse(INIT_TEMPLATE).unwrap();
        assert_eq!(config, ConverterConfig::default());
    }

    #[test]
    fn test_cp009_partial_section() {
        let config = ConverterConfig::parse(
            "[conversion]\nmax_repair_attempts = 5\nmapping_file = \"m.yaml\"\n",
        )
        .unwrap();
        assert_eq!(config.conversion.max_repair_attempts, 5);
        assert_eq!(config.conversion.workers, 4);
        assert_eq!(config.conversion.mapping_file, Some(PathBuf::from("m.yaml")));
        assert_eq!(config.generator.max_tokens, 4096);
    }

    #[test]
    fn test_cp009_rejects_bad_bounds() {
        let err = ConverterConfig::parse("[conversion]\nmax_repair_attempts = 0\n").unwrap_err();
        assert!(matches!(err, ConvertError::Configuration(_)));
        assert!(ConverterConfig::parse("[conversion]\nworkers = 0\n").is_err());
        assert!(ConverterConfig::parse(
            "[conversion]\nbackoff_initial_ms = 900\nbackoff_max_ms = 100\n"
        )
        .is_err());
    }

    #[test]
    fn test_cp009_rejects_unknown_keys() {
        assert!(ConverterConfig::parse("[generator]\nmodle = \"x\"\n").is_err());
    }

    #[test]
    fn test_cp009_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[conversion]\nworkers = \"many\"\n").unwrap();
        let err = ConverterConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("cookport.toml"));
    }

    #[test]
    fn test_cp009_missing_api_key_is_config_error() {
        let mut config = ConverterConfig::default();
        config.generator.api_key_env = "COOKPORT_TEST_UNSET_KEY_VAR".to_string();
        assert!(matches!(
            config.api_key(),
            Err(ConvertError::Configuration(_))
        ));
    }
}
