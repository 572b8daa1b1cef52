//! CP-011: External collaborators: the generator and the validation gateway.
//!
//! Both are traits so the orchestrator can be driven by scripted fakes in
//! tests. Calls are blocking from the orchestrator's point of view; each
//! implementation enforces its own per-call timeout and reports it as a
//! typed error.

pub mod anthropic;
pub mod exec;
pub mod lint;

use crate::convert::artifact::ArtifactTree;
use crate::convert::request::GenerationRequest;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Failure talking to the generator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    /// The request itself was refused (bad key, unknown model, malformed body).
    #[error("request rejected (HTTP {status})")]
    Rejected { status: u16 },
}

impl GenerationError {
    /// Whether calling again with the same request can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

/// Failure reaching the validation gateway. Never consumes a repair attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("validation gateway unavailable: {0}")]
    Unavailable(String),
    #[error("validation timed out after {0:?}")]
    Timeout(Duration),
}

/// Produces candidate artifact text from a request.
pub trait Generator: Send + Sync {
    fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError>;
}

/// Checks a candidate artifact. Must be repeatable and idempotent.
pub trait ValidationGateway: Send + Sync {
    fn validate(&self, artifact: &ArtifactTree) -> Result<ValidationReport, GatewayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One finding. `code` follows the `category[detail]` convention.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Diagnostic {
    pub fn new(severity: Severity, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            code: code.into(),
            message: message.into(),
            location: None,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, code, message)
    }

    pub fn warning(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, code, message)
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// `fqcn[action-core]` → `fqcn`.
    pub fn category(&self) -> &str {
        let code = self.code.trim();
        let end = code.find('[').unwrap_or(code.len());
        let category = code[..end].trim();
        if category.is_empty() {
            "unknown"
        } else {
            category
        }
    }

    /// Blocks success: warnings and errors do, info does not.
    pub fn is_blocking(&self) -> bool {
        self.severity >= Severity::Warning
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "{} {} {}: {}", self.severity, self.code, loc, self.message),
            None => write!(f, "{} {}: {}", self.severity, self.code, self.message),
        }
    }
}

/// Gateway output for one artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationReport {
    pub fn clean() -> Self {
        Self {
            ok: true,
            diagnostics: Vec::new(),
        }
    }

    /// A report whose `ok` flag follows from its diagnostics.
    pub fn from_diagnostics(diagnostics: Vec<Diagnostic>) -> Self {
        let ok = !diagnostics.iter().any(|d| d.severity == Severity::Error);
        Self { ok, diagnostics }
    }

    /// Success means the gateway said ok and nothing blocking remains.
    pub fn is_clean(&self) -> bool {
        self.ok && !self.diagnostics.iter().any(Diagnostic::is_blocking)
    }

    pub fn blocking(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_blocking())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cp011_category() {
        assert_eq!(Diagnostic::warning("fqcn[action-core]", "x").category(), "fqcn");
        assert_eq!(Diagnostic::error("yaml", "x").category(), "yaml");
        assert_eq!(Diagnostic::error("[odd]", "x").category(), "unknown");
    }

    #[test]
    fn test_cp011_report_cleanliness() {
        assert!(ValidationReport::clean().is_clean());
        let info = ValidationReport::from_diagnostics(vec![Diagnostic::new(
            Severity::Info,
            "note[x]",
            "fyi",
        )]);
        assert!(info.is_clean());
        let warn = ValidationReport::from_diagnostics(vec![Diagnostic::warning("name[missing]", "x")]);
        assert!(warn.ok);
        assert!(!warn.is_clean());
        let err = ValidationReport::from_diagnostics(vec![Diagnostic::error("yaml[syntax]", "x")]);
        assert!(!err.ok);
        assert_eq!(err.blocking().count(), 1);
    }

    #[test]
    fn test_cp011_display() {
        let d = Diagnostic::error("yaml[syntax]", "bad indent").at("tasks/main.yml:3");
        assert_eq!(d.to_string(), "error yaml[syntax] tasks/main.yml:3: bad indent");
    }
}
