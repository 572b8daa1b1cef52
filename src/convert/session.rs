//! CP-021: Conversion sessions, attempts and outcomes.

use super::artifact::ArtifactTree;
use super::feedback::FeedbackDirective;
use super::request::GenerationRequest;
use crate::audit::eventlog::{self, SessionEvent, TimestampedEvent};
use crate::oracle::{Diagnostic, ValidationReport};
use serde::Serialize;
use std::fmt;

/// One pass through generate → validate.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionAttempt {
    pub number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<GenerationRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactTree>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<ValidationReport>,
    /// Directive produced from this attempt's report.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<FeedbackDirective>,
    /// Generator calls made, including transport retries.
    pub generation_calls: u32,
    /// Gateway calls made, including availability retries.
    pub validation_calls: u32,
}

impl ConversionAttempt {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            request: None,
            raw_response: None,
            artifact: None,
            fingerprint: None,
            report: None,
            feedback: None,
            generation_calls: 0,
            validation_calls: 0,
        }
    }
}

/// Why a session failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    GenerationUnavailable { last_error: String },
    /// The generator refused the request; retrying cannot help.
    GenerationRejected { last_error: String },
    GatewayUnavailable { last_error: String },
    ValidationExhausted,
    Cancelled,
    /// The session's worker died before producing an outcome.
    WorkerCrashed { last_error: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GenerationUnavailable { last_error } => {
                write!(f, "generation unavailable ({})", last_error)
            }
            Self::GenerationRejected { last_error } => {
                write!(f, "generation rejected ({})", last_error)
            }
            Self::GatewayUnavailable { last_error } => {
                write!(f, "validation gateway unavailable ({})", last_error)
            }
            Self::ValidationExhausted => write!(f, "validation exhausted"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::WorkerCrashed { last_error } => write!(f, "worker crashed ({})", last_error),
        }
    }
}

/// A failed session with whatever it got furthest with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
    #[serde(flatten)]
    pub reason: FailureReason,
    /// Last candidate, if any attempt produced one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactTree>,
    /// Diagnostics still outstanding on that candidate, then the defects of a
    /// final attempt that produced no candidate.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded { artifact: ArtifactTree },
    Failed(Failure),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// The artifact to write: the passing one, or the best effort.
    pub fn artifact(&self) -> Option<&ArtifactTree> {
        match self {
            Self::Succeeded { artifact } => Some(artifact),
            Self::Failed(f) => f.artifact.as_ref(),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Succeeded { .. } => "succeeded".to_string(),
            Self::Failed(f) => format!("failed: {}", f.reason),
        }
    }
}

/// Mutable state of a running session. Owned by one orchestrator run.
#[derive(Debug)]
pub struct ConversionSession {
    pub id: String,
    pub cookbook: String,
    pub started_at: String,
    pub attempts: Vec<ConversionAttempt>,
    pub events: Vec<TimestampedEvent>,
}

impl ConversionSession {
    pub fn new(cookbook: &str) -> Self {
        Self {
            id: eventlog::generate_session_id(cookbook),
            cookbook: cookbook.to_string(),
            started_at: eventlog::now_iso8601(),
            attempts: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn record(&mut self, event: SessionEvent) {
        self.events.push(TimestampedEvent::now(event));
    }

    /// Start attempt `attempts.len() + 1` for `request`.
    pub fn begin_attempt(&mut self, request: &GenerationRequest) -> &mut ConversionAttempt {
        let mut attempt = ConversionAttempt::new(self.attempts.len() as u32 + 1);
        attempt.request = Some(request.clone());
        self.attempts.push(attempt);
        let last = self.attempts.len() - 1;
        &mut self.attempts[last]
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// The attempt in progress. Only valid after [`begin_attempt`].
    ///
    /// [`begin_attempt`]: ConversionSession::begin_attempt
    pub fn current(&mut self) -> Option<&mut ConversionAttempt> {
        self.attempts.last_mut()
    }

    /// Most recent candidate and its outstanding diagnostics.
    pub fn best_effort(&self) -> (Option<ArtifactTree>, Vec<Diagnostic>) {
        for attempt in self.attempts.iter().rev() {
            if let Some(artifact) = &attempt.artifact {
                let diags = attempt
                    .report
                    .as_ref()
                    .map(|r| r.diagnostics.clone())
                    .unwrap_or_default();
                return (Some(artifact.clone()), diags);
            }
        }
        (None, Vec::new())
    }

    pub fn conclude(mut self, outcome: Outcome) -> ConcludedSession {
        self.record(SessionEvent::SessionConcluded {
            outcome: outcome.label(),
            attempts: self.attempts.len(),
        });
        ConcludedSession {
            id: self.id,
            cookbook: self.cookbook,
            started_at: self.started_at,
            finished_at: eventlog::now_iso8601(),
            outcome,
            attempts: self.attempts,
            events: self.events,
        }
    }
}

/// A finished session. Immutable; delivered to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct ConcludedSession {
    pub id: String,
    pub cookbook: String,
    pub started_at: String,
    pub finished_at: String,
    pub outcome: Outcome,
    pub attempts: Vec<ConversionAttempt>,
    #[serde(skip)]
    pub events: Vec<TimestampedEvent>,
}

impl ConcludedSession {
    /// Attempts that produced a candidate artifact.
    pub fn candidates(&self) -> usize {
        self.attempts.iter().filter(|a| a.artifact.is_some()).count()
    }
}
