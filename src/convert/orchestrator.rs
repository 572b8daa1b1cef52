//! CP-022: Conversion orchestrator.
//!
//! ```text
//! Init → Generating → Validating → Succeeded
//!            ↑             │
//!            └─ Repairing ←┘ (attempts < max)   otherwise → Failed
//! ```
//!
//! Each step is a total function from the current phase to the next one.
//! Generator and gateway failures are retried with backoff inside their phase
//! and never consume a repair attempt; a response without file blocks does.
//! Cancellation is checked between steps and between retries, never during a
//! call.

use super::artifact::{parse_response, ArtifactTree};
use super::assemble;
use super::feedback;
use super::request::GenerationRequest;
use super::retry::Backoff;
use super::session::{ConcludedSession, ConversionSession, Failure, FailureReason, Outcome};
use crate::audit::eventlog::SessionEvent;
use crate::audit::hasher;
use crate::config::ConverterConfig;
use crate::core::types::ParsedCookbook;
use crate::mapping::MappingRegistry;
use crate::oracle::{
    Diagnostic, GatewayError, GenerationError, Generator, Severity, ValidationGateway,
    ValidationReport,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const PAUSE_SLICE: Duration = Duration::from_millis(50);

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation flag shared between a caller and its sessions.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Generate/validate cycles allowed for content defects.
    pub max_repair_attempts: u32,
    pub backoff: Backoff,
    pub examples_per_request: usize,
}

impl Settings {
    pub fn from_config(config: &ConverterConfig) -> Self {
        Self {
            max_repair_attempts: config.conversion.max_repair_attempts.max(1),
            backoff: Backoff::from_config(&config.conversion),
            examples_per_request: config.generator.examples_per_request,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_config(&ConverterConfig::default())
    }
}

// ============================================================================
// Phases
// ============================================================================

enum Phase {
    Init,
    Generating {
        request: GenerationRequest,
    },
    Validating {
        request: GenerationRequest,
        candidate: ArtifactTree,
        defects: Vec<Diagnostic>,
    },
    Repairing {
        request: GenerationRequest,
        report: ValidationReport,
    },
    Succeeded {
        artifact: ArtifactTree,
    },
    Failed(Failure),
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Generating { .. } => "generating",
            Self::Validating { .. } => "validating",
            Self::Repairing { .. } => "repairing",
            Self::Succeeded { .. } => "succeeded",
            Self::Failed(_) => "failed",
        }
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Drives sessions against a generator and a validation gateway. Cheap to
/// share: everything it holds is read-only.
#[derive(Clone)]
pub struct Orchestrator {
    generator: Arc<dyn Generator>,
    gateway: Arc<dyn ValidationGateway>,
    registry: Arc<MappingRegistry>,
    settings: Settings,
}

impl Orchestrator {
    pub fn new(
        generator: Arc<dyn Generator>,
        gateway: Arc<dyn ValidationGateway>,
        registry: Arc<MappingRegistry>,
        settings: Settings,
    ) -> Self {
        Self {
            generator,
            gateway,
            registry,
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run one session to a terminal outcome. Never fails: every problem is
    /// reported through the outcome.
    pub fn run(&self, cookbook: &ParsedCookbook, cancel: &CancelToken) -> ConcludedSession {
        let started = Instant::now();
        let mut session = ConversionSession::new(&cookbook.name);
        let mut phase = Phase::Init;

        let outcome = loop {
            phase = match phase {
                Phase::Succeeded { artifact } => break Outcome::Succeeded { artifact },
                Phase::Failed(failure) => break Outcome::Failed(failure),
                _ if cancel.is_cancelled() => self.cancelled(&session),
                other => {
                    debug!(session = %session.id, phase = other.name(), "transition");
                    session.record(SessionEvent::PhaseEntered {
                        phase: other.name().to_string(),
                        attempt: session.attempt_count(),
                    });
                    self.step(other, cookbook, &mut session, cancel)
                }
            };
        };

        info!(
            session = %session.id,
            cookbook = %cookbook.name,
            attempts = session.attempt_count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            outcome = %outcome.label(),
            "session concluded"
        );
        session.conclude(outcome)
    }

    fn step(
        &self,
        phase: Phase,
        cookbook: &ParsedCookbook,
        session: &mut ConversionSession,
        cancel: &CancelToken,
    ) -> Phase {
        match phase {
            Phase::Init => self.init(cookbook, session),
            Phase::Generating { request } => self.generate(request, cookbook, session, cancel),
            Phase::Validating {
                request,
                candidate,
                defects,
            } => self.validate(request, candidate, defects, session, cancel),
            Phase::Repairing { request, report } => self.repair(request, report, session),
            terminal => terminal,
        }
    }

    fn init(&self, cookbook: &ParsedCookbook, session: &mut ConversionSession) -> Phase {
        let request =
            GenerationRequest::build(cookbook, &self.registry, self.settings.examples_per_request);
        session.record(SessionEvent::SessionStarted {
            session: session.id.clone(),
            cookbook: cookbook.name.clone(),
            declarations: request.hints.len(),
            unresolved: request.unresolved().count(),
            cookport_version: env!("CARGO_PKG_VERSION").to_string(),
        });
        session.begin_attempt(&request);
        Phase::Generating { request }
    }

    fn generate(
        &self,
        request: GenerationRequest,
        cookbook: &ParsedCookbook,
        session: &mut ConversionSession,
        cancel: &CancelToken,
    ) -> Phase {
        let attempt = session.attempt_count();
        let backoff = self.settings.backoff;
        let mut retry = 0;

        let text = loop {
            if let Some(a) = session.current() {
                a.generation_calls += 1;
            }
            match self.generator.generate(&request) {
                Ok(text) => break text,
                Err(e) => {
                    if !e.is_retryable() {
                        warn!(session = %session.id, attempt, error = %e, "generator rejected request");
                        return Phase::Failed(Failure {
                            reason: FailureReason::GenerationRejected {
                                last_error: e.to_string(),
                            },
                            artifact: session.best_effort().0,
                            diagnostics: Vec::new(),
                        });
                    }
                    if retry >= backoff.max_retries {
                        warn!(session = %session.id, attempt, error = %e, "generator unavailable");
                        return Phase::Failed(Failure {
                            reason: FailureReason::GenerationUnavailable {
                                last_error: e.to_string(),
                            },
                            artifact: session.best_effort().0,
                            diagnostics: Vec::new(),
                        });
                    }
                    retry += 1;
                    let retry_after = match &e {
                        GenerationError::RateLimited { retry_after } => *retry_after,
                        _ => None,
                    };
                    let delay = backoff.delay(retry, retry_after);
                    debug!(attempt, retry, error = %e, delay_ms = delay.as_millis() as u64, "retrying generation");
                    session.record(SessionEvent::GenerationRetried {
                        attempt,
                        retry,
                        error: e.to_string(),
                        delay_ms: delay.as_millis() as u64,
                    });
                    if !pause(delay, cancel) {
                        return self.cancelled(session);
                    }
                }
            }
        };

        let parsed = parse_response(&text);
        if let Some(a) = session.current() {
            a.raw_response = Some(text);
        }

        if parsed.tree.is_empty() {
            // no files at all: a content defect, judged without the gateway
            let report = ValidationReport::from_diagnostics(parsed.defects);
            if let Some(a) = session.current() {
                a.report = Some(report.clone());
            }
            return self.judge(request, report, session);
        }

        let candidate = assemble::complete(parsed.tree, cookbook);
        let fingerprint = hasher::hash_tree(&candidate);
        session.record(SessionEvent::CandidateProduced {
            attempt,
            files: candidate.len(),
            fingerprint: fingerprint.clone(),
        });
        if let Some(a) = session.current() {
            a.artifact = Some(candidate.clone());
            a.fingerprint = Some(fingerprint);
        }
        Phase::Validating {
            request,
            candidate,
            defects: parsed.defects,
        }
    }

    fn validate(
        &self,
        request: GenerationRequest,
        candidate: ArtifactTree,
        defects: Vec<Diagnostic>,
        session: &mut ConversionSession,
        cancel: &CancelToken,
    ) -> Phase {
        let attempt = session.attempt_count();
        let backoff = self.settings.backoff;
        let mut retry = 0;

        let report = loop {
            if let Some(a) = session.current() {
                a.validation_calls += 1;
            }
            match self.gateway.validate(&candidate) {
                Ok(report) => break report,
                Err(e) => {
                    if retry >= backoff.max_retries {
                        warn!(session = %session.id, attempt, error = %e, "validation gateway unavailable");
                        return Phase::Failed(Failure {
                            reason: FailureReason::GatewayUnavailable {
                                last_error: e.to_string(),
                            },
                            artifact: Some(candidate),
                            diagnostics: defects,
                        });
                    }
                    retry += 1;
                    let delay = backoff.delay(retry, None);
                    session.record(SessionEvent::GatewayRetried {
                        attempt,
                        retry,
                        error: e.to_string(),
                        delay_ms: delay.as_millis() as u64,
                    });
                    if matches!(e, GatewayError::Timeout(_)) {
                        debug!(attempt, retry, "gateway timed out, retrying");
                    }
                    if !pause(delay, cancel) {
                        return self.cancelled(session);
                    }
                }
            }
        };

        let mut diagnostics = defects;
        diagnostics.extend(report.diagnostics);
        let ok = report.ok && !diagnostics.iter().any(|d| d.severity == Severity::Error);
        let merged = ValidationReport { ok, diagnostics };

        session.record(SessionEvent::ValidationFinished {
            attempt,
            ok: merged.ok,
            blocking: merged.blocking().count(),
        });
        if let Some(a) = session.current() {
            a.report = Some(merged.clone());
        }

        if merged.is_clean() {
            return Phase::Succeeded {
                artifact: candidate,
            };
        }
        self.judge(request, merged, session)
    }

    /// After a rejected attempt: repair if attempts remain, otherwise fail
    /// with the last candidate.
    fn judge(
        &self,
        request: GenerationRequest,
        report: ValidationReport,
        session: &mut ConversionSession,
    ) -> Phase {
        if session.attempt_count() < self.settings.max_repair_attempts {
            return Phase::Repairing { request, report };
        }
        // diagnostics must describe the artifact kept, not a later empty response
        let (artifact, mut diagnostics) = session.best_effort();
        let latest_empty = session.attempts.last().is_some_and(|a| a.artifact.is_none());
        if latest_empty {
            diagnostics.extend(report.diagnostics);
        }
        Phase::Failed(Failure {
            reason: FailureReason::ValidationExhausted,
            artifact,
            diagnostics,
        })
    }

    fn repair(
        &self,
        request: GenerationRequest,
        report: ValidationReport,
        session: &mut ConversionSession,
    ) -> Phase {
        let directive = feedback::synthesize(&report, &session.attempts);
        session.record(SessionEvent::FeedbackIssued {
            attempt: directive.attempt,
            categories: directive.categories().map(str::to_string).collect(),
            generic: directive.generic,
        });
        if let Some(a) = session.current() {
            a.feedback = Some(directive.clone());
        }
        let next = request.with_feedback(session.attempt_count() + 1, directive);
        session.begin_attempt(&next);
        Phase::Generating { request: next }
    }

    fn cancelled(&self, session: &ConversionSession) -> Phase {
        let (artifact, diagnostics) = session.best_effort();
        Phase::Failed(Failure {
            reason: FailureReason::Cancelled,
            artifact,
            diagnostics,
        })
    }
}

/// Sleep for `delay` in short slices. Returns false if cancelled meanwhile.
fn pause(delay: Duration, cancel: &CancelToken) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(PAUSE_SLICE.min(deadline - now));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::extractor::{extract, FileContext};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub(crate) const GOOD: &str = "```yaml path=tasks/main.yml\n- name: Install nginx\n  ansible.builtin.package:\n    name: nginx\n```\n```yaml path=meta/main.yml\ngalaxy_info:\n  role_name: web\n```\n";

    /// Replays scripted responses; repeats the last one when exhausted.
    pub(crate) struct ScriptedGenerator {
        script: Mutex<VecDeque<Result<String, GenerationError>>>,
        last: Mutex<Option<Result<String, GenerationError>>>,
        pub calls: Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedGenerator {
        pub(crate) fn new(script: Vec<Result<String, GenerationError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn always(response: Result<String, GenerationError>) -> Self {
            Self::new(vec![response])
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl Generator for ScriptedGenerator {
        fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
            self.calls.lock().unwrap().push(request.clone());
            let next = self.script.lock().unwrap().pop_front();
            let mut last = self.last.lock().unwrap();
            match next {
                Some(r) => {
                    *last = Some(r.clone());
                    r
                }
                None => last
                    .clone()
                    .unwrap_or_else(|| Err(GenerationError::Transport("empty script".into()))),
            }
        }
    }

    /// Replays scripted reports; repeats the last one when exhausted.
    pub(crate) struct ScriptedGateway {
        script: Mutex<VecDeque<Result<ValidationReport, GatewayError>>>,
        last: Mutex<Option<Result<ValidationReport, GatewayError>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedGateway {
        pub(crate) fn new(script: Vec<Result<ValidationReport, GatewayError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
                calls: Mutex::new(0),
            }
        }

        pub(crate) fn clean() -> Self {
            Self::new(vec![Ok(ValidationReport::clean())])
        }

        fn call_count(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    impl ValidationGateway for ScriptedGateway {
        fn validate(&self, _artifact: &ArtifactTree) -> Result<ValidationReport, GatewayError> {
            *self.calls.lock().unwrap() += 1;
            let next = self.script.lock().unwrap().pop_front();
            let mut last = self.last.lock().unwrap();
            match next {
                Some(r) => {
                    *last = Some(r.clone());
                    r
                }
                None => last.clone().unwrap_or_else(|| Ok(ValidationReport::clean())),
            }
        }
    }

    pub(crate) fn cookbook() -> ParsedCookbook {
        let unit = extract(
            "package 'nginx'\nservice 'nginx' do\n  action [:enable, :start]\nend\n",
            &FileContext::new("recipes/default.rb"),
        );
        ParsedCookbook {
            name: "web".to_string(),
            recipes: vec![unit],
            ..ParsedCookbook::default()
        }
    }

    fn settings(max_repair_attempts: u32, max_retries: u32) -> Settings {
        Settings {
            max_repair_attempts,
            backoff: Backoff::immediate(max_retries),
            examples_per_request: 1,
        }
    }

    fn fqcn_report() -> ValidationReport {
        ValidationReport::from_diagnostics(vec![Diagnostic::warning(
            "fqcn[action]",
            "missing fully-qualified primitive name",
        )
        .at("tasks/main.yml#1")])
    }

    fn orchestrator(
        generator: Arc<ScriptedGenerator>,
        gateway: Arc<ScriptedGateway>,
        settings: Settings,
    ) -> Orchestrator {
        Orchestrator::new(
            generator,
            gateway,
            Arc::new(MappingRegistry::with_defaults()),
            settings,
        )
    }

    #[test]
    fn test_cp022_clean_first_attempt() {
        let generator = Arc::new(ScriptedGenerator::always(Ok(GOOD.to_string())));
        let gateway = Arc::new(ScriptedGateway::clean());
        let orch = orchestrator(generator.clone(), gateway, settings(3, 2));
        let done = orch.run(&cookbook(), &CancelToken::new());
        assert!(done.outcome.is_success());
        assert_eq!(done.attempts.len(), 1);
        assert!(done.attempts[0].fingerprint.as_deref().unwrap().starts_with("blake3:"));
        assert!(generator.calls.lock().unwrap()[0].feedback.is_none());
    }

    #[test]
    fn test_cp022_repair_then_succeed() {
        let generator = Arc::new(ScriptedGenerator::always(Ok(GOOD.to_string())));
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Ok(fqcn_report()),
            Ok(ValidationReport::clean()),
        ]));
        let orch = orchestrator(generator.clone(), gateway, settings(3, 2));
        let done = orch.run(&cookbook(), &CancelToken::new());

        assert!(done.outcome.is_success());
        assert_eq!(done.attempts.len(), 2);
        assert_eq!(done.attempts[1].number, 2);
        let feedback = done.attempts[0].feedback.as_ref().unwrap();
        assert_eq!(feedback.categories().collect::<Vec<_>>(), vec!["fqcn"]);

        let calls = generator.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].attempt, 2);
        assert!(calls[1].feedback.is_some());
    }

    #[test]
    fn test_cp022_validation_exhausted_keeps_last_candidate() {
        let responses: Vec<_> = (1..=3)
            .map(|i| Ok(GOOD.replace("Install nginx", &format!("Install nginx {}", i))))
            .collect();
        let generator = Arc::new(ScriptedGenerator::new(responses));
        let gateway = Arc::new(ScriptedGateway::new(vec![Ok(fqcn_report())]));
        let orch = orchestrator(generator.clone(), gateway.clone(), settings(3, 2));
        let done = orch.run(&cookbook(), &CancelToken::new());

        assert_eq!(done.attempts.len(), 3);
        assert_eq!(generator.call_count(), 3);
        assert_eq!(gateway.call_count(), 3);
        match &done.outcome {
            Outcome::Failed(f) => {
                assert_eq!(f.reason, FailureReason::ValidationExhausted);
                let tasks = f.artifact.as_ref().unwrap().get("tasks/main.yml").unwrap();
                assert!(tasks.contains("Install nginx 3"));
                assert_eq!(f.diagnostics.len(), 1);
                assert_eq!(f.diagnostics[0].code, "fqcn[action]");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_cp022_generation_timeout_exhausts_sub_retry() {
        let generator = Arc::new(ScriptedGenerator::always(Err(GenerationError::Timeout(
            Duration::from_secs(120),
        ))));
        let gateway = Arc::new(ScriptedGateway::clean());
        let orch = orchestrator(generator.clone(), gateway.clone(), settings(3, 4));
        let done = orch.run(&cookbook(), &CancelToken::new());

        assert_eq!(generator.call_count(), 5);
        assert_eq!(gateway.call_count(), 0);
        assert_eq!(done.candidates(), 0);
        assert!(done.attempts.iter().all(|a| a.artifact.is_none()));
        assert_eq!(done.attempts[0].generation_calls, 5);
        match &done.outcome {
            Outcome::Failed(f) => {
                assert!(matches!(f.reason, FailureReason::GenerationUnavailable { .. }));
                assert!(f.artifact.is_none());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_cp022_rejected_request_fails_without_retry() {
        let generator = Arc::new(ScriptedGenerator::always(Err(GenerationError::Rejected {
            status: 401,
        })));
        let gateway = Arc::new(ScriptedGateway::clean());
        let orch = orchestrator(generator.clone(), gateway.clone(), settings(3, 4));
        let done = orch.run(&cookbook(), &CancelToken::new());

        assert_eq!(generator.call_count(), 1);
        assert_eq!(gateway.call_count(), 0);
        assert_eq!(done.attempts.len(), 1);
        assert!(!done
            .events
            .iter()
            .any(|e| matches!(e.event, SessionEvent::GenerationRetried { .. })));
        match &done.outcome {
            Outcome::Failed(f) => match &f.reason {
                FailureReason::GenerationRejected { last_error } => {
                    assert!(last_error.contains("401"))
                }
                other => panic!("unexpected reason {:?}", other),
            },
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_cp022_transport_error_then_recovery_same_attempt() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Err(GenerationError::RateLimited { retry_after: None }),
            Err(GenerationError::Transport("reset".into())),
            Ok(GOOD.to_string()),
        ]));
        let gateway = Arc::new(ScriptedGateway::clean());
        let orch = orchestrator(generator.clone(), gateway, settings(3, 4));
        let done = orch.run(&cookbook(), &CancelToken::new());
        assert!(done.outcome.is_success());
        assert_eq!(done.attempts.len(), 1);
        assert_eq!(done.attempts[0].generation_calls, 3);
    }

    #[test]
    fn test_cp022_gateway_unavailable_does_not_consume_attempt() {
        let generator = Arc::new(ScriptedGenerator::always(Ok(GOOD.to_string())));
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Err(GatewayError::Unavailable("lint crashed".into())),
            Err(GatewayError::Timeout(Duration::from_secs(1))),
            Ok(ValidationReport::clean()),
        ]));
        let orch = orchestrator(generator.clone(), gateway.clone(), settings(1, 3));
        let done = orch.run(&cookbook(), &CancelToken::new());
        assert!(done.outcome.is_success());
        assert_eq!(done.attempts.len(), 1);
        assert_eq!(done.attempts[0].validation_calls, 3);
        assert_eq!(generator.call_count(), 1);
    }

    #[test]
    fn test_cp022_gateway_unavailable_exhausted() {
        let generator = Arc::new(ScriptedGenerator::always(Ok(GOOD.to_string())));
        let gateway = Arc::new(ScriptedGateway::new(vec![Err(GatewayError::Unavailable(
            "down".into(),
        ))]));
        let orch = orchestrator(generator, gateway.clone(), settings(3, 2));
        let done = orch.run(&cookbook(), &CancelToken::new());
        assert_eq!(gateway.call_count(), 3);
        assert_eq!(done.attempts.len(), 1);
        match &done.outcome {
            Outcome::Failed(f) => {
                assert!(matches!(f.reason, FailureReason::GatewayUnavailable { .. }));
                assert!(f.artifact.is_some());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_cp022_missing_delimiter_consumes_attempt() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Ok("- name: no fences here".to_string()),
            Ok(GOOD.to_string()),
        ]));
        let gateway = Arc::new(ScriptedGateway::clean());
        let orch = orchestrator(generator.clone(), gateway.clone(), settings(3, 0));
        let done = orch.run(&cookbook(), &CancelToken::new());
        assert!(done.outcome.is_success());
        assert_eq!(done.attempts.len(), 2);
        assert_eq!(gateway.call_count(), 1);
        let first = done.attempts[0].report.as_ref().unwrap();
        assert_eq!(first.diagnostics[0].code, "output[delimiter]");
        assert!(done.attempts[0].artifact.is_none());
        let feedback = done.attempts[0].feedback.as_ref().unwrap();
        assert_eq!(feedback.categories().collect::<Vec<_>>(), vec!["output"]);
    }

    #[test]
    fn test_cp022_exhausted_after_empty_response_keeps_matching_diagnostics() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Ok(GOOD.to_string()),
            Ok("- name: no fences here".to_string()),
        ]));
        let gateway = Arc::new(ScriptedGateway::new(vec![Ok(fqcn_report())]));
        let orch = orchestrator(generator, gateway.clone(), settings(2, 0));
        let done = orch.run(&cookbook(), &CancelToken::new());

        assert_eq!(done.attempts.len(), 2);
        assert_eq!(gateway.call_count(), 1);
        match &done.outcome {
            Outcome::Failed(f) => {
                assert_eq!(f.reason, FailureReason::ValidationExhausted);
                let tasks = f.artifact.as_ref().unwrap().get("tasks/main.yml").unwrap();
                assert!(tasks.contains("Install nginx"));
                let codes: Vec<_> = f.diagnostics.iter().map(|d| d.code.as_str()).collect();
                assert_eq!(codes, vec!["fqcn[action]", "output[delimiter]"]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_cp022_cancelled_before_start() {
        let generator = Arc::new(ScriptedGenerator::always(Ok(GOOD.to_string())));
        let gateway = Arc::new(ScriptedGateway::clean());
        let orch = orchestrator(generator.clone(), gateway, settings(3, 0));
        let cancel = CancelToken::new();
        cancel.cancel();
        let done = orch.run(&cookbook(), &cancel);
        assert_eq!(generator.call_count(), 0);
        assert!(matches!(
            done.outcome,
            Outcome::Failed(Failure {
                reason: FailureReason::Cancelled,
                ..
            })
        ));
    }

    #[test]
    fn test_cp022_cancel_during_backoff() {
        let generator = Arc::new(ScriptedGenerator::always(Err(GenerationError::Transport(
            "down".into(),
        ))));
        let gateway = Arc::new(ScriptedGateway::clean());
        let orch = orchestrator(
            generator.clone(),
            gateway,
            Settings {
                max_repair_attempts: 3,
                backoff: Backoff::new(Duration::from_secs(30), Duration::from_secs(30), 5),
                examples_per_request: 0,
            },
        );
        let cancel = CancelToken::new();
        let flag = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            flag.cancel();
        });
        let start = Instant::now();
        let done = orch.run(&cookbook(), &cancel);
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(generator.call_count(), 1);
        assert!(matches!(
            done.outcome,
            Outcome::Failed(Failure {
                reason: FailureReason::Cancelled,
                ..
            })
        ));
    }

    #[test]
    fn test_cp022_path_defects_merged_into_report() {
        let response = format!("{}```yaml path=../escape.yml\nx: 1\n```\n", GOOD);
        let generator = Arc::new(ScriptedGenerator::always(Ok(response)));
        let gateway = Arc::new(ScriptedGateway::clean());
        let orch = orchestrator(generator, gateway, settings(1, 0));
        let done = orch.run(&cookbook(), &CancelToken::new());
        match &done.outcome {
            Outcome::Failed(f) => {
                assert_eq!(f.reason, FailureReason::ValidationExhausted);
                assert_eq!(f.diagnostics[0].code, "output[path]");
                assert_eq!(f.diagnostics[0].severity, Severity::Error);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_cp022_events_recorded() {
        let generator = Arc::new(ScriptedGenerator::always(Ok(GOOD.to_string())));
        let gateway = Arc::new(ScriptedGateway::clean());
        let orch = orchestrator(generator, gateway, settings(3, 0));
        let done = orch.run(&cookbook(), &CancelToken::new());
        let kinds: Vec<&str> = done
            .events
            .iter()
            .map(|e| match &e.event {
                SessionEvent::SessionStarted { .. } => "started",
                SessionEvent::PhaseEntered { .. } => "phase",
                SessionEvent::CandidateProduced { .. } => "candidate",
                SessionEvent::ValidationFinished { .. } => "validated",
                SessionEvent::SessionConcluded { .. } => "concluded",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds.first(), Some(&"phase"));
        assert!(kinds.contains(&"started"));
        assert!(kinds.contains(&"candidate"));
        assert_eq!(kinds.last(), Some(&"concluded"));
    }
}
