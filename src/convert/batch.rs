//! CP-023: Bounded worker pool over conversion sessions.
//!
//! Each session runs on a blocking thread; a semaphore caps how many run at
//! once. Sessions share the orchestrator (and its registry) read-only and
//! own everything else. Results come back in submission order.

use super::orchestrator::{CancelToken, Orchestrator};
use super::session::{ConcludedSession, Failure, FailureReason, Outcome};
use crate::core::types::ParsedCookbook;
use crate::error::{ConvertError, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info};

/// Run every cookbook through `orchestrator` with at most `workers` sessions
/// in flight.
pub async fn run_all(
    orchestrator: Arc<Orchestrator>,
    cookbooks: Vec<ParsedCookbook>,
    workers: usize,
    cancel: CancelToken,
) -> Vec<ConcludedSession> {
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    let mut handles = Vec::with_capacity(cookbooks.len());

    for cookbook in cookbooks {
        let permits = Arc::clone(&permits);
        let orchestrator = Arc::clone(&orchestrator);
        let cancel = cancel.clone();
        let name = cookbook.name.clone();
        let handle = tokio::spawn(async move {
            // the semaphore is never closed
            let _permit = permits.acquire_owned().await.ok();
            tokio::task::spawn_blocking(move || orchestrator.run(&cookbook, &cancel)).await
        });
        handles.push((name, handle));
    }

    let mut sessions = Vec::with_capacity(handles.len());
    for (name, handle) in handles {
        match handle.await {
            Ok(Ok(session)) => sessions.push(session),
            Ok(Err(e)) | Err(e) => {
                error!(cookbook = %name, error = %e, "session worker died");
                sessions.push(crashed(&name, &e.to_string()));
            }
        }
    }
    info!(
        sessions = sessions.len(),
        succeeded = sessions.iter().filter(|s| s.outcome.is_success()).count(),
        "batch finished"
    );
    sessions
}

/// Blocking wrapper: builds a runtime, cancels on Ctrl-C, runs the batch.
pub fn run_blocking(
    orchestrator: Orchestrator,
    cookbooks: Vec<ParsedCookbook>,
    workers: usize,
    cancel: CancelToken,
) -> Result<Vec<ConcludedSession>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers.clamp(1, 16))
        .enable_all()
        .build()
        .map_err(|e| ConvertError::config(format!("cannot start runtime: {}", e)))?;

    runtime.block_on(async move {
        let on_signal = cancel.clone();
        let watcher = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("interrupt: finishing in-flight calls, then stopping");
                on_signal.cancel();
            }
        });
        let sessions = run_all(Arc::new(orchestrator), cookbooks, workers, cancel).await;
        watcher.abort();
        Ok(sessions)
    })
}

/// Stand-in for a session whose worker panicked.
fn crashed(cookbook: &str, error: &str) -> ConcludedSession {
    super::session::ConversionSession::new(cookbook).conclude(Outcome::Failed(Failure {
        reason: FailureReason::WorkerCrashed {
            last_error: error.to_string(),
        },
        artifact: None,
        diagnostics: Vec::new(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::orchestrator::tests::{cookbook, ScriptedGateway, ScriptedGenerator, GOOD};
    use crate::convert::orchestrator::Settings;
    use crate::convert::request::GenerationRequest;
    use crate::convert::retry::Backoff;
    use crate::mapping::MappingRegistry;
    use crate::oracle::{GenerationError, Generator};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn settings() -> Settings {
        Settings {
            max_repair_attempts: 2,
            backoff: Backoff::immediate(0),
            examples_per_request: 0,
        }
    }

    fn named(name: &str) -> ParsedCookbook {
        let mut cb = cookbook();
        cb.name = name.to_string();
        cb
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cp023_results_in_submission_order() {
        let orch = Orchestrator::new(
            Arc::new(ScriptedGenerator::always(Ok(GOOD.to_string()))),
            Arc::new(ScriptedGateway::clean()),
            Arc::new(MappingRegistry::with_defaults()),
            settings(),
        );
        let cookbooks = vec![named("a"), named("b"), named("c")];
        let sessions = run_all(Arc::new(orch), cookbooks, 2, CancelToken::new()).await;
        let names: Vec<_> = sessions.iter().map(|s| s.cookbook.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(sessions.iter().all(|s| s.outcome.is_success()));
    }

    /// Counts concurrent calls and remembers the peak.
    struct SlowGenerator {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Generator for SlowGenerator {
        fn generate(&self, _request: &GenerationRequest) -> std::result::Result<String, GenerationError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(GOOD.to_string())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cp023_worker_bound_respected() {
        let generator = Arc::new(SlowGenerator {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let orch = Orchestrator::new(
            generator.clone(),
            Arc::new(ScriptedGateway::clean()),
            Arc::new(MappingRegistry::with_defaults()),
            settings(),
        );
        let cookbooks = (0..6).map(|i| named(&format!("cb{}", i))).collect();
        let sessions = run_all(Arc::new(orch), cookbooks, 2, CancelToken::new()).await;
        assert_eq!(sessions.len(), 6);
        assert!(generator.peak.load(Ordering::SeqCst) <= 2);
    }

    struct PanickingGenerator;

    impl Generator for PanickingGenerator {
        fn generate(&self, request: &GenerationRequest) -> std::result::Result<String, GenerationError> {
            if request.cookbook == "bad" {
                panic!("generator blew up");
            }
            Ok(GOOD.to_string())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cp023_panicked_worker_reported_as_crash() {
        let orch = Orchestrator::new(
            Arc::new(PanickingGenerator),
            Arc::new(ScriptedGateway::clean()),
            Arc::new(MappingRegistry::with_defaults()),
            settings(),
        );
        let cookbooks = vec![named("bad"), named("good")];
        let sessions = run_all(Arc::new(orch), cookbooks, 2, CancelToken::new()).await;
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].cookbook, "bad");
        match &sessions[0].outcome {
            Outcome::Failed(f) => {
                assert!(matches!(f.reason, FailureReason::WorkerCrashed { .. }));
                assert_ne!(f.reason, FailureReason::Cancelled);
                assert!(f.reason.to_string().starts_with("worker crashed"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(sessions[1].outcome.is_success());
    }

    #[test]
    fn test_cp023_cancelled_batch() {
        let orch = Orchestrator::new(
            Arc::new(ScriptedGenerator::always(Ok(GOOD.to_string()))),
            Arc::new(ScriptedGateway::clean()),
            Arc::new(MappingRegistry::with_defaults()),
            settings(),
        );
        let cancel = CancelToken::new();
        cancel.cancel();
        let sessions = run_blocking(orch, vec![named("a"), named("b")], 2, cancel).unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().all(|s| matches!(
            &s.outcome,
            Outcome::Failed(f) if f.reason == FailureReason::Cancelled
        )));
    }
}
