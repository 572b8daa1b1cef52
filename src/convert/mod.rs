//! Conversion pipeline: requests, the generate/validate/repair loop, and
//! the worker pool that runs sessions side by side.

pub mod artifact;
pub mod assemble;
pub mod batch;
pub mod feedback;
pub mod orchestrator;
pub mod request;
pub mod retry;
pub mod session;

pub use artifact::{parse_response, ArtifactTree};
pub use feedback::{synthesize, FeedbackDirective};
pub use orchestrator::{CancelToken, Orchestrator, Settings};
pub use request::GenerationRequest;
pub use session::{ConcludedSession, ConversionAttempt, Failure, FailureReason, Outcome};
