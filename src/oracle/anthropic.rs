//! CP-015: Generator backed by the Anthropic Messages API.
//!
//! One blocking HTTP call per `generate`. Retries and backoff live in the
//! orchestrator; this client only classifies what went wrong.

use super::{GenerationError, Generator};
use crate::config::GeneratorConfig;
use crate::convert::request::GenerationRequest;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const ANTHROPIC_VERSION: &str = "2023-06-01";

// ── Request / Response types ─────────────────────────────────────────────────

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: Vec<ApiMessage<'a>>,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

// ── Client ───────────────────────────────────────────────────────────────────

pub struct AnthropicGenerator {
    agent: ureq::Agent,
    config: GeneratorConfig,
    api_key: String,
    timeout: Duration,
}

impl AnthropicGenerator {
    pub fn new(config: GeneratorConfig, api_key: String, timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            agent,
            config,
            api_key,
            timeout,
        }
    }
}

impl Generator for AnthropicGenerator {
    fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let prompt = request.prompt();
        let body = MessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            system: &prompt.system,
            messages: vec![ApiMessage {
                role: "user",
                content: &prompt.user,
            }],
        };
        debug!(
            cookbook = %request.cookbook,
            attempt = request.attempt,
            model = %self.config.model,
            "calling generator"
        );

        let response = self
            .agent
            .post(&self.config.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .send_json(&body)
            .map_err(|e| self.transport(e))?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);

        if let Some(err) = classify_status(status, retry_after) {
            return Err(err);
        }

        let parsed: MessagesResponse = response
            .into_body()
            .read_json()
            .map_err(|e| self.transport(e))?;
        extract_text(parsed)
    }
}

impl AnthropicGenerator {
    fn transport(&self, e: ureq::Error) -> GenerationError {
        match e {
            ureq::Error::Timeout(_) => GenerationError::Timeout(self.timeout),
            other => GenerationError::Transport(other.to_string()),
        }
    }
}

/// Map a non-success HTTP status to an error. Client errors other than
/// timeouts and rate limits are not retried.
fn classify_status(status: u16, retry_after: Option<Duration>) -> Option<GenerationError> {
    match status {
        200..=299 => None,
        429 | 529 => Some(GenerationError::RateLimited { retry_after }),
        408 | 504 => Some(GenerationError::Transport(format!("gateway timeout (HTTP {})", status))),
        400..=499 => Some(GenerationError::Rejected { status }),
        _ => Some(GenerationError::Transport(format!("HTTP {}", status))),
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

/// Concatenate the text blocks of a response.
fn extract_text(response: MessagesResponse) -> Result<String, GenerationError> {
    let text: Vec<String> = response
        .content
        .into_iter()
        .filter(|b| b.block_type == "text")
        .filter_map(|b| b.text)
        .collect();
    if text.is_empty() {
        return Err(GenerationError::Transport(
            "response contained no text content".to_string(),
        ));
    }
    Ok(text.join("\n"))
}
