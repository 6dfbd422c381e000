//! Default collaborator backed by the OpenRouter chat completions API.
//!
//! One cheap model call per work order: summarization merges the running
//! summary with a new message span; enrichment reads the heuristic
//! checkpoint plus recent messages and returns a partial JSON refinement.
//! Transient upstream failures are retried with backoff; everything else
//! surfaces as an error string for the caller's fallback path.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::retry::{RetryConfig, is_transient_error};
use super::{CollabFuture, Collaborator, SummarizeRequest};
use crate::Message;

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Default model for summarization and enrichment calls. Both are
/// compression work; a small model is the right tool.
pub const DEFAULT_MODEL: &str = "anthropic/claude-3.5-haiku";

/// Token budget for enrichment responses.
const ENRICH_MAX_TOKENS: u32 = 1024;

const SUMMARIZATION_PROMPT: &str = "\
Summarize the following conversation messages concisely. Focus on:
- What was accomplished and what remains to be done
- Key findings and decisions made
- Failed approaches (what was tried and why it failed)
- File paths, function names, and error messages, preserved verbatim

Rules:
- Only include facts explicitly stated in the messages. Do not infer.
- Be concise. Every sentence must earn its place.
- If there is an existing summary, merge the new information into it to \
produce a single cohesive summary that replaces it entirely. Integrate and \
deduplicate; do not append.";

const ENRICHMENT_PROMPT: &str = "\
You refine a session checkpoint. You are given the checkpoint JSON produced \
by heuristics, followed by recent conversation messages. Return a JSON \
object with any of these fields, including only the ones you can improve:
  topic, next_action, thread_summary (strings),
  status (one of: in_progress, idle, waiting_for_user, done, aborted),
  decisions, open_items (arrays of short strings),
  key_exchanges (array of {role: user|agent, gist}).

Rules:
- Output ONLY the JSON object. No commentary, no code fences.
- Omit any field you cannot improve on. An empty object is a valid answer.
- Keep entries short and factual; preserve file paths and names verbatim.";

/// OpenRouter-backed [`Collaborator`].
pub struct OpenRouterCollaborator {
    client: reqwest::Client,
    api_key: String,
    model: String,
    temperature: f32,
    retry: RetryConfig,
}

impl OpenRouterCollaborator {
    /// Create a client with the default model and retry policy.
    pub fn new(api_key: impl Into<String>) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent("carryover/0.2")
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.3,
            retry: RetryConfig::default(),
        })
    }

    /// Override the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, system: &str, user: &str, max_tokens: u32) -> Result<String, String> {
        let mut attempt = 0;
        loop {
            match self.send_once(system, user, max_tokens).await {
                Ok(text) => return Ok(text),
                Err(e) if attempt < self.retry.max_retries && is_transient_error(&e) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        "collaborator call failed (attempt {}), retrying in {:.1}s: {e}",
                        attempt + 1,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(&self, system: &str, user: &str, max_tokens: u32) -> Result<String, String> {
        let body = WireRequest {
            model: &self.model,
            messages: vec![
                WireMessage {
                    role: "system",
                    content: system,
                },
                WireMessage {
                    role: "user",
                    content: user,
                },
            ],
            max_tokens,
            temperature: self.temperature,
        };

        let start = Instant::now();
        let resp = self
            .client
            .post(OPENROUTER_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| format!("failed to read response: {e}"))?;
        debug!(
            "collaborator response: HTTP {status} in {:.1}s ({} bytes)",
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(format!("collaborator API HTTP {status}: {text}"));
        }

        let parsed: WireResponse =
            serde_json::from_str(&text).map_err(|e| format!("failed to parse response: {e}"))?;
        if let Some(err) = parsed.error {
            return Err(format!("collaborator API error: {}", err.message));
        }
        parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message.content)
            .ok_or_else(|| "collaborator returned no content".to_string())
    }
}

impl Collaborator for OpenRouterCollaborator {
    fn summarize<'a>(
        &'a self,
        request: SummarizeRequest<'a>,
    ) -> CollabFuture<'a, Result<String, String>> {
        Box::pin(async move {
            let input = format_summarize_input(&request);
            let text = self
                .chat(SUMMARIZATION_PROMPT, &input, request.max_tokens)
                .await?;
            let trimmed = text.trim();
            if trimmed.is_empty() {
                Err("collaborator returned an empty summary".to_string())
            } else {
                Ok(trimmed.to_string())
            }
        })
    }

    fn enrich<'a>(
        &'a self,
        checkpoint_json: &'a str,
        recent: &'a [Message],
    ) -> CollabFuture<'a, Result<Option<String>, String>> {
        Box::pin(async move {
            let input = format_enrich_input(checkpoint_json, recent);
            let text = self.chat(ENRICHMENT_PROMPT, &input, ENRICH_MAX_TOKENS).await?;
            let trimmed = text.trim();
            Ok(if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            })
        })
    }
}

/// Format a summarization work order as a single user message: optional
/// existing summary, optional special instructions, then the message span
/// in full.
fn format_summarize_input(request: &SummarizeRequest<'_>) -> String {
    let mut input = String::new();
    if let Some(instructions) = &request.custom_instructions {
        input.push_str("=== ADDITIONAL INSTRUCTIONS ===\n");
        input.push_str(instructions);
        input.push_str("\n\n");
    }
    if let Some(existing) = &request.previous_summary {
        input.push_str("=== EXISTING SUMMARY ===\n");
        input.push_str(existing);
        input.push_str("\n\n=== NEW MESSAGES TO SUMMARIZE ===\n");
    }
    for msg in request.messages {
        input.push_str(&format!("[{}]: {}\n\n", msg.role, render_message(msg)));
    }
    input
}

fn format_enrich_input(checkpoint_json: &str, recent: &[Message]) -> String {
    let mut input = String::new();
    input.push_str("=== HEURISTIC CHECKPOINT ===\n");
    input.push_str(checkpoint_json);
    input.push_str("\n\n=== RECENT MESSAGES ===\n");
    for msg in recent {
        input.push_str(&format!("[{}]: {}\n\n", msg.role, render_message(msg)));
    }
    input
}

fn render_message(msg: &Message) -> String {
    if let Some(text) = msg.content.as_deref() {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    if let Some(calls) = &msg.tool_calls
        && !calls.is_empty()
    {
        let rendered: Vec<String> = calls
            .iter()
            .map(|c| format!("[called tool: {}({})]", c.name, c.arguments))
            .collect();
        return rendered.join(" ");
    }
    "[no content]".to_string()
}

// ── Wire types ─────────────────────────────────────────────────────

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Option<Vec<WireChoice>>,
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireContent,
}

#[derive(Deserialize)]
struct WireContent {
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireError {
    message: String,
}
