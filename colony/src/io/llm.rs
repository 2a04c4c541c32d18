//! Language-model effector: transport abstraction, retry with jittered
//! backoff, token/cost accounting, and output sanitization.
//!
//! The [`LlmTransport`] trait decouples the roles from the actual provider.
//! Tests use scripted transports that return predetermined completions
//! without touching the network. The client never sends a max-output-tokens
//! parameter; long migrations must not be truncated by a client-side cap.

use std::cell::{Cell, RefCell};
use std::error::Error;
use std::fmt;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use rand::Rng;
use rand::rngs::StdRng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::io::config::{BudgetConfig, LlmConfig, PricingConfig};

/// Raw provider response before accounting.
#[derive(Debug, Clone)]
pub struct RawCompletion {
    pub content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Provider-reported request cost, when available.
    pub cost_usd: Option<f64>,
}

/// Transport failure with a retryability verdict.
#[derive(Debug, Clone)]
pub struct TransportError {
    pub message: String,
    pub retryable: bool,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "llm transport error: {}", self.message)
    }
}

impl Error for TransportError {}

/// Abstraction over language-model backends.
pub trait LlmTransport {
    fn model(&self) -> &str;
    fn send(
        &self,
        prompt: &str,
        system: Option<&str>,
        timeout: Duration,
    ) -> std::result::Result<RawCompletion, TransportError>;
}

/// Accounted response handed to the roles.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
}

/// Budget-aware client wrapping a transport with bounded retry.
///
/// Token and cost totals are first-class loop state: the orchestrator reads
/// them at every stop-condition evaluation, and Transform consults
/// [`LlmClient::reserve`] before each call so budget exhaustion is observable
/// before the effector fires.
pub struct LlmClient {
    transport: Box<dyn LlmTransport>,
    request_timeout: Duration,
    retry_attempts: u32,
    estimated_completion_tokens: u64,
    max_tokens_total: u64,
    max_budget_usd: f64,
    pricing: Option<PricingConfig>,
    total_tokens: Cell<u64>,
    total_cost_usd: Cell<f64>,
    budget_blocked: Cell<bool>,
    rng: RefCell<StdRng>,
}

impl LlmClient {
    pub fn new(
        transport: Box<dyn LlmTransport>,
        llm: &LlmConfig,
        budgets: &BudgetConfig,
        rng: StdRng,
    ) -> Self {
        Self {
            transport,
            request_timeout: Duration::from_secs(budgets.request_timeout_seconds),
            retry_attempts: llm.retry_attempts.max(1),
            estimated_completion_tokens: llm.estimated_completion_tokens,
            max_tokens_total: budgets.max_tokens_total,
            max_budget_usd: budgets.max_budget_usd,
            pricing: llm.pricing.clone(),
            total_tokens: Cell::new(0),
            total_cost_usd: Cell::new(0.0),
            budget_blocked: Cell::new(false),
            rng: RefCell::new(rng),
        }
    }

    pub fn model(&self) -> &str {
        self.transport.model()
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens.get()
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.total_cost_usd.get()
    }

    /// True once a call was refused for budget reasons.
    pub fn budget_blocked(&self) -> bool {
        self.budget_blocked.get()
    }

    /// Check that an upcoming call fits the remaining budgets; a refusal is
    /// recorded so the orchestrator can attribute the eventual stop.
    pub fn reserve(&self, prompt: &str, system: Option<&str>) -> bool {
        let estimated_prompt = estimate_prompt_tokens(prompt, system);
        let estimated = estimated_prompt + self.estimated_completion_tokens;
        if self.total_tokens.get() + estimated > self.max_tokens_total {
            warn!(
                used = self.total_tokens.get(),
                estimated, budget = self.max_tokens_total,
                "token budget would be exceeded, refusing call"
            );
            self.budget_blocked.set(true);
            return false;
        }
        if self.max_budget_usd > 0.0 {
            if let Some(pricing) = &self.pricing {
                let estimated_cost = estimated_prompt as f64 * pricing.prompt_per_token
                    + self.estimated_completion_tokens as f64 * pricing.completion_per_token;
                if self.total_cost_usd.get() + estimated_cost > self.max_budget_usd {
                    warn!(
                        used_usd = self.total_cost_usd.get(),
                        estimated_cost, budget_usd = self.max_budget_usd,
                        "cost budget would be exceeded, refusing call"
                    );
                    self.budget_blocked.set(true);
                    return false;
                }
            }
        }
        true
    }

    /// Call the model, retrying transient failures with jittered exponential
    /// backoff. Accounting happens before the response is returned, so budget
    /// exhaustion is observable at the next synchronization point.
    #[instrument(skip_all, fields(model = self.transport.model()))]
    pub fn generate(&self, prompt: &str, system: Option<&str>) -> Result<Completion> {
        let mut last_error: Option<TransportError> = None;
        for attempt in 0..self.retry_attempts {
            let start = Instant::now();
            match self.transport.send(prompt, system, self.request_timeout) {
                Ok(raw) => {
                    let tokens_used = raw.prompt_tokens + raw.completion_tokens;
                    let cost_usd = raw.cost_usd.unwrap_or_else(|| {
                        self.pricing.as_ref().map_or(0.0, |pricing| {
                            raw.prompt_tokens as f64 * pricing.prompt_per_token
                                + raw.completion_tokens as f64 * pricing.completion_per_token
                        })
                    });
                    self.total_tokens.set(self.total_tokens.get() + tokens_used);
                    self.total_cost_usd.set(self.total_cost_usd.get() + cost_usd);
                    debug!(tokens_used, cost_usd, "llm call complete");
                    return Ok(Completion {
                        content: raw.content,
                        tokens_used,
                        cost_usd,
                        latency_ms: start.elapsed().as_millis() as u64,
                    });
                }
                Err(err) if err.retryable => {
                    warn!(attempt, error = %err.message, "retryable llm failure");
                    let has_next = attempt + 1 < self.retry_attempts;
                    if has_next {
                        std::thread::sleep(self.backoff_for_attempt(attempt));
                    }
                    last_error = Some(err);
                }
                Err(err) => return Err(anyhow::Error::new(err)),
            }
        }
        let err = last_error.unwrap_or(TransportError {
            message: "no attempts were made".to_string(),
            retryable: false,
        });
        Err(anyhow::Error::new(err)).context("llm retries exhausted")
    }

    /// Exponential backoff (1s base, doubling, capped at 30s) plus uniform
    /// jitter of up to half the delay, drawn from the seeded run RNG.
    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = Duration::from_secs(1 << attempt.min(5)).min(Duration::from_secs(30));
        let jitter = self.rng.borrow_mut().gen_range(0.0..0.5);
        base.mul_f64(1.0 + jitter)
    }
}

/// Prompt-side token estimate: one token per four characters, at least one.
fn estimate_prompt_tokens(prompt: &str, system: Option<&str>) -> u64 {
    let chars = prompt.len() + system.map_or(0, str::len);
    ((chars / 4) as u64).max(1)
}

/// Extract code from markdown fences and strip stray fence wrappers.
///
/// Prefers the longest fenced block; when no complete block exists, isolated
/// fence lines (including an unterminated opening fence) are dropped so raw
/// code survives intact.
pub fn extract_code_block(text: &str) -> String {
    static BLOCK_RE: OnceLock<Regex> = OnceLock::new();
    static FENCE_LINE_RE: OnceLock<Regex> = OnceLock::new();
    let block_re = BLOCK_RE
        .get_or_init(|| Regex::new(r"(?s)```[A-Za-z0-9_+-]*\n(.*?)```").expect("block regex"));
    let fence_line_re = FENCE_LINE_RE
        .get_or_init(|| Regex::new(r"^\s*```[A-Za-z0-9_+-]*\s*$").expect("fence regex"));

    let longest = block_re
        .captures_iter(text)
        .filter_map(|captures| captures.get(1))
        .max_by_key(|code| code.len());
    if let Some(code) = longest {
        return code.as_str().trim().to_string();
    }

    let raw = text.trim();
    if raw.is_empty() {
        return String::new();
    }
    raw.lines()
        .enumerate()
        .filter(|(index, line)| {
            if fence_line_re.is_match(line) {
                return false;
            }
            !(*index == 0 && line.trim_start().starts_with("```"))
        })
        .map(|(_, line)| line)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

// ----------------------------------------------------------------------
// HTTP transport
// ----------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    cost: Option<f64>,
}

/// OpenRouter-style chat-completions transport.
///
/// Credentials come from the process environment, never from the config
/// artifact.
pub struct OpenRouterTransport {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f64,
}

impl OpenRouterTransport {
    pub const API_KEY_VAR: &'static str = "OPENROUTER_API_KEY";

    pub fn from_env(llm: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(Self::API_KEY_VAR)
            .map_err(|_| anyhow!("{} environment variable is required", Self::API_KEY_VAR))?;
        let client = reqwest::blocking::Client::builder()
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            endpoint: llm.endpoint.clone(),
            api_key,
            model: llm.model.clone(),
            temperature: llm.temperature,
        })
    }
}

impl LlmTransport for OpenRouterTransport {
    fn model(&self) -> &str {
        &self.model
    }

    fn send(
        &self,
        prompt: &str,
        system: Option<&str>,
        timeout: Duration,
    ) -> std::result::Result<RawCompletion, TransportError> {
        let mut messages = Vec::new();
        if let Some(system) = system {
            messages.push(ChatMessage { role: "system", content: system });
        }
        messages.push(ChatMessage { role: "user", content: prompt });
        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(&body)
            .send()
            .map_err(|err| TransportError {
                message: err.to_string(),
                retryable: true,
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            return Err(TransportError {
                message: format!("{status}: {detail}"),
                retryable: status.as_u16() == 429 || status.is_server_error(),
            });
        }

        let parsed: ChatResponse = response.json().map_err(|err| TransportError {
            message: format!("malformed completion payload: {err}"),
            retryable: false,
        })?;
        let content = parsed
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default();
        let usage = parsed.usage.unwrap_or(ChatUsage {
            prompt_tokens: 0,
            completion_tokens: 0,
            cost: None,
        });
        Ok(RawCompletion {
            content,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cost_usd: usage.cost,
        })
    }
}
