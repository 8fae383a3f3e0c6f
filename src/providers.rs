//! Providers - the compute agents behind each tier
//!
//! Every provider answers the same contract:
//! `invoke(prompt, model, system) -> ProviderResponse`.
//!
//! - `OllamaProvider`: local tier, free
//! - `ClaudeCliProvider`: cloud tier through the locally authenticated CLI, free
//! - `AnthropicApiProvider`: cloud tier through the Messages API, billed per call

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::resilience::{CallError, ErrorKind};

/// Component names used for breakers, limiters and deadlines
pub const OLLAMA_COMPONENT: &str = "ollama";
pub const CLI_COMPONENT: &str = "claude-cli";
pub const API_COMPONENT: &str = "anthropic-api";

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Substrings that mean the upstream is throttling us (matched lowercase).
///
/// Status codes and "overloaded" only count next to an error marker; a bare
/// `429` is just as likely to be part of an answer.
pub const RATE_LIMIT_PHRASES: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "usage limit",
    "limit reached",
    "quota exceeded",
    "insufficient_quota",
    "overloaded_error",
    "api overloaded",
    "api is overloaded",
    "throttled",
    "error 429",
    "http 429",
    "status 429",
    "error 529",
    "http 529",
    "status 529",
];

/// Successful CLI output longer than this is treated as an answer, not a notice
const LIMIT_NOTICE_MAX_LEN: usize = 300;

/// Case-insensitive match against [`RATE_LIMIT_PHRASES`]
pub fn mentions_rate_limit(text: &str) -> bool {
    let lower = text.to_lowercase();
    RATE_LIMIT_PHRASES.iter().any(|p| lower.contains(p))
}

/// Uniform provider result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub text: String,
    pub success: bool,
    pub rate_limited: bool,
    pub error: Option<String>,
    /// Failure kind chosen by the provider
    pub kind: Option<ErrorKind>,
}

impl ProviderResponse {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            rate_limited: kind == ErrorKind::RateLimit,
            error: Some(error.into()),
            kind: Some(kind),
            ..Default::default()
        }
    }

    pub fn rate_limited(error: impl Into<String>) -> Self {
        Self::failed(ErrorKind::RateLimit, error)
    }

    /// Collapse into the gateway's result type
    pub fn into_result(self) -> Result<String, CallError> {
        if self.success {
            return Ok(self.text);
        }
        let kind = if self.rate_limited {
            ErrorKind::RateLimit
        } else {
            self.kind.unwrap_or(ErrorKind::Unknown)
        };
        let message = self
            .error
            .filter(|e| !e.is_empty())
            .unwrap_or(self.text);
        Err(CallError::new(kind, message))
    }
}

/// A compute agent
#[async_trait]
pub trait Provider: Send + Sync {
    /// Component name used for breakers, limiters and stats
    fn name(&self) -> &str;

    async fn invoke(&self, prompt: &str, model: &str, system: &str) -> ProviderResponse;
}

// ---------------------------------------------------------------------------
// Ollama
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

/// Local tier over the Ollama HTTP API
pub struct OllamaProvider {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

/// Map a reqwest transport error to a kind
fn transport_kind(e: &reqwest::Error) -> ErrorKind {
    if e.is_timeout() {
        ErrorKind::Timeout
    } else if e.is_decode() {
        ErrorKind::Parse
    } else if e.is_builder() {
        ErrorKind::Configuration
    } else {
        ErrorKind::Connectivity
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        OLLAMA_COMPONENT
    }

    async fn invoke(&self, prompt: &str, model: &str, system: &str) -> ProviderResponse {
        let url = format!("{}/api/generate", self.base_url);
        debug!("Calling Ollama: model={}, prompt_len={}", model, prompt.len());

        let mut body = serde_json::json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": 0.1,
            }
        });
        if !system.is_empty() {
            body["system"] = serde_json::Value::String(system.to_string());
        }

        let response = match self.client.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => return ProviderResponse::failed(transport_kind(&e), format!("Ollama request failed: {}", e)),
        };

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return ProviderResponse::failed(
                ErrorKind::from_status(status.as_u16()),
                format!("Ollama error {}: {}", status, text),
            );
        }

        match response.json::<OllamaGenerateResponse>().await {
            Ok(result) => ProviderResponse::ok(result.response.trim()),
            Err(e) => ProviderResponse::failed(ErrorKind::Parse, format!("Failed to parse Ollama response: {}", e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Claude CLI
// ---------------------------------------------------------------------------

/// Cost-free cloud path through the locally authenticated CLI
pub struct ClaudeCliProvider {
    binary: String,
}

impl ClaudeCliProvider {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    fn command(&self, prompt: &str, model: &str, system: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-p").arg(prompt).arg("--model").arg(model);
        if !system.is_empty() {
            cmd.arg("--append-system-prompt").arg(system);
        }
        cmd.arg("--output-format")
            .arg("text")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The gateway deadline drops this future; take the child with it
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Provider for ClaudeCliProvider {
    fn name(&self) -> &str {
        CLI_COMPONENT
    }

    async fn invoke(&self, prompt: &str, model: &str, system: &str) -> ProviderResponse {
        debug!("Spawning {} for model={}", self.binary, model);

        let output = match self.command(prompt, model, system).output().await {
            Ok(o) => o,
            Err(e) => {
                return ProviderResponse::failed(
                    ErrorKind::ProcessLaunch,
                    format!("Failed to spawn {}: {}", self.binary, e),
                )
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            let detail = if stderr.is_empty() { &stdout } else { &stderr };
            let message = format!("{} exited with {}: {}", self.binary, output.status, detail);
            return if mentions_rate_limit(&stdout) || mentions_rate_limit(&stderr) {
                warn!("CLI provider reports rate limiting: {}", detail);
                ProviderResponse::rate_limited(message)
            } else {
                ProviderResponse::failed(ErrorKind::Unknown, message)
            };
        }

        // A short limit notice can come back with exit code 0
        if stdout.len() <= LIMIT_NOTICE_MAX_LEN && mentions_rate_limit(&stdout) {
            warn!("CLI provider returned a limit notice: {}", stdout);
            return ProviderResponse::rate_limited(stdout);
        }

        if stdout.is_empty() {
            return ProviderResponse::failed(ErrorKind::Parse, format!("{} returned no output", self.binary));
        }

        ProviderResponse::ok(stdout)
    }
}

// ---------------------------------------------------------------------------
// Anthropic Messages API
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    r#type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: usize,
    output_tokens: usize,
}

/// Paid cloud path over the Anthropic Messages API
pub struct AnthropicApiProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    max_tokens: usize,
}

impl AnthropicApiProvider {
    pub fn new(api_key: Option<&str>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.map(|s| s.to_string()),
            max_tokens: 4096,
        }
    }

    pub fn is_available(&self) -> bool {
        self.api_key.is_some()
    }
}

#[async_trait]
impl Provider for AnthropicApiProvider {
    fn name(&self) -> &str {
        API_COMPONENT
    }

    async fn invoke(&self, prompt: &str, model: &str, system: &str) -> ProviderResponse {
        let Some(api_key) = self.api_key.as_deref() else {
            return ProviderResponse::failed(
                ErrorKind::Configuration,
                "ANTHROPIC_API_KEY not set - direct API tier unavailable",
            );
        };

        let request = MessageRequest {
            model,
            max_tokens: self.max_tokens,
            system,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };

        debug!("Calling Claude API: model={}, prompt_len={}", model, prompt.len());

        let response = match self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return ProviderResponse::failed(transport_kind(&e), format!("Claude API request failed: {}", e)),
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let kind = match status.as_u16() {
                529 => ErrorKind::RateLimit,
                code => ErrorKind::from_status(code),
            };
            return ProviderResponse::failed(kind, format!("Claude API error {}: {}", status, text));
        }

        let result: MessageResponse = match response.json().await {
            Ok(r) => r,
            Err(e) => return ProviderResponse::failed(ErrorKind::Parse, format!("Failed to parse Claude API response: {}", e)),
        };

        let content = result
            .content
            .into_iter()
            .filter_map(|b| if b.r#type == "text" { b.text } else { None })
            .collect::<Vec<_>>()
            .join("\n");

        info!(
            "Claude API response: model={}, in={}, out={}",
            model, result.usage.input_tokens, result.usage.output_tokens
        );

        ProviderResponse::ok(content)
    }
}
