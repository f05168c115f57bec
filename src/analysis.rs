//! Analysis backend abstraction and implementations.
//!
//! An [`AnalysisBackend`] turns one rendered chunk into free-form text. The
//! text is interpreted later by
//! [`extract`](config_advisor_core::extract::extract); backends know nothing
//! about proposals.
//!
//! - **[`DisabledBackend`]** always errors; used when no backend is configured.
//! - **[`OpenAiBackend`]** calls any OpenAI-compatible `/chat/completions`
//!   endpoint, with retry and backoff.
//! - **[`ReplayBackend`]** serves canned answers from a directory, for offline
//!   runs and tests.
//!
//! # Retry Strategy
//!
//! The OpenAI backend retries transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

use config_advisor_core::extract::RESPONSE_DIRECTIVE;

use crate::config::BackendConfig;

/// One chunk's worth of work for a backend.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub run_id: String,
    pub chunk_index: usize,
    pub chunk_id: String,
    /// Rendered chunk text, see [`build_prompt`].
    pub prompt: String,
}

#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Identifier shown in logs (`"disabled"`, the model name, `"replay"`).
    fn name(&self) -> &str;

    async fn analyze(&self, request: &AnalysisRequest) -> Result<String>;
}

/// What the analysis should look for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisTask {
    Optimization,
    Automation,
}

impl AnalysisTask {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "optimization" => Ok(AnalysisTask::Optimization),
            "automation" => Ok(AnalysisTask::Automation),
            other => bail!("Unknown analysis task: '{}'", other),
        }
    }

    fn focus(&self) -> &'static [&'static str] {
        match self {
            AnalysisTask::Optimization => &[
                "Performance improvements",
                "Code simplification and cleanup",
                "Best practices and conventions",
                "Deprecated or outdated patterns",
                "Redundant or inefficient configurations",
            ],
            AnalysisTask::Automation => &[
                "Lighting automation based on presence or time",
                "Climate control",
                "Security and monitoring",
                "Energy efficiency",
                "Convenience automations using entities that already exist",
            ],
        }
    }

    pub fn system_prompt(&self) -> &'static str {
        match self {
            AnalysisTask::Optimization => {
                "You are an expert Home Assistant configuration analyst. Analyze the YAML \
                 configuration files you are given and suggest specific, actionable edits. \
                 Avoid generic advice. Only reference files and entities that appear in the request."
            }
            AnalysisTask::Automation => {
                "You are an expert Home Assistant automation designer. Suggest practical \
                 automations as edits to the YAML files you are given. Only use entities that \
                 exist in the configuration and follow Home Assistant best practices."
            }
        }
    }
}

/// Append the task focus and response format to a rendered chunk.
pub fn build_prompt(rendered_chunk: &str, task: AnalysisTask) -> String {
    let mut parts = vec![rendered_chunk.trim_end().to_string(), String::new()];
    parts.push("## Analysis Request".to_string());
    parts.push("Focus on:".to_string());
    for (i, item) in task.focus().iter().enumerate() {
        parts.push(format!("{}. {}", i + 1, item));
    }
    parts.push(String::new());
    parts.push(RESPONSE_DIRECTIVE.to_string());
    parts.join("\n")
}

// ============ Disabled Backend ============

/// Backend used when `backend.provider = "disabled"`.
pub struct DisabledBackend;

#[async_trait]
impl AnalysisBackend for DisabledBackend {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn analyze(&self, _request: &AnalysisRequest) -> Result<String> {
        bail!("analysis backend is disabled; set backend.provider in the config")
    }
}

// ============ OpenAI-compatible Backend ============

pub struct OpenAiBackend {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key_env: String,
    api_key: Option<String>,
    max_retries: u32,
    temperature: Option<f32>,
    task: AnalysisTask,
}

impl OpenAiBackend {
    /// The API key is read from `api_key_env` now, but only required once a
    /// request is made, so review commands work without it.
    ///
    /// # Errors
    ///
    /// Fails if `model` is missing.
    pub fn new(config: &BackendConfig, task: AnalysisTask) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("backend.model required for the openai provider"))?;
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model,
            api_key_env: config.api_key_env.clone(),
            api_key,
            max_retries: config.max_retries,
            temperature: config.temperature,
            task,
        })
    }

    fn body(&self, prompt: &str) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": self.task.system_prompt() },
                { "role": "user", "content": prompt },
            ],
        });
        if let Some(t) = self.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        body
    }
}

#[async_trait]
impl AnalysisBackend for OpenAiBackend {
    fn name(&self) -> &str {
        &self.model
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<String> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("{} environment variable not set", self.api_key_env))?;
        let url = format!("{}/chat/completions", self.endpoint);
        let body = self.body(&request.prompt);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::debug!(
                    run_id = %request.run_id,
                    chunk = request.chunk_index,
                    attempt,
                    "retrying analysis request"
                );
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .bearer_auth(api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_chat_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow!("analysis API error {}: {}", status, body_text));
                        continue;
                    }
                    bail!("analysis API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("analysis failed after retries")))
    }
}

/// Extract `choices[0].message.content` from a chat completion.
fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Invalid chat completion response: missing choices[0].message.content"))
}

// ============ Replay Backend ============

/// Serves `chunk-<index>.txt` from a directory, falling back to
/// `default.txt`.
pub struct ReplayBackend {
    dir: PathBuf,
}

impl ReplayBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl AnalysisBackend for ReplayBackend {
    fn name(&self) -> &str {
        "replay"
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<String> {
        let specific = self.dir.join(format!("chunk-{}.txt", request.chunk_index));
        let path = if tokio::fs::try_exists(&specific).await.unwrap_or(false) {
            specific
        } else {
            self.dir.join("default.txt")
        };
        tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("No replay response at {}", path.display()))
    }
}

/// Create the configured [`AnalysisBackend`].
///
/// | Config Value | Backend |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledBackend`] |
/// | `"openai"` | [`OpenAiBackend`] |
/// | `"replay"` | [`ReplayBackend`] |
pub fn create_backend(config: &BackendConfig, task: AnalysisTask) -> Result<Box<dyn AnalysisBackend>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledBackend)),
        "openai" => Ok(Box::new(OpenAiBackend::new(config, task)?)),
        "replay" => {
            let dir = config
                .replay_dir
                .clone()
                .ok_or_else(|| anyhow!("backend.replay_dir required for the replay provider"))?;
            Ok(Box::new(ReplayBackend::new(dir)))
        }
        other => bail!("Unknown backend provider: {}", other),
    }
}
