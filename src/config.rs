//! Configuration parsing and validation.
//!
//! Config Advisor is configured with a single TOML file (default
//! `./config/advisor.toml`). Every section except `[db]` and `[documents]`
//! has defaults, so a minimal file only names the database and the
//! configuration directory to analyze.
//!
//! ```toml
//! [db]
//! path = "./data/advisor.sqlite"
//!
//! [documents]
//! root = "/config"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config_advisor_core::chunk::SizeBudget;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub documents: DocumentsConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocumentsConfig {
    /// Directory holding the YAML configuration to analyze.
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Where pre-apply backups are written. Excluded from scans when it
    /// lives under `root`.
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.yaml".to_string(), "**/*.yml".to_string()]
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("./data/backups")
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_reserve_fraction")]
    pub reserve_fraction: f64,
    /// Chunks analyzed at the same time within one run.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
    /// `optimization` or `automation`.
    #[serde(default = "default_task")]
    pub task: String,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            reserve_fraction: default_reserve_fraction(),
            concurrency: default_concurrency(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
            task: default_task(),
        }
    }
}

impl AnalysisConfig {
    pub fn budget(&self) -> SizeBudget {
        SizeBudget::new(self.max_tokens).with_reserve(self.reserve_fraction)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }
}

fn default_max_tokens() -> usize {
    4000
}
fn default_reserve_fraction() -> f64 {
    0.2
}
fn default_concurrency() -> usize {
    3
}
fn default_chunk_timeout_secs() -> u64 {
    60
}
fn default_task() -> String {
    "optimization".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// `disabled`, `openai`, or `replay`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL of an OpenAI-compatible API.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Directory of canned responses for the `replay` provider.
    #[serde(default)]
    pub replay_dir: Option<PathBuf>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            endpoint: default_endpoint(),
            api_key_env: default_api_key_env(),
            max_retries: default_max_retries(),
            timeout_secs: default_request_timeout_secs(),
            temperature: None,
            replay_dir: None,
        }
    }
}

impl BackendConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_request_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let analysis = &config.analysis;
    if analysis.max_tokens == 0 {
        bail!("analysis.max_tokens must be > 0");
    }
    if !(0.0..1.0).contains(&analysis.reserve_fraction) {
        bail!("analysis.reserve_fraction must be in [0.0, 1.0)");
    }
    if !(1..=16).contains(&analysis.concurrency) {
        bail!("analysis.concurrency must be between 1 and 16");
    }
    if analysis.chunk_timeout_secs == 0 {
        bail!("analysis.chunk_timeout_secs must be > 0");
    }
    match analysis.task.as_str() {
        "optimization" | "automation" => {}
        other => bail!(
            "Unknown analysis task: '{}'. Must be optimization or automation.",
            other
        ),
    }

    if config.documents.include_globs.is_empty() {
        bail!("documents.include_globs must not be empty");
    }

    let backend = &config.backend;
    match backend.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if backend.model.as_deref().map_or(true, str::is_empty) {
                bail!("backend.model must be specified when provider is 'openai'");
            }
        }
        "replay" => {
            if backend.replay_dir.is_none() {
                bail!("backend.replay_dir must be specified when provider is 'replay'");
            }
        }
        other => bail!(
            "Unknown backend provider: '{}'. Must be disabled, openai, or replay.",
            other
        ),
    }

    if config.logging.level.trim().is_empty() {
        bail!("logging.level must not be empty");
    }

    Ok(())
}
