//! Configuration loading and validation for codeloop.
//!
//! A single TOML document describes the completion backend, the agent loop's
//! budgets, the planning cadence, and the output batcher's throughput bands.
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration.

use codeloop_core::Language;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Completion backend settings
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Model identifier sent with every completion request
    #[serde(default = "default_model")]
    pub model: String,

    /// Sampling temperature for the main loop
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Max tokens per main-loop completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Stream completions through the adaptive batcher
    #[serde(default = "default_true")]
    pub stream: bool,

    /// Agent loop budgets and prompt settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Planning sub-loop settings
    #[serde(default)]
    pub planning: PlanningConfig,

    /// Adaptive output batching
    #[serde(default)]
    pub batching: BatchingConfig,
}

fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_true() -> bool {
    true
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("stream", &self.stream)
            .field("agent", &self.agent)
            .field("planning", &self.planning)
            .field("batching", &self.batching)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Display name used in logs ("openai", "ollama", ...)
    #[serde(default = "default_provider_name")]
    pub name: String,

    /// Base URL of an OpenAI-compatible API
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// HTTP request timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_provider_name() -> String {
    "openai".into()
}
fn default_api_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_request_timeout() -> u64 {
    120
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            api_url: default_api_url(),
            api_key: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("api_url", &self.api_url)
            .field("api_key", &redact(&self.api_key))
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Base instructions placed at the top of the system prompt
    #[serde(default = "default_instructions")]
    pub instructions: String,

    /// Directive-producing iterations allowed before forced finalization
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Corrective retries allowed without a usable directive
    #[serde(default = "default_guidance_ceiling")]
    pub guidance_ceiling: u32,

    /// Language the kernel runs and the prompt teaches
    #[serde(default)]
    pub execution_language: Language,

    /// Language assumed for an undecorated `<script>` directive
    #[serde(default)]
    pub fallback_language: Language,

    /// Include illustrative example exchanges when an executor is attached
    #[serde(default = "default_true")]
    pub include_examples: bool,

    /// Age after which unconsumed side-channel entries and uncommitted
    /// execution records are swept
    #[serde(default = "default_side_channel_ttl")]
    pub side_channel_ttl_secs: u64,

    /// Period of the background sweep
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_instructions() -> String {
    "You are a capable assistant that solves tasks step by step, writing and running code when it helps."
        .into()
}
fn default_max_steps() -> u32 {
    10
}
fn default_guidance_ceiling() -> u32 {
    3
}
fn default_side_channel_ttl() -> u64 {
    3600
}
fn default_sweep_interval() -> u64 {
    300
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            instructions: default_instructions(),
            max_steps: default_max_steps(),
            guidance_ceiling: default_guidance_ceiling(),
            execution_language: Language::default(),
            fallback_language: Language::default(),
            include_examples: true,
            side_channel_ttl_secs: default_side_channel_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl AgentConfig {
    pub fn side_channel_ttl(&self) -> Duration {
        Duration::from_secs(self.side_channel_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Re-plan every N consumed steps (1 = every step)
    #[serde(default = "default_planning_interval")]
    pub interval: u32,

    #[serde(default = "default_planning_temperature")]
    pub temperature: f32,

    /// Max tokens for each of the two planning calls
    #[serde(default = "default_planning_max_tokens")]
    pub max_tokens: u32,

    /// Attempts per planning call (1 = no retry)
    #[serde(default = "default_planning_attempts")]
    pub max_retries: u32,

    /// Pause between planning attempts
    #[serde(default)]
    pub retry_wait_ms: u64,

    /// Marker the plan is truncated at
    #[serde(default = "default_end_marker")]
    pub end_marker: String,
}

fn default_planning_interval() -> u32 {
    3
}
fn default_planning_temperature() -> f32 {
    0.3
}
fn default_planning_max_tokens() -> u32 {
    1024
}
fn default_planning_attempts() -> u32 {
    1
}
fn default_end_marker() -> String {
    "<end_plan>".into()
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_planning_interval(),
            temperature: default_planning_temperature(),
            max_tokens: default_planning_max_tokens(),
            max_retries: default_planning_attempts(),
            retry_wait_ms: 0,
            end_marker: default_end_marker(),
        }
    }
}

/// Adaptive output batching parameters.
///
/// `bands` are checked in order; the first band whose `min_cps` the smoothed
/// throughput exceeds wins, and the last band is the floor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Weight of the newest throughput sample in the moving average
    #[serde(default = "default_smoothing")]
    pub smoothing: f64,

    #[serde(default = "default_bands")]
    pub bands: Vec<ThroughputBand>,

    /// Minimum interval change (ms) before new parameters are adopted
    #[serde(default = "default_hysteresis_ms")]
    pub hysteresis_ms: u64,

    /// Minimum batch-size change (chars) before new parameters are adopted
    #[serde(default = "default_hysteresis_chars")]
    pub hysteresis_chars: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputBand {
    /// Characters per second this band applies above
    pub min_cps: f64,
    pub interval_ms: u64,
    pub max_chars: usize,
}

impl ThroughputBand {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_smoothing() -> f64 {
    0.3
}
fn default_bands() -> Vec<ThroughputBand> {
    vec![
        ThroughputBand {
            min_cps: 1000.0,
            interval_ms: 50,
            max_chars: 150,
        },
        ThroughputBand {
            min_cps: 200.0,
            interval_ms: 100,
            max_chars: 300,
        },
        ThroughputBand {
            min_cps: 50.0,
            interval_ms: 200,
            max_chars: 500,
        },
        ThroughputBand {
            min_cps: 0.0,
            interval_ms: 300,
            max_chars: 800,
        },
    ]
}
fn default_hysteresis_ms() -> u64 {
    20
}
fn default_hysteresis_chars() -> usize {
    50
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            smoothing: default_smoothing(),
            bands: default_bands(),
            hysteresis_ms: default_hysteresis_ms(),
            hysteresis_chars: default_hysteresis_chars(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a specific file path.
    ///
    /// A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::ParseError { reason, .. } => ConfigError::ParseError {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.agent.max_steps == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_steps must be at least 1".into(),
            ));
        }

        if self.planning.enabled && self.planning.interval == 0 {
            return Err(ConfigError::ValidationError(
                "planning.interval must be at least 1 when planning is enabled".into(),
            ));
        }

        if self.planning.max_retries == 0 {
            return Err(ConfigError::ValidationError(
                "planning.max_retries must be at least 1".into(),
            ));
        }

        let batching = &self.batching;
        if !(batching.smoothing > 0.0 && batching.smoothing <= 1.0) {
            return Err(ConfigError::ValidationError(
                "batching.smoothing must be in (0.0, 1.0]".into(),
            ));
        }

        if batching.bands.is_empty() {
            return Err(ConfigError::ValidationError(
                "batching.bands must not be empty".into(),
            ));
        }

        if batching
            .bands
            .windows(2)
            .any(|pair| pair[0].min_cps <= pair[1].min_cps)
        {
            return Err(ConfigError::ValidationError(
                "batching.bands must be ordered by descending min_cps".into(),
            ));
        }

        if batching
            .bands
            .iter()
            .any(|b| b.interval_ms == 0 || b.max_chars == 0)
        {
            return Err(ConfigError::ValidationError(
                "batching bands need a non-zero interval and batch size".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: None,
            stream: true,
            agent: AgentConfig::default(),
            planning: PlanningConfig::default(),
            batching: BatchingConfig::default(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for codeloop_core::Error {
    fn from(e: ConfigError) -> Self {
        codeloop_core::Error::Config {
            message: e.to_string(),
        }
    }
}
