//! Agent configuration stored under `<state_dir>/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::Backoff;
use crate::core::decision::{FinishPolicy, default_confirmation_phrases};
use crate::core::perception::SnapshotLimits;

/// Environment variable overriding `model.base_url`.
pub const BASE_URL_ENV: &str = "OLLAMA_BASE_URL";

/// Agent configuration (TOML).
///
/// Edited by humans; every field has a default so a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Decide steps per job before it is failed as timed out.
    pub max_iterations: u32,

    /// Sleep between claims while the queue is empty.
    pub idle_poll_secs: u64,

    /// Pause after each action so the page can react.
    pub settle_millis: u64,

    /// Pause after navigating to a job URL.
    pub page_load_wait_millis: u64,

    pub store_backoff_initial_secs: u64,
    pub store_backoff_max_secs: u64,

    /// Retry delays while the model server is unreachable. The claimed job
    /// is held, not failed, until the server answers again.
    pub model_retry_initial_millis: u64,
    pub model_retry_max_millis: u64,

    /// Keep the browser session open after a successful job.
    pub keep_session_after_success: bool,

    /// Write per-iteration artifacts under `<state_dir>/attempts/`.
    pub record_attempts: bool,

    /// Upper bound for a rendered decision prompt.
    pub prompt_budget_bytes: usize,

    pub model: ModelConfig,
    pub browser: BrowserConfig,
    pub perception: PerceptionConfig,
    pub finish: FinishConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub decision_model: String,
    /// Model answering free-form application questions from the profile.
    pub answer_model: String,
    pub vision_model: String,
    pub request_timeout_secs: u64,
    pub vision_enabled: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            decision_model: "qwen2.5:14b".to_string(),
            answer_model: "qwen2.5:14b".to_string(),
            vision_model: "llava:13b".to_string(),
            request_timeout_secs: 120,
            vision_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrowserConfig {
    /// WebDriver server endpoint.
    pub webdriver_url: String,
    /// Optional driver binary to spawn (e.g. `["chromedriver", "--port=9515"]`).
    pub driver_command: Vec<String>,
    pub browser_args: Vec<String>,
    /// `[width, height]` in CSS pixels.
    pub window_size: [u32; 2],
    pub request_timeout_secs: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:9515".to_string(),
            driver_command: Vec::new(),
            browser_args: vec!["--disable-notifications".to_string()],
            window_size: [1280, 1024],
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PerceptionConfig {
    pub max_elements: usize,
    pub text_limit: usize,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        let limits = SnapshotLimits::default();
        Self {
            max_elements: limits.max_elements,
            text_limit: limits.text_limit,
        }
    }
}

impl PerceptionConfig {
    pub fn limits(&self) -> SnapshotLimits {
        SnapshotLimits {
            max_elements: self.max_elements,
            text_limit: self.text_limit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FinishConfig {
    /// Reject a Final Answer that quotes no confirmation phrase.
    pub require_confirmation: bool,
    pub phrases: Vec<String>,
}

impl Default for FinishConfig {
    fn default() -> Self {
        Self {
            require_confirmation: true,
            phrases: default_confirmation_phrases(),
        }
    }
}

impl FinishConfig {
    pub fn policy(&self) -> FinishPolicy {
        FinishPolicy {
            require_confirmation: self.require_confirmation,
            phrases: self.phrases.clone(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            idle_poll_secs: 5,
            settle_millis: 1500,
            page_load_wait_millis: 3000,
            store_backoff_initial_secs: 2,
            store_backoff_max_secs: 60,
            model_retry_initial_millis: 2_000,
            model_retry_max_millis: 60_000,
            keep_session_after_success: true,
            record_attempts: true,
            prompt_budget_bytes: 24_000,
            model: ModelConfig::default(),
            browser: BrowserConfig::default(),
            perception: PerceptionConfig::default(),
            finish: FinishConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.idle_poll_secs == 0 {
            return Err(anyhow!("idle_poll_secs must be > 0"));
        }
        if self.store_backoff_initial_secs == 0 {
            return Err(anyhow!("store_backoff_initial_secs must be > 0"));
        }
        if self.store_backoff_max_secs < self.store_backoff_initial_secs {
            return Err(anyhow!(
                "store_backoff_max_secs must be >= store_backoff_initial_secs"
            ));
        }
        if self.model_retry_initial_millis == 0 {
            return Err(anyhow!("model_retry_initial_millis must be > 0"));
        }
        if self.model_retry_max_millis < self.model_retry_initial_millis {
            return Err(anyhow!(
                "model_retry_max_millis must be >= model_retry_initial_millis"
            ));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.model.base_url.trim().is_empty() {
            return Err(anyhow!("model.base_url must be non-empty"));
        }
        if self.model.decision_model.trim().is_empty() {
            return Err(anyhow!("model.decision_model must be non-empty"));
        }
        if self.model.request_timeout_secs == 0 {
            return Err(anyhow!("model.request_timeout_secs must be > 0"));
        }
        if self.browser.webdriver_url.trim().is_empty() {
            return Err(anyhow!("browser.webdriver_url must be non-empty"));
        }
        if self.browser.request_timeout_secs == 0 {
            return Err(anyhow!("browser.request_timeout_secs must be > 0"));
        }
        if self.browser.window_size.contains(&0) {
            return Err(anyhow!("browser.window_size must be positive"));
        }
        if self.perception.max_elements == 0 || self.perception.text_limit == 0 {
            return Err(anyhow!(
                "perception.max_elements and perception.text_limit must be > 0"
            ));
        }
        if self.finish.require_confirmation
            && self.finish.phrases.iter().all(|p| p.trim().is_empty())
        {
            return Err(anyhow!(
                "finish.phrases must be non-empty when finish.require_confirmation is set"
            ));
        }
        Ok(())
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_secs(self.idle_poll_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_millis)
    }

    pub fn page_load_wait(&self) -> Duration {
        Duration::from_millis(self.page_load_wait_millis)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model.request_timeout_secs)
    }

    pub fn model_retry_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.model_retry_initial_millis),
            Duration::from_millis(self.model_retry_max_millis),
        )
    }

    fn apply_env(&mut self, base_url: Option<String>) {
        if let Some(url) = base_url.filter(|u| !u.trim().is_empty()) {
            self.model.base_url = url.trim().to_string();
        }
    }
}

/// Load config from a TOML file, then apply environment overrides.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    let mut cfg = read_config(path)?;
    cfg.apply_env(std::env::var(BASE_URL_ENV).ok());
    cfg.validate()?;
    Ok(cfg)
}

fn read_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        return Ok(AgentConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
