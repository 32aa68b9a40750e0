use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{QaError, Result};

/// Config path used when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "config/mrqa.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub runs: RunsConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub templates: TemplatesConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    #[serde(default = "default_corpus_root")]
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            root: default_corpus_root(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_corpus_root() -> PathBuf {
    PathBuf::from("data/要綱")
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.txt".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_model_url")]
    pub url: String,
    #[serde(default = "default_model_name")]
    pub name: String,
    /// Model for the reduce stage. Falls back to `name`.
    #[serde(default)]
    pub aggregate_name: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_num_ctx")]
    pub num_ctx: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            url: default_model_url(),
            name: default_model_name(),
            aggregate_name: None,
            temperature: default_temperature(),
            top_p: default_top_p(),
            repeat_penalty: default_repeat_penalty(),
            max_tokens: default_max_tokens(),
            num_ctx: default_num_ctx(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl ModelConfig {
    pub fn aggregate_model(&self) -> &str {
        self.aggregate_name.as_deref().unwrap_or(&self.name)
    }
}

fn default_model_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_model_name() -> String {
    "gpt-oss:20b".to_string()
}
fn default_temperature() -> f32 {
    0.4
}
fn default_top_p() -> f32 {
    0.9
}
fn default_repeat_penalty() -> f32 {
    1.1
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_num_ctx() -> u32 {
    131_072
}
fn default_timeout_secs() -> u64 {
    600
}
fn default_max_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunsConfig {
    #[serde(default = "default_runs_dir")]
    pub dir: PathBuf,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            dir: default_runs_dir(),
        }
    }
}

fn default_runs_dir() -> PathBuf {
    PathBuf::from("run")
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
        }
    }
}

fn default_parallelism() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct TemplatesConfig {
    /// Optional override directory with `single/` and `aggregate/` subdirectories.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_single_template")]
    pub single_default: String,
    #[serde(default = "default_aggregate_template")]
    pub aggregate_default: String,
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            dir: None,
            single_default: default_single_template(),
            aggregate_default: default_aggregate_template(),
        }
    }
}

fn default_single_template() -> String {
    "baseline".to_string()
}
fn default_aggregate_template() -> String {
    "consensus".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_min_answer_chars")]
    pub min_answer_chars: usize,
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            min_answer_chars: default_min_answer_chars(),
            history_turns: default_history_turns(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_min_answer_chars() -> usize {
    10
}
fn default_history_turns() -> usize {
    5
}

impl Config {
    /// Apply `OLLAMA_*` overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("OLLAMA_HOST").filter(|v| !v.is_empty()) {
            self.model.url = if host.starts_with("http://") || host.starts_with("https://") {
                host
            } else {
                format!("http://{}", host)
            };
        }
        if let Some(model) = lookup("OLLAMA_MODEL").filter(|v| !v.is_empty()) {
            self.model.name = model;
        }
        if let Some(v) = lookup("OLLAMA_NUM_CTX") {
            self.model.num_ctx = v
                .trim()
                .parse()
                .map_err(|_| QaError::config(format!("OLLAMA_NUM_CTX is not a number: {}", v)))?;
        }
        if let Some(v) = lookup("OLLAMA_NUM_PREDICT") {
            self.model.max_tokens = v.trim().parse().map_err(|_| {
                QaError::config(format!("OLLAMA_NUM_PREDICT is not a number: {}", v))
            })?;
        }
        Ok(())
    }

    /// Apply `--model`, `--num-ctx` and `--num-predict` from the command
    /// line. These win over both the file and the environment.
    pub fn apply_model_overrides(
        &mut self,
        model: Option<String>,
        num_ctx: Option<u32>,
        num_predict: Option<u32>,
    ) -> Result<()> {
        if let Some(model) = model.filter(|m| !m.trim().is_empty()) {
            self.model.name = model;
        }
        if let Some(num_ctx) = num_ctx {
            self.model.num_ctx = num_ctx;
        }
        if let Some(num_predict) = num_predict {
            self.model.max_tokens = num_predict;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.dispatch.parallelism == 0 {
            return Err(QaError::config("dispatch.parallelism must be >= 1"));
        }
        if self.model.max_tokens == 0 {
            return Err(QaError::config("model.max_tokens must be > 0"));
        }
        if self.model.timeout_secs == 0 {
            return Err(QaError::config("model.timeout_secs must be > 0"));
        }
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(QaError::config("model.temperature must be in [0.0, 2.0]"));
        }
        if self.model.url.trim().is_empty() {
            return Err(QaError::config("model.url must not be empty"));
        }
        if self.worker.max_attempts == 0 {
            return Err(QaError::config("worker.max_attempts must be >= 1"));
        }
        if self.corpus.include_globs.is_empty() {
            return Err(QaError::config("corpus.include_globs must not be empty"));
        }
        Ok(())
    }
}

/// Parse and validate a config file. Environment overrides are not applied.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        QaError::config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;

    let config: Config = toml::from_str(&content).map_err(|e| {
        QaError::config(format!(
            "Failed to parse config file {}: {}",
            path.display(),
            e
        ))
    })?;

    config.validate()?;
    Ok(config)
}

/// Resolve the effective config for the CLI.
///
/// An explicit path must exist. Without one, `config/mrqa.toml` is used if
/// present and built-in defaults otherwise. Environment overrides are
/// applied last and the result validated again.
pub fn resolve_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = match explicit {
        Some(path) => load_config(path)?,
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                load_config(default)?
            } else {
                tracing::debug!("no config file at {}, using defaults", default.display());
                Config::default()
            }
        }
    };
    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}
