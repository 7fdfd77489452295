//! Runtime configuration for airlock.
//!
//! Configuration is loaded from a JSON file and then overridden by CLI flags.
//! Every hardware-dependent knob (context window, output cap, temperature,
//! model directory) lives here rather than in code.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "airlock", about = "Offline local-model chat orchestrator")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "airlock.json")]
    pub config: PathBuf,

    /// Directory scanned for model files.
    #[arg(long)]
    pub models_dir: Option<PathBuf>,

    /// Context window size in tokens.
    #[arg(long)]
    pub context_size: Option<u32>,

    /// Maximum tokens generated per turn.
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Sampling temperature.
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Wall-clock limit for one generation in seconds (0 = unbounded).
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Scan the model directory and print the catalog as JSON.
    Models,

    /// Generate one reply and print it.
    Generate {
        /// Model id, file name, or display name.
        #[arg(short, long)]
        model: String,

        /// User message to answer.
        #[arg(short, long)]
        prompt: String,

        /// JSON file holding prior turns (array of chat turns).
        #[arg(long)]
        transcript: Option<PathBuf>,

        /// Files to attach to the message.
        #[arg(short, long = "attach")]
        attachments: Vec<PathBuf>,

        /// System instruction overriding the configured one.
        #[arg(long)]
        system: Option<String>,
    },

    /// Serve newline-delimited JSON requests on stdin/stdout.
    Bridge,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model directory scanning.
    pub catalog: CatalogConfig,

    /// Native engine sizing.
    pub engine: EngineConfig,

    /// Sampling and output limits.
    pub generation: GenerationConfig,

    /// Prompt construction and history policy.
    pub prompt: PromptConfig,

    /// Request admission.
    pub scheduler: SchedulerConfig,
}

/// Model catalog settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Directory holding model artifacts. Created on first scan if missing.
    pub models_dir: PathBuf,

    /// Recognized artifact extension, without the dot.
    pub extension: String,

    /// Read the GGUF header for quantization metadata during scans.
    pub inspect_headers: bool,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            extension: "gguf".to_string(),
            inspect_headers: true,
        }
    }
}

/// Engine sizing (mirrors the native model/context parameters).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Context size in tokens.
    pub context_size: u32,

    /// Number of GPU layers to offload (-1 = all, 0 = CPU only).
    pub n_gpu_layers: i32,

    /// Batch size for prompt processing.
    pub batch_size: u32,

    /// Compute threads (0 = let the runtime decide).
    pub threads: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            context_size: 4096,
            n_gpu_layers: 0,
            batch_size: 512,
            threads: 0,
        }
    }
}

/// Generation limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum tokens to generate per turn.
    pub max_tokens: u32,

    /// Sampling temperature (0.0 = greedy).
    pub temperature: f32,

    /// Top-p (nucleus) sampling threshold.
    pub top_p: f32,

    /// Sampler seed.
    pub seed: u32,

    /// Wall-clock limit for one generation in seconds (0 = unbounded).
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.7,
            top_p: 0.9,
            seed: 1234,
            timeout_secs: 300,
        }
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// How prior turns reach the engine session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryMode {
    /// Keep the session across turns and feed only what it has not seen.
    Replay,
    /// Start every turn from an empty session.
    SingleShot,
}

/// Prompt construction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Preamble used when a request carries no system instruction.
    pub system_prompt: String,

    /// Marker separating attached files from the user's instruction.
    pub task_marker: String,

    pub history: HistoryMode,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are Airlock, a local AI assistant. All processing happens \
                            offline on this machine. Answer concisely and treat attached \
                            files as reference material."
                .to_string(),
            task_marker: "Task:".to_string(),
            history: HistoryMode::Replay,
        }
    }
}

/// What happens to a request that arrives while the engine is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    /// Wait in FIFO order for the engine.
    Queue,
    /// Fail immediately with a busy error.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub admission: Admission,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            admission: Admission::Queue,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply CLI overrides on top of file values.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(dir) = &cli.models_dir {
            self.catalog.models_dir = dir.clone();
        }
        if let Some(n) = cli.context_size {
            self.engine.context_size = n;
        }
        if let Some(n) = cli.max_tokens {
            self.generation.max_tokens = n;
        }
        if let Some(t) = cli.temperature {
            self.generation.temperature = t;
        }
        if let Some(secs) = cli.timeout_secs {
            self.generation.timeout_secs = secs;
        }
    }

    /// Reject combinations the engine cannot honour.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.engine.context_size == 0 {
            anyhow::bail!("engine.context_size must be greater than zero");
        }
        if self.generation.max_tokens == 0 {
            anyhow::bail!("generation.max_tokens must be greater than zero");
        }
        if self.generation.max_tokens >= self.engine.context_size {
            anyhow::bail!(
                "generation.max_tokens ({}) must be smaller than engine.context_size ({})",
                self.generation.max_tokens,
                self.engine.context_size
            );
        }
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            anyhow::bail!(
                "generation.temperature must be within 0.0..=2.0, got {}",
                self.generation.temperature
            );
        }
        if !(0.0..=1.0).contains(&self.generation.top_p) {
            anyhow::bail!("generation.top_p must be within 0.0..=1.0");
        }
        if self.catalog.extension.trim_start_matches('.').is_empty() {
            anyhow::bail!("catalog.extension must not be empty");
        }
        Ok(())
    }
}
