use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub bundle: BundleConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkflowConfig {
    /// Directory holding one checkpoint file per workflow id.
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    /// Items analyzed per chunk. Bundles within a chunk are fetched
    /// concurrently; analysis stays sequential.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Tag attached to every generated analysis note, alongside the
    /// provider's display name.
    #[serde(default = "default_analysis_tag")]
    pub analysis_tag: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: default_checkpoint_dir(),
            chunk_size: default_chunk_size(),
            analysis_tag: default_analysis_tag(),
        }
    }
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}
fn default_chunk_size() -> usize {
    5
}
fn default_analysis_tag() -> String {
    "ai-analysis".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BundleConfig {
    /// Maximum bundle fetches in flight at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_max_concurrency() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    /// Default page size when paginating a collection.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Tag marking items that have already been through analysis; tagged
    /// items are never candidates.
    #[serde(default = "default_completion_tag")]
    pub completion_tag: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            completion_tag: default_completion_tag(),
        }
    }
}

fn default_page_size() -> usize {
    50
}
fn default_completion_tag() -> String {
    "analyzed".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// Default provider when a call does not name one.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Default prompt template name.
    #[serde(default)]
    pub template: Option<String>,
    /// Per-call timeout for the analyze operation.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: None,
            model: None,
            template: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    120
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate workflow
    if config.workflow.chunk_size == 0 {
        anyhow::bail!("workflow.chunk_size must be > 0");
    }

    // Validate bundle
    if config.bundle.max_concurrency == 0 {
        anyhow::bail!("bundle.max_concurrency must be > 0");
    }

    // Validate retry
    if config.retry.base_delay_ms == 0 {
        anyhow::bail!("retry.base_delay_ms must be > 0");
    }
    if config.retry.max_delay_ms < config.retry.base_delay_ms {
        anyhow::bail!("retry.max_delay_ms must be >= retry.base_delay_ms");
    }

    // Validate scan
    if config.scan.page_size == 0 {
        anyhow::bail!("scan.page_size must be > 0");
    }
    if config.scan.completion_tag.trim().is_empty() {
        anyhow::bail!("scan.completion_tag must not be empty");
    }

    if config.llm.timeout_secs == 0 {
        anyhow::bail!("llm.timeout_secs must be > 0");
    }

    Ok(config)
}
