use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root under which each request gets its own staging directory.
    /// Supports ${ENV_VAR} substitution
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,
    /// Keep the persisted source of computations that fail to load
    #[serde(default = "default_retain_failed_sources")]
    pub retain_failed_sources: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Name of the function extracted from a computation
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,
    /// Refuse eval/exec/compile/__import__ at validation time
    #[serde(default)]
    pub reject_dynamic_eval: bool,
    /// Unset means no limit
    #[serde(default)]
    pub max_source_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./data/computations")
}

fn default_retain_failed_sources() -> bool {
    true
}

fn default_entry_point() -> String {
    "computation".to_string()
}

fn default_max_call_depth() -> usize {
    64
}

fn default_max_concurrent() -> usize {
    4
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
            retain_failed_sources: default_retain_failed_sources(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            entry_point: default_entry_point(),
            max_call_depth: default_max_call_depth(),
            reject_dynamic_eval: false,
            max_source_bytes: None,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &str) -> anyhow::Result<Self> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${ZKSTATS_DATA}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        if config.sandbox.entry_point.is_empty() {
            anyhow::bail!("sandbox.entry_point must not be empty");
        }
        Ok(config)
    }
}
