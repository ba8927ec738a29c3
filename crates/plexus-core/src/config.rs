use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PlexusError, Result};

/// Top-level configuration (`plexus.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub servers: ServersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite ledger file.
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Root directory for artifacts; each run gets a subdirectory.
    #[serde(default = "default_artifacts_path")]
    pub artifacts_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            artifacts_path: default_artifacts_path(),
        }
    }
}

fn default_database_path() -> String { "./plexus.db".to_string() }
fn default_artifacts_path() -> String { "./artifacts".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_node_timeout_secs")]
    pub node_timeout_secs: u64,
    /// Node whose output becomes the run result.
    #[serde(default = "default_terminal_node")]
    pub terminal_node: String,
    #[serde(default)]
    pub cache_scope: CacheScope,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            node_timeout_secs: default_node_timeout_secs(),
            terminal_node: default_terminal_node(),
            cache_scope: CacheScope::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }
}

fn default_node_timeout_secs() -> u64 { 30 }
fn default_terminal_node() -> String { "reduce".to_string() }

/// Where idempotency keys may be reused from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheScope {
    /// Keys are computed and recorded but never consulted.
    #[default]
    Off,
    /// Reuse only within the same run.
    Run,
    /// Reuse across all runs in the ledger.
    Global,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Direct,
    Stdio,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub mode: TransportMode,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_manifest_timeout_secs")]
    pub manifest_timeout_secs: u64,
    /// Per-server overrides for how a stdio worker is spawned.
    #[serde(default)]
    pub workers: HashMap<String, WorkerConfig>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::default(),
            call_timeout_secs: default_call_timeout_secs(),
            manifest_timeout_secs: default_manifest_timeout_secs(),
            workers: HashMap::new(),
        }
    }
}

impl TransportConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn manifest_timeout(&self) -> Duration {
        Duration::from_secs(self.manifest_timeout_secs)
    }
}

fn default_call_timeout_secs() -> u64 { 30 }
fn default_manifest_timeout_secs() -> u64 { 5 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Settings for the built-in servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServersConfig {
    /// Root that relative `file.read` paths resolve against.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// JSON file holding tracking records.
    #[serde(default = "default_tracking_path")]
    pub tracking_path: String,
    /// Default CSV for `table.query` when no `source` arg is given.
    #[serde(default)]
    pub table_path: Option<String>,
}

impl Default for ServersConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            tracking_path: default_tracking_path(),
            table_path: None,
        }
    }
}

fn default_data_dir() -> String { "./data".to_string() }
fn default_tracking_path() -> String { "./data/tracking.json".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| PlexusError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| PlexusError::Config(e.to_string()))
    }

    /// Like [`AppConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.storage.database_path)
    }

    pub fn artifacts_path(&self) -> PathBuf {
        expand_home(&self.storage.artifacts_path)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' || chars.peek() != Some(&'{') {
            result.push(c);
            continue;
        }
        chars.next();
        let name: String = chars.by_ref().take_while(|&c| c != '}').collect();
        match std::env::var(&name) {
            Ok(val) => result.push_str(&val),
            // Unset variables are left as written
            Err(_) => {
                result.push_str("${");
                result.push_str(&name);
                result.push('}');
            }
        }
    }
    result
}
