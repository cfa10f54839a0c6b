//! Configuration loading with multi-layer merge

use super::{GraphDefinition, ProviderConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Retry and timeout defaults for every step
    #[serde(default)]
    pub defaults: Defaults,

    /// Which snapshots go into trace entries
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Run store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// AI providers for ai-prompt nodes
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

/// Global step defaults
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    /// Attempts per step, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Multiplier for exponential backoff
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Upper bound for a single retry delay, in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Per-attempt timeout, in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Add up to 25% jitter to retry delays
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    1000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_timeout() -> u64 {
    300_000 // 5 minutes
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay(),
            timeout_ms: default_timeout(),
            jitter: false,
        }
    }
}

/// Snapshot capture for trace entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CaptureConfig {
    /// Record rendered params on each trace entry
    #[serde(default)]
    pub inputs: bool,

    /// Record step output on each trace entry
    #[serde(default)]
    pub outputs: bool,
}

/// Run store settings
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// SQLite database path; `~` and `$VARS` are expanded
    pub path: Option<String>,
}

impl StoreConfig {
    /// Expanded database path, if one is configured
    pub fn resolved_path(&self) -> Result<Option<PathBuf>> {
        match self.path {
            None => Ok(None),
            Some(ref raw) => {
                let expanded = shellexpand::full(raw)
                    .with_context(|| format!("expanding store path '{}'", raw))?;
                Ok(Some(PathBuf::from(expanded.as_ref())))
            }
        }
    }

    /// Default database location (~/.config/agent-flow/runs.db)
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Could not determine config directory")?;
        let dir = config_dir.join("agent-flow");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir.join("runs.db"))
    }
}

impl EngineConfig {
    /// Load configuration from the standard hierarchy
    ///
    /// Load order (later overrides earlier):
    /// 1. Built-in defaults
    /// 2. ~/.config/agent-flow/config.toml
    /// 3. .agent-flow/config.toml (project)
    pub fn load(project_dir: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(user_config_path) = Self::user_config_path() {
            if user_config_path.exists() {
                let user_config = Self::load_file(&user_config_path)
                    .with_context(|| format!("loading {}", user_config_path.display()))?;
                config.merge(user_config);
            }
        }

        let project_config_path = project_dir
            .map(|p| p.join(".agent-flow/config.toml"))
            .unwrap_or_else(|| PathBuf::from(".agent-flow/config.toml"));

        if project_config_path.exists() {
            let project_config = Self::load_file(&project_config_path)
                .with_context(|| format!("loading {}", project_config_path.display()))?;
            config.merge(project_config);
        }

        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Get the user config path (~/.config/agent-flow/config.toml)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("agent-flow/config.toml"))
    }

    /// Merge another config into this one (other takes precedence)
    pub fn merge(&mut self, other: Self) {
        // Defaults are merged field by field; only non-default values win
        let builtin = Defaults::default();
        if other.defaults.max_attempts != builtin.max_attempts {
            self.defaults.max_attempts = other.defaults.max_attempts;
        }
        if other.defaults.base_delay_ms != builtin.base_delay_ms {
            self.defaults.base_delay_ms = other.defaults.base_delay_ms;
        }
        if other.defaults.backoff_factor != builtin.backoff_factor {
            self.defaults.backoff_factor = other.defaults.backoff_factor;
        }
        if other.defaults.max_delay_ms != builtin.max_delay_ms {
            self.defaults.max_delay_ms = other.defaults.max_delay_ms;
        }
        if other.defaults.timeout_ms != builtin.timeout_ms {
            self.defaults.timeout_ms = other.defaults.timeout_ms;
        }
        if other.defaults.jitter {
            self.defaults.jitter = true;
        }

        if other.capture.inputs {
            self.capture.inputs = true;
        }
        if other.capture.outputs {
            self.capture.outputs = true;
        }

        if other.store.path.is_some() {
            self.store.path = other.store.path;
        }

        // Providers: other wins for same key
        for (name, provider) in other.providers {
            self.providers.insert(name, provider);
        }
    }
}

/// Load a graph document from a JSON or TOML file, chosen by extension
///
/// The graph is parsed only; structural validation happens when the engine
/// compiles it.
pub fn load_graph(path: &Path) -> Result<GraphDefinition> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;

    let graph: GraphDefinition = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => {
            toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?
        }
        _ => serde_json::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?,
    };

    tracing::debug!(graph = %graph.id, states = graph.states.len(), "Loaded graph definition");
    Ok(graph)
}
