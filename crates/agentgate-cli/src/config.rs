//! Configuration file management for `agentgate`.
//!
//! A TOML config file at `~/.config/agentgate/config.toml` plus a
//! resolution chain: CLI flag > env var > config file > default, limited to
//! the handful of orchestrator tunables this binary actually exposes.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    pub max_concurrent_runs: Option<usize>,
    pub max_queue_size: Option<usize>,
    pub stagger_delay_ms: Option<u64>,
    pub min_available_memory_mb: Option<u64>,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_concurrent_runs: None,
            max_queue_size: None,
            stagger_delay_ms: None,
            min_available_memory_mb: None,
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the agentgate config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/agentgate` or
/// `~/.config/agentgate`. We intentionally ignore the platform-specific
/// `dirs::config_dir()` (which returns `~/Library/Application Support` on
/// macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("agentgate");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("agentgate")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Where per-work-order records and queue snapshots live (§6 "Persisted
/// queue file layout"). Uses the same XDG-aware override as `config_dir`
/// so tests can redirect both without touching `HOME`.
pub fn data_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("agentgate");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".local")
        .join("share")
        .join("agentgate")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved orchestrator tunables, ready for use.
#[derive(Debug, Clone)]
pub struct AgentGateConfig {
    pub max_concurrent_runs: usize,
    pub max_queue_size: usize,
    pub stagger_delay_ms: u64,
    pub min_available_memory_mb: u64,
}

/// CLI-flag overrides accepted by [`AgentGateConfig::resolve`]. Every
/// field is optional; `None` falls through to the next link in the chain.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub max_concurrent_runs: Option<usize>,
    pub max_queue_size: Option<usize>,
    pub stagger_delay_ms: Option<u64>,
    pub min_available_memory_mb: Option<u64>,
}

impl AgentGateConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    pub fn resolve(cli: &CliOverrides) -> Self {
        let file_config = load_config().ok();
        let file_section = file_config.map(|c| c.orchestrator);

        let max_concurrent_runs = cli
            .max_concurrent_runs
            .or_else(|| env_usize("AGENTGATE_MAX_CONCURRENT_RUNS"))
            .or_else(|| file_section.as_ref().and_then(|s| s.max_concurrent_runs))
            .unwrap_or(4);

        let max_queue_size = cli
            .max_queue_size
            .or_else(|| env_usize("AGENTGATE_MAX_QUEUE_SIZE"))
            .or_else(|| file_section.as_ref().and_then(|s| s.max_queue_size))
            .unwrap_or(100);

        let stagger_delay_ms = cli
            .stagger_delay_ms
            .or_else(|| env_u64("AGENTGATE_STAGGER_DELAY_MS"))
            .or_else(|| file_section.as_ref().and_then(|s| s.stagger_delay_ms))
            .unwrap_or(0);

        let min_available_memory_mb = cli
            .min_available_memory_mb
            .or_else(|| env_u64("AGENTGATE_MIN_AVAILABLE_MEMORY_MB"))
            .or_else(|| file_section.as_ref().and_then(|s| s.min_available_memory_mb))
            .unwrap_or(0);

        Self {
            max_concurrent_runs,
            max_queue_size,
            stagger_delay_ms,
            min_available_memory_mb,
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
