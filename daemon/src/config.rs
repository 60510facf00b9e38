use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::detector::DEFAULT_DEBOUNCE_MS;
use crate::dispatcher::DEFAULT_VAGRANT;
use crate::launcher::DEFAULT_TERMINAL;
use crate::settings::{GlobalSettings, MachineOverrides, RawSettings};

pub const MIN_DEBOUNCE_MS: u64 = 50;
pub const MAX_DEBOUNCE_MS: u64 = 10_000;
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Root configuration structure. Deserialized from `config.toml`.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Global display defaults, kebab-case keys.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub global: RawSettings,
    /// Per-machine overrides keyed by machine id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub machines: BTreeMap<String, RawSettings>,
}

/// Options for the daemon process itself (not per-machine display settings).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Quiet period after the last index change before it is re-read. Clamped to [50, 10000].
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Terminal program and the flag that makes it run a command.
    #[serde(default = "default_terminal")]
    pub terminal: Vec<String>,
    /// Name or path of the vagrant executable.
    #[serde(default = "default_vagrant")]
    pub vagrant: String,
    /// Overrides `$VAGRANT_HOME/data/machine-index/index`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_path: Option<PathBuf>,
    /// Tracing filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            terminal: default_terminal(),
            vagrant: DEFAULT_VAGRANT.to_string(),
            index_path: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl DaemonConfig {
    pub fn effective_debounce_ms(&self) -> u64 {
        self.debounce_ms.clamp(MIN_DEBOUNCE_MS, MAX_DEBOUNCE_MS)
    }
}

impl Config {
    /// Validated global defaults store.
    pub fn global_settings(&self) -> GlobalSettings {
        GlobalSettings::from_raw(&self.global)
    }

    /// Validated per-machine override store.
    pub fn machine_overrides(&self) -> MachineOverrides {
        MachineOverrides::from_raw(&self.machines)
    }

    /// Writes the stores back into the raw tables.
    pub fn store(&mut self, global: &GlobalSettings, overrides: &MachineOverrides) {
        self.global = global.to_raw();
        self.machines = overrides.to_raw();
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Serializes `config` to `path`, creating the parent directory if needed.
///
/// The file is written to a temporary sibling and renamed into place, so a
/// watcher never reads a half-written config.
pub fn save(path: &Path, config: &Config) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory {}", parent.display()))?;

    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temporary file in {}", parent.display()))?;
    tmp.write_all(content.as_bytes())
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("Failed to replace config file: {}", path.display()))?;
    Ok(())
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_terminal() -> Vec<String> {
    DEFAULT_TERMINAL.iter().map(|s| s.to_string()).collect()
}

fn default_vagrant() -> String {
    DEFAULT_VAGRANT.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
