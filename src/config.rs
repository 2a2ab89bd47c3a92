use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::query::DEFAULT_LIMIT;

/// File name looked up in the working directory when no `--config` is given.
pub const CONFIG_FILE: &str = "lightcrud.toml";

/// Engine settings, loadable from `lightcrud.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Database file; in-memory when unset
    pub database: Option<PathBuf>,
    /// Statements executed per drained transaction
    pub batch_size: usize,
    /// Worker tick between drains
    pub drain_interval_ms: u64,
    /// Row cap for finds without an explicit limit
    pub default_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: None,
            batch_size: 25,
            drain_interval_ms: 10,
            default_limit: DEFAULT_LIMIT,
        }
    }
}

impl EngineConfig {
    /// Read `path`, falling back to defaults when the file does not exist.
    /// Relative database paths resolve against the config file's directory.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut config: Self = toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        if let (Some(database), Some(base)) = (&config.database, path.parent()) {
            if database.is_relative() && !base.as_os_str().is_empty() {
                config.database = Some(base.join(database));
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.batch_size > 0, "batch_size must be at least 1");
        anyhow::ensure!(self.drain_interval_ms > 0, "drain_interval_ms must be at least 1");
        anyhow::ensure!(self.default_limit > 0, "default_limit must be at least 1");
        Ok(())
    }

    /// Write as TOML; an existing file is only replaced with `force`.
    pub fn save(&self, path: &Path, force: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            force || !path.exists(),
            "config already exists at {} (use --force to overwrite)",
            path.display()
        );
        self.validate()?;
        std::fs::write(path, toml::to_string_pretty(self)?).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn with_database(mut self, database: impl Into<PathBuf>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Create the directory a file database will live in. No-op in memory.
    pub fn prepare_storage(&self) -> anyhow::Result<()> {
        let Some(parent) = self.database.as_deref().and_then(Path::parent) else {
            return Ok(());
        };
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        Ok(())
    }
}
