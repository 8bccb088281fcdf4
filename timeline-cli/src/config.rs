use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// CLI configuration, loadable from a TOML file.
///
/// Every field has a default. CLI flags override config file values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    /// Directory holding one schema directory per game version.
    pub scripts_dir: Option<PathBuf>,
    pub strict: bool,
    pub pretty: bool,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            scripts_dir: None,
            strict: false,
            pretty: false,
            log_level: "warn".to_owned(),
        }
    }
}

impl TimelineConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    /// `-v` steps above the configured level.
    pub fn log_directive(&self, verbosity: u64) -> String {
        match verbosity {
            0 => self.log_level.clone(),
            1 => "info".to_owned(),
            2 => "debug".to_owned(),
            _ => "trace".to_owned(),
        }
    }
}
