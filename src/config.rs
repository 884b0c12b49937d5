//! Engine configuration loaded from `fsmrun.toml`.
//!
//! [`EngineConfig`] holds the knobs that apply to every run regardless of the
//! workload. Keys missing from the file fall back to defaults, and the
//! `FSMRUN_SEED` environment variable takes precedence over the file's seed.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::mutex::DEFAULT_MUTEX_COLLECTION;

pub const CONFIG_FILE: &str = "fsmrun.toml";
pub const SEED_ENV: &str = "FSMRUN_SEED";

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Run seed. Drawn at random (and logged) when absent.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Collection holding the mutex documents.
    #[serde(default = "default_mutex_collection")]
    pub mutex_collection: String,

    /// Hold workers at a gate until all of them have been spawned.
    #[serde(default = "default_start_barrier")]
    pub start_barrier: bool,

    /// Record every visited state in the worker outcomes.
    #[serde(default)]
    pub trace_states: bool,

    /// Log filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_mutex_collection() -> String {
    DEFAULT_MUTEX_COLLECTION.to_string()
}

fn default_start_barrier() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            seed: None,
            mutex_collection: default_mutex_collection(),
            start_barrier: default_start_barrier(),
            trace_states: false,
            log_level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Loads `fsmrun.toml` from the current directory, or defaults if absent.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<EngineConfig>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_seed_override(std::env::var(SEED_ENV).ok().as_deref())?;
        Ok(config)
    }

    /// Replaces the seed with the value of `FSMRUN_SEED`, if set and non-empty.
    fn apply_seed_override(&mut self, raw: Option<&str>) -> Result<()> {
        if let Some(raw) = raw
            && !raw.is_empty()
        {
            let seed = raw
                .parse::<u64>()
                .with_context(|| format!("{SEED_ENV} must be an unsigned integer, got '{raw}'"))?;
            self.seed = Some(seed);
        }
        Ok(())
    }
}
