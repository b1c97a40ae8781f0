//! On-disk configuration for a storage node.
//!
//! The configuration lives in a single `config.toml` inside the node's
//! home directory and groups the tuning knobs of the other crates:
//! ring capacity bounds and reconciliation tree sizing. Every field has
//! a default, so an empty file is a valid configuration.

use std::fs::{read_to_string, write};

use camino::Utf8Path;
use eyre::{Result as EyreResult, WrapErr};
use serde::{Deserialize, Serialize};

use tessera_ring::RingConfig;
use tessera_sync::TreeConfig;

#[cfg(test)]
#[path = "tests/config.rs"]
mod tests;

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
#[non_exhaustive]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Partition ring capacity bounds.
    #[serde(default)]
    pub ring: RingConfig,

    /// Reconciliation tree sizing.
    #[serde(default)]
    pub sync: TreeConfig,
}

impl ConfigFile {
    #[must_use]
    pub const fn new(ring: RingConfig, sync: TreeConfig) -> Self {
        Self { ring, sync }
    }

    #[must_use]
    pub fn exists(dir: &Utf8Path) -> bool {
        dir.join(CONFIG_FILE).is_file()
    }

    pub fn load(dir: &Utf8Path) -> EyreResult<Self> {
        let path = dir.join(CONFIG_FILE);
        let content = read_to_string(&path)
            .wrap_err_with(|| format!("failed to read configuration from {path:?}"))?;

        toml::from_str(&content).map_err(Into::into)
    }

    pub fn save(&self, dir: &Utf8Path) -> EyreResult<()> {
        let path = dir.join(CONFIG_FILE);
        let content = toml::to_string_pretty(self)?;

        write(&path, content)
            .wrap_err_with(|| format!("failed to write configuration to {path:?}"))?;

        Ok(())
    }
}
