//! Configuration of a simulated system.

use crate::{cache, mem};
use color_eyre::eyre::{self, WrapErr};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A single cache level backed by memory.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub cache: cache::Config,
    #[serde(default)]
    pub memory: mem::Config,
}

impl SimConfig {
    pub fn from_yaml(config: impl AsRef<str>) -> eyre::Result<Self> {
        let config: Self = serde_yaml::from_str(config.as_ref()).wrap_err("invalid yaml config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(config: impl AsRef<str>) -> eyre::Result<Self> {
        let config: Self = serde_json::from_str(config.as_ref()).wrap_err("invalid json config")?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a config file, json if the extension says so and yaml otherwise.
    pub fn load(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let config = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read config {}", path.display()))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json(config)
        } else {
            Self::from_yaml(config)
        };
        config.wrap_err_with(|| format!("bad config {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), cache::config::Error> {
        self.cache.validate()
    }
}

impl std::fmt::Display for SimConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} + memory({} cycles, {} outstanding)",
            self.cache, self.memory.latency, self.memory.max_outstanding
        )
    }
}

#[cfg(test)]
mod tests {
    use super::SimConfig;
    use crate::cache::set_index;
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;

    #[test]
    fn yaml_fills_in_defaults() -> eyre::Result<()> {
        let config = SimConfig::from_yaml(
            r"
cache:
  size: 8192
  assoc: 2
  physically_2d: true
  set_index: tiled
memory:
  latency: 50
",
        )?;
        diff::assert_eq!(config.cache.num_sets(), 64);
        diff::assert_eq!(config.cache.set_index, set_index::Function::Tiled);
        diff::assert_eq!(config.memory.latency, 50);
        diff::assert_eq!(config.memory.max_outstanding, 16);
        Ok(())
    }

    #[test]
    fn json_and_empty_configs() -> eyre::Result<()> {
        let config = SimConfig::from_json(r#"{"cache": {"mshrs": 2, "write_buffers": 1}}"#)?;
        diff::assert_eq!(config.cache.mshrs, 2);
        diff::assert_eq!(config.cache.write_buffers, 1);
        diff::assert_eq!(SimConfig::from_yaml("{}")?, SimConfig::default());
        Ok(())
    }

    #[test]
    fn invalid_cache_is_rejected() {
        let err = SimConfig::from_yaml("cache:\n  physically_2d: true\n").unwrap_err();
        assert!(format!("{err:?}").contains("tiled"), "{err:?}");
    }
}
