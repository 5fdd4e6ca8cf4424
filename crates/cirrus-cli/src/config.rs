//! Configuration discovery and loading.
//!
//! Discovery order: an explicit `--config-dir`, the `CIRRUS_CONFIGURATION`
//! environment variable, `$XDG_CONFIG_HOME/cirrus`, then
//! `~/.config/cirrus`. Values layer as defaults < `cirrus.toml` <
//! `CIRRUS_*` environment variables; the environment always wins.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use cirrus_core::config::Config;

/// Filename of the configuration file inside the configuration directory.
pub const CONFIG_FILENAME: &str = "cirrus.toml";

/// Resolve the configuration directory.
pub fn discover_config_dir(explicit: Option<PathBuf>) -> PathBuf {
  if let Some(dir) = explicit {
    return dir;
  }
  if let Ok(dir) = std::env::var("CIRRUS_CONFIGURATION") {
    return PathBuf::from(dir);
  }
  if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
    return PathBuf::from(xdg).join("cirrus");
  }
  if let Ok(home) = std::env::var("HOME") {
    return PathBuf::from(home).join(".config").join("cirrus");
  }
  PathBuf::from(".cirrus")
}

/// Load the configuration rooted at `dir`.
pub fn load_config(dir: &Path) -> anyhow::Result<Config> {
  let defaults = Config::under_root(dir);

  let settings = config::Config::builder()
    .add_source(
      config::Config::try_from(&defaults)
        .context("failed to build configuration defaults")?,
    )
    .add_source(
      config::File::from(dir.join(CONFIG_FILENAME)).required(false),
    )
    .add_source(
      config::Environment::with_prefix("CIRRUS").separator("__"),
    )
    .build()
    .context("failed to read configuration")?;

  settings
    .try_deserialize()
    .context("failed to deserialise configuration")
}
