//! Deployment configuration and the install-time seed manifest.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::fetch::request::RequestKey;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin that root-relative seed entries resolve against
  pub origin: String,
  pub cache: CacheConfig,
  /// Ordered list of URLs seeded at install time; absolute or
  /// root-relative
  pub seed: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Versioned generation name, e.g. "app-cache-v1.1". Bumping it on
  /// release is the sole cache-invalidation trigger.
  pub generation: String,
  /// Seed entry served to offline navigations with no cached match
  pub fallback: String,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./outpost.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/outpost/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/outpost/config.yaml\n\
                 See outpost.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("outpost.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("outpost").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }
}

/// The resolved install-time seed list.
///
/// Static per deployment; the lifecycle controller consumes it once at
/// install.
#[derive(Debug, Clone)]
pub struct SeedManifest {
  entries: Vec<RequestKey>,
  fallback: RequestKey,
}

impl SeedManifest {
  /// Resolve and validate the configured seed list.
  ///
  /// Entries may be absolute URLs or root-relative paths joined onto the
  /// origin. The fallback must name one of the seeded entries — offline
  /// navigation depends on it being present in the generation.
  pub fn from_config(config: &Config) -> Result<Self> {
    let origin =
      Url::parse(&config.origin).map_err(|e| eyre!("Invalid origin {}: {}", config.origin, e))?;

    let mut entries = Vec::with_capacity(config.seed.len());
    for raw in &config.seed {
      entries.push(resolve(&origin, raw)?);
    }

    let fallback = resolve(&origin, &config.cache.fallback)?;
    if !entries.contains(&fallback) {
      return Err(eyre!(
        "Fallback {} is not one of the seeded entries",
        config.cache.fallback
      ));
    }

    Ok(Self { entries, fallback })
  }

  pub fn entries(&self) -> &[RequestKey] {
    &self.entries
  }

  pub fn fallback(&self) -> &RequestKey {
    &self.fallback
  }
}

fn resolve(origin: &Url, raw: &str) -> Result<RequestKey> {
  let url = match Url::parse(raw) {
    Ok(url) => url,
    Err(url::ParseError::RelativeUrlWithoutBase) => origin
      .join(raw)
      .map_err(|e| eyre!("Cannot resolve {} against {}: {}", raw, origin, e))?,
    Err(e) => return Err(eyre!("Invalid seed URL {}: {}", raw, e)),
  };

  Ok(RequestKey::new("GET", url))
}
