//! Configuration schema for kfx-dist
//!
//! Configuration is stored at `~/.config/kfx-dist/config.toml`

use crate::target::Target;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Container engine settings
    pub engine: EngineConfig,

    /// Build recipe settings
    pub build: BuildConfig,

    /// Intermediate cache settings
    pub cache: CacheConfig,

    /// Known distribution targets
    pub targets: Vec<Target>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            engine: EngineConfig::default(),
            build: BuildConfig::default(),
            cache: CacheConfig::default(),
            targets: Target::default_set(),
        }
    }
}

impl Config {
    /// Check invariants serde cannot express.
    ///
    /// Returns a human-readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.targets.is_empty() {
            return Err("at least one [[targets]] entry is required".to_string());
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            Target::validate_name(&target.name)?;
            if !seen.insert(target.name.as_str()) {
                return Err(format!("duplicate target name: {}", target.name));
            }
        }

        if !matches!(self.general.log_format.as_str(), "text" | "json") {
            return Err(format!(
                "general.log_format must be \"text\" or \"json\", got \"{}\"",
                self.general.log_format
            ));
        }

        if self.build.jobs == 0 {
            return Err("build.jobs must be at least 1".to_string());
        }

        if self.build.tracked_paths.is_empty() {
            return Err("build.tracked_paths must list at least one path".to_string());
        }

        Ok(())
    }
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Container engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine CLI to invoke ("docker" or "podman")
    pub program: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }
}

/// Build recipe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Build context directory
    pub context: PathBuf,

    /// Recipe (Dockerfile) path, relative to the context
    pub recipe: PathBuf,

    /// Recipe stage producing the cached intermediate image
    pub intermediate_stage: String,

    /// Recipe stage producing the final image (last stage when unset)
    pub final_stage: Option<String>,

    /// Source paths feeding the intermediate stage, relative to the context
    pub tracked_paths: Vec<PathBuf>,

    /// Directory inside the final image holding the produced packages
    pub output_path: String,

    /// Maximum number of targets built at once
    pub jobs: usize,

    /// Extra build arguments passed to every final stage build
    pub build_args: BTreeMap<String, String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            context: PathBuf::from("."),
            recipe: PathBuf::from("Dockerfile"),
            intermediate_stage: "xen".to_string(),
            final_stage: None,
            tracked_paths: vec![PathBuf::from("xen")],
            output_path: "/out".to_string(),
            jobs: 1,
            build_args: BTreeMap::new(),
        }
    }
}

impl BuildConfig {
    /// Tracked paths resolved against the build context
    pub fn tracked_sources(&self) -> Vec<PathBuf> {
        self.tracked_paths
            .iter()
            .map(|p| self.context.join(p))
            .collect()
    }
}

/// Intermediate cache settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory (defaults to the user cache dir)
    pub dir: Option<PathBuf>,
}
