//! Per-target build
//!
//! A [`TargetBuilder`] drives one distribution target from sources to
//! extracted packages. The expensive intermediate stage is shared by every
//! target of a run through [`IntermediateStage`], which consults the cache
//! and builds the stage at most once.

use crate::cache::{compute_key, IntermediateCache};
use crate::config::BuildConfig;
use crate::engine::{BuildRequest, ContainerEngine, ContainerId, ImageRef};
use crate::error::{DistError, DistResult};
use crate::target::Target;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Outcome of one target build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Success,
    Failed,
}

/// Result of building one target
#[derive(Debug, Clone, Serialize)]
pub struct BuildResult {
    /// Target name
    pub target: String,
    pub status: BuildStatus,
    /// Extracted files, sorted by path
    pub output_files: Vec<PathBuf>,
    /// Error text and hints for a failed build
    pub diagnostics: Vec<String>,
    pub duration_ms: u64,
}

impl BuildResult {
    pub fn success(target: &str, output_files: Vec<PathBuf>) -> Self {
        Self {
            target: target.to_string(),
            status: BuildStatus::Success,
            output_files,
            diagnostics: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn failed(target: &str, diagnostics: Vec<String>) -> Self {
        Self {
            target: target.to_string(),
            status: BuildStatus::Failed,
            output_files: Vec::new(),
            diagnostics,
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == BuildStatus::Success
    }

    fn with_duration(mut self, started: Instant) -> Self {
        self.duration_ms = started.elapsed().as_millis() as u64;
        self
    }
}

/// The intermediate stage image shared by all targets of a run.
///
/// The first caller resolves it (cache hit or build and store); later callers
/// wait for that outcome and reuse it, including a failure.
pub struct IntermediateStage {
    engine: Arc<dyn ContainerEngine>,
    cache: Arc<dyn IntermediateCache>,
    config: Arc<BuildConfig>,
    scratch_dir: PathBuf,
    outcome: Mutex<Option<Result<ImageRef, String>>>,
    fatal: std::sync::Mutex<Option<DistError>>,
}

impl IntermediateStage {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        cache: Arc<dyn IntermediateCache>,
        config: Arc<BuildConfig>,
    ) -> Self {
        Self {
            engine,
            cache,
            config,
            scratch_dir: std::env::temp_dir(),
            outcome: Mutex::new(None),
            fatal: std::sync::Mutex::new(None),
        }
    }

    /// Directory for image archives on their way into the cache
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Image reference of the intermediate stage, resolving it on first use
    pub async fn resolve(&self) -> DistResult<ImageRef> {
        let mut outcome = self.outcome.lock().await;
        if outcome.is_none() {
            let resolved = self.prepare().await.map_err(|e| {
                let message = e.to_string();
                if e.is_fatal() {
                    *self.lock_fatal() = Some(e);
                }
                message
            });
            *outcome = Some(resolved);
        }

        match outcome.as_ref() {
            Some(Ok(image)) => Ok(image.clone()),
            Some(Err(reason)) => Err(DistError::IntermediateUnavailable(reason.clone())),
            None => Err(DistError::Internal(
                "intermediate stage outcome missing".to_string(),
            )),
        }
    }

    /// Error that must abort the whole run, if one occurred
    pub fn take_fatal(&self) -> Option<DistError> {
        self.lock_fatal().take()
    }

    fn lock_fatal(&self) -> std::sync::MutexGuard<'_, Option<DistError>> {
        self.fatal.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn prepare(&self) -> DistResult<ImageRef> {
        let sources = self.config.tracked_sources();
        let key = tokio::task::spawn_blocking(move || compute_key(&sources))
            .await
            .map_err(|e| DistError::Internal(format!("cache key task failed: {}", e)))??;
        debug!("Intermediate cache key: {}", key);

        if let Some(entry) = self.cache.lookup(&key).await {
            match self.engine.load_image(&entry.blob).await {
                Ok(image) => {
                    info!(
                        "Reusing cached {} stage {} from {}",
                        self.config.intermediate_stage,
                        key.short(),
                        self.cache.location()
                    );
                    return Ok(image);
                }
                Err(e) => warn!("Cached image for {} did not load, rebuilding: {}", key.short(), e),
            }
        } else {
            info!("No cached {} stage for {}", self.config.intermediate_stage, key.short());
        }

        let request = BuildRequest {
            context: self.config.context.clone(),
            recipe: self.config.recipe.clone(),
            stage: Some(self.config.intermediate_stage.clone()),
            tag: format!("kfx-dist-{}:{}", self.config.intermediate_stage, key.short()),
            build_args: self.config.build_args.clone(),
        };
        let image = self.engine.build_image(&request).await?;

        let blob = self
            .scratch_dir
            .join(format!("kfx-dist-{}-{}.tar", key.short(), Uuid::new_v4()));
        if let Err(e) = self.engine.save_image(&image, &blob).await {
            let _ = tokio::fs::remove_file(&blob).await;
            warn!("Could not save {} for caching: {}", image, e);
            return Ok(image);
        }

        match self.cache.store(&key, &blob).await {
            Ok(entry) => info!(
                "Cached {} stage {} ({} bytes)",
                self.config.intermediate_stage,
                key.short(),
                entry.size_bytes
            ),
            Err(e) => {
                let _ = tokio::fs::remove_file(&blob).await;
                if e.is_fatal() {
                    return Err(e);
                }
                warn!("Could not cache {} stage: {}", self.config.intermediate_stage, e);
            }
        }

        Ok(image)
    }
}

/// Builds one target's final image and extracts its packages
pub struct TargetBuilder {
    engine: Arc<dyn ContainerEngine>,
    stage: Arc<IntermediateStage>,
    config: Arc<BuildConfig>,
    staging_root: PathBuf,
}

impl TargetBuilder {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        stage: Arc<IntermediateStage>,
        config: Arc<BuildConfig>,
        staging_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine,
            stage,
            config,
            staging_root: staging_root.into(),
        }
    }

    /// Staging directory receiving a target's raw output.
    ///
    /// Fails for names that would resolve outside the staging root.
    pub fn staging_dir(&self, target: &Target) -> DistResult<PathBuf> {
        Target::validate_name(&target.name).map_err(|reason| {
            DistError::build("final", format!("refusing to stage output: {}", reason))
        })?;
        Ok(self.staging_root.join(&target.name))
    }

    /// Build one target. Failures are reported in the result, never returned.
    pub async fn build(&self, target: &Target) -> BuildResult {
        let started = Instant::now();
        let staging = match self.staging_dir(target) {
            Ok(dir) => dir,
            Err(e) => {
                warn!("{} rejected: {}", target.name, e);
                return BuildResult::failed(&target.name, vec![e.to_string()])
                    .with_duration(started);
            }
        };
        info!("Building {}", target);

        match self.run(target, &staging).await {
            Ok(files) => {
                info!("{} produced {} file(s)", target.name, files.len());
                BuildResult::success(&target.name, files).with_duration(started)
            }
            Err(e) => {
                warn!("{} failed: {}", target.name, e);
                if let Err(cleanup) = remove_dir_if_exists(&staging).await {
                    warn!("Could not remove {}: {}", staging.display(), cleanup);
                }

                let mut diagnostics = vec![e.to_string()];
                if let Some(hint) = e.hint() {
                    diagnostics.push(format!("hint: {}", hint));
                }
                BuildResult::failed(&target.name, diagnostics).with_duration(started)
            }
        }
    }

    async fn run(&self, target: &Target, staging: &Path) -> DistResult<Vec<PathBuf>> {
        let intermediate = self.stage.resolve().await?;

        let request = BuildRequest {
            context: self.config.context.clone(),
            recipe: self.config.recipe.clone(),
            stage: self.config.final_stage.clone(),
            tag: format!("kfx-dist-{}:{}", target.name, target.version_label),
            build_args: final_build_args(&self.config.build_args, target, &intermediate),
        };
        let image = self.engine.build_image(&request).await?;

        let container = self.engine.create_container(&image).await?;
        let extracted = self.extract(&container, staging).await;

        if let Err(e) = self.engine.remove_container(&container).await {
            warn!("Failed to remove container {}: {}", container.short(), e);
        }
        extracted?;

        let staging = staging.to_path_buf();
        tokio::task::spawn_blocking(move || list_output_files(&staging))
            .await
            .map_err(|e| DistError::Internal(format!("listing output failed: {}", e)))?
    }

    async fn extract(&self, container: &ContainerId, staging: &Path) -> DistResult<()> {
        remove_dir_if_exists(staging).await?;
        tokio::fs::create_dir_all(staging)
            .await
            .map_err(|e| DistError::io(format!("creating {}", staging.display()), e))?;

        self.engine
            .copy_from_container(container, &self.config.output_path, staging)
            .await
    }
}

/// Build arguments for a final stage build. Per-target values win over
/// configured extras of the same name.
fn final_build_args(
    extra: &BTreeMap<String, String>,
    target: &Target,
    intermediate: &ImageRef,
) -> BTreeMap<String, String> {
    let mut args = extra.clone();
    args.insert("BASE_IMAGE".to_string(), target.base_image.clone());
    args.insert("DISTRO".to_string(), target.name.clone());
    args.insert("VERSION".to_string(), target.version_label.clone());
    args.insert("INTERMEDIATE_IMAGE".to_string(), intermediate.0.clone());
    args
}

async fn remove_dir_if_exists(dir: &Path) -> DistResult<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DistError::io(format!("removing {}", dir.display()), e)),
    }
}

fn list_output_files(root: &Path) -> DistResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(|e| {
            let context = format!("listing {}", root.display());
            match e.into_io_error() {
                Some(source) => DistError::io(context, source),
                None => DistError::Internal(context),
            }
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}
