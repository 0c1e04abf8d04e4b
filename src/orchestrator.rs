//! Build matrix orchestration
//!
//! Expands a [`TargetSelector`] into targets and runs a [`TargetBuilder`] per
//! target with bounded concurrency. A failing target never cancels its
//! siblings; results come back in request order.

use crate::builder::{BuildResult, IntermediateStage, TargetBuilder};
use crate::cache::IntermediateCache;
use crate::config::{BuildConfig, Config};
use crate::engine::ContainerEngine;
use crate::error::DistResult;
use crate::target::{Target, TargetSelector};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Aggregate outcome of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    PartialFailure { failed: Vec<String> },
    TotalFailure { failed: Vec<String> },
}

/// Per-target results plus the aggregate outcome
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationResult {
    pub outcome: Outcome,
    /// One result per requested target, in request order
    pub results: Vec<BuildResult>,
}

impl OrchestrationResult {
    /// Aggregate per-target results. An empty request is a total failure.
    pub fn from_results(results: Vec<BuildResult>) -> Self {
        let failed: Vec<String> = results
            .iter()
            .filter(|r| !r.is_success())
            .map(|r| r.target.clone())
            .collect();

        let outcome = if results.is_empty() || failed.len() == results.len() {
            Outcome::TotalFailure { failed }
        } else if failed.is_empty() {
            Outcome::Success
        } else {
            Outcome::PartialFailure { failed }
        };

        Self { outcome, results }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    /// Process exit code: 0 only when every requested target succeeded
    pub fn exit_code(&self) -> u8 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    /// Names of targets that failed
    pub fn failed_targets(&self) -> &[String] {
        match &self.outcome {
            Outcome::Success => &[],
            Outcome::PartialFailure { failed } | Outcome::TotalFailure { failed } => failed,
        }
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &BuildResult> {
        self.results.iter().filter(|r| r.is_success())
    }
}

/// Runs the build matrix for a selection of targets
pub struct Orchestrator {
    engine: Arc<dyn ContainerEngine>,
    cache: Arc<dyn IntermediateCache>,
    build: Arc<BuildConfig>,
    targets: Vec<Target>,
    jobs: usize,
    rebuild: bool,
    scratch_dir: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        cache: Arc<dyn IntermediateCache>,
        config: &Config,
    ) -> Self {
        Self {
            engine,
            cache,
            build: Arc::new(config.build.clone()),
            targets: config.targets.clone(),
            jobs: config.build.jobs,
            rebuild: false,
            scratch_dir: None,
        }
    }

    /// Maximum number of targets built at once
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    /// Drop the cached intermediate stage before building
    pub fn with_rebuild(mut self, rebuild: bool) -> Self {
        self.rebuild = rebuild;
        self
    }

    /// Directory for intermediate image archives on their way into the cache
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// Known targets
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Build every selected target, staging raw output under `output_dir/<target>`.
    ///
    /// Fails before any engine call when the selection names an unknown target.
    pub async fn run(
        &self,
        selector: &TargetSelector,
        output_dir: &Path,
    ) -> DistResult<OrchestrationResult> {
        let targets = selector.resolve(&self.targets)?;
        info!(
            "Building {} target(s) for '{}' with {} job(s)",
            targets.len(),
            selector,
            self.jobs
        );

        self.cache.open().await?;
        if self.rebuild {
            info!("Evicting cached intermediate stage from {}", self.cache.location());
            self.cache.evict_all().await?;
        }

        let mut stage = IntermediateStage::new(
            self.engine.clone(),
            self.cache.clone(),
            self.build.clone(),
        );
        if let Some(dir) = &self.scratch_dir {
            stage = stage.with_scratch_dir(dir);
        }
        let stage = Arc::new(stage);
        let builder = Arc::new(TargetBuilder::new(
            self.engine.clone(),
            stage.clone(),
            self.build.clone(),
            output_dir,
        ));

        let results = self.run_all(&targets, builder).await;

        let closed = self.cache.close().await;
        if let Some(fatal) = stage.take_fatal() {
            return Err(fatal);
        }
        closed?;

        Ok(OrchestrationResult::from_results(results))
    }

    async fn run_all(&self, targets: &[Target], builder: Arc<TargetBuilder>) -> Vec<BuildResult> {
        let semaphore = Arc::new(Semaphore::new(self.jobs.max(1)));
        let mut join_set = JoinSet::new();

        for (index, target) in targets.iter().cloned().enumerate() {
            let semaphore = semaphore.clone();
            let builder = builder.clone();
            join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        let closed = vec!["build scheduler closed".to_string()];
                        return (index, BuildResult::failed(&target.name, closed));
                    }
                };
                (index, builder.build(&target).await)
            });
        }

        let mut slots: Vec<Option<BuildResult>> = vec![None; targets.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => error!("Build task failed: {}", e),
            }
        }

        // A task that panicked left its slot empty.
        slots
            .into_iter()
            .zip(targets)
            .map(|(slot, target)| {
                slot.unwrap_or_else(|| {
                    BuildResult::failed(&target.name, vec!["build task panicked".to_string()])
                })
            })
            .collect()
    }
}
