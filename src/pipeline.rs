//! End-to-end run: build the matrix, flatten the output, write the report

use crate::artifact::{logical_name, ArtifactNormalizer, NormalizeReport};
use crate::builder::BuildResult;
use crate::error::{DistError, DistResult};
use crate::orchestrator::{Orchestrator, Outcome};
use crate::target::TargetSelector;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Everything known about a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub id: Uuid,
    pub selector: String,
    pub output_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub results: Vec<BuildResult>,
    pub normalize: NormalizeReport,
}

impl RunReport {
    /// Process exit code: 0 only when every requested target succeeded
    pub fn exit_code(&self) -> u8 {
        match self.outcome {
            Outcome::Success => 0,
            _ => 1,
        }
    }
}

/// A fresh output directory under the system temp dir
pub fn default_output_dir() -> PathBuf {
    std::env::temp_dir().join(format!("kfx-dist-{}", Uuid::new_v4()))
}

/// Orchestrator plus normalization and reporting
pub struct Pipeline {
    orchestrator: Orchestrator,
    normalizer: ArtifactNormalizer,
    report_path: Option<PathBuf>,
}

impl Pipeline {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            normalizer: ArtifactNormalizer::new(),
            report_path: None,
        }
    }

    /// Write the JSON run report to `path` when the run finishes
    pub fn with_report(mut self, path: Option<PathBuf>) -> Self {
        self.report_path = path;
        self
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Build the selected targets into `output_dir` and normalize it.
    ///
    /// Per-target failures are part of the report; only request and cache
    /// location errors are returned as `Err`.
    pub async fn run(&self, selector: &TargetSelector, output_dir: &Path) -> DistResult<RunReport> {
        let started_at = Utc::now();
        let id = Uuid::new_v4();
        debug!("Run {} writing to {}", id, output_dir.display());

        // Reject unknown targets before touching the filesystem.
        selector.resolve(self.orchestrator.targets())?;

        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| DistError::io(format!("creating {}", output_dir.display()), e))?;

        let result = self.orchestrator.run(selector, output_dir).await?;

        let normalizer = self.normalizer.clone();
        let root = output_dir.to_path_buf();
        let normalize = tokio::task::spawn_blocking(move || normalizer.normalize(&root))
            .await
            .map_err(|e| DistError::Internal(format!("normalize task failed: {}", e)))??;

        let mut results = result.results;
        relocate_outputs(&mut results, output_dir);

        let report = RunReport {
            id,
            selector: selector.to_string(),
            output_dir: output_dir.to_path_buf(),
            started_at,
            finished_at: Utc::now(),
            outcome: result.outcome,
            results,
            normalize,
        };

        if let Some(path) = &self.report_path {
            write_report(&report, path).await?;
        }

        Ok(report)
    }
}

/// Point each result's files at where normalization left them.
///
/// Files moved into the root (and decompressed) are found there by logical
/// name; files left in place by a collision or a failed decompression keep
/// their staging path.
fn relocate_outputs(results: &mut [BuildResult], root: &Path) {
    for result in results.iter_mut() {
        for path in result.output_files.iter_mut() {
            if path.exists() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let flattened = root.join(logical_name(name));
            if flattened.exists() {
                *path = flattened;
            }
        }
        result.output_files.sort();
    }
}

async fn write_report(report: &RunReport, path: &Path) -> DistResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DistError::io(format!("creating {}", parent.display()), e))?;
    }
    let json = serde_json::to_string_pretty(report)?;
    tokio::fs::write(path, json)
        .await
        .map_err(|e| DistError::io(format!("writing report {}", path.display()), e))?;
    info!("Wrote run report to {}", path.display());
    Ok(())
}
