//! Container engine abstraction
//!
//! The pipeline only talks to containers through [`ContainerEngine`]:
//! - [`CliEngine`]: docker or podman driven through their CLI
//! - [`fake::FakeEngine`]: scripted engine for tests

mod cli;
pub mod fake;

pub use cli::CliEngine;

use crate::config::Config;
use crate::error::DistResult;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Max number of output lines to include in build error messages.
const BUILD_ERROR_TAIL_LINES: usize = 50;

/// Reference to an image known to the engine (tag or ID)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef(pub String);

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a created container
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(pub String);

impl ContainerId {
    /// Abbreviated ID for log lines
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One image build invocation
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Build context directory
    pub context: PathBuf,
    /// Recipe file
    pub recipe: PathBuf,
    /// Recipe stage to stop at (`--target`)
    pub stage: Option<String>,
    /// Tag for the resulting image
    pub tag: String,
    /// Build arguments
    pub build_args: BTreeMap<String, String>,
}

impl BuildRequest {
    /// Stage name for error messages
    pub fn stage_label(&self) -> &str {
        self.stage.as_deref().unwrap_or("final")
    }
}

/// Container engine capabilities the build pipeline consumes
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Fail early if the engine cannot be used
    async fn ensure_ready(&self) -> DistResult<()>;

    /// Build an image from a recipe
    async fn build_image(&self, request: &BuildRequest) -> DistResult<ImageRef>;

    /// Serialize an image to a tar archive at `dest`
    async fn save_image(&self, image: &ImageRef, dest: &Path) -> DistResult<()>;

    /// Load an image from a tar archive written by `save_image`
    async fn load_image(&self, blob: &Path) -> DistResult<ImageRef>;

    /// Create (but do not start) a container from an image
    async fn create_container(&self, image: &ImageRef) -> DistResult<ContainerId>;

    /// Copy `path` out of a container into the host directory `dest`
    async fn copy_from_container(&self, id: &ContainerId, path: &str, dest: &Path)
        -> DistResult<()>;

    /// Remove a container; removing a missing container succeeds
    async fn remove_container(&self, id: &ContainerId) -> DistResult<()>;

    /// Get the human-readable engine name for display
    fn engine_name(&self) -> &'static str;
}

/// Create the CLI engine selected by configuration
pub fn create_engine(config: &Config) -> Box<dyn ContainerEngine> {
    Box::new(CliEngine::new(config.engine.program.clone()))
}

/// Extract the useful tail of build output for error diagnostics.
///
/// Combines stdout and stderr, then returns the last `BUILD_ERROR_TAIL_LINES`
/// lines so error messages are actionable without being overwhelming.
pub(crate) fn build_error_output(stdout: &str, stderr: &str) -> String {
    let lines: Vec<&str> = stdout.lines().chain(stderr.lines()).collect();
    let total = lines.len();
    let tail: Vec<&str> = if total > BUILD_ERROR_TAIL_LINES {
        lines[total - BUILD_ERROR_TAIL_LINES..].to_vec()
    } else {
        lines
    };
    tail.join("\n")
}

/// Stream stdout+stderr from a child process, calling `on_output` for each line.
///
/// Returns all collected output lines for error reporting.
pub(crate) async fn stream_child_output(
    child: &mut tokio::process::Child,
    on_output: &(dyn Fn(&str) + Send + Sync),
) -> Vec<String> {
    let mut all_output = Vec::new();
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return all_output;
    };

    let mut stderr_reader = BufReader::new(stderr).lines();
    let mut stdout_reader = BufReader::new(stdout).lines();

    let mut stderr_done = false;
    let mut stdout_done = false;

    while !stderr_done || !stdout_done {
        tokio::select! {
            line = stderr_reader.next_line(), if !stderr_done => {
                match line {
                    Ok(Some(line)) => {
                        on_output(&line);
                        all_output.push(line);
                    }
                    _ => stderr_done = true,
                }
            }
            line = stdout_reader.next_line(), if !stdout_done => {
                match line {
                    Ok(Some(line)) => {
                        on_output(&line);
                        all_output.push(line);
                    }
                    _ => stdout_done = true,
                }
            }
        }
    }

    all_output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_output_keeps_tail() {
        let stdout: String = (0..80).map(|i| format!("line {}\n", i)).collect();
        let tail = build_error_output(&stdout, "make: *** [dist-xen] Error 2");

        let lines: Vec<&str> = tail.lines().collect();
        assert_eq!(lines.len(), BUILD_ERROR_TAIL_LINES);
        assert_eq!(lines.last(), Some(&"make: *** [dist-xen] Error 2"));
        assert!(!tail.contains("line 30\n"));
    }

    #[test]
    fn error_output_short_is_complete() {
        assert_eq!(build_error_output("a\nb", "c"), "a\nb\nc");
    }

    #[test]
    fn container_id_short() {
        let id = ContainerId("0123456789abcdef0123".to_string());
        assert_eq!(id.short(), "0123456789ab");
        assert_eq!(ContainerId("abc".to_string()).short(), "abc");
    }

    #[test]
    fn stage_label_defaults_to_final() {
        let request = BuildRequest {
            context: PathBuf::from("."),
            recipe: PathBuf::from("Dockerfile"),
            stage: None,
            tag: "kfx-dist-focal:20.04".to_string(),
            build_args: BTreeMap::new(),
        };
        assert_eq!(request.stage_label(), "final");
    }
}
