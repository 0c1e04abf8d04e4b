//! CLI-driven container engine
//!
//! Implements the ContainerEngine trait by executing `docker` or `podman`.
//! Both accept the same subset of commands used here.

use crate::engine::{
    build_error_output, stream_child_output, BuildRequest, ContainerEngine, ContainerId, ImageRef,
};
use crate::error::{DistError, DistResult};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Container engine backed by a docker-compatible CLI
pub struct CliEngine {
    program: String,
}

impl CliEngine {
    /// Create an engine invoking `program` (e.g. "docker", "podman")
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Execute an engine command and return the output
    async fn exec(&self, args: &[&str]) -> DistResult<std::process::Output> {
        debug!("Executing: {} {:?}", self.program, args);

        Command::new(&self.program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DistError::command_failed(format!("{} {:?}", self.program, args), e))
    }

    /// Execute a command that must succeed, returning trimmed stdout
    async fn exec_checked(&self, label: &str, args: &[&str]) -> DistResult<String> {
        let output = self.exec(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(DistError::command_exec(
                format!("{} {}", self.program, label),
                stderr.trim(),
            ))
        }
    }

    fn build_args(request: &BuildRequest) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "-f".to_string(),
            request.context.join(&request.recipe).display().to_string(),
            "-t".to_string(),
            request.tag.clone(),
        ];

        if let Some(stage) = &request.stage {
            args.push("--target".to_string());
            args.push(stage.clone());
        }

        for (k, v) in &request.build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", k, v));
        }

        args.push(request.context.display().to_string());
        args
    }
}

/// Pick the image reference out of `load` output.
///
/// docker prints `Loaded image: repo:tag` or `Loaded image ID: sha256:...`;
/// podman prints `Loaded image: repo:tag` or `Loaded image(s): repo:tag`.
fn parse_loaded_image(stdout: &str) -> Option<ImageRef> {
    stdout
        .lines()
        .rev()
        .filter(|line| line.starts_with("Loaded image"))
        .find_map(|line| line.split_once(": "))
        .map(|(_, image)| image.split(',').next().unwrap_or(image).trim().to_string())
        .filter(|image| !image.is_empty())
        .map(ImageRef)
}

#[async_trait]
impl ContainerEngine for CliEngine {
    async fn ensure_ready(&self) -> DistResult<()> {
        let status = Command::new(&self.program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(s) if s.success() => Ok(()),
            _ => Err(DistError::EngineNotFound {
                program: self.program.clone(),
            }),
        }
    }

    async fn build_image(&self, request: &BuildRequest) -> DistResult<ImageRef> {
        let args = Self::build_args(request);
        info!("Building {} stage as {}", request.stage_label(), request.tag);
        debug!("Running: {} {:?}", self.program, args);

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DistError::command_failed(format!("{} build", self.program), e))?;

        let tag = request.tag.clone();
        let lines = stream_child_output(&mut child, &|line: &str| debug!("[{}] {}", tag, line)).await;

        let status = child
            .wait()
            .await
            .map_err(|e| DistError::command_failed(format!("{} build", self.program), e))?;

        if status.success() {
            Ok(ImageRef(request.tag.clone()))
        } else {
            let output = build_error_output(&lines.join("\n"), "");
            Err(DistError::build(
                request.stage_label(),
                format!("{} ({})\n{}", self.program, status, output),
            ))
        }
    }

    async fn save_image(&self, image: &ImageRef, dest: &Path) -> DistResult<()> {
        info!("Saving image {} to {}", image, dest.display());
        let dest = dest.display().to_string();
        self.exec_checked("save", &["save", "-o", &dest, &image.0])
            .await
            .map(|_| ())
    }

    async fn load_image(&self, blob: &Path) -> DistResult<ImageRef> {
        info!("Loading image from {}", blob.display());
        let blob = blob.display().to_string();
        let stdout = self.exec_checked("load", &["load", "-i", &blob]).await?;

        parse_loaded_image(&stdout).ok_or_else(|| {
            DistError::command_exec(
                format!("{} load", self.program),
                format!("no image reference in output: {}", stdout),
            )
        })
    }

    async fn create_container(&self, image: &ImageRef) -> DistResult<ContainerId> {
        let id = self.exec_checked("create", &["create", &image.0]).await?;
        let id = ContainerId(id);
        debug!("Created container {} from {}", id.short(), image);
        Ok(id)
    }

    async fn copy_from_container(
        &self,
        id: &ContainerId,
        path: &str,
        dest: &Path,
    ) -> DistResult<()> {
        // Trailing "/." copies the directory's contents, not the directory.
        let source = format!("{}:{}/.", id.0, path.trim_end_matches('/'));
        let dest = dest.display().to_string();
        debug!("Copying {} to {}", source, dest);
        self.exec_checked("cp", &["cp", &source, &dest])
            .await
            .map(|_| ())
    }

    async fn remove_container(&self, id: &ContainerId) -> DistResult<()> {
        debug!("Removing container: {}", id.short());

        let output = self.exec(&["rm", "-f", &id.0]).await?;

        if output.status.success() {
            Ok(())
        } else {
            // Ignore error if container doesn't exist
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_lowercase().contains("no such container") {
                Ok(())
            } else {
                Err(DistError::command_exec(format!("{} rm", self.program), stderr))
            }
        }
    }

    fn engine_name(&self) -> &'static str {
        match self.program.rsplit('/').next() {
            Some("podman") => "Podman",
            Some("docker") => "Docker",
            _ => "Container CLI",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    #[test]
    fn engine_name_from_program() {
        assert_eq!(CliEngine::new("docker").engine_name(), "Docker");
        assert_eq!(CliEngine::new("/usr/bin/podman").engine_name(), "Podman");
        assert_eq!(CliEngine::new("nerdctl").engine_name(), "Container CLI");
    }

    #[test]
    fn build_args_layout() {
        let mut build_args = BTreeMap::new();
        build_args.insert("DISTRO".to_string(), "focal".to_string());
        build_args.insert("BASE_IMAGE".to_string(), "ubuntu:focal".to_string());
        let request = BuildRequest {
            context: PathBuf::from("/src/kfx"),
            recipe: PathBuf::from("Dockerfile"),
            stage: Some("xen".to_string()),
            tag: "kfx-dist-xen:abc".to_string(),
            build_args,
        };

        let args = CliEngine::build_args(&request);
        assert_eq!(
            args,
            vec![
                "build",
                "-f",
                "/src/kfx/Dockerfile",
                "-t",
                "kfx-dist-xen:abc",
                "--target",
                "xen",
                "--build-arg",
                "BASE_IMAGE=ubuntu:focal",
                "--build-arg",
                "DISTRO=focal",
                "/src/kfx",
            ]
        );
    }

    #[test]
    fn parse_loaded_image_docker_tag() {
        let out = "Loaded image: kfx-dist-xen:0123456789ab\n";
        assert_eq!(
            parse_loaded_image(out),
            Some(ImageRef("kfx-dist-xen:0123456789ab".to_string()))
        );
    }

    #[test]
    fn parse_loaded_image_docker_id() {
        let out = "Loaded image ID: sha256:deadbeef";
        assert_eq!(
            parse_loaded_image(out),
            Some(ImageRef("sha256:deadbeef".to_string()))
        );
    }

    #[test]
    fn parse_loaded_image_podman() {
        let out = "Getting image source signatures\nCopying blob 1a2b done\nLoaded image(s): localhost/kfx-dist-xen:0123,localhost/other:1";
        assert_eq!(
            parse_loaded_image(out),
            Some(ImageRef("localhost/kfx-dist-xen:0123".to_string()))
        );
    }

    #[test]
    fn parse_loaded_image_missing() {
        assert_eq!(parse_loaded_image("nothing useful"), None);
    }
}
