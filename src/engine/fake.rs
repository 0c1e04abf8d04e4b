//! Scripted container engine
//!
//! Behaves like a real engine closely enough for the builder and
//! orchestrator to run end to end: images and containers are tracked in
//! memory, saved images are small tar stand-ins on disk, and extraction
//! writes package files shaped like the real recipe's output (one plain
//! `.deb` and one marker-compressed bundle in a nested directory).
//!
//! Failures are scripted per distro through the `DISTRO` build argument.

use crate::artifact::compress_oversized;
use crate::engine::{BuildRequest, ContainerEngine, ContainerId, ImageRef};
use crate::error::{DistError, DistResult};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

const IMAGE_MAGIC: &str = "fake-image:";

/// One recorded engine invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Build { tag: String, stage: Option<String> },
    Save { image: String },
    Load { image: String },
    Create { id: String, image: String },
    Copy { id: String, path: String },
    Remove { id: String },
}

#[derive(Default)]
struct FakeState {
    calls: Vec<EngineCall>,
    // image tag -> distro it was built for (None for the intermediate stage)
    images: HashMap<String, Option<String>>,
    // container id -> image tag
    containers: HashMap<String, String>,
    next_container: usize,
}

/// In-memory container engine with scripted failures
#[derive(Default)]
pub struct FakeEngine {
    failing_targets: HashSet<String>,
    failing_extract: HashSet<String>,
    fail_intermediate: bool,
    state: Mutex<FakeState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the final stage build fail for these distros
    pub fn failing_targets<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failing_targets.extend(names.into_iter().map(Into::into));
        self
    }

    /// Make output extraction fail for this distro
    pub fn failing_extract(mut self, name: impl Into<String>) -> Self {
        self.failing_extract.insert(name.into());
        self
    }

    /// Make every intermediate stage build fail
    pub fn failing_intermediate(mut self) -> Self {
        self.fail_intermediate = true;
        self
    }

    /// Every call so far, in order
    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    /// Number of intermediate stage builds
    pub fn intermediate_builds(&self) -> usize {
        self.count(|c| matches!(c, EngineCall::Build { stage: Some(_), .. }))
    }

    /// Number of final stage builds
    pub fn final_builds(&self) -> usize {
        self.count(|c| matches!(c, EngineCall::Build { stage: None, .. }))
    }

    /// Number of image loads
    pub fn loads(&self) -> usize {
        self.count(|c| matches!(c, EngineCall::Load { .. }))
    }

    /// Containers created and not yet removed
    pub fn live_containers(&self) -> usize {
        self.lock().containers.len()
    }

    /// Highest number of builds observed running at once
    pub fn max_concurrent_builds(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Package file names extraction produces for a distro, after normalization
    pub fn package_names(distro: &str) -> Vec<String> {
        vec![
            format!("kfx-bundle_1.0-{}-amd64.deb", distro),
            format!("xen-hypervisor_4.16-{}-amd64.deb", distro),
        ]
    }

    /// Decompressed contents of a package produced for a distro
    pub fn package_contents(name: &str) -> Vec<u8> {
        format!("debian-binary 2.0 {}\n", name).repeat(64).into_bytes()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        // A panicking test thread must not hide the recorded calls.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn count(&self, pred: impl Fn(&EngineCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: EngineCall) {
        self.lock().calls.push(call);
    }

    fn write_packages(distro: &str, dest: &Path) -> DistResult<()> {
        let io = |e| DistError::io(format!("writing fake packages for {}", distro), e);
        let names = Self::package_names(distro);

        let bundle_dir = dest.join("bundle");
        fs::create_dir_all(&bundle_dir).map_err(io)?;
        let bundle = bundle_dir.join(&names[0]);
        fs::write(&bundle, Self::package_contents(&names[0])).map_err(io)?;
        compress_oversized(&bundle, 0)?;

        fs::write(dest.join(&names[1]), Self::package_contents(&names[1])).map_err(io)?;
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ensure_ready(&self) -> DistResult<()> {
        Ok(())
    }

    async fn build_image(&self, request: &BuildRequest) -> DistResult<ImageRef> {
        self.record(EngineCall::Build {
            tag: request.tag.clone(),
            stage: request.stage.clone(),
        });

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if request.stage.is_some() {
            if self.fail_intermediate {
                return Err(DistError::build(
                    request.stage_label(),
                    "make dist-xen: Error 2",
                ));
            }
            self.lock().images.insert(request.tag.clone(), None);
            return Ok(ImageRef(request.tag.clone()));
        }

        if let Some(intermediate) = request.build_args.get("INTERMEDIATE_IMAGE") {
            if !self.lock().images.contains_key(intermediate) {
                return Err(DistError::build(
                    "final",
                    format!("pull access denied for {}", intermediate),
                ));
            }
        }

        let distro = request
            .build_args
            .get("DISTRO")
            .cloned()
            .unwrap_or_default();
        if self.failing_targets.contains(&distro) {
            return Err(DistError::build(
                "final",
                format!("dpkg-deb: error: failed to build package for {}", distro),
            ));
        }

        self.lock().images.insert(request.tag.clone(), Some(distro));
        Ok(ImageRef(request.tag.clone()))
    }

    async fn save_image(&self, image: &ImageRef, dest: &Path) -> DistResult<()> {
        self.record(EngineCall::Save {
            image: image.0.clone(),
        });
        if !self.lock().images.contains_key(&image.0) {
            return Err(DistError::command_exec("fake save", "no such image"));
        }
        fs::write(dest, format!("{}{}", IMAGE_MAGIC, image.0))
            .map_err(|e| DistError::io(format!("writing {}", dest.display()), e))
    }

    async fn load_image(&self, blob: &Path) -> DistResult<ImageRef> {
        let content = fs::read_to_string(blob)
            .map_err(|e| DistError::io(format!("reading {}", blob.display()), e))?;
        let tag = content
            .strip_prefix(IMAGE_MAGIC)
            .ok_or_else(|| DistError::command_exec("fake load", "invalid image archive"))?
            .to_string();

        self.record(EngineCall::Load { image: tag.clone() });
        self.lock().images.insert(tag.clone(), None);
        Ok(ImageRef(tag))
    }

    async fn create_container(&self, image: &ImageRef) -> DistResult<ContainerId> {
        let mut state = self.lock();
        if !state.images.contains_key(&image.0) {
            return Err(DistError::command_exec("fake create", "no such image"));
        }
        state.next_container += 1;
        let id = format!("fake{:012}", state.next_container);
        state.containers.insert(id.clone(), image.0.clone());
        state.calls.push(EngineCall::Create {
            id: id.clone(),
            image: image.0.clone(),
        });
        Ok(ContainerId(id))
    }

    async fn copy_from_container(
        &self,
        id: &ContainerId,
        path: &str,
        dest: &Path,
    ) -> DistResult<()> {
        let distro = {
            let mut state = self.lock();
            state.calls.push(EngineCall::Copy {
                id: id.0.clone(),
                path: path.to_string(),
            });
            let tag = state
                .containers
                .get(&id.0)
                .cloned()
                .ok_or_else(|| DistError::command_exec("fake cp", "no such container"))?;
            state.images.get(&tag).cloned().flatten().unwrap_or_default()
        };

        if self.failing_extract.contains(&distro) {
            return Err(DistError::command_exec(
                "fake cp",
                format!("could not find {} in container", path),
            ));
        }
        Self::write_packages(&distro, dest)
    }

    async fn remove_container(&self, id: &ContainerId) -> DistResult<()> {
        let mut state = self.lock();
        state.calls.push(EngineCall::Remove { id: id.0.clone() });
        state.containers.remove(&id.0);
        Ok(())
    }

    fn engine_name(&self) -> &'static str {
        "Fake"
    }
}
