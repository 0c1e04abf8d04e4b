//! Output tree normalization
//!
//! Turns the raw extraction tree (`<root>/<target>/...`, some files carrying
//! the compression marker) into a flat directory of packages:
//!
//! 1. marked files are decompressed next to themselves under their logical name
//! 2. every file below the root moves up into the root
//! 3. directories left empty are removed
//!
//! A name already taken in the root keeps its first occupant; the newcomer
//! stays where it is and a warning is logged. Running the normalizer on its
//! own output changes nothing.

use crate::artifact::{is_compressed_name, logical_name, ArtifactFile};
use crate::error::{DistError, DistResult};
use flate2::read::MultiGzDecoder;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Suffix of in-flight decompression output
const PARTIAL_SUFFIX: &str = ".partial";

/// Summary of one normalization pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct NormalizeReport {
    /// Flat output directory
    pub root: PathBuf,
    /// Files directly in the root afterwards, sorted by name
    pub artifacts: Vec<ArtifactFile>,
    /// Marked files successfully decompressed
    pub decompressed: usize,
    /// Files moved up into the root
    pub moved: usize,
    /// Files left in place because their name was already taken
    pub collisions: Vec<PathBuf>,
    /// Non-fatal problems, one line each
    pub diagnostics: Vec<String>,
    /// Empty directories removed
    pub removed_dirs: usize,
}

/// Flattens raw per-target output into one directory
#[derive(Debug, Clone, Default)]
pub struct ArtifactNormalizer;

impl ArtifactNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Normalize the tree under `root` in place
    pub fn normalize(&self, root: &Path) -> DistResult<NormalizeReport> {
        if !root.is_dir() {
            return Err(DistError::io(
                format!("normalizing {}", root.display()),
                io::Error::new(io::ErrorKind::NotFound, "output directory does not exist"),
            ));
        }

        let mut report = NormalizeReport {
            root: root.to_path_buf(),
            ..Default::default()
        };

        for path in list_files(root)? {
            if is_partial(&path) {
                debug!("Removing interrupted decompression {}", path.display());
                let _ = fs::remove_file(&path);
                continue;
            }

            let path = if is_compressed_name(&path) {
                match decompress(&path) {
                    Ok(Some(plain)) => {
                        report.decompressed += 1;
                        plain
                    }
                    Ok(None) => {
                        report.collisions.push(path);
                        continue;
                    }
                    Err(e) => {
                        warn!("{}", e);
                        report.diagnostics.push(e.to_string());
                        continue;
                    }
                }
            } else {
                path
            };

            place(root, &path, &mut report)?;
        }

        report.removed_dirs = remove_empty_dirs(root)?;
        report.artifacts = list_root_artifacts(root)?;

        info!(
            "Normalized {}: {} artifact(s), {} decompressed, {} moved",
            root.display(),
            report.artifacts.len(),
            report.decompressed,
            report.moved
        );
        Ok(report)
    }
}

fn walk_error(root: &Path, e: walkdir::Error) -> DistError {
    let context = format!(
        "walking {}",
        e.path().unwrap_or(root).display()
    );
    let source = e
        .into_io_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "filesystem loop"));
    DistError::io(context, source)
}

/// All regular files under `root`, sorted by path
fn list_files(root: &Path) -> DistResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| walk_error(root, e))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn is_partial(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') && n.ends_with(PARTIAL_SUFFIX))
        .unwrap_or(false)
}

/// Decompress a marked file into its logical name beside it.
///
/// Returns `Ok(None)` when the logical name is already taken. On failure the
/// marked file is left exactly as it was.
fn decompress(path: &Path) -> DistResult<Option<PathBuf>> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| DistError::Decompression {
            path: path.to_path_buf(),
            reason: "file name is not valid UTF-8".to_string(),
        })?;
    let logical = logical_name(name);
    let target = path.with_file_name(logical);

    if fs::symlink_metadata(&target).is_ok() {
        warn!(
            "{} already exists, leaving {} compressed",
            target.display(),
            path.display()
        );
        return Ok(None);
    }

    let partial = path.with_file_name(format!(".{}{}", logical, PARTIAL_SUFFIX));
    let result = gunzip(path, &partial).and_then(|()| fs::rename(&partial, &target));
    if let Err(e) = result {
        let _ = fs::remove_file(&partial);
        return Err(DistError::Decompression {
            path: path.to_path_buf(),
            reason: e.to_string(),
        });
    }

    fs::remove_file(path)
        .map_err(|e| DistError::io(format!("removing {}", path.display()), e))?;
    debug!("Decompressed {} -> {}", path.display(), target.display());
    Ok(Some(target))
}

fn gunzip(src: &Path, dst: &Path) -> io::Result<()> {
    // pigz and concatenated archives carry several gzip members.
    let mut decoder = MultiGzDecoder::new(BufReader::new(File::open(src)?));
    let mut writer = BufWriter::new(File::create(dst)?);
    io::copy(&mut decoder, &mut writer)?;
    writer.flush()
}

/// Move a file up into the root unless it is already there or the name is taken
fn place(root: &Path, path: &Path, report: &mut NormalizeReport) -> DistResult<()> {
    if path.parent() == Some(root) {
        return Ok(());
    }

    let Some(name) = path.file_name() else {
        return Ok(());
    };
    let dest = root.join(name);

    if fs::symlink_metadata(&dest).is_ok() {
        warn!(
            "{} already exists in output, keeping the first and leaving {}",
            name.to_string_lossy(),
            path.display()
        );
        report.collisions.push(path.to_path_buf());
        return Ok(());
    }

    fs::rename(path, &dest).map_err(|e| {
        DistError::io(
            format!("moving {} to {}", path.display(), dest.display()),
            e,
        )
    })?;
    report.moved += 1;
    Ok(())
}

/// Remove empty directories below `root`, deepest first
fn remove_empty_dirs(root: &Path) -> DistResult<usize> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).contents_first(true) {
        let entry = entry.map_err(|e| walk_error(root, e))?;
        if entry.file_type().is_dir() {
            dirs.push(entry.into_path());
        }
    }

    let mut removed = 0;
    for dir in dirs {
        let empty = fs::read_dir(&dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if empty {
            fs::remove_dir(&dir)
                .map_err(|e| DistError::io(format!("removing {}", dir.display()), e))?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn list_root_artifacts(root: &Path) -> DistResult<Vec<ArtifactFile>> {
    let mut artifacts = Vec::new();
    let entries = fs::read_dir(root)
        .map_err(|e| DistError::io(format!("reading {}", root.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| DistError::io(format!("reading {}", root.display()), e))?;
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            artifacts.push(ArtifactFile::inspect(&entry.path())?);
        }
    }
    artifacts.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::compress_oversized;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &[u8]) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    fn write_marked(root: &Path, rel: &str, content: &[u8]) -> PathBuf {
        let plain = write(root, rel, content);
        compress_oversized(&plain, 0).unwrap().unwrap()
    }

    /// Relative path -> contents for every file and empty dir marker
    fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
        WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .map(|e| e.unwrap())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap().display().to_string();
                let content = if e.file_type().is_file() {
                    fs::read(e.path()).unwrap()
                } else {
                    b"<dir>".to_vec()
                };
                (rel, content)
            })
            .collect()
    }

    #[test]
    fn compressed_artifact_round_trip() {
        let dir = TempDir::new().unwrap();
        let payload = b"!<arch>\ndebian-binary   2.0\n".repeat(100);
        write_marked(dir.path(), "focal/pkg.deb", &payload);
        assert!(dir.path().join("focal/pkg.deb.gz__").exists());

        let report = ArtifactNormalizer::new().normalize(dir.path()).unwrap();

        assert_eq!(fs::read(dir.path().join("pkg.deb")).unwrap(), payload);
        assert!(!dir.path().join("focal").exists());
        assert_eq!(report.decompressed, 1);
        assert_eq!(report.moved, 1);
        assert_eq!(report.artifacts.len(), 1);
        assert!(!report.artifacts[0].compressed);
    }

    #[test]
    fn multi_member_gzip_fully_decompressed() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let dir = TempDir::new().unwrap();
        let marked = dir.path().join("focal/kfx-bundle.deb.gz__");
        fs::create_dir_all(marked.parent().unwrap()).unwrap();

        let mut joined = Vec::new();
        for part in [&b"first-half|"[..], &b"second-half"[..]] {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(part).unwrap();
            joined.extend(encoder.finish().unwrap());
        }
        fs::write(&marked, joined).unwrap();

        let report = ArtifactNormalizer::new().normalize(dir.path()).unwrap();

        assert!(report.diagnostics.is_empty());
        assert_eq!(
            fs::read(dir.path().join("kfx-bundle.deb")).unwrap(),
            b"first-half|second-half"
        );
    }

    #[test]
    fn nested_outputs_are_flattened() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "focal/debs/xen_4.16-focal.deb", b"focal");
        write(dir.path(), "jammy/xen_4.16-jammy.deb", b"jammy");

        let report = ArtifactNormalizer::new().normalize(dir.path()).unwrap();

        assert_eq!(
            snapshot(dir.path()),
            BTreeMap::from([
                ("xen_4.16-focal.deb".to_string(), b"focal".to_vec()),
                ("xen_4.16-jammy.deb".to_string(), b"jammy".to_vec()),
            ])
        );
        assert_eq!(report.removed_dirs, 3);
    }

    #[test]
    fn collision_keeps_first() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "bionic/kfx.deb", b"first");
        write(dir.path(), "focal/kfx.deb", b"second");

        let report = ArtifactNormalizer::new().normalize(dir.path()).unwrap();

        assert_eq!(fs::read(dir.path().join("kfx.deb")).unwrap(), b"first");
        assert_eq!(fs::read(dir.path().join("focal/kfx.deb")).unwrap(), b"second");
        assert_eq!(report.collisions, vec![dir.path().join("focal/kfx.deb")]);
    }

    #[test]
    fn corrupt_compressed_file_left_untouched() {
        let dir = TempDir::new().unwrap();
        let bad = write(dir.path(), "jammy/bundle.deb.gz__", b"not gzip at all");
        write(dir.path(), "jammy/xen.deb", b"xen");

        let report = ArtifactNormalizer::new().normalize(dir.path()).unwrap();

        assert_eq!(fs::read(&bad).unwrap(), b"not gzip at all");
        assert!(!dir.path().join("jammy/bundle.deb").exists());
        assert!(!dir.path().join("bundle.deb").exists());
        assert!(dir.path().join("xen.deb").exists());
        assert_eq!(report.diagnostics.len(), 1);
        assert!(report.diagnostics[0].contains("bundle.deb.gz__"));
        assert!(fs::read_dir(dir.path().join("jammy"))
            .unwrap()
            .all(|e| !is_partial(&e.unwrap().path())));
    }

    #[test]
    fn normalize_is_idempotent() {
        let dir = TempDir::new().unwrap();
        write_marked(dir.path(), "buster/bundle/kfx-bundle.deb", &[1u8; 2048]);
        write(dir.path(), "buster/xen-buster.deb", b"buster");
        write(dir.path(), "bionic/xen-buster.deb", b"dup");
        write(dir.path(), "bionic/broken.deb.gz__", b"garbage");

        let normalizer = ArtifactNormalizer::new();
        normalizer.normalize(dir.path()).unwrap();
        let once = snapshot(dir.path());

        let second = normalizer.normalize(dir.path()).unwrap();
        assert_eq!(snapshot(dir.path()), once);
        assert_eq!(second.decompressed, 0);
        assert_eq!(second.moved, 0);
        assert_eq!(second.removed_dirs, 0);
    }

    #[test]
    fn stale_partial_files_removed() {
        let dir = TempDir::new().unwrap();
        let partial = write(dir.path(), "focal/.pkg.deb.partial", b"half");

        ArtifactNormalizer::new().normalize(dir.path()).unwrap();

        assert!(!partial.exists());
        assert!(!dir.path().join(".pkg.deb.partial").exists());
    }

    #[test]
    fn missing_root_is_error() {
        let dir = TempDir::new().unwrap();
        assert!(ArtifactNormalizer::new()
            .normalize(&dir.path().join("missing"))
            .is_err());
    }
}
