//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser};
use std::path::PathBuf;

/// kfx-dist - build KF/x and Xen packages for every supported distro
///
/// Builds the from-source Xen stage once (cached across runs), then one
/// final image per distribution, and collects the produced packages into a
/// single output directory.
#[derive(Parser, Debug)]
#[command(name = "kfx-dist")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Target to build: a distro codename or "all"
    pub target: Option<String>,

    /// Directory receiving the packages [default: new directory under the temp dir]
    pub output_dir: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, env = "KFX_DIST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Maximum number of targets built at once
    #[arg(short, long, value_parser = parse_jobs)]
    pub jobs: Option<usize>,

    /// Discard the cached Xen stage and build it again
    #[arg(long)]
    pub rebuild: bool,

    /// Container engine program (docker, podman)
    #[arg(long)]
    pub engine: Option<String>,

    /// Write a JSON run report to this path
    #[arg(long, value_name = "PATH")]
    pub report: Option<PathBuf>,

    /// List known targets and exit
    #[arg(long, conflicts_with_all = ["target", "init_config"])]
    pub list_targets: bool,

    /// Write the default configuration file and exit
    #[arg(long, conflicts_with = "target")]
    pub init_config: bool,

    /// Overwrite an existing file with --init-config
    #[arg(long, requires = "init_config")]
    pub force: bool,
}

fn parse_jobs(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}
