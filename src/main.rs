//! kfx-dist - multi-distro package builds for KF/x and Xen
//!
//! CLI entry point: parses arguments, loads configuration, sets up logging
//! and dispatches to a command.

use clap::{CommandFactory, Parser};
use console::style;
use kfx_dist::cli::{commands, Cli};
use kfx_dist::config::ConfigManager;
use kfx_dist::error::DistResult;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> DistResult<u8> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };

    // Init command doesn't need config loading
    if cli.init_config {
        init_logging(cli.verbose, "text");
        commands::init(&config_manager, cli.force).await?;
        return Ok(0);
    }

    let mut config = config_manager.load().await?;
    init_logging(cli.verbose, &config.general.log_format);
    debug!("Configuration: {}", config_manager.path().display());

    if let Some(ref engine) = cli.engine {
        config.engine.program = engine.clone();
    }

    if cli.list_targets {
        commands::list(&config);
        return Ok(0);
    }

    let Some(target) = cli.target.as_deref() else {
        eprintln!("{}", Cli::command().render_usage());
        eprintln!();
        eprintln!("TARGET is required: a distro codename or \"all\" (see --list-targets)");
        return Ok(1);
    };

    commands::build(&cli, target, &config).await
}

/// Logging to stderr: 0 = warn, 1 = info, 2+ = debug. RUST_LOG wins when set.
fn init_logging(verbose: u8, format: &str) {
    let default = match verbose {
        0 => "kfx_dist=warn",
        1 => "kfx_dist=info",
        _ => "kfx_dist=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .init();
    }
}
