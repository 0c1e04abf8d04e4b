//! Build command - run the pipeline and print a per-target summary

use crate::cache::DiskCache;
use crate::cli::Cli;
use crate::config::{Config, ConfigManager};
use crate::engine::{create_engine, ContainerEngine};
use crate::error::DistResult;
use crate::orchestrator::{Orchestrator, Outcome};
use crate::pipeline::{default_output_dir, Pipeline, RunReport};
use crate::target::TargetSelector;
use crate::ui::{self, UiContext};
use std::sync::Arc;
use tracing::debug;

/// Execute the build command, returning the process exit code
pub async fn execute(cli: &Cli, target: &str, config: &Config) -> DistResult<u8> {
    let selector = TargetSelector::parse(target);

    // An unknown target is a usage error; report it before probing the engine.
    selector.resolve(&config.targets)?;

    let engine: Arc<dyn ContainerEngine> = Arc::from(create_engine(config));
    engine.ensure_ready().await?;
    debug!("Using {} ({})", engine.engine_name(), config.engine.program);

    let cache = Arc::new(DiskCache::new(ConfigManager::cache_dir(config)));

    let mut orchestrator = Orchestrator::new(engine, cache, config).with_rebuild(cli.rebuild);
    if let Some(jobs) = cli.jobs {
        orchestrator = orchestrator.with_jobs(jobs);
    }

    let output_dir = cli.output_dir.clone().unwrap_or_else(default_output_dir);
    let report = Pipeline::new(orchestrator)
        .with_report(cli.report.clone())
        .run(&selector, &output_dir)
        .await?;

    print_summary(&UiContext::detect(), &report);
    Ok(report.exit_code())
}

/// Print which targets succeeded, which failed and why
pub fn print_summary(ctx: &UiContext, report: &RunReport) {
    ui::intro(ctx, &format!("kfx-dist {}", report.selector));

    for result in &report.results {
        if result.is_success() {
            let detail = format!(
                "{} file(s), {:.1}s",
                result.output_files.len(),
                result.duration_ms as f64 / 1000.0
            );
            ui::step_ok_detail(ctx, &result.target, &detail);
        } else {
            let mut lines = result.diagnostics.iter().flat_map(|d| d.lines());
            let reason = lines.next().unwrap_or("unknown error");
            ui::step_error_detail(ctx, &result.target, reason);
            if let Some(hint) = result.diagnostics.iter().find(|d| d.starts_with("hint: ")) {
                ui::remark(ctx, hint);
            }
        }
    }

    for path in &report.normalize.collisions {
        ui::step_warn(
            ctx,
            &format!("{} left in place: name already taken in output", path.display()),
        );
    }
    for diagnostic in &report.normalize.diagnostics {
        ui::step_warn(ctx, diagnostic);
    }

    println!();
    ui::key_value(ctx, "Output", &report.output_dir.display().to_string());
    ui::key_value(ctx, "Packages", &report.normalize.artifacts.len().to_string());

    match &report.outcome {
        Outcome::Success => ui::outro_success(
            ctx,
            &format!("All {} target(s) built", report.results.len()),
        ),
        Outcome::PartialFailure { failed } => {
            ui::outro_error(ctx, &format!("Failed targets: {}", failed.join(", ")))
        }
        Outcome::TotalFailure { .. } => ui::outro_error(ctx, "No target was built"),
    }
}
