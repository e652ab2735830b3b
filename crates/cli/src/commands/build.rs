//! `specgrid build`

use anyhow::{Context, Result};
use clap::Args;
use specgrid_builder::{BuildOutcome, BuildPipeline};
use specgrid_common::{open_blob_store, AppContext, HttpControlPlane, SystemCommandRunner};
use std::sync::Arc;
use tracing::info;

#[derive(Args)]
pub struct BuildArgs {
    /// Test run to build
    pub run_id: i64,
}

pub async fn execute(args: BuildArgs, ctx: Arc<AppContext>) -> Result<()> {
    let settings = &ctx.settings;
    let control = Arc::new(HttpControlPlane::new(settings, args.run_id)?);
    let store = open_blob_store(settings).await?;
    let runner = Arc::new(SystemCommandRunner::new());

    let outcome = BuildPipeline::new(ctx.clone(), control, store, runner)
        .run()
        .await
        .with_context(|| format!("build of test run {} failed", args.run_id))?;

    let report = outcome.report();
    for (stage, took) in &report.stages {
        info!("  {:<24} {:>8.1}s", stage.to_string(), took.as_secs_f64());
    }
    match &outcome {
        BuildOutcome::Published(r) => info!(
            "Built {} with {} specs (dependency cache {})",
            r.sha,
            r.specs.len(),
            if r.cache_hit { "hit" } else { "miss" }
        ),
        BuildOutcome::NothingToTest(r) => info!("No specs in {}, run passed", r.sha),
    }
    Ok(())
}
