//! `specgrid run`

use anyhow::{Context, Result};
use clap::Args;
use specgrid_common::{open_blob_store, AppContext, HttpControlPlane, SystemCommandRunner};
use specgrid_runner::{cancel_on_signals, Worker, WorkerExit};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Args)]
pub struct RunArgs {
    /// Test run whose specs to work through
    pub run_id: i64,
}

pub async fn execute(args: RunArgs, ctx: Arc<AppContext>) -> Result<()> {
    let settings = &ctx.settings;
    let control = Arc::new(HttpControlPlane::new(settings, args.run_id)?);
    let store = open_blob_store(settings).await?;
    let runner = Arc::new(SystemCommandRunner::new());

    let cancel = CancellationToken::new();
    let signals = cancel_on_signals(cancel.clone()).context("installing signal handlers")?;

    info!("Worker {} starting on test run {}", ctx.worker_name, args.run_id);
    let exit = Worker::new(ctx.clone(), control, store, runner, cancel.clone())
        .run()
        .await
        .with_context(|| format!("worker for test run {} failed", args.run_id));
    // Stops the signal listener.
    cancel.cancel();
    signals.abort();

    match exit? {
        WorkerExit::RunMissing => info!("Test run {} does not exist", args.run_id),
        WorkerExit::RunFinished => info!("Test run {} already finished", args.run_id),
        WorkerExit::Drained(summary) => info!(
            "Done: {} specs completed, {} timed out",
            summary.completed, summary.timed_out
        ),
    }
    Ok(())
}
