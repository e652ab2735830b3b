//! Per-worker spec loop
//!
//! Claims specs until the queue is empty, running each through the
//! framework adapter under a [`HangDetector`]. A spec leaves the loop in
//! exactly one of two ways: reported completed (possibly as a timeout), or
//! handed back to the queue.

use chrono::Utc;
use specgrid_common::{
    ActivityClock, AppContext, CommandRunner, ControlPlane, Error, ErrorKind, ErrorReport,
    NodeEnvironment, Result, SpecCompleted, SpecQueue, SpecResult, SpecStarted,
    SupervisedProcess, TestRun,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::artifacts::upload_artifacts;
use crate::framework::{Framework, Invocation};
use crate::hang::{HangDetector, HangPolicy, Supervised};

/// How one claimed spec ended
#[derive(Debug, Clone, PartialEq)]
pub enum SpecOutcome {
    /// Every invocation produced results; reported completed.
    Finished(SpecResult),
    /// The hard deadline passed; reported completed with the timeout flag.
    TimedOut(SpecResult),
    /// A signal arrived first. The spec is handed back unless already reported.
    Interrupted,
    /// The run was cancelled or deleted while the spec was running.
    RunInactive,
}

/// Counts for the end-of-loop log line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub completed: u32,
    pub timed_out: u32,
}

pub struct RunnerSupervisor {
    ctx: Arc<AppContext>,
    run_id: i64,
    control: Arc<dyn ControlPlane>,
    queue: Arc<dyn SpecQueue>,
    runner: Arc<dyn CommandRunner>,
    framework: Box<dyn Framework>,
    node: NodeEnvironment,
    spec_deadline: Duration,
    base_url: String,
    server_activity: Option<ActivityClock>,
    cancel: CancellationToken,
}

impl RunnerSupervisor {
    pub fn new(
        ctx: Arc<AppContext>,
        run: &TestRun,
        control: Arc<dyn ControlPlane>,
        queue: Arc<dyn SpecQueue>,
        runner: Arc<dyn CommandRunner>,
        framework: Box<dyn Framework>,
        cancel: CancellationToken,
    ) -> Self {
        let settings = &ctx.settings;
        let node = NodeEnvironment::new(
            settings.src_dir(),
            settings.framework_cache_dir(),
            run.project.test_framework,
        );
        let spec_deadline = run
            .project
            .spec_deadline
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or_else(|| settings.spec_deadline());
        Self {
            run_id: run.id,
            ctx,
            control,
            queue,
            runner,
            framework,
            node,
            spec_deadline,
            base_url: String::new(),
            server_activity: None,
            cancel,
        }
    }

    /// Point the tests at the app and watch its traffic, if observable.
    pub fn with_app(mut self, base_url: impl Into<String>, activity: Option<ActivityClock>) -> Self {
        self.base_url = base_url.into();
        self.server_activity = activity;
        self
    }

    fn hang_policy(&self) -> HangPolicy {
        let settings = &self.ctx.settings;
        HangPolicy {
            poll_interval: settings.hang_poll_interval(),
            hang_threshold: settings.hang_threshold(),
            watch_output: settings.verbose_runner_output,
        }
    }

    /// Claim and run specs until the queue is empty or the run goes away.
    pub async fn run(&self) -> Result<LoopSummary> {
        let mut summary = LoopSummary::default();
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled("termination signal received".into()));
            }
            if !self.queue.is_active(self.run_id).await? {
                info!("Run {} is no longer active, stopping", self.run_id);
                break;
            }
            let Some(spec) = self.queue.claim(self.run_id, &self.ctx.worker_name).await? else {
                info!("No more specs for run {}", self.run_id);
                break;
            };

            match self.run_spec(&spec).await? {
                SpecOutcome::Finished(_) => summary.completed += 1,
                SpecOutcome::TimedOut(_) => {
                    summary.completed += 1;
                    summary.timed_out += 1;
                }
                SpecOutcome::RunInactive => {
                    info!("Run {} was cancelled during {}", self.run_id, spec);
                    break;
                }
                SpecOutcome::Interrupted => {
                    return Err(Error::Cancelled(format!("interrupted during {}", spec)));
                }
            }
        }
        info!(
            "Worker {} finished: {} specs completed, {} timed out",
            self.ctx.worker_name, summary.completed, summary.timed_out
        );
        Ok(summary)
    }

    /// Run one claimed spec. Errors and interruptions hand the spec back.
    pub async fn run_spec(&self, spec: &str) -> Result<SpecOutcome> {
        info!(spec, "Running spec");
        let completed = AtomicBool::new(false);
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(SpecOutcome::Interrupted),
            outcome = self.process_spec(spec, &completed) => outcome,
        };

        match outcome {
            Ok(SpecOutcome::Interrupted) => {
                if completed.load(Ordering::SeqCst) {
                    info!(spec, "Interrupted after completion, nothing to hand back");
                } else {
                    warn!(spec, "Interrupted, relinquishing spec");
                    self.give_back(spec).await;
                }
                Ok(SpecOutcome::Interrupted)
            }
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if e.kind() == ErrorKind::RecoverablePerSpec {
                    error!(spec, "Spec run failed: {}", e);
                    let report = ErrorReport {
                        message: e.to_string(),
                        stage: "running".to_string(),
                        error_code: e.exit_code(),
                    };
                    if let Err(re) = self.control.report_error(&report).await {
                        warn!("Failed to report error: {}", re);
                    }
                } else {
                    error!(spec, "Runner failed unexpectedly, returning spec: {}", e);
                }
                if !completed.load(Ordering::SeqCst) {
                    self.give_back(spec).await;
                }
                Err(e)
            }
        }
    }

    async fn give_back(&self, spec: &str) {
        if let Err(e) = self.queue.return_spec(self.run_id, spec).await {
            warn!(spec, "Failed to return spec: {}", e);
        }
    }

    async fn process_spec(&self, spec: &str, completed: &AtomicBool) -> Result<SpecOutcome> {
        self.control
            .spec_started(&SpecStarted {
                file: spec.to_string(),
                started_at: Utc::now(),
                worker_name: self.ctx.worker_name.clone(),
            })
            .await?;

        // One deadline covers every invocation of the spec.
        let deadline = Instant::now() + self.spec_deadline;
        let detector = HangDetector::new(
            self.hang_policy(),
            self.server_activity.clone(),
            self.queue.as_ref(),
            self.run_id,
        );

        let mut result = SpecResult::default();
        let mut timed_out = false;
        for invocation in self.framework.invocations(spec, &self.base_url) {
            if timed_out {
                warn!(spec, "Deadline passed, skipping {:?}", invocation.browser);
                break;
            }
            let supervised = detector
                .supervise(|| self.launch(&invocation), deadline, &self.cancel)
                .await?;
            match supervised {
                Supervised::Exited { exit, restarts } => {
                    let collected = self.framework.collect(&invocation)?.ok_or_else(|| {
                        Error::RunFailed(format!(
                            "Missing results file (exit code {:?}, {} restarts)",
                            exit.code, restarts
                        ))
                    })?;
                    result.merge(collected);
                }
                Supervised::DeadlineExceeded { restarts } => {
                    warn!(
                        spec,
                        "Hard deadline of {:?} exceeded after {} restarts",
                        self.spec_deadline,
                        restarts
                    );
                    timed_out = true;
                    match self.framework.collect(&invocation) {
                        Ok(Some(partial)) => result.merge(partial),
                        Ok(None) => {}
                        Err(e) => warn!(spec, "Ignoring unreadable partial results: {}", e),
                    }
                }
                Supervised::Cancelled => return Ok(SpecOutcome::Interrupted),
                Supervised::RunInactive => return Ok(SpecOutcome::RunInactive),
            }
        }
        result.timeout |= timed_out;

        upload_artifacts(self.control.as_ref(), &mut result).await;
        self.control
            .spec_completed(&SpecCompleted {
                file: spec.to_string(),
                finished_at: Utc::now(),
                result: result.clone(),
            })
            .await?;
        completed.store(true, Ordering::SeqCst);
        info!(
            spec,
            "Spec completed: {} tests{}",
            result.tests.len(),
            if result.timeout { " (timed out)" } else { "" }
        );

        Ok(if timed_out {
            SpecOutcome::TimedOut(result)
        } else {
            SpecOutcome::Finished(result)
        })
    }

    fn launch(&self, invocation: &Invocation) -> Result<Box<dyn SupervisedProcess>> {
        reset_dir(&invocation.results_dir)?;
        self.runner.spawn(&self.node.prepare(invocation.command.clone()))
    }
}

fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)?;
    Ok(())
}
