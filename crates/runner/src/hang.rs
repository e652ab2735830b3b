//! Hang detection for the test framework process
//!
//! A process counts as hung only when every enabled liveness signal has been
//! idle past the threshold. The signals are its own output (when verbose
//! output is on) and requests reaching the app server (when this worker
//! serves the app). With no signal enabled a process is never hung, and only
//! the hard deadline ends it.
//!
//! A hung process is killed and relaunched from scratch. Restarts are bounded
//! by the deadline, not by a count.

use specgrid_common::{ActivityClock, ExitInfo, Result, SpecQueue, SupervisedProcess};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct HangPolicy {
    pub poll_interval: Duration,
    pub hang_threshold: Duration,
    /// Whether process output counts as a liveness signal
    pub watch_output: bool,
}

/// How supervision ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supervised {
    Exited { exit: ExitInfo, restarts: u32 },
    /// The hard deadline passed; the process has been killed.
    DeadlineExceeded { restarts: u32 },
    /// The cancellation token fired; the process has been killed.
    Cancelled,
    /// The run stopped being active while a restart was pending.
    RunInactive,
}

pub struct HangDetector<'a> {
    policy: HangPolicy,
    server_activity: Option<ActivityClock>,
    queue: &'a dyn SpecQueue,
    run_id: i64,
}

impl<'a> HangDetector<'a> {
    pub fn new(
        policy: HangPolicy,
        server_activity: Option<ActivityClock>,
        queue: &'a dyn SpecQueue,
        run_id: i64,
    ) -> Self {
        Self {
            policy,
            server_activity,
            queue,
            run_id,
        }
    }

    /// Launch a process and watch it until it exits, hits `deadline`, or is cancelled.
    pub async fn supervise<F>(
        &self,
        mut launch: F,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Supervised>
    where
        F: FnMut() -> Result<Box<dyn SupervisedProcess>>,
    {
        let mut restarts = 0u32;
        let mut process = launch()?;
        let mut launched = Instant::now();

        loop {
            let now = Instant::now();
            if now >= deadline {
                warn!("Spec deadline exceeded after {} restarts, killing", restarts);
                process.kill().await?;
                return Ok(Supervised::DeadlineExceeded { restarts });
            }

            let wait = self.policy.poll_interval.min(deadline - now);
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                exit = process.wait_timeout(wait) => Some(exit?),
            };
            match polled {
                None => {
                    info!("Cancelled, killing runner process");
                    process.kill().await?;
                    return Ok(Supervised::Cancelled);
                }
                Some(Some(exit)) => return Ok(Supervised::Exited { exit, restarts }),
                Some(None) => {}
            }

            if !self.is_hung(process.as_ref(), launched) {
                continue;
            }

            warn!(
                "Runner process hung (no activity for {:?}); killing. Last output:\n{}",
                self.policy.hang_threshold,
                process.output_tail()
            );
            process.kill().await?;

            if Instant::now() >= deadline {
                return Ok(Supervised::DeadlineExceeded { restarts });
            }
            if !self.run_is_active().await {
                info!("Run {} is no longer active, not restarting", self.run_id);
                return Ok(Supervised::RunInactive);
            }

            restarts += 1;
            info!("Restarting runner process (restart {})", restarts);
            process = launch()?;
            launched = Instant::now();
        }
    }

    fn is_hung(&self, process: &dyn SupervisedProcess, launched: Instant) -> bool {
        let now = Instant::now();
        let mut idle = Vec::with_capacity(2);
        if self.policy.watch_output {
            let last = process
                .last_output()
                .filter(|t| *t > launched)
                .unwrap_or(launched);
            idle.push(now.saturating_duration_since(last));
        }
        if let Some(clock) = &self.server_activity {
            idle.push(clock.idle_since(launched));
        }
        debug!("Liveness idle times: {:?}", idle);
        !idle.is_empty() && idle.iter().all(|d| *d >= self.policy.hang_threshold)
    }

    /// A failed check counts as active; only a definite "gone" stops restarts.
    async fn run_is_active(&self) -> bool {
        match self.queue.is_active(self.run_id).await {
            Ok(active) => active,
            Err(e) => {
                warn!("Could not check run {}: {}", self.run_id, e);
                true
            }
        }
    }
}
