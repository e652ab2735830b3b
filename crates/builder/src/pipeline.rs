//! Build pipeline
//!
//! One pass per test run: clone, install dependencies (from cache when the
//! lockfile hash is known), discover specs, build the app, publish. Any
//! fatal error is reported with the stage it happened in, the run is marked
//! failed, and the error is returned so the process exits non-zero.

use specgrid_common::archive::{archive_name, create_archive};
use specgrid_common::cache::DEPENDENCY_PATHS;
use specgrid_common::{
    discover_specs, AppContext, BlobStore, BuildCache, BuildCompleted, BuildStage, CommandRunner,
    CommandSpec, ControlPlane, Error, ErrorReport, NodeEnvironment, Result, TestRun,
    TestRunStatus,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::checkout::GitCheckout;
use crate::install::{prime_command, PackageManager};

/// Directory names left out of the application artifact
pub const APP_ARTIFACT_EXCLUDES: [&str; 3] = ["node_modules", ".git", "framework_cache"];

/// What a finished pipeline produced
#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    /// Artifact uploaded and specs handed to the control plane
    Published(BuildReport),
    /// No specs matched; the run was marked passed without building
    NothingToTest(BuildReport),
}

impl BuildOutcome {
    pub fn report(&self) -> &BuildReport {
        match self {
            BuildOutcome::Published(r) | BuildOutcome::NothingToTest(r) => r,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildReport {
    pub sha: String,
    pub cache_key: String,
    pub cache_hit: bool,
    pub specs: Vec<String>,
    /// Time spent in each stage, in order
    pub stages: Vec<(BuildStage, Duration)>,
}

/// Tracks the current stage and how long each one took
struct StageClock {
    run_id: i64,
    current: BuildStage,
    entered: Instant,
    durations: Vec<(BuildStage, Duration)>,
}

impl StageClock {
    fn new(run_id: i64) -> Self {
        info!(run_id, stage = %BuildStage::Cloning, "Build started");
        Self {
            run_id,
            current: BuildStage::Cloning,
            entered: Instant::now(),
            durations: Vec::new(),
        }
    }

    fn enter(&mut self, next: BuildStage) {
        let elapsed = self.entered.elapsed();
        self.durations.push((self.current, elapsed));
        info!(
            run_id = self.run_id,
            stage = %next,
            "{} -> {} ({:.1}s)",
            self.current,
            next,
            elapsed.as_secs_f64()
        );
        self.current = next;
        self.entered = Instant::now();
    }
}

pub struct BuildPipeline {
    ctx: Arc<AppContext>,
    control: Arc<dyn ControlPlane>,
    store: Arc<dyn BlobStore>,
    runner: Arc<dyn CommandRunner>,
}

impl BuildPipeline {
    pub fn new(
        ctx: Arc<AppContext>,
        control: Arc<dyn ControlPlane>,
        store: Arc<dyn BlobStore>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            ctx,
            control,
            store,
            runner,
        }
    }

    /// Run every stage for the control plane's test run.
    pub async fn run(&self) -> Result<BuildOutcome> {
        let run_id = self.control.run_id();
        let run = self
            .control
            .fetch_testrun()
            .await?
            .ok_or_else(|| Error::BuildFailed(format!("test run {} does not exist", run_id)))?;
        if run.status.is_terminal() {
            return Err(Error::Cancelled(format!(
                "test run {} is already {}",
                run_id, run.status
            )));
        }

        self.control.set_status(TestRunStatus::Building).await?;

        let mut clock = StageClock::new(run_id);
        let mut report = BuildReport::default();
        let result = self.execute(&run, &mut clock, &mut report).await;

        match result {
            Ok(nothing_to_test) => {
                clock.enter(BuildStage::Done);
                report.stages = std::mem::take(&mut clock.durations);
                if nothing_to_test {
                    Ok(BuildOutcome::NothingToTest(report))
                } else {
                    Ok(BuildOutcome::Published(report))
                }
            }
            Err(e) => {
                let stage = clock.current;
                clock.enter(BuildStage::Failed);
                self.report_failure(stage, &e).await;
                Err(e)
            }
        }
    }

    /// Returns `true` when the run was short-circuited for lack of specs.
    async fn execute(
        &self,
        run: &TestRun,
        clock: &mut StageClock,
        report: &mut BuildReport,
    ) -> Result<bool> {
        let settings = &self.ctx.settings;
        let src = settings.src_dir();
        let framework = run.project.test_framework;
        let node = NodeEnvironment::new(&src, settings.framework_cache_dir(), framework);

        report.sha = GitCheckout::new(self.runner.as_ref(), settings.build_timeout())
            .checkout(run.clone_url(), &run.branch, run.sha.as_deref(), &src)
            .await?;
        info!(run_id = run.id, sha = %report.sha, "Checked out {}", run.branch);

        clock.enter(BuildStage::InstallingDependencies);
        let (cache_key, cache_hit) = self.install_dependencies(&node).await?;
        report.cache_key = cache_key;
        report.cache_hit = cache_hit;

        clock.enter(BuildStage::DiscoveringSpecs);
        report.specs = discover_specs(&src, framework, run.project.spec_filter.as_deref())?;
        if report.specs.is_empty() {
            info!(run_id = run.id, "No specs found; nothing to test");
            self.announce(report).await?;
            self.control.set_status(TestRunStatus::Passed).await?;
            return Ok(true);
        }

        clock.enter(BuildStage::BuildingApp);
        self.build_app(run, &node).await?;

        clock.enter(BuildStage::Publishing);
        self.publish(&src, report).await?;
        Ok(false)
    }

    /// Returns the cache key and whether the cache supplied the dependencies.
    async fn install_dependencies(&self, node: &NodeEnvironment) -> Result<(String, bool)> {
        let settings = &self.ctx.settings;
        let pm = PackageManager::detect(&node.src_dir)?;
        let key = BuildCache::compute_key_for_file(node.src_dir.join(pm.lockfile())).await?;
        debug!("Dependency cache key {} from {}", key, pm.lockfile());

        let cache = BuildCache::new(self.store.clone(), settings.tmp_dir(), settings.build_timeout());
        if self.restore_dependencies(&cache, &key, node).await {
            return Ok((key, true));
        }

        for dir in [node.src_dir.join("node_modules"), node.framework_cache_dir.clone()] {
            if fs::try_exists(&dir).await? {
                fs::remove_dir_all(&dir).await?;
            }
        }
        fs::create_dir_all(&node.framework_cache_dir).await?;

        let timeout = settings.build_timeout();
        self.runner
            .stream(&node.prepare(pm.install_command()).timeout(timeout))
            .await?;
        self.runner
            .stream(&node.prepare(prime_command(node.framework)).timeout(timeout))
            .await?;

        cache.store(&key, &settings.build_dir, &DEPENDENCY_PATHS).await;
        Ok((key, false))
    }

    /// Any failure here means "install from scratch", never a failed build.
    async fn restore_dependencies(
        &self,
        cache: &BuildCache,
        key: &str,
        node: &NodeEnvironment,
    ) -> bool {
        match cache.exists(key).await {
            Ok(true) => {}
            Ok(false) => {
                info!("Dependency cache miss for {}", key);
                return false;
            }
            Err(e) => {
                warn!("Dependency cache probe failed, installing: {}", e);
                return false;
            }
        }

        if let Err(e) = cache.fetch(key, &self.ctx.settings.build_dir).await {
            warn!("Dependency cache unusable, installing: {}", e);
            return false;
        }
        if !node.src_dir.join("node_modules").is_dir() {
            warn!("Dependency cache {} has no node_modules, installing", key);
            return false;
        }
        info!("Dependency cache hit for {}", key);
        true
    }

    async fn build_app(&self, run: &TestRun, node: &NodeEnvironment) -> Result<()> {
        if let Some(build_cmd) = &run.project.build_cmd {
            let cmd = node
                .prepare(CommandSpec::shell(build_cmd))
                .timeout(self.ctx.settings.build_timeout());
            self.runner.stream(&cmd).await?;
        }

        // Projects with their own server produce no static output.
        if run.project.server_cmd.is_some() {
            return Ok(());
        }

        let output_dir = node.src_dir.join(&run.project.build_output_dir);
        if !fs::try_exists(&output_dir).await? {
            return Err(Error::BuildFailed(
                "No dist directory: please check your build command".to_string(),
            ));
        }
        if !fs::try_exists(output_dir.join("index.html")).await? {
            return Err(Error::BuildFailed(
                "Could not find index.html file in dist directory".to_string(),
            ));
        }
        Ok(())
    }

    async fn publish(&self, src: &Path, report: &BuildReport) -> Result<()> {
        let name = archive_name(&report.sha);
        let local = self.ctx.settings.tmp_dir().join(&name);
        let size = create_archive(src, &["."], &APP_ARTIFACT_EXCLUDES, &local).await?;
        let budget = self.ctx.settings.build_timeout();
        tokio::time::timeout(budget, self.store.upload(&name, &local))
            .await
            .map_err(|_| {
                Error::BuildFailed(format!(
                    "uploading {} exceeded {}s",
                    name,
                    budget.as_secs()
                ))
            })??;
        info!("Published {} ({} bytes)", name, size);
        if let Err(e) = fs::remove_file(&local).await {
            debug!("Could not remove {:?}: {}", local, e);
        }

        self.announce(report).await
    }

    /// Hand the resolved commit, cache key and spec list to the control plane.
    async fn announce(&self, report: &BuildReport) -> Result<()> {
        self.control
            .build_completed(&BuildCompleted {
                sha: report.sha.clone(),
                cache_key: report.cache_key.clone(),
                specs: report.specs.clone(),
            })
            .await?;
        info!("Handed {} specs to the control plane", report.specs.len());
        Ok(())
    }

    async fn report_failure(&self, stage: BuildStage, err: &Error) {
        error!(run_id = self.control.run_id(), stage = %stage, "Build failed: {}", err);
        let message = match err {
            Error::BuildFailed(m) => m.clone(),
            other => other.to_string(),
        };
        let report = ErrorReport {
            message,
            stage: stage.to_string(),
            error_code: err.exit_code(),
        };
        if let Err(e) = self.control.report_error(&report).await {
            warn!("Could not report build error: {}", e);
        }
        if let Err(e) = self.control.set_status(TestRunStatus::Failed).await {
            warn!("Could not mark run failed: {}", e);
        }
    }
}
