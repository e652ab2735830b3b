//! Worker start-up and teardown around the spec loop

use specgrid_common::archive::{archive_name, extract_archive};
use specgrid_common::{
    AppContext, BlobStore, BuildCache, CommandRunner, CommandSpec, ControlPlane,
    ControlPlaneQueue, Error, NodeEnvironment, Result, TestRun,
};
use std::sync::Arc;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::framework;
use crate::server::AppServer;
use crate::supervisor::{LoopSummary, RunnerSupervisor};

/// Why the worker stopped without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The run no longer exists.
    RunMissing,
    /// The run already reached a terminal status.
    RunFinished,
    Drained(LoopSummary),
}

pub struct Worker {
    ctx: Arc<AppContext>,
    control: Arc<dyn ControlPlane>,
    store: Arc<dyn BlobStore>,
    runner: Arc<dyn CommandRunner>,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(
        ctx: Arc<AppContext>,
        control: Arc<dyn ControlPlane>,
        store: Arc<dyn BlobStore>,
        runner: Arc<dyn CommandRunner>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            control,
            store,
            runner,
            cancel,
        }
    }

    pub async fn run(&self) -> Result<WorkerExit> {
        let run_id = self.control.run_id();
        let Some(run) = self.control.fetch_testrun().await? else {
            info!("Test run {} is missing, quitting", run_id);
            return Ok(WorkerExit::RunMissing);
        };
        if run.status.is_terminal() {
            info!("Test run {} is already {}, quitting", run_id, run.status);
            return Ok(WorkerExit::RunFinished);
        }

        let server = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(Error::Cancelled("termination signal received during start-up".into()));
            }
            server = self.start_up(&run) => server?,
        };
        debug!("App under test at {}", server.base_url());

        let outcome = self.run_specs(&run, &server).await;
        server.stop().await;
        outcome.map(WorkerExit::Drained)
    }

    async fn start_up(&self, run: &TestRun) -> Result<AppServer> {
        self.fetch_app(run).await?;
        self.fetch_dependencies(run).await?;
        self.start_server(run).await
    }

    async fn run_specs(&self, run: &TestRun, server: &AppServer) -> Result<LoopSummary> {
        let framework = framework::for_project(&run.project, &self.ctx.settings)?;
        let queue = Arc::new(ControlPlaneQueue::new(self.control.clone()));
        RunnerSupervisor::new(
            self.ctx.clone(),
            run,
            self.control.clone(),
            queue,
            self.runner.clone(),
            framework,
            self.cancel.clone(),
        )
        .with_app(server.base_url(), server.activity())
        .run()
        .await
    }

    /// Unpack the published checkout into `src/`.
    async fn fetch_app(&self, run: &TestRun) -> Result<()> {
        let settings = &self.ctx.settings;
        let sha = run
            .sha
            .as_deref()
            .ok_or_else(|| Error::RunFailed(format!("Test run {} has no built commit", run.id)))?;
        let name = archive_name(sha);
        let local = settings.tmp_dir().join(&name);
        fs::create_dir_all(settings.tmp_dir()).await?;

        let budget = settings.build_timeout();
        let size = tokio::time::timeout(budget, self.store.download(&name, &local))
            .await
            .map_err(|_| {
                Error::RunFailed(format!(
                    "Downloading {} exceeded {}s",
                    name,
                    budget.as_secs()
                ))
            })??;
        let unpacked = extract_archive(&local, &settings.src_dir()).await;
        if let Err(e) = fs::remove_file(&local).await {
            debug!("Could not remove {:?}: {}", local, e);
        }
        unpacked.map_err(|e| Error::RunFailed(format!("Unusable build artifact {}: {}", name, e)))?;
        info!("Unpacked {} ({} bytes)", name, size);
        Ok(())
    }

    /// Restore `node_modules` and the framework binaries from the build's cache entry.
    async fn fetch_dependencies(&self, run: &TestRun) -> Result<()> {
        let settings = &self.ctx.settings;
        let key = run
            .cache_key
            .as_deref()
            .ok_or_else(|| Error::RunFailed(format!("Test run {} has no cache key", run.id)))?;
        let cache = BuildCache::new(self.store.clone(), settings.tmp_dir(), settings.build_timeout());
        if let Err(e) = cache.fetch(key, &settings.build_dir).await {
            return Err(Error::RunFailed(format!("Missing dependency cache: {}", e)));
        }
        if !settings.src_dir().join("node_modules").is_dir() {
            return Err(Error::RunFailed("Missing node_modules".to_string()));
        }
        Ok(())
    }

    async fn start_server(&self, run: &TestRun) -> Result<AppServer> {
        let settings = &self.ctx.settings;
        let project = &run.project;
        match &project.server_cmd {
            Some(line) => {
                let port = project.server_port.ok_or_else(|| {
                    Error::RunFailed("server_cmd is set but server_port is not".to_string())
                })?;
                let node = NodeEnvironment::new(
                    settings.src_dir(),
                    settings.framework_cache_dir(),
                    project.test_framework,
                );
                AppServer::spawn_command(
                    self.runner.as_ref(),
                    node.prepare(CommandSpec::shell(line)),
                    port,
                    settings.server_start_timeout(),
                )
                .await
            }
            None => {
                let root = settings.src_dir().join(&project.build_output_dir);
                if !root.is_dir() {
                    return Err(Error::RunFailed(format!(
                        "Build output {} is missing",
                        project.build_output_dir
                    )));
                }
                AppServer::serve_static(&root).await
            }
        }
    }
}
