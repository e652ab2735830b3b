//! In-memory doubles for the external collaborators
//!
//! Enabled with the `testing` feature so the builder and runner crates can
//! drive whole scenarios without a control plane, blob store or Node.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::blobstore::BlobStore;
use crate::command::{
    CommandOutput, CommandRunner, CommandSpec, ExitInfo, SupervisedProcess,
};
use crate::control::ControlPlane;
use crate::queue::{SpecQueue, SpecSet};
use crate::types::{
    BuildCompleted, ErrorReport, Project, SpecCompleted, SpecStarted, TestFramework, TestRun,
    TestRunStatus,
};
use crate::{Error, Result};

/// A run in `started` state for a project using `framework`
pub fn sample_testrun(id: i64, framework: TestFramework) -> TestRun {
    TestRun {
        id,
        local_id: 1,
        branch: "main".to_string(),
        sha: None,
        url: None,
        project: Project {
            id: 1,
            name: "webapp".to_string(),
            url: "https://git.example.com/acme/webapp.git".to_string(),
            build_cmd: Some("npm run build".to_string()),
            build_output_dir: "dist".to_string(),
            server_cmd: None,
            server_port: None,
            test_framework: framework,
            browsers: Vec::new(),
            spec_deadline: None,
            runner_retries: 0,
            parallelism: 1,
            spec_filter: None,
        },
        status: TestRunStatus::Started,
        cache_key: None,
    }
}

/// Every call made against a [`RecordingControlPlane`]
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Status(TestRunStatus),
    BuildCompleted(BuildCompleted),
    SpecStarted(SpecStarted),
    SpecCompleted(SpecCompleted),
    ReturnSpec(String),
    Upload(Vec<String>),
    Error(ErrorReport),
}

/// Control plane that keeps state in memory and records every call
///
/// `build_completed` fills the queue the way the real service does, so a
/// build followed by workers behaves end to end.
pub struct RecordingControlPlane {
    run: Mutex<Option<TestRun>>,
    queue: SpecSet,
    calls: Mutex<Vec<Call>>,
    reject_completions: Mutex<u32>,
}

impl RecordingControlPlane {
    pub fn new(run: TestRun) -> Arc<Self> {
        Arc::new(Self {
            run: Mutex::new(Some(run)),
            queue: SpecSet::new(),
            calls: Mutex::new(Vec::new()),
            reject_completions: Mutex::new(0),
        })
    }

    pub fn queue(&self) -> &SpecSet {
        &self.queue
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn statuses(&self) -> Vec<TestRunStatus> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Status(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    pub fn completed(&self) -> Vec<SpecCompleted> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::SpecCompleted(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn returned(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::ReturnSpec(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<ErrorReport> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Error(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn run(&self) -> Option<TestRun> {
        self.run.lock().clone()
    }

    /// Change the run's status without recording a call, as an operator would.
    pub fn force_status(&self, status: TestRunStatus) {
        if let Some(run) = self.run.lock().as_mut() {
            run.status = status;
        }
    }

    /// Remove the run; later fetches return `None`.
    pub fn delete_run(&self) {
        if let Some(run) = self.run.lock().take() {
            self.queue.cancel(run.id);
        }
    }

    /// Make the next `n` `spec-completed` posts fail with a 422.
    pub fn reject_completions(&self, n: u32) {
        *self.reject_completions.lock() = n;
    }

    fn run_id_or_zero(&self) -> i64 {
        self.run.lock().as_ref().map_or(0, |r| r.id)
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl ControlPlane for RecordingControlPlane {
    fn run_id(&self) -> i64 {
        self.run_id_or_zero()
    }

    async fn fetch_testrun(&self) -> Result<Option<TestRun>> {
        Ok(self.run())
    }

    async fn set_status(&self, status: TestRunStatus) -> Result<()> {
        self.force_status(status);
        self.record(Call::Status(status));
        Ok(())
    }

    async fn build_completed(&self, payload: &BuildCompleted) -> Result<()> {
        if let Some(run) = self.run.lock().as_mut() {
            run.sha = Some(payload.sha.clone());
            run.cache_key = Some(payload.cache_key.clone());
            run.status = TestRunStatus::Running;
            self.queue.enqueue(run.id, payload.specs.iter().cloned());
        }
        self.record(Call::BuildCompleted(payload.clone()));
        Ok(())
    }

    async fn spec_started(&self, payload: &SpecStarted) -> Result<()> {
        self.record(Call::SpecStarted(payload.clone()));
        Ok(())
    }

    async fn spec_completed(&self, payload: &SpecCompleted) -> Result<()> {
        {
            let mut rejections = self.reject_completions.lock();
            if *rejections > 0 {
                *rejections -= 1;
                return Err(Error::ControlPlane {
                    endpoint: "spec-completed".to_string(),
                    status: 422,
                    message: "unprocessable result".to_string(),
                });
            }
        }
        self.record(Call::SpecCompleted(payload.clone()));
        Ok(())
    }

    async fn return_spec(&self, file: &str) -> Result<()> {
        self.queue.return_spec(self.run_id_or_zero(), file).await?;
        self.record(Call::ReturnSpec(file.to_string()));
        Ok(())
    }

    async fn next_spec(&self, worker_name: &str) -> Result<Option<String>> {
        self.queue.claim(self.run_id_or_zero(), worker_name).await
    }

    async fn upload_artifacts(&self, files: &[PathBuf]) -> Result<Vec<String>> {
        let names: Vec<String> = files
            .iter()
            .map(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            })
            .collect();
        self.record(Call::Upload(names.clone()));
        Ok(names
            .into_iter()
            .map(|n| format!("https://artifacts.test/{}", n))
            .collect())
    }

    async fn report_error(&self, report: &ErrorReport) -> Result<()> {
        self.record(Call::Error(report.clone()));
        Ok(())
    }
}

/// Blob store held in memory
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    stalled: Mutex<bool>,
}

impl MemoryBlobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.blobs.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn insert(&self, name: impl Into<String>, data: Vec<u8>) {
        self.blobs.lock().insert(name.into(), data);
    }

    /// Make later downloads and uploads hang forever, like a dead connection.
    pub fn stall_transfers(&self) {
        *self.stalled.lock() = true;
    }

    async fn stall_if_requested(&self) {
        let stalled = *self.stalled.lock();
        if stalled {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.blobs.lock().contains_key(name))
    }

    async fn download(&self, name: &str, dest: &Path) -> Result<u64> {
        self.stall_if_requested().await;
        let data = self.blobs.lock().get(name).cloned().ok_or_else(|| Error::BlobStore {
            name: name.to_string(),
            status: 404,
        })?;
        tokio::fs::write(dest, &data).await?;
        Ok(data.len() as u64)
    }

    async fn upload(&self, name: &str, src: &Path) -> Result<()> {
        self.stall_if_requested().await;
        let data = tokio::fs::read(src).await?;
        self.insert(name, data);
        Ok(())
    }
}

type CaptureFn = dyn Fn(&CommandSpec) -> Result<CommandOutput> + Send + Sync;
type SpawnFn = dyn Fn(&CommandSpec) -> Result<Box<dyn SupervisedProcess>> + Send + Sync;

/// Command runner that matches command lines by prefix and runs scripted behaviour
///
/// Unmatched commands succeed with empty output; unmatched spawns exit 0 at once.
#[derive(Default)]
pub struct ScriptedCommandRunner {
    handlers: Mutex<Vec<(String, Arc<CaptureFn>)>>,
    spawners: Mutex<Vec<(String, Arc<SpawnFn>)>>,
    log: Mutex<Vec<String>>,
}

impl ScriptedCommandRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Handle commands whose display line starts with `prefix`.
    pub fn on<F>(&self, prefix: impl Into<String>, f: F)
    where
        F: Fn(&CommandSpec) -> Result<CommandOutput> + Send + Sync + 'static,
    {
        self.handlers.lock().push((prefix.into(), Arc::new(f)));
    }

    /// Fail commands starting with `prefix` with the given exit code.
    pub fn fail(&self, prefix: impl Into<String>, exit_code: i32, stderr: impl Into<String>) {
        let stderr = stderr.into();
        self.on(prefix, move |cmd| {
            Err(Error::CommandFailed {
                command: cmd.display(),
                exit_code: Some(exit_code),
                stderr_tail: stderr.clone(),
            })
        });
    }

    /// Answer commands starting with `prefix` with fixed stdout.
    pub fn reply(&self, prefix: impl Into<String>, stdout: impl Into<String>) {
        let stdout = stdout.into();
        self.on(prefix, move |_| {
            Ok(CommandOutput {
                stdout: stdout.clone(),
                stderr: String::new(),
            })
        });
    }

    /// Supply the process for spawns starting with `prefix`.
    pub fn on_spawn<F>(&self, prefix: impl Into<String>, f: F)
    where
        F: Fn(&CommandSpec) -> Result<Box<dyn SupervisedProcess>> + Send + Sync + 'static,
    {
        self.spawners.lock().push((prefix.into(), Arc::new(f)));
    }

    /// Display lines of every command run so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Commands whose display line starts with `prefix`
    pub fn commands_matching(&self, prefix: &str) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        let line = cmd.display();
        self.log.lock().push(line.clone());
        let handler = self
            .handlers
            .lock()
            .iter()
            .rev()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, f)| f.clone());
        match handler {
            Some(f) => f(cmd),
            None => Ok(CommandOutput::default()),
        }
    }
}

#[async_trait]
impl CommandRunner for ScriptedCommandRunner {
    async fn capture(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        self.run(cmd)
    }

    async fn stream(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        self.run(cmd)
    }

    fn spawn(&self, cmd: &CommandSpec) -> Result<Box<dyn SupervisedProcess>> {
        let line = cmd.display();
        self.log.lock().push(line.clone());
        let spawner = self
            .spawners
            .lock()
            .iter()
            .rev()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, f)| f.clone());
        match spawner {
            Some(f) => f(cmd),
            None => Ok(Box::new(FakeProcess::exits_after(Duration::ZERO, 0))),
        }
    }
}

/// Scripted stand-in for a supervised child, driven by tokio time
#[derive(Debug)]
pub struct FakeProcess {
    exit_at: Option<Instant>,
    code: i32,
    chatty: bool,
    killed: Arc<Mutex<bool>>,
    tail: String,
}

impl FakeProcess {
    /// Exits with `code` after `after`, silent until then.
    pub fn exits_after(after: Duration, code: i32) -> Self {
        Self {
            exit_at: Some(Instant::now() + after),
            code,
            chatty: false,
            killed: Arc::default(),
            tail: String::new(),
        }
    }

    /// Never exits and never writes output.
    pub fn hangs() -> Self {
        Self {
            exit_at: None,
            code: 0,
            chatty: false,
            killed: Arc::default(),
            tail: String::new(),
        }
    }

    /// Reports fresh output whenever asked.
    pub fn chatty(mut self) -> Self {
        self.chatty = true;
        self
    }

    pub fn with_tail(mut self, tail: impl Into<String>) -> Self {
        self.tail = tail.into();
        self
    }

    /// Shared flag set once `kill` is called
    pub fn kill_flag(&self) -> Arc<Mutex<bool>> {
        self.killed.clone()
    }
}

#[async_trait]
impl SupervisedProcess for FakeProcess {
    async fn wait_timeout(&mut self, wait: Duration) -> Result<Option<ExitInfo>> {
        if *self.killed.lock() {
            return Ok(Some(ExitInfo { code: None }));
        }
        let now = Instant::now();
        match self.exit_at {
            Some(at) if at <= now + wait => {
                tokio::time::sleep_until(at).await;
                Ok(Some(ExitInfo {
                    code: Some(self.code),
                }))
            }
            _ => {
                tokio::time::sleep(wait).await;
                Ok(None)
            }
        }
    }

    async fn kill(&mut self) -> Result<()> {
        *self.killed.lock() = true;
        Ok(())
    }

    fn last_output(&self) -> Option<Instant> {
        self.chatty.then(Instant::now)
    }

    fn output_tail(&self) -> String {
        self.tail.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_completed_fills_queue() {
        let cp = RecordingControlPlane::new(sample_testrun(3, TestFramework::Cypress));
        cp.build_completed(&BuildCompleted {
            sha: "abc".into(),
            cache_key: "key".into(),
            specs: vec!["a.cy.ts".into(), "b.cy.ts".into()],
        })
        .await
        .unwrap();

        assert_eq!(cp.queue().pending(3), 2);
        assert_eq!(cp.run().unwrap().status, TestRunStatus::Running);
        assert!(cp.next_spec("w").await.unwrap().is_some());
        assert_eq!(cp.queue().pending(3), 1);
    }

    #[tokio::test]
    async fn test_scripted_runner_matches_latest_handler() {
        let runner = ScriptedCommandRunner::new();
        runner.reply("git rev-parse", "deadbeef\n");
        runner.fail("npm ci", 1, "boom");

        let out = runner
            .capture(&CommandSpec::new("git").args(["rev-parse", "HEAD"]))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "deadbeef");
        assert!(runner.stream(&CommandSpec::new("npm").arg("ci")).await.is_err());
        assert_eq!(runner.commands(), vec!["git rev-parse HEAD", "npm ci"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fake_process_timing() {
        let mut proc = FakeProcess::exits_after(Duration::from_secs(5), 3);
        assert_eq!(proc.wait_timeout(Duration::from_secs(2)).await.unwrap(), None);
        let exit = proc.wait_timeout(Duration::from_secs(10)).await.unwrap();
        assert_eq!(exit, Some(ExitInfo { code: Some(3) }));

        let mut hung = FakeProcess::hangs();
        assert_eq!(hung.wait_timeout(Duration::from_secs(60)).await.unwrap(), None);
        hung.kill().await.unwrap();
        assert!(hung.wait_timeout(Duration::from_secs(1)).await.unwrap().is_some());
    }
}
