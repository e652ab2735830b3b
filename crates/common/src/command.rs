//! External process execution
//!
//! Two modes: capture (buffer everything, for short deterministic commands)
//! and streaming (forward each line to tracing as it arrives, recording
//! activity for hang detection). Long-lived supervised children come from
//! [`CommandRunner::spawn`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::types::TestFramework;
use crate::{Error, Result};

/// Lines of output kept for failure reports
pub const TAIL_LINES: usize = 20;

/// A command to run
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout: None,
        }
    }

    /// A project-supplied command line, run through `sh -c`.
    pub fn shell(line: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(line)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Human-readable command line for logs and error reports
    pub fn display(&self) -> String {
        if self.program == "sh" && self.args.len() == 2 && self.args[0] == "-c" {
            return self.args[1].clone();
        }
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

/// Result of a successful command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// How a supervised process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Last time something happened, shared between a producer and a watcher
#[derive(Debug, Clone, Default)]
pub struct ActivityClock {
    last: Arc<Mutex<Option<Instant>>>,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&self) {
        *self.last.lock() = Some(Instant::now());
    }

    pub fn last(&self) -> Option<Instant> {
        *self.last.lock()
    }

    /// Time since the last activity, counting no earlier than `floor`.
    pub fn idle_since(&self, floor: Instant) -> Duration {
        let reference = match self.last() {
            Some(t) if t > floor => t,
            _ => floor,
        };
        Instant::now().saturating_duration_since(reference)
    }
}

/// Environment every project command runs with
#[derive(Debug, Clone)]
pub struct NodeEnvironment {
    pub src_dir: PathBuf,
    pub framework_cache_dir: PathBuf,
    pub framework: TestFramework,
}

impl NodeEnvironment {
    pub fn new(
        src_dir: impl Into<PathBuf>,
        framework_cache_dir: impl Into<PathBuf>,
        framework: TestFramework,
    ) -> Self {
        Self {
            src_dir: src_dir.into(),
            framework_cache_dir: framework_cache_dir.into(),
            framework,
        }
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.src_dir.join("node_modules").join(".bin")
    }

    /// `PATH` with the local shims first, plus the framework cache override.
    pub fn vars(&self) -> Vec<(String, String)> {
        let inherited = std::env::var("PATH").unwrap_or_default();
        let path = if inherited.is_empty() {
            self.bin_dir().display().to_string()
        } else {
            format!("{}:{}", self.bin_dir().display(), inherited)
        };
        vec![
            ("PATH".to_string(), path),
            (
                self.framework.cache_env_var().to_string(),
                self.framework_cache_dir.display().to_string(),
            ),
        ]
    }

    /// `cmd` run from the checkout with the node environment injected.
    pub fn prepare(&self, cmd: CommandSpec) -> CommandSpec {
        self.vars()
            .into_iter()
            .fold(cmd.cwd(&self.src_dir), |cmd, (k, v)| cmd.env(k, v))
    }
}

/// A long-running child under supervision
#[async_trait]
pub trait SupervisedProcess: Send {
    /// Wait up to `wait` for the process to exit. `None` means still running.
    async fn wait_timeout(&mut self, wait: Duration) -> Result<Option<ExitInfo>>;

    /// Kill the process and everything it started.
    async fn kill(&mut self) -> Result<()>;

    /// When the process last wrote a line
    fn last_output(&self) -> Option<Instant>;

    /// The last few lines of output
    fn output_tail(&self) -> String;
}

/// Runs external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion with buffered output. Non-zero exit is `CommandFailed`.
    async fn capture(&self, cmd: &CommandSpec) -> Result<CommandOutput>;

    /// Run to completion, logging output line by line. Non-zero exit is `CommandFailed`.
    async fn stream(&self, cmd: &CommandSpec) -> Result<CommandOutput>;

    /// Start a child in streaming mode and hand it back for supervision.
    fn spawn(&self, cmd: &CommandSpec) -> Result<Box<dyn SupervisedProcess>>;
}

/// Runs commands on the host
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self
    }

    fn start(&self, cmd: &CommandSpec) -> Result<StreamingChild> {
        info!("Running: {}", cmd.display());
        let mut child = cmd.to_command().spawn().map_err(|e| {
            Error::CommandFailed {
                command: cmd.display(),
                exit_code: None,
                stderr_tail: format!("failed to start: {}", e),
            }
        })?;

        let activity = ActivityClock::new();
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(TAIL_LINES)));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, activity.clone(), tail.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, activity.clone(), tail.clone()));
        }

        Ok(StreamingChild {
            pid: child.id(),
            child,
            activity,
            tail,
            readers,
        })
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn capture(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        debug!("Capturing: {}", cmd.display());
        let fut = cmd.to_command().output();
        let output = match cmd.timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                Error::CommandTimeout {
                    command: cmd.display(),
                    seconds: limit.as_secs(),
                }
            })?,
            None => fut.await,
        }
        .map_err(|e| Error::CommandFailed {
            command: cmd.display(),
            exit_code: None,
            stderr_tail: format!("failed to start: {}", e),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: cmd.display(),
                exit_code: output.status.code(),
                stderr_tail: tail_lines(&stderr, TAIL_LINES),
            });
        }
        Ok(CommandOutput { stdout, stderr })
    }

    async fn stream(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        let mut child = self.start(cmd)?;
        let deadline = cmd.timeout.map(|t| Instant::now() + t);
        let exit = loop {
            let wait = match deadline {
                Some(d) => d.saturating_duration_since(Instant::now()),
                None => Duration::from_secs(3600),
            };
            if let Some(exit) = child.wait_timeout(wait).await? {
                break exit;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                child.kill().await?;
                return Err(Error::CommandTimeout {
                    command: cmd.display(),
                    seconds: cmd.timeout.map(|t| t.as_secs()).unwrap_or_default(),
                });
            }
        };

        let tail = child.output_tail();
        if !exit.success() {
            return Err(Error::CommandFailed {
                command: cmd.display(),
                exit_code: exit.code,
                stderr_tail: tail,
            });
        }
        Ok(CommandOutput {
            stdout: tail,
            stderr: String::new(),
        })
    }

    fn spawn(&self, cmd: &CommandSpec) -> Result<Box<dyn SupervisedProcess>> {
        Ok(Box::new(self.start(cmd)?))
    }
}

/// A child whose stdout and stderr are forwarded to tracing
struct StreamingChild {
    child: Child,
    pid: Option<u32>,
    activity: ActivityClock,
    tail: Arc<Mutex<VecDeque<String>>>,
    readers: Vec<JoinHandle<()>>,
}

impl StreamingChild {
    async fn drain_readers(&mut self) {
        // Grandchildren can hold the pipes open after the direct child exits.
        for reader in self.readers.drain(..) {
            if tokio::time::timeout(Duration::from_secs(1), reader).await.is_err() {
                debug!("Output reader still open after exit");
            }
        }
    }
}

#[async_trait]
impl SupervisedProcess for StreamingChild {
    async fn wait_timeout(&mut self, wait: Duration) -> Result<Option<ExitInfo>> {
        match tokio::time::timeout(wait, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                self.drain_readers().await;
                Ok(Some(ExitInfo {
                    code: status.code(),
                }))
            }
            Err(_) => Ok(None),
        }
    }

    async fn kill(&mut self) -> Result<()> {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                debug!("killpg({}) failed: {}", pid, e);
            }
        }
        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill child {:?}: {}", self.pid, e);
        }
        self.drain_readers().await;
        Ok(())
    }

    fn last_output(&self) -> Option<Instant> {
        self.activity.last()
    }

    fn output_tail(&self) -> String {
        self.tail.lock().iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

impl Drop for StreamingChild {
    fn drop(&mut self) {
        // kill_on_drop only reaches the direct child.
        #[cfg(unix)]
        if let (Some(pid), Ok(None)) = (self.pid, self.child.try_wait()) {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }
}

fn forward_lines<R>(
    reader: R,
    activity: ActivityClock,
    tail: Arc<Mutex<VecDeque<String>>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            activity.touch();
            debug!(target: "specgrid::cmd", "{}", line);
            let mut tail = tail.lock();
            if tail.len() == TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    })
}

/// The last `n` lines of `text`
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
