//! Core types for Specgrid
//!
//! Field names on the wire are camelCase to match the control plane.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Supported test frameworks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestFramework {
    Cypress,
    Playwright,
}

impl TestFramework {
    /// Environment variable that points the framework at its binary cache.
    pub fn cache_env_var(&self) -> &'static str {
        match self {
            TestFramework::Cypress => "CYPRESS_CACHE_FOLDER",
            TestFramework::Playwright => "PLAYWRIGHT_BROWSERS_PATH",
        }
    }
}

impl std::fmt::Display for TestFramework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestFramework::Cypress => write!(f, "cypress"),
            TestFramework::Playwright => write!(f, "playwright"),
        }
    }
}

/// Test run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestRunStatus {
    Started,
    Building,
    Running,
    Passed,
    Failed,
    Cancelled,
}

impl TestRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestRunStatus::Passed | TestRunStatus::Failed | TestRunStatus::Cancelled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            TestRunStatus::Started => 0,
            TestRunStatus::Building => 1,
            TestRunStatus::Running => 2,
            TestRunStatus::Passed | TestRunStatus::Failed | TestRunStatus::Cancelled => 3,
        }
    }

    /// Transitions only move forward; cancellation is allowed from any live state.
    pub fn can_transition_to(&self, next: TestRunStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == TestRunStatus::Cancelled || next.rank() > self.rank()
    }
}

impl std::fmt::Display for TestRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TestRunStatus::Started => "started",
            TestRunStatus::Building => "building",
            TestRunStatus::Running => "running",
            TestRunStatus::Passed => "passed",
            TestRunStatus::Failed => "failed",
            TestRunStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

fn default_output_dir() -> String {
    "dist".to_string()
}

fn default_parallelism() -> u32 {
    1
}

/// Project settings that shape how a run is built and executed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub build_cmd: Option<String>,
    #[serde(default = "default_output_dir")]
    pub build_output_dir: String,
    #[serde(default)]
    pub server_cmd: Option<String>,
    #[serde(default)]
    pub server_port: Option<u16>,
    pub test_framework: TestFramework,
    #[serde(default)]
    pub browsers: Vec<String>,
    /// Per-spec hard deadline in seconds. Falls back to the worker setting.
    #[serde(default)]
    pub spec_deadline: Option<u64>,
    #[serde(default)]
    pub runner_retries: u32,
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
    #[serde(default)]
    pub spec_filter: Option<String>,
}

/// One CI invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRun {
    pub id: i64,
    pub local_id: i64,
    pub branch: String,
    #[serde(default)]
    pub sha: Option<String>,
    /// Clone URL; the project URL is used when absent.
    #[serde(default)]
    pub url: Option<String>,
    pub project: Project,
    pub status: TestRunStatus,
    #[serde(default)]
    pub cache_key: Option<String>,
}

impl TestRun {
    pub fn clone_url(&self) -> &str {
        self.url.as_deref().unwrap_or(&self.project.url)
    }
}

/// BuildPipeline states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStage {
    Cloning,
    InstallingDependencies,
    DiscoveringSpecs,
    BuildingApp,
    Publishing,
    Done,
    Failed,
}

impl std::fmt::Display for BuildStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BuildStage::Cloning => "cloning",
            BuildStage::InstallingDependencies => "installing_dependencies",
            BuildStage::DiscoveringSpecs => "discovering_specs",
            BuildStage::BuildingApp => "building_app",
            BuildStage::Publishing => "publishing",
            BuildStage::Done => "done",
            BuildStage::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of a single test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Flakey,
    Skipped,
}

/// Source excerpt pointing at a failure
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeFrame {
    pub file: String,
    pub line: u32,
    pub column: u32,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub frame: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestError {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub test_line: Option<u32>,
    #[serde(default)]
    pub code_frame: Option<CodeFrame>,
}

/// A single test outcome.
///
/// Serialization goes through [`TestResultWire`] so that a passed test with
/// retries is always `flakey` on the wire, whichever way it crosses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TestResultWire", into = "TestResultWire")]
pub struct TestResult {
    pub title: String,
    pub context: Option<String>,
    pub browser: Option<String>,
    pub status: TestStatus,
    pub retry: u32,
    pub duration_ms: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<TestError>,
    pub failure_screenshots: Vec<String>,
}

impl TestResult {
    /// Build a result from the framework's final status and retry count.
    pub fn new(title: impl Into<String>, status: TestStatus, retry: u32) -> Self {
        Self {
            title: title.into(),
            context: None,
            browser: None,
            status: classify(status, retry),
            retry,
            duration_ms: 0,
            started_at: None,
            finished_at: None,
            error: None,
            failure_screenshots: Vec::new(),
        }
    }
}

/// Passed-after-retry is flakey, never passed.
pub fn classify(status: TestStatus, retry: u32) -> TestStatus {
    match status {
        TestStatus::Passed if retry > 0 => TestStatus::Flakey,
        other => other,
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestResultWire {
    title: String,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    browser: Option<String>,
    status: TestStatus,
    #[serde(default)]
    retry: u32,
    #[serde(default)]
    duration: u64,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    error: Option<TestError>,
    #[serde(default)]
    failure_screenshots: Vec<String>,
}

impl From<TestResultWire> for TestResult {
    fn from(w: TestResultWire) -> Self {
        Self {
            title: w.title,
            context: w.context,
            browser: w.browser,
            status: classify(w.status, w.retry),
            retry: w.retry,
            duration_ms: w.duration,
            started_at: w.started_at,
            finished_at: w.finished_at,
            error: w.error,
            failure_screenshots: w.failure_screenshots,
        }
    }
}

impl From<TestResult> for TestResultWire {
    fn from(r: TestResult) -> Self {
        Self {
            title: r.title,
            context: r.context,
            browser: r.browser,
            status: classify(r.status, r.retry),
            retry: r.retry,
            duration: r.duration_ms,
            started_at: r.started_at,
            finished_at: r.finished_at,
            error: r.error,
            failure_screenshots: r.failure_screenshots,
        }
    }
}

/// Everything reported for one spec file
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecResult {
    pub tests: Vec<TestResult>,
    #[serde(default)]
    pub timeout: bool,
    #[serde(default)]
    pub video: Option<String>,
}

impl SpecResult {
    /// The result reported when the hard deadline passes with nothing usable.
    pub fn timed_out() -> Self {
        Self {
            tests: Vec::new(),
            timeout: true,
            video: None,
        }
    }

    /// Fold in another browser's results. Tests are concatenated, never replaced.
    pub fn merge(&mut self, other: SpecResult) {
        self.tests.extend(other.tests);
        self.timeout |= other.timeout;
        if self.video.is_none() {
            self.video = other.video;
        }
    }

    pub fn has_failures(&self) -> bool {
        self.tests.iter().any(|t| t.status == TestStatus::Failed)
    }
}

// Control-plane payloads

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildCompleted {
    pub sha: String,
    pub cache_key: String,
    pub specs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecStarted {
    pub file: String,
    pub started_at: DateTime<Utc>,
    pub worker_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecCompleted {
    pub file: String,
    pub finished_at: DateTime<Utc>,
    pub result: SpecResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnSpec {
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextSpecRequest {
    pub worker_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextSpecResponse {
    pub spec: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub message: String,
    pub stage: String,
    #[serde(default)]
    pub error_code: Option<i32>,
}
