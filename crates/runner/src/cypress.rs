//! Cypress adapter
//!
//! Cypress runs one browser per process, so a spec becomes one invocation per
//! configured browser. Results come from a bundled mocha reporter that writes
//! JSON; failure screenshots are matched to tests by Cypress' file naming.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use specgrid_common::{
    CodeFrame, CommandSpec, Project, Result, SpecResult, TestError, TestFramework, TestResult,
    TestStatus,
};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::framework::{Framework, Invocation};

const REPORTER_JS: &str = include_str!("../assets/cypress-json-reporter.js");
const DEFAULT_BROWSER: &str = "electron";

pub struct Cypress {
    browsers: Vec<String>,
    retries: u32,
    results_root: PathBuf,
    reporter: PathBuf,
    verbose: bool,
}

impl Cypress {
    pub fn new(project: &Project, results_root: PathBuf, reporter: PathBuf, verbose: bool) -> Self {
        let browsers = if project.browsers.is_empty() {
            vec![DEFAULT_BROWSER.to_string()]
        } else {
            project.browsers.clone()
        };
        Self {
            browsers,
            retries: project.runner_retries,
            results_root,
            reporter,
            verbose,
        }
    }

    /// Write the bundled JSON reporter to `path`.
    pub fn install_reporter(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, REPORTER_JS)?;
        Ok(())
    }
}

impl Framework for Cypress {
    fn kind(&self) -> TestFramework {
        TestFramework::Cypress
    }

    fn invocations(&self, spec: &str, base_url: &str) -> Vec<Invocation> {
        self.browsers
            .iter()
            .map(|browser| {
                let results_dir = self.results_root.join(format!("cypress-{}", browser));
                let config = format!(
                    "screenshotsFolder={},screenshotOnRunFailure=true,baseUrl={},video=false,videosFolder={}",
                    results_dir.join("screenshots").display(),
                    base_url,
                    results_dir.join("videos").display(),
                );
                let mut command = CommandSpec::new("cypress")
                    .args(["run", "-q", "--browser", browser.as_str(), "-s", spec])
                    .arg("--reporter")
                    .arg(self.reporter.display().to_string())
                    .arg("--reporter-options")
                    .arg(format!("output={}", results_dir.join(crate::framework::RESULTS_FILE).display()))
                    .arg("-c")
                    .arg(config)
                    .env("CYPRESS_RETRIES", self.retries.to_string());
                if self.verbose {
                    command = command.env("DEBUG", "cypress:server:*");
                }
                Invocation {
                    browser: Some(browser.clone()),
                    command,
                    results_dir,
                }
            })
            .collect()
    }

    fn collect(&self, invocation: &Invocation) -> Result<Option<SpecResult>> {
        let file = invocation.results_file();
        if !file.is_file() {
            return Ok(None);
        }
        let report: MochaReport = serde_json::from_slice(&std::fs::read(&file)?)?;
        let screenshots = list_files(&invocation.results_dir.join("screenshots"), "png");

        let tests: Vec<TestResult> = report
            .tests
            .into_iter()
            .map(|t| t.into_result(invocation.browser.as_deref(), &screenshots))
            .collect();
        let mut result = SpecResult {
            tests,
            timeout: false,
            video: None,
        };
        if result.has_failures() {
            result.video = list_files(&invocation.results_dir.join("videos"), "mp4")
                .into_iter()
                .next()
                .map(|p| p.display().to_string());
        }
        debug!(
            "Cypress ({:?}) reported {} tests",
            invocation.browser,
            result.tests.len()
        );
        Ok(Some(result))
    }
}

#[derive(Debug, Deserialize)]
struct MochaReport {
    #[serde(default)]
    tests: Vec<MochaTest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MochaTest {
    title: String,
    #[serde(default)]
    title_path: Vec<String>,
    state: String,
    #[serde(default)]
    duration: u64,
    #[serde(default)]
    current_retry: u32,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    err: Option<MochaError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MochaError {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    stack: Option<String>,
    #[serde(default)]
    code_frame: Option<MochaCodeFrame>,
}

#[derive(Debug, Deserialize)]
struct MochaCodeFrame {
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    line: u32,
    #[serde(default)]
    column: u32,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    frame: Option<String>,
}

impl MochaTest {
    fn into_result(self, browser: Option<&str>, screenshots: &[PathBuf]) -> TestResult {
        let status = match self.state.as_str() {
            "passed" => TestStatus::Passed,
            "failed" => TestStatus::Failed,
            "pending" => TestStatus::Skipped,
            other => {
                warn!("Unknown Cypress test state {:?}, treating as skipped", other);
                TestStatus::Skipped
            }
        };

        let mut result = TestResult::new(self.title, status, self.current_retry);
        if self.title_path.len() > 1 {
            result.context = Some(self.title_path[..self.title_path.len() - 1].join(" -- "));
        }
        result.browser = browser.map(str::to_string);
        result.duration_ms = self.duration;
        result.started_at = self.started_at;
        result.finished_at = self.finished_at;

        if status == TestStatus::Failed {
            let prefix = format!("{} (failed)", self.title_path.join(" -- "));
            result.failure_screenshots = screenshots
                .iter()
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(&prefix))
                })
                .map(|p| p.display().to_string())
                .collect();
        }

        result.error = self.err.map(|err| {
            let code_frame = err.code_frame.map(|cf| CodeFrame {
                file: cf.file.unwrap_or_default(),
                line: cf.line,
                column: cf.column,
                language: cf.language,
                frame: cf.frame,
            });
            TestError {
                title: err.name.clone(),
                kind: err.name,
                message: err.message.unwrap_or_default(),
                stack: err.stack,
                test_line: code_frame.as_ref().map(|cf| cf.line),
                code_frame,
            }
        });
        result
    }
}

/// Files under `dir` with extension `ext`, sorted by path
fn list_files(dir: &Path, ext: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().and_then(|x| x.to_str()) == Some(ext))
        .collect();
    files.sort();
    files
}
