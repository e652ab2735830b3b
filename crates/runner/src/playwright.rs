//! Playwright adapter
//!
//! Playwright handles browsers natively through projects, so every spec is a
//! single invocation. Results come from its built-in JSON reporter.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use specgrid_common::{
    CodeFrame, CommandSpec, Project, Result, SpecResult, TestError, TestFramework, TestResult,
    TestStatus,
};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::framework::{Framework, Invocation};

pub struct Playwright {
    projects: Vec<String>,
    retries: u32,
    results_root: PathBuf,
    verbose: bool,
}

impl Playwright {
    pub fn new(project: &Project, results_root: PathBuf, verbose: bool) -> Self {
        Self {
            projects: project.browsers.clone(),
            retries: project.runner_retries,
            results_root,
            verbose,
        }
    }
}

impl Framework for Playwright {
    fn kind(&self) -> TestFramework {
        TestFramework::Playwright
    }

    fn invocations(&self, spec: &str, base_url: &str) -> Vec<Invocation> {
        let results_dir = self.results_root.join("playwright");
        let mut command = CommandSpec::new("playwright")
            .args(["test", spec, "--reporter=json"])
            .arg(format!("--output={}", results_dir.join("artifacts").display()));
        if self.retries > 0 {
            command = command.arg(format!("--retries={}", self.retries));
        }
        for project in &self.projects {
            command = command.arg(format!("--project={}", project));
        }
        command = command
            .env(
                "PLAYWRIGHT_JSON_OUTPUT_NAME",
                results_dir.join(crate::framework::RESULTS_FILE).display().to_string(),
            )
            .env("BASE_URL", base_url);
        if self.verbose {
            command = command.env("DEBUG", "pw:api");
        }
        vec![Invocation {
            browser: None,
            command,
            results_dir,
        }]
    }

    fn collect(&self, invocation: &Invocation) -> Result<Option<SpecResult>> {
        let file = invocation.results_file();
        if !file.is_file() {
            return Ok(None);
        }
        let report: PwReport = serde_json::from_slice(&std::fs::read(&file)?)?;

        let mut collected = Collected::default();
        for suite in &report.suites {
            collected.walk(suite, &mut Vec::new());
        }
        for err in &report.errors {
            warn!("Playwright reported a global error: {}", err.message.as_deref().unwrap_or(""));
        }

        let mut result = SpecResult {
            tests: collected.tests,
            timeout: false,
            video: None,
        };
        if result.has_failures() {
            result.video = collected.video;
        }
        debug!("Playwright reported {} tests", result.tests.len());
        Ok(Some(result))
    }
}

#[derive(Debug, Deserialize)]
struct PwReport {
    #[serde(default)]
    suites: Vec<PwSuite>,
    #[serde(default)]
    errors: Vec<PwError>,
}

#[derive(Debug, Deserialize)]
struct PwSuite {
    title: String,
    #[serde(default)]
    specs: Vec<PwSpec>,
    #[serde(default)]
    suites: Vec<PwSuite>,
}

#[derive(Debug, Deserialize)]
struct PwSpec {
    title: String,
    #[serde(default)]
    tests: Vec<PwTest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PwTest {
    #[serde(default)]
    project_name: Option<String>,
    status: String,
    #[serde(default)]
    results: Vec<PwResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PwResult {
    #[serde(default)]
    retry: u32,
    #[serde(default)]
    duration: u64,
    #[serde(default)]
    start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    error: Option<PwError>,
    #[serde(default)]
    attachments: Vec<PwAttachment>,
}

#[derive(Debug, Deserialize)]
struct PwError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    stack: Option<String>,
    #[serde(default)]
    location: Option<PwLocation>,
    #[serde(default)]
    snippet: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PwLocation {
    file: String,
    #[serde(default)]
    line: u32,
    #[serde(default)]
    column: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PwAttachment {
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Default)]
struct Collected {
    tests: Vec<TestResult>,
    video: Option<String>,
}

impl Collected {
    /// `describe` holds the titles of enclosing describe blocks. The
    /// top-level suites are files and do not count.
    fn walk(&mut self, suite: &PwSuite, describe: &mut Vec<String>) {
        for spec in &suite.specs {
            for test in &spec.tests {
                let result = self.convert(spec, test, describe);
                self.tests.push(result);
            }
        }
        for child in &suite.suites {
            describe.push(child.title.clone());
            self.walk(child, describe);
            describe.pop();
        }
    }

    fn convert(&mut self, spec: &PwSpec, test: &PwTest, describe: &[String]) -> TestResult {
        let status = match test.status.as_str() {
            "expected" => TestStatus::Passed,
            "unexpected" => TestStatus::Failed,
            "flaky" => TestStatus::Flakey,
            "skipped" => TestStatus::Skipped,
            other => {
                warn!("Unknown Playwright test status {:?}, treating as failed", other);
                TestStatus::Failed
            }
        };
        let last = test.results.last();
        let retry = last.map(|r| r.retry).unwrap_or_default();

        let mut result = TestResult::new(spec.title.clone(), status, retry);
        if !describe.is_empty() {
            result.context = Some(describe.join(" > "));
        }
        result.browser = test.project_name.clone().filter(|p| !p.is_empty());

        let Some(last) = last else {
            return result;
        };
        result.duration_ms = last.duration;
        result.started_at = last.start_time;
        result.finished_at = last
            .start_time
            .and_then(|t| chrono::Duration::try_milliseconds(last.duration as i64).map(|d| t + d));
        result.error = last.error.as_ref().map(|err| {
            let code_frame = err.location.as_ref().map(|loc| CodeFrame {
                file: loc.file.clone(),
                line: loc.line,
                column: loc.column,
                language: None,
                frame: err.snippet.clone(),
            });
            TestError {
                title: None,
                kind: None,
                message: err.message.clone().unwrap_or_default(),
                stack: err.stack.clone(),
                test_line: code_frame.as_ref().map(|cf| cf.line),
                code_frame,
            }
        });

        for attachment in &last.attachments {
            let Some(path) = &attachment.path else { continue };
            if attachment.content_type.starts_with("image/") && status == TestStatus::Failed {
                result.failure_screenshots.push(path.clone());
            } else if attachment.content_type.starts_with("video/")
                && status == TestStatus::Failed
                && self.video.is_none()
            {
                self.video = Some(path.clone());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use specgrid_common::testing::sample_testrun;
    use tempfile::TempDir;

    const REPORT: &str = r#"{
      "config": {},
      "suites": [
        {
          "title": "checkout.spec.ts",
          "file": "checkout.spec.ts",
          "specs": [
            {
              "title": "loads",
              "ok": true,
              "tests": [
                {
                  "projectName": "chromium",
                  "expectedStatus": "passed",
                  "status": "expected",
                  "results": [
                    {"retry": 0, "status": "passed", "duration": 420, "startTime": "2024-03-01T10:00:00.000Z", "attachments": []}
                  ]
                },
                {
                  "projectName": "firefox",
                  "expectedStatus": "passed",
                  "status": "flaky",
                  "results": [
                    {"retry": 0, "status": "failed", "duration": 900, "attachments": []},
                    {"retry": 1, "status": "passed", "duration": 610, "attachments": []}
                  ]
                }
              ]
            }
          ],
          "suites": [
            {
              "title": "Payment",
              "specs": [],
              "suites": [
                {
                  "title": "card",
                  "specs": [
                    {
                      "title": "rejects expired card",
                      "ok": false,
                      "tests": [
                        {
                          "projectName": "chromium",
                          "status": "unexpected",
                          "results": [
                            {
                              "retry": 0,
                              "status": "failed",
                              "duration": 3100,
                              "startTime": "2024-03-01T10:00:01.000Z",
                              "error": {
                                "message": "expect(locator).toBeVisible() failed",
                                "stack": "Error: expect(locator).toBeVisible() failed\n    at checkout.spec.ts:22:31",
                                "location": {"file": "/src/tests/checkout.spec.ts", "line": 22, "column": 31},
                                "snippet": "> 22 |   await expect(page.locator('.error')).toBeVisible();"
                              },
                              "attachments": [
                                {"name": "screenshot", "contentType": "image/png", "path": "/results/artifacts/test-failed-1.png"},
                                {"name": "video", "contentType": "video/webm", "path": "/results/artifacts/video.webm"},
                                {"name": "trace", "contentType": "application/zip", "path": "/results/artifacts/trace.zip"}
                              ]
                            }
                          ]
                        }
                      ]
                    },
                    {
                      "title": "supports wallets",
                      "tests": [
                        {"projectName": "chromium", "status": "skipped", "results": []}
                      ]
                    }
                  ]
                }
              ]
            }
          ]
        }
      ],
      "errors": []
    }"#;

    fn playwright(dir: &TempDir, browsers: &[&str], retries: u32) -> Playwright {
        let mut project = sample_testrun(1, TestFramework::Playwright).project;
        project.browsers = browsers.iter().map(|b| b.to_string()).collect();
        project.runner_retries = retries;
        Playwright::new(&project, dir.path().join("results"), false)
    }

    #[test]
    fn test_single_invocation_with_projects() {
        let dir = TempDir::new().unwrap();
        let invocations = playwright(&dir, &["chromium", "firefox"], 2)
            .invocations("tests/checkout.spec.ts", "http://127.0.0.1:4000");
        assert_eq!(invocations.len(), 1);

        let inv = &invocations[0];
        assert!(inv.browser.is_none());
        let line = inv.command.display();
        assert!(line.starts_with("playwright test tests/checkout.spec.ts --reporter=json --output="));
        assert!(line.ends_with("--retries=2 --project=chromium --project=firefox"));
        let output = inv.results_file().display().to_string();
        assert!(inv
            .command
            .env
            .contains(&("PLAYWRIGHT_JSON_OUTPUT_NAME".to_string(), output)));
        assert!(inv
            .command
            .env
            .contains(&("BASE_URL".to_string(), "http://127.0.0.1:4000".to_string())));
    }

    #[test]
    fn test_no_retries_flag_when_zero() {
        let dir = TempDir::new().unwrap();
        let inv = playwright(&dir, &[], 0).invocations("a.spec.ts", "http://x").remove(0);
        assert!(!inv.command.display().contains("--retries"));
        assert!(!inv.command.display().contains("--project"));
    }

    #[test]
    fn test_collect_maps_nested_suites() {
        let dir = TempDir::new().unwrap();
        let adapter = playwright(&dir, &[], 0);
        let inv = adapter.invocations("checkout.spec.ts", "http://x").remove(0);
        std::fs::create_dir_all(&inv.results_dir).unwrap();
        std::fs::write(inv.results_file(), REPORT).unwrap();

        let result = adapter.collect(&inv).unwrap().unwrap();
        let summary: Vec<(&str, TestStatus, Option<&str>)> = result
            .tests
            .iter()
            .map(|t| (t.title.as_str(), t.status, t.browser.as_deref()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("loads", TestStatus::Passed, Some("chromium")),
                ("loads", TestStatus::Flakey, Some("firefox")),
                ("rejects expired card", TestStatus::Failed, Some("chromium")),
                ("supports wallets", TestStatus::Skipped, Some("chromium")),
            ]
        );

        assert_eq!(result.tests[0].context, None);
        assert_eq!(result.tests[1].retry, 1);
        assert_eq!(result.tests[1].duration_ms, 610);

        let failed = &result.tests[2];
        assert_eq!(failed.context.as_deref(), Some("Payment > card"));
        assert_eq!(failed.failure_screenshots, vec!["/results/artifacts/test-failed-1.png"]);
        let err = failed.error.as_ref().unwrap();
        assert_eq!(err.test_line, Some(22));
        let frame = err.code_frame.as_ref().unwrap();
        assert_eq!(frame.file, "/src/tests/checkout.spec.ts");
        assert_eq!(frame.column, 31);
        assert!(frame.frame.as_deref().unwrap().contains("toBeVisible"));
        assert_eq!(
            failed.finished_at.unwrap().to_rfc3339(),
            "2024-03-01T10:00:04.100+00:00"
        );

        assert_eq!(result.video.as_deref(), Some("/results/artifacts/video.webm"));
    }

    #[test]
    fn test_missing_results_file() {
        let dir = TempDir::new().unwrap();
        let adapter = playwright(&dir, &[], 0);
        let inv = adapter.invocations("a.spec.ts", "http://x").remove(0);
        assert!(adapter.collect(&inv).unwrap().is_none());
    }
}
