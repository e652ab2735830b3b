//! Spec loop scenarios with scripted framework processes

use serde_json::json;
use specgrid_common::testing::{sample_testrun, FakeProcess, RecordingControlPlane, ScriptedCommandRunner};
use specgrid_common::{
    ActivityClock, AppContext, CommandSpec, ControlPlaneQueue, Error, ErrorKind, Settings,
    SupervisedProcess, TestFramework, TestRun, TestStatus,
};
use specgrid_runner::{framework, LoopSummary, RunnerSupervisor};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const RUN_ID: i64 = 7;

struct Harness {
    _dir: TempDir,
    ctx: Arc<AppContext>,
    run: TestRun,
    control: Arc<RecordingControlPlane>,
    runner: Arc<ScriptedCommandRunner>,
}

impl Harness {
    fn new(framework: TestFramework, specs: &[&str], tweak: impl FnOnce(&mut TestRun)) -> Self {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            build_dir: dir.path().join("build"),
            spec_deadline_secs: 60,
            hang_poll_interval_secs: 5,
            hang_threshold_secs: 20,
            ..Default::default()
        };
        let mut run = sample_testrun(RUN_ID, framework);
        tweak(&mut run);
        let control = RecordingControlPlane::new(run.clone());
        control.queue().enqueue(RUN_ID, specs.iter().copied());
        Self {
            _dir: dir,
            ctx: AppContext::with_worker_name(settings, "runner-3"),
            run,
            control,
            runner: ScriptedCommandRunner::new(),
        }
    }

    fn supervisor(&self, cancel: CancellationToken, activity: Option<ActivityClock>) -> RunnerSupervisor {
        let framework = framework::for_project(&self.run.project, &self.ctx.settings).unwrap();
        RunnerSupervisor::new(
            self.ctx.clone(),
            &self.run,
            self.control.clone(),
            Arc::new(ControlPlaneQueue::new(self.control.clone())),
            self.runner.clone(),
            framework,
            cancel,
        )
        .with_app("http://127.0.0.1:4000", activity)
    }
}

fn env_of(cmd: &CommandSpec, key: &str) -> String {
    cmd.env
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
        .unwrap()
}

/// Playwright run that writes one passing and one failing test for the spec.
fn playwright_writes_results(cmd: &CommandSpec) -> specgrid_common::Result<Box<dyn SupervisedProcess>> {
    let spec = cmd.args[1].clone();
    let report = json!({
        "suites": [{
            "title": spec,
            "specs": [
                {"title": "works", "tests": [{"projectName": "chromium", "status": "expected",
                    "results": [{"retry": 0, "duration": 10}]}]},
                {"title": "breaks", "tests": [{"projectName": "chromium", "status": "unexpected",
                    "results": [{"retry": 0, "duration": 20, "error": {"message": "boom"}}]}]}
            ]
        }]
    });
    std::fs::write(env_of(cmd, "PLAYWRIGHT_JSON_OUTPUT_NAME"), report.to_string()).unwrap();
    Ok(Box::new(FakeProcess::exits_after(Duration::ZERO, 1)))
}

#[tokio::test]
async fn test_drains_queue_and_reports_each_spec() {
    let h = Harness::new(TestFramework::Playwright, &["a.spec.ts", "b.spec.ts"], |_| {});
    h.runner.on_spawn("playwright test", playwright_writes_results);

    let summary = h.supervisor(CancellationToken::new(), None).run().await.unwrap();

    assert_eq!(summary, LoopSummary { completed: 2, timed_out: 0 });
    let mut files: Vec<String> = h.control.completed().into_iter().map(|c| c.file).collect();
    files.sort();
    assert_eq!(files, vec!["a.spec.ts", "b.spec.ts"]);

    let first = &h.control.completed()[0];
    let statuses: Vec<TestStatus> = first.result.tests.iter().map(|t| t.status).collect();
    assert_eq!(statuses, vec![TestStatus::Passed, TestStatus::Failed]);
    assert!(!first.result.timeout);

    assert_eq!(h.control.queue().pending(RUN_ID), 0);
    assert!(h.control.returned().is_empty());
    assert!(h.control.errors().is_empty());
    assert_eq!(h.runner.commands_matching("playwright test").len(), 2);
}

#[tokio::test]
async fn test_spec_started_names_worker() {
    let h = Harness::new(TestFramework::Playwright, &["a.spec.ts"], |_| {});
    h.runner.on_spawn("playwright test", playwright_writes_results);

    h.supervisor(CancellationToken::new(), None).run().await.unwrap();

    let started = h
        .control
        .calls()
        .into_iter()
        .find_map(|c| match c {
            specgrid_common::testing::Call::SpecStarted(s) => Some(s),
            _ => None,
        })
        .unwrap();
    assert_eq!(started.file, "a.spec.ts");
    assert_eq!(started.worker_name, "runner-3");
}

#[tokio::test(start_paused = true)]
async fn test_deadline_is_reported_as_timeout_result() {
    let h = Harness::new(TestFramework::Playwright, &["slow.spec.ts"], |_| {});
    h.runner.on_spawn("playwright test", |_| Ok(Box::new(FakeProcess::hangs()) as Box<dyn SupervisedProcess>));

    let summary = h.supervisor(CancellationToken::new(), None).run().await.unwrap();

    assert_eq!(summary, LoopSummary { completed: 1, timed_out: 1 });
    let completed = h.control.completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].file, "slow.spec.ts");
    assert!(completed[0].result.timeout);
    assert!(completed[0].result.tests.is_empty());
    assert!(h.control.errors().is_empty());
    assert!(h.control.returned().is_empty());
    assert_eq!(h.control.queue().pending(RUN_ID), 0);
}

#[tokio::test(start_paused = true)]
async fn test_zero_project_deadline_falls_back_to_settings() {
    let h = Harness::new(TestFramework::Playwright, &["a.spec.ts"], |run| {
        run.project.spec_deadline = Some(0);
    });
    h.runner.on_spawn("playwright test", |cmd| {
        playwright_writes_results(cmd)?;
        Ok(Box::new(FakeProcess::exits_after(Duration::from_secs(10), 0)) as Box<dyn SupervisedProcess>)
    });

    let summary = h.supervisor(CancellationToken::new(), None).run().await.unwrap();

    assert_eq!(summary, LoopSummary { completed: 1, timed_out: 0 });
    let completed = h.control.completed();
    assert!(!completed[0].result.timeout);
    assert_eq!(completed[0].result.tests.len(), 2);
}

#[tokio::test]
async fn test_rejected_completion_returns_spec_and_fails_worker() {
    let h = Harness::new(TestFramework::Playwright, &["a.spec.ts", "b.spec.ts"], |_| {});
    h.runner.on_spawn("playwright test", playwright_writes_results);
    h.control.reject_completions(1);

    let err = h.supervisor(CancellationToken::new(), None).run().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Unexpected);
    assert_eq!(h.control.returned().len(), 1);
    assert!(h.control.completed().is_empty());
    assert!(h.control.errors().is_empty());
    // The worker stops after the first spec; the other one stays pending.
    assert_eq!(h.control.queue().pending(RUN_ID), 2);
    assert_eq!(h.runner.commands_matching("playwright test").len(), 1);
}

#[tokio::test]
async fn test_missing_results_returns_spec_and_fails_worker() {
    let h = Harness::new(TestFramework::Playwright, &["a.spec.ts"], |_| {});
    h.runner.on_spawn("playwright test", |_| {
        Ok(Box::new(FakeProcess::exits_after(Duration::ZERO, 1)) as Box<dyn SupervisedProcess>)
    });

    let err = h.supervisor(CancellationToken::new(), None).run().await.unwrap_err();

    assert!(matches!(err, Error::RunFailed(_)));
    assert_eq!(h.control.returned(), vec!["a.spec.ts"]);
    assert_eq!(h.control.queue().pending(RUN_ID), 1);
    assert!(h.control.completed().is_empty());
    let errors = h.control.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].stage, "running");
    assert!(errors[0].message.contains("Missing results file"));
}

#[tokio::test(start_paused = true)]
async fn test_signal_relinquishes_claimed_spec() {
    let h = Harness::new(TestFramework::Playwright, &["a.spec.ts"], |_| {});
    h.runner.on_spawn("playwright test", |_| Ok(Box::new(FakeProcess::hangs()) as Box<dyn SupervisedProcess>));

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        trigger.cancel();
    });

    let err = h.supervisor(token, None).run().await.unwrap_err();

    assert!(matches!(err, Error::Cancelled(_)));
    assert_eq!(h.control.returned(), vec!["a.spec.ts"]);
    assert!(h.control.completed().is_empty());
    assert!(h.control.errors().is_empty());
}

#[tokio::test]
async fn test_deleted_run_is_not_started() {
    let h = Harness::new(TestFramework::Playwright, &["a.spec.ts"], |_| {});
    h.control.delete_run();

    let summary = h.supervisor(CancellationToken::new(), None).run().await.unwrap();

    assert_eq!(summary, LoopSummary::default());
    assert!(h.runner.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_run_cancelled_during_hang_stops_without_restart() {
    let h = Harness::new(TestFramework::Playwright, &["a.spec.ts", "b.spec.ts"], |_| {});
    let control = h.control.clone();
    h.runner.on_spawn("playwright test", move |_| {
        control.delete_run();
        Ok(Box::new(FakeProcess::hangs()) as Box<dyn SupervisedProcess>)
    });

    let summary = h
        .supervisor(CancellationToken::new(), Some(ActivityClock::new()))
        .run()
        .await
        .unwrap();

    assert_eq!(summary, LoopSummary::default());
    assert_eq!(h.runner.commands_matching("playwright test").len(), 1);
    assert!(h.control.completed().is_empty());
}

#[tokio::test]
async fn test_cypress_merges_browsers_before_reporting() {
    let h = Harness::new(TestFramework::Cypress, &["cypress/e2e/login.cy.ts"], |run| {
        run.project.browsers = vec!["chrome".into(), "firefox".into()];
    });
    h.runner.on_spawn("cypress run", |cmd| {
        let output = cmd
            .args
            .iter()
            .find_map(|a| a.strip_prefix("output="))
            .unwrap()
            .to_string();
        let report = json!({"tests": [
            {"title": "logs in", "titlePath": ["Login", "logs in"], "state": "passed", "duration": 5}
        ]});
        std::fs::write(output, report.to_string()).unwrap();
        Ok(Box::new(FakeProcess::exits_after(Duration::ZERO, 0)) as Box<dyn SupervisedProcess>)
    });

    h.supervisor(CancellationToken::new(), None).run().await.unwrap();

    let completed = h.control.completed();
    assert_eq!(completed.len(), 1);
    let browsers: Vec<Option<String>> = completed[0].result.tests.iter().map(|t| t.browser.clone()).collect();
    assert_eq!(browsers, vec![Some("chrome".to_string()), Some("firefox".to_string())]);
    assert_eq!(h.runner.commands_matching("cypress run").len(), 2);
}
