//! Test framework adapters
//!
//! An adapter turns a spec into one or more CLI invocations and turns what
//! those invocations leave on disk into a [`SpecResult`].

use specgrid_common::{CommandSpec, Project, Result, Settings, SpecResult, TestFramework};
use std::path::PathBuf;

use crate::cypress::Cypress;
use crate::playwright::Playwright;

/// File every invocation writes its results to, inside its results directory
pub const RESULTS_FILE: &str = "out.json";

/// One framework process to run for a spec
#[derive(Debug, Clone)]
pub struct Invocation {
    pub browser: Option<String>,
    pub command: CommandSpec,
    /// Wiped before every launch
    pub results_dir: PathBuf,
}

impl Invocation {
    pub fn results_file(&self) -> PathBuf {
        self.results_dir.join(RESULTS_FILE)
    }
}

pub trait Framework: Send + Sync {
    fn kind(&self) -> TestFramework;

    /// Processes to run for `spec`, in order. Results are merged.
    fn invocations(&self, spec: &str, base_url: &str) -> Vec<Invocation>;

    /// Read what `invocation` produced. `Ok(None)` when it left no results file.
    fn collect(&self, invocation: &Invocation) -> Result<Option<SpecResult>>;
}

/// The adapter for `project`, with any support files it needs written out.
pub fn for_project(project: &Project, settings: &Settings) -> Result<Box<dyn Framework>> {
    let results_root = settings.results_dir();
    match project.test_framework {
        TestFramework::Cypress => {
            let reporter = settings.tmp_dir().join("cypress-json-reporter.js");
            Cypress::install_reporter(&reporter)?;
            Ok(Box::new(Cypress::new(
                project,
                results_root,
                reporter,
                settings.verbose_runner_output,
            )))
        }
        TestFramework::Playwright => Ok(Box::new(Playwright::new(
            project,
            results_root,
            settings.verbose_runner_output,
        ))),
    }
}
