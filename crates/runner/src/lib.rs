//! Specgrid spec worker
//!
//! A worker pulls specs for one test run from the control plane and runs
//! each under hang supervision against a locally served copy of the app,
//! reporting results (or timeouts) back as it goes.

pub mod artifacts;
pub mod cypress;
pub mod framework;
pub mod hang;
pub mod playwright;
pub mod server;
pub mod signals;
pub mod supervisor;
pub mod worker;

pub use framework::{Framework, Invocation};
pub use hang::{HangDetector, HangPolicy, Supervised};
pub use server::AppServer;
pub use signals::cancel_on_signals;
pub use supervisor::{LoopSummary, RunnerSupervisor, SpecOutcome};
pub use worker::{Worker, WorkerExit};
