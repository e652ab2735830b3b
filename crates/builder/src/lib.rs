//! Specgrid build pipeline
//!
//! Turns a test run into a published application artifact, a warm
//! dependency cache and a list of specs for the worker pool.

pub mod checkout;
pub mod install;
pub mod pipeline;

pub use checkout::GitCheckout;
pub use install::{prime_command, PackageManager};
pub use pipeline::{BuildOutcome, BuildPipeline, BuildReport};
