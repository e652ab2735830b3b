//! CLI Commands

pub mod build;
pub mod run;
