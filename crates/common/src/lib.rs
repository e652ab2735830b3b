//! Specgrid Common Library
//!
//! Shared model, build cache, spec discovery and control-plane client used
//! by the builder and the runner.

pub mod archive;
pub mod blobstore;
pub mod cache;
pub mod command;
pub mod config;
pub mod context;
pub mod control;
pub mod discovery;
pub mod error;
pub mod queue;
pub mod retry;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use blobstore::{open_blob_store, BlobStore, HttpBlobStore, LocalBlobStore};
pub use cache::BuildCache;
pub use command::{
    ActivityClock, CommandOutput, CommandRunner, CommandSpec, ExitInfo, NodeEnvironment,
    SupervisedProcess, SystemCommandRunner,
};
pub use config::Settings;
pub use context::AppContext;
pub use control::{ControlPlane, HttpControlPlane};
pub use discovery::discover_specs;
pub use error::{Error, ErrorKind, Result};
pub use queue::{ControlPlaneQueue, SpecQueue, SpecSet};
pub use types::*;

/// Specgrid version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
