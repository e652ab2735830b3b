//! Process context
//!
//! Built once at startup and handed to every component that needs settings
//! or the worker identity.

use std::sync::Arc;

use crate::config::Settings;

#[derive(Debug, Clone)]
pub struct AppContext {
    pub settings: Settings,
    /// Name reported to the control plane for this pod
    pub worker_name: String,
}

impl AppContext {
    pub fn new(settings: Settings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            worker_name: worker_name(),
        })
    }

    pub fn with_worker_name(settings: Settings, worker_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            worker_name: worker_name.into(),
        })
    }
}

/// `$HOSTNAME` (the pod name under Kubernetes), then the kernel hostname.
fn worker_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            hostname::get()
                .ok()
                .map(|h| h.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "specgrid-worker".to_string())
}
