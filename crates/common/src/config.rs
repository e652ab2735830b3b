//! Worker and builder settings
//!
//! Loaded from an optional TOML file, then overridden by `SPECGRID_*`
//! environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

const ENV_PREFIX: &str = "SPECGRID_";

/// Settings shared by the `build` and `run` entry points
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Control plane base URL
    pub control_plane_url: String,

    /// Blob store base URL
    pub blob_store_url: String,

    /// Bearer token for both services
    pub api_token: Option<String>,

    /// Scratch root for the checkout, caches and results
    pub build_dir: PathBuf,

    /// Hard deadline for one spec, unless the project sets its own
    pub spec_deadline_secs: u64,

    /// How often a running spec is polled for liveness
    pub hang_poll_interval_secs: u64,

    /// How long every liveness signal must be quiet before a restart
    pub hang_threshold_secs: u64,

    /// Budget for each build step and for cache transfers
    pub build_timeout_secs: u64,

    /// How long to wait for a project's own server to answer
    pub server_start_timeout_secs: u64,

    /// Per-request timeout for outbound HTTP
    pub http_timeout_secs: u64,

    /// Attempts per outbound HTTP call
    pub max_http_retries: u32,

    /// Pause between HTTP attempts
    pub http_retry_delay_ms: u64,

    /// Sleep instead of exiting after an unrecovered error
    pub keepalive_on_failure: bool,

    /// Log every line of test runner output. Also enables output-based hang detection.
    pub verbose_runner_output: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            control_plane_url: "http://127.0.0.1:5000".to_string(),
            blob_store_url: "http://127.0.0.1:5001".to_string(),
            api_token: None,
            build_dir: PathBuf::from("/tmp/specgrid/build"),
            spec_deadline_secs: 300,
            hang_poll_interval_secs: 5,
            hang_threshold_secs: 120,
            build_timeout_secs: 900,
            server_start_timeout_secs: 600,
            http_timeout_secs: 30,
            max_http_retries: 10,
            http_retry_delay_ms: 2000,
            keepalive_on_failure: false,
            verbose_runner_output: false,
        }
    }
}

impl Settings {
    /// Load from a TOML file if it exists, then apply the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(p)?;
                debug!("Loading settings from {:?}", p);
                toml::from_str(&content)
                    .map_err(|e| Error::InvalidConfig(format!("{}: {}", p.display(), e)))?
            }
            _ => Settings::default(),
        };
        settings.apply_env(std::env::vars())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `SPECGRID_*` overrides from an arbitrary variable source.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "CONTROL_PLANE_URL" => self.control_plane_url = value,
                "BLOB_STORE_URL" => self.blob_store_url = value,
                "API_TOKEN" => self.api_token = Some(value),
                "BUILD_DIR" => self.build_dir = PathBuf::from(value),
                "SPEC_DEADLINE_SECS" => self.spec_deadline_secs = parse_num(&key, &value)?,
                "HANG_POLL_INTERVAL_SECS" => {
                    self.hang_poll_interval_secs = parse_num(&key, &value)?
                }
                "HANG_THRESHOLD_SECS" => self.hang_threshold_secs = parse_num(&key, &value)?,
                "BUILD_TIMEOUT_SECS" => self.build_timeout_secs = parse_num(&key, &value)?,
                "SERVER_START_TIMEOUT_SECS" => {
                    self.server_start_timeout_secs = parse_num(&key, &value)?
                }
                "HTTP_TIMEOUT_SECS" => self.http_timeout_secs = parse_num(&key, &value)?,
                "MAX_HTTP_RETRIES" => self.max_http_retries = parse_num(&key, &value)?,
                "HTTP_RETRY_DELAY_MS" => self.http_retry_delay_ms = parse_num(&key, &value)?,
                "KEEPALIVE_ON_FAILURE" => self.keepalive_on_failure = parse_bool(&value),
                "VERBOSE_RUNNER_OUTPUT" => self.verbose_runner_output = parse_bool(&value),
                _ => debug!("Ignoring unknown setting {}", key),
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.hang_poll_interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "hang_poll_interval_secs must be at least 1".into(),
            ));
        }
        if self.spec_deadline_secs == 0 {
            return Err(Error::InvalidConfig(
                "spec_deadline_secs must be at least 1".into(),
            ));
        }
        if self.max_http_retries == 0 {
            return Err(Error::InvalidConfig("max_http_retries must be at least 1".into()));
        }
        Ok(())
    }

    /// Checkout of the repository under test
    pub fn src_dir(&self) -> PathBuf {
        self.build_dir.join("src")
    }

    /// Cypress or Playwright binary cache
    pub fn framework_cache_dir(&self) -> PathBuf {
        self.build_dir.join("framework_cache")
    }

    /// Per-invocation framework output
    pub fn results_dir(&self) -> PathBuf {
        self.build_dir.join("results")
    }

    /// Archives in flight
    pub fn tmp_dir(&self) -> PathBuf {
        self.build_dir.join("tmp")
    }

    pub fn spec_deadline(&self) -> Duration {
        Duration::from_secs(self.spec_deadline_secs)
    }

    pub fn hang_poll_interval(&self) -> Duration {
        Duration::from_secs(self.hang_poll_interval_secs)
    }

    pub fn hang_threshold(&self) -> Duration {
        Duration::from_secs(self.hang_threshold_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn server_start_timeout(&self) -> Duration {
        Duration::from_secs(self.server_start_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn http_retry_delay(&self) -> Duration {
        Duration::from_millis(self.http_retry_delay_ms)
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{} is not a number: {:?}", key, value)))
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
