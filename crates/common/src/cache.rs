//! Dependency cache
//!
//! Keyed by the SHA-256 of the lockfile, so the same lockfile always maps to
//! an interchangeable dependency tree and nothing ever needs invalidating.
//! Entries are `.tar.lz4` archives in a [`BlobStore`].

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::archive::{archive_name, create_archive, extract_archive};
use crate::blobstore::BlobStore;
use crate::{Error, Result};

/// What a dependency cache entry holds, relative to the build directory
pub const DEPENDENCY_PATHS: [&str; 2] = ["src/node_modules", "framework_cache"];

/// Content-addressed dependency cache
#[derive(Clone)]
pub struct BuildCache {
    store: Arc<dyn BlobStore>,
    tmp_dir: PathBuf,
    budget: Duration,
}

impl BuildCache {
    /// `budget` bounds each fetch or store as a whole.
    pub fn new(store: Arc<dyn BlobStore>, tmp_dir: impl Into<PathBuf>, budget: Duration) -> Self {
        Self {
            store,
            tmp_dir: tmp_dir.into(),
            budget,
        }
    }

    /// SHA-256 hex digest of lockfile contents
    pub fn compute_key(lockfile: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(lockfile);
        hex::encode(hasher.finalize())
    }

    /// Same as [`compute_key`](Self::compute_key), reading the file in chunks.
    pub async fn compute_key_for_file(path: impl AsRef<Path>) -> Result<String> {
        let mut file = fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 64 * 1024];

        loop {
            let n = file.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let name = archive_name(key);
        tokio::time::timeout(self.budget, self.store.exists(&name))
            .await
            .map_err(|_| Error::Timeout {
                seconds: self.budget.as_secs(),
            })?
    }

    /// Download and unpack `key` into `dest_dir`.
    ///
    /// Every failure comes back as [`Error::CacheRead`] so the caller can
    /// rebuild instead of aborting.
    pub async fn fetch(&self, key: &str, dest_dir: &Path) -> Result<()> {
        let name = archive_name(key);
        fs::create_dir_all(&self.tmp_dir).await?;
        let local = self.tmp_dir.join(&name);

        let result = tokio::time::timeout(self.budget, self.fetch_inner(&name, &local, dest_dir))
            .await
            .unwrap_or_else(|_| {
                Err(Error::CacheRead(format!(
                    "fetching {} exceeded {}s",
                    name,
                    self.budget.as_secs()
                )))
            });
        if let Err(e) = fs::remove_file(&local).await {
            debug!("Could not remove {:?}: {}", local, e);
        }

        result.map_err(|e| match e {
            Error::CacheRead(_) => e,
            other => Error::CacheRead(format!("{}: {}", name, other)),
        })
    }

    async fn fetch_inner(&self, name: &str, local: &Path, dest_dir: &Path) -> Result<()> {
        let size = self.store.download(name, local).await?;
        if size == 0 {
            return Err(Error::CacheRead(format!("{} is empty", name)));
        }
        extract_archive(local, dest_dir).await?;
        info!("Restored dependency cache {} ({} bytes)", name, size);
        Ok(())
    }

    /// Archive `include_paths` (relative to `source_dir`) and upload under `key`.
    ///
    /// Failure is logged and reported as `false`; the run carries on either way.
    pub async fn store(&self, key: &str, source_dir: &Path, include_paths: &[&str]) -> bool {
        let name = archive_name(key);
        let local = self.tmp_dir.join(&name);

        let result = tokio::time::timeout(
            self.budget,
            self.store_inner(&name, &local, source_dir, include_paths),
        )
        .await
        .unwrap_or_else(|_| {
            Err(Error::Timeout {
                seconds: self.budget.as_secs(),
            })
        });
        if let Err(e) = fs::remove_file(&local).await {
            debug!("Could not remove {:?}: {}", local, e);
        }

        match result {
            Ok(size) => {
                info!("Stored dependency cache {} ({} bytes)", name, size);
                true
            }
            Err(e) => {
                warn!("Failed to store dependency cache {}: {}", name, e);
                false
            }
        }
    }

    async fn store_inner(
        &self,
        name: &str,
        local: &Path,
        source_dir: &Path,
        include_paths: &[&str],
    ) -> Result<u64> {
        fs::create_dir_all(&self.tmp_dir).await?;
        let size = create_archive(source_dir, include_paths, &[], local).await?;
        self.store.upload(name, local).await?;
        Ok(size)
    }
}
