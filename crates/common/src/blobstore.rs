//! Blob storage for cache and build archives
//!
//! Blobs are write-once per name. Concurrent uploads of the same name are
//! allowed and the last one wins, since equal names imply equal content.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{multipart, Body, Client, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::config::Settings;
use crate::retry::{with_retries, RetryPolicy};
use crate::{Error, Result};

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Existence probe; never downloads.
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Download `name` to `dest`, returning the byte count.
    async fn download(&self, name: &str, dest: &Path) -> Result<u64>;

    /// Upload the file at `src` under `name`.
    async fn upload(&self, name: &str, src: &Path) -> Result<()>;
}

/// The store named by `blob_store_url`: `file:///path` for a local
/// directory, anything else over HTTP.
pub async fn open_blob_store(settings: &Settings) -> Result<Arc<dyn BlobStore>> {
    match settings.blob_store_url.strip_prefix("file://") {
        Some(path) => Ok(Arc::new(LocalBlobStore::new(path).await?)),
        None => Ok(Arc::new(HttpBlobStore::new(settings)?)),
    }
}

/// Blob store reached over HTTP: `HEAD/GET /{name}`, `POST /upload`
#[derive(Debug, Clone)]
pub struct HttpBlobStore {
    base_url: String,
    client: Client,
    token: Option<String>,
    retry: RetryPolicy,
    probe_timeout: std::time::Duration,
}

impl HttpBlobStore {
    pub fn new(settings: &Settings) -> Result<Self> {
        // Only connects and probes are time-limited; transfers run under the caller's budget.
        let client = Client::builder()
            .connect_timeout(settings.http_timeout())
            .build()?;
        Ok(Self {
            base_url: settings.blob_store_url.trim_end_matches('/').to_string(),
            client,
            token: settings.api_token.clone(),
            retry: RetryPolicy::from_settings(settings),
            probe_timeout: settings.http_timeout(),
        })
    }

    fn url(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn head_once(&self, name: &str) -> Result<bool> {
        let resp = self
            .authorize(self.client.head(self.url(name)))
            .timeout(self.probe_timeout)
            .send()
            .await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(Error::BlobStore {
                name: name.to_string(),
                status: s.as_u16(),
            }),
        }
    }

    async fn download_once(&self, name: &str, dest: &Path) -> Result<u64> {
        let resp = self
            .authorize(self.client.get(self.url(name)))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::BlobStore {
                name: name.to_string(),
                status: resp.status().as_u16(),
            });
        }

        let tmp = partial_path(dest);
        let mut file = fs::File::create(&tmp).await?;
        let mut stream = resp.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);
        fs::rename(&tmp, dest).await?;
        Ok(written)
    }

    async fn upload_once(&self, name: &str, src: &Path) -> Result<()> {
        let file = fs::File::open(src).await?;
        let len = file.metadata().await?.len();
        let part = multipart::Part::stream_with_length(Body::wrap_stream(ReaderStream::new(file)), len)
            .file_name(name.to_string());
        let form = multipart::Form::new().part("file", part);

        let resp = self
            .authorize(self.client.post(format!("{}/upload", self.base_url)))
            .multipart(form)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::BlobStore {
                name: name.to_string(),
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn exists(&self, name: &str) -> Result<bool> {
        with_retries(&self.retry, "blob HEAD", move || self.head_once(name)).await
    }

    async fn download(&self, name: &str, dest: &Path) -> Result<u64> {
        let written =
            with_retries(&self.retry, "blob GET", move || self.download_once(name, dest)).await?;
        debug!("Downloaded {} ({} bytes)", name, written);
        Ok(written)
    }

    async fn upload(&self, name: &str, src: &Path) -> Result<()> {
        with_retries(&self.retry, "blob upload", move || self.upload_once(name, src)).await?;
        info!("Uploaded {}", name);
        Ok(())
    }
}

/// Filesystem blob store with sharded paths and atomic writes
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("objects")).await?;
        fs::create_dir_all(root.join("tmp")).await?;
        info!("Initialized blob store at {:?}", root);
        Ok(Self { root })
    }

    /// Path for a blob; the first two characters pick the shard directory.
    pub fn object_path(&self, name: &str) -> PathBuf {
        let (prefix, _) = name.split_at(2.min(name.len()));
        self.root.join("objects").join(prefix).join(name)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(fs::try_exists(self.object_path(name)).await?)
    }

    async fn download(&self, name: &str, dest: &Path) -> Result<u64> {
        let path = self.object_path(name);
        if !fs::try_exists(&path).await? {
            return Err(Error::BlobStore {
                name: name.to_string(),
                status: 404,
            });
        }
        Ok(fs::copy(&path, dest).await?)
    }

    async fn upload(&self, name: &str, src: &Path) -> Result<()> {
        let path = self.object_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self
            .root
            .join("tmp")
            .join(format!("{}.{}.tmp", name, std::process::id()));
        fs::copy(src, &tmp).await?;
        fs::rename(&tmp, &path).await?;
        debug!("Stored blob {}", name);
        Ok(())
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::extract::{Multipart, Path as AxumPath, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::Router;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    type Blobs = Arc<Mutex<HashMap<String, Vec<u8>>>>;

    async fn get_blob(State(blobs): State<Blobs>, AxumPath(name): AxumPath<String>) -> (AxumStatus, Vec<u8>) {
        match blobs.lock().get(&name) {
            Some(data) => (AxumStatus::OK, data.clone()),
            None => (AxumStatus::NOT_FOUND, Vec::new()),
        }
    }

    async fn upload_blob(State(blobs): State<Blobs>, mut multipart: Multipart) -> AxumStatus {
        while let Ok(Some(field)) = multipart.next_field().await {
            let name = field.file_name().unwrap_or_default().to_string();
            let data: Bytes = field.bytes().await.unwrap();
            blobs.lock().insert(name, data.to_vec());
        }
        AxumStatus::OK
    }

    async fn spawn_store(blobs: Blobs) -> String {
        let app = Router::new()
            .route("/upload", post(upload_blob))
            .route("/:name", get(get_blob))
            .with_state(blobs);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn settings_for(url: String) -> Settings {
        Settings {
            blob_store_url: url,
            max_http_retries: 2,
            http_retry_delay_ms: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_http_store_roundtrip() {
        let blobs: Blobs = Arc::default();
        let url = spawn_store(blobs.clone()).await;
        let store = HttpBlobStore::new(&settings_for(url)).unwrap();

        assert!(!store.exists("abc.tar.lz4").await.unwrap());

        let dir = TempDir::new().unwrap();
        let src = dir.path().join("abc.tar.lz4");
        std::fs::write(&src, b"archive-bytes").unwrap();
        store.upload("abc.tar.lz4", &src).await.unwrap();
        assert!(store.exists("abc.tar.lz4").await.unwrap());

        let dest = dir.path().join("fetched.tar.lz4");
        let n = store.download("abc.tar.lz4", &dest).await.unwrap();
        assert_eq!(n, 13);
        assert_eq!(std::fs::read(&dest).unwrap(), b"archive-bytes");
    }

    #[tokio::test]
    async fn test_http_download_missing() {
        let url = spawn_store(Arc::default()).await;
        let store = HttpBlobStore::new(&settings_for(url)).unwrap();
        let dir = TempDir::new().unwrap();
        let err = store
            .download("missing.tar.lz4", &dir.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BlobStore { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_local_store() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path().join("blobs")).await.unwrap();
        let src = dir.path().join("in");
        std::fs::write(&src, b"data").unwrap();

        assert!(!store.exists("k1.tar.lz4").await.unwrap());
        store.upload("k1.tar.lz4", &src).await.unwrap();
        assert!(store.exists("k1.tar.lz4").await.unwrap());
        assert!(store.object_path("k1.tar.lz4").starts_with(dir.path().join("blobs/objects/k1")));

        let out = dir.path().join("out");
        assert_eq!(store.download("k1.tar.lz4", &out).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_open_file_url_is_local() {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            blob_store_url: format!("file://{}", dir.path().join("blobs").display()),
            ..Default::default()
        };
        let store = open_blob_store(&settings).await.unwrap();
        let src = dir.path().join("in");
        std::fs::write(&src, b"data").unwrap();
        store.upload("k2.tar.lz4", &src).await.unwrap();
        assert!(dir.path().join("blobs/objects/k2/k2.tar.lz4").is_file());
    }
}
