//! Control plane client
//!
//! Every call is scoped to one test run: `/testrun/{id}/...`.

use async_trait::async_trait;
use reqwest::{multipart, Client, StatusCode};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::Settings;
use crate::retry::{with_retries, RetryPolicy};
use crate::types::{
    BuildCompleted, ErrorReport, NextSpecRequest, NextSpecResponse, ReturnSpec, SpecCompleted,
    SpecStarted, TestRun, TestRunStatus, UploadResponse,
};
use crate::{Error, Result};

/// Reporting interface for one test run
#[async_trait]
pub trait ControlPlane: Send + Sync {
    fn run_id(&self) -> i64;

    /// `None` once the run has been deleted.
    async fn fetch_testrun(&self) -> Result<Option<TestRun>>;

    async fn set_status(&self, status: TestRunStatus) -> Result<()>;

    async fn build_completed(&self, payload: &BuildCompleted) -> Result<()>;

    async fn spec_started(&self, payload: &SpecStarted) -> Result<()>;

    async fn spec_completed(&self, payload: &SpecCompleted) -> Result<()>;

    async fn return_spec(&self, file: &str) -> Result<()>;

    /// Claim the next spec. `None` means the queue is empty.
    async fn next_spec(&self, worker_name: &str) -> Result<Option<String>>;

    /// Upload files, returning one URL per file in the same order.
    async fn upload_artifacts(&self, files: &[PathBuf]) -> Result<Vec<String>>;

    async fn report_error(&self, report: &ErrorReport) -> Result<()>;
}

/// HTTP implementation with bounded retries
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    base_url: String,
    run_id: i64,
    client: Client,
    token: Option<String>,
    retry: RetryPolicy,
}

impl HttpControlPlane {
    pub fn new(settings: &Settings, run_id: i64) -> Result<Self> {
        let client = Client::builder().timeout(settings.http_timeout()).build()?;
        Ok(Self {
            base_url: settings.control_plane_url.trim_end_matches('/').to_string(),
            run_id,
            client,
            token: settings.api_token.clone(),
            retry: RetryPolicy::from_settings(settings),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        if endpoint.is_empty() {
            format!("{}/testrun/{}", self.base_url, self.run_id)
        } else {
            format!("{}/testrun/{}/{}", self.base_url, self.run_id, endpoint)
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn post_once<B: Serialize + ?Sized + Sync>(
        &self,
        endpoint: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Response> {
        let mut req = self.authorize(self.client.post(self.url(endpoint)));
        if let Some(body) = body {
            req = req.json(body);
        }
        check(endpoint, req.send().await?).await
    }

    async fn post_json<B: Serialize + ?Sized + Sync>(&self, endpoint: &str, body: &B) -> Result<()> {
        with_retries(&self.retry, endpoint, move || self.post_once(endpoint, Some(body))).await?;
        debug!("POST {} ok", endpoint);
        Ok(())
    }

    async fn upload_once(&self, files: &[PathBuf]) -> Result<Vec<String>> {
        let mut form = multipart::Form::new();
        for path in files {
            let data = tokio::fs::read(path).await?;
            let part = multipart::Part::bytes(data)
                .file_name(file_name(path))
                .mime_str(mime_for(path))?;
            form = form.part("files", part);
        }
        let req = self
            .authorize(self.client.post(self.url("upload-artifacts")))
            .multipart(form);
        let resp = check("upload-artifacts", req.send().await?).await?;
        let body: UploadResponse = resp.json().await?;
        if body.urls.len() != files.len() {
            return Err(Error::Internal(format!(
                "upload returned {} urls for {} files",
                body.urls.len(),
                files.len()
            )));
        }
        Ok(body.urls)
    }
}

async fn check(endpoint: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let message: String = resp
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(500)
        .collect();
    Err(Error::ControlPlane {
        endpoint: endpoint.to_string(),
        status,
        message,
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string())
}

fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    fn run_id(&self) -> i64 {
        self.run_id
    }

    async fn fetch_testrun(&self) -> Result<Option<TestRun>> {
        with_retries(&self.retry, "testrun", || async {
            let resp = self.authorize(self.client.get(self.url(""))).send().await?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let resp = check("testrun", resp).await?;
            Ok(Some(resp.json::<TestRun>().await?))
        })
        .await
    }

    async fn set_status(&self, status: TestRunStatus) -> Result<()> {
        let endpoint = format!("status/{}", status);
        with_retries(&self.retry, &endpoint, || self.post_once::<()>(&endpoint, None)).await?;
        info!("Run {} status -> {}", self.run_id, status);
        Ok(())
    }

    async fn build_completed(&self, payload: &BuildCompleted) -> Result<()> {
        self.post_json("build-completed", payload).await
    }

    async fn spec_started(&self, payload: &SpecStarted) -> Result<()> {
        self.post_json("spec-started", payload).await
    }

    async fn spec_completed(&self, payload: &SpecCompleted) -> Result<()> {
        self.post_json("spec-completed", payload).await
    }

    async fn return_spec(&self, file: &str) -> Result<()> {
        self.post_json(
            "return-spec",
            &ReturnSpec {
                file: file.to_string(),
            },
        )
        .await
    }

    async fn next_spec(&self, worker_name: &str) -> Result<Option<String>> {
        let body = NextSpecRequest {
            worker_name: worker_name.to_string(),
        };
        let resp = with_retries(&self.retry, "next-spec", || {
            self.post_once("next-spec", Some(&body))
        })
        .await?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let text = resp.text().await?;
        let spec = match serde_json::from_str::<NextSpecResponse>(&text) {
            Ok(parsed) => parsed.spec,
            Err(_) => text.trim().to_string(),
        };
        Ok(if spec.is_empty() { None } else { Some(spec) })
    }

    async fn upload_artifacts(&self, files: &[PathBuf]) -> Result<Vec<String>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        with_retries(&self.retry, "upload-artifacts", || self.upload_once(files)).await
    }

    async fn report_error(&self, report: &ErrorReport) -> Result<()> {
        self.post_json("error", report).await
    }
}
