//! Failure artifact upload
//!
//! Local screenshot and video paths in a result are swapped for the URLs the
//! control plane hands back. Losing artifacts never loses the result: on
//! failure they are dropped from the report and the spec still completes.

use specgrid_common::{ControlPlane, SpecResult};
use std::path::PathBuf;
use tracing::{debug, warn};

pub async fn upload_artifacts(control: &dyn ControlPlane, result: &mut SpecResult) {
    upload_screenshots(control, result).await;
    upload_video(control, result).await;
}

async fn upload_screenshots(control: &dyn ControlPlane, result: &mut SpecResult) {
    let mut files = Vec::new();
    for test in &mut result.tests {
        test.failure_screenshots.retain(|path| {
            let exists = std::path::Path::new(path).is_file();
            if !exists {
                warn!("Screenshot {} is missing, dropping it", path);
            }
            exists
        });
        files.extend(test.failure_screenshots.iter().map(PathBuf::from));
    }
    if files.is_empty() {
        return;
    }

    debug!("Uploading {} screenshots", files.len());
    match control.upload_artifacts(&files).await {
        Ok(urls) => {
            let mut urls = urls.into_iter();
            for test in &mut result.tests {
                for shot in &mut test.failure_screenshots {
                    if let Some(url) = urls.next() {
                        *shot = url;
                    }
                }
            }
        }
        Err(e) => {
            warn!("Screenshot upload failed, reporting without them: {}", e);
            for test in &mut result.tests {
                test.failure_screenshots.clear();
            }
        }
    }
}

async fn upload_video(control: &dyn ControlPlane, result: &mut SpecResult) {
    let Some(path) = result.video.take() else {
        return;
    };
    let path = PathBuf::from(path);
    if !path.is_file() {
        warn!("Video {} is missing, dropping it", path.display());
        return;
    }
    match control.upload_artifacts(std::slice::from_ref(&path)).await {
        Ok(urls) => result.video = urls.into_iter().next(),
        Err(e) => warn!("Video upload failed, reporting without it: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use specgrid_common::testing::{sample_testrun, Call, RecordingControlPlane};
    use specgrid_common::{TestFramework, TestResult, TestStatus};
    use tempfile::TempDir;

    fn failed(title: &str, shots: &[String]) -> TestResult {
        let mut t = TestResult::new(title, TestStatus::Failed, 0);
        t.failure_screenshots = shots.to_vec();
        t
    }

    #[tokio::test]
    async fn test_screenshots_in_one_request_then_video() {
        let dir = TempDir::new().unwrap();
        let path = |name: &str| {
            let p = dir.path().join(name);
            std::fs::write(&p, b"bytes").unwrap();
            p.display().to_string()
        };
        let mut result = SpecResult {
            tests: vec![
                failed("a", &[path("a1.png"), path("a2.png")]),
                TestResult::new("b", TestStatus::Passed, 0),
                failed("c", &[path("c1.png")]),
            ],
            timeout: false,
            video: Some(path("spec.mp4")),
        };
        let control = RecordingControlPlane::new(sample_testrun(1, TestFramework::Cypress));

        upload_artifacts(control.as_ref(), &mut result).await;

        let uploads: Vec<Vec<String>> = control
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Upload(names) => Some(names),
                _ => None,
            })
            .collect();
        assert_eq!(
            uploads,
            vec![
                vec!["a1.png".to_string(), "a2.png".into(), "c1.png".into()],
                vec!["spec.mp4".to_string()],
            ]
        );
        assert_eq!(
            result.tests[0].failure_screenshots,
            vec!["https://artifacts.test/a1.png", "https://artifacts.test/a2.png"]
        );
        assert_eq!(result.tests[2].failure_screenshots, vec!["https://artifacts.test/c1.png"]);
        assert_eq!(result.video.as_deref(), Some("https://artifacts.test/spec.mp4"));
    }

    #[tokio::test]
    async fn test_missing_files_are_dropped() {
        let mut result = SpecResult {
            tests: vec![failed("a", &["/nowhere/a.png".to_string()])],
            timeout: false,
            video: Some("/nowhere/v.mp4".into()),
        };
        let control = RecordingControlPlane::new(sample_testrun(1, TestFramework::Cypress));

        upload_artifacts(control.as_ref(), &mut result).await;

        assert!(control.calls().is_empty());
        assert!(result.tests[0].failure_screenshots.is_empty());
        assert!(result.video.is_none());
    }
}
