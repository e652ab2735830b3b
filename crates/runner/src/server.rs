//! The application under test
//!
//! Either the built output is served statically from this process, or the
//! project's own server command is started. Only the static server can see
//! requests, so only it provides the access signal for hang detection.

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use specgrid_common::{ActivityClock, CommandRunner, CommandSpec, Error, Result, SupervisedProcess};
use std::path::Path;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const READY_POLL: Duration = Duration::from_millis(500);

enum Backend {
    Static {
        shutdown: CancellationToken,
        task: JoinHandle<std::io::Result<()>>,
    },
    Command {
        process: Box<dyn SupervisedProcess>,
    },
}

pub struct AppServer {
    base_url: String,
    activity: Option<ActivityClock>,
    backend: Backend,
}

impl AppServer {
    /// Serve `root` on an ephemeral loopback port. Unknown paths get
    /// `index.html` so client-side routes resolve.
    pub async fn serve_static(root: &Path) -> Result<Self> {
        let activity = ActivityClock::new();
        let app = Router::new()
            .fallback_service(ServeDir::new(root).fallback(ServeFile::new(root.join("index.html"))))
            .layer(middleware::from_fn_with_state(activity.clone(), track_activity))
            .layer(TraceLayer::new_for_http());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
        });

        info!("Serving {} on http://{}", root.display(), addr);
        Ok(Self {
            base_url: format!("http://{}", addr),
            activity: Some(activity),
            backend: Backend::Static { shutdown, task },
        })
    }

    /// Start the project's server and wait until `GET /` answers 200.
    pub async fn spawn_command(
        runner: &dyn CommandRunner,
        cmd: CommandSpec,
        port: u16,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = format!("http://127.0.0.1:{}", port);
        let mut process = runner.spawn(&cmd)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        let deadline = Instant::now() + timeout;

        info!("Waiting for `{}` to answer on {}", cmd.display(), base_url);
        loop {
            match client.get(&base_url).send().await {
                Ok(resp) if resp.status().is_success() => break,
                Ok(resp) => debug!("Server answered {}", resp.status()),
                Err(e) => debug!("Server not ready: {}", e),
            }
            if Instant::now() >= deadline {
                process.kill().await?;
                return Err(Error::RunFailed(format!(
                    "Server did not answer on {} within {}s",
                    base_url,
                    timeout.as_secs()
                )));
            }
            if let Some(exit) = process.wait_timeout(READY_POLL).await? {
                return Err(Error::RunFailed(format!(
                    "Server command `{}` exited with {:?} before it was ready:\n{}",
                    cmd.display(),
                    exit.code,
                    process.output_tail()
                )));
            }
        }

        info!("Server ready on {}", base_url);
        Ok(Self {
            base_url,
            activity: None,
            backend: Backend::Command { process },
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// When the app last received a request. `None` when that cannot be observed.
    pub fn activity(&self) -> Option<ActivityClock> {
        self.activity.clone()
    }

    pub async fn stop(self) {
        match self.backend {
            Backend::Static { shutdown, task } => {
                shutdown.cancel();
                match task.await {
                    Ok(Ok(())) => debug!("Static server stopped"),
                    Ok(Err(e)) => warn!("Static server failed: {}", e),
                    Err(e) => warn!("Static server task panicked: {}", e),
                }
            }
            Backend::Command { mut process } => {
                if let Err(e) = process.kill().await {
                    warn!("Failed to stop server command: {}", e);
                }
            }
        }
    }
}

async fn track_activity(State(clock): State<ActivityClock>, req: Request, next: Next) -> Response {
    clock.touch();
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use specgrid_common::testing::{FakeProcess, ScriptedCommandRunner};
    use tempfile::TempDir;

    fn site() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>app</html>").unwrap();
        std::fs::create_dir_all(dir.path().join("assets")).unwrap();
        std::fs::write(dir.path().join("assets/app.js"), "console.log(1)").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_static_serves_files_with_index_fallback() {
        let dir = site();
        let server = AppServer::serve_static(dir.path()).await.unwrap();
        let clock = server.activity().unwrap();
        assert!(clock.last().is_none());

        let js = reqwest::get(format!("{}/assets/app.js", server.base_url()))
            .await
            .unwrap();
        assert_eq!(js.status(), 200);
        assert_eq!(js.text().await.unwrap(), "console.log(1)");

        let route = reqwest::get(format!("{}/orders/17", server.base_url()))
            .await
            .unwrap();
        assert_eq!(route.status(), 200);
        assert_eq!(route.text().await.unwrap(), "<html>app</html>");

        assert!(clock.last().is_some());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_command_server_waits_for_ready() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = Router::new().route("/", axum::routing::get(|| async { "ok" }));
        tokio::spawn(async move { axum::serve(listener, app).await });

        let runner = ScriptedCommandRunner::new();
        runner.on_spawn("npm run serve", |_| Ok(Box::new(FakeProcess::hangs()) as Box<dyn SupervisedProcess>));
        let server = AppServer::spawn_command(
            runner.as_ref(),
            CommandSpec::shell("npm run serve"),
            port,
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        assert_eq!(server.base_url(), format!("http://127.0.0.1:{}", port));
        assert!(server.activity().is_none());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_command_server_early_exit() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let runner = ScriptedCommandRunner::new();
        runner.on_spawn("npm run serve", |_| {
            Ok(Box::new(FakeProcess::exits_after(Duration::ZERO, 1).with_tail("EADDRINUSE"))
                as Box<dyn SupervisedProcess>)
        });
        let err = AppServer::spawn_command(
            runner.as_ref(),
            CommandSpec::shell("npm run serve"),
            port,
            Duration::from_secs(10),
        )
        .await
        .err()
        .unwrap();

        match err {
            Error::RunFailed(msg) => assert!(msg.contains("EADDRINUSE")),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
