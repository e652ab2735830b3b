//! Git checkout of the project under test

use specgrid_common::{CommandRunner, CommandSpec, Error, Result};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

/// Clones a repository into an empty directory and resolves the commit
pub struct GitCheckout<'a> {
    runner: &'a dyn CommandRunner,
    timeout: Duration,
}

impl<'a> GitCheckout<'a> {
    pub fn new(runner: &'a dyn CommandRunner, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// Check out `branch` (or the pinned `sha`) into `dir` and return the commit.
    ///
    /// `dir` is wiped first. Without a pinned commit the clone is shallow.
    /// A pinned commit needs the full history so it can be reset to.
    pub async fn checkout(
        &self,
        url: &str,
        branch: &str,
        sha: Option<&str>,
        dir: &Path,
    ) -> Result<String> {
        wipe_dir(dir).await?;

        match sha {
            None => {
                info!("Cloning {} (branch {}, shallow)", url, branch);
                self.run(dir, &[
                    "clone", "--depth", "1", "--single-branch", "--recursive", "--branch", branch, url, ".",
                ])
                .await?;
            }
            Some(sha) => {
                info!("Cloning {} at {}", url, sha);
                self.run(dir, &["clone", "--recursive", url, "."]).await?;
                self.run(dir, &["reset", "--hard", sha]).await?;
                self.run(dir, &["submodule", "update", "--init", "--recursive"])
                    .await?;
            }
        }

        let out = self
            .runner
            .capture(&self.git(dir, &["rev-parse", "HEAD"]))
            .await?;
        let resolved = out.stdout.trim().to_string();
        if resolved.is_empty() {
            return Err(Error::BuildFailed(format!(
                "could not resolve HEAD of {} after clone",
                branch
            )));
        }
        debug!("Resolved {} to {}", branch, resolved);
        Ok(resolved)
    }

    fn git(&self, dir: &Path, args: &[&str]) -> CommandSpec {
        CommandSpec::new("git")
            .args(args.iter().copied())
            .cwd(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .timeout(self.timeout)
    }

    async fn run(&self, dir: &Path, args: &[&str]) -> Result<()> {
        self.runner.stream(&self.git(dir, args)).await.map(|_| ())
    }
}

/// Remove everything in `dir`, leaving it empty.
pub(crate) async fn wipe_dir(dir: &Path) -> Result<()> {
    if fs::try_exists(dir).await? {
        fs::remove_dir_all(dir).await?;
    }
    fs::create_dir_all(dir).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use specgrid_common::testing::ScriptedCommandRunner;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_branch_checkout_is_shallow() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("stale.txt"), "left over").unwrap();
        let runner = ScriptedCommandRunner::new();
        runner.reply("git rev-parse", "1111111\n");

        let sha = GitCheckout::new(runner.as_ref(), Duration::from_secs(60))
            .checkout("https://git.example.com/app.git", "main", None, dir.path())
            .await
            .unwrap();

        assert_eq!(sha, "1111111");
        assert!(!dir.path().join("stale.txt").exists());
        assert_eq!(
            runner.commands(),
            vec![
                "git clone --depth 1 --single-branch --recursive --branch main https://git.example.com/app.git .",
                "git rev-parse HEAD",
            ]
        );
    }

    #[tokio::test]
    async fn test_pinned_sha_uses_full_clone() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedCommandRunner::new();
        runner.reply("git rev-parse", "abc123\n");

        let sha = GitCheckout::new(runner.as_ref(), Duration::from_secs(60))
            .checkout("https://git.example.com/app.git", "main", Some("abc123"), dir.path())
            .await
            .unwrap();

        assert_eq!(sha, "abc123");
        let commands = runner.commands();
        assert_eq!(commands[0], "git clone --recursive https://git.example.com/app.git .");
        assert_eq!(commands[1], "git reset --hard abc123");
        assert!(commands.iter().all(|c| !c.contains("--depth")));
    }

    #[tokio::test]
    async fn test_unresolvable_head_fails_build() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedCommandRunner::new();
        let err = GitCheckout::new(runner.as_ref(), Duration::from_secs(60))
            .checkout("u", "main", None, dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BuildFailed(_)));
    }

    #[tokio::test]
    async fn test_clone_failure_propagates() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedCommandRunner::new();
        runner.fail("git clone", 128, "fatal: repository not found");
        let err = GitCheckout::new(runner.as_ref(), Duration::from_secs(60))
            .checkout("u", "main", None, dir.path())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(128));
    }
}
