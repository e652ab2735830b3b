//! Package manager selection and framework priming

use specgrid_common::{CommandSpec, Error, Result, TestFramework};
use std::path::Path;

/// Package manager, picked by which lockfile the checkout carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Npm,
    /// Yarn 1.x
    Yarn,
    /// Yarn 2+ (`.yarnrc.yml` present)
    YarnBerry,
}

impl PackageManager {
    /// `yarn.lock` wins over `package-lock.json`.
    pub fn detect(src_dir: &Path) -> Result<Self> {
        if src_dir.join("yarn.lock").is_file() {
            if src_dir.join(".yarnrc.yml").is_file() {
                return Ok(PackageManager::YarnBerry);
            }
            return Ok(PackageManager::Yarn);
        }
        if src_dir.join("package-lock.json").is_file() {
            return Ok(PackageManager::Npm);
        }
        Err(Error::BuildFailed("no lock file".to_string()))
    }

    pub fn lockfile(&self) -> &'static str {
        match self {
            PackageManager::Npm => "package-lock.json",
            PackageManager::Yarn | PackageManager::YarnBerry => "yarn.lock",
        }
    }

    /// Install exactly what the lockfile pins, failing if it is out of date.
    pub fn install_command(&self) -> CommandSpec {
        match self {
            PackageManager::Npm => CommandSpec::new("npm").arg("ci"),
            PackageManager::Yarn => CommandSpec::new("yarn").args(["install", "--frozen-lockfile"]),
            PackageManager::YarnBerry => CommandSpec::new("yarn").args(["install", "--immutable"]),
        }
    }
}

/// Downloads the framework's own binaries into the cache directory.
pub fn prime_command(framework: TestFramework) -> CommandSpec {
    match framework {
        TestFramework::Cypress => CommandSpec::new("cypress").arg("install"),
        TestFramework::Playwright => CommandSpec::new("playwright").arg("install"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &TempDir, name: &str) {
        std::fs::write(dir.path().join(name), "").unwrap();
    }

    #[test]
    fn test_detect_npm() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "package-lock.json");
        let pm = PackageManager::detect(dir.path()).unwrap();
        assert_eq!(pm, PackageManager::Npm);
        assert_eq!(pm.install_command().display(), "npm ci");
    }

    #[test]
    fn test_yarn_lock_wins() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "package-lock.json");
        touch(&dir, "yarn.lock");
        let pm = PackageManager::detect(dir.path()).unwrap();
        assert_eq!(pm, PackageManager::Yarn);
        assert_eq!(pm.lockfile(), "yarn.lock");
        assert_eq!(pm.install_command().display(), "yarn install --frozen-lockfile");
    }

    #[test]
    fn test_yarn_berry() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "yarn.lock");
        touch(&dir, ".yarnrc.yml");
        let pm = PackageManager::detect(dir.path()).unwrap();
        assert_eq!(pm.install_command().display(), "yarn install --immutable");
    }

    #[test]
    fn test_no_lockfile() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "package.json");
        let err = PackageManager::detect(dir.path()).unwrap_err();
        assert!(matches!(err, Error::BuildFailed(ref m) if m == "no lock file"));
    }

    #[test]
    fn test_prime_commands() {
        assert_eq!(prime_command(TestFramework::Cypress).display(), "cypress install");
        assert_eq!(prime_command(TestFramework::Playwright).display(), "playwright install");
    }
}
