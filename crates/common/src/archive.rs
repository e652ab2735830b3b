//! `.tar.lz4` archives
//!
//! A tar stream inside an LZ4 frame. Used for both the dependency cache and
//! the application build artifact.

use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::{Error, Result};

/// Blob name for a content key
pub fn archive_name(key: &str) -> String {
    format!("{}.tar.lz4", key)
}

/// Archive `include` (paths relative to `source_dir`) into `dest`.
///
/// Any directory or file whose name is in `exclude` is skipped with its
/// whole subtree. Returns the compressed size.
pub async fn create_archive(
    source_dir: &Path,
    include: &[&str],
    exclude: &[&str],
    dest: &Path,
) -> Result<u64> {
    let source_dir = source_dir.to_path_buf();
    let include: Vec<String> = include.iter().map(|s| s.to_string()).collect();
    let exclude: Vec<String> = exclude.iter().map(|s| s.to_string()).collect();
    let dest = dest.to_path_buf();

    tokio::task::spawn_blocking(move || create_blocking(&source_dir, &include, &exclude, &dest))
        .await
        .map_err(|e| Error::Internal(format!("archive task panicked: {}", e)))?
}

/// Unpack `src` into `dest_dir`.
///
/// Empty or undecodable input is a [`Error::CacheRead`], never a partial success.
pub async fn extract_archive(src: &Path, dest_dir: &Path) -> Result<()> {
    let src = src.to_path_buf();
    let dest_dir = dest_dir.to_path_buf();

    tokio::task::spawn_blocking(move || extract_blocking(&src, &dest_dir))
        .await
        .map_err(|e| Error::Internal(format!("extract task panicked: {}", e)))?
}

fn create_blocking(
    source_dir: &Path,
    include: &[String],
    exclude: &[String],
    dest: &Path,
) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(dest)?;
    let encoder = FrameEncoder::new(BufWriter::new(file));
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut entries = 0usize;
    for inc in include {
        let root: PathBuf = if inc.is_empty() || inc == "." {
            source_dir.to_path_buf()
        } else {
            source_dir.join(inc)
        };
        if !root.exists() {
            warn!("Archive input {:?} does not exist, skipping", root);
            continue;
        }

        let walker = WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0
                    || !e
                        .file_name()
                        .to_str()
                        .is_some_and(|n| exclude.iter().any(|x| x == n))
            });

        for entry in walker {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            let rel = entry
                .path()
                .strip_prefix(source_dir)
                .map_err(|e| Error::Internal(format!("path outside archive root: {}", e)))?;
            if rel.as_os_str().is_empty() {
                continue;
            }
            builder.append_path_with_name(entry.path(), rel)?;
            entries += 1;
        }
    }

    let encoder = builder.into_inner()?;
    let mut writer = encoder
        .finish()
        .map_err(|e| Error::Internal(format!("lz4 finish: {}", e)))?;
    writer.flush()?;
    drop(writer);

    let size = std::fs::metadata(dest)?.len();
    debug!("Archived {} entries into {:?} ({} bytes)", entries, dest, size);
    Ok(size)
}

fn extract_blocking(src: &Path, dest_dir: &Path) -> Result<()> {
    let size = std::fs::metadata(src)
        .map_err(|e| Error::CacheRead(format!("{}: {}", src.display(), e)))?
        .len();
    if size == 0 {
        return Err(Error::CacheRead(format!("{} is empty", src.display())));
    }

    std::fs::create_dir_all(dest_dir)?;
    let decoder = FrameDecoder::new(BufReader::new(File::open(src)?));
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive
        .unpack(dest_dir)
        .map_err(|e| Error::CacheRead(format!("{}: {}", src.display(), e)))?;

    debug!("Extracted {:?} into {:?}", src, dest_dir);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_archive_roundtrip_with_excludes() {
        let src = TempDir::new().unwrap();
        write(&src.path().join("index.html"), "<html></html>");
        write(&src.path().join("cypress/e2e/a.cy.ts"), "it()");
        write(&src.path().join("node_modules/left-pad/index.js"), "pad");
        write(&src.path().join(".git/HEAD"), "ref");

        let out = TempDir::new().unwrap();
        let archive = out.path().join(archive_name("deadbeef"));
        let size = create_archive(src.path(), &["."], &["node_modules", ".git"], &archive)
            .await
            .unwrap();
        assert!(size > 0);

        let dest = TempDir::new().unwrap();
        extract_archive(&archive, dest.path()).await.unwrap();
        assert!(dest.path().join("index.html").exists());
        assert!(dest.path().join("cypress/e2e/a.cy.ts").exists());
        assert!(!dest.path().join("node_modules").exists());
        assert!(!dest.path().join(".git").exists());
    }

    #[tokio::test]
    async fn test_archive_selected_paths() {
        let build = TempDir::new().unwrap();
        write(&build.path().join("src/node_modules/x/index.js"), "x");
        write(&build.path().join("src/package.json"), "{}");
        write(&build.path().join("framework_cache/13.0.0/Cypress"), "bin");

        let archive = build.path().join("deps.tar.lz4");
        create_archive(build.path(), &["src/node_modules", "framework_cache"], &[], &archive)
            .await
            .unwrap();

        let dest = TempDir::new().unwrap();
        extract_archive(&archive, dest.path()).await.unwrap();
        assert!(dest.path().join("src/node_modules/x/index.js").exists());
        assert!(dest.path().join("framework_cache/13.0.0/Cypress").exists());
        assert!(!dest.path().join("src/package.json").exists());
    }

    #[tokio::test]
    async fn test_empty_archive_is_cache_read_error() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("empty.tar.lz4");
        std::fs::write(&archive, b"").unwrap();
        let err = extract_archive(&archive, dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::CacheRead(_)));
    }

    #[tokio::test]
    async fn test_garbage_archive_is_cache_read_error() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("junk.tar.lz4");
        std::fs::write(&archive, b"definitely not lz4").unwrap();
        let err = extract_archive(&archive, &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CacheRead(_)));
    }
}
