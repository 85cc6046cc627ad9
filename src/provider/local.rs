//! Local filesystem backend
//!
//! Plain filesystem calls on tokio's blocking pool. OS errors pass through
//! unchanged as `FsError::Io`; there is no retry logic.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;
use walkdir::WalkDir;

use super::capability::{SearchResult, SearchServiceProvider};
use super::{FileSystemProvider, Metadata};
use crate::workspace::FsError;

/// Stop collecting search hits past this many lines
const MAX_SEARCH_RESULTS: usize = 500;

/// Files larger than this are skipped by search
const MAX_SEARCH_FILE_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct LocalProvider;

impl LocalProvider {
    pub fn new() -> Self {
        Self
    }
}

pub(crate) fn to_path(url: &Url) -> Result<PathBuf, FsError> {
    if url.scheme() != "file" {
        return Err(FsError::InvalidUrl(format!("Not a local URL: {}", url)));
    }
    url.to_file_path()
        .map_err(|_| FsError::InvalidUrl(format!("Not a local path: {}", url)))
}

pub(crate) fn to_url(path: &Path, is_directory: bool) -> Result<Url, FsError> {
    let url = if is_directory {
        Url::from_directory_path(path)
    } else {
        Url::from_file_path(path)
    };
    url.map_err(|_| FsError::InvalidUrl(path.display().to_string()))
}

fn join_error(e: tokio::task::JoinError) -> FsError {
    FsError::OperationFailed(format!("Blocking task failed: {}", e))
}

/// Sibling path used while an atomic write is in flight
fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(io::Error::other)?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn search_tree(query: &str, root: &Path) -> Result<Vec<SearchResult>, FsError> {
    let mut results = Vec::new();
    let walker = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

    for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let too_large = entry
            .metadata()
            .map(|m| m.len() > MAX_SEARCH_FILE_SIZE)
            .unwrap_or(true);
        if too_large {
            continue;
        }
        // Binary or unreadable files are not searchable
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };

        for (index, line) in content.lines().enumerate() {
            if line.contains(query) {
                results.push(SearchResult {
                    url: to_url(entry.path(), false)?.to_string(),
                    line_number: index + 1,
                    line: line.to_string(),
                });
                if results.len() >= MAX_SEARCH_RESULTS {
                    return Ok(results);
                }
            }
        }
    }
    Ok(results)
}

#[async_trait]
impl FileSystemProvider for LocalProvider {
    async fn list_children(&self, url: &Url) -> Result<Vec<Url>, FsError> {
        let dir = to_path(url)?;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut children = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            // Follows symlinks; a dangling link lists as a file
            let is_directory = tokio::fs::metadata(&path)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false);
            children.push(to_url(&path, is_directory)?);
        }

        debug!("Listed {} entries in {}", children.len(), dir.display());
        Ok(children)
    }

    async fn exists(&self, url: &Url) -> bool {
        match to_path(url) {
            Ok(path) => tokio::fs::symlink_metadata(path).await.is_ok(),
            Err(_) => false,
        }
    }

    async fn create_directory(&self, url: &Url, recursive: bool) -> Result<(), FsError> {
        let path = to_path(url)?;
        if recursive {
            tokio::fs::create_dir_all(path).await?;
        } else {
            tokio::fs::create_dir(path).await?;
        }
        Ok(())
    }

    async fn copy(&self, from: &Url, to: &Url) -> Result<(), FsError> {
        let source = to_path(from)?;
        let target = to_path(to)?;
        if tokio::fs::metadata(&source).await?.is_dir() {
            tokio::task::spawn_blocking(move || copy_tree(&source, &target))
                .await
                .map_err(join_error)??;
        } else {
            tokio::fs::copy(&source, &target).await?;
        }
        Ok(())
    }

    async fn move_item(&self, from: &Url, to: &Url) -> Result<(), FsError> {
        tokio::fs::rename(to_path(from)?, to_path(to)?).await?;
        Ok(())
    }

    async fn remove(&self, url: &Url) -> Result<(), FsError> {
        let path = to_path(url)?;
        if tokio::fs::symlink_metadata(&path).await?.is_dir() {
            tokio::fs::remove_dir_all(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn read_all(&self, url: &Url) -> Result<Vec<u8>, FsError> {
        Ok(tokio::fs::read(to_path(url)?).await?)
    }

    async fn write_all(
        &self,
        url: &Url,
        data: &[u8],
        atomic: bool,
        overwrite: bool,
    ) -> Result<(), FsError> {
        let path = to_path(url)?;

        if !atomic {
            let mut options = tokio::fs::OpenOptions::new();
            options.write(true);
            if overwrite {
                options.create(true).truncate(true);
            } else {
                options.create_new(true);
            }
            let mut file = options.open(&path).await?;
            file.write_all(data).await?;
            file.flush().await?;
            return Ok(());
        }

        if !overwrite && tokio::fs::symlink_metadata(&path).await.is_ok() {
            return Err(FsError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            )));
        }

        let temp = temp_sibling(&path);
        tokio::fs::write(&temp, data).await?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn metadata(&self, url: &Url) -> Result<Metadata, FsError> {
        let meta = tokio::fs::metadata(to_path(url)?).await?;
        Ok(Metadata {
            size: meta.len(),
            is_directory: meta.is_dir(),
            modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
            created_at: meta.created().ok().map(DateTime::<Utc>::from),
        })
    }

    fn search_provider(&self) -> Option<&dyn SearchServiceProvider> {
        Some(self)
    }
}

#[async_trait]
impl SearchServiceProvider for LocalProvider {
    async fn search(&self, query: &str, root: &Url) -> Result<Vec<SearchResult>, FsError> {
        let root = to_path(root)?;
        let query = query.to_string();
        tokio::task::spawn_blocking(move || search_tree(&query, &root))
            .await
            .map_err(join_error)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn url_of(path: &Path, dir: bool) -> Url {
        to_url(path, dir).unwrap()
    }

    #[tokio::test]
    async fn test_listing_marks_directories() {
        let root = tempdir().unwrap();
        std::fs::create_dir(root.path().join("src")).unwrap();
        std::fs::write(root.path().join("a.txt"), b"a").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(root.path().join("src"), root.path().join("link")).unwrap();

        let provider = LocalProvider::new();
        let children: Vec<String> = provider
            .list_children(&url_of(root.path(), true))
            .await
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();

        assert!(children.iter().any(|u| u.ends_with("/src/")));
        assert!(children.iter().any(|u| u.ends_with("/a.txt")));
        #[cfg(unix)]
        assert!(children.iter().any(|u| u.ends_with("/link/")));
    }

    #[tokio::test]
    async fn test_write_without_overwrite_fails() {
        let root = tempdir().unwrap();
        let file = root.path().join("config.toml");
        let url = url_of(&file, false);
        let provider = LocalProvider::new();

        provider.write_all(&url, b"one", false, false).await.unwrap();
        for atomic in [false, true] {
            let err = provider.write_all(&url, b"two", atomic, false).await.unwrap_err();
            assert!(matches!(err, FsError::Io(ref e) if e.kind() == io::ErrorKind::AlreadyExists));
        }
        assert_eq!(std::fs::read(&file).unwrap(), b"one");

        provider.write_all(&url, b"three", true, true).await.unwrap();
        assert_eq!(provider.read_all(&url).await.unwrap(), b"three");
        // No temp files left behind
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_copy_move_remove_directory() {
        let root = tempdir().unwrap();
        let src = root.path().join("src");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("nested/lib.rs"), b"fn main() {}").unwrap();
        let provider = LocalProvider::new();

        let copy = root.path().join("copy");
        provider
            .copy(&url_of(&src, true), &url_of(&copy, true))
            .await
            .unwrap();
        assert_eq!(std::fs::read(copy.join("nested/lib.rs")).unwrap(), b"fn main() {}");

        let moved = root.path().join("moved");
        provider
            .move_item(&url_of(&copy, true), &url_of(&moved, true))
            .await
            .unwrap();
        assert!(!provider.exists(&url_of(&copy, true)).await);
        assert!(provider.exists(&url_of(&moved, true)).await);

        provider.remove(&url_of(&moved, true)).await.unwrap();
        assert!(!moved.exists());
    }

    #[tokio::test]
    async fn test_missing_items() {
        let root = tempdir().unwrap();
        let missing = url_of(&root.path().join("nope.txt"), false);
        let provider = LocalProvider::new();

        assert!(!provider.exists(&missing).await);
        assert!(provider.read_all(&missing).await.unwrap_err().is_not_found());
        assert!(provider.metadata(&missing).await.unwrap_err().is_not_found());
        assert!(!provider.exists(&Url::parse("sftp://h:22/x").unwrap()).await);
    }

    #[tokio::test]
    async fn test_metadata_and_search() {
        let root = tempdir().unwrap();
        std::fs::write(root.path().join("main.py"), "import os\nprint('hello')\n").unwrap();
        std::fs::create_dir(root.path().join(".git")).unwrap();
        std::fs::write(root.path().join(".git/HEAD"), "print('hello')").unwrap();
        let provider = LocalProvider::new();

        let meta = provider
            .metadata(&url_of(&root.path().join("main.py"), false))
            .await
            .unwrap();
        assert_eq!(meta.size, 25);
        assert!(!meta.is_directory);
        assert!(meta.modified_at.is_some());

        let hits = provider
            .search_provider()
            .unwrap()
            .search("hello", &url_of(root.path(), true))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].line_number, 2);
        assert!(hits[0].url.ends_with("/main.py"));
    }
}
