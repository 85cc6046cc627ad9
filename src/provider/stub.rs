//! In-memory backend for workspace tests
//!
//! Records every call, serves canned listings, and can be told to fail or to
//! stall on specific URLs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use url::Url;

use super::{FileSystemProvider, Metadata};
use crate::workspace::FsError;

#[derive(Default)]
pub struct StubProvider {
    listings: Mutex<HashMap<String, Vec<String>>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<String>>,
    failing: AtomicBool,
    panic_on_call: AtomicBool,
}

impl StubProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_listing(&self, directory: &str, children: &[&str]) {
        self.listings.lock().insert(
            directory.to_string(),
            children.iter().map(|c| c.to_string()).collect(),
        );
    }

    pub fn set_file(&self, url: &str, data: &[u8]) {
        self.files.lock().insert(url.to_string(), data.to_vec());
    }

    /// Stall every call touching `url` for `delay`
    pub fn set_delay(&self, url: &str, delay: Duration) {
        self.delays.lock().insert(url.to_string(), delay);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Any call reaching the backend panics; for guards that must run first
    pub fn panic_on_call(&self) {
        self.panic_on_call.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    async fn enter(&self, op: &str, url: &Url) -> Result<(), FsError> {
        assert!(
            !self.panic_on_call.load(Ordering::SeqCst),
            "backend reached: {} {}",
            op,
            url
        );
        self.calls.lock().push(format!("{} {}", op, url));
        let delay = self.delays.lock().get(url.as_str()).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(FsError::OperationFailed(format!("{} {} failed", op, url)));
        }
        Ok(())
    }
}

#[async_trait]
impl FileSystemProvider for StubProvider {
    async fn list_children(&self, url: &Url) -> Result<Vec<Url>, FsError> {
        self.enter("list", url).await?;
        let children = self
            .listings
            .lock()
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| FsError::NotFound(url.to_string()))?;
        children
            .iter()
            .map(|c| Url::parse(c).map_err(FsError::from))
            .collect()
    }

    async fn exists(&self, url: &Url) -> bool {
        if self.enter("exists", url).await.is_err() {
            return false;
        }
        let key = url.as_str();
        if self.files.lock().contains_key(key) {
            return true;
        }
        let listings = self.listings.lock();
        listings.contains_key(key)
            || listings
                .values()
                .any(|children| children.iter().any(|c| c == key))
    }

    async fn create_directory(&self, url: &Url, _recursive: bool) -> Result<(), FsError> {
        self.enter("mkdir", url).await?;
        self.listings.lock().insert(url.to_string(), Vec::new());
        Ok(())
    }

    async fn copy(&self, from: &Url, to: &Url) -> Result<(), FsError> {
        self.enter("copy", from).await?;
        let data = self.files.lock().get(from.as_str()).cloned().unwrap_or_default();
        self.files.lock().insert(to.to_string(), data);
        Ok(())
    }

    async fn move_item(&self, from: &Url, to: &Url) -> Result<(), FsError> {
        self.enter("move", from).await?;
        let data = self.files.lock().remove(from.as_str()).unwrap_or_default();
        self.files.lock().insert(to.to_string(), data);
        Ok(())
    }

    async fn remove(&self, url: &Url) -> Result<(), FsError> {
        self.enter("remove", url).await?;
        self.files.lock().remove(url.as_str());
        self.listings.lock().remove(url.as_str());
        Ok(())
    }

    async fn read_all(&self, url: &Url) -> Result<Vec<u8>, FsError> {
        self.enter("read", url).await?;
        self.files
            .lock()
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| FsError::NotFound(url.to_string()))
    }

    async fn write_all(
        &self,
        url: &Url,
        data: &[u8],
        _atomic: bool,
        overwrite: bool,
    ) -> Result<(), FsError> {
        self.enter("write", url).await?;
        let mut files = self.files.lock();
        if !overwrite && files.contains_key(url.as_str()) {
            return Err(FsError::AlreadyExists(url.to_string()));
        }
        files.insert(url.to_string(), data.to_vec());
        Ok(())
    }

    async fn metadata(&self, url: &Url) -> Result<Metadata, FsError> {
        self.enter("metadata", url).await?;
        let size = self
            .files
            .lock()
            .get(url.as_str())
            .map(|d| d.len() as u64)
            .ok_or_else(|| FsError::NotFound(url.to_string()))?;
        Ok(Metadata {
            size,
            is_directory: false,
            modified_at: None,
            created_at: None,
        })
    }
}
