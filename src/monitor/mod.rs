//! Directory change monitor
//!
//! Watches local directories (non-recursively) for out-of-band changes and
//! reports the directory's new modification time. One OS watcher backs every
//! watch; events arrive on notify's own thread.
//!
//! At most [`MAX_MONITORED_DIRECTORIES`] watches are active. Asking for an
//! already-watched URL, or for a new one at the cap, does nothing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use notify::event::{EventKind, MetadataKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::workspace::FsError;

pub const MAX_MONITORED_DIRECTORIES: usize = 100;

/// Directory URL and its modification time after the change
pub type ChangeCallback = Arc<dyn Fn(String, DateTime<Utc>) + Send + Sync>;

/// url -> path as watched by the OS
type WatchTable = Arc<Mutex<HashMap<String, PathBuf>>>;

pub struct DirectoryMonitor {
    watches: WatchTable,
    // Never locked from the event thread
    watcher: Mutex<RecommendedWatcher>,
    capacity: usize,
}

impl DirectoryMonitor {
    pub fn new(callback: ChangeCallback) -> Result<Self, FsError> {
        Self::with_capacity(callback, MAX_MONITORED_DIRECTORIES)
    }

    pub fn with_capacity(callback: ChangeCallback, capacity: usize) -> Result<Self, FsError> {
        let watches: WatchTable = Arc::new(Mutex::new(HashMap::new()));
        let table = watches.clone();

        let watcher = notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            match res {
                Ok(event) => handle_event(&table, &callback, event),
                Err(e) => warn!("Directory watcher error: {}", e),
            }
        })
        .map_err(|e| FsError::OperationFailed(format!("Failed to start directory watcher: {}", e)))?;

        Ok(Self {
            watches,
            watcher: Mutex::new(watcher),
            capacity,
        })
    }

    /// Start watching a `file://` directory URL.
    ///
    /// Returns whether a new watch was created.
    pub fn monitor_url(&self, url: &str) -> bool {
        let Some(path) = local_directory(url) else {
            return false;
        };

        {
            let mut watches = self.watches.lock();
            if watches.contains_key(url) {
                return false;
            }
            if watches.len() >= self.capacity {
                debug!("Monitor cap reached, not watching {}", url);
                return false;
            }
            // Reserve the slot; the table lock must be released before
            // calling into the watcher, whose thread takes it to dispatch.
            watches.insert(url.to_string(), path.clone());
        }

        if let Err(e) = self.watcher.lock().watch(&path, RecursiveMode::NonRecursive) {
            warn!("Failed to watch {}: {}", path.display(), e);
            self.watches.lock().remove(url);
            return false;
        }

        debug!("Monitoring {}", url);
        true
    }

    /// Stop watching a URL; unknown URLs are ignored
    pub fn remove_monitor_at(&self, url: &str) {
        let Some(path) = self.watches.lock().remove(url) else {
            return;
        };
        if let Err(e) = self.watcher.lock().unwatch(&path) {
            // The directory may already be gone, taking its watch with it
            debug!("Unwatch {} failed: {}", path.display(), e);
        }
    }

    pub fn remove_all(&self) {
        let paths: Vec<PathBuf> = self.watches.lock().drain().map(|(_, p)| p).collect();
        let mut watcher = self.watcher.lock();
        for path in paths {
            let _ = watcher.unwatch(&path);
        }
    }

    pub fn is_monitoring(&self, url: &str) -> bool {
        self.watches.lock().contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.watches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for DirectoryMonitor {
    fn drop(&mut self) {
        self.remove_all();
    }
}

/// Canonical directory path for a `file://` URL
fn local_directory(url: &str) -> Option<PathBuf> {
    let parsed = Url::parse(url).ok()?;
    if parsed.scheme() != "file" {
        return None;
    }
    let path = parsed.to_file_path().ok()?;
    let path = std::fs::canonicalize(&path).unwrap_or(path);
    path.is_dir().then_some(path)
}

fn is_content_change(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) | EventKind::Remove(_) => true,
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::AccessTime)) => false,
        EventKind::Modify(_) => true,
        _ => false,
    }
}

fn handle_event(table: &WatchTable, callback: &ChangeCallback, event: notify::Event) {
    if !is_content_change(&event.kind) {
        return;
    }

    let mut changed: Vec<(String, PathBuf)> = Vec::new();
    {
        let mut watches = table.lock();
        for path in &event.paths {
            // The watched directory itself was removed; the OS dropped its watch
            if matches!(event.kind, EventKind::Remove(_)) {
                if let Some(url) = url_for(&watches, path) {
                    watches.remove(&url);
                    debug!("Watched directory {} removed", path.display());
                    continue;
                }
            }

            let hit = path
                .parent()
                .and_then(|parent| url_for(&watches, parent).map(|url| (url, parent.to_path_buf())))
                .or_else(|| url_for(&watches, path).map(|url| (url, path.clone())));

            if let Some((url, dir_path)) = hit {
                if !changed.iter().any(|(u, _)| *u == url) {
                    changed.push((url, dir_path));
                }
            }
        }
    }

    for (url, dir_path) in changed {
        let modified = std::fs::metadata(&dir_path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        callback(url, modified);
    }
}

fn url_for(watches: &HashMap<String, PathBuf>, path: &Path) -> Option<String> {
    watches
        .iter()
        .find(|(_, watched)| watched.as_path() == path)
        .map(|(url, _)| url.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn dir_url(path: &Path) -> String {
        Url::from_directory_path(path).unwrap().to_string()
    }

    fn silent() -> ChangeCallback {
        Arc::new(|_, _| {})
    }

    #[test]
    fn test_duplicate_and_cap_are_noops() {
        let root = tempfile::tempdir().unwrap();
        let monitor = DirectoryMonitor::new(silent()).unwrap();

        let mut urls = Vec::new();
        for i in 0..=MAX_MONITORED_DIRECTORIES {
            let dir = root.path().join(format!("d{}", i));
            std::fs::create_dir(&dir).unwrap();
            urls.push(dir_url(&dir));
        }

        assert!(monitor.monitor_url(&urls[0]));
        assert!(!monitor.monitor_url(&urls[0]));
        assert_eq!(monitor.len(), 1);

        for url in &urls[1..MAX_MONITORED_DIRECTORIES] {
            assert!(monitor.monitor_url(url));
        }
        assert_eq!(monitor.len(), MAX_MONITORED_DIRECTORIES);

        // 101st distinct directory
        assert!(!monitor.monitor_url(&urls[MAX_MONITORED_DIRECTORIES]));
        assert_eq!(monitor.len(), MAX_MONITORED_DIRECTORIES);
        assert!(!monitor.is_monitoring(&urls[MAX_MONITORED_DIRECTORIES]));
    }

    #[test]
    fn test_removal_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let monitor = DirectoryMonitor::new(silent()).unwrap();
        let url = dir_url(root.path());

        assert!(monitor.monitor_url(&url));
        monitor.remove_monitor_at(&url);
        monitor.remove_monitor_at(&url);
        assert!(monitor.is_empty());

        // Can be watched again afterwards
        assert!(monitor.monitor_url(&url));
    }

    #[test]
    fn test_rejects_non_local_urls() {
        let monitor = DirectoryMonitor::new(silent()).unwrap();
        assert!(!monitor.monitor_url("sftp://host:22/home/"));
        assert!(!monitor.monitor_url("file:///definitely/not/here/"));
        assert!(monitor.is_empty());
    }

    #[test]
    fn test_change_reports_directory_url() {
        let root = tempfile::tempdir().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let monitor = DirectoryMonitor::new(Arc::new(move |url, modified| {
            let _ = tx.send((url, modified));
        }))
        .unwrap();

        let url = dir_url(root.path());
        assert!(monitor.monitor_url(&url));
        std::fs::write(root.path().join("new.txt"), b"hello").unwrap();

        let (changed, _modified) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(changed, url);
    }
}
