//! Workspace storage facade
//!
//! Owns the backend registry, the directory storage cache and the projected
//! tree. Every caller goes through this type; nothing outside it holds a
//! reference into storage across an await.
//!
//! Tree updates are published on a `watch` channel. A soft refresh reloads
//! every stored directory and publishes exactly once after all of them land.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::error::FsError;
use super::tree::{DirectoryStorage, Node};
use super::url_utils::{
    as_directory, child_url, display_name, is_ancestor, is_directory_url, parent_url,
    same_location, with_suffix,
};
use crate::monitor::DirectoryMonitor;
use crate::provider::{
    Backend, FileSystemProvider, FtpProvider, FtpTarget, LocalProvider, Metadata, SearchResult,
    SftpConnectRequest, SftpProvider, SftpTarget, TerminalOutputCallback,
};
use crate::ssh::{AuthenticationMode, ConnectOptions, JumpServer, KbiResponder};

/// Candidates tried by `url_with_suffix_if_existing`: `name (2)` .. `name (100)`
const MAX_NAME_SUFFIX: usize = 100;

pub type DirectoryChangeCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Local workspace root; also anchors the default SSH key path
    pub documents_root: PathBuf,

    #[serde(default)]
    pub connect: ConnectOptions,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        let documents_root = dirs::document_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            documents_root,
            connect: ConnectOptions::default(),
        }
    }
}

/// Parameters for `connect_to_server`
pub struct ConnectRequest {
    /// `ftp://`, `ftps://` or `sftp://host:port`
    pub host: Url,
    pub username: String,
    pub authentication: AuthenticationMode,
    pub jump: Option<JumpServer>,
    pub keyboard_interactive: Option<KbiResponder>,
}

#[derive(Debug, Clone)]
struct Root {
    name: String,
    url: Url,
}

#[derive(Debug, Clone)]
struct ConnectionInfo {
    id: Uuid,
    scheme: String,
    fingerprint: Option<String>,
}

/// Increments on creation, decrements on drop
struct BusyGuard<'a>(&'a AtomicUsize);

impl<'a> BusyGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Holds the single connect slot until dropped
struct ConnectingGuard<'a>(&'a AtomicBool);

impl<'a> ConnectingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, FsError> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| FsError::AlreadyConnecting)?;
        Ok(Self(flag))
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn node_for(url: &Url) -> Node {
    let name = display_name(url);
    if is_directory_url(url) {
        Node::directory(name, url.as_str())
    } else {
        Node::file(name, url.as_str())
    }
}

fn documents_root_url(config: &WorkspaceConfig) -> Result<Url, FsError> {
    crate::provider::local::to_url(&config.documents_root, true)
}

pub struct WorkspaceStorage {
    config: WorkspaceConfig,
    backends: RwLock<HashMap<String, Backend>>,
    storage: Mutex<DirectoryStorage>,
    expansion: Mutex<HashMap<String, bool>>,
    root: RwLock<Root>,
    /// Bumped on every root switch; loads started under an older value are dropped
    generation: AtomicU64,
    tree_tx: watch::Sender<Node>,
    monitor: DirectoryMonitor,
    connecting: AtomicBool,
    connection: Mutex<Option<ConnectionInfo>>,
    explorer_busy: AtomicUsize,
    editor_busy: AtomicUsize,
    directory_change: RwLock<Option<DirectoryChangeCallback>>,
    terminal_data: RwLock<Option<TerminalOutputCallback>>,
}

impl WorkspaceStorage {
    /// Create the workspace rooted at `documents_root`.
    ///
    /// Must be called inside a tokio runtime: directory change events are
    /// delivered on a spawned task.
    pub fn new(config: WorkspaceConfig) -> Result<Arc<Self>, FsError> {
        let root_url = documents_root_url(&config)?;
        let root = Root {
            name: display_name(&root_url),
            url: root_url,
        };

        let (change_tx, change_rx) = mpsc::unbounded_channel::<String>();
        let monitor = DirectoryMonitor::new(Arc::new(move |url: String, modified: DateTime<Utc>| {
            debug!("Directory {} changed at {}", url, modified);
            let _ = change_tx.send(url);
        }))?;

        let mut backends = HashMap::new();
        backends.insert(
            "file".to_string(),
            Backend::Local(Arc::new(LocalProvider::new())),
        );

        let (tree_tx, _) = watch::channel(Node::directory(root.name.clone(), root.url.as_str()));

        let workspace = Arc::new(Self {
            config,
            backends: RwLock::new(backends),
            storage: Mutex::new(DirectoryStorage::new()),
            expansion: Mutex::new(HashMap::new()),
            root: RwLock::new(root),
            generation: AtomicU64::new(0),
            tree_tx,
            monitor,
            connecting: AtomicBool::new(false),
            connection: Mutex::new(None),
            explorer_busy: AtomicUsize::new(0),
            editor_busy: AtomicUsize::new(0),
            directory_change: RwLock::new(None),
            terminal_data: RwLock::new(None),
        });

        tokio::spawn(Self::change_loop(Arc::downgrade(&workspace), change_rx));
        Ok(workspace)
    }

    /// Serial delivery of monitor events; ends when the workspace is dropped
    async fn change_loop(workspace: Weak<Self>, mut rx: mpsc::UnboundedReceiver<String>) {
        while let Some(url) = rx.recv().await {
            let Some(workspace) = workspace.upgrade() else {
                break;
            };
            if let Err(e) = workspace.request_directory_update_at(&url, true).await {
                warn!("Refresh of {} after change failed: {}", url, e);
            }
            let callback = workspace.directory_change.read().clone();
            if let Some(callback) = callback {
                callback(url);
            }
        }
        debug!("Directory change loop stopped");
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    // ----- registry -----

    /// Backend registered for the URL's scheme
    pub fn backend_for(&self, url: &Url) -> Result<Backend, FsError> {
        self.backends
            .read()
            .get(url.scheme())
            .cloned()
            .ok_or_else(|| FsError::SchemeNotRegistered(url.scheme().to_string()))
    }

    /// The connected non-local backend, if any
    pub fn remote_backend(&self) -> Option<Backend> {
        self.backends
            .read()
            .values()
            .find(|backend| !backend.is_local())
            .cloned()
    }

    pub fn registered_schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.backends.read().keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Port forwarding is offered by SFTP connections only
    pub fn port_forwarding(&self) -> Option<Arc<SftpProvider>> {
        self.remote_backend()?.as_sftp().cloned()
    }

    // ----- tree cache -----

    pub fn subscribe(&self) -> watch::Receiver<Node> {
        self.tree_tx.subscribe()
    }

    pub fn root_url(&self) -> Url {
        self.root.read().url.clone()
    }

    /// Project the current storage into a tree
    pub fn build_tree(&self) -> Node {
        let root = self.root.read().clone();
        self.storage.lock().build_tree(&root.name, root.url.as_str())
    }

    fn publish(&self) {
        let tree = self.build_tree();
        self.tree_tx.send_replace(tree);
    }

    pub fn is_loaded(&self, url: &Url) -> bool {
        self.storage.lock().is_loaded(as_directory(url).as_str())
    }

    pub fn set_expanded(&self, url: &Url, expanded: bool) {
        self.expansion.lock().insert(url.to_string(), expanded);
    }

    pub fn is_expanded(&self, url: &Url) -> bool {
        self.expansion.lock().get(url.as_str()).copied().unwrap_or(false)
    }

    pub fn is_monitoring(&self, url: &Url) -> bool {
        self.monitor.is_monitoring(as_directory(url).as_str())
    }

    async fn load_directory(&self, directory: &Url) -> Result<Vec<Node>, FsError> {
        let backend = self.backend_for(directory)?;
        let _busy = BusyGuard::enter(&self.explorer_busy);
        let children = backend.provider().list_children(directory).await?;
        Ok(children.iter().map(node_for).collect())
    }

    /// Full refresh: root switch when `url` differs from the current root,
    /// otherwise reload every stored directory and publish once.
    pub async fn update_directory(&self, name: &str, url: &Url) -> Result<(), FsError> {
        let url = as_directory(url);
        let is_switch = !same_location(&self.root.read().url, &url);
        if is_switch {
            return self.switch_root(name, url).await;
        }

        self.root.write().name = name.to_string();
        let generation = self.generation.load(Ordering::SeqCst);
        let mut keys = self.storage.lock().keys();
        if keys.is_empty() {
            keys.push(url.to_string());
        }
        debug!("Soft refresh of {} directories under {}", keys.len(), url);

        let loads = keys.into_iter().map(|key| async move {
            let result = match Url::parse(&key) {
                Ok(directory) => self.load_directory(&directory).await,
                Err(e) => Err(e.into()),
            };
            (key, result)
        });
        let results = join_all(loads).await;

        if generation != self.generation.load(Ordering::SeqCst) {
            debug!("Dropping soft refresh of {}: root switched", url);
            return Ok(());
        }

        let mut root_error = None;
        let mut loaded = Vec::new();
        {
            let mut storage = self.storage.lock();
            for (key, result) in results {
                match result {
                    Ok(children) => {
                        storage.load(&key, children);
                        loaded.push(key);
                    }
                    Err(e) if e.is_not_found() && key != url.as_str() => storage.unload(&key),
                    Err(e) => {
                        warn!("Reload of {} failed: {}", key, e);
                        if key == url.as_str() {
                            root_error = Some(e);
                        }
                    }
                }
            }
        }
        self.publish();

        if url.scheme() == "file" {
            for key in &loaded {
                self.monitor.monitor_url(key);
            }
        }

        match root_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn switch_root(&self, name: &str, url: Url) -> Result<(), FsError> {
        info!("Switching workspace root to {}", url);
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.root.write() = Root {
            name: name.to_string(),
            url: url.clone(),
        };
        self.storage.lock().clear();
        self.expansion.lock().clear();
        self.monitor.remove_all();
        self.publish();

        self.request_directory_update_at(url.as_str(), true).await
    }

    /// Load one directory. Skipped when already loaded unless `force`.
    ///
    /// Local directories also get a change watch, so external edits come
    /// back through this same path.
    pub async fn request_directory_update_at(&self, id: &str, force: bool) -> Result<(), FsError> {
        let directory = as_directory(&Url::parse(id)?);
        let key = directory.to_string();
        if !force && self.storage.lock().is_loaded(&key) {
            return Ok(());
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let children = self.load_directory(&directory).await?;
        if generation != self.generation.load(Ordering::SeqCst) {
            debug!("Dropping stale listing of {}", key);
            return Ok(());
        }

        self.storage.lock().load(&key, children);
        self.publish();

        if directory.scheme() == "file" {
            self.monitor.monitor_url(&key);
        }
        Ok(())
    }

    /// Patch an item into its parent's listing after a remote mutation
    pub fn insert_to_tree(&self, url: &Url) {
        let Some(parent) = parent_url(url) else {
            return;
        };
        let inserted = self.storage.lock().insert(parent.as_str(), node_for(url));
        if inserted {
            self.publish();
        }
    }

    pub fn remove_from_tree(&self, url: &Url) {
        let Some(parent) = parent_url(url) else {
            return;
        };
        let removed = self.storage.lock().remove(parent.as_str(), url.as_str());
        if removed {
            self.publish();
        }
    }

    #[cfg(test)]
    pub(crate) fn storage_snapshot(&self) -> DirectoryStorage {
        self.storage.lock().clone()
    }

    #[cfg(test)]
    pub(crate) fn register_backend(&self, scheme: &str, backend: Backend) {
        self.backends.write().insert(scheme.to_string(), backend);
    }

    // ----- file operations -----

    /// Absent or undeterminable items, including unregistered schemes, read as `false`
    pub async fn exists(&self, url: &Url) -> bool {
        match self.backend_for(url) {
            Ok(backend) => backend.provider().exists(url).await,
            Err(_) => false,
        }
    }

    pub async fn metadata(&self, url: &Url) -> Result<Metadata, FsError> {
        self.backend_for(url)?.provider().metadata(url).await
    }

    pub async fn list_children(&self, url: &Url) -> Result<Vec<Url>, FsError> {
        let backend = self.backend_for(url)?;
        let _busy = BusyGuard::enter(&self.explorer_busy);
        backend.provider().list_children(url).await
    }

    pub async fn read_all(&self, url: &Url) -> Result<Vec<u8>, FsError> {
        let backend = self.backend_for(url)?;
        let _busy = BusyGuard::enter(&self.editor_busy);
        backend.provider().read_all(url).await
    }

    pub async fn write_all(
        &self,
        url: &Url,
        data: &[u8],
        atomic: bool,
        overwrite: bool,
    ) -> Result<(), FsError> {
        let backend = self.backend_for(url)?;
        backend.provider().write_all(url, data, atomic, overwrite).await?;
        if !backend.is_local() {
            self.insert_to_tree(url);
        }
        Ok(())
    }

    pub async fn create_directory(&self, url: &Url, recursive: bool) -> Result<(), FsError> {
        let backend = self.backend_for(url)?;
        let url = as_directory(url);
        backend.provider().create_directory(&url, recursive).await?;
        if !backend.is_local() {
            self.insert_to_tree(&url);
        }
        Ok(())
    }

    pub async fn remove(&self, url: &Url) -> Result<(), FsError> {
        let backend = self.backend_for(url)?;
        backend.provider().remove(url).await?;
        if !backend.is_local() {
            self.remove_from_tree(url);
        }
        Ok(())
    }

    fn check_copy(from: &Url, to: &Url) -> Result<(), FsError> {
        if same_location(from, to) {
            return Err(FsError::AttemptingToCopyOneself);
        }
        if is_ancestor(from, to) {
            return Err(FsError::AttemptingToCopyParentToChild);
        }
        Ok(())
    }

    /// Copy within one backend, download to `file://`, or upload from `file://`
    pub async fn copy(&self, from: &Url, to: &Url) -> Result<(), FsError> {
        Self::check_copy(from, to)?;
        let source = self.backend_for(from)?;
        let destination = self.backend_for(to)?;
        let _busy = BusyGuard::enter(&self.explorer_busy);

        if source.is_local() && !destination.is_local() {
            self.upload(&source, &destination, from, to).await?;
        } else if from.scheme() == to.scheme() || to.scheme() == "file" {
            source.provider().copy(from, to).await?;
        } else {
            return Err(FsError::OperationFailed(format!(
                "Cannot copy from {} to {}",
                from.scheme(),
                to.scheme()
            )));
        }

        if !destination.is_local() {
            self.insert_to_tree(to);
        }
        Ok(())
    }

    async fn upload(
        &self,
        local: &Backend,
        remote: &Backend,
        from: &Url,
        to: &Url,
    ) -> Result<(), FsError> {
        let mut pending = vec![(from.clone(), to.clone())];
        while let Some((source, target)) = pending.pop() {
            if is_directory_url(&source) {
                remote.provider().create_directory(&target, false).await?;
                for child in local.provider().list_children(&source).await? {
                    let name = display_name(&child);
                    let child_target = child_url(&target, &name, is_directory_url(&child))?;
                    pending.push((child, child_target));
                }
            } else {
                let data = local.provider().read_all(&source).await?;
                remote.provider().write_all(&target, &data, false, true).await?;
            }
        }
        Ok(())
    }

    pub async fn move_item(&self, from: &Url, to: &Url) -> Result<(), FsError> {
        Self::check_copy(from, to)?;
        let backend = self.backend_for(from)?;
        if from.scheme() != to.scheme() {
            return Err(FsError::OperationFailed(format!(
                "Cannot move from {} to {}",
                from.scheme(),
                to.scheme()
            )));
        }
        let _busy = BusyGuard::enter(&self.explorer_busy);
        backend.provider().move_item(from, to).await?;
        if !backend.is_local() {
            self.remove_from_tree(from);
            self.insert_to_tree(to);
        }
        Ok(())
    }

    /// `url` itself when free, else the first free `name (n).ext` for n in 2..=100
    pub async fn url_with_suffix_if_existing(&self, url: &Url) -> Result<Url, FsError> {
        if !self.exists(url).await {
            return Ok(url.clone());
        }
        for n in 2..=MAX_NAME_SUFFIX {
            let candidate = with_suffix(url, n)?;
            if !self.exists(&candidate).await {
                return Ok(candidate);
            }
        }
        Err(FsError::UnableToFindSuitableName)
    }

    /// Create a file under `directory` without replacing anything
    pub async fn create_new_file(
        &self,
        directory: &Url,
        name: &str,
        data: &[u8],
    ) -> Result<Url, FsError> {
        let candidate = child_url(directory, name, false)?;
        let url = self.url_with_suffix_if_existing(&candidate).await?;
        self.write_all(&url, data, false, false).await?;
        Ok(url)
    }

    /// Full-text search through the backend's search surface
    pub async fn search(&self, query: &str, root: &Url) -> Result<Vec<SearchResult>, FsError> {
        let backend = self.backend_for(root)?;
        let search = backend.provider().search_provider().ok_or_else(|| {
            FsError::OperationFailed(format!("Search is not available for {}", root.scheme()))
        })?;
        search.search(query, root).await
    }

    // ----- busy flags and hooks -----

    pub fn explorer_is_busy(&self) -> bool {
        self.explorer_busy.load(Ordering::SeqCst) > 0
    }

    pub fn editor_is_busy(&self) -> bool {
        self.editor_busy.load(Ordering::SeqCst) > 0
    }

    pub fn on_directory_change(&self, callback: DirectoryChangeCallback) {
        *self.directory_change.write() = Some(callback);
    }

    /// Receives terminal stdout and stderr of the current and later SFTP connections
    pub fn on_terminal_data(&self, callback: TerminalOutputCallback) {
        *self.terminal_data.write() = Some(callback.clone());
        if let Some(sftp) = self.port_forwarding() {
            Self::attach_terminal(&sftp, callback);
        }
    }

    fn attach_terminal(sftp: &SftpProvider, callback: TerminalOutputCallback) {
        if let Some(terminal) = sftp.terminal_provider() {
            terminal.on_stdout(callback.clone());
            terminal.on_stderr(callback);
        }
    }

    // ----- connection manager -----

    pub fn is_connected(&self) -> bool {
        self.connection.lock().is_some()
    }

    pub fn connection_id(&self) -> Option<Uuid> {
        self.connection.lock().as_ref().map(|c| c.id)
    }

    /// SSH host key fingerprint of the current connection
    pub fn remote_fingerprint(&self) -> Option<String> {
        self.connection.lock().as_ref().and_then(|c| c.fingerprint.clone())
    }

    /// Connect, register the backend and root the tree at the remote path.
    ///
    /// Only one attempt may be in flight; a concurrent call fails with
    /// `AlreadyConnecting` instead of queueing.
    pub async fn connect_to_server(self: &Arc<Self>, request: ConnectRequest) -> Result<Url, FsError> {
        let _connecting = ConnectingGuard::acquire(&self.connecting)?;
        info!("Connecting to {}", request.host);

        let (backend, root, fingerprint) = self.open_backend(request).await?;
        let scheme = root.scheme().to_string();
        let id = Uuid::new_v4();

        let previous: Vec<Backend> = {
            let mut backends = self.backends.write();
            let stale: Vec<String> = backends
                .keys()
                .filter(|s| s.as_str() != "file")
                .cloned()
                .collect();
            let previous = stale.iter().filter_map(|s| backends.remove(s)).collect();
            backends.insert(scheme.clone(), backend.clone());
            previous
        };
        for old in previous {
            old.provider().disconnect().await;
        }

        *self.connection.lock() = Some(ConnectionInfo {
            id,
            scheme,
            fingerprint,
        });

        if let Some(sftp) = backend.as_sftp() {
            let workspace = Arc::downgrade(self);
            sftp.on_disconnect(Arc::new(move || {
                if let Some(workspace) = workspace.upgrade() {
                    tokio::spawn(async move { workspace.disconnect_if_current(id).await });
                }
            }));
            let callback = self.terminal_data.read().clone();
            if let Some(callback) = callback {
                Self::attach_terminal(sftp, callback);
            }
        }

        if let Err(e) = self.update_directory(&display_name(&root), &root).await {
            warn!("Listing the remote root {} failed: {}", root, e);
            self.disconnect().await;
            return Err(e);
        }

        info!("Connected to {} (connection {})", root, id);
        Ok(root)
    }

    async fn open_backend(
        &self,
        request: ConnectRequest,
    ) -> Result<(Backend, Url, Option<String>), FsError> {
        match request.host.scheme() {
            "ftp" | "ftps" => {
                let AuthenticationMode::PlainUsernamePassword { password } = &request.authentication
                else {
                    return Err(FsError::UnsupportedAuthenticationMethod);
                };
                let target = FtpTarget::parse(&request.host)?;
                let provider = FtpProvider::connect(target, &request.username, password).await?;
                let root = as_directory(&request.host);
                Ok((Backend::Ftp(Arc::new(provider)), root, None))
            }
            "sftp" => {
                let mut url = request.host.clone();
                url.set_username(&request.username)
                    .map_err(|_| FsError::InvalidHost(request.host.to_string()))?;
                let target = SftpTarget::parse(&url)?;
                let provider = SftpProvider::connect(SftpConnectRequest {
                    target,
                    authentication: request.authentication,
                    jump: request.jump,
                    keyboard_interactive: request.keyboard_interactive,
                    documents_root: self.config.documents_root.clone(),
                    options: self.config.connect.clone(),
                })
                .await?;
                let root = provider.root_url()?;
                let fingerprint = provider.fingerprint().map(str::to_string);
                Ok((Backend::Sftp(Arc::new(provider)), root, fingerprint))
            }
            #[cfg(test)]
            "stub" => {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                let stub = Arc::new(crate::provider::stub::StubProvider::new());
                let root = as_directory(&request.host);
                stub.set_listing(root.as_str(), &[]);
                Ok((Backend::Stub(stub), root, Some("SHA256:stub".to_string())))
            }
            other => Err(FsError::InvalidHost(format!(
                "Unsupported scheme '{}' in {}",
                other, request.host
            ))),
        }
    }

    /// Tear down any remote backend and re-root at the local workspace.
    /// Safe to call when nothing is connected.
    pub async fn disconnect(&self) {
        let previous: Vec<Backend> = {
            let mut backends = self.backends.write();
            let remote: Vec<String> = backends
                .keys()
                .filter(|s| s.as_str() != "file")
                .cloned()
                .collect();
            remote.iter().filter_map(|s| backends.remove(s)).collect()
        };
        if let Some(connection) = self.connection.lock().take() {
            info!("Disconnecting {} connection {}", connection.scheme, connection.id);
        }
        for backend in previous {
            backend.provider().disconnect().await;
        }

        let root = match documents_root_url(&self.config) {
            Ok(url) => url,
            Err(e) => {
                warn!("Documents root is not addressable: {}", e);
                return;
            }
        };
        if let Err(e) = self.switch_root(&display_name(&root), root).await {
            warn!("Reloading the local workspace failed: {}", e);
        }
    }

    /// Disconnect only if `id` is still the active connection
    pub async fn disconnect_if_current(&self, id: Uuid) {
        if self.connection_id() == Some(id) {
            info!("Remote transport for connection {} closed", id);
            self.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::stub::StubProvider;
    use std::time::Duration;
    use tempfile::tempdir;

    fn workspace_at(path: &std::path::Path) -> Arc<WorkspaceStorage> {
        WorkspaceStorage::new(WorkspaceConfig {
            documents_root: path.to_path_buf(),
            connect: ConnectOptions::default(),
        })
        .unwrap()
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn stub_request(host: &str) -> ConnectRequest {
        ConnectRequest {
            host: url(host),
            username: "dev".into(),
            authentication: AuthenticationMode::password("pw"),
            jump: None,
            keyboard_interactive: None,
        }
    }

    async fn with_stub(ws: &WorkspaceStorage) -> Arc<StubProvider> {
        let stub = Arc::new(StubProvider::new());
        stub.set_listing("stub://h/", &["stub://h/a/", "stub://h/readme.md"]);
        stub.set_listing("stub://h/a/", &["stub://h/a/b/"]);
        stub.set_listing("stub://h/a/b/", &["stub://h/a/b/x.txt"]);
        ws.register_backend("stub", Backend::Stub(stub.clone()));
        ws.update_directory("h", &url("stub://h/")).await.unwrap();
        stub
    }

    #[tokio::test]
    async fn test_local_tree_lifecycle() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        std::fs::write(dir.path().join("README.md"), "hi").unwrap();
        let ws = workspace_at(dir.path());
        let root = ws.root_url();

        ws.update_directory("docs", &root).await.unwrap();
        let tree = ws.build_tree();
        assert_eq!(tree.children.as_ref().unwrap().len(), 2);
        let src = child_url(&root, "src", true).unwrap();
        assert!(!tree.find(src.as_str()).unwrap().is_loaded);
        assert!(ws.is_monitoring(&root));

        ws.request_directory_update_at(src.as_str(), false).await.unwrap();
        let tree = ws.subscribe().borrow().clone();
        let src_node = tree.find(src.as_str()).unwrap();
        assert!(src_node.is_loaded);
        assert_eq!(src_node.children.as_ref().unwrap()[0].name, "main.rs");
        assert!(ws.is_monitoring(&src));
        assert!(!ws.explorer_is_busy());
    }

    #[tokio::test]
    async fn test_copy_guards_run_before_backend() {
        let dir = tempdir().unwrap();
        let ws = workspace_at(dir.path());
        let stub = Arc::new(StubProvider::new());
        stub.panic_on_call();
        ws.register_backend("stub", Backend::Stub(stub.clone()));

        let a = url("stub://h/a/");
        assert!(matches!(ws.copy(&a, &a).await, Err(FsError::AttemptingToCopyOneself)));
        assert!(matches!(
            ws.copy(&a, &url("stub://h/a/child/")).await,
            Err(FsError::AttemptingToCopyParentToChild)
        ));
        assert!(matches!(
            ws.move_item(&url("stub://h/a"), &url("stub://h/a/")).await,
            Err(FsError::AttemptingToCopyOneself)
        ));

        // Guards win over the missing scheme too
        let unknown = url("sftp://nowhere:22/x");
        assert!(matches!(
            ws.copy(&unknown, &unknown).await,
            Err(FsError::AttemptingToCopyOneself)
        ));
        assert!(matches!(
            ws.copy(&url("file:///private/var/log"), &url("file:///var/log")).await,
            Err(FsError::AttemptingToCopyOneself)
        ));
        assert!(stub.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_scheme() {
        let dir = tempdir().unwrap();
        let ws = workspace_at(dir.path());
        let remote = url("sftp://h:22/etc/hosts");

        assert!(!ws.exists(&remote).await);
        assert!(matches!(
            ws.read_all(&remote).await,
            Err(FsError::SchemeNotRegistered(s)) if s == "sftp"
        ));
        assert!(matches!(
            ws.write_all(&remote, b"x", false, true).await,
            Err(FsError::SchemeNotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_remote_mutation_leaves_storage_untouched() {
        let dir = tempdir().unwrap();
        let ws = workspace_at(dir.path());
        let stub = with_stub(&ws).await;
        let before = ws.storage_snapshot();

        stub.set_failing(true);
        assert!(ws.write_all(&url("stub://h/new.txt"), b"x", false, false).await.is_err());
        assert!(ws.create_directory(&url("stub://h/newdir/"), false).await.is_err());
        assert!(ws.copy(&url("stub://h/readme.md"), &url("stub://h/a/readme.md")).await.is_err());
        assert!(ws.remove(&url("stub://h/readme.md")).await.is_err());
        assert_eq!(ws.storage_snapshot(), before);

        stub.set_failing(false);
        ws.write_all(&url("stub://h/new.txt"), b"x", false, false).await.unwrap();
        ws.create_directory(&url("stub://h/newdir"), false).await.unwrap();
        let tree = ws.build_tree();
        assert!(tree.find("stub://h/new.txt").is_some());
        assert!(tree.find("stub://h/newdir/").is_some());

        ws.remove(&url("stub://h/a/")).await.unwrap();
        assert!(!ws.is_loaded(&url("stub://h/a/b/")));
        assert!(ws.build_tree().find("stub://h/a/").is_none());
    }

    #[tokio::test]
    async fn test_remove_directory_without_trailing_slash() {
        let dir = tempdir().unwrap();
        let ws = workspace_at(dir.path());
        with_stub(&ws).await;
        ws.request_directory_update_at("stub://h/a/", false).await.unwrap();
        ws.request_directory_update_at("stub://h/a/b/", false).await.unwrap();

        ws.remove(&url("stub://h/a")).await.unwrap();
        let tree = ws.build_tree();
        assert!(tree.find("stub://h/a/").is_none());
        assert!(tree.find("stub://h/readme.md").is_some());
        assert!(!ws.is_loaded(&url("stub://h/a/")));
        assert!(!ws.is_loaded(&url("stub://h/a/b/")));
    }

    #[tokio::test]
    async fn test_soft_refresh_publishes_once() {
        let dir = tempdir().unwrap();
        let ws = workspace_at(dir.path());
        let stub = with_stub(&ws).await;
        ws.request_directory_update_at("stub://h/a/", false).await.unwrap();
        ws.request_directory_update_at("stub://h/a/b/", false).await.unwrap();

        stub.set_listing("stub://h/a/", &["stub://h/a/b/", "stub://h/a/new.txt"]);
        stub.set_listing("stub://h/a/b/", &["stub://h/a/b/y.txt"]);
        stub.set_delay("stub://h/a/b/", Duration::from_millis(300));

        let mut rx = ws.subscribe();
        rx.borrow_and_update();
        let refresh = {
            let ws = ws.clone();
            tokio::spawn(async move { ws.update_directory("h", &url("stub://h/")).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!rx.has_changed().unwrap(), "published before all reloads landed");

        refresh.await.unwrap().unwrap();
        assert!(rx.has_changed().unwrap());
        let tree = rx.borrow_and_update().clone();
        assert!(tree.find("stub://h/a/new.txt").is_some());
        assert!(tree.find("stub://h/a/b/y.txt").is_some());
        assert!(tree.find("stub://h/a/b/x.txt").is_none());
    }

    #[tokio::test]
    async fn test_root_switch_drops_stale_load() {
        let dir = tempdir().unwrap();
        let ws = workspace_at(dir.path());
        let stub = with_stub(&ws).await;
        stub.set_delay("stub://h/a/", Duration::from_millis(200));

        let slow = {
            let ws = ws.clone();
            tokio::spawn(async move { ws.request_directory_update_at("stub://h/a/", true).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        ws.update_directory("b", &url("stub://h/a/b/")).await.unwrap();
        slow.await.unwrap().unwrap();

        assert!(!ws.is_loaded(&url("stub://h/a/")));
        assert!(ws.is_loaded(&url("stub://h/a/b/")));
    }

    #[tokio::test]
    async fn test_single_flight_and_single_remote() {
        let dir = tempdir().unwrap();
        let ws = workspace_at(dir.path());

        let (first, second) = tokio::join!(
            ws.connect_to_server(stub_request("stub://one/")),
            ws.connect_to_server(stub_request("stub://two/"))
        );
        let outcomes = [first.is_ok(), second.is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
        assert!(matches!(first, Err(FsError::AlreadyConnecting)) || matches!(second, Err(FsError::AlreadyConnecting)));
        assert_eq!(ws.registered_schemes(), ["file", "stub"]);
        assert_eq!(ws.remote_fingerprint().as_deref(), Some("SHA256:stub"));

        let first_id = ws.connection_id().unwrap();
        let root = ws.connect_to_server(stub_request("stub://three/")).await.unwrap();
        assert_eq!(root.as_str(), "stub://three/");
        assert_eq!(ws.registered_schemes(), ["file", "stub"]);
        assert_ne!(ws.connection_id(), Some(first_id));

        // A stale transport closing does not tear down the newer connection
        ws.disconnect_if_current(first_id).await;
        assert!(ws.is_connected());

        ws.disconnect().await;
        ws.disconnect().await;
        assert_eq!(ws.registered_schemes(), ["file"]);
        assert!(!ws.is_connected());
        assert_eq!(ws.root_url().scheme(), "file");
    }

    #[tokio::test]
    async fn test_ftp_rejects_key_authentication() {
        let dir = tempdir().unwrap();
        let ws = workspace_at(dir.path());
        let mut request = stub_request("ftp://files.example.com/");
        request.authentication = AuthenticationMode::in_file_key(None, None);

        assert!(matches!(
            ws.connect_to_server(request).await,
            Err(FsError::UnsupportedAuthenticationMethod)
        ));
        assert_eq!(ws.registered_schemes(), ["file"]);
    }

    #[tokio::test]
    async fn test_suffix_search_is_bounded() {
        let dir = tempdir().unwrap();
        let ws = workspace_at(dir.path());
        let root = ws.root_url();
        std::fs::write(dir.path().join("default.py"), "").unwrap();
        for n in 2..100 {
            std::fs::write(dir.path().join(format!("default ({}).py", n)), "").unwrap();
        }

        let candidate = child_url(&root, "default.py", false).unwrap();
        let free = ws.url_with_suffix_if_existing(&candidate).await.unwrap();
        assert!(free.as_str().ends_with("default%20(100).py"));

        std::fs::write(dir.path().join("default (100).py"), "").unwrap();
        assert!(matches!(
            ws.url_with_suffix_if_existing(&candidate).await,
            Err(FsError::UnableToFindSuitableName)
        ));
    }

    #[tokio::test]
    async fn test_create_new_file_picks_free_name() {
        let dir = tempdir().unwrap();
        let ws = workspace_at(dir.path());
        let root = ws.root_url();

        let first = ws.create_new_file(&root, "notes.txt", b"one").await.unwrap();
        let second = ws.create_new_file(&root, "notes.txt", b"two").await.unwrap();
        assert!(first.as_str().ends_with("/notes.txt"));
        assert!(second.as_str().ends_with("/notes%20(2).txt"));
        assert_eq!(std::fs::read(dir.path().join("notes (2).txt")).unwrap(), b"two");
    }
}
