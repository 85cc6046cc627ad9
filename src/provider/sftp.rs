//! SFTP backend
//!
//! One provider owns:
//! - the primary SSH transport, with the sftp subsystem behind a mutex so
//!   commands for this session run strictly one after another
//! - an optional terminal on a second, independent transport
//! - when reached through a jump host, both jump sessions and their tunnels
//! - every port forward bound through it
//!
//! Dropping the provider force-closes all of the above.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use russh_sftp::client::error::Error as SftpErrorInner;
use russh_sftp::client::SftpSession as RusshSftpSession;
use russh_sftp::protocol::OpenFlags;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use super::capability::{
    TerminalDisconnectCallback, TerminalOutputCallback, TerminalServiceProvider,
};
use super::{FileSystemProvider, Metadata};
use crate::forwarding::{
    Address, PortForwardServiceProvider, PortForwarder, SocketClosedCallback, SocketInfo,
};
use crate::ssh::{
    connect_authenticated, establish_jump_tunnels, spawn_handle_owner_task, AuthenticationMode,
    ConnectOptions, HandleController, JumpServer, JumpTunnels, KbiBridge, KbiResponder, SshError,
    SshTarget, TerminalSession,
};
use crate::workspace::url_utils::{child_url, decoded_path};
use crate::workspace::FsError;

/// Initial PTY size; callers resize once they know their viewport
const TERMINAL_COLS: u32 = 80;
const TERMINAL_ROWS: u32 = 24;

/// `sftp://user@host:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SftpTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl SftpTarget {
    /// Fails fast when scheme, host, port or username is missing
    pub fn parse(url: &Url) -> Result<Self, FsError> {
        if url.scheme() != "sftp" {
            return Err(FsError::InvalidHost(format!("Not an sftp URL: {}", url)));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| FsError::InvalidHost(format!("Missing host: {}", url)))?;
        let port = url
            .port()
            .ok_or_else(|| FsError::InvalidHost(format!("Missing port: {}", url)))?;
        if url.username().is_empty() {
            return Err(FsError::InvalidHost(format!("Missing username: {}", url)));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            username: url.username().to_string(),
        })
    }

    fn ssh_target(&self) -> SshTarget {
        SshTarget::direct(self.host.clone(), self.port, self.username.clone())
    }

    fn address(&self) -> Address {
        Address::new(self.host.clone(), self.port)
    }
}

/// Everything `SftpProvider::connect` needs
pub struct SftpConnectRequest {
    pub target: SftpTarget,
    pub authentication: AuthenticationMode,
    pub jump: Option<JumpServer>,
    pub keyboard_interactive: Option<KbiResponder>,
    pub documents_root: PathBuf,
    pub options: ConnectOptions,
}

pub(crate) fn map_sftp_error(err: SftpErrorInner, path: &str) -> FsError {
    let msg = err.to_string();
    if msg.contains("No such file") || msg.contains("not found") {
        FsError::NotFound(path.to_string())
    } else if msg.contains("exist") {
        FsError::AlreadyExists(path.to_string())
    } else {
        FsError::OperationFailed(format!("{}: {}", path, msg))
    }
}

/// How a raw directory entry presents itself before symlink resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// Decide directory-ness for each entry, resolving symlinks through `resolve`.
///
/// A symlink whose target cannot be resolved is kept as a file.
pub(crate) async fn classify_entries<F, Fut>(
    entries: Vec<(String, EntryKind)>,
    resolve: F,
) -> Vec<(String, bool)>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<bool, FsError>>,
{
    let mut out = Vec::with_capacity(entries.len());
    for (name, kind) in entries {
        let is_directory = match kind {
            EntryKind::Directory => true,
            EntryKind::File => false,
            EntryKind::Symlink => match resolve(name.clone()).await {
                Ok(is_dir) => is_dir,
                Err(e) => {
                    debug!("Unresolvable symlink {}: {}", name, e);
                    false
                }
            },
        };
        out.push((name, is_directory));
    }
    out
}

fn join_remote(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

fn temp_path(path: &str) -> String {
    let (parent, name) = path.rsplit_once('/').unwrap_or(("", path));
    format!("{}/.{}.{}.tmp", parent, name, uuid::Uuid::new_v4().simple())
}

async fn write_file(
    sftp: &RusshSftpSession,
    path: &str,
    data: &[u8],
    flags: OpenFlags,
) -> Result<(), FsError> {
    let mut file = sftp
        .open_with_flags(path, flags)
        .await
        .map_err(|e| map_sftp_error(e, path))?;
    file.write_all(data)
        .await
        .map_err(|e| FsError::OperationFailed(format!("Failed to write {}: {}", path, e)))?;
    file.flush()
        .await
        .map_err(|e| FsError::OperationFailed(format!("Failed to flush {}: {}", path, e)))?;
    Ok(())
}

fn copy_tree<'a>(
    sftp: &'a RusshSftpSession,
    from: String,
    to: String,
) -> BoxFuture<'a, Result<(), FsError>> {
    async move {
        let attrs = sftp
            .metadata(from.as_str())
            .await
            .map_err(|e| map_sftp_error(e, &from))?;
        if !attrs.is_dir() {
            let data = sftp.read(from.as_str()).await.map_err(|e| map_sftp_error(e, &from))?;
            return write_file(
                sftp,
                &to,
                &data,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await;
        }

        sftp.create_dir(to.as_str())
            .await
            .map_err(|e| map_sftp_error(e, &to))?;
        let entries = sftp
            .read_dir(from.as_str())
            .await
            .map_err(|e| map_sftp_error(e, &from))?;
        for entry in entries {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            copy_tree(sftp, join_remote(&from, &name), join_remote(&to, &name)).await?;
        }
        Ok(())
    }
    .boxed()
}

fn remove_tree<'a>(sftp: &'a RusshSftpSession, path: String) -> BoxFuture<'a, Result<(), FsError>> {
    async move {
        let attrs = sftp
            .symlink_metadata(path.as_str())
            .await
            .map_err(|e| map_sftp_error(e, &path))?;
        if !attrs.is_dir() {
            return sftp
                .remove_file(path.as_str())
                .await
                .map_err(|e| map_sftp_error(e, &path));
        }

        let entries = sftp
            .read_dir(path.as_str())
            .await
            .map_err(|e| map_sftp_error(e, &path))?;
        for entry in entries {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            remove_tree(sftp, join_remote(&path, &name)).await?;
        }
        sftp.remove_dir(path.as_str())
            .await
            .map_err(|e| map_sftp_error(e, &path))
    }
    .boxed()
}

pub struct SftpProvider {
    target: SftpTarget,
    controller: HandleController,
    sftp: tokio::sync::Mutex<RusshSftpSession>,
    forwarder: PortForwarder,
    terminal: Option<TerminalSession>,
    jump: Option<JumpTunnels>,
    fingerprint: Option<String>,
    home: String,
    closed: AtomicBool,
}

impl SftpProvider {
    /// Authenticate, open the sftp subsystem and the terminal.
    ///
    /// With a jump server, both transports dial their own tunnel endpoint on
    /// `127.0.0.1` and keep the target's username.
    pub async fn connect(request: SftpConnectRequest) -> Result<Self, FsError> {
        let SftpConnectRequest {
            target,
            authentication,
            jump,
            keyboard_interactive,
            documents_root,
            options,
        } = request;

        let kbi = keyboard_interactive
            .map(KbiBridge::new)
            .transpose()
            .map_err(|e| FsError::OperationFailed(e.to_string()))?;

        let tunnels = match &jump {
            Some(jump) => Some(
                establish_jump_tunnels(jump, &target.address(), &documents_root, kbi.as_ref(), &options)
                    .await?,
            ),
            None => None,
        };

        let (primary_target, terminal_target) = match &tunnels {
            Some(t) => (
                target.ssh_target().via_local_port(t.primary.local_port()),
                target.ssh_target().via_local_port(t.terminal.local_port()),
            ),
            None => (target.ssh_target(), target.ssh_target()),
        };

        let primary = Self::open_primary(
            &primary_target,
            &authentication,
            &documents_root,
            kbi.as_ref(),
            &options,
        )
        .await;

        let (controller, sftp, fingerprint, home) = match primary {
            Ok(parts) => parts,
            Err(e) => {
                if let Some(tunnels) = &tunnels {
                    tunnels.shutdown().await;
                }
                return Err(e);
            }
        };

        let terminal = match connect_authenticated(
            &terminal_target,
            &authentication,
            &documents_root,
            kbi.as_ref(),
            &options,
        )
        .await
        {
            Ok(session) => {
                let terminal_controller =
                    spawn_handle_owner_task(session.handle, format!("terminal-{}", uuid::Uuid::new_v4()));
                match TerminalSession::open(terminal_controller, TERMINAL_COLS, TERMINAL_ROWS).await {
                    Ok(terminal) => Some(terminal),
                    Err(e) => {
                        warn!("Terminal unavailable for {}: {}", target.host, e);
                        None
                    }
                }
            }
            Err(e) => {
                warn!("Terminal connection to {} failed: {}", target.host, e);
                None
            }
        };

        info!("SFTP session ready on {}:{} (home {})", target.host, target.port, home);

        Ok(Self {
            forwarder: PortForwarder::new(controller.clone()),
            target,
            controller,
            sftp: tokio::sync::Mutex::new(sftp),
            terminal,
            jump: tunnels,
            fingerprint,
            home,
            closed: AtomicBool::new(false),
        })
    }

    async fn open_primary(
        target: &SshTarget,
        authentication: &AuthenticationMode,
        documents_root: &std::path::Path,
        kbi: Option<&KbiBridge>,
        options: &ConnectOptions,
    ) -> Result<(HandleController, RusshSftpSession, Option<String>, String), FsError> {
        let session = connect_authenticated(target, authentication, documents_root, kbi, options).await?;
        let fingerprint = session.fingerprint.clone();
        let session_id = format!("sftp-{}", uuid::Uuid::new_v4());
        let controller = spawn_handle_owner_task(session.handle, session_id.clone());

        let opened = async {
            let channel = controller.open_session_channel().await?;
            channel
                .request_subsystem(true, "sftp")
                .await
                .map_err(|e| SshError::SftpError(format!("Failed to request SFTP subsystem: {}", e)))?;
            let sftp = RusshSftpSession::new(channel.into_stream())
                .await
                .map_err(|e| SshError::SftpError(e.to_string()))?;
            let home = sftp
                .canonicalize(".")
                .await
                .map_err(|e| SshError::SftpError(e.to_string()))?;
            Ok::<_, SshError>((sftp, home))
        }
        .await;

        match opened {
            Ok((sftp, home)) => {
                info!("SFTP subsystem opened for session {}", session_id);
                Ok((controller, sftp, fingerprint, home))
            }
            Err(e) => {
                controller.disconnect().await;
                Err(e.into())
            }
        }
    }

    pub fn target(&self) -> &SftpTarget {
        &self.target
    }

    /// SHA256 fingerprint of the server key, when the handshake reported one
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    /// Remote working directory after login
    pub fn home(&self) -> &str {
        &self.home
    }

    /// `sftp://host:port/<home>/`, the tree root after connecting
    pub fn root_url(&self) -> Result<Url, FsError> {
        let mut url = Url::parse(&format!("sftp://{}:{}/", self.target.host, self.target.port))?;
        url.set_path(&format!("{}/", self.home.trim_end_matches('/')));
        Ok(url)
    }

    /// Local ports of the jump tunnels (primary, terminal)
    pub fn tunnel_ports(&self) -> Option<(u16, u16)> {
        self.jump
            .as_ref()
            .map(|t| (t.primary.local_port(), t.terminal.local_port()))
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.controller.is_connected()
    }

    /// Invoke `callback` once the primary transport goes away
    pub fn on_disconnect(&self, callback: Arc<dyn Fn() + Send + Sync>) {
        let mut rx = self.controller.subscribe_disconnect();
        tokio::spawn(async move {
            let _ = rx.recv().await;
            callback();
        });
    }

    fn check_url(&self, url: &Url) -> Result<String, FsError> {
        let same_host = url.scheme() == "sftp"
            && url.host_str() == Some(self.target.host.as_str())
            && url.port().unwrap_or(self.target.port) == self.target.port;
        if !same_host {
            return Err(FsError::OperationFailed(format!(
                "{} does not belong to this SFTP session",
                url
            )));
        }
        Ok(decoded_path(url))
    }
}

#[async_trait]
impl FileSystemProvider for SftpProvider {
    async fn list_children(&self, url: &Url) -> Result<Vec<Url>, FsError> {
        let path = self.check_url(url)?;
        let sftp = self.sftp.lock().await;

        let entries = sftp
            .read_dir(path.as_str())
            .await
            .map_err(|e| map_sftp_error(e, &path))?;
        let raw: Vec<(String, EntryKind)> = entries
            .into_iter()
            .filter(|e| e.file_name() != "." && e.file_name() != "..")
            .map(|e| {
                let attrs = e.metadata();
                let kind = if attrs.is_symlink() {
                    EntryKind::Symlink
                } else if attrs.is_dir() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                };
                (e.file_name(), kind)
            })
            .collect();

        let sftp_ref = &*sftp;
        let parent = path.clone();
        let classified = classify_entries(raw, |name| {
            let full = join_remote(&parent, &name);
            async move {
                sftp_ref
                    .metadata(full.as_str())
                    .await
                    .map(|attrs| attrs.is_dir())
                    .map_err(|e| map_sftp_error(e, &full))
            }
        })
        .await;

        debug!("Listed {} entries in {}", classified.len(), path);
        classified
            .into_iter()
            .map(|(name, is_directory)| child_url(url, &name, is_directory))
            .collect()
    }

    async fn exists(&self, url: &Url) -> bool {
        let Ok(path) = self.check_url(url) else {
            return false;
        };
        let sftp = self.sftp.lock().await;
        sftp.symlink_metadata(path.as_str()).await.is_ok()
    }

    async fn create_directory(&self, url: &Url, recursive: bool) -> Result<(), FsError> {
        let path = self.check_url(url)?;
        let sftp = self.sftp.lock().await;
        if !recursive {
            return sftp
                .create_dir(path.as_str())
                .await
                .map_err(|e| map_sftp_error(e, &path));
        }

        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = join_remote(if current.is_empty() { "/" } else { &current }, segment);
            if sftp.metadata(current.as_str()).await.is_err() {
                sftp.create_dir(current.as_str())
                    .await
                    .map_err(|e| map_sftp_error(e, &current))?;
            }
        }
        Ok(())
    }

    async fn copy(&self, from: &Url, to: &Url) -> Result<(), FsError> {
        let source = self.check_url(from)?;

        if to.scheme() == "file" {
            // Whole file in memory, then one local write
            let local = super::local::to_path(to)?;
            let data = {
                let sftp = self.sftp.lock().await;
                sftp.read(source.as_str())
                    .await
                    .map_err(|e| map_sftp_error(e, &source))?
            };
            tokio::fs::write(local, data).await?;
            return Ok(());
        }

        let target = self.check_url(to)?;
        let sftp = self.sftp.lock().await;
        copy_tree(&sftp, source, target).await
    }

    async fn move_item(&self, from: &Url, to: &Url) -> Result<(), FsError> {
        let source = self.check_url(from)?;
        let target = self.check_url(to)?;
        let sftp = self.sftp.lock().await;
        sftp.rename(source.as_str(), target.as_str())
            .await
            .map_err(|e| map_sftp_error(e, &source))
    }

    async fn remove(&self, url: &Url) -> Result<(), FsError> {
        let path = self.check_url(url)?;
        let sftp = self.sftp.lock().await;
        remove_tree(&sftp, path).await
    }

    async fn read_all(&self, url: &Url) -> Result<Vec<u8>, FsError> {
        let path = self.check_url(url)?;
        let sftp = self.sftp.lock().await;
        sftp.read(path.as_str())
            .await
            .map_err(|e| map_sftp_error(e, &path))
    }

    async fn write_all(
        &self,
        url: &Url,
        data: &[u8],
        atomic: bool,
        overwrite: bool,
    ) -> Result<(), FsError> {
        let path = self.check_url(url)?;
        let sftp = self.sftp.lock().await;

        if !atomic {
            let flags = if overwrite {
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE
            } else {
                OpenFlags::CREATE | OpenFlags::EXCLUDE | OpenFlags::WRITE
            };
            return write_file(&sftp, &path, data, flags).await;
        }

        let exists = sftp.symlink_metadata(path.as_str()).await.is_ok();
        if exists && !overwrite {
            return Err(FsError::AlreadyExists(path));
        }

        let temp = temp_path(&path);
        write_file(
            &sftp,
            &temp,
            data,
            OpenFlags::CREATE | OpenFlags::EXCLUDE | OpenFlags::WRITE,
        )
        .await?;

        // SFTPv3 rename refuses to replace, so the old file goes first
        if exists {
            if let Err(e) = sftp.remove_file(path.as_str()).await {
                let _ = sftp.remove_file(temp.as_str()).await;
                return Err(map_sftp_error(e, &path));
            }
        }
        sftp.rename(temp.as_str(), path.as_str())
            .await
            .map_err(|e| map_sftp_error(e, &path))
    }

    async fn metadata(&self, url: &Url) -> Result<Metadata, FsError> {
        let path = self.check_url(url)?;
        let sftp = self.sftp.lock().await;
        let attrs = sftp
            .metadata(path.as_str())
            .await
            .map_err(|e| map_sftp_error(e, &path))?;
        Ok(Metadata {
            size: attrs.size.unwrap_or(0),
            is_directory: attrs.is_dir(),
            modified_at: attrs
                .mtime
                .and_then(|t| DateTime::<Utc>::from_timestamp(t as i64, 0)),
            // SFTPv3 attributes carry no creation time
            created_at: None,
        })
    }

    fn terminal_provider(&self) -> Option<&dyn TerminalServiceProvider> {
        self.terminal
            .as_ref()
            .map(|t| t as &dyn TerminalServiceProvider)
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Disconnecting SFTP session on {}", self.target.host);
        self.forwarder.registry().close_all().await;
        if let Some(terminal) = &self.terminal {
            terminal.close().await;
        }
        self.controller.disconnect().await;
        if let Some(tunnels) = &self.jump {
            tunnels.shutdown().await;
        }
    }
}

#[async_trait]
impl PortForwardServiceProvider for SftpProvider {
    async fn bind_local_port_to_remote(
        &self,
        local: Address,
        remote: Address,
    ) -> Result<SocketInfo, FsError> {
        self.forwarder.bind_local_port_to_remote(local, remote).await
    }

    fn sockets(&self) -> Vec<SocketInfo> {
        self.forwarder.sockets()
    }

    async fn close_socket(&self, id: &str) -> Result<(), FsError> {
        self.forwarder.close_socket(id).await
    }

    fn on_socket_closed(&self, callback: SocketClosedCallback) {
        self.forwarder.on_socket_closed(callback);
    }
}

#[async_trait]
impl TerminalServiceProvider for TerminalSession {
    async fn write(&self, data: &[u8]) -> Result<(), FsError> {
        Ok(TerminalSession::write(self, data).await?)
    }

    async fn set_window_size(&self, cols: u16, rows: u16) -> Result<(), FsError> {
        Ok(TerminalSession::set_window_size(self, cols, rows).await?)
    }

    async fn kill(&self) -> Result<(), FsError> {
        Ok(TerminalSession::kill(self).await?)
    }

    fn on_stdout(&self, callback: TerminalOutputCallback) {
        TerminalSession::on_stdout(self, callback);
    }

    fn on_stderr(&self, callback: TerminalOutputCallback) {
        TerminalSession::on_stderr(self, callback);
    }

    fn on_disconnect(&self, callback: TerminalDisconnectCallback) {
        TerminalSession::on_disconnect(self, callback);
    }
}

impl Drop for SftpProvider {
    fn drop(&mut self) {
        debug!("Dropping SFTP provider for {}", self.target.host);
        self.forwarder.registry().force_close_all();
        self.controller.disconnect_now();
        if let Some(tunnels) = &self.jump {
            tunnels.shutdown_now();
        }
    }
}
