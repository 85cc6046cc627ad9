//! Backend providers
//!
//! One implementation of [`FileSystemProvider`] per transport. The workspace
//! holds them in the closed [`Backend`] enum, keyed by URL scheme.
//!
//! Listing contract: `list_children` returns one level only, and directory
//! URLs end in `/` so callers never need a second metadata round-trip.

pub mod capability;
pub mod ftp;
pub mod local;
pub mod sftp;
#[cfg(test)]
pub mod stub;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use url::Url;

use crate::workspace::FsError;

pub use capability::{
    GitServiceProvider, GitStatusEntry, SearchResult, SearchServiceProvider,
    TerminalDisconnectCallback, TerminalOutputCallback, TerminalServiceProvider,
};
pub use ftp::{FtpProvider, FtpTarget};
pub use local::LocalProvider;
pub use sftp::{SftpConnectRequest, SftpProvider, SftpTarget};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub size: u64,
    pub is_directory: bool,
    pub modified_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Uniform async storage contract over one transport
#[async_trait]
pub trait FileSystemProvider: Send + Sync {
    async fn list_children(&self, url: &Url) -> Result<Vec<Url>, FsError>;

    /// Never fails: anything undeterminable reads as absent
    async fn exists(&self, url: &Url) -> bool;

    async fn create_directory(&self, url: &Url, recursive: bool) -> Result<(), FsError>;

    async fn copy(&self, from: &Url, to: &Url) -> Result<(), FsError>;

    async fn move_item(&self, from: &Url, to: &Url) -> Result<(), FsError>;

    async fn remove(&self, url: &Url) -> Result<(), FsError>;

    async fn read_all(&self, url: &Url) -> Result<Vec<u8>, FsError>;

    /// With `overwrite == false` an existing target is an error, never replaced
    async fn write_all(
        &self,
        url: &Url,
        data: &[u8],
        atomic: bool,
        overwrite: bool,
    ) -> Result<(), FsError>;

    async fn metadata(&self, url: &Url) -> Result<Metadata, FsError>;

    fn git_provider(&self) -> Option<&dyn GitServiceProvider> {
        None
    }

    fn search_provider(&self) -> Option<&dyn SearchServiceProvider> {
        None
    }

    fn terminal_provider(&self) -> Option<&dyn TerminalServiceProvider> {
        None
    }

    /// Release the session; safe to call more than once
    async fn disconnect(&self) {}
}

/// The fixed set of backends the workspace can register
#[derive(Clone)]
pub enum Backend {
    Local(Arc<LocalProvider>),
    Ftp(Arc<FtpProvider>),
    Sftp(Arc<SftpProvider>),
    #[cfg(test)]
    Stub(Arc<stub::StubProvider>),
}

impl Backend {
    pub fn provider(&self) -> &dyn FileSystemProvider {
        match self {
            Backend::Local(p) => p.as_ref(),
            Backend::Ftp(p) => p.as_ref(),
            Backend::Sftp(p) => p.as_ref(),
            #[cfg(test)]
            Backend::Stub(p) => p.as_ref(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Backend::Local(_))
    }

    pub fn as_sftp(&self) -> Option<&Arc<SftpProvider>> {
        match self {
            Backend::Sftp(p) => Some(p),
            _ => None,
        }
    }
}
