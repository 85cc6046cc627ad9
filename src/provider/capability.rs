//! Optional capability surfaces a backend may expose
//!
//! The workspace only passes these through; consumers decide what to do with
//! them.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use url::Url;

use crate::workspace::FsError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitStatusEntry {
    pub url: String,
    /// Porcelain status code, e.g. `M`, `A`, `??`
    pub status: String,
}

/// Version control status and commits for a repository root
#[async_trait]
pub trait GitServiceProvider: Send + Sync {
    async fn status(&self, repository: &Url) -> Result<Vec<GitStatusEntry>, FsError>;

    async fn commit(&self, repository: &Url, message: &str) -> Result<(), FsError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub url: String,
    /// 1-based
    pub line_number: usize,
    pub line: String,
}

/// Full-text search below a directory
#[async_trait]
pub trait SearchServiceProvider: Send + Sync {
    async fn search(&self, query: &str, root: &Url) -> Result<Vec<SearchResult>, FsError>;
}

pub type TerminalOutputCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;
pub type TerminalDisconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Interactive shell attached to a backend
#[async_trait]
pub trait TerminalServiceProvider: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<(), FsError>;

    async fn set_window_size(&self, cols: u16, rows: u16) -> Result<(), FsError>;

    /// Interrupt the foreground process
    async fn kill(&self) -> Result<(), FsError>;

    fn on_stdout(&self, callback: TerminalOutputCallback);

    fn on_stderr(&self, callback: TerminalOutputCallback);

    fn on_disconnect(&self, callback: TerminalDisconnectCallback);
}
