//! Host list storage
//!
//! Reads and writes `hosts.json`. Location: `~/.oxidespace` on macOS/Linux,
//! `%APPDATA%\OxideSpace` on Windows.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};

use super::types::{HostsFile, CONFIG_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("OxideSpace"));
        }
    }

    dirs::home_dir()
        .map(|home| home.join(".oxidespace"))
        .ok_or(StorageError::NoConfigDir)
}

pub fn hosts_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("hosts.json"))
}

pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Storage at the default location
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: hosts_file()?,
        })
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the host list.
    ///
    /// A missing file yields an empty list. A corrupted file is backed up and
    /// replaced by an empty list; a newer format version is an error.
    pub async fn load(&self) -> Result<HostsFile, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HostsFile::default()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<HostsFile>(&contents) {
            Ok(file) if file.version > CONFIG_VERSION => Err(StorageError::VersionTooNew {
                found: file.version,
                supported: CONFIG_VERSION,
            }),
            Ok(file) => Ok(file),
            Err(e) => {
                warn!("Host list corrupted: {}", e);
                match self.backup().await {
                    Ok(path) => warn!("Corrupted host list backed up to {:?}", path),
                    Err(backup_err) => error!("Failed to back up host list: {}", backup_err),
                }
                Ok(HostsFile::default())
            }
        }
    }

    /// Temp file + rename, so readers never see a half-written list
    pub async fn save(&self, file: &HostsFile) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(file)?;

        let mut out = fs::File::create(&temp_path).await?;
        out.write_all(json.as_bytes()).await?;
        out.sync_all().await?;
        drop(out);

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));
        if self.exists().await {
            fs::copy(&self.path, &backup_path).await?;
        }
        Ok(backup_path)
    }
}
