//! Saved host registry
//!
//! Host records live in `hosts.json`; their secrets in the keychain. Removing
//! or re-saving a host also clears the secrets stored for it.

use std::path::PathBuf;

use tracing::{info, warn};
use url::Url;

use super::keychain::Keychain;
use super::storage::{ConfigStorage, StorageError};
use super::types::{HostsFile, RemoteHost};
use crate::ssh::{AuthenticationMode, JumpServer};
use crate::workspace::{ConnectRequest, FsError};

/// Result of a removal request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    /// Another host tunnels through this one; call again with `confirm`
    NeedsConfirmation,
}

impl HostsFile {
    /// Insert, replacing any record with the same URL
    pub fn upsert(&mut self, host: RemoteHost) {
        self.hosts.retain(|existing| existing.url != host.url);
        self.hosts.push(host);
    }

    pub fn find(&self, url: &str) -> Option<&RemoteHost> {
        self.hosts.iter().find(|host| host.url == url)
    }

    /// Whether some host uses `url` as its jump server
    pub fn is_jump_server(&self, url: &str) -> bool {
        self.hosts
            .iter()
            .any(|host| host.jump_server_url.as_deref() == Some(url))
    }

    /// An empty name clears the display name. Returns `false` for unknown hosts.
    pub fn rename(&mut self, url: &str, name: &str) -> bool {
        let Some(host) = self.hosts.iter_mut().find(|host| host.url == url) else {
            return false;
        };
        host.display_name = if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        };
        true
    }

    /// The saved host `host` tunnels through, if it names one
    pub fn jump_host_for(&self, host: &RemoteHost) -> Result<Option<&RemoteHost>, FsError> {
        let Some(jump_url) = host.jump_server_url.as_deref() else {
            return Ok(None);
        };
        self.find(jump_url)
            .map(Some)
            .ok_or_else(|| FsError::MissingJumpServer(jump_url.to_string()))
    }
}

/// Authentication mode for a host record and the secret the user supplied.
///
/// `secret` is the password, or the key passphrase for key-based hosts (an
/// empty passphrase means none). `key_content` resolves a keychain id to the
/// stored private key.
pub fn authentication_mode<F>(
    host: &RemoteHost,
    secret: &str,
    key_content: F,
) -> Result<AuthenticationMode, FsError>
where
    F: FnOnce(&str) -> Option<String>,
{
    let passphrase = (!secret.is_empty()).then(|| secret.to_string());

    if host.use_key_auth {
        return Ok(AuthenticationMode::in_file_key(None, passphrase));
    }
    if let Some(id) = &host.private_key_content_keychain_id {
        let key = key_content(id).ok_or_else(|| {
            FsError::AuthenticationFailure(format!("Private key for {} is missing", host.url))
        })?;
        return Ok(AuthenticationMode::in_memory_key(key, passphrase));
    }
    if let Some(path) = &host.private_key_path {
        return Ok(AuthenticationMode::in_file_key(Some(path.clone()), passphrase));
    }
    Ok(AuthenticationMode::password(secret))
}

fn jump_server(
    host: &RemoteHost,
    username: &str,
    authentication: AuthenticationMode,
) -> Result<JumpServer, FsError> {
    let url = Url::parse(&host.url)?;
    let name = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| FsError::InvalidHost(host.url.clone()))?;
    Ok(JumpServer {
        host: name.to_string(),
        port: url.port().unwrap_or(22),
        username: username.to_string(),
        authentication,
    })
}

/// Username and secret for one hop
pub struct HopSecret<'a> {
    pub username: &'a str,
    pub secret: &'a str,
}

pub struct HostRegistry {
    storage: ConfigStorage,
    keychain: Option<Keychain>,
}

impl HostRegistry {
    /// Default storage location and the system keychain
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            storage: ConfigStorage::new()?,
            keychain: Some(Keychain::new()),
        })
    }

    /// Host list only; secrets are neither read nor cleared
    pub fn without_keychain(path: PathBuf) -> Self {
        Self {
            storage: ConfigStorage::with_path(path),
            keychain: None,
        }
    }

    pub fn keychain(&self) -> Option<&Keychain> {
        self.keychain.as_ref()
    }

    pub async fn hosts(&self) -> Result<Vec<RemoteHost>, StorageError> {
        Ok(self.storage.load().await?.hosts)
    }

    fn forget_credentials(&self, url: &str) {
        if let Some(keychain) = &self.keychain {
            if let Err(e) = keychain.remove_credentials(url) {
                warn!("Failed to clear credentials for {}: {}", url, e);
            }
        }
    }

    /// Save a host, replacing any record with the same URL
    pub async fn save(&self, host: RemoteHost) -> Result<(), StorageError> {
        self.forget_credentials(&host.url);
        let mut file = self.storage.load().await?;
        info!("Saving host {}", host.url);
        file.upsert(host);
        self.storage.save(&file).await
    }

    /// Remove a host and its secrets.
    ///
    /// Without `confirm`, a host that others use as jump server is kept.
    pub async fn remove(&self, url: &str, confirm: bool) -> Result<RemoveOutcome, StorageError> {
        let mut file = self.storage.load().await?;
        if !confirm && file.is_jump_server(url) {
            return Ok(RemoveOutcome::NeedsConfirmation);
        }

        self.forget_credentials(url);
        let key_id = file
            .find(url)
            .and_then(|host| host.private_key_content_keychain_id.clone());
        if let (Some(keychain), Some(id)) = (&self.keychain, key_id) {
            if let Err(e) = keychain.delete(&id) {
                warn!("Failed to delete private key {}: {}", id, e);
            }
        }

        file.hosts.retain(|host| host.url != url);
        self.storage.save(&file).await?;
        info!("Removed host {}", url);
        Ok(RemoveOutcome::Removed)
    }

    pub async fn rename(&self, url: &str, name: &str) -> Result<bool, StorageError> {
        let mut file = self.storage.load().await?;
        if !file.rename(url, name) {
            return Ok(false);
        }
        self.storage.save(&file).await?;
        Ok(true)
    }

    fn authentication_for(&self, host: &RemoteHost, secret: &str) -> Result<AuthenticationMode, FsError> {
        authentication_mode(host, secret, |id| {
            self.keychain.as_ref().and_then(|keychain| keychain.get(id).ok())
        })
    }

    /// Build the workspace connect request for a saved host.
    ///
    /// `jump` supplies the jump host's credentials when the record names one.
    pub async fn connect_request(
        &self,
        host: &RemoteHost,
        target: HopSecret<'_>,
        jump: Option<HopSecret<'_>>,
    ) -> Result<ConnectRequest, FsError> {
        let file = self
            .storage
            .load()
            .await
            .map_err(|e| FsError::OperationFailed(e.to_string()))?;

        let jump = match (file.jump_host_for(host)?, jump) {
            (Some(jump_host), Some(hop)) => {
                let authentication = self.authentication_for(jump_host, hop.secret)?;
                Some(jump_server(jump_host, hop.username, authentication)?)
            }
            (Some(jump_host), None) => {
                return Err(FsError::AuthenticationFailure(format!(
                    "No credentials for jump server {}",
                    jump_host.url
                )))
            }
            (None, _) => None,
        };

        Ok(ConnectRequest {
            host: Url::parse(&host.url)?,
            username: target.username.to_string(),
            authentication: self.authentication_for(host, target.secret)?,
            jump,
            keyboard_interactive: None,
        })
    }
}
