//! SSH Configuration

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Transport settings shared by every SSH session the workspace opens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// Handshake + authentication timeout in seconds
    #[serde(default = "default_timeout")]
    pub connect_timeout_secs: u64,

    /// Keepalive interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Missed keepalives before the transport is declared dead
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,
}

impl ConnectOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub(crate) fn client_config(&self) -> russh::client::Config {
        russh::client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(self.keepalive_interval_secs)),
            keepalive_max: self.keepalive_max,
            ..Default::default()
        }
    }
}

fn default_timeout() -> u64 {
    10
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_keepalive_max() -> usize {
    3
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_max: default_keepalive_max(),
        }
    }
}

/// How a remote session proves its identity.
///
/// The username travels separately in the connect request.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthenticationMode {
    /// Password authentication (the only mode FTP accepts)
    PlainUsernamePassword { password: String },

    /// Private key held in memory (usually read back from the keychain)
    InMemorySshKey {
        private_key: String,
        passphrase: Option<String>,
    },

    /// Private key on disk; `None` falls back to `<documents-root>/.ssh/id_rsa`
    InFileSshKey {
        path: Option<PathBuf>,
        passphrase: Option<String>,
    },
}

impl AuthenticationMode {
    pub fn password(password: impl Into<String>) -> Self {
        Self::PlainUsernamePassword {
            password: password.into(),
        }
    }

    pub fn in_memory_key(private_key: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::InMemorySshKey {
            private_key: private_key.into(),
            passphrase,
        }
    }

    pub fn in_file_key(path: Option<PathBuf>, passphrase: Option<String>) -> Self {
        Self::InFileSshKey { path, passphrase }
    }

    /// Key file this mode loads, resolving the default location
    pub fn key_path(&self, documents_root: &Path) -> Option<PathBuf> {
        match self {
            Self::InFileSshKey { path, .. } => Some(
                path.clone()
                    .unwrap_or_else(|| default_key_path(documents_root)),
            ),
            _ => None,
        }
    }
}

/// `<documents-root>/.ssh/id_rsa`
pub fn default_key_path(documents_root: &Path) -> PathBuf {
    documents_root.join(".ssh").join("id_rsa")
}

// Secrets never reach the logs
impl fmt::Debug for AuthenticationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlainUsernamePassword { .. } => f.write_str("PlainUsernamePassword"),
            Self::InMemorySshKey { passphrase, .. } => f
                .debug_struct("InMemorySshKey")
                .field("has_passphrase", &passphrase.is_some())
                .finish(),
            Self::InFileSshKey { path, passphrase } => f
                .debug_struct("InFileSshKey")
                .field("path", path)
                .field("has_passphrase", &passphrase.is_some())
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_key_path() {
        let mode = AuthenticationMode::in_file_key(None, None);
        assert_eq!(
            mode.key_path(Path::new("/docs")),
            Some(PathBuf::from("/docs/.ssh/id_rsa"))
        );

        let explicit = AuthenticationMode::in_file_key(Some("/keys/work".into()), None);
        assert_eq!(
            explicit.key_path(Path::new("/docs")),
            Some(PathBuf::from("/keys/work"))
        );
        assert_eq!(AuthenticationMode::password("x").key_path(Path::new("/docs")), None);
    }

    #[test]
    fn test_debug_hides_secrets() {
        let mode = AuthenticationMode::in_memory_key("-----BEGIN KEY-----", Some("hunter2".into()));
        let rendered = format!("{:?}", mode);
        assert!(!rendered.contains("BEGIN"));
        assert!(!rendered.contains("hunter2"));

        let rendered = format!("{:?}", AuthenticationMode::password("hunter2"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_options_defaults_from_empty_json() {
        let opts: ConnectOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts.connect_timeout_secs, 10);
        assert_eq!(opts.keepalive_max, 3);
    }
}
