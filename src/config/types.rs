//! Persisted remote host records

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Current on-disk format version
pub const CONFIG_VERSION: u32 = 1;

/// A saved remote host.
///
/// Secrets never live here: credentials are stored in the keychain under the
/// host URL, private key content under `private_key_content_keychain_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteHost {
    /// `sftp://host:port`, `ftp://host` or `ftps://host:port`
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Legacy flag: authenticate with the default in-file key
    #[serde(default)]
    pub use_key_auth: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_content_keychain_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<PathBuf>,

    /// URL of another saved host to tunnel through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jump_server_url: Option<String>,
}

impl RemoteHost {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            display_name: None,
            use_key_auth: false,
            private_key_content_keychain_id: None,
            private_key_path: None,
            jump_server_url: None,
        }
    }

    /// Whether the secret asked from the user is a key passphrase rather
    /// than a password
    pub fn uses_key(&self) -> bool {
        self.use_key_auth
            || self.private_key_content_keychain_id.is_some()
            || self.private_key_path.is_some()
    }

    /// Display name, falling back to the URL
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.url)
    }
}

/// Root of `hosts.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostsFile {
    pub version: u32,

    /// Saved hosts in insertion order
    #[serde(default)]
    pub hosts: Vec<RemoteHost>,
}

impl Default for HostsFile {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            hosts: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_record_without_optional_fields() {
        let json = r#"{"version":1,"hosts":[{"url":"sftp://box:22","useKeyAuth":true}]}"#;
        let file: HostsFile = serde_json::from_str(json).unwrap();
        let host = &file.hosts[0];
        assert!(host.use_key_auth);
        assert!(host.uses_key());
        assert_eq!(host.label(), "sftp://box:22");
        assert!(host.jump_server_url.is_none());
    }
}
