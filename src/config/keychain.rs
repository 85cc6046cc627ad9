//! Keychain Integration
//!
//! Host credentials and private key content live in the system keychain via
//! the `keyring` crate. Credentials are keyed by host URL; key content by a
//! generated id stored on the host record.

use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

const SERVICE_NAME: &str = "com.oxidespace.hosts";

#[derive(Debug, thiserror::Error)]
pub enum KeychainError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Secret not found for ID: {0}")]
    NotFound(String),

    #[error("Stored credentials are unreadable: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Username and password (or key passphrase) saved for a host
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

pub struct Keychain {
    service: String,
}

impl Keychain {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    /// Id for a new piece of private key content
    pub fn generate_id() -> String {
        format!("oxidespace-key-{}", Uuid::new_v4())
    }

    fn credentials_id(host_url: &str) -> String {
        format!("credentials:{}", host_url)
    }

    // An explicit account keeps the keychain identity stable on macOS
    fn entry(&self, id: &str) -> Result<Entry, KeychainError> {
        let account = format!("{}@{}", whoami::username(), id);
        Ok(Entry::new(&self.service, &account)?)
    }

    /// Store a secret and read it back to confirm the keychain kept it
    pub fn store(&self, id: &str, secret: &str) -> Result<(), KeychainError> {
        debug!("Keychain store: service={}, id={}", self.service, id);
        let entry = self.entry(id)?;
        entry.set_password(secret).map_err(|e| {
            error!("Keychain store failed: id={}, error={:?}", id, e);
            KeychainError::Keyring(e)
        })?;

        match entry.get_password() {
            Ok(read_back) if read_back == secret => Ok(()),
            Ok(_) => {
                error!("Keychain store verification failed for id={}", id);
                Err(KeychainError::Keyring(keyring::Error::NoEntry))
            }
            Err(e) => Err(KeychainError::Keyring(e)),
        }
    }

    pub fn store_new(&self, secret: &str) -> Result<String, KeychainError> {
        let id = Self::generate_id();
        self.store(&id, secret)?;
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Result<String, KeychainError> {
        match self.entry(id)?.get_password() {
            Ok(secret) => Ok(secret),
            Err(keyring::Error::NoEntry) => {
                warn!("Keychain get: no entry for id={}", id);
                Err(KeychainError::NotFound(id.to_string()))
            }
            Err(e) => Err(KeychainError::Keyring(e)),
        }
    }

    /// Missing entries count as deleted
    pub fn delete(&self, id: &str) -> Result<(), KeychainError> {
        match self.entry(id)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(KeychainError::Keyring(e)),
        }
    }

    pub fn exists(&self, id: &str) -> Result<bool, KeychainError> {
        match self.entry(id)?.get_password() {
            Ok(_) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(KeychainError::Keyring(e)),
        }
    }

    pub fn store_credentials(
        &self,
        host_url: &str,
        credentials: &Credentials,
    ) -> Result<(), KeychainError> {
        let json = serde_json::to_string(credentials)?;
        self.store(&Self::credentials_id(host_url), &json)
    }

    pub fn credentials(&self, host_url: &str) -> Result<Credentials, KeychainError> {
        let json = self.get(&Self::credentials_id(host_url))?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn has_credentials(&self, host_url: &str) -> bool {
        self.exists(&Self::credentials_id(host_url)).unwrap_or(false)
    }

    pub fn remove_credentials(&self, host_url: &str) -> Result<(), KeychainError> {
        self.delete(&Self::credentials_id(host_url))
    }
}

impl Default for Keychain {
    fn default() -> Self {
        Self::new()
    }
}
