//! Configuration Management Module
//!
//! Persistent storage of saved remote hosts, with their secrets kept in the
//! system keychain.

pub mod hosts;
pub mod keychain;
pub mod storage;
pub mod types;

pub use hosts::{authentication_mode, HopSecret, HostRegistry, RemoveOutcome};
pub use keychain::{Credentials, Keychain, KeychainError};
pub use storage::{config_dir, hosts_file, ConfigStorage, StorageError};
pub use types::{HostsFile, RemoteHost, CONFIG_VERSION};
