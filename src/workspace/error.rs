//! Workspace error types

use thiserror::Error;

use crate::ssh::SshError;

/// Errors surfaced by the workspace facade and every backend provider
#[derive(Error, Debug)]
pub enum FsError {
    #[error("No backend is registered for scheme '{0}'")]
    SchemeNotRegistered(String),

    #[error("Invalid host: {0}")]
    InvalidHost(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("Connection failed: {0}")]
    ConnectionFailure(String),

    #[error("This authentication method is not supported by the server type")]
    UnsupportedAuthenticationMethod,

    #[error("Already connecting to a host")]
    AlreadyConnecting,

    #[error("Cannot copy an item onto itself")]
    AttemptingToCopyOneself,

    #[error("Cannot copy a folder into one of its own subfolders")]
    AttemptingToCopyParentToChild,

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Unable to find a suitable name")]
    UnableToFindSuitableName,

    #[error("Jump server {0} is not configured")]
    MissingJumpServer(String),

    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("Item already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SshError> for FsError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::AuthenticationFailed(msg) => FsError::AuthenticationFailure(msg),
            SshError::KeyError(msg) => FsError::AuthenticationFailure(msg),
            SshError::ConnectionFailed(msg)
            | SshError::Timeout(msg)
            | SshError::AddressInUse(msg) => FsError::ConnectionFailure(msg),
            SshError::Disconnected => FsError::ConnectionFailure("Disconnected".to_string()),
            SshError::IoError(e) => FsError::ConnectionFailure(e.to_string()),
            other => FsError::OperationFailed(other.to_string()),
        }
    }
}

impl From<url::ParseError> for FsError {
    fn from(err: url::ParseError) -> Self {
        FsError::InvalidUrl(err.to_string())
    }
}

impl FsError {
    /// True when the error means "the item does not exist", as opposed to
    /// "the backend could not tell".
    pub fn is_not_found(&self) -> bool {
        match self {
            FsError::NotFound(_) => true,
            FsError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl serde::Serialize for FsError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_errors_map_to_workspace_kinds() {
        let auth: FsError = SshError::AuthenticationFailed("rejected".into()).into();
        assert!(matches!(auth, FsError::AuthenticationFailure(_)));

        let timeout: FsError = SshError::Timeout("10s".into()).into();
        assert!(matches!(timeout, FsError::ConnectionFailure(_)));

        let channel: FsError = SshError::ChannelError("eof".into()).into();
        assert!(matches!(channel, FsError::OperationFailed(_)));
    }

    #[test]
    fn test_not_found_detection() {
        let io = FsError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(io.is_not_found());
        assert!(FsError::NotFound("/a".into()).is_not_found());
        assert!(!FsError::ConnectionFailure("down".into()).is_not_found());
    }

    #[test]
    fn test_serializes_as_message() {
        let json = serde_json::to_string(&FsError::AlreadyConnecting).unwrap();
        assert_eq!(json, "\"Already connecting to a host\"");
    }
}
