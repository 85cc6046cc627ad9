//! SSH Client implementation using russh

use std::net::ToSocketAddrs;
use std::path::Path;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::Mutex;
use russh::client::{self, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::config::{AuthenticationMode, ConnectOptions};
use super::error::SshError;
use super::keyboard_interactive::{KbiBridge, KbiPrompt};

/// Compute SHA256 fingerprint of public key
pub fn fingerprint(key: &PublicKey) -> String {
    let key_bytes = key.public_key_bytes();
    let mut hasher = Sha256::new();
    hasher.update(&key_bytes);
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Client handler for russh callbacks
///
/// Accepts the server key and records its fingerprint so the workspace can
/// surface it to the user after connecting.
pub struct ClientHandler {
    /// Host as the user named it (jump tunnels dial 127.0.0.1 instead)
    host: String,
    port: u16,
    fingerprint: Arc<Mutex<Option<String>>>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            fingerprint: Arc::new(Mutex::new(None)),
        }
    }

    /// Shared slot filled in during the key exchange
    pub fn fingerprint_slot(&self) -> Arc<Mutex<Option<String>>> {
        self.fingerprint.clone()
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fp = fingerprint(server_public_key);
        info!("Server key for {}:{} is {}", self.host, self.port, fp);
        *self.fingerprint.lock() = Some(fp);
        Ok(true)
    }
}

/// Where to dial and who to log in as
#[derive(Debug, Clone)]
pub struct SshTarget {
    /// Name used for logging and host key bookkeeping
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Socket address actually dialed; differs from host:port when tunneled
    pub dial_addr: String,
}

impl SshTarget {
    pub fn direct(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        let host = host.into();
        let dial_addr = format!("{}:{}", host, port);
        Self {
            host,
            port,
            username: username.into(),
            dial_addr,
        }
    }

    /// Same identity, but reached through a local tunnel endpoint
    pub fn via_local_port(&self, port: u16) -> Self {
        Self {
            dial_addr: format!("127.0.0.1:{}", port),
            ..self.clone()
        }
    }
}

/// An authenticated transport, before the handle owner task takes it over
pub struct AuthenticatedSession {
    pub handle: Handle<ClientHandler>,
    pub fingerprint: Option<String>,
}

/// Connect, authenticate with the chosen mode, then fall back to
/// keyboard-interactive when the server still wants more.
pub async fn connect_authenticated(
    target: &SshTarget,
    auth: &AuthenticationMode,
    documents_root: &Path,
    kbi: Option<&KbiBridge>,
    options: &ConnectOptions,
) -> Result<AuthenticatedSession, SshError> {
    info!(
        "Connecting to SSH server at {} ({}:{})",
        target.dial_addr, target.host, target.port
    );

    let socket_addr = target
        .dial_addr
        .to_socket_addrs()
        .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
        .next()
        .ok_or_else(|| SshError::ConnectionFailed("No address found".to_string()))?;

    let handler = ClientHandler::new(target.host.clone(), target.port);
    let fingerprint_slot = handler.fingerprint_slot();

    let mut handle = tokio::time::timeout(
        options.connect_timeout(),
        client::connect(Arc::new(options.client_config()), socket_addr, handler),
    )
    .await
    .map_err(|_| SshError::Timeout("Connection timed out".to_string()))?
    .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

    debug!("SSH handshake completed");

    let mut authenticated = match auth {
        AuthenticationMode::PlainUsernamePassword { password } => handle
            .authenticate_password(&target.username, password)
            .await
            .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            .success(),
        AuthenticationMode::InMemorySshKey {
            private_key,
            passphrase,
        } => {
            let key = russh::keys::decode_secret_key(private_key, passphrase.as_deref())
                .map_err(|e| SshError::KeyError(e.to_string()))?;
            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            handle
                .authenticate_publickey(&target.username, key_with_hash)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
                .success()
        }
        AuthenticationMode::InFileSshKey { passphrase, .. } => {
            let key_path = auth
                .key_path(documents_root)
                .ok_or_else(|| SshError::KeyError("No key path".to_string()))?;
            info!("Authenticating with key: {}", key_path.display());
            let key = russh::keys::load_secret_key(&key_path, passphrase.as_deref())
                .map_err(|e| SshError::KeyError(e.to_string()))?;
            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            handle
                .authenticate_publickey(&target.username, key_with_hash)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
                .success()
        }
    };

    if !authenticated {
        if let Some(bridge) = kbi {
            debug!("Primary authentication incomplete, trying keyboard-interactive");
            authenticated = keyboard_interactive(&mut handle, &target.username, bridge).await?;
        }
    }

    if !authenticated {
        return Err(SshError::AuthenticationFailed(
            "Authentication rejected by server".to_string(),
        ));
    }

    info!("SSH authentication successful for {}", target.host);

    let fingerprint = fingerprint_slot.lock().clone();
    Ok(AuthenticatedSession {
        handle,
        fingerprint,
    })
}

/// Run the keyboard-interactive rounds until the server accepts or rejects
async fn keyboard_interactive(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    bridge: &KbiBridge,
) -> Result<bool, SshError> {
    let mut response = handle
        .authenticate_keyboard_interactive_start(username, None::<String>)
        .await
        .map_err(|e| SshError::AuthenticationFailed(format!("KBI start failed: {}", e)))?;

    loop {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),
            KeyboardInteractiveAuthResponse::Failure { .. } => {
                warn!("Keyboard-interactive authentication rejected");
                return Ok(false);
            }
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                let prompts: Vec<KbiPrompt> = prompts
                    .iter()
                    .map(|p| KbiPrompt {
                        prompt: p.prompt.clone(),
                        echo: p.echo,
                    })
                    .collect();

                let answers = bridge
                    .respond(prompts)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;

                response = handle
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .map_err(|e| {
                        SshError::AuthenticationFailed(format!("KBI respond failed: {}", e))
                    })?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunneled_target_keeps_identity() {
        let target = SshTarget::direct("build.internal", 2222, "deploy");
        assert_eq!(target.dial_addr, "build.internal:2222");

        let tunneled = target.via_local_port(50123);
        assert_eq!(tunneled.dial_addr, "127.0.0.1:50123");
        assert_eq!(tunneled.host, "build.internal");
        assert_eq!(tunneled.port, 2222);
        assert_eq!(tunneled.username, "deploy");
    }

    #[tokio::test]
    async fn test_unresolvable_host_fails_before_handshake() {
        let target = SshTarget {
            host: "nowhere".into(),
            port: 22,
            username: "u".into(),
            dial_addr: "not a socket address".into(),
        };
        let result = connect_authenticated(
            &target,
            &AuthenticationMode::password("pw"),
            Path::new("/tmp"),
            None,
            &ConnectOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(SshError::ConnectionFailed(_))));
    }
}
