//! Jump host tunnels
//!
//! Reaching an SFTP host through a jump server takes two independent SSH
//! sessions to the jump host. Each one forwards its own
//! `127.0.0.1:<ephemeral>` endpoint to the final host:
//!
//! ```text
//! sftp session     --> 127.0.0.1:<port1> ==[jump session 1]==> target:22
//! terminal session --> 127.0.0.1:<port2> ==[jump session 2]==> target:22
//! ```
//!
//! Both sessions connect in parallel, then both forwards bind in parallel.
//! Either step failing tears down everything opened so far.

use std::future::Future;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::client::{connect_authenticated, SshTarget};
use super::config::{AuthenticationMode, ConnectOptions};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::keyboard_interactive::KbiBridge;
use crate::forwarding::{Address, PortForwarder, SocketInfo};

/// An intermediary SSH server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JumpServer {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub authentication: AuthenticationMode,
}

fn default_ssh_port() -> u16 {
    22
}

impl JumpServer {
    fn target(&self) -> SshTarget {
        SshTarget::direct(self.host.clone(), self.port, self.username.clone())
    }
}

/// One authenticated session to the jump host and the forwards bound on it
pub struct JumpSession {
    controller: HandleController,
    forwarder: PortForwarder,
}

impl JumpSession {
    pub async fn connect(
        jump: &JumpServer,
        documents_root: &Path,
        kbi: Option<&KbiBridge>,
        options: &ConnectOptions,
    ) -> Result<Self, SshError> {
        let session = connect_authenticated(
            &jump.target(),
            &jump.authentication,
            documents_root,
            kbi,
            options,
        )
        .await?;

        let session_id = format!("jump-{}", uuid::Uuid::new_v4());
        let controller = spawn_handle_owner_task(session.handle, session_id);
        let forwarder = PortForwarder::new(controller.clone());
        Ok(Self {
            controller,
            forwarder,
        })
    }

    pub fn forwarder(&self) -> &PortForwarder {
        &self.forwarder
    }

    pub fn is_connected(&self) -> bool {
        self.controller.is_connected()
    }

    /// Close every forward, then the transport
    pub async fn shutdown(&self) {
        self.forwarder.registry().close_all().await;
        self.controller.disconnect().await;
    }

    /// Synchronous teardown for `Drop` paths
    pub fn shutdown_now(&self) {
        self.forwarder.registry().force_close_all();
        self.controller.disconnect_now();
    }
}

/// A jump session together with the ephemeral forward it carries
pub struct JumpTunnel {
    pub session: JumpSession,
    pub socket: SocketInfo,
}

impl JumpTunnel {
    /// Local port the tunneled SSH session should dial
    pub fn local_port(&self) -> u16 {
        self.socket.local_address.port
    }
}

/// The pair of tunnels backing one target connection
pub struct JumpTunnels {
    pub primary: JumpTunnel,
    pub terminal: JumpTunnel,
}

impl JumpTunnels {
    pub async fn shutdown(&self) {
        futures_util::future::join(
            self.primary.session.shutdown(),
            self.terminal.session.shutdown(),
        )
        .await;
    }

    pub fn shutdown_now(&self) {
        self.primary.session.shutdown_now();
        self.terminal.session.shutdown_now();
    }
}

/// Outcome of two parallel steps when at least one failed
pub(crate) struct PartialPair<A, B, E> {
    pub error: E,
    pub left: Option<A>,
    pub right: Option<B>,
}

/// Drive both futures to completion; both must succeed.
///
/// On failure the successful side is handed back so the caller can unwind it.
/// The first error wins when both fail.
pub(crate) async fn join_both<A, B, E, FA, FB>(
    left: FA,
    right: FB,
) -> Result<(A, B), PartialPair<A, B, E>>
where
    FA: Future<Output = Result<A, E>>,
    FB: Future<Output = Result<B, E>>,
{
    match futures_util::future::join(left, right).await {
        (Ok(a), Ok(b)) => Ok((a, b)),
        (Err(error), Ok(b)) => Err(PartialPair {
            error,
            left: None,
            right: Some(b),
        }),
        (Ok(a), Err(error)) => Err(PartialPair {
            error,
            left: Some(a),
            right: None,
        }),
        (Err(error), Err(_)) => Err(PartialPair {
            error,
            left: None,
            right: None,
        }),
    }
}

/// Open both jump sessions and bind one ephemeral forward on each to `target`
pub async fn establish_jump_tunnels(
    jump: &JumpServer,
    target: &Address,
    documents_root: &Path,
    kbi: Option<&KbiBridge>,
    options: &ConnectOptions,
) -> Result<JumpTunnels, SshError> {
    info!(
        "Establishing jump tunnels to {} via {}:{}",
        target, jump.host, jump.port
    );

    let (primary, terminal) = match join_both(
        JumpSession::connect(jump, documents_root, kbi, options),
        JumpSession::connect(jump, documents_root, kbi, options),
    )
    .await
    {
        Ok(pair) => pair,
        Err(partial) => {
            warn!("Jump host connection failed: {}", partial.error);
            for session in partial.left.iter().chain(partial.right.iter()) {
                session.shutdown().await;
            }
            return Err(partial.error);
        }
    };

    let bound = join_both(
        primary.forwarder().bind_ephemeral(target),
        terminal.forwarder().bind_ephemeral(target),
    )
    .await;

    match bound {
        Ok((primary_socket, terminal_socket)) => {
            info!(
                "Jump tunnels ready on ports {} and {}",
                primary_socket.local_address.port, terminal_socket.local_address.port
            );
            Ok(JumpTunnels {
                primary: JumpTunnel {
                    session: primary,
                    socket: primary_socket,
                },
                terminal: JumpTunnel {
                    session: terminal,
                    socket: terminal_socket,
                },
            })
        }
        Err(partial) => {
            warn!("Jump tunnel bind failed: {}", partial.error);
            // Sessions own their sockets, so shutting them down closes both forwards
            futures_util::future::join(primary.shutdown(), terminal.shutdown()).await;
            Err(partial.error)
        }
    }
}
