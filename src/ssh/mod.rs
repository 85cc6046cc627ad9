//! SSH module - transport sessions for SFTP, terminals and tunnels
//!
//! This module provides the SSH plumbing on top of the russh library.
//!
//! # Features
//! - Password, in-memory key and key file authentication
//! - Keyboard-Interactive fallback bridged to an async responder
//! - Single-owner handle task serializing channel requests per transport
//! - Jump host tunnels (two independent sessions per target)
//! - PTY shell sessions

mod client;
mod config;
mod error;
mod handle_owner;
pub mod keyboard_interactive;
mod proxy;
mod session;
#[cfg(test)]
pub(crate) mod test_server;

pub use client::{connect_authenticated, fingerprint, AuthenticatedSession, ClientHandler, SshTarget};
pub use config::{default_key_path, AuthenticationMode, ConnectOptions};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use keyboard_interactive::{KbiBridge, KbiError, KbiPrompt, KbiResponder};
pub use proxy::{establish_jump_tunnels, JumpServer, JumpSession, JumpTunnel, JumpTunnels};
pub use session::{DisconnectCallback, OutputCallback, SessionCommand, TerminalSession};
