//! Interactive shell over SSH
//!
//! The terminal runs on its own transport (separate from the SFTP session) so
//! shell traffic never queues behind file operations.

use std::sync::Arc;

use parking_lot::RwLock;
use russh::ChannelMsg;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::error::SshError;
use super::handle_owner::HandleController;

/// Terminal type requested for the PTY
const TERM: &str = "xterm";

/// ETX, what a terminal sends for Ctrl-C
const INTERRUPT: u8 = 0x03;

/// Commands that can be sent to the shell task
#[derive(Debug)]
pub enum SessionCommand {
    /// Data to send to SSH stdin
    Data(Vec<u8>),
    /// Resize the PTY (cols, rows)
    Resize(u16, u16),
    /// Close the session
    Close,
}

pub type OutputCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct TerminalCallbacks {
    stdout: RwLock<Option<OutputCallback>>,
    stderr: RwLock<Option<OutputCallback>>,
    disconnect: RwLock<Option<DisconnectCallback>>,
}

impl TerminalCallbacks {
    /// Route channel output; extended stream 1 is stderr, other streams are dropped
    fn dispatch(&self, data: &[u8], ext: Option<u32>) {
        let slot = match ext {
            None => &self.stdout,
            Some(1) => &self.stderr,
            Some(other) => {
                debug!("Ignoring extended data stream {}", other);
                return;
            }
        };
        let callback = slot.read().clone();
        if let Some(callback) = callback {
            callback(data.to_vec());
        }
    }

    fn disconnected(&self) {
        let callback = self.disconnect.read().clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// A PTY shell on a dedicated SSH connection
pub struct TerminalSession {
    pub id: String,
    controller: HandleController,
    cmd_tx: mpsc::Sender<SessionCommand>,
    callbacks: Arc<TerminalCallbacks>,
}

impl TerminalSession {
    /// Open a session channel, allocate a PTY and start the login shell
    pub async fn open(controller: HandleController, cols: u32, rows: u32) -> Result<Self, SshError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let mut channel = controller.open_session_channel().await?;

        debug!("Channel opened, requesting PTY");
        channel
            .request_pty(false, TERM, cols, rows, 0, 0, &[])
            .await
            .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))?;

        info!("Interactive shell started for terminal {}", session_id);

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<SessionCommand>(1024);
        let callbacks = Arc::new(TerminalCallbacks::default());

        let sid = session_id.clone();
        let task_callbacks = callbacks.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(cmd) = cmd_rx.recv() => {
                        match cmd {
                            SessionCommand::Data(data) => {
                                if let Err(e) = channel.data(&data[..]).await {
                                    error!("Failed to send data to SSH channel: {}", e);
                                    break;
                                }
                            }
                            SessionCommand::Resize(cols, rows) => {
                                if let Err(e) = channel.window_change(cols as u32, rows as u32, 0, 0).await {
                                    error!("Failed to resize PTY: {}", e);
                                } else {
                                    debug!("PTY resized to {}x{} for terminal {}", cols, rows, sid);
                                }
                            }
                            SessionCommand::Close => {
                                info!("Close command received for terminal {}", sid);
                                let _ = channel.eof().await;
                                break;
                            }
                        }
                    }

                    Some(msg) = channel.wait() => {
                        match msg {
                            ChannelMsg::Data { data } => task_callbacks.dispatch(&data, None),
                            ChannelMsg::ExtendedData { data, ext } => {
                                task_callbacks.dispatch(&data, Some(ext))
                            }
                            ChannelMsg::Eof | ChannelMsg::Close => {
                                info!("SSH channel closed for terminal {}", sid);
                                break;
                            }
                            ChannelMsg::ExitStatus { exit_status } => {
                                info!("Shell exited with status {} for terminal {}", exit_status, sid);
                            }
                            _ => {}
                        }
                    }

                    else => break,
                }
            }

            task_callbacks.disconnected();
            debug!("Terminal task terminated for {}", sid);
        });

        Ok(Self {
            id: session_id,
            controller,
            cmd_tx,
            callbacks,
        })
    }

    async fn send(&self, cmd: SessionCommand) -> Result<(), SshError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| SshError::Disconnected)
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), SshError> {
        self.send(SessionCommand::Data(data.to_vec())).await
    }

    pub async fn set_window_size(&self, cols: u16, rows: u16) -> Result<(), SshError> {
        self.send(SessionCommand::Resize(cols, rows)).await
    }

    /// Interrupt the foreground process
    pub async fn kill(&self) -> Result<(), SshError> {
        self.write(&[INTERRUPT]).await
    }

    pub fn on_stdout(&self, callback: OutputCallback) {
        *self.callbacks.stdout.write() = Some(callback);
    }

    pub fn on_stderr(&self, callback: OutputCallback) {
        *self.callbacks.stderr.write() = Some(callback);
    }

    pub fn on_disconnect(&self, callback: DisconnectCallback) {
        *self.callbacks.disconnect.write() = Some(callback);
    }

    /// Close the shell and its transport
    pub async fn close(&self) {
        let _ = self.send(SessionCommand::Close).await;
        self.controller.disconnect().await;
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        debug!("Dropping terminal {}", self.id);
        let _ = self.cmd_tx.try_send(SessionCommand::Close);
        self.controller.disconnect_now();
    }
}
