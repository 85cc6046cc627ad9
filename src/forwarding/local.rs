//! Local Port Forwarding
//!
//! Forwards connections from a local port to a remote host:port through SSH.
//! Jump tunnels use the same machinery: `127.0.0.1:<ephemeral>` on this side,
//! the final SFTP host on the other.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::address::Address;
use crate::ssh::{HandleController, SshError};

/// Idle timeout for forwarded connections (5 minutes)
const FORWARD_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Why a forward's accept loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardExit {
    SshDisconnected,
    StopRequested,
}

/// Statistics for a port forward
#[derive(Debug, Clone, Default)]
pub struct ForwardStats {
    /// Total connections handled
    pub connection_count: u64,
    /// Active connections right now
    pub active_connections: u64,
    /// Total bytes sent (client -> server)
    pub bytes_sent: u64,
    /// Total bytes received (server -> client)
    pub bytes_received: u64,
}

/// Handle to a running local port forward
pub struct LocalForwardHandle {
    pub remote: Address,
    /// Actual bound address (may differ from requested if port was 0)
    pub bound_addr: SocketAddr,
    running: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    stats: Arc<parking_lot::RwLock<ForwardStats>>,
}

impl LocalForwardHandle {
    /// Stop the port forwarding and wait for active connections to close
    pub async fn stop(&self) {
        info!("Stopping local port forward on {}", self.bound_addr);
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(()).await;

        let start = std::time::Instant::now();
        let timeout = Duration::from_secs(5);
        while self.stats.read().active_connections > 0 {
            if start.elapsed() > timeout {
                warn!(
                    "Timeout waiting for {} active connections to close on {}",
                    self.stats.read().active_connections,
                    self.bound_addr
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Signal the accept loop without waiting; usable from `Drop`
    pub fn stop_now(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.try_send(());
    }

    /// Check if the forward is still running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get current statistics
    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }

    /// A handle with no accept loop behind it
    #[cfg(test)]
    pub(crate) fn detached(bound_addr: SocketAddr, remote: Address) -> Self {
        let (stop_tx, _) = mpsc::channel(1);
        Self {
            remote,
            bound_addr,
            running: Arc::new(AtomicBool::new(true)),
            stop_tx,
            stats: Arc::new(parking_lot::RwLock::new(ForwardStats::default())),
        }
    }
}

/// Bind `local` and forward every accepted connection to `remote` over SSH.
///
/// The returned receiver resolves once the accept loop exits, whatever the
/// reason; socket bookkeeping listens on it.
pub async fn start_local_forward(
    handle_controller: HandleController,
    local: &Address,
    remote: &Address,
) -> Result<(LocalForwardHandle, oneshot::Receiver<ForwardExit>), SshError> {
    let mut disconnect_rx = handle_controller.subscribe_disconnect();
    let local_addr = local.socket_string();

    let listener = TcpListener::bind(&local_addr).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::AddrInUse => SshError::AddressInUse(format!(
            "Port already in use: {}. Another application may be using this port.",
            local_addr
        )),
        std::io::ErrorKind::PermissionDenied => SshError::ConnectionFailed(format!(
            "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
            local_addr
        )),
        std::io::ErrorKind::AddrNotAvailable => SshError::ConnectionFailed(format!(
            "Address not available: {}. The specified address is not valid on this system.",
            local_addr
        )),
        _ => SshError::ConnectionFailed(format!("Failed to bind to {}: {}", local_addr, e)),
    })?;

    let bound_addr = listener
        .local_addr()
        .map_err(|e| SshError::ConnectionFailed(format!("Failed to get bound address: {}", e)))?;

    info!("Started local port forward: {} -> {}", bound_addr, remote);

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let (exit_tx, exit_rx) = oneshot::channel();
    let stats = Arc::new(parking_lot::RwLock::new(ForwardStats::default()));
    let stats_clone = stats.clone();
    let remote_host = remote.host.clone();
    let remote_port = remote.port;

    tokio::spawn(async move {
        let exit_reason = loop {
            tokio::select! {
                _ = disconnect_rx.recv() => {
                    info!("Local port forward stopped: SSH disconnected");
                    break ForwardExit::SshDisconnected;
                }

                _ = stop_rx.recv() => {
                    info!("Local port forward stopped by request");
                    break ForwardExit::StopRequested;
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            if !running_clone.load(Ordering::SeqCst) {
                                break ForwardExit::StopRequested;
                            }

                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY: {}", e);
                            }

                            debug!("Accepted connection from {} for forward", peer_addr);

                            {
                                let mut s = stats_clone.write();
                                s.connection_count += 1;
                                s.active_connections += 1;
                            }

                            let controller = handle_controller.clone();
                            let remote_host = remote_host.clone();
                            let stats_for_conn = stats_clone.clone();

                            tokio::spawn(async move {
                                let result = handle_forward_connection(
                                    controller,
                                    stream,
                                    &remote_host,
                                    remote_port,
                                    stats_for_conn.clone(),
                                ).await;

                                {
                                    let mut s = stats_for_conn.write();
                                    s.active_connections = s.active_connections.saturating_sub(1);
                                }

                                if let Err(e) = result {
                                    warn!("Forward connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        };

        running_clone.store(false, Ordering::SeqCst);
        let _ = exit_tx.send(exit_reason);
        debug!("Local port forward task exited ({:?})", exit_reason);
    });

    Ok((
        LocalForwardHandle {
            remote: remote.clone(),
            bound_addr,
            running,
            stop_tx,
            stats,
        },
        exit_rx,
    ))
}

/// Bridge one accepted TCP connection onto a direct-tcpip channel.
///
/// Each direction owns its half of the channel stream, so a quiet remote
/// never holds up bytes the local client sends first (an SSH handshake
/// through a jump tunnel does exactly that). The idle timeout applies to the
/// connection as a whole, not to each direction on its own.
async fn handle_forward_connection(
    handle_controller: HandleController,
    mut local_stream: TcpStream,
    remote_host: &str,
    remote_port: u16,
    stats: Arc<parking_lot::RwLock<ForwardStats>>,
) -> Result<(), SshError> {
    let channel = handle_controller
        .open_direct_tcpip(remote_host, remote_port as u32, "127.0.0.1", 0)
        .await?;

    debug!("Opened channel for forward to {}:{}", remote_host, remote_port);

    let (mut local_read, mut local_write) = local_stream.split();
    let (mut remote_read, mut remote_write) = tokio::io::split(channel.into_stream());

    let last_activity = parking_lot::Mutex::new(Instant::now());
    let touch = || *last_activity.lock() = Instant::now();
    let idle = || last_activity.lock().elapsed() >= FORWARD_IDLE_TIMEOUT;

    let local_to_remote = async {
        let mut buf = vec![0u8; 32768];
        loop {
            match tokio::time::timeout(FORWARD_IDLE_TIMEOUT, local_read.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    if let Err(e) = remote_write.write_all(&buf[..n]).await {
                        debug!("Channel write error: {}", e);
                        break;
                    }
                    touch();
                    stats.write().bytes_sent += n as u64;
                }
                Ok(Err(e)) => {
                    debug!("Local read error: {}", e);
                    break;
                }
                Err(_) if idle() => {
                    debug!(
                        "Forward connection idle for {}s, closing",
                        FORWARD_IDLE_TIMEOUT.as_secs()
                    );
                    break;
                }
                Err(_) => continue,
            }
        }
        // EOF to the remote end; its reply may still be in flight
        let _ = remote_write.shutdown().await;
    };

    let remote_to_local = async {
        let mut buf = vec![0u8; 32768];
        loop {
            match tokio::time::timeout(FORWARD_IDLE_TIMEOUT, remote_read.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    debug!("Channel ended");
                    break;
                }
                Ok(Ok(n)) => {
                    if let Err(e) = local_write.write_all(&buf[..n]).await {
                        debug!("Local write error: {}", e);
                        break;
                    }
                    touch();
                    stats.write().bytes_received += n as u64;
                }
                Ok(Err(e)) => {
                    debug!("Channel read error: {}", e);
                    break;
                }
                Err(_) if idle() => {
                    debug!(
                        "Forward connection idle for {}s, closing",
                        FORWARD_IDLE_TIMEOUT.as_secs()
                    );
                    break;
                }
                Err(_) => continue,
            }
        }
        let _ = local_write.shutdown().await;
    };

    tokio::pin!(local_to_remote);
    tokio::pin!(remote_to_local);

    // The remote side ending closes the connection; the local side ending
    // only half-closes it
    tokio::select! {
        _ = &mut local_to_remote => (&mut remote_to_local).await,
        _ = &mut remote_to_local => {}
    }

    debug!("Forward connection closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_port_in_use_is_reported_distinctly() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let (tx, _rx) = mpsc::channel(1);
        let controller = HandleController::new(tx);
        let result =
            start_local_forward(controller, &Address::loopback(port), &Address::new("db", 5432)).await;

        assert!(matches!(result, Err(SshError::AddressInUse(_))));
    }

    #[tokio::test]
    async fn test_stop_ends_accept_loop() {
        let (tx, _rx) = mpsc::channel(1);
        let controller = HandleController::new(tx);
        let (handle, exit_rx) =
            start_local_forward(controller, &Address::loopback(0), &Address::new("db", 5432))
                .await
                .unwrap();

        assert!(handle.is_running());
        assert_ne!(handle.bound_addr.port(), 0);

        handle.stop().await;
        assert_eq!(exit_rx.await.unwrap(), ForwardExit::StopRequested);
        assert!(!handle.is_running());
    }
}
