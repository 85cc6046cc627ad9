//! Forwarded socket bookkeeping
//!
//! A socket leaves the registry exactly once: either `close_socket` removes it
//! or its accept loop exits on its own (transport closed). Whichever path
//! removes the entry fires the closure callback; the other finds nothing.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::address::Address;
use super::local::{start_local_forward, ForwardExit, LocalForwardHandle};
use crate::ssh::{HandleController, SshError};
use crate::workspace::FsError;

/// Ephemeral port range used for tunnel endpoints
pub const EPHEMERAL_PORTS: std::ops::RangeInclusive<u16> = 49152..=65535;

/// Attempts before giving up on finding a free ephemeral port
const EPHEMERAL_BIND_ATTEMPTS: usize = 8;

/// Pick a random port in the ephemeral range
pub fn random_ephemeral_port<R: Rng + ?Sized>(rng: &mut R) -> u16 {
    rng.gen_range(EPHEMERAL_PORTS)
}

/// A live local-to-remote forward
pub struct ForwardedSocket {
    pub id: String,
    pub local_address: Address,
    pub remote_address: Address,
    handle: LocalForwardHandle,
}

impl ForwardedSocket {
    pub fn new(local_address: Address, handle: LocalForwardHandle) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            remote_address: handle.remote.clone(),
            local_address,
            handle,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }
}

/// Snapshot of a socket for callers outside the registry
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SocketInfo {
    pub id: String,
    pub local_address: Address,
    pub remote_address: Address,
}

impl From<&ForwardedSocket> for SocketInfo {
    fn from(s: &ForwardedSocket) -> Self {
        Self {
            id: s.id.clone(),
            local_address: s.local_address.clone(),
            remote_address: s.remote_address.clone(),
        }
    }
}

pub type SocketClosedCallback = Arc<dyn Fn(SocketInfo) + Send + Sync>;

#[derive(Default)]
struct RegistryInner {
    sockets: Mutex<Vec<Arc<ForwardedSocket>>>,
    on_closed: RwLock<Option<SocketClosedCallback>>,
}

/// Sockets owned by one SSH connection
#[derive(Clone, Default)]
pub struct SocketRegistry {
    inner: Arc<RegistryInner>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a socket and watch its accept loop for asynchronous closure
    pub fn register(
        &self,
        socket: ForwardedSocket,
        exit_rx: oneshot::Receiver<ForwardExit>,
    ) -> SocketInfo {
        let socket = Arc::new(socket);
        let info = SocketInfo::from(socket.as_ref());
        self.inner.sockets.lock().push(socket);

        let registry = self.clone();
        let id = info.id.clone();
        tokio::spawn(async move {
            if let Ok(reason) = exit_rx.await {
                debug!("Forward {} exited ({:?})", id, reason);
            }
            registry.finish(&id);
        });

        info
    }

    pub fn sockets(&self) -> Vec<SocketInfo> {
        self.inner
            .sockets
            .lock()
            .iter()
            .map(|s| SocketInfo::from(s.as_ref()))
            .collect()
    }

    pub fn on_socket_closed(&self, callback: SocketClosedCallback) {
        *self.inner.on_closed.write() = Some(callback);
    }

    /// Explicitly close one socket
    pub async fn close(&self, id: &str) -> Result<(), FsError> {
        let socket = self
            .finish(id)
            .ok_or_else(|| FsError::NotFound(format!("socket {}", id)))?;
        socket.handle.stop().await;
        Ok(())
    }

    pub async fn close_all(&self) {
        let ids: Vec<String> = self.sockets().into_iter().map(|s| s.id).collect();
        for id in ids {
            let _ = self.close(&id).await;
        }
    }

    /// Stop every socket without awaiting; used when the owner is dropped
    pub fn force_close_all(&self) {
        let sockets: Vec<_> = self.inner.sockets.lock().drain(..).collect();
        for socket in &sockets {
            socket.handle.stop_now();
        }
        if !sockets.is_empty() {
            info!("Force-closed {} forwarded sockets", sockets.len());
        }
    }

    /// Single removal point; the caller that gets `Some` fires the callback
    fn finish(&self, id: &str) -> Option<Arc<ForwardedSocket>> {
        let removed = {
            let mut sockets = self.inner.sockets.lock();
            let pos = sockets.iter().position(|s| s.id == id)?;
            sockets.remove(pos)
        };

        let callback = self.inner.on_closed.read().clone();
        if let Some(callback) = callback {
            callback(SocketInfo::from(removed.as_ref()));
        }
        Some(removed)
    }
}

/// Capability surface for SSH-backed port forwarding
#[async_trait]
pub trait PortForwardServiceProvider: Send + Sync {
    async fn bind_local_port_to_remote(
        &self,
        local: Address,
        remote: Address,
    ) -> Result<SocketInfo, FsError>;

    fn sockets(&self) -> Vec<SocketInfo>;

    async fn close_socket(&self, id: &str) -> Result<(), FsError>;

    fn on_socket_closed(&self, callback: SocketClosedCallback);
}

/// Binds forwards on one SSH connection and records them in its registry
#[derive(Clone)]
pub struct PortForwarder {
    controller: HandleController,
    registry: SocketRegistry,
}

impl PortForwarder {
    pub fn new(controller: HandleController) -> Self {
        Self {
            controller,
            registry: SocketRegistry::new(),
        }
    }

    pub fn registry(&self) -> &SocketRegistry {
        &self.registry
    }

    pub async fn bind(&self, local: Address, remote: Address) -> Result<SocketInfo, SshError> {
        let (handle, exit_rx) =
            start_local_forward(self.controller.clone(), &local, &remote).await?;
        Ok(self
            .registry
            .register(ForwardedSocket::new(local, handle), exit_rx))
    }

    /// Bind `127.0.0.1:<random ephemeral port>` to `remote`, retrying on collisions
    pub async fn bind_ephemeral(&self, remote: &Address) -> Result<SocketInfo, SshError> {
        let mut last_err = None;
        for _ in 0..EPHEMERAL_BIND_ATTEMPTS {
            let port = random_ephemeral_port(&mut rand::thread_rng());
            match self.bind(Address::loopback(port), remote.clone()).await {
                Ok(info) => return Ok(info),
                Err(SshError::AddressInUse(msg)) => {
                    warn!("Ephemeral port {} taken, retrying", port);
                    last_err = Some(SshError::AddressInUse(msg));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            SshError::AddressInUse("No free ephemeral port".to_string())
        }))
    }
}

#[async_trait]
impl PortForwardServiceProvider for PortForwarder {
    async fn bind_local_port_to_remote(
        &self,
        local: Address,
        remote: Address,
    ) -> Result<SocketInfo, FsError> {
        Ok(self.bind(local, remote).await?)
    }

    fn sockets(&self) -> Vec<SocketInfo> {
        self.registry.sockets()
    }

    async fn close_socket(&self, id: &str) -> Result<(), FsError> {
        self.registry.close(id).await
    }

    fn on_socket_closed(&self, callback: SocketClosedCallback) {
        self.registry.on_socket_closed(callback);
    }
}
