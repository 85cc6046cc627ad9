//! OxideSpace - one workspace over local, FTP/FTPS and SFTP storage
//!
//! The [`workspace::WorkspaceStorage`] facade projects whichever backend is
//! connected into a single lazily loaded tree. SFTP connections can tunnel
//! through a jump host and bind local port forwards over the same transport.

pub mod config;
pub mod forwarding;
pub mod monitor;
pub mod provider;
pub mod ssh;
pub mod workspace;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use forwarding::{Address, PortForwardServiceProvider, SocketInfo};
pub use provider::{Backend, FileSystemProvider, Metadata};
pub use ssh::{AuthenticationMode, ConnectOptions, JumpServer, SshError};
pub use workspace::{ConnectRequest, FsError, Node, WorkspaceConfig, WorkspaceStorage};

/// Install the global tracing subscriber.
///
/// Honors `RUST_LOG`, defaulting to `info`. Calling it twice is harmless.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
