//! Port Forwarding Module
//!
//! Local port forwards over an SSH transport, the registry tracking them per
//! connection, and the capability trait the SFTP backend exposes.

mod address;
mod local;
mod socket;

pub use address::Address;
pub use local::{start_local_forward, ForwardExit, ForwardStats, LocalForwardHandle};
pub use socket::{
    random_ephemeral_port, ForwardedSocket, PortForwardServiceProvider, PortForwarder,
    SocketClosedCallback, SocketInfo, SocketRegistry, EPHEMERAL_PORTS,
};
