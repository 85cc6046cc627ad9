//! Workspace
//!
//! The facade that turns one local root and at most one remote connection
//! into a single, incrementally loaded directory tree.

mod error;
mod storage;
pub mod tree;
pub mod url_utils;

pub use error::FsError;
pub use storage::{
    ConnectRequest, DirectoryChangeCallback, WorkspaceConfig, WorkspaceStorage,
};
pub use tree::{DirectoryStorage, Node};
