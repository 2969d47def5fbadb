//! Remote filesystem core
//!
//! Provides the pieces of a filesystem adapter that are independent of the storage
//! transport:
//! - FsPath: hierarchical POSIX-like path algebra scoped to a filesystem context
//! - FileSystem / FileSystemRegistry: open filesystems keyed by authority
//! - StorageBackend: the narrow listing interface a backend implements
//! - WatchService: polling change notification over directory listings
//! - Config: TOML configuration for the watch engine and logging

mod fs_path;
mod filesystem;
mod backend;
mod memory;
mod watcher;
mod config;

pub use fs_path::{FsContext, FsPath, Iter};
pub use filesystem::{FileSystem, FileSystemRegistry};
pub use backend::{DirEntry, LocalBackend, StorageBackend};
pub use memory::MemoryBackend;
pub use watcher::{EventKind, WatchEvent, WatchKey, WatchService};
pub use config::{Config, LoggingConfig, WatchConfig};

use thiserror::Error;

/// Path separator used by every context
pub const SEPARATOR: char = '/';

/// File system errors
#[derive(Error, Debug)]
pub enum FsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Index out of range: {0}")]
    IndexOutOfRange(String),

    #[error("Incompatible filesystem context: {0} vs {1}")]
    IncompatibleContext(String, String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Watch service is closed")]
    ClosedService,

    #[error("Filesystem already open: {0}")]
    AlreadyOpen(String),

    #[error("Filesystem not open: {0}")]
    NotOpen(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl FsError {
    /// Transport-level failure that a later retry may not hit again
    pub fn is_transient(&self) -> bool {
        matches!(self, FsError::Io(_) | FsError::Backend(_) | FsError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
