//! Storage backend interface and the host-directory backend

use crate::{FsError, FsPath, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Directory entry reported by a backend listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub path: FsPath,
    pub modified: SystemTime,
    pub is_dir: bool,
}

/// The narrow interface the core needs from a storage backend
///
/// Implementations talk to the actual storage (a remote cluster, the host disk, memory);
/// the path algebra and the watch engine only ever call these two operations.
pub trait StorageBackend: Send + Sync {
    /// Is `path` an existing directory?
    fn is_directory(&self, path: &FsPath) -> Result<bool>;

    /// List the direct children of `path`
    fn list(&self, path: &FsPath) -> Result<Vec<DirEntry>>;
}

/// Backend serving a context from a directory on the host
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Serve `root` as the context root
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(FsError::NotADirectory(root.display().to_string()));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a context path onto the host, anchored at the backend root
    pub fn host_path(&self, path: &FsPath) -> PathBuf {
        let mut host = self.root.clone();
        for segment in path.to_absolute().normalize().segments() {
            host.push(segment);
        }
        host
    }
}

impl StorageBackend for LocalBackend {
    fn is_directory(&self, path: &FsPath) -> Result<bool> {
        Ok(self.host_path(path).is_dir())
    }

    fn list(&self, path: &FsPath) -> Result<Vec<DirEntry>> {
        let host = self.host_path(path);

        if !host.exists() {
            return Err(FsError::NotFound(path.to_string()));
        }
        if !host.is_dir() {
            return Err(FsError::NotADirectory(path.to_string()));
        }

        let mut entries = Vec::new();

        for entry in fs::read_dir(&host)? {
            let entry = entry?;

            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    tracing::warn!("Skipping non UTF-8 entry {:?} in {}", raw, path);
                    continue;
                }
            };

            // Entry may vanish between read_dir and stat
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            entries.push(DirEntry {
                path: path.resolve_str(&name)?,
                modified: metadata.modified()?,
                is_dir: metadata.is_dir(),
            });
        }

        Ok(entries)
    }
}
