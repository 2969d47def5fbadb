//! In-memory storage backend.
//!
//! Used for tests and embedders that need a deterministic backend. All data is
//! ephemeral.

use crate::{DirEntry, FsError, FsPath, Result, StorageBackend};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Directory { modified: SystemTime },
    File { modified: SystemTime },
}

impl Node {
    fn modified(&self) -> SystemTime {
        match self {
            Node::Directory { modified } | Node::File { modified } => *modified,
        }
    }
}

type Key = Vec<String>;

/// In-memory storage backend.
///
/// Entries are keyed by their normalized absolute segments. `set_offline` makes
/// every call fail as a transport error would.
#[derive(Debug)]
pub struct MemoryBackend {
    nodes: RwLock<BTreeMap<Key, Node>>,
    offline: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create a backend holding only the root directory
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            Vec::new(),
            Node::Directory {
                modified: SystemTime::now(),
            },
        );
        Self {
            nodes: RwLock::new(nodes),
            offline: AtomicBool::new(false),
        }
    }

    fn key(path: &FsPath) -> Key {
        path.to_absolute().normalize().segments().to_vec()
    }

    fn require_parent_dir(nodes: &BTreeMap<Key, Node>, key: &[String], path: &FsPath) -> Result<()> {
        let Some((_, parent)) = key.split_last() else {
            return Err(FsError::InvalidArgument("the root has no parent".into()));
        };
        match nodes.get(parent) {
            Some(Node::Directory { .. }) => Ok(()),
            Some(Node::File { .. }) => Err(FsError::NotADirectory(format!("parent of {}", path))),
            None => Err(FsError::NotFound(format!("parent of {}", path))),
        }
    }

    /// Create a directory; the parent must exist
    pub fn create_dir(&self, path: &FsPath) -> Result<()> {
        let key = Self::key(path);
        let mut nodes = self.nodes.write();

        match nodes.get(&key) {
            Some(Node::Directory { .. }) => return Ok(()),
            Some(Node::File { .. }) => return Err(FsError::NotADirectory(path.to_string())),
            None => {}
        }
        Self::require_parent_dir(&nodes, &key, path)?;

        nodes.insert(
            key,
            Node::Directory {
                modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    /// Create a directory and any missing ancestors
    pub fn create_dir_all(&self, path: &FsPath) -> Result<()> {
        let key = Self::key(path);
        let mut nodes = self.nodes.write();

        for depth in 1..=key.len() {
            let prefix = key[..depth].to_vec();
            match nodes.get(&prefix) {
                Some(Node::Directory { .. }) => {}
                Some(Node::File { .. }) => {
                    return Err(FsError::NotADirectory(format!("/{}", prefix.join("/"))));
                }
                None => {
                    nodes.insert(
                        prefix,
                        Node::Directory {
                            modified: SystemTime::now(),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Create or update a file, stamping it with the current time
    pub fn write_file(&self, path: &FsPath) -> Result<()> {
        self.touch(path, SystemTime::now())
    }

    /// Create or update an entry with an explicit modification time
    pub fn touch(&self, path: &FsPath, modified: SystemTime) -> Result<()> {
        let key = Self::key(path);
        let mut nodes = self.nodes.write();

        match nodes.get_mut(&key) {
            Some(Node::Directory { modified: m }) | Some(Node::File { modified: m }) => {
                *m = modified;
            }
            None => {
                Self::require_parent_dir(&nodes, &key, path)?;
                nodes.insert(key, Node::File { modified });
            }
        }
        Ok(())
    }

    /// Remove an entry and everything below it
    pub fn remove(&self, path: &FsPath) -> Result<()> {
        let key = Self::key(path);
        if key.is_empty() {
            return Err(FsError::InvalidArgument("cannot remove the root".into()));
        }

        let mut nodes = self.nodes.write();
        if nodes.remove(&key).is_none() {
            return Err(FsError::NotFound(path.to_string()));
        }
        nodes.retain(|k, _| !k.starts_with(&key));
        Ok(())
    }

    /// Does an entry exist at `path`?
    pub fn exists(&self, path: &FsPath) -> bool {
        self.nodes.read().contains_key(&Self::key(path))
    }

    /// Make every subsequent call fail (or succeed again)
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self, path: &FsPath) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(FsError::Backend(format!("backend offline while accessing {}", path)))
        } else {
            Ok(())
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn is_directory(&self, path: &FsPath) -> Result<bool> {
        self.check_online(path)?;
        Ok(matches!(
            self.nodes.read().get(&Self::key(path)),
            Some(Node::Directory { .. })
        ))
    }

    fn list(&self, path: &FsPath) -> Result<Vec<DirEntry>> {
        self.check_online(path)?;

        let key = Self::key(path);
        let nodes = self.nodes.read();

        match nodes.get(&key) {
            Some(Node::Directory { .. }) => {}
            Some(Node::File { .. }) => return Err(FsError::NotADirectory(path.to_string())),
            None => return Err(FsError::NotFound(path.to_string())),
        }

        // Descendants of `key` form a contiguous range in key order
        let mut entries = Vec::new();
        for (child, node) in nodes
            .range(key.clone()..)
            .take_while(|(k, _)| k.starts_with(&key))
            .filter(|(k, _)| k.len() == key.len() + 1)
        {
            entries.push(DirEntry {
                path: path.resolve_str(&child[key.len()])?,
                modified: node.modified(),
                is_dir: matches!(node, Node::Directory { .. }),
            });
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FsContext;
    use std::time::Duration;

    #[test]
    fn test_tree_operations() {
        let ctx = FsContext::new("mem");
        let backend = MemoryBackend::new();

        backend.create_dir_all(&ctx.parse("/a/b").unwrap()).unwrap();
        backend.write_file(&ctx.parse("/a/one.txt").unwrap()).unwrap();
        backend.write_file(&ctx.parse("/a/b/two.txt").unwrap()).unwrap();

        assert!(backend.is_directory(&ctx.parse("/a").unwrap()).unwrap());
        assert!(!backend.is_directory(&ctx.parse("/a/one.txt").unwrap()).unwrap());

        let listing = backend.list(&ctx.parse("/a").unwrap()).unwrap();
        let names: Vec<String> = listing.iter().map(|e| e.path.to_string()).collect();
        assert_eq!(names, vec!["/a/b", "/a/one.txt"]);
        assert!(listing[0].is_dir);

        backend.remove(&ctx.parse("/a/b").unwrap()).unwrap();
        assert!(!backend.exists(&ctx.parse("/a/b/two.txt").unwrap()));
        assert_eq!(backend.list(&ctx.parse("/a").unwrap()).unwrap().len(), 1);
    }

    #[test]
    fn test_touch_sets_modified() {
        let ctx = FsContext::new("mem");
        let backend = MemoryBackend::new();
        let file = ctx.parse("/f").unwrap();
        let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);

        backend.touch(&file, when).unwrap();
        let listing = backend.list(&ctx.root()).unwrap();
        assert_eq!(listing[0].modified, when);
    }

    #[test]
    fn test_missing_parent_and_file_parent() {
        let ctx = FsContext::new("mem");
        let backend = MemoryBackend::new();

        assert!(matches!(
            backend.write_file(&ctx.parse("/no/such/file").unwrap()),
            Err(FsError::NotFound(_))
        ));

        backend.write_file(&ctx.parse("/file").unwrap()).unwrap();
        assert!(matches!(
            backend.create_dir(&ctx.parse("/file/sub").unwrap()),
            Err(FsError::NotADirectory(_))
        ));
        assert!(matches!(
            backend.list(&ctx.parse("/file").unwrap()),
            Err(FsError::NotADirectory(_))
        ));
        assert!(matches!(backend.remove(&ctx.root()), Err(FsError::InvalidArgument(_))));
    }

    #[test]
    fn test_offline_fails_calls() {
        let ctx = FsContext::new("mem");
        let backend = MemoryBackend::new();

        backend.set_offline(true);
        assert!(matches!(backend.list(&ctx.root()), Err(FsError::Backend(_))));
        assert!(matches!(backend.is_directory(&ctx.root()), Err(FsError::Backend(_))));

        backend.set_offline(false);
        assert!(backend.list(&ctx.root()).is_ok());
    }
}
