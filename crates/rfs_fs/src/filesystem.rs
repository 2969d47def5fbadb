//! Open filesystems and the registry that owns them

use crate::watcher::WeakWatchService;
use crate::{DirEntry, FsContext, FsError, FsPath, Result, StorageBackend, WatchConfig, WatchService};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One open filesystem: a context bound to the backend that stores it
pub struct FileSystem {
    context: FsContext,
    backend: Arc<dyn StorageBackend>,
    open: AtomicBool,
    services: Mutex<Vec<WeakWatchService>>,
}

impl FileSystem {
    pub fn new(authority: impl Into<String>, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            context: FsContext::new(authority),
            backend,
            open: AtomicBool::new(true),
            services: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> &FsContext {
        &self.context
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Parse a path in this filesystem's context
    pub fn path(&self, raw: &str) -> Result<FsPath> {
        self.context.parse(raw)
    }

    pub fn root(&self) -> FsPath {
        self.context.root()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(FsError::NotOpen(self.context.authority().to_string()))
        }
    }

    fn check_context(&self, path: &FsPath) -> Result<()> {
        if path.context() == &self.context {
            Ok(())
        } else {
            Err(FsError::IncompatibleContext(
                self.context.authority().to_string(),
                path.context().authority().to_string(),
            ))
        }
    }

    pub fn is_directory(&self, path: &FsPath) -> Result<bool> {
        self.ensure_open()?;
        self.check_context(path)?;
        self.backend.is_directory(path)
    }

    pub fn list(&self, path: &FsPath) -> Result<Vec<DirEntry>> {
        self.ensure_open()?;
        self.check_context(path)?;
        self.backend.list(path)
    }

    /// Create a watch service over this filesystem
    pub fn new_watch_service(&self, config: &WatchConfig) -> Result<WatchService> {
        self.ensure_open()?;

        let service = WatchService::new(self.context.clone(), Arc::clone(&self.backend), config);

        let mut services = self.services.lock();
        services.retain(|s| s.upgrade().is_some_and(|s| s.is_open()));
        services.push(service.downgrade());
        Ok(service)
    }

    /// Close the filesystem and every watch service created from it; idempotent
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }

        let services = std::mem::take(&mut *self.services.lock());
        for service in services.iter().filter_map(WeakWatchService::upgrade) {
            service.close();
        }

        tracing::info!("Filesystem closed: {}", self.context.authority());
    }
}

impl fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSystem")
            .field("context", &self.context)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Open filesystems keyed by authority
///
/// Owned by the caller and passed by reference; dropping it closes everything it holds.
/// A filesystem closed directly through [`FileSystem::close`] counts as absent.
#[derive(Default)]
pub struct FileSystemRegistry {
    open: Mutex<HashMap<String, Arc<FileSystem>>>,
}

/// The live filesystem for `authority`, forgetting a closed one
fn live(open: &mut HashMap<String, Arc<FileSystem>>, authority: &str) -> Option<Arc<FileSystem>> {
    match open.get(authority) {
        Some(fs) if fs.is_open() => Some(Arc::clone(fs)),
        Some(_) => {
            open.remove(authority);
            None
        }
        None => None,
    }
}

impl FileSystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a filesystem under `authority`
    pub fn open(&self, authority: &str, backend: Arc<dyn StorageBackend>) -> Result<Arc<FileSystem>> {
        let mut open = self.open.lock();
        if live(&mut open, authority).is_some() {
            return Err(FsError::AlreadyOpen(authority.to_string()));
        }

        let fs = Arc::new(FileSystem::new(authority, backend));
        open.insert(authority.to_string(), Arc::clone(&fs));

        tracing::info!("Filesystem opened: {}", authority);
        Ok(fs)
    }

    pub fn get(&self, authority: &str) -> Result<Arc<FileSystem>> {
        live(&mut self.open.lock(), authority).ok_or_else(|| FsError::NotOpen(authority.to_string()))
    }

    /// Return the open filesystem for `authority`, opening it with `make_backend` if needed
    pub fn get_or_open<F>(&self, authority: &str, make_backend: F) -> Result<Arc<FileSystem>>
    where
        F: FnOnce() -> Result<Arc<dyn StorageBackend>>,
    {
        let mut open = self.open.lock();
        if let Some(fs) = live(&mut open, authority) {
            return Ok(fs);
        }

        let fs = Arc::new(FileSystem::new(authority, make_backend()?));
        open.insert(authority.to_string(), Arc::clone(&fs));

        tracing::info!("Filesystem opened: {}", authority);
        Ok(fs)
    }

    /// Close and forget the filesystem for `authority`
    pub fn close(&self, authority: &str) -> Result<()> {
        let fs = {
            let mut open = self.open.lock();
            let fs = live(&mut open, authority).ok_or_else(|| FsError::NotOpen(authority.to_string()))?;
            open.remove(authority);
            fs
        };
        fs.close();
        Ok(())
    }

    fn prune(&self) -> parking_lot::MutexGuard<'_, HashMap<String, Arc<FileSystem>>> {
        let mut open = self.open.lock();
        open.retain(|_, fs| fs.is_open());
        open
    }

    pub fn authorities(&self) -> Vec<String> {
        let mut authorities: Vec<String> = self.prune().keys().cloned().collect();
        authorities.sort();
        authorities
    }

    pub fn len(&self) -> usize {
        self.prune().len()
    }

    pub fn is_empty(&self) -> bool {
        self.prune().is_empty()
    }

    pub fn close_all(&self) {
        let drained: Vec<Arc<FileSystem>> = self.open.lock().drain().map(|(_, fs)| fs).collect();
        for fs in drained {
            fs.close();
        }
    }
}

impl Drop for FileSystemRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventKind, MemoryBackend};

    fn memory() -> Arc<dyn StorageBackend> {
        Arc::new(MemoryBackend::new())
    }

    #[test]
    fn test_open_get_close() {
        let registry = FileSystemRegistry::new();
        assert!(registry.is_empty());

        let fs = registry.open("cluster-a:8020", memory()).unwrap();
        assert_eq!(fs.context().authority(), "cluster-a:8020");
        assert!(matches!(
            registry.open("cluster-a:8020", memory()),
            Err(FsError::AlreadyOpen(_))
        ));

        let same = registry.get("cluster-a:8020").unwrap();
        assert!(Arc::ptr_eq(&fs, &same));
        assert!(matches!(registry.get("missing"), Err(FsError::NotOpen(_))));

        registry.close("cluster-a:8020").unwrap();
        assert!(!fs.is_open());
        assert!(registry.is_empty());
        assert!(matches!(registry.close("cluster-a:8020"), Err(FsError::NotOpen(_))));

        // the authority can be reopened once closed
        registry.open("cluster-a:8020", memory()).unwrap();
    }

    #[test]
    fn test_directly_closed_filesystem_is_absent() {
        let registry = FileSystemRegistry::new();
        let fs = registry.open("a", memory()).unwrap();
        fs.close();

        assert!(matches!(registry.get("a"), Err(FsError::NotOpen(_))));
        assert!(registry.is_empty());
        assert!(registry.authorities().is_empty());
        assert!(matches!(registry.close("a"), Err(FsError::NotOpen(_))));

        let reopened = registry.open("a", memory()).unwrap();
        assert!(reopened.is_open());
        assert!(!Arc::ptr_eq(&fs, &reopened));

        reopened.close();
        let fresh = registry.get_or_open("a", || Ok(memory())).unwrap();
        assert!(fresh.is_open());
        assert!(Arc::ptr_eq(&fresh, &registry.get("a").unwrap()));
    }

    #[test]
    fn test_get_or_open() {
        let registry = FileSystemRegistry::new();
        let first = registry.get_or_open("a", || Ok(memory())).unwrap();
        let second = registry
            .get_or_open("a", || Err(FsError::Backend("not called".into())))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        assert!(registry
            .get_or_open("b", || Err(FsError::Backend("unreachable".into())))
            .is_err());
        assert_eq!(registry.authorities(), vec!["a".to_string()]);
    }

    #[test]
    fn test_paths_belong_to_their_filesystem() {
        let registry = FileSystemRegistry::new();
        let a = registry.open("a", memory()).unwrap();
        let b = registry.open("b", memory()).unwrap();

        let pa = a.path("/x").unwrap();
        let pb = b.path("/x").unwrap();
        assert_ne!(pa, pb);
        assert!(matches!(pa.compare_to(&pb), Err(FsError::IncompatibleContext(..))));
        assert!(matches!(a.list(&pb), Err(FsError::IncompatibleContext(..))));
        assert!(a.is_directory(&a.root()).unwrap());
    }

    #[test]
    fn test_close_stops_watch_services() {
        let registry = FileSystemRegistry::new();
        let fs = registry.open("mem", memory()).unwrap();

        let service = fs.new_watch_service(&WatchConfig::default()).unwrap();
        let key = service.register(&fs.root(), &EventKind::ALL).unwrap();

        fs.close();
        fs.close();
        assert!(!service.is_open());
        assert!(!key.is_valid());
        assert!(matches!(
            fs.new_watch_service(&WatchConfig::default()),
            Err(FsError::NotOpen(_))
        ));
        assert!(matches!(fs.list(&fs.root()), Err(FsError::NotOpen(_))));
    }

    #[test]
    fn test_drop_closes_everything() {
        let fs;
        let service;
        {
            let registry = FileSystemRegistry::new();
            fs = registry.open("mem", memory()).unwrap();
            service = fs.new_watch_service(&WatchConfig::default()).unwrap();
            assert_eq!(registry.len(), 1);
        }
        assert!(!fs.is_open());
        assert!(!service.is_open());
    }
}
