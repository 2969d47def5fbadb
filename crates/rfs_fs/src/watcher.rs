//! Polling change notification
//!
//! A [`WatchService`] periodically lists every registered directory through the
//! [`StorageBackend`] and diffs the listing against what each [`WatchKey`] remembers.
//! Consumers pick up signalled keys with `poll`/`poll_timeout`/`take`, drain them with
//! [`WatchKey::poll_events`] and re-arm them with [`WatchKey::reset`].
//!
//! Locking: the registry lock is held only to snapshot or edit the key map, and each
//! key's lock only while merging a listing or serving a consumer call. Backend I/O runs
//! outside both; concurrent cycles are ordered by per-key listing sequence numbers, so a
//! listing that finishes after a newer one has been merged is dropped.

use crate::{DirEntry, FsContext, FsError, FsPath, Result, StorageBackend, WatchConfig};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::ops::Bound;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

/// Kind of change observed on a child of a watched directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Modified,
    Deleted,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Created, EventKind::Modified, EventKind::Deleted];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Modified => "modified",
            EventKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" | "create" => Ok(EventKind::Created),
            "modified" | "modify" => Ok(EventKind::Modified),
            "deleted" | "delete" => Ok(EventKind::Deleted),
            other => Err(FsError::InvalidArgument(format!("unknown event kind: {}", other))),
        }
    }
}

/// Change record for one child of a watched directory
///
/// Updated in place as observations arrive: the kind follows the latest change and
/// `count` accumulates over the life of the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchEvent {
    kind: EventKind,
    path: FsPath,
    count: u32,
    timestamp: SystemTime,
}

impl WatchEvent {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn path(&self) -> &FsPath {
        &self.path
    }

    /// Number of changes observed for this path since registration
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Last modification time reported by the backend
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
}

/// What a key remembers about one child
#[derive(Debug)]
struct Tracked {
    event: WatchEvent,
    /// Ordering stamp compared against `last_polled`
    stamp: SystemTime,
}

#[derive(Debug)]
struct KeyState {
    kinds: HashSet<EventKind>,
    children: HashMap<FsPath, Tracked>,
    ready: bool,
    /// Children first listed with a later mtime count as created
    registered: SystemTime,
    last_polled: SystemTime,
    /// Sequence number handed to the most recently started listing
    issued: u64,
    /// Sequence number of the last listing merged
    merged: u64,
}

impl KeyState {
    fn pending(&self) -> impl Iterator<Item = &Tracked> + '_ {
        self.children.values().filter(move |t| {
            t.event.count > 0
                && t.stamp > self.last_polled
                && self.kinds.contains(&t.event.kind)
        })
    }

    /// Stamps never fall behind `last_polled`, so a change is not hidden by a batch
    /// that was consumed with a later (possibly future-dated) timestamp.
    fn visible_stamp(&self, candidate: SystemTime) -> SystemTime {
        if candidate > self.last_polled {
            candidate
        } else {
            self.last_polled + Duration::from_nanos(1)
        }
    }
}

struct KeyInner {
    dir: FsPath,
    valid: AtomicBool,
    state: Mutex<KeyState>,
    service: Weak<ServiceInner>,
}

/// Registration of one directory with a [`WatchService`]
#[derive(Clone)]
pub struct WatchKey {
    inner: Arc<KeyInner>,
}

impl WatchKey {
    fn new(dir: FsPath, kinds: &[EventKind], service: Weak<ServiceInner>) -> Self {
        let now = SystemTime::now();
        Self {
            inner: Arc::new(KeyInner {
                dir,
                valid: AtomicBool::new(true),
                state: Mutex::new(KeyState {
                    kinds: kinds.iter().copied().collect(),
                    children: HashMap::new(),
                    ready: true,
                    registered: now,
                    last_polled: now,
                    issued: 0,
                    merged: 0,
                }),
                service,
            }),
        }
    }

    /// The watched directory
    pub fn watchable(&self) -> &FsPath {
        &self.inner.dir
    }

    /// Requested event kinds
    pub fn kinds(&self) -> Vec<EventKind> {
        let state = self.inner.state.lock();
        EventKind::ALL
            .into_iter()
            .filter(|k| state.kinds.contains(k))
            .collect()
    }

    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::SeqCst)
    }

    /// Valid, ready and holding events a consumer has not seen
    pub fn is_signalled(&self) -> bool {
        if !self.is_valid() {
            return false;
        }
        let state = self.inner.state.lock();
        state.ready && state.pending().next().is_some()
    }

    /// Take the batch of pending events
    ///
    /// Returns nothing while a previous batch is outstanding (until [`reset`](Self::reset)).
    /// An empty result leaves the key ready, since no batch is outstanding.
    pub fn poll_events(&self) -> Vec<WatchEvent> {
        let mut state = self.inner.state.lock();
        if !state.ready {
            return Vec::new();
        }

        let mut stamps = Vec::new();
        let mut batch = Vec::new();
        for tracked in state.pending() {
            stamps.push(tracked.stamp);
            batch.push(tracked.event.clone());
        }

        let Some(latest) = stamps.into_iter().max() else {
            return batch;
        };

        state.last_polled = latest;
        state.ready = false;
        batch.sort_by(|a, b| a.path.cmp(&b.path));
        batch
    }

    /// Re-arm the key after a batch was consumed
    ///
    /// Returns false when the key is cancelled or had nothing outstanding. A
    /// [`poll_events`](Self::poll_events) call that returned nothing leaves the key
    /// ready, so resetting after it also returns false.
    pub fn reset(&self) -> bool {
        if !self.is_valid() {
            return false;
        }
        let mut state = self.inner.state.lock();
        if state.ready {
            return false;
        }
        state.ready = true;
        true
    }

    /// Cancel the registration; idempotent
    pub fn cancel(&self) {
        if self.invalidate() {
            tracing::debug!("Watch key cancelled: {}", self.inner.dir);
            if let Some(service) = self.inner.service.upgrade() {
                service.forget(self);
            }
        }
    }

    /// Flip `valid` under the state lock so no merge lands after it.
    /// Returns whether this call did the flip.
    fn invalidate(&self) -> bool {
        let _state = self.inner.state.lock();
        self.inner.valid.swap(false, Ordering::SeqCst)
    }

    /// Number the listing about to be requested for this key
    fn begin_listing(&self) -> u64 {
        let mut state = self.inner.state.lock();
        state.issued += 1;
        state.issued
    }

    fn set_kinds(&self, kinds: &[EventKind]) {
        self.inner.state.lock().kinds = kinds.iter().copied().collect();
    }

    /// Diff a fresh listing against the remembered children
    ///
    /// `seq` comes from [`begin_listing`](Self::begin_listing); a listing older than the
    /// last one merged is stale and dropped. Returns the number of changes recorded.
    fn merge(&self, seq: u64, listing: Vec<DirEntry>, now: SystemTime) -> usize {
        let mut state = self.inner.state.lock();
        if !self.is_valid() {
            return 0;
        }
        if seq <= state.merged {
            tracing::trace!("Dropping stale listing #{} of {}", seq, self.inner.dir);
            return 0;
        }
        state.merged = seq;

        let mut seen = HashSet::with_capacity(listing.len());
        let mut changes = 0;

        for entry in listing {
            let registered = state.registered;
            let stamp_modified = state.visible_stamp(entry.modified);
            let stamp_now = state.visible_stamp(now.max(entry.modified));

            match state.children.entry(entry.path.clone()) {
                Entry::Vacant(slot) => {
                    let created = entry.modified > registered;
                    if created {
                        changes += 1;
                    }
                    slot.insert(Tracked {
                        event: WatchEvent {
                            kind: EventKind::Created,
                            path: entry.path.clone(),
                            count: u32::from(created),
                            timestamp: entry.modified,
                        },
                        stamp: stamp_modified,
                    });
                }
                Entry::Occupied(mut slot) => {
                    let tracked = slot.get_mut();
                    if tracked.event.kind == EventKind::Deleted {
                        tracked.event.kind = EventKind::Created;
                        tracked.event.count += 1;
                        tracked.event.timestamp = entry.modified;
                        tracked.stamp = stamp_now;
                        changes += 1;
                    } else if entry.modified > tracked.event.timestamp {
                        tracked.event.kind = EventKind::Modified;
                        tracked.event.count += 1;
                        tracked.event.timestamp = entry.modified;
                        tracked.stamp = stamp_modified;
                        changes += 1;
                    }
                }
            }

            seen.insert(entry.path);
        }

        let deleted_stamp = state.visible_stamp(now);
        for (path, tracked) in state.children.iter_mut() {
            if tracked.event.kind != EventKind::Deleted && !seen.contains(path) {
                tracked.event.kind = EventKind::Deleted;
                tracked.event.count += 1;
                tracked.stamp = deleted_stamp;
                changes += 1;
            }
        }

        if changes > 0 {
            tracing::trace!("{} change(s) under {}", changes, self.inner.dir);
        }
        changes
    }
}

impl PartialEq for WatchKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for WatchKey {}

impl fmt::Debug for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchKey")
            .field("dir", &self.inner.dir)
            .field("valid", &self.is_valid())
            .finish()
    }
}

struct ServiceInner {
    context: FsContext,
    backend: Arc<dyn StorageBackend>,
    period: Duration,
    background: AtomicBool,
    running: AtomicBool,

    /// Registry of live keys by watched directory
    keys: Mutex<BTreeMap<FsPath, WatchKey>>,
    /// Directory of the key handed out last, for round-robin
    cursor: Mutex<Option<FsPath>>,

    /// Bumped whenever waiters should look again
    generation: Mutex<u64>,
    wakeup: Condvar,

    poller: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceInner {
    fn forget(&self, key: &WatchKey) {
        let mut keys = self.keys.lock();
        if keys.get(key.watchable()).is_some_and(|k| k == key) {
            keys.remove(key.watchable());
        }
    }

    fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.wakeup.notify_all();
    }
}

/// Polling watch service for one filesystem context
#[derive(Clone)]
pub struct WatchService {
    inner: Arc<ServiceInner>,
}

impl WatchService {
    /// Create a watch service over `backend`
    ///
    /// With `background_polling` set, a background thread runs the poll cycle every
    /// period; otherwise cycles run inside `poll`, `poll_timeout` and `take`.
    pub fn new(context: FsContext, backend: Arc<dyn StorageBackend>, config: &WatchConfig) -> Self {
        let service = Self {
            inner: Arc::new(ServiceInner {
                context,
                backend,
                period: config.poll_interval(),
                background: AtomicBool::new(false),
                running: AtomicBool::new(true),
                keys: Mutex::new(BTreeMap::new()),
                cursor: Mutex::new(None),
                generation: Mutex::new(0),
                wakeup: Condvar::new(),
                poller: Mutex::new(None),
            }),
        };

        if config.background_polling {
            service.spawn_poller();
        }

        tracing::info!(
            "Watch service started for {} (period {:?}, background: {})",
            service.inner.context.authority(),
            service.inner.period,
            service.is_background()
        );
        service
    }

    fn spawn_poller(&self) {
        let weak = Arc::downgrade(&self.inner);
        let spawned = thread::Builder::new()
            .name("rfs-watch-poller".into())
            .spawn(move || poller_loop(weak));

        match spawned {
            Ok(handle) => {
                self.inner.background.store(true, Ordering::SeqCst);
                *self.inner.poller.lock() = Some(handle);
            }
            Err(e) => {
                tracing::warn!("Failed to start poller thread, polling from callers: {}", e);
            }
        }
    }

    pub fn context(&self) -> &FsContext {
        &self.inner.context
    }

    pub fn period(&self) -> Duration {
        self.inner.period
    }

    pub fn is_open(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_background(&self) -> bool {
        self.inner.background.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(FsError::ClosedService)
        }
    }

    /// Watch a directory for the given kinds of change
    ///
    /// A directory that already has a valid key gets that key back with its kinds
    /// replaced.
    pub fn register(&self, path: &FsPath, kinds: &[EventKind]) -> Result<WatchKey> {
        self.ensure_open()?;

        if path.context() != &self.inner.context {
            return Err(FsError::IncompatibleContext(
                self.inner.context.authority().to_string(),
                path.context().authority().to_string(),
            ));
        }
        if kinds.is_empty() {
            return Err(FsError::InvalidArgument(format!(
                "no event kinds requested for {}",
                path
            )));
        }
        if !self.inner.backend.is_directory(path)? {
            return Err(FsError::NotADirectory(path.to_string()));
        }

        let mut keys = self.inner.keys.lock();
        // close() may have run during the backend call
        self.ensure_open()?;

        if let Some(existing) = keys.get(path).filter(|k| k.is_valid()) {
            existing.set_kinds(kinds);
            tracing::info!("Updated watch on {} to {:?}", path, kinds);
            return Ok(existing.clone());
        }

        let key = WatchKey::new(path.clone(), kinds, Arc::downgrade(&self.inner));
        keys.insert(path.clone(), key.clone());

        tracing::info!("Watching {} for {:?}", path, kinds);
        Ok(key)
    }

    /// Live keys in directory order
    pub fn keys(&self) -> Vec<WatchKey> {
        self.inner.keys.lock().values().cloned().collect()
    }

    /// List every watched directory once and merge the results
    ///
    /// A listing failure is logged and skipped; the next cycle retries it. Returns the
    /// number of changes recorded.
    pub fn run_poll_cycle(&self) -> Result<usize> {
        self.ensure_open()?;

        let keys = self.keys();
        let mut changes = 0;

        for key in &keys {
            if !key.is_valid() || !self.is_open() {
                continue;
            }

            let seq = key.begin_listing();
            match self.inner.backend.list(key.watchable()) {
                Ok(listing) => changes += key.merge(seq, listing, SystemTime::now()),
                Err(e) if e.is_transient() => {
                    tracing::warn!("Listing {} failed, retrying next period: {}", key.watchable(), e);
                }
                Err(e) => {
                    tracing::error!("Listing {} failed: {}", key.watchable(), e);
                }
            }
        }

        tracing::debug!(keys = keys.len(), changes, "Poll cycle complete");

        if changes > 0 {
            self.inner.notify();
        }
        Ok(changes)
    }

    /// Non-blocking: a signalled key, if any
    pub fn poll(&self) -> Result<Option<WatchKey>> {
        self.ensure_open()?;
        if !self.is_background() {
            self.run_poll_cycle()?;
        }
        Ok(self.next_signalled())
    }

    /// Wait up to `timeout` for a signalled key
    pub fn poll_timeout(&self, timeout: Duration) -> Result<Option<WatchKey>> {
        self.wait_for_key(Instant::now().checked_add(timeout))
    }

    /// Wait for a signalled key; fails once the service is closed
    pub fn take(&self) -> Result<WatchKey> {
        loop {
            if let Some(key) = self.wait_for_key(None)? {
                return Ok(key);
            }
        }
    }

    fn wait_for_key(&self, deadline: Option<Instant>) -> Result<Option<WatchKey>> {
        loop {
            let observed = *self.inner.generation.lock();

            if let Some(key) = self.poll()? {
                return Ok(Some(key));
            }

            let mut wait = self.inner.period;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                wait = wait.min(deadline - now);
            }

            let mut generation = self.inner.generation.lock();
            self.ensure_open()?;
            if *generation == observed {
                self.inner.wakeup.wait_for(&mut generation, wait);
            }
        }
    }

    fn next_signalled(&self) -> Option<WatchKey> {
        let keys = self.inner.keys.lock();
        let mut cursor = self.inner.cursor.lock();

        // Start after the key handed out last so busy directories cannot starve others
        let ordered: Vec<WatchKey> = match cursor.as_ref() {
            Some(last) => keys
                .range((Bound::Excluded(last.clone()), Bound::Unbounded))
                .chain(keys.range(..=last.clone()))
                .map(|(_, k)| k.clone())
                .collect(),
            None => keys.values().cloned().collect(),
        };
        drop(keys);

        let found = ordered.into_iter().find(|k| k.is_signalled());
        if let Some(key) = &found {
            *cursor = Some(key.watchable().clone());
        }
        found
    }

    /// Close the service: cancel every key and wake every waiter; idempotent
    pub fn close(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let keys = std::mem::take(&mut *self.inner.keys.lock());
        for key in keys.values() {
            key.invalidate();
        }

        self.inner.notify();

        let poller = self.inner.poller.lock().take();
        if let Some(handle) = poller {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::warn!("Poller thread panicked");
            }
        }

        tracing::info!(
            "Watch service closed for {} ({} key(s) cancelled)",
            self.inner.context.authority(),
            keys.len()
        );
    }

    pub(crate) fn downgrade(&self) -> WeakWatchService {
        WeakWatchService(Arc::downgrade(&self.inner))
    }
}

impl fmt::Debug for WatchService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchService")
            .field("context", &self.inner.context)
            .field("period", &self.inner.period)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Handle that does not keep a service alive
pub(crate) struct WeakWatchService(Weak<ServiceInner>);

impl WeakWatchService {
    pub(crate) fn upgrade(&self) -> Option<WatchService> {
        self.0.upgrade().map(|inner| WatchService { inner })
    }
}

fn poller_loop(weak: Weak<ServiceInner>) {
    tracing::debug!("Poller thread started");

    loop {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let service = WatchService { inner };

        match service.run_poll_cycle() {
            Ok(_) => {}
            Err(FsError::ClosedService) => break,
            Err(e) => tracing::warn!("Poll cycle failed: {}", e),
        }

        let mut generation = service.inner.generation.lock();
        if !service.is_open() {
            break;
        }
        service.inner.wakeup.wait_for(&mut generation, service.inner.period);
    }

    tracing::debug!("Poller thread stopped");
}
