//! Reference-counted checkout/checkin cache of open asset sources.
//!
//! A source is held by at most one reader at a time. Checking out removes
//! it from its cache entry; dropping the [`CacheLease`] puts it back, so
//! every checkout is matched by exactly one checkin on every exit path.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use montage_common::error::{MontageError, MontageResult};
use montage_timeline::{Asset, AssetId, MediaKind};

use crate::buffers::Frame;
use crate::source::{MediaOpener, MediaSource};

/// Interval between re-checks while a blocking checkout waits.
const CHECKOUT_RETRY: Duration = Duration::from_millis(100);

struct CacheEntry {
    /// `None` while checked out.
    source: Option<Box<dyn MediaSource>>,
    memory: u64,
    last_used: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<AssetId, CacheEntry>,
    tick: u64,
    checkouts: u64,
    checkins: u64,
}

/// Counters describing cache activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub checked_out: usize,
    pub checkouts: u64,
    pub checkins: u64,
    pub memory: u64,
}

/// Shared cache of open sources, one per asset.
pub struct AssetCache {
    opener: Arc<dyn MediaOpener>,
    max_bytes: u64,
    state: Mutex<CacheState>,
    available: Condvar,
}

impl std::fmt::Debug for AssetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetCache")
            .field("max_bytes", &self.max_bytes)
            .field("stats", &self.stats())
            .finish()
    }
}

impl AssetCache {
    pub fn new(opener: Arc<dyn MediaOpener>, max_bytes: u64) -> Self {
        Self {
            opener,
            max_bytes,
            state: Mutex::new(CacheState::default()),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take exclusive use of the source for `asset`, opening it on first use.
    ///
    /// When another reader holds it, a blocking checkout waits until it is
    /// checked in; a non-blocking one returns `Ok(None)`.
    pub fn checkout(&self, asset: &Asset, block: bool) -> MontageResult<Option<CacheLease<'_>>> {
        let mut state = self.lock();
        loop {
            state.tick += 1;
            let tick = state.tick;
            let idle = state.entries.get_mut(&asset.id).map(|entry| {
                let source = entry.source.take();
                if source.is_some() {
                    entry.last_used = tick;
                }
                source
            });
            match idle {
                Some(Some(source)) => {
                    state.checkouts += 1;
                    return Ok(Some(CacheLease::new(self, asset.id, source)));
                }
                Some(None) if !block => return Ok(None),
                Some(None) => {
                    state = match self.available.wait_timeout(state, CHECKOUT_RETRY) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
                None => {
                    // Reserve the entry as checked out so the open runs
                    // without the lock while other readers of this asset wait.
                    state.entries.insert(
                        asset.id,
                        CacheEntry {
                            source: None,
                            memory: 0,
                            last_used: tick,
                        },
                    );
                    drop(state);
                    return self.open_reserved(asset).map(Some);
                }
            }
        }
    }

    fn open_reserved(&self, asset: &Asset) -> MontageResult<CacheLease<'_>> {
        let opened = self.opener.open(asset);
        let mut state = self.lock();
        let source = match opened {
            Ok(source) => source,
            Err(e) => {
                state.entries.remove(&asset.id);
                drop(state);
                self.available.notify_all();
                return Err(e);
            }
        };
        tracing::debug!(asset = asset.id.0, path = %asset.path.display(), "Opened asset source");
        if let Some(entry) = state.entries.get_mut(&asset.id) {
            entry.memory = source.memory_usage();
        }
        state.checkouts += 1;
        Ok(CacheLease::new(self, asset.id, source))
    }

    fn checkin(&self, id: AssetId, source: Box<dyn MediaSource>) {
        let mut state = self.lock();
        state.tick += 1;
        let tick = state.tick;
        let memory = source.memory_usage();
        match state.entries.get_mut(&id) {
            Some(entry) => {
                entry.memory = memory;
                entry.last_used = tick;
                entry.source = Some(source);
            }
            None => {
                // Entry removed while checked out; keep the source for reuse.
                state.entries.insert(
                    id,
                    CacheEntry {
                        source: Some(source),
                        memory,
                        last_used: tick,
                    },
                );
            }
        }
        state.checkins += 1;
        self.age(&mut state);
        drop(state);
        self.available.notify_all();
    }

    /// Evict idle entries, oldest first, while over the memory budget.
    fn age(&self, state: &mut CacheState) {
        loop {
            let total: u64 = state.entries.values().map(|e| e.memory).sum();
            if total <= self.max_bytes {
                return;
            }
            let oldest = state
                .entries
                .iter()
                .filter(|(_, e)| e.source.is_some())
                .min_by_key(|(_, e)| e.last_used)
                .map(|(id, _)| *id);
            match oldest {
                Some(id) => {
                    state.entries.remove(&id);
                    tracing::debug!(asset = id.0, total, budget = self.max_bytes, "Evicted idle asset source");
                }
                None => return,
            }
        }
    }

    /// Close every idle source.
    pub fn remove_all(&self) {
        self.lock().entries.retain(|_, e| e.source.is_none());
    }

    pub fn is_checked_out(&self, id: AssetId) -> bool {
        self.lock()
            .entries
            .get(&id)
            .map(|e| e.source.is_none())
            .unwrap_or(false)
    }

    pub fn contains(&self, id: AssetId) -> bool {
        self.lock().entries.contains_key(&id)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            entries: state.entries.len(),
            checked_out: state.entries.values().filter(|e| e.source.is_none()).count(),
            checkouts: state.checkouts,
            checkins: state.checkins,
            memory: state.entries.values().map(|e| e.memory).sum(),
        }
    }
}

/// Exclusive use of one asset's source. Checked in when dropped.
pub struct CacheLease<'a> {
    cache: &'a AssetCache,
    id: AssetId,
    source: Box<dyn MediaSource>,
}

impl<'a> CacheLease<'a> {
    fn new(cache: &'a AssetCache, id: AssetId, source: Box<dyn MediaSource>) -> Self {
        Self { cache, id, source }
    }

    pub fn asset(&self) -> AssetId {
        self.id
    }
}

impl Deref for CacheLease<'_> {
    type Target = dyn MediaSource;

    fn deref(&self) -> &Self::Target {
        self.source.as_ref()
    }
}

impl DerefMut for CacheLease<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.source.as_mut()
    }
}

impl Drop for CacheLease<'_> {
    fn drop(&mut self) {
        let source = std::mem::replace(&mut self.source, Box::new(Detached));
        self.cache.checkin(self.id, source);
    }
}

/// Placeholder left in a lease while its source is checked back in.
struct Detached;

impl MediaSource for Detached {
    fn set_position(&mut self, _kind: MediaKind, _position: i64) {}

    fn read_samples(&mut self, _channel: usize, _buffer: &mut [f64]) -> MontageResult<()> {
        Err(MontageError::asset("Source already checked in"))
    }

    fn read_frame(&mut self, _layer: usize, _frame: &mut Frame) -> MontageResult<()> {
        Err(MontageError::asset("Source already checked in"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::GeneratorOpener;
    use montage_timeline::{AudioParams, Generator};
    use std::sync::mpsc;

    fn asset(id: u32) -> Asset {
        Asset::generated(
            AssetId(id),
            Generator::Ramp { period: 10 },
            Some(AudioParams {
                channels: 1,
                sample_rate: 100,
                length: 100,
            }),
            None,
        )
    }

    fn cache(max_bytes: u64) -> AssetCache {
        AssetCache::new(Arc::new(GeneratorOpener), max_bytes)
    }

    #[test]
    fn test_checkout_is_exclusive() {
        let cache = cache(u64::MAX);
        let first = cache.checkout(&asset(1), false).unwrap();
        assert!(first.is_some());
        assert!(cache.checkout(&asset(1), false).unwrap().is_none());
        assert!(cache.is_checked_out(AssetId(1)));

        drop(first);
        assert!(!cache.is_checked_out(AssetId(1)));
        assert!(cache.checkout(&asset(1), false).unwrap().is_some());
        let stats = cache.stats();
        assert_eq!(stats.checkouts, 2);
        assert_eq!(stats.checkins, 2);
    }

    #[test]
    fn test_lease_reads_source() {
        let cache = cache(u64::MAX);
        let mut lease = cache.checkout(&asset(1), true).unwrap().unwrap();
        lease.set_position(MediaKind::Audio, 5);
        let mut buffer = [0.0; 1];
        lease.read_samples(0, &mut buffer).unwrap();
        assert_eq!(buffer[0], 0.0);
        let mut frame = Frame::new(1, 1);
        assert!(lease.read_frame(0, &mut frame).is_err());
    }

    #[test]
    fn test_blocking_checkout_waits_for_checkin() {
        let cache = Arc::new(cache(u64::MAX));
        let lease = cache.checkout(&asset(1), true).unwrap().unwrap();

        let waiter = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.checkout(&asset(1), true).unwrap().is_some())
        };
        std::thread::sleep(Duration::from_millis(30));
        drop(lease);
        assert!(waiter.join().unwrap());
        assert_eq!(cache.stats().checked_out, 0);
    }

    #[test]
    fn test_checkin_ages_oldest_idle_entries() {
        // Each generator without video reports 4096 bytes.
        let cache = cache(8192);
        for id in 1..=3 {
            cache.checkout(&asset(id), false).unwrap();
        }
        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert!(!cache.contains(AssetId(1)));
        assert!(cache.contains(AssetId(3)));
    }

    #[test]
    fn test_held_sources_are_never_evicted() {
        let cache = cache(0);
        let held = cache.checkout(&asset(1), false).unwrap();
        drop(cache.checkout(&asset(2), false).unwrap());
        assert!(cache.contains(AssetId(1)));
        assert!(!cache.contains(AssetId(2)));
        drop(held);
        assert_eq!(cache.stats().entries, 0);
    }

    struct FailingOpener;

    impl MediaOpener for FailingOpener {
        fn open(&self, asset: &Asset) -> MontageResult<Box<dyn MediaSource>> {
            Err(MontageError::asset(format!("cannot open {}", asset.id.0)))
        }
    }

    /// Blocks opening asset 1 until released.
    struct GatedOpener {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl MediaOpener for GatedOpener {
        fn open(&self, asset: &Asset) -> MontageResult<Box<dyn MediaSource>> {
            if asset.id == AssetId(1) {
                self.entered.lock().unwrap().send(()).unwrap();
                self.release.lock().unwrap().recv().unwrap();
            }
            GeneratorOpener.open(asset)
        }
    }

    #[test]
    fn test_slow_open_does_not_block_other_assets() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let opener = GatedOpener {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        };
        let cache = Arc::new(AssetCache::new(Arc::new(opener), u64::MAX));

        let opening = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.checkout(&asset(1), true).unwrap().is_some())
        };
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                let _ = done_tx.send(cache.checkout(&asset(2), false).unwrap().is_some());
            });
        }
        assert!(done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("checkout of asset 2 waited on asset 1"));

        // Asset 1 reads as held while it opens.
        assert!(cache.checkout(&asset(1), false).unwrap().is_none());
        assert!(cache.is_checked_out(AssetId(1)));

        release_tx.send(()).unwrap();
        assert!(opening.join().unwrap());
        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.checked_out, 0);
        assert_eq!(stats.checkouts, 2);
    }

    #[test]
    fn test_open_failure_wakes_waiters() {
        let cache = Arc::new(AssetCache::new(Arc::new(FailingOpener), u64::MAX));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.checkout(&asset(1), true).is_err())
            })
            .collect();
        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
        assert!(!cache.contains(AssetId(1)));
    }

    #[test]
    fn test_open_failure_leaves_no_entry() {
        let cache = AssetCache::new(Arc::new(FailingOpener), u64::MAX);
        assert!(cache.checkout(&asset(1), true).is_err());
        assert_eq!(cache.stats(), CacheStats::default());
    }
}
