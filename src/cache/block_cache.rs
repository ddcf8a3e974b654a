//! Shared, asynchronously populated cache of volume blocks.
//!
//! Residency is tracked per [`BlockKey`] in a concurrent table of weak
//! references. Strong references exist in three tiers: the current-frame
//! pin list (so a block requested this frame cannot vanish before the
//! frame is done), an LRU-bounded table of loaded blocks standing in for
//! soft references, and whatever consumers currently hold. When the last
//! strong reference goes away the entry removes its own key from the
//! table.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::{Condvar, Mutex};

use crate::cache::fetch_queue::BlockingPriorityQueue;
use crate::cache::fetcher::FetcherPool;
use crate::cache::io_timing::{self, IoTimeBudget};
use crate::volume::{Block, BlockLoader, BlockPayload, LoaderError};

/// Extents of the key space: how many timepoints and setups exist and how
/// many mipmap levels each setup has.
#[derive(Debug, Clone)]
pub struct CacheGeometry {
    pub num_timepoints: u32,
    pub num_setups: u32,
    /// Upper bound over all setups' mipmap level counts.
    pub max_num_levels: u32,
    /// Per setup, the index of its coarsest mipmap level.
    pub max_levels: Vec<u32>,
}

impl CacheGeometry {
    pub fn uniform(num_timepoints: u32, num_setups: u32, num_levels: u32) -> Self {
        Self {
            num_timepoints,
            num_setups,
            max_num_levels: num_levels,
            max_levels: vec![num_levels.saturating_sub(1); num_setups as usize],
        }
    }
}

/// Identifies one block: timepoint, setup, mipmap level and the
/// linearized position of the block on the level grid.
#[derive(Debug, Clone)]
pub struct BlockKey {
    timepoint: u32,
    setup: u32,
    level: u32,
    index: u64,
    hash: u32,
}

impl BlockKey {
    pub fn new(
        timepoint: u32,
        setup: u32,
        level: u32,
        index: u64,
        geometry: &CacheGeometry,
    ) -> Self {
        let value = index
            .wrapping_mul(geometry.max_num_levels as u64)
            .wrapping_add(level as u64)
            .wrapping_mul(geometry.num_setups as u64)
            .wrapping_add(setup as u64)
            .wrapping_mul(geometry.num_timepoints as u64)
            .wrapping_add(timepoint as u64);
        Self {
            timepoint,
            setup,
            level,
            index,
            hash: (value ^ (value >> 32)) as u32,
        }
    }

    pub fn timepoint(&self) -> u32 {
        self.timepoint
    }

    pub fn setup(&self) -> u32 {
        self.setup
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn index(&self) -> u64 {
        self.index
    }
}

impl PartialEq for BlockKey {
    fn eq(&self, other: &Self) -> bool {
        self.timepoint == other.timepoint
            && self.setup == other.setup
            && self.level == other.level
            && self.index == other.index
    }
}

impl Eq for BlockKey {}

impl std::hash::Hash for BlockKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u32(self.hash);
    }
}

/// What to do when a requested block's data is not loaded yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingStrategy {
    /// Enqueue for asynchronous loading and return immediately.
    Volatile,
    /// Load synchronously, retrying on interrupts.
    Blocking,
    /// Load synchronously while the caller's io time budget lasts,
    /// otherwise enqueue.
    Budgeted,
}

/// Sentinel generation marking an entry as valid / never to re-enqueue.
const GENERATION_VALID: u64 = u64::MAX;

type ResidencyMap<P> = DashMap<BlockKey, Weak<Entry<P>>>;

pub(crate) struct Entry<P: BlockPayload> {
    key: BlockKey,
    block: Block<P>,
    /// Generation this entry was last enqueued for. 0 = never enqueued,
    /// `GENERATION_VALID` = loaded.
    enqueue_generation: AtomicU64,
    /// Serializes loader calls for this entry.
    load_lock: Mutex<()>,
    /// Guards payload publication; `loaded` waiters re-check validity
    /// under it.
    monitor: Mutex<()>,
    loaded: Condvar,
    residency: Weak<ResidencyMap<P>>,
}

impl<P: BlockPayload> Drop for Entry<P> {
    fn drop(&mut self) {
        // last strong reference is gone, purge the key unless a new entry
        // already took its place
        if let Some(residency) = self.residency.upgrade() {
            residency.remove_if(&self.key, |_, weak| weak.upgrade().is_none());
        }
    }
}

/// Strong handle to a cached block. Holding it pins the entry.
pub struct CacheBlock<P: BlockPayload>(Arc<Entry<P>>);

impl<P: BlockPayload> Clone for CacheBlock<P> {
    fn clone(&self) -> Self {
        CacheBlock(Arc::clone(&self.0))
    }
}

impl<P: BlockPayload> CacheBlock<P> {
    pub fn key(&self) -> &BlockKey {
        &self.0.key
    }

    #[cfg(test)]
    pub(crate) fn enqueue_generation(&self) -> u64 {
        self.0.enqueue_generation.load(Ordering::Acquire)
    }
}

impl<P: BlockPayload> std::ops::Deref for CacheBlock<P> {
    type Target = Block<P>;

    fn deref(&self) -> &Block<P> {
        &self.0.block
    }
}

pub(crate) struct CacheInner<L: BlockLoader> {
    geometry: CacheGeometry,
    loader: L,
    residency: Arc<ResidencyMap<L::Payload>>,
    /// Entries enqueued in the current frame, pinned against reclamation.
    pinned: Mutex<Vec<Arc<Entry<L::Payload>>>>,
    /// Loaded entries kept alive until memory pressure evicts them.
    soft: Mutex<LruCache<BlockKey, Arc<Entry<L::Payload>>>>,
    pub(crate) queue: Arc<BlockingPriorityQueue<BlockKey>>,
    generation: AtomicU64,
}

impl<L: BlockLoader> CacheInner<L> {
    pub(crate) fn lookup(&self, key: &BlockKey) -> Option<Arc<Entry<L::Payload>>> {
        self.residency.get(key).and_then(|weak| weak.value().upgrade())
    }

    fn priority_of(&self, key: &BlockKey) -> usize {
        // coarser levels load first
        (self.geometry.max_levels[key.setup as usize] - key.level) as usize
    }

    /// Enqueue at most once per generation; pins the entry for the
    /// current frame.
    fn enqueue(&self, entry: &Arc<Entry<L::Payload>>) {
        let generation = self.generation.load(Ordering::Acquire);
        let previous = entry.enqueue_generation.fetch_max(generation, Ordering::AcqRel);
        if previous < generation {
            self.queue.put(entry.key.clone(), self.priority_of(&entry.key));
            self.pinned.lock().push(Arc::clone(entry));
        }
    }

    /// Load the entry's data synchronously if it is not valid yet.
    pub(crate) fn load_if_invalid(
        &self,
        entry: &Arc<Entry<L::Payload>>,
    ) -> Result<(), LoaderError> {
        if entry.block.is_valid() {
            return Ok(());
        }
        let _load = entry.load_lock.lock();
        if entry.block.is_valid() {
            return Ok(());
        }
        let key = &entry.key;
        let stats = io_timing::statistics();
        stats.start();
        let result = self.loader.load_block(
            key.timepoint,
            key.setup,
            key.level,
            entry.block.dims(),
            entry.block.origin(),
        );
        stats.stop();
        match result {
            Ok(payload) => {
                let bytes =
                    payload.num_elements() as u64 * self.loader.bytes_per_element() as u64;
                {
                    let _monitor = entry.monitor.lock();
                    entry.block.publish(payload);
                    entry
                        .enqueue_generation
                        .store(GENERATION_VALID, Ordering::Release);
                    entry.loaded.notify_all();
                }
                stats.add_io_bytes(bytes);
                self.soft.lock().put(key.clone(), Arc::clone(entry));
                Ok(())
            }
            Err(err) => {
                if !matches!(err, LoaderError::Interrupted) {
                    log::warn!("block load failed, keeping placeholder: {}", err);
                }
                Err(err)
            }
        }
    }

    /// BUDGETED path: enqueue, then wait on the entry for as long as the
    /// calling job's budget at this priority allows, charging the time
    /// actually spent back to the budget.
    fn load_or_enqueue(&self, entry: &Arc<Entry<L::Payload>>) {
        let stats = io_timing::statistics();
        let Some(budget) = stats.io_time_budget() else {
            self.enqueue(entry);
            return;
        };
        let priority = self.priority_of(&entry.key);
        let time_left = budget.time_left(priority);
        if time_left > 0 {
            let mut monitor = entry.monitor.lock();
            if entry.block.is_valid() {
                return;
            }
            self.enqueue(entry);
            let t0 = stats.io_nanos();
            stats.start();
            entry
                .loaded
                .wait_for(&mut monitor, Duration::from_nanos(time_left as u64));
            stats.stop();
            budget.use_time((stats.io_nanos() - t0) as i64, priority);
        } else {
            self.enqueue(entry);
        }
    }

    fn apply_strategy(&self, entry: &Arc<Entry<L::Payload>>, strategy: LoadingStrategy) {
        match strategy {
            LoadingStrategy::Volatile => self.enqueue(entry),
            LoadingStrategy::Blocking => loop {
                match self.load_if_invalid(entry) {
                    Err(LoaderError::Interrupted) => continue,
                    _ => break,
                }
            },
            LoadingStrategy::Budgeted => {
                if !entry.block.is_valid() {
                    self.load_or_enqueue(entry);
                }
            }
        }
    }

    fn new_entry(&self, key: BlockKey, dims: [u32; 3], origin: [i64; 3]) -> Arc<Entry<L::Payload>> {
        Arc::new(Entry {
            block: Block::new(dims, origin, self.loader.empty_payload(dims)),
            key,
            enqueue_generation: AtomicU64::new(0),
            load_lock: Mutex::new(()),
            monitor: Mutex::new(()),
            loaded: Condvar::new(),
            residency: Arc::downgrade(&self.residency),
        })
    }
}

/// The cache proper: residency table plus the fetcher pool that drains
/// its queue.
pub struct BlockCache<L: BlockLoader> {
    inner: Arc<CacheInner<L>>,
    fetchers: FetcherPool,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub num_fetcher_threads: usize,
    /// Capacity of the loaded-block retention tier, in blocks.
    pub soft_cache_blocks: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            num_fetcher_threads: 1,
            soft_cache_blocks: 1024,
        }
    }
}

impl<L: BlockLoader> BlockCache<L> {
    pub fn new(loader: L, geometry: CacheGeometry, config: CacheConfig) -> Self {
        let queue = Arc::new(BlockingPriorityQueue::new(geometry.max_num_levels as usize));
        let capacity = std::num::NonZeroUsize::new(config.soft_cache_blocks.max(1))
            .expect("capacity is nonzero");
        let inner = Arc::new(CacheInner {
            geometry,
            loader,
            residency: Arc::new(DashMap::new()),
            pinned: Mutex::new(Vec::new()),
            soft: Mutex::new(LruCache::new(capacity)),
            queue: Arc::clone(&queue),
            generation: AtomicU64::new(1),
        });
        let fetchers = FetcherPool::new(&inner, queue, config.num_fetcher_threads);
        Self { inner, fetchers }
    }

    pub fn geometry(&self) -> &CacheGeometry {
        &self.inner.geometry
    }

    /// Look up a block without creating it. The returned block's payload
    /// may still be invalid; `strategy` decides what is done about that.
    pub fn get_if_present(
        &self,
        key: &BlockKey,
        strategy: LoadingStrategy,
    ) -> Option<CacheBlock<L::Payload>> {
        let entry = self.inner.lookup(key)?;
        self.inner.apply_strategy(&entry, strategy);
        Some(CacheBlock(entry))
    }

    /// Look up a block, installing a placeholder if it is absent, then
    /// apply `strategy`.
    pub fn get_or_create(
        &self,
        key: BlockKey,
        dims: [u32; 3],
        origin: [i64; 3],
        strategy: LoadingStrategy,
    ) -> CacheBlock<L::Payload> {
        let entry = {
            match self.inner.residency.entry(key.clone()) {
                MapEntry::Occupied(mut occupied) => match occupied.get().upgrade() {
                    Some(entry) => entry,
                    None => {
                        let entry = self.inner.new_entry(key, dims, origin);
                        occupied.insert(Arc::downgrade(&entry));
                        entry
                    }
                },
                MapEntry::Vacant(vacant) => {
                    let entry = self.inner.new_entry(key, dims, origin);
                    vacant.insert(Arc::downgrade(&entry));
                    entry
                }
            }
        };
        self.inner.apply_strategy(&entry, strategy);
        CacheBlock(entry)
    }

    /// Roll over to the next frame: degrade the queue contents to
    /// prefetch, release the pin list, bump the generation so previously
    /// enqueued entries may be enqueued again.
    pub fn prepare_next_frame(&self) {
        self.inner.queue.clear();
        self.inner.pinned.lock().clear();
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// (Re-)initialize the calling job's io time budget. `None` clears
    /// it, so subsequent BUDGETED requests only enqueue.
    pub fn init_io_budget(&self, partial: Option<&[i64]>) {
        let stats = io_timing::statistics();
        let budget = match stats.io_time_budget() {
            Some(budget) => budget,
            None => {
                let budget = Arc::new(IoTimeBudget::new(
                    self.inner.geometry.max_num_levels as usize,
                ));
                stats.set_io_time_budget(Arc::clone(&budget));
                budget
            }
        };
        budget.reset(partial);
    }

    pub fn pause_fetchers_until(&self, deadline: Instant) {
        self.fetchers.pause_until(deadline);
    }

    pub fn pause_fetchers_for(&self, duration: Duration) {
        self.fetchers.pause_until(Instant::now() + duration);
    }

    pub fn wake_fetchers(&self) {
        self.fetchers.wake();
    }

    /// Number of keys in the residency table (placeholders included).
    pub fn resident_blocks(&self) -> usize {
        self.inner.residency.len()
    }

    /// Number of loaded blocks retained in the soft tier.
    pub fn retained_blocks(&self) -> usize {
        self.inner.soft.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn queue(&self) -> &BlockingPriorityQueue<BlockKey> {
        &self.inner.queue
    }

    #[cfg(test)]
    pub(crate) fn current_generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }
}

/// The narrow cache interface the renderer drives frames through.
pub trait CacheControl: Send + Sync {
    fn prepare_next_frame(&self);

    fn init_io_budget(&self, partial: Option<&[i64]>);

    fn pause_fetchers_until(&self, deadline: Instant);

    fn wake_fetchers(&self);
}

impl<L: BlockLoader> CacheControl for BlockCache<L> {
    fn prepare_next_frame(&self) {
        BlockCache::prepare_next_frame(self)
    }

    fn init_io_budget(&self, partial: Option<&[i64]>) {
        BlockCache::init_io_budget(self, partial)
    }

    fn pause_fetchers_until(&self, deadline: Instant) {
        BlockCache::pause_fetchers_until(self, deadline)
    }

    fn wake_fetchers(&self) {
        BlockCache::wake_fetchers(self)
    }
}
