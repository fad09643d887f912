//! Multi-threaded LRU block cache.
//!
//! The cache solves three problems at once: random access must not pay for
//! decompressing whole blocks when a small prefix suffices; concurrent
//! readers of the same block must share one decompression; and memory must
//! stay under a budget.
//!
//! # Request sets
//!
//! Pending requests for one block are bundled into a request set ordered as
//! a max-heap by range end.  A worker drains the set largest-end-first, so
//! one `decompress_until` covers as many requests as possible.  If a second
//! worker starts on a block that is already being decompressed, its set is
//! merged into the first via the `decompressing` registry — there is at
//! most one concurrent decompression per block.
//!
//! # Locking
//!
//! One mutex guards the LRU and the active-set table; request sets have
//! their own mutex, acquired while holding either the state lock (attach,
//! pop) or the `decompressing` lock (merge), never both.  The state lock
//! is released before enqueueing jobs and before fulfilling promises from
//! a worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::Instant;

use log::{debug, trace, warn};

use crate::cache::{BlockCacheOptions, BlockRange, CacheTidyConfig, CacheTidyStrategy, CachedBlock};
use crate::codec::{PayloadRef, Registry};
use crate::error::CacheError;
use crate::image::ImageData;
use crate::lru::LruMap;
use crate::oneshot::{channel, BlockFuture, BlockPromise};
use crate::section::{CompressionType, Section};
use crate::worker::WorkerGroup;

// ── Request bookkeeping ──────────────────────────────────────────────────────

struct BlockRequest {
    begin: usize,
    end: usize,
    /// `None` for fire-and-forget prefetches.
    promise: Option<BlockPromise<BlockRange>>,
}

impl BlockRequest {
    fn fulfill(self, block: Arc<CachedBlock>) {
        if let Some(p) = self.promise {
            p.fulfill(BlockRange::cached(block, self.begin, self.end - self.begin));
        }
    }

    fn error(self, err: CacheError) {
        if let Some(p) = self.promise {
            p.error(err);
        }
    }
}

impl PartialEq for BlockRequest {
    fn eq(&self, other: &Self) -> bool {
        self.end == other.end
    }
}
impl Eq for BlockRequest {}
impl PartialOrd for BlockRequest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for BlockRequest {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.end.cmp(&other.end)
    }
}

struct RequestSet {
    queue: std::collections::BinaryHeap<BlockRequest>,
    /// Largest end any queued request has asked for.
    range_end: usize,
    block: Arc<CachedBlock>,
    block_no: usize,
}

type SharedSet = Arc<Mutex<RequestSet>>;

impl RequestSet {
    fn new(block: Arc<CachedBlock>, block_no: usize) -> Self {
        Self {
            queue: std::collections::BinaryHeap::new(),
            range_end: 0,
            block,
            block_no,
        }
    }

    fn add(&mut self, begin: usize, end: usize, promise: Option<BlockPromise<BlockRange>>) {
        self.range_end = self.range_end.max(end);
        self.queue.push(BlockRequest { begin, end, promise });
    }

    fn merge(&mut self, other: &mut RequestSet) {
        self.range_end = self.range_end.max(other.range_end);
        self.queue.extend(other.queue.drain());
    }
}

// ── Sequential access detector ───────────────────────────────────────────────

/// Tracks the last N touched block numbers; when they form a contiguous
/// window ending at `max`, `max + 1` is worth prefetching.
struct SeqAccessDetector {
    lru: LruMap<usize, ()>,
    threshold: usize,
    verdict: Option<bool>,
    num_blocks: usize,
}

impl SeqAccessDetector {
    fn new(threshold: usize) -> Self {
        Self {
            lru: LruMap::new(threshold.max(1)),
            threshold,
            verdict: None,
            num_blocks: 0,
        }
    }

    fn set_block_count(&mut self, n: usize) {
        self.num_blocks = n;
        self.lru.clear();
        self.verdict = None;
    }

    fn touch(&mut self, block_no: usize) {
        if self.threshold == 0 {
            return;
        }
        if self.lru.insert(block_no, ()).is_some() {
            // window contents changed
            self.verdict = None;
        }
    }

    fn prefetch(&mut self) -> Option<usize> {
        if self.threshold == 0 || self.lru.len() < self.threshold || self.verdict.is_some() {
            return None;
        }
        let min = self.lru.iter().map(|(&k, _)| k).min()?;
        let max = self.lru.iter().map(|(&k, _)| k).max()?;
        let sequential = max - min + 1 == self.threshold;
        self.verdict = Some(sequential);
        if sequential && max + 1 < self.num_blocks {
            Some(max + 1)
        } else {
            None
        }
    }
}

// ── Statistics ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct Counters {
    blocks_created: AtomicU64,
    blocks_evicted: AtomicU64,
    blocks_tidied: AtomicU64,
    sets_merged: AtomicU64,
    range_requests: AtomicU64,
    active_hits_fast: AtomicU64,
    active_hits_slow: AtomicU64,
    cache_hits_fast: AtomicU64,
    cache_hits_slow: AtomicU64,
    active_expired: AtomicU64,
    sequential_prefetches: AtomicU64,
    decompress_calls: AtomicU64,
    total_decompressed_bytes: AtomicU64,
    evicted_partial: AtomicU64,
}

/// Snapshot of the cache's counters plus current-content gauges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockCacheStats {
    pub blocks_created: u64,
    pub blocks_evicted: u64,
    pub blocks_tidied: u64,
    pub sets_merged: u64,
    pub range_requests: u64,
    pub active_hits_fast: u64,
    pub active_hits_slow: u64,
    pub cache_hits_fast: u64,
    pub cache_hits_slow: u64,
    pub active_expired: u64,
    pub sequential_prefetches: u64,
    /// `decompress_until` invocations that produced new bytes.
    pub decompress_calls: u64,
    pub total_decompressed_bytes: u64,
    /// Evicted blocks that were only partially decompressed.
    pub evicted_partial: u64,
    /// Blocks currently cached with an incomplete prefix.
    pub partial_blocks_in_cache: u64,
    pub cached_blocks: u64,
}

// ── Cache ────────────────────────────────────────────────────────────────────

struct CacheState {
    lru: LruMap<usize, Arc<CachedBlock>>,
    active: HashMap<usize, Vec<Weak<Mutex<RequestSet>>>>,
    tidy_config: CacheTidyConfig,
    tidy_running: bool,
}

struct CacheInner {
    state: Mutex<CacheState>,
    tidy_cv: Condvar,
    decompressing: Mutex<HashMap<usize, Weak<Mutex<RequestSet>>>>,
    wg: RwLock<Option<WorkerGroup>>,
    blocks: RwLock<Vec<Arc<Section>>>,
    image: Arc<ImageData>,
    registry: Arc<Registry>,
    options: BlockCacheOptions,
    seq_detector: Mutex<SeqAccessDetector>,
    stats: Counters,
    epoch: Instant,
}

pub struct BlockCache {
    inner: Arc<CacheInner>,
    tidy_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl BlockCache {
    pub fn new(
        image: Arc<ImageData>,
        registry: Arc<Registry>,
        options: BlockCacheOptions,
    ) -> Self {
        let wg = if options.init_workers {
            Some(WorkerGroup::new("blkcache", options.num_workers))
        } else {
            None
        };
        let inner = Arc::new(CacheInner {
            state: Mutex::new(CacheState {
                lru: LruMap::new(1),
                active: HashMap::new(),
                tidy_config: CacheTidyConfig::default(),
                tidy_running: false,
            }),
            tidy_cv: Condvar::new(),
            decompressing: Mutex::new(HashMap::new()),
            wg: RwLock::new(wg),
            blocks: RwLock::new(Vec::new()),
            image,
            registry,
            seq_detector: Mutex::new(SeqAccessDetector::new(
                options.sequential_access_detector_threshold,
            )),
            options,
            stats: Counters::default(),
            epoch: Instant::now(),
        });
        BlockCache {
            inner,
            tidy_thread: Mutex::new(None),
        }
    }

    /// Register the next BLOCK section.  Blocks are numbered in insertion
    /// order.
    pub fn insert(&self, section: Arc<Section>) {
        let mut blocks = self.inner.blocks.write().unwrap();
        blocks.push(section);
        self.inner
            .seq_detector
            .lock()
            .unwrap()
            .set_block_count(blocks.len());
    }

    pub fn block_count(&self) -> usize {
        self.inner.blocks.read().unwrap().len()
    }

    /// Size the LRU: `max_blocks = max(1, max_bytes / block_size)`, capped
    /// by the actual block count.  Clears current cache contents.
    pub fn set_block_size(&self, block_size: usize) -> Result<(), CacheError> {
        if block_size == 0 {
            return Err(CacheError::BadCompression {
                block_no: 0,
                reason: "block size is zero".into(),
            });
        }
        let mut max_blocks = (self.inner.options.max_bytes / block_size).max(1);
        let nblocks = self.block_count();
        if nblocks > 0 && max_blocks > nblocks {
            max_blocks = nblocks;
        }
        let mut state = self.inner.state.lock().unwrap();
        state.lru = LruMap::new(max_blocks);
        Ok(())
    }

    pub fn set_num_workers(&self, num: usize) {
        let mut wg = self.inner.wg.write().unwrap();
        if let Some(old) = wg.take() {
            drop(old); // joins
        }
        *wg = Some(WorkerGroup::new("blkcache", num));
    }

    pub fn set_tidy_config(&self, cfg: CacheTidyConfig) {
        if cfg.strategy == CacheTidyStrategy::None {
            self.stop_tidy_thread();
            return;
        }
        assert!(
            !cfg.interval.is_zero(),
            "tidy interval must be non-zero"
        );
        let start = {
            let mut state = self.inner.state.lock().unwrap();
            state.tidy_config = cfg;
            if state.tidy_running {
                self.inner.tidy_cv.notify_all();
                false
            } else {
                state.tidy_running = true;
                true
            }
        };
        if start {
            let inner = Arc::clone(&self.inner);
            let handle = std::thread::Builder::new()
                .name("cache-tidy".into())
                .spawn(move || tidy_thread(inner))
                .expect("failed to spawn tidy thread");
            *self.tidy_thread.lock().unwrap() = Some(handle);
        }
    }

    fn stop_tidy_thread(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if !state.tidy_running {
                return;
            }
            state.tidy_running = false;
        }
        self.inner.tidy_cv.notify_all();
        if let Some(h) = self.tidy_thread.lock().unwrap().take() {
            let _ = h.join();
        }
    }

    pub fn stats(&self) -> BlockCacheStats {
        let c = &self.inner.stats;
        let (partial, cached) = {
            let state = self.inner.state.lock().unwrap();
            let partial = state
                .lru
                .iter()
                .filter(|(_, b)| b.range_end() < b.uncompressed_size())
                .count() as u64;
            (partial, state.lru.len() as u64)
        };
        BlockCacheStats {
            blocks_created: c.blocks_created.load(Ordering::Relaxed),
            blocks_evicted: c.blocks_evicted.load(Ordering::Relaxed),
            blocks_tidied: c.blocks_tidied.load(Ordering::Relaxed),
            sets_merged: c.sets_merged.load(Ordering::Relaxed),
            range_requests: c.range_requests.load(Ordering::Relaxed),
            active_hits_fast: c.active_hits_fast.load(Ordering::Relaxed),
            active_hits_slow: c.active_hits_slow.load(Ordering::Relaxed),
            cache_hits_fast: c.cache_hits_fast.load(Ordering::Relaxed),
            cache_hits_slow: c.cache_hits_slow.load(Ordering::Relaxed),
            active_expired: c.active_expired.load(Ordering::Relaxed),
            sequential_prefetches: c.sequential_prefetches.load(Ordering::Relaxed),
            decompress_calls: c.decompress_calls.load(Ordering::Relaxed),
            total_decompressed_bytes: c.total_decompressed_bytes.load(Ordering::Relaxed),
            evicted_partial: c.evicted_partial.load(Ordering::Relaxed),
            partial_blocks_in_cache: partial,
            cached_blocks: cached,
        }
    }

    // ── get ──────────────────────────────────────────────────────────────────

    /// Request `size` bytes at `offset` within block `block_no`.
    ///
    /// Never waits for decompression on the caller's thread; the returned
    /// future resolves once a worker has produced the range.
    pub fn get(&self, block_no: usize, offset: usize, size: usize) -> BlockFuture<BlockRange> {
        self.inner.stats.range_requests.fetch_add(1, Ordering::Relaxed);

        let (promise, future) = channel();

        // sequential prefetch is evaluated on the way out
        self.inner.seq_detector.lock().unwrap().touch(block_no);

        let section = {
            let blocks = self.inner.blocks.read().unwrap();
            match blocks.get(block_no) {
                Some(s) => Arc::clone(s),
                None => {
                    promise.error(CacheError::BlockOutOfRange(block_no, blocks.len()));
                    return future;
                }
            }
        };

        // Uncompressed sections bypass the cache entirely.
        if section.compression() == Some(CompressionType::None) {
            let len = section.length() as usize;
            if offset + size > len {
                promise.error(CacheError::RequestOutOfRange {
                    block_no,
                    end: offset + size,
                    block_size: len,
                });
            } else {
                trace!("block {block_no} is uncompressed, bypassing cache");
                let payload =
                    PayloadRef::new(Arc::clone(&self.inner.image), section.start(), len);
                promise.fulfill(BlockRange::mapped(payload, offset, size));
            }
            self.maybe_prefetch();
            return future;
        }

        self.get_compressed(block_no, &section, offset, size, promise);
        self.maybe_prefetch();
        future
    }

    fn get_compressed(
        &self,
        block_no: usize,
        section: &Section,
        offset: usize,
        size: usize,
        promise: BlockPromise<BlockRange>,
    ) {
        let inner = &self.inner;
        let range_end = offset + size;

        let mut state = inner.state.lock().unwrap();

        // 1. a live request set for this block?
        if let Some(sets) = state.active.get_mut(&block_no) {
            let before = sets.len();
            let mut candidate: Option<SharedSet> = None;
            let mut candidate_covers = false;
            sets.retain(|w| match w.upgrade() {
                Some(rs) => {
                    let covers = rs.lock().unwrap().range_end >= range_end;
                    if candidate.is_none() || (covers && !candidate_covers) {
                        candidate = Some(rs);
                        candidate_covers = covers;
                    }
                    true
                }
                None => false,
            });
            let expired = before - sets.len();
            if expired > 0 {
                inner
                    .stats
                    .active_expired
                    .fetch_add(expired as u64, Ordering::Relaxed);
            }
            if sets.is_empty() {
                state.active.remove(&block_no);
            }

            if let Some(rs) = candidate {
                let block = rs.lock().unwrap().block.clone();
                if range_end > block.uncompressed_size() {
                    promise.error(CacheError::RequestOutOfRange {
                        block_no,
                        end: range_end,
                        block_size: block.uncompressed_size(),
                    });
                    return;
                }
                if range_end <= block.range_end() {
                    // fast active hit: data is already there
                    inner.stats.active_hits_fast.fetch_add(1, Ordering::Relaxed);
                    promise.fulfill(BlockRange::cached(block, offset, size));
                } else if candidate_covers {
                    // slow active hit: the running job will get to us
                    inner.stats.active_hits_slow.fetch_add(1, Ordering::Relaxed);
                    rs.lock().unwrap().add(offset, range_end, Some(promise));
                } else {
                    // slow active hit with a fresh set for the same block
                    inner.stats.active_hits_slow.fetch_add(1, Ordering::Relaxed);
                    let new_set = Arc::new(Mutex::new(RequestSet::new(block, block_no)));
                    new_set.lock().unwrap().add(offset, range_end, Some(promise));
                    state
                        .active
                        .entry(block_no)
                        .or_default()
                        .push(Arc::downgrade(&new_set));
                    drop(state);
                    self.enqueue_job(new_set);
                }
                return;
            }
        }

        // 2. cached (fully or partially decompressed)?
        if let Some(block) = state.lru.get(&block_no).cloned() {
            if range_end > block.uncompressed_size() {
                promise.error(CacheError::RequestOutOfRange {
                    block_no,
                    end: range_end,
                    block_size: block.uncompressed_size(),
                });
                return;
            }
            if range_end <= block.range_end() {
                inner.stats.cache_hits_fast.fetch_add(1, Ordering::Relaxed);
                promise.fulfill(BlockRange::cached(block, offset, size));
            } else {
                inner.stats.cache_hits_slow.fetch_add(1, Ordering::Relaxed);
                let set = Arc::new(Mutex::new(RequestSet::new(block, block_no)));
                set.lock().unwrap().add(offset, range_end, Some(promise));
                state
                    .active
                    .entry(block_no)
                    .or_default()
                    .push(Arc::downgrade(&set));
                drop(state);
                self.enqueue_job(set);
            }
            return;
        }

        // 3. nothing known about this block
        trace!("block {block_no} not found, creating");
        let job = self.create_cached_block(&mut state, block_no, section, Some(promise), offset, range_end);
        drop(state);
        if let Some(set) = job {
            self.enqueue_job(set);
        }
    }

    /// Create a fresh cached block plus request set; the returned set must
    /// be enqueued by the caller *after* releasing the state lock.
    /// `range_end == usize::MAX` means "whole block" (prefetch).
    fn create_cached_block(
        &self,
        state: &mut CacheState,
        block_no: usize,
        section: &Section,
        promise: Option<BlockPromise<BlockRange>>,
        offset: usize,
        range_end: usize,
    ) -> Option<SharedSet> {
        let inner = &self.inner;
        match CachedBlock::create(
            block_no,
            section,
            &inner.image,
            &inner.registry,
            inner.options.disable_block_integrity_check,
            inner.options.mm_release,
        ) {
            Ok(block) => {
                if range_end != usize::MAX && range_end > block.uncompressed_size() {
                    if let Some(p) = promise {
                        p.error(CacheError::RequestOutOfRange {
                            block_no,
                            end: range_end,
                            block_size: block.uncompressed_size(),
                        });
                    }
                    return None;
                }
                inner.stats.blocks_created.fetch_add(1, Ordering::Relaxed);
                let set = Arc::new(Mutex::new(RequestSet::new(block, block_no)));
                set.lock().unwrap().add(offset, range_end, promise);
                state
                    .active
                    .entry(block_no)
                    .or_default()
                    .push(Arc::downgrade(&set));
                Some(set)
            }
            Err(e) => {
                if let Some(p) = promise {
                    p.error(e);
                } else {
                    trace!("prefetch of block {block_no} failed: {e}");
                }
                None
            }
        }
    }

    fn enqueue_job(&self, set: SharedSet) {
        let inner = Arc::clone(&self.inner);
        let mut job = Some(move || process_job(&inner, set));
        {
            let wg = self.inner.wg.read().unwrap();
            if let Some(wg) = wg.as_ref() {
                if !wg.add_job(job.take().unwrap()) {
                    warn!("block cache worker pool rejected job");
                }
            }
        }
        // no worker pool (init_workers = false): process on this thread
        if let Some(job) = job.take() {
            job();
        }
    }

    fn maybe_prefetch(&self) {
        let next = self.inner.seq_detector.lock().unwrap().prefetch();
        let Some(next) = next else { return };

        let section = {
            let blocks = self.inner.blocks.read().unwrap();
            match blocks.get(next) {
                Some(s) => Arc::clone(s),
                None => return,
            }
        };
        if section.compression() == Some(CompressionType::None) {
            return; // nothing to decompress
        }
        self.inner
            .stats
            .sequential_prefetches
            .fetch_add(1, Ordering::Relaxed);
        trace!("sequential prefetch of block {next}");
        // A block already active or cached would still enqueue a duplicate
        // here; the decompressing registry merges it away.
        let job = {
            let mut state = self.inner.state.lock().unwrap();
            self.create_cached_block(&mut state, next, &section, None, 0, usize::MAX)
        };
        if let Some(set) = job {
            self.enqueue_job(set);
        }
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        self.stop_tidy_thread();
        if let Some(wg) = self.inner.wg.write().unwrap().take() {
            drop(wg);
        }
        let stats = self.stats();
        if stats.blocks_created > 0 {
            debug!("block cache: {stats:?}");
        }
    }
}

// ── Worker side ──────────────────────────────────────────────────────────────

fn process_job(inner: &Arc<CacheInner>, set: SharedSet) {
    let block_no = set.lock().unwrap().block_no;
    trace!("processing block {block_no}");

    // Merge with a concurrent worker on the same block, if any.
    {
        let mut dec = inner.decompressing.lock().unwrap();
        if let Some(other) = dec.get(&block_no).and_then(Weak::upgrade) {
            if !Arc::ptr_eq(&other, &set) {
                let mut o = other.lock().unwrap();
                let mut s = set.lock().unwrap();
                o.merge(&mut s);
                inner.stats.sets_merged.fetch_add(1, Ordering::Relaxed);
                trace!("merged request sets for block {block_no}");
                return;
            }
        }
        dec.insert(block_no, Arc::downgrade(&set));
    }

    let block = set.lock().unwrap().block.clone();
    let mut set_slot = Some(set);

    loop {
        // Pop the largest pending request.  Both locks are needed: the
        // state lock keeps attachers out, the set lock guards the heap.
        // Once the set runs empty, every strong reference is dropped
        // inside this critical section, so nobody can attach afterwards.
        let popped = {
            let state_guard = inner.state.lock().unwrap();
            let set = set_slot.clone().expect("set alive while looping");
            let popped = {
                let mut s = set.lock().unwrap();
                s.queue.pop().map(|req| {
                    let is_last = s.queue.is_empty();
                    (req, is_last)
                })
            };
            if popped.is_none() {
                set_slot = None;
                drop(set);
            }
            drop(state_guard);
            popped
        };
        let Some((req, is_last_req)) = popped else {
            break;
        };

        let max_end = block.uncompressed_size();
        let mut target = if req.end == usize::MAX { max_end } else { req.end };

        if is_last_req && max_end > 0 {
            let ratio = target as f64 / max_end as f64;
            if ratio > inner.options.decompress_ratio {
                trace!(
                    "block {block_no} over decompress ratio: {ratio:.2} > {:.2}",
                    inner.options.decompress_ratio
                );
                target = max_end;
            }
        }

        let result = if target > block.range_end() {
            inner.stats.decompress_calls.fetch_add(1, Ordering::Relaxed);
            block.decompress_until(target).map(|produced| {
                inner
                    .stats
                    .total_decompressed_bytes
                    .fetch_add(produced as u64, Ordering::Relaxed);
            })
        } else {
            Ok(())
        };

        match result {
            Ok(()) => {
                // prefetch requests have no promise and an open range
                let req = if req.end == usize::MAX {
                    BlockRequest {
                        begin: req.begin,
                        end: block.range_end(),
                        promise: req.promise,
                    }
                } else {
                    req
                };
                req.fulfill(Arc::clone(&block));
            }
            Err(e) => req.error(e),
        }
    }

    // Park the block in the LRU (or just promote it).
    let mut state = inner.state.lock().unwrap();
    if state.tidy_config.strategy == CacheTidyStrategy::ExpiryTime {
        block.touch(&inner.epoch);
    }
    if let Some((evicted_no, evicted)) = state.lru.insert(block_no, block) {
        on_evicted(inner, evicted_no, &evicted);
    }
}

fn on_evicted(inner: &CacheInner, block_no: usize, block: &CachedBlock) {
    trace!(
        "evicting block {block_no}, decompression ratio {:.2}",
        block.range_end() as f64 / block.uncompressed_size().max(1) as f64
    );
    inner.stats.blocks_evicted.fetch_add(1, Ordering::Relaxed);
    if block.range_end() < block.uncompressed_size() {
        inner.stats.evicted_partial.fetch_add(1, Ordering::Relaxed);
    }
}

// ── Tidy thread ──────────────────────────────────────────────────────────────

fn tidy_thread(inner: Arc<CacheInner>) {
    let mut state = inner.state.lock().unwrap();
    while state.tidy_running {
        let interval = state.tidy_config.interval;
        let (next, timeout) = inner.tidy_cv.wait_timeout(state, interval).unwrap();
        state = next;
        if !timeout.timed_out() {
            continue; // config change or shutdown
        }
        match state.tidy_config.strategy {
            CacheTidyStrategy::ExpiryTime => {
                let now_ms = inner.epoch.elapsed().as_millis() as u64;
                let cutoff = now_ms.saturating_sub(state.tidy_config.expiry_time.as_millis() as u64);
                let n = state
                    .lru
                    .retain_or_count(|_, b: &Arc<CachedBlock>| b.last_used_before(cutoff));
                inner.stats.blocks_tidied.fetch_add(n as u64, Ordering::Relaxed);
            }
            CacheTidyStrategy::BlockSwappedOut => {
                let mut scratch = Vec::new();
                let n = state
                    .lru
                    .retain_or_count(|_, b: &Arc<CachedBlock>| b.any_pages_swapped_out(&mut scratch));
                inner.stats.blocks_tidied.fetch_add(n as u64, Ordering::Relaxed);
            }
            CacheTidyStrategy::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::{SectionType, SectionWriter};

    /// Build an image of `n` zstd blocks, each holding `block_size` bytes
    /// of a deterministic pattern.
    fn block_image(n: usize, block_size: usize) -> (Arc<ImageData>, Vec<Arc<Section>>, Vec<u8>) {
        let reg = Registry::with_builtin();
        let data: Vec<u8> = (0..n * block_size)
            .map(|i| ((i * 31 + i / 7) % 251) as u8)
            .collect();
        let mut sw = SectionWriter::new(Vec::new());
        for b in 0..n {
            let payload = reg
                .compress_payload(
                    CompressionType::Zstd,
                    &data[b * block_size..(b + 1) * block_size],
                    3,
                    None,
                )
                .unwrap();
            sw.write_section(SectionType::Block, CompressionType::Zstd, &payload)
                .unwrap();
        }
        let img = sw.finalize().unwrap();
        let sections = crate::section::scan_sections(&img)
            .unwrap()
            .into_iter()
            .filter(|s| s.section_type() == Some(SectionType::Block))
            .map(Arc::new)
            .collect();
        (ImageData::from_vec(img), sections, data)
    }

    fn make_cache(
        image: Arc<ImageData>,
        sections: Vec<Arc<Section>>,
        block_size: usize,
        options: BlockCacheOptions,
    ) -> BlockCache {
        let cache = BlockCache::new(image, Arc::new(Registry::with_builtin()), options);
        for s in sections {
            cache.insert(s);
        }
        cache.set_block_size(block_size).unwrap();
        cache
    }

    #[test]
    fn basic_read_roundtrip() {
        let bs = 1 << 16;
        let (image, sections, data) = block_image(4, bs);
        let cache = make_cache(image, sections, bs, BlockCacheOptions::default());

        for (block_no, offset, size) in [(0, 0, 100), (1, 1000, 4096), (3, bs - 7, 7)] {
            let r = cache.get(block_no, offset, size).wait().unwrap();
            assert_eq!(r.data(), &data[block_no * bs + offset..block_no * bs + offset + size]);
        }
    }

    #[test]
    fn concurrent_readers_share_one_decompression() {
        let bs = 1 << 18;
        let (image, sections, data) = block_image(1, bs);
        let cache = Arc::new(make_cache(image, sections, bs, BlockCacheOptions::default()));

        let mut handles = Vec::new();
        for t in 0..16 {
            let cache = Arc::clone(&cache);
            let expect = data.clone();
            handles.push(std::thread::spawn(move || {
                let offset = (t * 13_111) % (bs - 64);
                let r = cache.get(0, offset, 64).wait().unwrap();
                assert_eq!(r.data(), &expect[offset..offset + 64]);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let stats = cache.stats();
        assert_eq!(stats.blocks_created, 1, "one cached block for 16 readers");
        // No byte decompressed twice: the block was produced exactly once.
        assert!(stats.total_decompressed_bytes <= bs as u64);
    }

    /// The worker parks a block in the LRU shortly after fulfilling its
    /// requests; wait for gauges that depend on that.
    fn wait_for(cache: &BlockCache, pred: impl Fn(&BlockCacheStats) -> bool) -> BlockCacheStats {
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let stats = cache.stats();
            if pred(&stats) {
                return stats;
            }
            assert!(Instant::now() < deadline, "condition never met: {stats:?}");
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
    }

    #[test]
    fn partial_then_full_decompression() {
        let bs = 1 << 18;
        let (image, sections, data) = block_image(1, bs);
        let cache = make_cache(image, sections, bs, BlockCacheOptions::default());

        let r = cache.get(0, 0, 4).wait().unwrap();
        assert_eq!(r.data(), &data[0..4]);
        let stats = wait_for(&cache, |s| s.partial_blocks_in_cache == 1);
        assert_eq!(stats.decompress_calls, 1);

        // A tail request beyond the default 0.8 ratio forces full expansion.
        let off = bs - 4;
        let r = cache.get(0, off, 4).wait().unwrap();
        assert_eq!(r.data(), &data[off..off + 4]);
        let stats = wait_for(&cache, |s| s.partial_blocks_in_cache == 0);
        assert_eq!(stats.decompress_calls, 2);
        assert_eq!(stats.total_decompressed_bytes, bs as u64);
    }

    #[test]
    fn single_block_cache_makes_progress() {
        let bs = 1 << 14;
        let n = 6;
        let (image, sections, data) = block_image(n, bs);
        let cache = make_cache(
            image,
            sections,
            bs,
            BlockCacheOptions {
                max_bytes: bs, // exactly one block
                ..Default::default()
            },
        );

        for round in 0..3 {
            for b in 0..n {
                let off = (round * 97) % (bs - 16);
                let r = cache.get(b, off, 16).wait().unwrap();
                assert_eq!(r.data(), &data[b * bs + off..b * bs + off + 16]);
            }
        }
        let stats = wait_for(&cache, |s| s.cached_blocks == 1);
        assert!(stats.blocks_evicted > 0);
    }

    #[test]
    fn sequential_prefetch_fires() {
        let bs = 1 << 14;
        let (image, sections, _) = block_image(20, bs);
        let cache = make_cache(
            image,
            sections,
            bs,
            BlockCacheOptions {
                sequential_access_detector_threshold: 3,
                ..Default::default()
            },
        );

        for b in [7usize, 8, 9] {
            cache.get(b, 0, 16).wait().unwrap();
        }
        // allow the fire-and-forget job to run
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let stats = cache.stats();
            if stats.sequential_prefetches >= 1 && stats.blocks_created >= 4 {
                break;
            }
            assert!(Instant::now() < deadline, "prefetch never happened");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        // block 10 resolves instantly once prefetched
        let r = cache.get(10, 0, 4).wait().unwrap();
        assert_eq!(r.size(), 4);
    }

    #[test]
    fn uncompressed_blocks_bypass_cache() {
        let bs = 4096;
        let data: Vec<u8> = (0..bs).map(|i| (i % 256) as u8).collect();
        let mut sw = SectionWriter::new(Vec::new());
        sw.write_section(SectionType::Block, CompressionType::None, &data)
            .unwrap();
        let img = sw.finalize().unwrap();
        let section = Arc::new(Section::parse_at(&img, 0).unwrap());
        let cache = BlockCache::new(
            ImageData::from_vec(img),
            Arc::new(Registry::with_builtin()),
            BlockCacheOptions::default(),
        );
        cache.insert(section);
        cache.set_block_size(bs).unwrap();

        let r = cache.get(0, 100, 16).wait().unwrap();
        assert_eq!(r.data(), &data[100..116]);
        let stats = cache.stats();
        assert_eq!(stats.blocks_created, 0);
        assert_eq!(stats.cached_blocks, 0);
    }

    #[test]
    fn out_of_range_block_is_an_error() {
        let bs = 4096;
        let (image, sections, _) = block_image(2, bs);
        let cache = make_cache(image, sections, bs, BlockCacheOptions::default());
        let err = cache.get(7, 0, 1).wait().unwrap_err();
        assert_eq!(err, CacheError::BlockOutOfRange(7, 2));
    }

    #[test]
    fn expiry_tidy_drops_idle_blocks() {
        let bs = 1 << 14;
        let (image, sections, _) = block_image(2, bs);
        let cache = make_cache(image, sections, bs, BlockCacheOptions::default());
        cache.set_tidy_config(CacheTidyConfig {
            strategy: CacheTidyStrategy::ExpiryTime,
            interval: std::time::Duration::from_millis(10),
            expiry_time: std::time::Duration::from_millis(20),
        });

        cache.get(0, 0, 16).wait().unwrap();
        cache.get(1, 0, 16).wait().unwrap();
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if cache.stats().cached_blocks == 0 {
                break;
            }
            assert!(Instant::now() < deadline, "tidy never ran");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(cache.stats().blocks_tidied >= 2);
    }
}
