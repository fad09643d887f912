//! Deterministic multi-queue block merger.
//!
//! Producers run in parallel, but the output stream must be bit-identical
//! across runs.  The merger owns a fixed-size vector of active slots,
//! initially filled with the first sources in the configured order; the
//! remaining sources wait in a FIFO.  Blocks are emitted from the source at
//! the rotating cursor; when a source delivers its last block, its slot is
//! refilled from the queue.  The resulting order depends only on the
//! `sources` order and the per-source block sequences — never on producer
//! timing.
//!
//! Backpressure: `add` blocks while the calling source's slot distance
//! from the cursor is at least `num_queueable`.  Each emitted block is
//! wrapped in a [`MergedBlockHolder`]; dropping (or fully draining) a
//! holder returns its credit to the producers.  At most
//! `max_queued_blocks` unreleased blocks coexist in the pipeline.
//!
//! The emission callback runs with the merge decided but outside the state
//! lock, serialized on its own mutex, so callbacks may block briefly and
//! holders may be dropped from inside them without self-deadlock.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use log::trace;

// ── Holder ───────────────────────────────────────────────────────────────────

/// Credit-return interface the holder needs from the merger.
trait HolderRelease: Send + Sync {
    fn release_block(&self);
}

/// Ownership of one merged block.
///
/// While the holder is alive its block counts against the merger's queued
/// budget.  [`release_partial`](Self::release_partial) pays the budget down
/// by bytes; the block's slot is credited back once the holder is dropped
/// or fully drained.
pub struct MergedBlockHolder<B> {
    block: Option<B>,
    remaining: usize,
    merger: Option<Arc<dyn HolderRelease>>,
}

impl<B> MergedBlockHolder<B> {
    /// A holder not tied to any merger (tests, trivial pipelines).
    pub fn detached(block: B) -> Self {
        Self {
            block: Some(block),
            remaining: 0,
            merger: None,
        }
    }

    pub fn value(&self) -> &B {
        self.block.as_ref().expect("holder already taken")
    }

    pub fn value_mut(&mut self) -> &mut B {
        self.block.as_mut().expect("holder already taken")
    }

    /// Move the block out; the credit is still returned on drop.
    pub fn take(&mut self) -> B {
        self.block.take().expect("holder already taken")
    }

    /// Pay down `amount` bytes of this block's budget share.  The block's
    /// queue slot is credited once the remaining share reaches zero.
    pub fn release_partial(&mut self, amount: usize) {
        assert!(
            amount <= self.remaining,
            "release_partial: {amount} > remaining {}",
            self.remaining
        );
        self.remaining -= amount;
        if self.remaining == 0 {
            self.release();
        }
    }

    fn release(&mut self) {
        if let Some(merger) = self.merger.take() {
            merger.release_block();
        }
    }
}

impl<B> Drop for MergedBlockHolder<B> {
    fn drop(&mut self) {
        self.release();
    }
}

// ── Merger ───────────────────────────────────────────────────────────────────

pub type OnBlockMerged<B> = Box<dyn FnMut(MergedBlockHolder<B>) + Send>;

struct MergerState<S, B> {
    active_slots: Vec<Option<S>>,
    source_queue: VecDeque<S>,
    queues: HashMap<S, VecDeque<(B, bool, usize)>>,
    active_slot_index: usize,
    num_queueable: usize,
    num_releaseable: usize,
}

struct MergerInner<S, B> {
    state: Mutex<MergerState<S, B>>,
    cv: Condvar,
    /// Credits returned while the state lock was contended (holder dropped
    /// inside the emission callback).
    pending_release: AtomicUsize,
    callback: Mutex<OnBlockMerged<B>>,
}

impl<S: Send + Sync, B: Send> HolderRelease for MergerInner<S, B> {
    fn release_block(&self) {
        match self.state.try_lock() {
            Ok(mut state) => {
                assert!(state.num_releaseable > 0, "release without queued block");
                state.num_releaseable -= 1;
                state.num_queueable += 1;
            }
            Err(_) => {
                self.pending_release.fetch_add(1, Ordering::Release);
            }
        }
        self.cv.notify_all();
    }
}

pub struct MultiQueueBlockMerger<S, B> {
    inner: Arc<MergerInner<S, B>>,
}

impl<S, B> MultiQueueBlockMerger<S, B>
where
    S: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
    B: Send + 'static,
{
    /// `sources` is the fixed emission order; the first
    /// `num_active_slots` of them start active.
    pub fn new(
        num_active_slots: usize,
        max_queued_blocks: usize,
        sources: &[S],
        on_block_merged: OnBlockMerged<B>,
    ) -> Self {
        assert!(num_active_slots > 0, "need at least one active slot");
        assert!(max_queued_blocks > 0, "need a positive block budget");

        let mut source_queue: VecDeque<S> = sources.iter().cloned().collect();
        let mut active_slots = vec![None; num_active_slots];
        for slot in active_slots.iter_mut() {
            match source_queue.pop_front() {
                Some(src) => *slot = Some(src),
                None => break,
            }
        }

        MultiQueueBlockMerger {
            inner: Arc::new(MergerInner {
                state: Mutex::new(MergerState {
                    active_slots,
                    source_queue,
                    queues: HashMap::new(),
                    active_slot_index: 0,
                    num_queueable: max_queued_blocks,
                    num_releaseable: 0,
                }),
                cv: Condvar::new(),
                pending_release: AtomicUsize::new(0),
                callback: Mutex::new(on_block_merged),
            }),
        }
    }

    /// Queue one block for `src`.  `size` is the byte share the holder
    /// will account for; `is_last` retires the source.
    ///
    /// Blocks while the pipeline budget is exhausted for this source.
    /// Blocks for one source MUST be added in their final order.
    pub fn add(&self, src: S, block: B, size: usize, is_last: bool) {
        let inner = &self.inner;
        let mut state = inner.state.lock().unwrap();

        loop {
            drain_pending(&mut state, &inner.pending_release);
            if source_distance(&state, &src) < state.num_queueable {
                break;
            }
            state = inner.cv.wait(state).unwrap();
        }

        state.num_queueable -= 1;
        state
            .queues
            .entry(src.clone())
            .or_default()
            .push_back((block, is_last, size));
        trace!("merger: queued block for {src:?} (last={is_last})");

        let mut emitted = Vec::new();
        while try_merge_block(&mut state, &mut emitted) {}

        if emitted.is_empty() {
            drop(state);
        } else {
            // Serialize emissions in merge order: take the callback mutex
            // while the merge decision is still locked, then run outside
            // the state lock.
            let mut cb = inner.callback.lock().unwrap();
            drop(state);
            for block in emitted {
                let holder = MergedBlockHolder {
                    block: Some(block.0),
                    remaining: block.1,
                    merger: Some(Arc::clone(inner) as Arc<dyn HolderRelease>),
                };
                (*cb)(holder);
            }
        }

        inner.cv.notify_all();
    }

    /// True once every source has delivered its last block and every
    /// emitted block has been released.
    pub fn is_drained(&self) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        drain_pending(&mut state, &self.inner.pending_release);
        state.num_releaseable == 0
            && state.queues.is_empty()
            && state.source_queue.is_empty()
            && state.active_slots.iter().all(Option::is_none)
    }
}

fn drain_pending<S, B>(state: &mut MergerState<S, B>, pending: &AtomicUsize) {
    let n = pending.swap(0, Ordering::Acquire);
    if n > 0 {
        assert!(state.num_releaseable >= n, "release without queued block");
        state.num_releaseable -= n;
        state.num_queueable += n;
    }
}

/// Number of emission turns between the cursor and `src` (including wait
/// queue position for sources not yet active).
fn source_distance<S: Eq, B>(state: &MergerState<S, B>, src: &S) -> usize {
    let slots = &state.active_slots;
    let mut ix = state.active_slot_index;
    let mut distance = 0;

    while let Some(s) = &slots[ix] {
        if s == src {
            return distance;
        }
        distance += 1;

        loop {
            ix = (ix + 1) % slots.len();
            if ix == state.active_slot_index || slots[ix].is_some() {
                break;
            }
        }

        if ix == state.active_slot_index {
            // wrapped around: src is still waiting in the source queue
            distance += state
                .source_queue
                .iter()
                .position(|s| s == src)
                .unwrap_or(state.source_queue.len());
            return distance;
        }
    }

    distance
}

/// Emit one block from the cursor source if it has any queued; advance the
/// cursor.  Returns false when no further merge is possible right now.
fn try_merge_block<S: Clone + Eq + Hash, B>(
    state: &mut MergerState<S, B>,
    emitted: &mut Vec<(B, usize)>,
) -> bool {
    let ix = state.active_slot_index;
    let Some(src) = state.active_slots[ix].clone() else {
        return false;
    };

    let Some(queue) = state.queues.get_mut(&src) else {
        return false;
    };
    let Some((block, is_last, size)) = queue.pop_front() else {
        return false;
    };

    state.num_releaseable += 1;
    emitted.push((block, size));

    if is_last {
        state.queues.remove(&src);
        // refill the freed slot from the waiting sources
        state.active_slots[ix] = state.source_queue.pop_front();
    }

    // advance to the next non-empty slot
    loop {
        state.active_slot_index = (state.active_slot_index + 1) % state.active_slots.len();
        if state.active_slot_index == ix || state.active_slots[state.active_slot_index].is_some() {
            break;
        }
    }

    state.active_slot_index != ix || state.active_slots[state.active_slot_index].is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    type Block = (usize, usize); // (source, per-source index)

    fn collect_merger(
        num_active_slots: usize,
        max_queued_blocks: usize,
        sources: &[usize],
    ) -> (MultiQueueBlockMerger<usize, Block>, mpsc::Receiver<Block>) {
        let (tx, rx) = mpsc::channel();
        let merger = MultiQueueBlockMerger::new(
            num_active_slots,
            max_queued_blocks,
            sources,
            Box::new(move |holder| {
                // dropping the holder here immediately recredits the queue
                let _ = tx.send(*holder.value());
            }),
        );
        (merger, rx)
    }

    /// Reference order: emit round-robin over the active-slot window.
    fn reference_order(
        num_active_slots: usize,
        block_counts: &[usize],
    ) -> Vec<Block> {
        let mut active: VecDeque<usize> = (0..block_counts.len().min(num_active_slots)).collect();
        let mut waiting: VecDeque<usize> = (block_counts.len().min(num_active_slots)
            ..block_counts.len())
            .collect();
        let mut next_index = vec![0usize; block_counts.len()];
        let mut out = Vec::new();

        while let Some(src) = active.pop_front() {
            out.push((src, next_index[src]));
            next_index[src] += 1;
            if next_index[src] < block_counts[src] {
                active.push_back(src);
            } else if let Some(n) = waiting.pop_front() {
                active.push_back(n);
            }
        }
        out
    }

    #[test]
    fn strict_alternation_with_two_sources() {
        // the S3 scenario: two producers, alternating output regardless of
        // producer timing
        let sources = [0usize, 1];
        let (merger, rx) = collect_merger(2, 4, &sources);
        let merger = Arc::new(merger);

        let mut handles = Vec::new();
        for src in 0..2usize {
            let merger = Arc::clone(&merger);
            handles.push(std::thread::spawn(move || {
                for i in 0..10usize {
                    if src == 1 {
                        std::thread::sleep(std::time::Duration::from_micros(200));
                    }
                    merger.add(src, (src, i), 1, i == 9);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let got: Vec<Block> = rx.try_iter().collect();
        let want: Vec<Block> = (0..10).flat_map(|i| [(0, i), (1, i)]).collect();
        assert_eq!(got, want);
        assert!(merger.is_drained());
    }

    #[test]
    fn single_slot_degenerates_to_source_fifo() {
        let sources = [0usize, 1, 2];
        let (merger, rx) = collect_merger(1, 2, &sources);
        let merger = Arc::new(merger);

        let mut handles = Vec::new();
        for src in 0..3usize {
            let merger = Arc::clone(&merger);
            handles.push(std::thread::spawn(move || {
                for i in 0..4usize {
                    merger.add(src, (src, i), 1, i == 3);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let got: Vec<Block> = rx.try_iter().collect();
        let want: Vec<Block> = (0..3).flat_map(|s| (0..4).map(move |i| (s, i))).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn order_is_independent_of_producer_timing() {
        let block_counts = [3usize, 7, 1, 5, 2];
        let sources: Vec<usize> = (0..block_counts.len()).collect();
        let want = reference_order(2, &block_counts);

        for round in 0..8 {
            let (merger, rx) = collect_merger(2, 4, &sources);
            let merger = Arc::new(merger);
            let mut handles = Vec::new();
            for (src, &count) in block_counts.iter().enumerate() {
                let merger = Arc::clone(&merger);
                handles.push(std::thread::spawn(move || {
                    for i in 0..count {
                        // vary timing per round and source
                        let delay = ((src * 7 + i * 3 + round) % 5) as u64;
                        std::thread::sleep(std::time::Duration::from_micros(delay * 50));
                        merger.add(src, (src, i), 1, i + 1 == count);
                    }
                }));
            }
            for h in handles {
                h.join().unwrap();
            }
            let got: Vec<Block> = rx.try_iter().collect();
            assert_eq!(got, want, "round {round}");
        }
    }

    #[test]
    fn holders_gate_the_pipeline() {
        // consumer keeps holders alive; producers must still finish once
        // the consumer releases them
        let sources = [0usize];
        let (tx, rx) = mpsc::channel();
        let merger = Arc::new(MultiQueueBlockMerger::new(
            1,
            2,
            &sources,
            Box::new(move |holder| {
                let _ = tx.send(holder);
            }),
        ));

        let producer = {
            let merger = Arc::clone(&merger);
            std::thread::spawn(move || {
                for i in 0..6usize {
                    merger.add(0, (0, i), 100, i == 5);
                }
            })
        };

        let mut seen = Vec::new();
        for mut holder in rx.iter() {
            seen.push(*holder.value());
            // partial then full release
            holder.release_partial(60);
            holder.release_partial(40);
            if seen.len() == 6 {
                break;
            }
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..6).map(|i| (0, i)).collect::<Vec<_>>());
        assert!(merger.is_drained());
    }

    #[test]
    fn partial_release_checks_bounds() {
        let mut holder = MergedBlockHolder {
            block: Some(1u32),
            remaining: 10,
            merger: None,
        };
        holder.release_partial(4);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            holder.release_partial(7)
        }));
        assert!(result.is_err());
    }
}
