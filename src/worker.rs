//! Worker group — a named thread pool with a bounded job queue.
//!
//! Each subsystem owns its own group (block-cache decompression, scanner
//! hashing, writer producers, checker).  `add_job` blocks while the queue is
//! at capacity, which is the only backpressure mechanism the writer needs on
//! top of the merger's.  `stop` drains the queue before joining the workers,
//! so every submitted job runs exactly once.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Default queue bound: enough to keep workers busy without accumulating
/// unbounded memory in queued closures.
const DEFAULT_MAX_QUEUE_LEN: usize = 1024;

struct Shared {
    /// submitted-but-not-finished jobs
    pending: Mutex<usize>,
    idle: Condvar,
}

pub struct WorkerGroup {
    name: String,
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl WorkerGroup {
    /// Spawn `num_workers` threads (0 means one per CPU).
    pub fn new(name: &str, num_workers: usize) -> Self {
        Self::with_queue_len(name, num_workers, DEFAULT_MAX_QUEUE_LEN)
    }

    pub fn with_queue_len(name: &str, num_workers: usize, max_queue_len: usize) -> Self {
        let num_workers = if num_workers == 0 {
            num_cpus::get()
        } else {
            num_workers
        };
        let (tx, rx): (Sender<Job>, Receiver<Job>) = bounded(max_queue_len.max(1));
        let shared = Arc::new(Shared {
            pending: Mutex::new(0),
            idle: Condvar::new(),
        });

        let workers = (0..num_workers)
            .map(|i| {
                let rx = rx.clone();
                let shared = Arc::clone(&shared);
                let thread_name = format!("{name}{i}");
                std::thread::Builder::new()
                    .name(thread_name)
                    .spawn(move || worker_loop(rx, shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        debug!("worker group '{name}': {num_workers} workers");

        WorkerGroup {
            name: name.to_string(),
            tx: Some(tx),
            workers,
            shared,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Submit a job.  Blocks while the queue is full; returns false after
    /// `stop`.
    pub fn add_job<F: FnOnce() + Send + 'static>(&self, job: F) -> bool {
        let Some(tx) = &self.tx else { return false };
        {
            let mut pending = self.shared.pending.lock().unwrap();
            *pending += 1;
        }
        if tx.send(Box::new(job)).is_err() {
            let mut pending = self.shared.pending.lock().unwrap();
            *pending -= 1;
            return false;
        }
        true
    }

    /// Block until every submitted job has finished.  The group remains
    /// usable afterwards.
    pub fn wait_idle(&self) {
        let mut pending = self.shared.pending.lock().unwrap();
        while *pending > 0 {
            pending = self.shared.idle.wait(pending).unwrap();
        }
    }

    /// Drain the queue and join all workers.  Idempotent.
    pub fn stop(&mut self) {
        if let Some(tx) = self.tx.take() {
            drop(tx); // closes the channel; workers exit after draining
            for w in self.workers.drain(..) {
                let _ = w.join();
            }
            debug!("worker group '{}' stopped", self.name);
        }
    }
}

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(rx: Receiver<Job>, shared: Arc<Shared>) {
    while let Ok(job) = rx.recv() {
        job();
        let mut pending = shared.pending.lock().unwrap();
        *pending -= 1;
        if *pending == 0 {
            shared.idle.notify_all();
        }
    }
}

// ── Latch ────────────────────────────────────────────────────────────────────

/// A single-use countdown gate (count = 1).
///
/// The file scanner uses one per `(size, start_hash)` key to ensure the
/// first file's content hash is published before any subsequent file looks
/// it up.
pub struct Latch {
    state: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    pub fn new() -> Arc<Self> {
        Arc::new(Latch {
            state: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    pub fn count_down(&self) {
        let mut open = self.state.lock().unwrap();
        *open = true;
        self.cv.notify_all();
    }

    pub fn wait(&self) {
        let mut open = self.state.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_every_job_once() {
        let wg = WorkerGroup::new("test", 4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let c = Arc::clone(&counter);
            assert!(wg.add_job(move || {
                c.fetch_add(1, Ordering::Relaxed);
            }));
        }
        wg.wait_idle();
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn stop_drains_queue() {
        let mut wg = WorkerGroup::with_queue_len("drain", 2, 4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let c = Arc::clone(&counter);
            wg.add_job(move || {
                std::thread::sleep(std::time::Duration::from_millis(1));
                c.fetch_add(1, Ordering::Relaxed);
            });
        }
        wg.stop();
        assert_eq!(counter.load(Ordering::Relaxed), 32);
        // after stop, jobs are rejected
        assert!(!wg.add_job(|| ()));
    }

    #[test]
    fn latch_orders_publication() {
        let latch = Latch::new();
        let flag = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let latch = Arc::clone(&latch);
            let flag = Arc::clone(&flag);
            std::thread::spawn(move || {
                latch.wait();
                flag.load(Ordering::SeqCst)
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(5));
        flag.store(42, Ordering::SeqCst);
        latch.count_down();
        assert_eq!(waiter.join().unwrap(), 42);
    }
}
