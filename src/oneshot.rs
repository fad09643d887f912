//! Single-value promise/future pairs.
//!
//! The block cache fulfils read requests asynchronously: `get` returns a
//! [`BlockFuture`] immediately and a decompression worker later resolves the
//! matching [`BlockPromise`].  Abandoning a future is allowed — the worker's
//! output still lands in the cache and benefits subsequent readers.
//! Abandoning a *promise* resolves the future with `CacheError::Abandoned`.
//!
//! There is deliberately no cancellation and no composition beyond "wait".

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::CacheError;

pub struct BlockPromise<T> {
    tx: Sender<Result<T, CacheError>>,
}

pub struct BlockFuture<T> {
    rx: Receiver<Result<T, CacheError>>,
}

/// Create a connected promise/future pair.
pub fn channel<T>() -> (BlockPromise<T>, BlockFuture<T>) {
    let (tx, rx) = bounded(1);
    (BlockPromise { tx }, BlockFuture { rx })
}

impl<T> BlockPromise<T> {
    /// Resolve with a value.  A vanished consumer is not an error.
    pub fn fulfill(self, value: T) {
        let _ = self.tx.send(Ok(value));
    }

    /// Resolve with an error.
    pub fn error(self, err: CacheError) {
        let _ = self.tx.send(Err(err));
    }
}

impl<T> BlockFuture<T> {
    /// Block until the promise resolves.
    pub fn wait(self) -> Result<T, CacheError> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(CacheError::Abandoned),
        }
    }

    /// Non-blocking probe; `None` while unresolved.
    pub fn try_wait(&self) -> Option<Result<T, CacheError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(crossbeam_channel::TryRecvError::Empty) => None,
            Err(crossbeam_channel::TryRecvError::Disconnected) => {
                Some(Err(CacheError::Abandoned))
            }
        }
    }
}
