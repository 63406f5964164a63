//! Bounded worker pool for the engine's data-parallel passes.
//!
//! # Scheduling
//!
//! Every per-neuron and per-weight loop of a network runs inside its pool. The calling
//! thread blocks until the loop completes, so each pass is a barrier: no layer starts
//! before the one it depends on has finished.
//!
//! # Degree of parallelism
//!
//! `None` sizes the pool to `std::thread::available_parallelism`. The backward pass
//! reduces shared-weight gradients in a fixed order, so the thread count changes speed
//! but never results.

use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::core::NetResult;

/// A rayon pool of fixed size, owned by one network.
pub struct WorkerPool {
    pool: ThreadPool,
    threads: usize,
    /// Number of `install` calls (for diagnostics)
    passes: AtomicUsize,
}

/// Statistics from the worker pool.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Worker threads in the pool
    pub threads: usize,
    /// Parallel passes dispatched so far
    pub passes: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.threads)
            .field("passes", &self.passes.load(Ordering::Relaxed))
            .finish()
    }
}

#[allow(clippy::must_use_candidate)]
impl WorkerPool {
    /// Create a pool with `threads` workers, or one per available core for `None`.
    ///
    /// # Errors
    /// - `Pool` if the operating system refuses to spawn the workers
    pub fn new(threads: Option<usize>) -> NetResult<Self> {
        let threads = threads
            .filter(|&n| n > 0)
            .unwrap_or_else(Self::available_parallelism);
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("convnet-worker-{i}"))
            .build()?;

        Ok(Self {
            pool,
            threads,
            passes: AtomicUsize::new(0),
        })
    }

    /// Hardware parallelism, falling back to one thread when unknown.
    pub fn available_parallelism() -> usize {
        std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
    }

    /// Run `op` inside the pool; parallel iterators it starts use this pool's workers.
    pub fn install<R, F>(&self, op: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.pool.install(op)
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            threads: self.threads,
            passes: self.passes.load(Ordering::Relaxed),
        }
    }
}
