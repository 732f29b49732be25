// SPDX-License-Identifier: Apache-2.0
//! Long-lived worker pool for background module bodies.
//!
//! Plain OS threads fed by a channel. The pool outlives frames on purpose:
//! asynchronous module leases span frames, so scoped threads are not an
//! option. Jobs report back over their own channels; the pool itself never
//! looks at results.

use crossbeam_channel::{unbounded, Sender};
use std::thread::JoinHandle;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Returns the worker count: the `FDP_WORKERS` environment variable when
/// set and valid, else available parallelism.
///
/// Setting `FDP_WORKERS=1` forces serial background execution, which is
/// useful when bisecting scheduling-dependent behavior.
#[must_use]
pub fn default_worker_count() -> usize {
    if let Ok(val) = std::env::var("FDP_WORKERS") {
        if let Ok(n) = val.parse::<usize>() {
            return n.max(1);
        }
    }
    std::thread::available_parallelism()
        .map(std::num::NonZero::get)
        .unwrap_or(1)
}

/// Fixed-size thread pool executing boxed jobs.
pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `size` workers (at least one).
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (tx, rx) = unbounded::<Job>();
        let mut handles = Vec::with_capacity(size);
        for n in 0..size {
            let rx = rx.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("fdp-worker-{n}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => error!(%err, "worker thread spawn failed"),
            }
        }
        debug!(workers = handles.len(), "worker pool started");
        Self {
            tx: Some(tx),
            handles,
        }
    }

    /// Number of live workers.
    #[must_use]
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Enqueues a job. Jobs run in submission order per worker, with no
    /// ordering guarantee across workers.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = &self.tx {
            if tx.send(Box::new(job)).is_err() {
                error!("worker pool channel closed; job dropped");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets workers drain in-flight jobs and exit.
        self.tx = None;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn jobs_run_and_drop_joins() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new(4);
            for _ in 0..32 {
                let counter = counter.clone();
                pool.spawn(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
            // Drop joins after draining.
        }
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn zero_size_is_clamped_to_one() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.size(), 1);
    }
}
