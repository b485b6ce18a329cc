//! Fixed-size worker pool
//!
//! Every worker runs the same loop: select the best ready element, run its
//! handler, repeat. When nothing is ready the worker parks on the manager's
//! condition variable until an admit, a completion or the earliest retry
//! deadline wakes it. The pool size bounds concurrent handler invocations
//! and therefore storage write concurrency.

use crate::error::Result;
use crate::manager::{ConflationManager, Selection};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info};

/// Threads dispatching from one [`ConflationManager`]
pub struct WorkerPool {
    manager: Arc<ConflationManager>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `manager.config().worker_count()` workers
    pub fn start(manager: Arc<ConflationManager>) -> Result<Self> {
        let count = manager.config().worker_count();
        let mut workers = Vec::with_capacity(count);

        for index in 0..count {
            let worker_manager = Arc::clone(&manager);
            let spawned = thread::Builder::new()
                .name(format!("hubsync-worker-{}", index))
                .spawn(move || worker_loop(index, &worker_manager));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Do not leave a partial pool running
                    manager.shutdown();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(e.into());
                }
            }
        }

        info!(workers = count, "worker pool started");
        Ok(Self { manager, workers })
    }

    /// Number of worker threads
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// The manager the pool dispatches from
    pub fn manager(&self) -> &Arc<ConflationManager> {
        &self.manager
    }

    /// Stop the pool and wait for in-flight handlers to finish
    ///
    /// Envelopes still pending are abandoned; their positions were never
    /// acknowledged.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.manager.shutdown();
        let count = self.workers.len();
        for handle in self.workers.drain(..) {
            // Handler panics are caught inside the worker, so join only fails
            // if the loop itself panicked; nothing is left to clean up then.
            let _ = handle.join();
        }
        info!(workers = count, "worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}

fn worker_loop(index: usize, manager: &ConflationManager) {
    debug!(worker = index, "worker running");
    while !manager.is_shutdown() {
        // Read before selecting so a wakeup during the pass is not lost
        let observed = manager.generation();
        match manager.next_ready(Instant::now()) {
            Selection::Ready(dispatch) => {
                manager.run(dispatch);
            }
            Selection::Idle { next_retry } => manager.wait_for_work(observed, next_retry),
        }
    }
    debug!(worker = index, "worker exiting");
}
