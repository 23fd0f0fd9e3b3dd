//! Worker pool.
//!
//! A fixed set of long-lived worker threads drains a shared FIFO of tagged
//! jobs. A batch shares one outcome flag: initialized true at batch start,
//! cleared by any failing job, and inspected by the submitting stage after
//! the `join_all` barrier. Cancellation is cooperative: long-running jobs
//! poll the pool's stop flag at convenient boundaries; the pool never
//! terminates a job forcibly.

use parking_lot::{Condvar, Mutex};
use pgharbor_core::Result;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

struct Job {
    tag: String,
    run: Box<dyn FnOnce(&JobContext) -> Result<()> + Send>,
}

/// State visible to a running job.
pub struct JobContext {
    stop: Arc<AtomicBool>,
}

impl JobContext {
    /// Whether cooperative cancellation was requested.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Raw stop flag, for long waits (token buckets) that poll it.
    pub fn stop_flag(&self) -> &AtomicBool {
        &self.stop
    }
}

struct Shared {
    queue: Mutex<PoolState>,
    /// Wakes workers when jobs arrive or shutdown begins.
    available: Condvar,
    /// Wakes `join_all` waiters when the pool drains.
    idle: Condvar,
    stop: Arc<AtomicBool>,
    outcome: AtomicBool,
}

struct PoolState {
    jobs: VecDeque<Job>,
    active: usize,
    shutdown: bool,
}

/// Fixed-size worker pool over a shared job FIFO.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn a pool. `workers == 0` means one worker per CPU.
    pub fn new(workers: usize) -> WorkerPool {
        let workers = if workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            workers
        };

        let shared = Arc::new(Shared {
            queue: Mutex::new(PoolState {
                jobs: VecDeque::new(),
                active: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
            idle: Condvar::new(),
            stop: Arc::new(AtomicBool::new(false)),
            outcome: AtomicBool::new(true),
        });

        let handles = (0..workers)
            .map(|i| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("pgharbor-worker-{}", i))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        WorkerPool {
            shared,
            workers: handles,
        }
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Reset the shared outcome flag at the start of a batch.
    pub fn begin_batch(&self) {
        self.shared.outcome.store(true, Ordering::Release);
    }

    /// The batch outcome: true unless any job failed since `begin_batch`.
    pub fn outcome(&self) -> bool {
        self.shared.outcome.load(Ordering::Acquire)
    }

    /// Submit a job. Fire-and-forget: pair with `join_all` for a barrier.
    pub fn submit<F>(&self, tag: impl Into<String>, job: F)
    where
        F: FnOnce(&JobContext) -> Result<()> + Send + 'static,
    {
        let mut state = self.shared.queue.lock();
        state.jobs.push_back(Job {
            tag: tag.into(),
            run: Box::new(job),
        });
        drop(state);
        self.shared.available.notify_one();
    }

    /// Barrier: wait until the queue is empty and no job is running.
    pub fn join_all(&self) {
        let mut state = self.shared.queue.lock();
        while !state.jobs.is_empty() || state.active > 0 {
            self.shared.idle.wait(&mut state);
        }
    }

    /// Request cooperative cancellation of running and queued jobs.
    ///
    /// Queued jobs still run; they are expected to observe the flag and
    /// return promptly.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    /// Clear the stop flag (between operations).
    pub fn reset_stop(&self) {
        self.shared.stop.store(false, Ordering::Release);
    }

    /// Handle to the stop flag, for wiring into rate limiters.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.shared.stop.clone()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.queue.lock();
            state.shutdown = true;
        }
        self.shared.available.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let ctx = JobContext {
        stop: shared.stop.clone(),
    };
    loop {
        let job = {
            let mut state = shared.queue.lock();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    state.active += 1;
                    break job;
                }
                if state.shutdown {
                    return;
                }
                shared.available.wait(&mut state);
            }
        };

        debug!(target: "pgharbor::workflow", tag = %job.tag, "job start");
        if let Err(e) = (job.run)(&ctx) {
            warn!(target: "pgharbor::workflow", tag = %job.tag, error = %e, "job failed");
            shared.outcome.store(false, Ordering::Release);
        }

        let mut state = shared.queue.lock();
        state.active -= 1;
        if state.jobs.is_empty() && state.active == 0 {
            shared.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgharbor_core::Error;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_jobs_run_and_join() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        pool.begin_batch();
        for i in 0..100 {
            let counter = counter.clone();
            pool.submit(format!("job-{}", i), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        pool.join_all();

        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert!(pool.outcome());
    }

    #[test]
    fn test_outcome_cleared_by_any_failure() {
        let pool = WorkerPool::new(2);

        pool.begin_batch();
        for i in 0..10 {
            pool.submit(format!("job-{}", i), move |_| {
                if i == 7 {
                    Err(Error::corruption("checksum mismatch"))
                } else {
                    Ok(())
                }
            });
        }
        pool.join_all();
        assert!(!pool.outcome());

        // The next batch starts clean.
        pool.begin_batch();
        pool.submit("ok", |_| Ok(()));
        pool.join_all();
        assert!(pool.outcome());
    }

    #[test]
    fn test_stop_flag_is_observed() {
        let pool = WorkerPool::new(1);
        let observed = Arc::new(AtomicUsize::new(0));

        pool.stop();
        let observed2 = observed.clone();
        pool.submit("cancel-aware", move |ctx| {
            if ctx.stop_requested() {
                observed2.fetch_add(1, Ordering::SeqCst);
                return Err(Error::Canceled);
            }
            Ok(())
        });
        pool.join_all();

        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert!(!pool.outcome());

        pool.reset_stop();
        pool.begin_batch();
        pool.submit("runs", |ctx| {
            assert!(!ctx.stop_requested());
            Ok(())
        });
        pool.join_all();
        assert!(pool.outcome());
    }

    #[test]
    fn test_join_all_with_no_jobs_returns() {
        let pool = WorkerPool::new(2);
        pool.join_all();
    }

    #[test]
    fn test_default_worker_count_is_positive() {
        let pool = WorkerPool::new(0);
        assert!(pool.worker_count() >= 1);
    }
}
