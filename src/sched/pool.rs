//! # Fixed Worker Pool
//!
//! A deliberately small pool: a channel of boxed jobs, a fixed set of
//! worker threads, and an all-wait barrier. Rounds in the bottom-up
//! scheduler are coarse-grained, so work stealing and per-task futures buy
//! nothing here; what matters is that `wait_all` reliably drains the round
//! and carries the first failure out.
//!
//! Jobs that panic are caught and converted into errors so a crashing
//! callback cannot strand the barrier with a pending count that never
//! reaches zero.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use eyre::{eyre, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

struct PoolState {
    pending: usize,
    first_err: Option<eyre::Report>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    done: Condvar,
}

pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// A pool with `threads` workers; zero means one per CPU.
    pub fn new(threads: usize) -> WorkerPool {
        let threads = if threads == 0 {
            num_cpus::get()
        } else {
            threads
        };

        let (tx, rx) = unbounded::<Job>();
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                pending: 0,
                first_err: None,
            }),
            done: Condvar::new(),
        });

        let workers = (0..threads)
            .map(|i| {
                let rx = rx.clone();
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("lgdb-worker-{i}"))
                    .stack_size(2 * 1024 * 1024)
                    .spawn(move || {
                        for job in rx.iter() {
                            let result = match catch_unwind(AssertUnwindSafe(job)) {
                                Ok(r) => r,
                                Err(payload) => Err(panic_to_error(payload)),
                            };
                            let mut st = shared.state.lock();
                            st.pending -= 1;
                            if let Err(err) = result {
                                if st.first_err.is_none() {
                                    st.first_err = Some(err);
                                }
                            }
                            if st.pending == 0 {
                                shared.done.notify_all();
                            }
                        }
                    })
                    .expect("failed to spawn pool worker")
            })
            .collect();

        WorkerPool {
            tx: Some(tx),
            workers,
            shared,
        }
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Queues a job. Jobs from one batch run concurrently; nothing orders
    /// them beyond the barrier.
    pub fn add<F>(&self, job: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.shared.state.lock().pending += 1;
        self.tx
            .as_ref()
            .expect("pool already shut down")
            .send(Box::new(job))
            .expect("pool workers exited early");
    }

    /// Blocks until every queued job has finished, then re-raises the
    /// first failure observed in the batch, if any.
    pub fn wait_all(&self) -> Result<()> {
        let mut st = self.shared.state.lock();
        while st.pending > 0 {
            self.shared.done.wait(&mut st);
        }
        match st.first_err.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets workers drain and exit.
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn panic_to_error(payload: Box<dyn std::any::Any + Send>) -> eyre::Report {
    let msg = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "opaque panic payload".to_string());
    eyre!("worker task panicked: {msg}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_every_job_before_wait_returns() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.add(move || {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            });
        }
        pool.wait_all().unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn first_error_surfaces_after_the_batch_drains() {
        let pool = WorkerPool::new(2);
        let completed = Arc::new(AtomicUsize::new(0));

        for i in 0..20 {
            let completed = Arc::clone(&completed);
            pool.add(move || {
                completed.fetch_add(1, Ordering::Relaxed);
                if i == 3 {
                    eyre::bail!("callback failed on subgraph {i}");
                }
                Ok(())
            });
        }
        let err = pool.wait_all().unwrap_err();
        assert!(err.to_string().contains("callback failed"));
        assert_eq!(completed.load(Ordering::Relaxed), 20, "batch must drain");

        // The pool stays usable for the next round.
        pool.add(|| Ok(()));
        pool.wait_all().unwrap();
    }

    #[test]
    fn panicking_job_becomes_an_error() {
        let pool = WorkerPool::new(2);
        pool.add(|| panic!("boom"));
        let err = pool.wait_all().unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }
}
