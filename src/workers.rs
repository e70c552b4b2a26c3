//! Fixed-size worker pool fed over a channel.

use crate::error::{EngineError, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tracing::{trace, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs submitted jobs on `size` long-lived threads.
///
/// A job that panics is dropped; the worker keeps serving the queue.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn a pool with `size` workers.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(EngineError::InvalidConfig("worker count must be at least 1".into()));
        }

        let (sender, receiver) = unbounded::<Job>();
        let mut handles = Vec::with_capacity(size);
        for id in 0..size {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("hydra-worker-{}", id))
                .spawn(move || Self::work(id, receiver))?;
            handles.push(handle);
        }

        Ok(Self {
            sender: Some(sender),
            handles,
        })
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Queue a job.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .as_ref()
            .ok_or(EngineError::WorkerPoolClosed)?
            .send(Box::new(job))
            .map_err(|_| EngineError::WorkerPoolClosed)
    }

    /// Stop accepting jobs, drain the queue, and join every worker.
    pub fn shutdown(&mut self) {
        self.sender.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread exited with a panic");
            }
        }
    }

    fn work(id: usize, receiver: Receiver<Job>) {
        for job in receiver.iter() {
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                warn!(worker = id, "job panicked");
            }
        }
        trace!(worker = id, "worker stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_runs_all_jobs() {
        let mut pool = WorkerPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(
            WorkerPool::new(0),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_survives_panicking_job() {
        let pool = WorkerPool::new(1).unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);

        pool.execute(|| panic!("boom")).unwrap();
        pool.execute(move || tx.send(7).unwrap()).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn test_execute_after_shutdown() {
        let mut pool = WorkerPool::new(2).unwrap();
        pool.shutdown();
        assert_eq!(pool.size(), 0);
        assert!(matches!(
            pool.execute(|| {}),
            Err(EngineError::WorkerPoolClosed)
        ));
    }
}
