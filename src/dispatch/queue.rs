//! Job queues drained by worker threads or by an owner-driven pump.

use crate::error::Result;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs jobs on an execution context it controls.
pub trait Executor: Send + Sync {
    /// Queue a job. Jobs queued after the executor shut down are dropped.
    fn execute(&self, job: Job);
}

/// A FIFO job queue.
///
/// With one worker (or a single pump) jobs run strictly one at a time in
/// submission order.
pub struct TaskQueue {
    name: String,
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskQueue {
    /// Spawn `workers` named threads that drain the queue.
    pub fn threaded(name: &str, workers: usize) -> Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let mut handles = Vec::with_capacity(workers.max(1));

        for i in 0..workers.max(1) {
            let receiver = receiver.clone();
            let queue = name.to_string();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        run_job(&queue, job);
                    }
                    tracing::trace!(queue = %queue, "worker exiting");
                })?;
            handles.push(handle);
        }

        tracing::debug!(queue = %name, workers = handles.len(), "task queue started");
        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            workers: handles,
        })
    }

    /// A queue with no threads; jobs run only when the returned pump runs them.
    pub fn manual(name: &str) -> (Self, QueuePump) {
        let (sender, receiver) = unbounded::<Job>();
        let queue = Self {
            name: name.to_string(),
            sender: Some(sender),
            workers: Vec::new(),
        };
        let pump = QueuePump {
            name: name.to_string(),
            receiver,
        };
        (queue, pump)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Executor for TaskQueue {
    fn execute(&self, job: Job) {
        let delivered = match &self.sender {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        };
        if !delivered {
            tracing::trace!(queue = %self.name, "queue closed, job dropped");
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        // Closing the channel lets workers finish queued jobs and exit.
        self.sender.take();

        let current = thread::current().id();
        for handle in self.workers.drain(..) {
            // The last handle can be released by one of our own jobs.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!(queue = %self.name, "worker thread panicked");
            }
        }
    }
}

/// Runs the jobs of a manual [`TaskQueue`] on the caller's thread.
pub struct QueuePump {
    name: String,
    receiver: Receiver<Job>,
}

impl QueuePump {
    /// Run every job that is queued, including jobs queued while running.
    /// Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.receiver.try_recv() {
            run_job(&self.name, job);
            ran += 1;
        }
        ran
    }

    /// Wait up to `timeout` for one job and run it.
    pub fn run_next_timeout(&self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Ok(job) => {
                run_job(&self.name, job);
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Keep running jobs until none arrives for `quiet`.
    pub fn run_until_idle(&self, quiet: Duration) -> usize {
        let mut ran = 0;
        while self.run_next_timeout(quiet) {
            ran += 1;
        }
        ran
    }

    /// Jobs waiting to run.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

fn run_job(queue: &str, job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::warn!(queue = %queue, "job panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_manual_queue_runs_only_when_pumped() {
        let (queue, pump) = TaskQueue::manual("test");
        assert_eq!(queue.name(), "test");
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            queue.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(pump.pending(), 3);
        assert_eq!(pump.run_pending(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(pump.run_pending(), 0);
    }

    #[test]
    fn test_single_worker_preserves_order() {
        let queue = TaskQueue::threaded("serial", 1).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        for i in 0..100 {
            let seen = Arc::clone(&seen);
            queue.execute(Box::new(move || seen.lock().push(i)));
        }
        queue.execute(Box::new(move || {
            let _ = done_tx.send(());
        }));

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_drop_drains_queued_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let queue = TaskQueue::threaded("drain", 2).unwrap();
            for _ in 0..50 {
                let counter = Arc::clone(&counter);
                queue.execute(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }));
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_panicking_job_does_not_kill_pump() {
        let (queue, pump) = TaskQueue::manual("panics");
        let counter = Arc::new(AtomicUsize::new(0));

        queue.execute(Box::new(|| panic!("boom")));
        let c = Arc::clone(&counter);
        queue.execute(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(pump.run_pending(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_until_idle_returns_after_quiet_period() {
        let (queue, pump) = TaskQueue::manual("idle");
        queue.execute(Box::new(|| {}));
        assert_eq!(pump.run_until_idle(Duration::from_millis(10)), 1);
        drop(queue);
        assert!(!pump.run_next_timeout(Duration::from_millis(10)));
    }
}
