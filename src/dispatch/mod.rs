//! Execution contexts for observers.
//!
//! Observers split their work across two contexts:
//! - **background**: snapshot advance and key filtering, possibly on several
//!   worker threads
//! - **delivery**: a single serial context where subscribers are invoked, so
//!   one observer never calls its subscriber concurrently
//!
//! Either context can be a threaded [`TaskQueue`] or a manual queue whose
//! [`QueuePump`] the application drives from its own main loop.

mod queue;

pub use queue::{Executor, Job, QueuePump, TaskQueue};

use crate::error::Result;
use std::sync::Arc;

/// Dispatcher configuration.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Threads in the background pool.
    /// Default: 2
    pub background_workers: usize,

    /// Prefix for worker thread names.
    pub thread_name: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            background_workers: 2,
            thread_name: "keywatch".to_string(),
        }
    }
}

/// The pair of execution contexts an observer uses.
#[derive(Clone)]
pub struct Dispatcher {
    background: Arc<dyn Executor>,
    delivery: Arc<dyn Executor>,
}

impl Dispatcher {
    /// Use existing executors. `delivery` must run jobs one at a time.
    pub fn new(background: Arc<dyn Executor>, delivery: Arc<dyn Executor>) -> Self {
        Self {
            background,
            delivery,
        }
    }

    /// Spawn a background pool and a single delivery thread.
    pub fn spawn(config: DispatchConfig) -> Result<Self> {
        let background = TaskQueue::threaded(
            &format!("{}-bg", config.thread_name),
            config.background_workers,
        )?;
        let delivery = TaskQueue::threaded(&format!("{}-main", config.thread_name), 1)?;
        Ok(Self::new(Arc::new(background), Arc::new(delivery)))
    }

    /// Both contexts driven by the caller: returns the background pump and
    /// the delivery pump, in that order.
    pub fn manual() -> (Self, QueuePump, QueuePump) {
        let (background, background_pump) = TaskQueue::manual("background");
        let (delivery, delivery_pump) = TaskQueue::manual("delivery");
        let dispatcher = Self::new(Arc::new(background), Arc::new(delivery));
        (dispatcher, background_pump, delivery_pump)
    }

    pub fn run_in_background(&self, job: Job) {
        self.background.execute(job);
    }

    pub fn deliver(&self, job: Job) {
        self.delivery.execute(job);
    }
}
