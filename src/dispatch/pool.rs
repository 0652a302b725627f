//! The worker-pool dispatch strategy.

use std::cmp::max;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{error, trace, warn};
use parking_lot::Mutex;

use super::{Dispatcher, Saturated};
use crate::task::EventTask;

/// Builds a worker pool with custom configuration values.
///
/// Methods can be chained in order to set the configuration values. The pool
/// is constructed by calling [`build`].
///
/// [`build`]: Builder::build
#[derive(Debug)]
pub struct Builder {
    pool_size: usize,
    queue_capacity: usize,
    name_prefix: String,
}

impl Builder {
    /// Returns a new builder initialized with default configuration values:
    /// one worker per CPU and a queue of 256 tasks.
    pub fn new() -> Builder {
        Builder {
            pool_size: max(1, num_cpus::get()),
            queue_capacity: 256,
            name_prefix: "muxio-worker-".to_string(),
        }
    }

    /// Sets the number of worker threads.
    ///
    /// # Panics
    ///
    /// Panics if `val` is zero.
    pub fn pool_size(&mut self, val: usize) -> &mut Builder {
        assert!(val >= 1, "pool size must be at least one worker");
        self.pool_size = val;
        self
    }

    /// Sets the task queue bound.
    ///
    /// When the queue is full, `execute` rejects the task and the reactor
    /// retries it; readiness is never dropped, only delayed.
    ///
    /// # Panics
    ///
    /// Panics if `val` is zero.
    pub fn queue_capacity(&mut self, val: usize) -> &mut Builder {
        assert!(val >= 1, "queue capacity must be at least one task");
        self.queue_capacity = val;
        self
    }

    /// Sets the prefix worker threads are named with.
    pub fn name_prefix(&mut self, val: impl Into<String>) -> &mut Builder {
        self.name_prefix = val.into();
        self
    }

    /// Spawns the workers and returns the pool.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn a worker thread.
    pub fn build(&self) -> WorkerPool {
        let (tx, rx) = bounded(self.queue_capacity);
        let (exit_tx, exit_rx) = bounded(self.pool_size);

        let mut threads = Vec::with_capacity(self.pool_size);
        for i in 0..self.pool_size {
            let rx = rx.clone();
            let exit_tx = exit_tx.clone();
            let thread = thread::Builder::new()
                .name(format!("{}{}", self.name_prefix, i))
                .spawn(move || worker(rx, exit_tx))
                .expect("failed to spawn worker thread");
            threads.push(thread);
        }

        WorkerPool {
            injector: Mutex::new(Some(tx)),
            exited: exit_rx,
            threads: Mutex::new(threads),
        }
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

/// Dispatches handler invocations to a fixed-size pool of worker threads.
///
/// The loop thread never blocks on handler execution: tasks go into a
/// bounded queue and workers pull from it. When the queue is full the task
/// is rejected back to the reactor, which retries it shortly — slow handlers
/// delay their own channel, not the loop.
pub struct WorkerPool {
    injector: Mutex<Option<Sender<EventTask>>>,
    exited: Receiver<()>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates a pool with default configuration values.
    pub fn new() -> WorkerPool {
        Builder::new().build()
    }

    /// Returns a builder for custom configuration values.
    pub fn builder() -> Builder {
        Builder::new()
    }
}

impl Default for WorkerPool {
    fn default() -> WorkerPool {
        WorkerPool::new()
    }
}

impl Dispatcher for WorkerPool {
    fn execute(&self, task: EventTask) -> Result<(), Saturated> {
        let injector = self.injector.lock();
        match injector.as_ref() {
            Some(tx) => match tx.try_send(task) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(task)) => Err(Saturated::new(task)),
                Err(TrySendError::Disconnected(task)) => Err(Saturated::new(task)),
            },
            None => Err(Saturated::new(task)),
        }
    }

    fn shutdown(&self, timeout: Duration) -> bool {
        // Dropping the injector closes the queue; workers finish what is
        // queued and in flight, then exit.
        drop(self.injector.lock().take());

        let mut threads = self.threads.lock();
        if threads.is_empty() {
            return true;
        }

        let deadline = Instant::now() + timeout;
        for _ in 0..threads.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.exited.recv_timeout(remaining).is_err() {
                warn!(
                    "worker pool shutdown timed out after {:?}; detaching remaining workers",
                    timeout
                );
                threads.clear();
                return false;
            }
        }

        for thread in threads.drain(..) {
            let _ = thread.join();
        }
        true
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.injector.lock().is_some() {
            self.shutdown(Duration::from_secs(5));
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("WorkerPool")
            .field("workers", &self.threads.lock().len())
            .finish()
    }
}

fn worker(rx: Receiver<EventTask>, exited: Sender<()>) {
    for task in rx.iter() {
        if panic::catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
            error!("event task panicked; worker continuing");
        }
    }
    trace!("worker draining complete");
    let _ = exited.send(());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_are_sane() {
        let builder = Builder::new();
        assert!(builder.pool_size >= 1);
        assert!(builder.queue_capacity >= 1);
        assert!(builder.name_prefix.ends_with('-'));
    }

    #[test]
    fn builder_is_chainable() {
        let mut builder = Builder::new();
        builder.pool_size(2).queue_capacity(8).name_prefix("svc-");
        assert_eq!(builder.pool_size, 2);
        assert_eq!(builder.queue_capacity, 8);
        assert_eq!(builder.name_prefix, "svc-");
    }

    #[test]
    fn shutdown_is_idempotent() {
        let pool = Builder::new().pool_size(2).build();
        assert!(pool.shutdown(std::time::Duration::from_secs(1)));
        assert!(pool.shutdown(std::time::Duration::from_secs(1)));
    }
}
