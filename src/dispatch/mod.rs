//! Handler dispatch strategies.
//!
//! A [`Dispatcher`] decides which thread runs a handler invocation. The
//! reactor hands it one [`EventTask`] per channel with pending readiness and
//! otherwise stays out of the way; the task itself enforces the per-channel
//! ordering guarantee, so a dispatcher is free to run tasks for different
//! channels concurrently.

use std::fmt;
use std::time::Duration;

use crate::task::EventTask;

pub mod pool;

/// An execution strategy for handler invocations.
pub trait Dispatcher: Send + Sync + 'static {
    /// Takes ownership of `task` and arranges for it to run.
    ///
    /// A dispatcher that cannot take the task right now hands it back as
    /// [`Saturated`]; the reactor keeps the task, along with the readiness
    /// it carries, and retries shortly. Implementations must not block the
    /// caller: this is invoked from the reactor's loop thread.
    fn execute(&self, task: EventTask) -> Result<(), Saturated>;

    /// Drains queued and in-flight tasks, waiting at most `timeout`.
    ///
    /// Returns true if everything drained and all execution resources were
    /// released within the window.
    fn shutdown(&self, timeout: Duration) -> bool;
}

/// Error returned by [`Dispatcher::execute`] when the strategy is at
/// capacity. Carries the rejected task so no readiness is lost.
pub struct Saturated(EventTask);

impl Saturated {
    /// Wraps a task the dispatcher could not take.
    pub fn new(task: EventTask) -> Saturated {
        Saturated(task)
    }

    /// Recovers the rejected task.
    pub fn into_task(self) -> EventTask {
        self.0
    }
}

impl fmt::Debug for Saturated {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "Saturated")
    }
}

impl fmt::Display for Saturated {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "dispatcher is at capacity")
    }
}

impl std::error::Error for Saturated {}

/// Runs every handler synchronously on the reactor's own loop thread.
///
/// The simplest strategy, with the sharpest contract: a handler that blocks
/// stalls I/O for every channel. Appropriate for strictly non-blocking,
/// short handlers.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineDispatcher;

impl InlineDispatcher {
    /// Creates the inline strategy.
    pub fn new() -> InlineDispatcher {
        InlineDispatcher
    }
}

impl Dispatcher for InlineDispatcher {
    fn execute(&self, task: EventTask) -> Result<(), Saturated> {
        task.run();
        Ok(())
    }

    fn shutdown(&self, _timeout: Duration) -> bool {
        // Nothing queued, nothing owned.
        true
    }
}
