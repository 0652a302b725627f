//! Per-channel event tasks.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::error;

use crate::handler::Context;
use crate::reactor::{Entry, Handle};
use crate::ready::Ready;

/// One unit of handler work: a channel with pending readiness.
///
/// At most one task per channel exists at any time; the reactor only creates
/// a new one after the previous one reports completion. The task drains the
/// channel's accumulated readiness until none remains, which is what makes
/// same-kind events for a single channel strictly ordered and never
/// concurrent, no matter how many threads the dispatcher owns.
pub struct EventTask {
    entry: Arc<Entry>,
    handle: Handle,
}

impl EventTask {
    pub(crate) fn new(entry: Arc<Entry>, handle: Handle) -> EventTask {
        EventTask { entry, handle }
    }

    /// Runs the task to completion on the calling thread.
    pub fn run(self) {
        loop {
            let ready = self.entry.take_readiness();
            if !ready.is_empty() {
                self.service(ready);
                continue;
            }

            self.entry.end_dispatch();
            // Readiness that lands between the drain and the idle transition
            // would otherwise be stranded: the loop saw us in flight and did
            // not schedule another task.
            if !self.entry.has_readiness() || !self.entry.begin_dispatch() {
                break;
            }
        }

        let _ = self.handle.task_done(self.entry.token());
    }

    fn service(&self, ready: Ready) {
        let entry = &self.entry;
        if entry.is_closing() {
            return;
        }
        let mut channel = entry.channel.lock();
        if !channel.is_open() {
            // Closed while this task was queued; the readiness is void.
            return;
        }

        let cx = Context::new(&self.handle, &entry.handler, entry.token());

        if ready.is_accept() {
            catching("accept", || entry.handler.on_accept(&mut channel, &cx));
        }

        if ready.is_readable() && channel.is_open() {
            catching("read", || entry.handler.on_read(&mut channel, &cx));
        }

        if ready.is_writable() && channel.is_open() {
            match channel.flush_outbox() {
                Ok(true) => {
                    // Queue drained; fall back to the base interest set.
                    if entry.interest().is_writable() {
                        let base = channel.interest();
                        let _ = self.handle.set_interest(entry.token(), base);
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    error!("write failed on {:?}: {}", channel.local_addr(), e);
                    channel.close();
                }
            }
        }

        // The handler queued output; have the loop watch for writability.
        if channel.is_open() && channel.has_queued_writes() {
            let interest = entry.interest();
            if !interest.is_writable() {
                let _ = self
                    .handle
                    .set_interest(entry.token(), interest | Ready::writable());
            }
        }
    }
}

impl fmt::Debug for EventTask {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "EventTask")
    }
}

fn catching<F: FnOnce()>(what: &str, f: F) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("handler panicked while servicing {} readiness", what);
    }
}
