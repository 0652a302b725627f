//! The event loop and its control plane.

use std::fmt;
use std::io;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, log_enabled, trace, warn, Level};
use mio::{Events, Poll, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;

use crate::channel::{Channel, ChannelKind};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::ready::Ready;
use crate::task::EventTask;

// Token layout: the low bits key into the registration table, the high bits
// carry a generation guard so a recycled slot discards events meant for its
// previous occupant.
const TOKEN_SHIFT: usize = 22;
const MAX_CHANNELS: usize = (1 << TOKEN_SHIFT) - 1;
const TOKEN_WAKEUP: Token = Token(MAX_CHANNELS);

/// How long the loop waits before retrying tasks a saturated dispatcher
/// handed back.
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

const EVENTS_CAPACITY: usize = 1024;

fn token_key(token: usize) -> usize {
    token & MAX_CHANNELS
}

fn token_guard(token: usize) -> usize {
    token & !MAX_CHANNELS
}

fn validate(channel: &Channel, handler: &dyn Handler) -> Result<()> {
    if !channel.is_open() {
        return Err(Error::NotBound);
    }
    let required = channel.interest();
    let supported = handler.handles();
    if !supported.contains(required) {
        return Err(Error::UnsupportedEvents {
            required,
            supported,
        });
    }
    Ok(())
}

/// A channel's registration record: the channel, its handler, and the
/// readiness bookkeeping shared with event tasks.
pub(crate) struct Entry {
    token: usize,
    kind: ChannelKind,
    interest: AtomicUsize,
    readiness: AtomicUsize,
    dispatched: AtomicBool,
    closing: AtomicBool,
    pub(crate) channel: Mutex<Channel>,
    pub(crate) handler: Arc<dyn Handler>,
}

impl Entry {
    fn new(
        token: usize,
        kind: ChannelKind,
        interest: Ready,
        channel: Channel,
        handler: Arc<dyn Handler>,
    ) -> Entry {
        Entry {
            token,
            kind,
            interest: AtomicUsize::new(interest.as_usize()),
            readiness: AtomicUsize::new(0),
            dispatched: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            channel: Mutex::new(channel),
            handler,
        }
    }

    pub(crate) fn token(&self) -> usize {
        self.token
    }

    pub(crate) fn interest(&self) -> Ready {
        Ready::from_usize(self.interest.load(Relaxed))
    }

    fn set_interest(&self, interest: Ready) {
        self.interest.store(interest.as_usize(), Relaxed);
    }

    pub(crate) fn push_readiness(&self, ready: Ready) {
        self.readiness.fetch_or(ready.as_usize(), AcqRel);
    }

    pub(crate) fn take_readiness(&self) -> Ready {
        Ready::from_usize(self.readiness.swap(0, AcqRel))
    }

    pub(crate) fn has_readiness(&self) -> bool {
        self.readiness.load(Acquire) != 0
    }

    pub(crate) fn begin_dispatch(&self) -> bool {
        self.dispatched
            .compare_exchange(false, true, AcqRel, Acquire)
            .is_ok()
    }

    pub(crate) fn end_dispatch(&self) {
        self.dispatched.store(false, Release);
    }

    fn is_dispatched(&self) -> bool {
        self.dispatched.load(Acquire)
    }

    fn set_closing(&self) {
        self.closing.store(true, Release);
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Acquire)
    }
}

enum Command {
    Register {
        channel: Channel,
        handler: Arc<dyn Handler>,
    },
    SetInterest {
        token: usize,
        interest: Ready,
    },
    Close {
        token: usize,
    },
    Done {
        token: usize,
    },
    Stop,
}

/// A cloneable reference to a running reactor.
///
/// Handles are the cross-thread side of the loop: they put requests on the
/// command queue and wake the selector so the loop applies them before its
/// next blocking wait. Every mutation of the interest set travels this path;
/// nothing outside the loop thread ever touches the selector directly.
#[derive(Clone)]
pub struct Handle {
    tx: Sender<Command>,
    waker: Arc<Waker>,
}

impl Handle {
    /// Registers a bound channel with the running reactor.
    ///
    /// Validation mirrors [`Reactor::register_channel`]. The registration
    /// itself happens on the loop thread; a failure there is logged, not
    /// returned, because this call has already come back by then.
    pub fn register_channel(&self, channel: Channel, handler: impl Handler) -> Result<()> {
        self.register_arc(channel, Arc::new(handler))
    }

    pub(crate) fn register_arc(&self, channel: Channel, handler: Arc<dyn Handler>) -> Result<()> {
        validate(&channel, handler.as_ref())?;
        self.send(Command::Register { channel, handler })
    }

    pub(crate) fn set_interest(&self, token: usize, interest: Ready) -> Result<()> {
        self.send(Command::SetInterest { token, interest })
    }

    pub(crate) fn close_channel(&self, token: usize) -> Result<()> {
        self.send(Command::Close { token })
    }

    pub(crate) fn task_done(&self, token: usize) -> Result<()> {
        self.send(Command::Done { token })
    }

    fn request_stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).map_err(|_| Error::Shutdown)?;
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake the reactor: {}", e);
        }
        Ok(())
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "Handle")
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Idle,
    Running,
    Stopped,
}

/// The core reactor, or event loop.
///
/// One thread blocks on the selector and drives everything else: it resolves
/// readiness to channels, submits the bound handlers to the dispatcher, and
/// applies queued registration and interest changes strictly between poll
/// iterations. Channels are registered up front, the loop is started, and
/// the whole thing is torn down with a blocking [`stop`].
///
/// [`stop`]: Reactor::stop
pub struct Reactor {
    dispatcher: Arc<dyn Dispatcher>,
    state: State,
    pending: Vec<(Channel, Arc<dyn Handler>)>,
    shutdown_timeout: Duration,
    handle: Option<Handle>,
    thread: Option<thread::JoinHandle<()>>,
    done_rx: Option<mpsc::Receiver<()>>,
}

impl Reactor {
    /// Creates a reactor using `dispatcher` as its execution strategy.
    ///
    /// No selector or socket is touched until [`start`].
    ///
    /// [`start`]: Reactor::start
    pub fn new(dispatcher: impl Dispatcher) -> Reactor {
        Reactor {
            dispatcher: Arc::new(dispatcher),
            state: State::Idle,
            pending: Vec::new(),
            shutdown_timeout: Duration::from_secs(5),
            handle: None,
            thread: None,
            done_rx: None,
        }
    }

    /// Sets the bounded wait granted to the dispatcher during [`stop`].
    ///
    /// [`stop`]: Reactor::stop
    pub fn shutdown_timeout(&mut self, timeout: Duration) -> &mut Reactor {
        self.shutdown_timeout = timeout;
        self
    }

    /// Binds `handler` to `channel` and adds the pair to the registration
    /// table with the channel's initial interest set: accept for listening
    /// channels, read for connected and datagram channels.
    ///
    /// Returns `self` so several registrations can be chained ahead of
    /// [`start`]. Fails with [`Error::NotBound`] if the channel was never
    /// bound and [`Error::UnsupportedEvents`] if the handler does not
    /// service the channel's event kinds; either failure leaves other
    /// registrations untouched.
    ///
    /// [`start`]: Reactor::start
    pub fn register_channel(
        &mut self,
        channel: Channel,
        handler: impl Handler,
    ) -> Result<&mut Reactor> {
        let handler: Arc<dyn Handler> = Arc::new(handler);
        validate(&channel, handler.as_ref())?;
        match self.state {
            State::Idle => self.pending.push((channel, handler)),
            State::Running => match &self.handle {
                Some(handle) => handle.register_arc(channel, handler)?,
                None => return Err(Error::Shutdown),
            },
            State::Stopped => return Err(Error::Shutdown),
        }
        Ok(self)
    }

    /// Spawns the loop thread and returns once it is actively polling.
    ///
    /// Selector creation failures surface here and prevent the loop from
    /// ever running. Failures registering an individual buffered channel are
    /// logged and isolated to that channel.
    pub fn start(&mut self) -> Result<()> {
        if self.state != State::Idle {
            return Err(Error::AlreadyRunning);
        }

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), TOKEN_WAKEUP)?);
        let (tx, rx) = unbounded();
        let handle = Handle { tx, waker };

        let mut core = Core {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            entries: Slab::new(),
            next_guard: 0,
            rx,
            handle: handle.clone(),
            dispatcher: self.dispatcher.clone(),
            deferred: Vec::new(),
            shutdown_timeout: self.shutdown_timeout,
        };

        for (channel, handler) in self.pending.drain(..) {
            if let Err(e) = core.add_channel(channel, handler) {
                error!("dropping channel registration: {}", e);
            }
        }

        let (started_tx, started_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("muxio-reactor".to_string())
            .spawn(move || core.run(&started_tx, &done_tx))?;

        started_rx.recv().map_err(|_| Error::Interrupted)?;

        self.handle = Some(handle);
        self.thread = Some(thread);
        self.done_rx = Some(done_rx);
        self.state = State::Running;
        Ok(())
    }

    /// Returns a handle to the running reactor, or `None` before [`start`].
    ///
    /// [`start`]: Reactor::start
    pub fn handle(&self) -> Option<Handle> {
        self.handle.clone()
    }

    /// Requests loop termination and waits for it to complete.
    ///
    /// Safe to call from any thread, and idempotent: once stopped, further
    /// calls return `Ok`. On return every registered channel has been closed
    /// and deregistered, the dispatcher has drained within its bounded
    /// window, and the loop thread has been joined.
    ///
    /// Fails with [`Error::Interrupted`] if the loop thread died before
    /// acknowledging termination; resources are reaped as far as possible
    /// and a retry returns `Ok`.
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            State::Idle => {
                self.state = State::Stopped;
                return Ok(());
            }
            State::Stopped => return Ok(()),
            State::Running => {}
        }

        if let Some(handle) = &self.handle {
            // If the loop is already gone the join below reaps it anyway.
            let _ = handle.request_stop();
        }

        let acked = match &self.done_rx {
            Some(rx) => rx.recv().is_ok(),
            None => false,
        };
        let joined = match self.thread.take() {
            Some(thread) => thread.join().is_ok(),
            None => false,
        };

        self.state = State::Stopped;
        self.handle = None;
        self.done_rx = None;

        if acked && joined {
            Ok(())
        } else {
            Err(Error::Interrupted)
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if self.state == State::Running {
            let _ = self.stop();
        }
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "Reactor")
    }
}

// ===== impl Core =====

struct Core {
    poll: Poll,
    events: Events,
    entries: Slab<Arc<Entry>>,
    next_guard: usize,
    rx: Receiver<Command>,
    handle: Handle,
    dispatcher: Arc<dyn Dispatcher>,
    deferred: Vec<EventTask>,
    shutdown_timeout: Duration,
}

impl Core {
    fn run(mut self, started: &mpsc::Sender<()>, done: &mpsc::Sender<()>) {
        debug!("reactor loop starting with {} channels", self.entries.len());
        let _ = started.send(());

        let mut ready_buf: Vec<(usize, Ready)> = Vec::new();
        let mut stop = false;
        while !stop {
            let timeout = if self.deferred.is_empty() {
                None
            } else {
                Some(RETRY_INTERVAL)
            };

            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                // A ptracer attaching, a signal landing: not fatal.
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("selector wait failed: {}", e);
                    break;
                }
            }

            let start = if log_enabled!(Level::Debug) {
                Some(Instant::now())
            } else {
                None
            };

            ready_buf.clear();
            for event in self.events.iter() {
                let token = event.token();
                if token == TOKEN_WAKEUP {
                    trace!("woken for queued requests");
                    continue;
                }
                let mut ready = Ready::empty();
                if event.is_readable() || event.is_read_closed() {
                    ready |= Ready::readable();
                }
                if event.is_writable() || event.is_write_closed() {
                    ready |= Ready::writable();
                }
                ready_buf.push((token.0, ready));
            }

            let count = ready_buf.len();
            for (token, ready) in ready_buf.drain(..) {
                self.dispatch_ready(token, ready);
            }

            if !self.deferred.is_empty() {
                self.retry_deferred();
            }

            stop = self.drain_commands();

            if let Some(start) = start {
                let dur = start.elapsed();
                debug!(
                    "loop process - {} events, {}.{:03}s",
                    count,
                    dur.as_secs(),
                    dur.subsec_millis()
                );
            }
        }

        self.shutdown();
        let _ = done.send(());
    }

    /// Routes one selector event to its entry, accumulating readiness and
    /// dispatching a task if none is in flight for the channel.
    fn dispatch_ready(&mut self, token: usize, raw: Ready) {
        let entry = match self.lookup(token) {
            Some(entry) => entry,
            None => {
                debug!("readiness for unknown channel token {}", token);
                return;
            }
        };

        if entry.is_closing() {
            return;
        }

        let mut ready = raw;
        if entry.kind == ChannelKind::Listener {
            // Readability on a listening socket means connections to accept.
            if ready.is_readable() {
                ready = (ready - Ready::readable()) | Ready::accept();
            }
            ready.remove(Ready::writable());
        }

        let ready = ready & entry.interest();
        if ready.is_empty() {
            return;
        }

        trace!("event {:?} for channel {}", ready, token_key(token));
        entry.push_readiness(ready);
        self.try_dispatch(&entry);
    }

    fn try_dispatch(&mut self, entry: &Arc<Entry>) {
        if entry.begin_dispatch() {
            let task = EventTask::new(entry.clone(), self.handle.clone());
            self.submit(task);
        }
    }

    fn submit(&mut self, task: EventTask) {
        match self.dispatcher.execute(task) {
            Ok(()) => {}
            Err(rejected) => {
                debug!("dispatcher saturated; deferring event task");
                self.deferred.push(rejected.into_task());
            }
        }
    }

    fn retry_deferred(&mut self) {
        let deferred = std::mem::take(&mut self.deferred);
        for task in deferred {
            self.submit(task);
        }
    }

    /// Applies queued requests in submission order. Returns true once a stop
    /// request has been seen.
    fn drain_commands(&mut self) -> bool {
        let mut stop = false;
        while let Ok(cmd) = self.rx.try_recv() {
            if self.apply(cmd) {
                stop = true;
            }
        }
        stop
    }

    fn apply(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Register { channel, handler } => {
                if let Err(e) = self.add_channel(channel, handler) {
                    error!("dropping channel registration: {}", e);
                }
                false
            }
            Command::SetInterest { token, interest } => {
                self.apply_interest(token, interest);
                false
            }
            Command::Close { token } => {
                self.request_close(token);
                false
            }
            Command::Done { token } => {
                self.finish_task(token);
                false
            }
            Command::Stop => {
                debug!("stop requested");
                true
            }
        }
    }

    fn add_channel(&mut self, channel: Channel, handler: Arc<dyn Handler>) -> Result<()> {
        validate(&channel, handler.as_ref())?;

        if self.entries.len() >= MAX_CHANNELS {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "reactor at max registered channels",
            )));
        }

        self.next_guard = self.next_guard.wrapping_add(1 << TOKEN_SHIFT);
        let guard = self.next_guard;

        let vacant = self.entries.vacant_entry();
        let key = vacant.key();
        let token = guard | key;

        let mut channel = channel;
        channel.register_source(self.poll.registry(), Token(token))?;

        let kind = channel.kind();
        let interest = channel.interest();
        let entry = Arc::new(Entry::new(token, kind, interest, channel, handler));
        debug!("adding {:?} channel {} with interest {:?}", kind, key, interest);
        vacant.insert(entry.clone());

        // The selector only reports transitions; anything already queued on
        // the socket predates this registration, so prime one pass by hand.
        entry.push_readiness(interest);
        self.try_dispatch(&entry);
        Ok(())
    }

    fn apply_interest(&mut self, token: usize, interest: Ready) {
        let entry = match self.lookup(token) {
            Some(entry) => entry,
            None => return,
        };
        trace!(
            "interest for channel {} set to {:?}",
            token_key(token),
            interest
        );
        entry.set_interest(interest);
        if interest.is_writable() {
            // The socket may already be writable with no further edge
            // coming; force a flush attempt.
            entry.push_readiness(Ready::writable());
            self.try_dispatch(&entry);
        }
    }

    fn request_close(&mut self, token: usize) {
        let entry = match self.lookup(token) {
            Some(entry) => entry,
            None => return,
        };
        entry.set_closing();
        // Claiming the dispatch slot keeps a finishing task from re-arming
        // while the entry is torn down; if a task is in flight, its
        // completion triggers the teardown instead.
        if entry.begin_dispatch() {
            self.finalize(token);
        }
    }

    fn finish_task(&mut self, token: usize) {
        let entry = match self.lookup(token) {
            Some(entry) => entry,
            None => return,
        };
        if entry.is_dispatched() {
            // A newer task already took over; its completion comes later.
            return;
        }
        if entry.is_closing() {
            self.finalize(token);
            return;
        }
        // The handler may have closed the channel directly.
        let closed = match entry.channel.try_lock() {
            Some(guard) => !guard.is_open(),
            None => false,
        };
        if closed {
            self.finalize(token);
            return;
        }
        // Readiness that raced the idle transition.
        if entry.has_readiness() {
            self.try_dispatch(&entry);
        }
    }

    /// Removes the entry and deregisters the socket, atomically with respect
    /// to this loop: once this runs, the channel cannot appear in a
    /// readiness report again.
    fn finalize(&mut self, token: usize) {
        let key = token_key(token);
        if !self.entries.contains(key) {
            return;
        }
        let entry = self.entries.remove(key);
        let mut channel = entry.channel.lock();
        if channel.is_open() {
            if let Err(e) = channel.deregister_source(self.poll.registry()) {
                debug!("deregister failed for channel {}: {}", key, e);
            }
            channel.close();
        }
        debug!("dropping channel {}", key);
    }

    fn lookup(&self, token: usize) -> Option<Arc<Entry>> {
        let entry = self.entries.get(token_key(token))?;
        if token_guard(token) != token_guard(entry.token()) {
            debug!("stale token {} for recycled slot", token);
            return None;
        }
        Some(entry.clone())
    }

    fn shutdown(&mut self) {
        debug!("reactor loop stopping; draining dispatcher");
        // Handlers may still be running; give them their bounded window
        // before tearing the channels down under them.
        if !self.dispatcher.shutdown(self.shutdown_timeout) {
            warn!("dispatcher did not drain within {:?}", self.shutdown_timeout);
        }
        self.deferred.clear();

        for entry in self.entries.drain() {
            // A worker that outlived the drain window may still hold the
            // channel; its descriptor is released when the task completes.
            match entry.channel.try_lock() {
                Some(mut channel) => {
                    if channel.is_open() {
                        if let Err(e) = channel.deregister_source(self.poll.registry()) {
                            trace!("deregister during shutdown failed: {}", e);
                        }
                        channel.close();
                    }
                }
                None => warn!("channel still busy at shutdown; releasing it to its task"),
            }
        }
        debug!("reactor loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_layout_round_trips() {
        let guard = 7 << TOKEN_SHIFT;
        let token = guard | 42;
        assert_eq!(token_key(token), 42);
        assert_eq!(token_guard(token), guard);
    }

    #[test]
    fn wakeup_token_is_never_a_valid_key() {
        // Keys stay below MAX_CHANNELS, so no generation can alias the
        // reserved wakeup token's key bits.
        assert_eq!(token_key(TOKEN_WAKEUP.0), MAX_CHANNELS);
        for key in [0, 1, MAX_CHANNELS - 1] {
            assert_ne!(token_key(key), MAX_CHANNELS);
        }
    }

    #[test]
    fn entry_dispatch_flag_is_exclusive() {
        use crate::ready::Ready;

        struct Nop;
        impl crate::handler::Handler for Nop {
            fn handles(&self) -> Ready {
                Ready::readable()
            }
        }

        let channel = Channel::udp("127.0.0.1:0".parse().unwrap());
        let entry = Entry::new(
            0,
            ChannelKind::Datagram,
            Ready::readable(),
            channel,
            Arc::new(Nop),
        );

        assert!(entry.begin_dispatch());
        assert!(!entry.begin_dispatch());
        entry.end_dispatch();
        assert!(entry.begin_dispatch());
    }

    #[test]
    fn entry_readiness_accumulates() {
        struct Nop;
        impl crate::handler::Handler for Nop {
            fn handles(&self) -> Ready {
                Ready::readable()
            }
        }

        let channel = Channel::udp("127.0.0.1:0".parse().unwrap());
        let entry = Entry::new(
            0,
            ChannelKind::Datagram,
            Ready::readable(),
            channel,
            Arc::new(Nop),
        );

        entry.push_readiness(Ready::readable());
        entry.push_readiness(Ready::writable());
        assert!(entry.has_readiness());
        assert_eq!(entry.take_readiness(), Ready::readable() | Ready::writable());
        assert!(!entry.has_readiness());
        assert!(entry.take_readiness().is_empty());
    }
}
