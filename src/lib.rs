#![deny(missing_docs, missing_debug_implementations)]

//! Event loop that multiplexes many sockets over one thread.
//!
//! `muxio` is a callback-driven I/O reactor. It watches any number of
//! non-blocking network endpoints — TCP listeners, accepted streams, UDP
//! sockets — with a single synchronous selector wait, and invokes the
//! handler bound to each endpoint when the endpoint becomes ready. No thread
//! per connection; where a handler runs is a pluggable policy.
//!
//! The crate provides:
//!
//! * [`Reactor`] performs the event loop logic: one thread blocks on the
//!   selector, resolves ready channels to their handlers, and applies
//!   queued registration and interest changes between iterations.
//!
//! * [`Channel`] wraps one non-blocking socket with a declared interest set.
//!
//! * [`Handler`] is the application callback bound to a channel per
//!   readiness event kind.
//!
//! * [`Dispatcher`] decides which thread runs a handler invocation:
//!   [`InlineDispatcher`] stays on the loop thread, [`WorkerPool`] hands off
//!   to a bounded pool so slow handlers delay only their own channel.
//!
//! Handler code requests further registrations and interest changes through
//! its [`Context`]; the requests are queued and applied by the loop thread
//! before its next blocking wait, never concurrently with it.
//!
//! # Example
//!
//! An echo service on one TCP port:
//!
//! ```no_run
//! use std::io::ErrorKind;
//!
//! use muxio::{Channel, Context, Handler, Reactor, Ready, WorkerPool};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn handles(&self) -> Ready {
//!         Ready::accept() | Ready::readable()
//!     }
//!
//!     fn on_read(&self, channel: &mut Channel, _cx: &Context<'_>) {
//!         loop {
//!             match channel.recv() {
//!                 Ok(payload) if payload.data.is_empty() => return channel.close(),
//!                 Ok(payload) => channel.send(payload),
//!                 Err(ref e) if e.kind() == ErrorKind::WouldBlock => return,
//!                 Err(_) => return channel.close(),
//!             }
//!         }
//!     }
//! }
//!
//! fn main() -> muxio::Result<()> {
//!     let mut listener = Channel::tcp("127.0.0.1:7000".parse().unwrap());
//!     listener.bind()?;
//!
//!     let mut reactor = Reactor::new(WorkerPool::new());
//!     reactor.register_channel(listener, Echo)?;
//!     reactor.start()?;
//!     // ... serve until it is time to leave ...
//!     reactor.stop()
//! }
//! ```

pub mod channel;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod ready;

mod reactor;
mod task;

pub use self::channel::{Channel, ChannelKind, Payload};
pub use self::dispatch::pool::WorkerPool;
pub use self::dispatch::{Dispatcher, InlineDispatcher, Saturated};
pub use self::error::{Error, Result};
pub use self::handler::{Context, Handler};
pub use self::reactor::{Handle, Reactor};
pub use self::ready::Ready;
pub use self::task::EventTask;
