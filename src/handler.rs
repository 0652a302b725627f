//! Application handlers and their view of the reactor.

use std::fmt;
use std::io;
use std::sync::Arc;

use log::{error, warn};

use crate::channel::Channel;
use crate::error::Result;
use crate::reactor::Handle;
use crate::ready::Ready;

/// Application logic bound to a channel, invoked per readiness event.
///
/// A handler declares the event kinds it services through [`handles`]; a
/// registration whose initial interest is not covered is rejected up front,
/// so dispatch never routes an event kind to a handler that did not opt into
/// it.
///
/// One handler instance may be shared across any number of channels, which
/// is why the methods take `&self`: state must be internally synchronized or
/// absent. The reactor guarantees that invocations for a *single* channel
/// are serialized in arrival order; invocations for different channels may
/// run concurrently under a pooled dispatcher.
///
/// Handlers must not block for unbounded time. Under inline dispatch a
/// blocking handler stalls every other channel; under pooled dispatch it
/// pins a worker.
///
/// Readiness is edge-style: once invoked, consume the socket until it
/// reports `WouldBlock`, then return. `WouldBlock` is not an error — the
/// event is simply not re-delivered until the selector reports the channel
/// ready again.
///
/// [`handles`]: Handler::handles
pub trait Handler: Send + Sync + 'static {
    /// The event kinds this handler is prepared to service.
    fn handles(&self) -> Ready;

    /// Called when a listening channel has connections to accept.
    ///
    /// The default accepts until `WouldBlock` and registers every new
    /// connection with this same handler and read interest, leaving the
    /// listening channel's own accept interest in place for later
    /// connections. Override to derive a different handler, tune the new
    /// channel, or cap accepted connections.
    fn on_accept(&self, channel: &mut Channel, cx: &Context<'_>) {
        loop {
            match channel.accept() {
                Ok(conn) => {
                    if let Err(e) = cx.register(conn) {
                        warn!("dropping accepted connection: {}", e);
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("accept failed on {:?}: {}", channel.local_addr(), e);
                    channel.close();
                    break;
                }
            }
        }
    }

    /// Called when the channel has data to read.
    fn on_read(&self, channel: &mut Channel, cx: &Context<'_>) {
        let _ = (channel, cx);
    }
}

impl<T: Handler + ?Sized> Handler for Arc<T> {
    fn handles(&self) -> Ready {
        (**self).handles()
    }

    fn on_accept(&self, channel: &mut Channel, cx: &Context<'_>) {
        (**self).on_accept(channel, cx)
    }

    fn on_read(&self, channel: &mut Channel, cx: &Context<'_>) {
        (**self).on_read(channel, cx)
    }
}

/// A handler's scoped view of the reactor during one event.
///
/// Everything here funnels into the reactor's command queue; requests are
/// applied by the loop thread between poll iterations, never concurrently
/// with a blocked selector wait.
pub struct Context<'a> {
    handle: &'a Handle,
    handler: &'a Arc<dyn Handler>,
    token: usize,
}

impl<'a> Context<'a> {
    pub(crate) fn new(handle: &'a Handle, handler: &'a Arc<dyn Handler>, token: usize) -> Context<'a> {
        Context {
            handle,
            handler,
            token,
        }
    }

    /// Returns the reactor handle, e.g. to register channels bound elsewhere.
    pub fn reactor(&self) -> &Handle {
        self.handle
    }

    /// Registers `channel` with the reactor under this event's own handler.
    ///
    /// This is the accept path: new connections typically keep the handler
    /// of the listening channel that produced them.
    pub fn register(&self, channel: Channel) -> Result<()> {
        self.handle.register_arc(channel, self.handler.clone())
    }

    /// Registers `channel` under a different handler.
    pub fn register_with(&self, channel: Channel, handler: impl Handler) -> Result<()> {
        self.handle.register_channel(channel, handler)
    }

    /// Requests a new interest set for the current channel.
    ///
    /// Queued and applied by the loop thread before its next blocking wait.
    pub fn set_interest(&self, interest: Ready) -> Result<()> {
        self.handle.set_interest(self.token, interest)
    }

    /// Requests closure of the current channel.
    ///
    /// Equivalent to calling [`Channel::close`] on the channel itself: the
    /// reactor deregisters the channel atomically with the closure and it
    /// never appears in a readiness report again.
    pub fn close(&self) -> Result<()> {
        self.handle.close_channel(self.token)
    }
}

impl fmt::Debug for Context<'_> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Context").field("token", &self.token).finish()
    }
}
