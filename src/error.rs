//! Error types.

use std::io;
use std::net::SocketAddr;

use crate::ready::Ready;

/// A specialized `Result` for reactor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by channel setup and the reactor control plane.
///
/// Per-event runtime failures are deliberately absent: by the time an event
/// fires, the registering caller is long gone, so the loop logs the failure,
/// isolates the affected channel and keeps serving the others. `WouldBlock`
/// is not here either — it is a scheduling signal, not an error, and stays an
/// [`io::ErrorKind::WouldBlock`] on the non-blocking channel primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Binding the channel's socket failed; the address is in use or invalid.
    ///
    /// Fatal to that one channel only. Other registrations are unaffected.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The local address the bind was attempted on.
        addr: SocketAddr,
        /// The underlying socket error.
        source: io::Error,
    },

    /// The channel was registered before it was bound.
    #[error("channel is not bound to a local address")]
    NotBound,

    /// The handler does not service the event kinds the channel will produce.
    #[error("handler does not service {required:?} events (supports {supported:?})")]
    UnsupportedEvents {
        /// The channel's initial interest set.
        required: Ready,
        /// The event kinds the handler declared.
        supported: Ready,
    },

    /// `start` was called on a reactor that already ran.
    #[error("reactor was already started")]
    AlreadyRunning,

    /// A request was submitted after the event loop terminated.
    #[error("reactor is shut down")]
    Shutdown,

    /// The caller waiting for `stop` lost the loop before it acknowledged
    /// termination. The reactor state is undefined; retrying `stop` is the
    /// recommended recovery.
    #[error("interrupted while waiting for the reactor to stop")]
    Interrupted,

    /// An I/O error from the underlying selector.
    #[error(transparent)]
    Io(#[from] io::Error),
}
