//! Non-blocking socket channels.
//!
//! A [`Channel`] wraps one OS socket and never blocks: every read, write and
//! accept either completes immediately or fails with
//! [`io::ErrorKind::WouldBlock`], which tells the caller to give the socket
//! back to the selector and try again on the next readiness report.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

use bytes::{Buf, Bytes};
use log::debug;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Interest, Registry, Token};

use crate::error::{Error, Result};
use crate::ready::Ready;

/// Largest chunk pulled off a socket in one `recv` call. Also covers the
/// maximum UDP datagram size.
const RECV_BUF_SIZE: usize = 64 * 1024;

/// The kind of socket a channel wraps.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelKind {
    /// A listening TCP socket; produces accept events.
    Listener,
    /// A connected TCP stream.
    Stream,
    /// A UDP socket; reads and writes whole datagrams.
    Datagram,
}

/// One unit of inbound or outbound data.
///
/// For stream channels `peer` is `None`: the remote end is fixed by the
/// connection. For datagram channels `peer` carries the sender on receive and
/// selects the destination on send.
#[derive(Clone, Debug)]
pub struct Payload {
    /// The bytes carried.
    pub data: Bytes,
    /// Datagram peer address, if any.
    pub peer: Option<SocketAddr>,
}

impl Payload {
    /// Creates a payload without a peer address.
    pub fn new(data: impl Into<Bytes>) -> Payload {
        Payload {
            data: data.into(),
            peer: None,
        }
    }

    /// Creates a payload addressed to a datagram peer.
    pub fn datagram(data: impl Into<Bytes>, peer: SocketAddr) -> Payload {
        Payload {
            data: data.into(),
            peer: Some(peer),
        }
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Payload {
        Payload::new(data)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Payload {
        Payload::new(data)
    }
}

impl From<&'static [u8]> for Payload {
    fn from(data: &'static [u8]) -> Payload {
        Payload::new(Bytes::from_static(data))
    }
}

impl From<&'static str> for Payload {
    fn from(data: &'static str) -> Payload {
        Payload::new(Bytes::from_static(data.as_bytes()))
    }
}

enum Io {
    Listener(TcpListener),
    Stream(TcpStream),
    Datagram(UdpSocket),
}

/// An abstraction over one non-blocking socket.
///
/// A channel is created unbound, bound with [`bind`], then handed to the
/// reactor at registration. Once registered it is owned by the reactor;
/// handler code receives it back, exclusively, for the duration of each
/// event.
///
/// [`bind`]: Channel::bind
pub struct Channel {
    kind: ChannelKind,
    addr: SocketAddr,
    io: Option<Io>,
    outbox: VecDeque<Payload>,
}

impl Channel {
    /// Creates an unbound TCP listening channel for `addr`.
    pub fn tcp(addr: SocketAddr) -> Channel {
        Channel {
            kind: ChannelKind::Listener,
            addr,
            io: None,
            outbox: VecDeque::new(),
        }
    }

    /// Creates an unbound UDP channel for `addr`.
    pub fn udp(addr: SocketAddr) -> Channel {
        Channel {
            kind: ChannelKind::Datagram,
            addr,
            io: None,
            outbox: VecDeque::new(),
        }
    }

    /// Wraps a stream obtained from `accept`.
    fn accepted(stream: TcpStream, local: SocketAddr) -> Channel {
        Channel {
            kind: ChannelKind::Stream,
            addr: local,
            io: Some(Io::Stream(stream)),
            outbox: VecDeque::new(),
        }
    }

    /// Opens the underlying socket in non-blocking mode.
    ///
    /// A no-op if the channel is already bound. Fails with [`Error::Bind`]
    /// if the address is in use or invalid; the failure is scoped to this
    /// channel.
    pub fn bind(&mut self) -> Result<()> {
        if self.io.is_some() {
            return Ok(());
        }

        let io = match self.kind {
            ChannelKind::Listener => TcpListener::bind(self.addr).map(Io::Listener),
            ChannelKind::Datagram => UdpSocket::bind(self.addr).map(Io::Datagram),
            ChannelKind::Stream => {
                // Streams only come out of `accept`; there is nothing to bind.
                return Err(Error::NotBound);
            }
        };

        let io = io.map_err(|source| Error::Bind {
            addr: self.addr,
            source,
        })?;

        // Re-resolve the address so port 0 reports the assigned port.
        if let Ok(local) = match &io {
            Io::Listener(l) => l.local_addr(),
            Io::Datagram(d) => d.local_addr(),
            Io::Stream(s) => s.local_addr(),
        } {
            self.addr = local;
        }

        self.io = Some(io);
        debug!("bound {:?} channel on {}", self.kind, self.addr);
        Ok(())
    }

    /// Returns the kind of socket this channel wraps.
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Returns true if the channel has an open socket.
    pub fn is_open(&self) -> bool {
        self.io.is_some()
    }

    /// Returns the local address the channel is bound to, if bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        if self.io.is_some() {
            Some(self.addr)
        } else {
            None
        }
    }

    /// Returns the remote address of a connected stream channel.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.io {
            Some(Io::Stream(s)) => s.peer_addr().ok(),
            _ => None,
        }
    }

    /// Returns the event kinds this channel wants watched: accept for
    /// listening channels, read for everything else. Write interest is
    /// managed by the reactor while outbound data is queued.
    pub fn interest(&self) -> Ready {
        match self.kind {
            ChannelKind::Listener => Ready::accept(),
            ChannelKind::Stream | ChannelKind::Datagram => Ready::readable(),
        }
    }

    /// Accepts one pending connection from a listening channel.
    ///
    /// Returns the connected channel, already non-blocking and ready to be
    /// registered with the reactor. Fails with `WouldBlock` when no
    /// connection is pending, which only happens on spurious readiness.
    pub fn accept(&mut self) -> io::Result<Channel> {
        match &self.io {
            Some(Io::Listener(listener)) => {
                let (stream, peer) = listener.accept()?;
                let local = stream.local_addr().unwrap_or(self.addr);
                debug!("accepted connection from {} on {}", peer, local);
                Ok(Channel::accepted(stream, local))
            }
            Some(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "only listening channels accept connections",
            )),
            None => Err(closed()),
        }
    }

    /// Receives whatever the socket has available, without blocking.
    ///
    /// For stream channels an empty payload means the peer closed the
    /// connection. Fails with `WouldBlock` when nothing is available; that is
    /// the signal to return and wait for the next readiness report.
    pub fn recv(&mut self) -> io::Result<Payload> {
        let mut buf = vec![0; RECV_BUF_SIZE];
        match &mut self.io {
            Some(Io::Stream(stream)) => {
                let n = stream.read(&mut buf)?;
                buf.truncate(n);
                Ok(Payload::new(buf))
            }
            Some(Io::Datagram(socket)) => {
                let (n, peer) = socket.recv_from(&mut buf)?;
                buf.truncate(n);
                Ok(Payload::datagram(buf, peer))
            }
            Some(Io::Listener(_)) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "listening channels cannot be read",
            )),
            None => Err(closed()),
        }
    }

    /// Writes directly to the socket, without blocking.
    ///
    /// Returns the number of bytes written, which may be less than
    /// `buf.len()` for streams. Most handlers want [`send`] instead, which
    /// queues the data and lets the reactor flush it as the socket allows.
    ///
    /// [`send`]: Channel::send
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.io {
            Some(Io::Stream(stream)) => stream.write(buf),
            Some(Io::Datagram(socket)) => socket.send(buf),
            Some(Io::Listener(_)) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "listening channels cannot be written",
            )),
            None => Err(closed()),
        }
    }

    /// Queues outbound data.
    ///
    /// The reactor enables write interest for the channel after the current
    /// event completes and flushes the queue as the socket becomes writable,
    /// restoring the base interest set once the queue drains.
    pub fn send(&mut self, payload: impl Into<Payload>) {
        self.outbox.push_back(payload.into());
    }

    /// Returns true if queued outbound data is waiting to be flushed.
    pub fn has_queued_writes(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Closes the socket. Idempotent.
    ///
    /// The reactor notices the closure when the current event completes and
    /// removes the channel from its registration table; the channel never
    /// appears in a readiness report again.
    pub fn close(&mut self) {
        if self.io.take().is_some() {
            debug!("closed {:?} channel on {}", self.kind, self.addr);
        }
        self.outbox.clear();
    }

    /// Writes queued payloads until the queue drains or the socket pushes
    /// back. `Ok(true)` means the queue is empty.
    pub(crate) fn flush_outbox(&mut self) -> io::Result<bool> {
        loop {
            let (res, whole) = match self.outbox.front() {
                None => return Ok(true),
                Some(front) => {
                    let res = match (&mut self.io, front.peer) {
                        (Some(Io::Stream(stream)), _) => stream.write(&front.data),
                        (Some(Io::Datagram(socket)), Some(peer)) => {
                            socket.send_to(&front.data, peer)
                        }
                        (Some(Io::Datagram(socket)), None) => socket.send(&front.data),
                        (Some(Io::Listener(_)), _) => Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "listening channels cannot be written",
                        )),
                        (None, _) => Err(closed()),
                    };
                    // Datagrams go out whole; streams may land partially.
                    let whole = match &res {
                        Ok(n) => self.kind == ChannelKind::Datagram || *n >= front.data.len(),
                        Err(_) => false,
                    };
                    (res, whole)
                }
            };

            match res {
                Ok(_) if whole => {
                    self.outbox.pop_front();
                }
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    if let Some(front) = self.outbox.front_mut() {
                        front.data.advance(n);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
    }

    /// Registers the socket with the selector. Loop thread only.
    pub(crate) fn register_source(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let interests = match self.kind {
            ChannelKind::Listener => Interest::READABLE,
            ChannelKind::Stream | ChannelKind::Datagram => {
                Interest::READABLE.add(Interest::WRITABLE)
            }
        };
        match &mut self.io {
            Some(Io::Listener(l)) => registry.register(l, token, interests),
            Some(Io::Stream(s)) => registry.register(s, token, interests),
            Some(Io::Datagram(d)) => registry.register(d, token, interests),
            None => Err(closed()),
        }
    }

    /// Removes the socket from the selector. Loop thread only.
    pub(crate) fn deregister_source(&mut self, registry: &Registry) -> io::Result<()> {
        match &mut self.io {
            Some(Io::Listener(l)) => registry.deregister(l),
            Some(Io::Stream(s)) => registry.deregister(s),
            Some(Io::Datagram(d)) => registry.deregister(d),
            None => Err(closed()),
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Channel")
            .field("kind", &self.kind)
            .field("addr", &self.addr)
            .field("open", &self.io.is_some())
            .field("queued_writes", &self.outbox.len())
            .finish()
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "channel is closed")
}
