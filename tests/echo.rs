use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use bytes::BytesMut;
use muxio::{Channel, Context, Handler, Payload, Reactor, Ready, WorkerPool};

/// Echoes everything back prefixed with a fixed tag.
struct Tag(&'static str);

impl Handler for Tag {
    fn handles(&self) -> Ready {
        Ready::accept() | Ready::readable()
    }

    fn on_read(&self, channel: &mut Channel, _cx: &Context<'_>) {
        loop {
            match channel.recv() {
                Ok(payload) if payload.data.is_empty() => {
                    channel.close();
                    return;
                }
                Ok(payload) => {
                    let mut out = BytesMut::with_capacity(self.0.len() + payload.data.len());
                    out.extend_from_slice(self.0.as_bytes());
                    out.extend_from_slice(&payload.data);
                    channel.send(Payload {
                        data: out.freeze(),
                        peer: payload.peer,
                    });
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(_) => {
                    channel.close();
                    return;
                }
            }
        }
    }
}

fn bound_tcp() -> (Channel, SocketAddr) {
    let mut channel = Channel::tcp("127.0.0.1:0".parse().unwrap());
    channel.bind().unwrap();
    let addr = channel.local_addr().unwrap();
    (channel, addr)
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

#[test]
fn tagged_echo_round_trip() {
    let _ = env_logger::try_init();

    let (listener, addr) = bound_tcp();
    let mut reactor = Reactor::new(WorkerPool::new());
    reactor.register_channel(listener, Tag("TAG:")).unwrap();
    reactor.start().unwrap();

    let mut client = connect(addr);
    client.write_all(b"hello").unwrap();

    let mut buf = [0; 9];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"TAG:hello");

    reactor.stop().unwrap();
}

#[test]
fn clients_are_isolated() {
    let _ = env_logger::try_init();

    let (listener, addr) = bound_tcp();
    let mut reactor = Reactor::new(WorkerPool::new());
    reactor.register_channel(listener, Tag("T:")).unwrap();
    reactor.start().unwrap();

    let mut alpha = connect(addr);
    let mut beta = connect(addr);

    alpha.write_all(b"alpha").unwrap();
    beta.write_all(b"beta").unwrap();

    // Each client gets its own reply, unaffected by the other connection.
    let mut buf = [0; 7];
    alpha.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"T:alpha");

    let mut buf = [0; 6];
    beta.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"T:beta");

    reactor.stop().unwrap();
}

#[test]
fn listener_keeps_accepting_after_a_connection() {
    let _ = env_logger::try_init();

    let (listener, addr) = bound_tcp();
    let mut reactor = Reactor::new(WorkerPool::new());
    reactor.register_channel(listener, Tag("ok:")).unwrap();
    reactor.start().unwrap();

    // Accept readiness is not consumed by one connection: connect several
    // times in sequence and make sure each one is served.
    for round in 0..5 {
        let mut client = connect(addr);
        client.write_all(b"x").unwrap();
        let mut buf = [0; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ok:x", "round {}", round);
    }

    reactor.stop().unwrap();
}
