use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use muxio::{Channel, ChannelKind, Context, Handler, Payload, Reactor, Ready, WorkerPool};

/// One handler instance shared by every channel in the test. Replies with a
/// tag; artificially slow for traffic on one designated port.
struct Service {
    slow_port: u16,
    delay: Duration,
}

impl Handler for Service {
    fn handles(&self) -> Ready {
        Ready::accept() | Ready::readable()
    }

    fn on_read(&self, channel: &mut Channel, _cx: &Context<'_>) {
        let port = channel.local_addr().map(|a| a.port());
        loop {
            match channel.recv() {
                Ok(payload) if payload.data.is_empty() && channel.kind() == ChannelKind::Stream => {
                    channel.close();
                    return;
                }
                Ok(payload) => {
                    if port == Some(self.slow_port) {
                        thread::sleep(self.delay);
                    }
                    let mut out = BytesMut::with_capacity(4 + payload.data.len());
                    out.extend_from_slice(b"ack:");
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

fn bound_udp() -> (Channel, SocketAddr) {
    let mut channel = Channel::udp("127.0.0.1:0".parse().unwrap());
    channel.bind().unwrap();
    let addr = channel.local_addr().unwrap();
    (channel, addr)
}

#[test]
fn one_slow_channel_does_not_starve_the_others() {
    let _ = env_logger::try_init();

    let (slow_listener, slow_addr) = bound_tcp();
    let (fast_listener, fast_addr) = bound_tcp();
    let (udp_channel, udp_addr) = bound_udp();

    let service = Arc::new(Service {
        slow_port: slow_addr.port(),
        delay: Duration::from_millis(1500),
    });

    let mut pool = WorkerPool::builder();
    pool.pool_size(4);
    let mut reactor = Reactor::new(pool.build());
    reactor
        .register_channel(slow_listener, service.clone())
        .unwrap()
        .register_channel(fast_listener, service.clone())
        .unwrap()
        .register_channel(udp_channel, service.clone())
        .unwrap();
    reactor.start().unwrap();

    // Get the slow handler sleeping first.
    let mut slow_client = TcpStream::connect(slow_addr).unwrap();
    slow_client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    slow_client.write_all(b"s").unwrap();
    thread::sleep(Duration::from_millis(100));

    // TCP traffic on the other port is served while the slow handler sleeps.
    let begin = Instant::now();
    let mut fast_client = TcpStream::connect(fast_addr).unwrap();
    fast_client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    fast_client.write_all(b"f").unwrap();
    let mut buf = [0; 5];
    fast_client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ack:f");
    assert!(
        begin.elapsed() < Duration::from_millis(1000),
        "fast channel waited {:?} behind the slow one",
        begin.elapsed()
    );

    // So is the datagram channel, sharing the very same handler instance.
    let udp_client = UdpSocket::bind("127.0.0.1:0").unwrap();
    udp_client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    udp_client.send_to(b"u", udp_addr).unwrap();
    let mut buf = [0; 16];
    let (n, from) = udp_client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ack:u");
    assert_eq!(from, udp_addr);

    // The slow channel itself is delayed, not broken.
    let mut buf = [0; 5];
    slow_client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ack:s");

    reactor.stop().unwrap();
}

#[test]
fn runtime_registration_through_the_handle() {
    let _ = env_logger::try_init();

    let mut reactor = Reactor::new(WorkerPool::new());
    reactor.start().unwrap();
    let handle = reactor.handle().unwrap();

    // Register a channel while the loop is already polling.
    let (listener, addr) = bound_tcp();
    handle
        .register_channel(
            listener,
            Service {
                slow_port: 0,
                delay: Duration::from_millis(0),
            },
        )
        .unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.write_all(b"late").unwrap();
    let mut buf = [0; 8];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ack:late");

    reactor.stop().unwrap();

    // After the loop is gone, handle submissions fail explicitly.
    let (orphan, _) = bound_tcp();
    assert!(handle
        .register_channel(
            orphan,
            Service {
                slow_port: 0,
                delay: Duration::from_millis(0),
            },
        )
        .is_err());
}
