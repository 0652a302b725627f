use std::io::{ErrorKind, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use muxio::{Channel, Context, Handler, Reactor, Ready, WorkerPool};

/// Detects overlapping invocations for the channel it serves and counts the
/// bytes delivered.
struct Probe {
    busy: AtomicBool,
    overlaps: AtomicUsize,
    bytes: AtomicUsize,
}

impl Probe {
    fn new() -> Probe {
        Probe {
            busy: AtomicBool::new(false),
            overlaps: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
        }
    }
}

impl Handler for Probe {
    fn handles(&self) -> Ready {
        Ready::accept() | Ready::readable()
    }

    fn on_read(&self, channel: &mut Channel, _cx: &Context<'_>) {
        if self.busy.swap(true, SeqCst) {
            self.overlaps.fetch_add(1, SeqCst);
        }

        loop {
            match channel.recv() {
                Ok(payload) if payload.data.is_empty() => {
                    channel.close();
                    break;
                }
                Ok(payload) => {
                    self.bytes.fetch_add(payload.data.len(), SeqCst);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => {
                    channel.close();
                    break;
                }
            }
        }

        // Stay "inside" the invocation long enough for a second concurrent
        // one to trip the detector, were the reactor to allow it.
        thread::sleep(Duration::from_millis(2));
        self.busy.store(false, SeqCst);
    }
}

fn bound_tcp() -> (Channel, SocketAddr) {
    let mut channel = Channel::tcp("127.0.0.1:0".parse().unwrap());
    channel.bind().unwrap();
    let addr = channel.local_addr().unwrap();
    (channel, addr)
}

#[test]
fn reads_for_one_channel_never_run_concurrently() {
    let _ = env_logger::try_init();

    let probe = Arc::new(Probe::new());
    let (listener, addr) = bound_tcp();

    let mut pool = WorkerPool::builder();
    pool.pool_size(4);
    let mut reactor = Reactor::new(pool.build());
    reactor.register_channel(listener, probe.clone()).unwrap();
    reactor.start().unwrap();

    const ROUNDS: usize = 50;
    const CHUNK: &[u8] = b"0123";

    let mut client = TcpStream::connect(addr).unwrap();
    for _ in 0..ROUNDS {
        client.write_all(CHUNK).unwrap();
        // Small gaps make the kernel deliver many separate readiness edges.
        thread::sleep(Duration::from_millis(1));
    }

    // Wait for every byte to arrive, bounded.
    let deadline = Instant::now() + Duration::from_secs(10);
    while probe.bytes.load(SeqCst) < ROUNDS * CHUNK.len() {
        assert!(
            Instant::now() < deadline,
            "only {} of {} bytes delivered",
            probe.bytes.load(SeqCst),
            ROUNDS * CHUNK.len()
        );
        thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(probe.overlaps.load(SeqCst), 0);

    reactor.stop().unwrap();
}
