//! A multi-port logging service on the reactor.
//!
//! Listens for log lines on two TCP ports and one UDP port with a single
//! shared handler, acknowledging each request. Run with
//! `RUST_LOG=info cargo run --example logging`; EOF on stdin stops it.

use std::io::{self, BufRead, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use log::{info, warn};
use muxio::{Channel, ChannelKind, Context, Handler, Payload, Reactor, Ready, WorkerPool};

struct LogHandler;

impl Handler for LogHandler {
    fn handles(&self) -> Ready {
        Ready::accept() | Ready::readable()
    }

    fn on_read(&self, channel: &mut Channel, _cx: &Context<'_>) {
        loop {
            match channel.recv() {
                Ok(payload) if payload.data.is_empty() && channel.kind() == ChannelKind::Stream => {
                    channel.close();
                    return;
                }
                Ok(payload) => {
                    let origin = payload.peer.or_else(|| channel.peer_addr());
                    info!(
                        "{} {}",
                        origin.map_or_else(|| "<unknown>".to_string(), |a| a.to_string()),
                        String::from_utf8_lossy(&payload.data).trim_end()
                    );
                    channel.send(Payload {
                        data: Bytes::from_static(b"ok\n"),
                        peer: payload.peer,
                    });
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("read failed on {:?}: {}", channel.local_addr(), e);
                    channel.close();
                    return;
                }
            }
        }
    }
}

fn main() -> muxio::Result<()> {
    env_logger::init();

    let handler = Arc::new(LogHandler);
    let mut pool = WorkerPool::builder();
    pool.pool_size(2).name_prefix("logging-");

    let mut reactor = Reactor::new(pool.build());
    for port in [6666u16, 6667] {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        let mut channel = Channel::tcp(addr);
        channel.bind()?;
        reactor.register_channel(channel, handler.clone())?;
    }
    let mut datagrams = Channel::udp(([127, 0, 0, 1], 6668).into());
    datagrams.bind()?;
    reactor.register_channel(datagrams, handler.clone())?;

    reactor.start()?;
    println!("logging service on tcp 6666/6667 and udp 6668; EOF on stdin stops it");

    for line in io::stdin().lock().lines() {
        if line.is_err() {
            break;
        }
    }

    reactor.stop()
}
