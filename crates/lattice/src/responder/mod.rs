// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stateless authenticated UDP echo responder.
//!
//! Single-threaded, event-driven: one socket, blocking reads with a short
//! timeout so the loop can sweep idle rate-limit buckets and observe the stop
//! flag while the wire is quiet. The only state beyond the socket is the
//! per-source bucket map.
//!
//! Control flow per datagram: length check, magic check, per-source token
//! bucket, tag check, 1:1 echo. Every rejection is a silent drop; per-packet
//! errors never terminate the listener.

mod limiter;

pub use limiter::SourceLimiter;

use crate::config::{MAGIC, PACKET_LEN};
use crate::error::{Error, Result};
use crate::wire::{validate_packet, Verdict};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Socket send/receive buffer size.
const SOCKET_BUF_BYTES: usize = 1 << 20;

/// Read timeout so the idle loop still sweeps buckets and sees shutdown.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Monotonic drop/echo counters, shared with observers.
#[derive(Debug, Default)]
pub struct ResponderStats {
    pub received: AtomicU64,
    pub dropped_length: AtomicU64,
    pub dropped_magic: AtomicU64,
    pub dropped_rate: AtomicU64,
    pub dropped_tag: AtomicU64,
    pub echoed: AtomicU64,
}

/// Point-in-time copy of [`ResponderStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub dropped_length: u64,
    pub dropped_magic: u64,
    pub dropped_rate: u64,
    pub dropped_tag: u64,
    pub echoed: u64,
}

impl ResponderStats {
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dropped_length: self.dropped_length.load(Ordering::Relaxed),
            dropped_magic: self.dropped_magic.load(Ordering::Relaxed),
            dropped_rate: self.dropped_rate.load(Ordering::Relaxed),
            dropped_tag: self.dropped_tag.load(Ordering::Relaxed),
            echoed: self.echoed.load(Ordering::Relaxed),
        }
    }
}

/// The echo responder.
pub struct Responder {
    socket: UdpSocket,
    secret: Vec<u8>,
    limiter: SourceLimiter,
    stats: Arc<ResponderStats>,
    running: Arc<AtomicBool>,
}

impl Responder {
    /// Bind the responder socket with enlarged buffers.
    pub fn bind(addr: SocketAddr, secret: Vec<u8>) -> Result<Self> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| Error::BindFailed(e.to_string()))?;
        sock.set_recv_buffer_size(SOCKET_BUF_BYTES)
            .map_err(|e| Error::BindFailed(e.to_string()))?;
        sock.set_send_buffer_size(SOCKET_BUF_BYTES)
            .map_err(|e| Error::BindFailed(e.to_string()))?;
        sock.bind(&addr.into())
            .map_err(|e| Error::BindFailed(format!("{}: {}", addr, e)))?;

        let socket: UdpSocket = sock.into();
        socket.set_read_timeout(Some(IDLE_POLL))?;

        Ok(Self {
            socket,
            secret,
            limiter: SourceLimiter::new(Instant::now()),
            stats: Arc::new(ResponderStats::default()),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Shared counter handle.
    #[must_use]
    pub fn stats(&self) -> Arc<ResponderStats> {
        Arc::clone(&self.stats)
    }

    /// Flag handle; storing `false` makes [`run`](Self::run) return.
    #[must_use]
    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Bound address (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve until the running flag is cleared.
    pub fn run(&mut self) {
        let mut buf = [0u8; 2048];
        log::info!(
            "[echo] listening on {}/udp",
            self.socket
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".to_string())
        );

        while self.running.load(Ordering::SeqCst) {
            let (len, peer) = match self.socket.recv_from(&mut buf) {
                Ok(pair) => pair,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    self.limiter.maybe_sweep(Instant::now());
                    continue;
                }
                Err(e) => {
                    log::warn!("[echo] recv error: {}", e);
                    continue;
                }
            };

            let now = Instant::now();
            self.stats.received.fetch_add(1, Ordering::Relaxed);
            self.handle_datagram(&buf[..len], peer, now);

            let swept = self.limiter.maybe_sweep(now);
            if swept > 0 {
                log::debug!("[echo] swept {} idle buckets, {} live", swept, self.limiter.len());
            }
        }
        log::info!("[echo] stopped");
    }

    fn handle_datagram(&mut self, msg: &[u8], peer: SocketAddr, now: Instant) {
        if msg.len() != PACKET_LEN {
            self.stats.dropped_length.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if msg[0..4] != MAGIC {
            self.stats.dropped_magic.fetch_add(1, Ordering::Relaxed);
            return;
        }
        // Rate limit before the tag so a flood cannot buy HMAC work.
        if !self.limiter.try_consume(peer.ip(), now) {
            self.stats.dropped_rate.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match validate_packet(msg, &self.secret) {
            Verdict::Accept => {}
            _ => {
                self.stats.dropped_tag.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        // Echo the exact received bytes: never an amplifier.
        match self.socket.send_to(msg, peer) {
            Ok(_) => {
                self.stats.echoed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                log::warn!("[echo] send to {} failed: {}", peer, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::encode_packet;
    use std::thread;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn spawn_responder() -> (SocketAddr, Arc<ResponderStats>, Arc<AtomicBool>) {
        let addr: SocketAddr = "127.0.0.1:0".parse().expect("literal addr");
        let mut responder =
            Responder::bind(addr, SECRET.to_vec()).expect("bind on loopback should succeed");
        let bound = responder.local_addr().expect("bound socket has an address");
        let stats = responder.stats();
        let running = responder.running();
        thread::spawn(move || responder.run());
        (bound, stats, running)
    }

    fn client_socket() -> UdpSocket {
        let sock = UdpSocket::bind("127.0.0.1:0").expect("client bind");
        sock.set_read_timeout(Some(Duration::from_millis(300)))
            .expect("set timeout");
        sock
    }

    #[test]
    fn test_valid_packet_is_echoed_byte_for_byte() {
        let (addr, stats, running) = spawn_responder();
        let sock = client_socket();

        let pkt = encode_packet(3, 1_000, 42, SECRET);
        sock.send_to(&pkt, addr).expect("send");

        let mut buf = [0u8; 64];
        let (n, from) = sock.recv_from(&mut buf).expect("echo should arrive");
        assert_eq!(from, addr);
        assert_eq!(&buf[..n], &pkt[..]);
        // The counter lands just after the send; give it a moment.
        for _ in 0..50 {
            if stats.snapshot().echoed == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(stats.snapshot().echoed, 1);

        running.store(false, Ordering::SeqCst);
    }

    #[test]
    fn test_zeroed_tag_gets_no_reply_and_counts() {
        let (addr, stats, running) = spawn_responder();
        let sock = client_socket();

        let mut pkt = encode_packet(0, 0, 0, SECRET);
        pkt[28..].fill(0);
        sock.send_to(&pkt, addr).expect("send");

        let mut buf = [0u8; 64];
        assert!(sock.recv_from(&mut buf).is_err(), "reflector must stay silent");
        assert_eq!(stats.snapshot().dropped_tag, 1);
        assert_eq!(stats.snapshot().echoed, 0);

        running.store(false, Ordering::SeqCst);
    }

    #[test]
    fn test_short_datagram_and_bad_magic_are_counted() {
        let (addr, stats, running) = spawn_responder();
        let sock = client_socket();

        sock.send_to(b"short", addr).expect("send short");
        let mut bad_magic = encode_packet(0, 0, 0, SECRET);
        bad_magic[0] = b'X';
        sock.send_to(&bad_magic, addr).expect("send bad magic");

        let mut buf = [0u8; 64];
        assert!(sock.recv_from(&mut buf).is_err());
        let snap = stats.snapshot();
        assert_eq!(snap.dropped_length, 1);
        assert_eq!(snap.dropped_magic, 1);

        running.store(false, Ordering::SeqCst);
    }
}
