// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-endpoint UDP probe socket.
//!
//! One connected socket per `(path, endpoint)`, optionally bound to a local
//! address to pin the route. On Linux the socket requests `SO_TIMESTAMPNS`
//! receive timestamps so RTT excludes local scheduling delay; elsewhere (or
//! when the kernel declines) the application-level receive time is used.

use crate::clock::{monotonic_now_ns, realtime_now_ns};
use crate::config::{MAX_PLAUSIBLE_RTT_MS, PACKET_LEN, RX_TIMESTAMP_TRUST_NS};
use crate::probe::netmon::interface_for_ip;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

#[cfg(target_os = "linux")]
#[repr(align(8))]
struct CmsgBuf([u8; 256]);

pub struct UdpProber {
    socket: UdpSocket,
    kernel_ts: bool,
    recv_buf: [u8; 2048],
    #[cfg(target_os = "linux")]
    cmsg_buf: CmsgBuf,
}

impl UdpProber {
    /// Resolve `host:port`, bind to `bind_ip` when given, and connect.
    pub fn connect(host: &str, port: u16, bind_ip: Option<IpAddr>) -> io::Result<Self> {
        let addr = resolve_for_family(host, port, bind_ip)?;
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if let Some(ip) = bind_ip {
            socket.bind(&SocketAddr::new(ip, 0).into())?;
        }
        socket.connect(&addr.into())?;

        let socket: UdpSocket = socket.into();
        let kernel_ts = enable_rx_timestamps(&socket);
        if !kernel_ts {
            log::debug!("[probe] kernel rx timestamps unavailable for {}:{}", host, port);
        }

        Ok(Self {
            socket,
            kernel_ts,
            recv_buf: [0u8; 2048],
            #[cfg(target_os = "linux")]
            cmsg_buf: CmsgBuf([0u8; 256]),
        })
    }

    /// Send one probe and wait up to `timeout` for its echo.
    ///
    /// A matching echo is a datagram byte-identical to `msg`; anything else is
    /// discarded and the wait continues on the remaining budget. Returns
    /// `Ok(None)` on timeout.
    pub fn exchange(
        &mut self,
        msg: &[u8; PACKET_LEN],
        send_realtime_ns: u64,
        send_mono_ns: u64,
        timeout: Duration,
    ) -> io::Result<Option<f64>> {
        let send_instant = Instant::now();
        self.socket.send(msg)?;
        let deadline = send_instant + timeout;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.socket.set_read_timeout(Some(deadline - now))?;

            let (n, kernel_ns) = match self.recv_once() {
                Ok(pair) => pair,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            if n != msg.len() || self.recv_buf[..n] != msg[..] {
                continue;
            }

            let fallback_ms = (Instant::now() - send_instant).as_secs_f64() * 1_000.0;
            let rtt_ms = kernel_ns
                .and_then(|ns| kernel_rtt_ms(ns, send_realtime_ns, send_mono_ns))
                .unwrap_or(fallback_ms);
            return Ok(Some(rtt_ms));
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Name of the interface that owns the socket's local address.
    #[must_use]
    pub fn interface_name(&self) -> Option<String> {
        self.local_addr().ok().and_then(|a| interface_for_ip(a.ip()))
    }

    #[must_use]
    pub fn has_kernel_timestamps(&self) -> bool {
        self.kernel_ts
    }

    #[cfg(target_os = "linux")]
    fn recv_once(&mut self) -> io::Result<(usize, Option<u64>)> {
        use std::os::unix::io::AsRawFd;

        let mut iov = libc::iovec {
            iov_base: self.recv_buf.as_mut_ptr().cast(),
            iov_len: self.recv_buf.len(),
        };
        // SAFETY: msghdr points at live buffers for the duration of the call;
        // recvmsg fills iov and the control region, reporting actual lengths.
        unsafe {
            let mut hdr: libc::msghdr = std::mem::zeroed();
            hdr.msg_iov = &mut iov;
            hdr.msg_iovlen = 1;
            hdr.msg_control = self.cmsg_buf.0.as_mut_ptr().cast();
            hdr.msg_controllen = self.cmsg_buf.0.len() as _;

            let n = libc::recvmsg(self.socket.as_raw_fd(), &mut hdr, 0);
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok((n as usize, scm_timestamp_ns(&hdr)))
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn recv_once(&mut self) -> io::Result<(usize, Option<u64>)> {
        let n = self.socket.recv(&mut self.recv_buf)?;
        Ok((n, None))
    }
}

/// A kernel receive timestamp is only usable if we can tell which clock it is
/// on. Accept it when it lands within [`RX_TIMESTAMP_TRUST_NS`] of the current
/// realtime or monotonic reading, subtract the matching send time, and discard
/// implausible results.
fn kernel_rtt_ms(recv_ns: u64, send_realtime_ns: u64, send_mono_ns: u64) -> Option<f64> {
    let now_realtime = realtime_now_ns();
    if now_realtime > 0 && recv_ns.abs_diff(now_realtime) <= RX_TIMESTAMP_TRUST_NS {
        let rtt_ms = recv_ns.saturating_sub(send_realtime_ns) as f64 / 1_000_000.0;
        if rtt_ms.is_finite() && rtt_ms <= MAX_PLAUSIBLE_RTT_MS {
            return Some(rtt_ms);
        }
    }
    let now_mono = monotonic_now_ns();
    if now_mono > 0 && recv_ns.abs_diff(now_mono) <= RX_TIMESTAMP_TRUST_NS {
        let rtt_ms = recv_ns.saturating_sub(send_mono_ns) as f64 / 1_000_000.0;
        if rtt_ms.is_finite() && rtt_ms <= MAX_PLAUSIBLE_RTT_MS {
            return Some(rtt_ms);
        }
    }
    None
}

/// Resolve the destination, preferring the address family of `bind_ip` so a
/// bound socket never connects across families.
fn resolve_for_family(host: &str, port: u16, bind_ip: Option<IpAddr>) -> io::Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    if let Some(ip) = bind_ip {
        return addrs
            .into_iter()
            .find(|a| a.is_ipv4() == ip.is_ipv4())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    "no resolved address matches the bind address family",
                )
            });
    }
    addrs
        .into_iter()
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses"))
}

#[cfg(target_os = "linux")]
fn enable_rx_timestamps(socket: &UdpSocket) -> bool {
    use std::os::unix::io::AsRawFd;

    let on: libc::c_int = 1;
    // SAFETY: setsockopt FFI with a valid fd, a standard socket option, and a
    // correctly sized optval pointer.
    let rv = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_TIMESTAMPNS,
            (&on as *const libc::c_int).cast(),
            std::mem::size_of_val(&on) as libc::socklen_t,
        )
    };
    rv == 0
}

#[cfg(not(target_os = "linux"))]
fn enable_rx_timestamps(_socket: &UdpSocket) -> bool {
    false
}

/// Walk the control messages for `SCM_TIMESTAMPNS`.
///
/// # Safety
///
/// `hdr` must describe a control buffer just filled by `recvmsg`.
#[cfg(target_os = "linux")]
unsafe fn scm_timestamp_ns(hdr: &libc::msghdr) -> Option<u64> {
    let mut cmsg = libc::CMSG_FIRSTHDR(hdr);
    while !cmsg.is_null() {
        if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_TIMESTAMPNS {
            let data = libc::CMSG_DATA(cmsg) as *const libc::timespec;
            if !data.is_null() {
                let ts = *data;
                return Some((ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64));
            }
        }
        cmsg = libc::CMSG_NXTHDR(hdr, cmsg);
    }
    None
}
