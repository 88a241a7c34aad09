// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Path monitoring: outgoing-interface classification and tunnel snapshots.
//!
//! A single observer thread refreshes a [`TunnelSnapshot`] behind an
//! `ArcSwap`; probe workers read it atomically and never take a lock across
//! a burst.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Classification of the interface a probe leaves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfaceClass {
    Wifi,
    Ethernet,
    Cellular,
    Loopback,
    Other,
}

impl IfaceClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            IfaceClass::Wifi => "wifi",
            IfaceClass::Ethernet => "ethernet",
            IfaceClass::Cellular => "cellular",
            IfaceClass::Loopback => "loopback",
            IfaceClass::Other => "other",
        }
    }
}

impl fmt::Display for IfaceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tunnel-prefixed interface observed on the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInterface {
    pub name: String,
    pub flags: u32,
    #[serde(default)]
    pub flags_decoded: Vec<String>,
    pub has_non_loopback_addr: bool,
}

/// Tunnel state at one observation point.
///
/// `active` means at least one tunnel interface is up, running, and carries a
/// non-loopback address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelSnapshot {
    pub present: bool,
    pub active: bool,
    pub interfaces: Vec<TunnelInterface>,
}

/// Interface names that indicate a tunnel on the platforms we run on.
#[must_use]
pub fn is_tunnel_name(name: &str) -> bool {
    let n = name.to_ascii_lowercase();
    n.starts_with("utun")
        || n.starts_with("tun")
        || n.starts_with("tap")
        || n.starts_with("wg")
        || n.starts_with("ppp")
        || n.starts_with("ipsec")
}

/// Human-readable subset of `IFF_*` flags, for record notes and debugging.
#[cfg(unix)]
#[must_use]
pub fn decode_if_flags(flags: u32) -> Vec<String> {
    let mut out = Vec::new();
    if flags & (libc::IFF_UP as u32) != 0 {
        out.push("UP".to_string());
    }
    if flags & (libc::IFF_RUNNING as u32) != 0 {
        out.push("RUNNING".to_string());
    }
    if flags & (libc::IFF_LOOPBACK as u32) != 0 {
        out.push("LOOPBACK".to_string());
    }
    if flags & (libc::IFF_POINTOPOINT as u32) != 0 {
        out.push("POINTOPOINT".to_string());
    }
    if flags & (libc::IFF_MULTICAST as u32) != 0 {
        out.push("MULTICAST".to_string());
    }
    out
}

#[cfg(not(unix))]
#[must_use]
pub fn decode_if_flags(_flags: u32) -> Vec<String> {
    Vec::new()
}

// =======================================================================
// Interface classification
// =======================================================================

/// Classify an interface by name.
#[cfg(target_os = "linux")]
#[must_use]
pub fn classify_interface(name: &str) -> IfaceClass {
    use std::path::Path;

    if name == "lo" {
        return IfaceClass::Loopback;
    }
    // Wireless must be checked before the generic ARPHRD type: wifi devices
    // also report type 1 (ether).
    if Path::new("/sys/class/net").join(name).join("wireless").exists() {
        return IfaceClass::Wifi;
    }
    if name.starts_with("ww") || name.starts_with("rmnet") {
        return IfaceClass::Cellular;
    }
    let type_path = Path::new("/sys/class/net").join(name).join("type");
    if let Ok(t) = std::fs::read_to_string(type_path) {
        if t.trim() == "1" {
            return IfaceClass::Ethernet;
        }
    }
    IfaceClass::Other
}

/// Name-heuristic fallback for platforms without `/sys/class/net`.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn classify_interface(name: &str) -> IfaceClass {
    if name.starts_with("lo") {
        IfaceClass::Loopback
    } else if name.starts_with("wl") || name.starts_with("wlan") {
        IfaceClass::Wifi
    } else if name.starts_with("en") || name.starts_with("eth") {
        IfaceClass::Ethernet
    } else if name.starts_with("ww") || name.starts_with("rmnet") {
        IfaceClass::Cellular
    } else {
        IfaceClass::Other
    }
}

// =======================================================================
// getifaddrs walks (unix)
// =======================================================================

#[cfg(unix)]
fn walk_ifaddrs(mut visit: impl FnMut(&libc::ifaddrs)) -> io::Result<()> {
    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: getifaddrs allocates the list on success and freeifaddrs
    // releases it after the walk; entries are only borrowed inside the loop.
    unsafe {
        if libc::getifaddrs(&mut ifap) != 0 {
            return Err(io::Error::last_os_error());
        }
        let mut cur = ifap;
        while !cur.is_null() {
            visit(&*cur);
            cur = (*cur).ifa_next;
        }
        libc::freeifaddrs(ifap);
    }
    Ok(())
}

#[cfg(unix)]
fn ifa_name(ifa: &libc::ifaddrs) -> Option<String> {
    if ifa.ifa_name.is_null() {
        return None;
    }
    // SAFETY: ifa_name is a NUL-terminated C string owned by the list.
    Some(unsafe { std::ffi::CStr::from_ptr(ifa.ifa_name) }
        .to_string_lossy()
        .to_string())
}

#[cfg(unix)]
fn sockaddr_ip(addr: *const libc::sockaddr) -> Option<IpAddr> {
    use std::net::{Ipv4Addr, Ipv6Addr};
    if addr.is_null() {
        return None;
    }
    // SAFETY: sa_family discriminates the concrete sockaddr layout.
    unsafe {
        match i32::from((*addr).sa_family) {
            libc::AF_INET => {
                let sa = *(addr as *const libc::sockaddr_in);
                Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr))))
            }
            libc::AF_INET6 => {
                let sa = *(addr as *const libc::sockaddr_in6);
                Some(IpAddr::V6(Ipv6Addr::from(sa.sin6_addr.s6_addr)))
            }
            _ => None,
        }
    }
}

/// Current tunnel interfaces and their aggregate state.
#[cfg(unix)]
#[must_use]
pub fn tunnel_snapshot() -> TunnelSnapshot {
    use std::collections::HashMap;

    let mut map: HashMap<String, TunnelInterface> = HashMap::new();
    let walk = walk_ifaddrs(|ifa| {
        let Some(name) = ifa_name(ifa) else { return };
        if !is_tunnel_name(&name) {
            return;
        }
        let flags = ifa.ifa_flags as u32;
        let non_loopback = sockaddr_ip(ifa.ifa_addr)
            .map(|ip| !ip.is_loopback())
            .unwrap_or(false);
        let entry = map.entry(name.clone()).or_insert(TunnelInterface {
            name,
            flags,
            flags_decoded: Vec::new(),
            has_non_loopback_addr: false,
        });
        entry.flags = flags;
        entry.has_non_loopback_addr |= non_loopback;
    });
    if walk.is_err() {
        return TunnelSnapshot::default();
    }

    let mut interfaces: Vec<TunnelInterface> = map
        .into_values()
        .map(|mut i| {
            i.flags_decoded = decode_if_flags(i.flags);
            i
        })
        .collect();
    interfaces.sort_by(|a, b| a.name.cmp(&b.name));

    let active = interfaces.iter().any(|i| {
        i.flags & (libc::IFF_UP as u32) != 0
            && i.flags & (libc::IFF_RUNNING as u32) != 0
            && i.has_non_loopback_addr
    });
    TunnelSnapshot {
        present: !interfaces.is_empty(),
        active,
        interfaces,
    }
}

#[cfg(not(unix))]
#[must_use]
pub fn tunnel_snapshot() -> TunnelSnapshot {
    TunnelSnapshot::default()
}

/// Addresses assigned to a named interface.
#[cfg(unix)]
pub fn interface_ips(name: &str) -> io::Result<Vec<IpAddr>> {
    let mut out = Vec::new();
    walk_ifaddrs(|ifa| {
        if ifa_name(ifa).as_deref() == Some(name) {
            if let Some(ip) = sockaddr_ip(ifa.ifa_addr) {
                out.push(ip);
            }
        }
    })?;
    Ok(out)
}

#[cfg(not(unix))]
pub fn interface_ips(_name: &str) -> io::Result<Vec<IpAddr>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "interface enumeration not supported on this platform",
    ))
}

/// Name of the interface carrying `ip`, if any.
#[cfg(unix)]
#[must_use]
pub fn interface_for_ip(ip: IpAddr) -> Option<String> {
    let mut found = None;
    let _ = walk_ifaddrs(|ifa| {
        if found.is_some() {
            return;
        }
        if sockaddr_ip(ifa.ifa_addr) == Some(ip) {
            found = ifa_name(ifa);
        }
    });
    found
}

#[cfg(not(unix))]
#[must_use]
pub fn interface_for_ip(_ip: IpAddr) -> Option<String> {
    None
}

// =======================================================================
// Observer
// =======================================================================

/// Cloneable read handle onto the observer's latest snapshot.
#[derive(Clone)]
pub struct PathWatch(Arc<ArcSwap<TunnelSnapshot>>);

impl PathWatch {
    /// Atomic read of the latest snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<TunnelSnapshot> {
        self.0.load_full()
    }
}

/// Background observer maintaining an atomically readable tunnel snapshot.
pub struct PathMonitor {
    snapshot: Arc<ArcSwap<TunnelSnapshot>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PathMonitor {
    /// Take an initial snapshot and start refreshing every `refresh`.
    #[must_use]
    pub fn start(refresh: Duration) -> Self {
        let snapshot = Arc::new(ArcSwap::from_pointee(tunnel_snapshot()));
        let running = Arc::new(AtomicBool::new(true));

        let snap = Arc::clone(&snapshot);
        let run = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("lattice-pathmon".to_string())
            .spawn(move || {
                while run.load(Ordering::SeqCst) {
                    thread::sleep(refresh);
                    if !run.load(Ordering::SeqCst) {
                        break;
                    }
                    let next = tunnel_snapshot();
                    if *snap.load_full() != next {
                        log::debug!(
                            "[pathmon] tunnel state changed: present={} active={}",
                            next.present,
                            next.active
                        );
                    }
                    snap.store(Arc::new(next));
                }
            })
            .ok();

        Self {
            snapshot,
            running,
            handle,
        }
    }

    /// Atomic read of the latest snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<TunnelSnapshot> {
        self.snapshot.load_full()
    }

    /// Read handle that outlives borrows of the monitor itself.
    #[must_use]
    pub fn watch(&self) -> PathWatch {
        PathWatch(Arc::clone(&self.snapshot))
    }

    /// Stop the observer and join it.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PathMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
