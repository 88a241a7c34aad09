// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Clock access.
//!
//! RTT measurement uses the monotonic clock only; wall-clock time is reserved
//! for record timestamps and log-age display. The raw nanosecond readings
//! exist to correlate kernel receive timestamps, which arrive on either the
//! realtime or the monotonic timescale depending on platform configuration.

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock time as unix milliseconds. Used for record timestamps only.
#[must_use]
pub fn now_unix_ms() -> i64 {
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (dur.as_secs() as i64) * 1000 + i64::from(dur.subsec_millis())
}

/// `CLOCK_REALTIME` in nanoseconds; 0 on failure.
#[cfg(unix)]
#[must_use]
pub fn realtime_now_ns() -> u64 {
    clock_ns(libc::CLOCK_REALTIME)
}

/// `CLOCK_MONOTONIC` in nanoseconds; 0 on failure.
#[cfg(unix)]
#[must_use]
pub fn monotonic_now_ns() -> u64 {
    clock_ns(libc::CLOCK_MONOTONIC)
}

#[cfg(unix)]
fn clock_ns(clock: libc::clockid_t) -> u64 {
    // SAFETY: clock_gettime writes into the zeroed timespec; both clock ids
    // are valid on every supported unix.
    unsafe {
        let mut ts: libc::timespec = std::mem::zeroed();
        if libc::clock_gettime(clock, &mut ts) != 0 {
            return 0;
        }
        (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
    }
}

#[cfg(not(unix))]
#[must_use]
pub fn realtime_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(not(unix))]
#[must_use]
pub fn monotonic_now_ns() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
