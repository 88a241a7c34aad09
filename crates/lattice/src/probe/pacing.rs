// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Low-jitter send pacing.
//!
//! `thread::sleep` routinely overshoots by scheduler quanta, which would smear
//! the send schedule. We sleep coarsely to within `spin_us` of the target and
//! busy-spin the rest on the monotonic clock. `spin_us = 0` disables the spin
//! and accepts sleep jitter.

use std::time::{Duration, Instant};

/// Block until `target`, spinning for the final `spin_us` microseconds.
pub fn sleep_until(target: Instant, spin_us: u64) {
    let spin = Duration::from_micros(spin_us);
    loop {
        let now = Instant::now();
        if now >= target {
            return;
        }
        let remaining = target - now;
        if spin_us == 0 || remaining > spin {
            std::thread::sleep(remaining - spin.min(remaining));
        } else {
            while Instant::now() < target {
                std::hint::spin_loop();
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reaches_target_without_spin() {
        let target = Instant::now() + Duration::from_millis(5);
        sleep_until(target, 0);
        assert!(Instant::now() >= target);
    }

    #[test]
    fn test_reaches_target_with_spin() {
        let target = Instant::now() + Duration::from_millis(2);
        sleep_until(target, 200);
        let now = Instant::now();
        assert!(now >= target);
        // Spin should land close to the target, not a quantum past it.
        assert!(now - target < Duration::from_millis(20));
    }

    #[test]
    fn test_past_target_returns_immediately() {
        let target = Instant::now() - Duration::from_millis(1);
        let before = Instant::now();
        sleep_until(target, 200);
        assert!(Instant::now() - before < Duration::from_millis(5));
    }
}
