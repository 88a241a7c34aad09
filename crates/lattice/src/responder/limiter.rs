// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-source token bucket rate limiter.
//!
//! One bucket per source IP (not ip:port, so a NATed client cannot multiply
//! its budget by rotating ports). Buckets refill continuously at a fixed rate
//! up to a burst capacity; idle buckets are swept on a coarse interval to
//! bound memory.

use crate::config::{BUCKET_CAPACITY, BUCKET_TTL_SECS, PACKET_COST, REFILL_PER_S, SWEEP_EVERY_SECS};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct SourceBucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

/// Rate limiter keyed by source IP.
#[derive(Debug)]
pub struct SourceLimiter {
    buckets: HashMap<IpAddr, SourceBucket>,
    rate_per_s: f64,
    capacity: f64,
    ttl: Duration,
    sweep_every: Duration,
    last_sweep: Instant,
}

impl SourceLimiter {
    /// Limiter with the default responder policy (30/s refill, 60 burst).
    pub fn new(now: Instant) -> Self {
        Self::with_policy(REFILL_PER_S, BUCKET_CAPACITY, now)
    }

    /// Limiter with an explicit refill rate and burst capacity.
    pub fn with_policy(rate_per_s: f64, capacity: f64, now: Instant) -> Self {
        Self {
            buckets: HashMap::new(),
            rate_per_s,
            capacity,
            ttl: Duration::from_secs(BUCKET_TTL_SECS),
            sweep_every: Duration::from_secs(SWEEP_EVERY_SECS),
            last_sweep: now,
        }
    }

    /// Try to consume one packet's cost for `source`.
    ///
    /// A source seen for the first time starts with a full bucket. Returns
    /// `false` (and consumes nothing) when the bucket is short.
    pub fn try_consume(&mut self, source: IpAddr, now: Instant) -> bool {
        let capacity = self.capacity;
        let rate = self.rate_per_s;
        let bucket = self.buckets.entry(source).or_insert_with(|| SourceBucket {
            tokens: capacity,
            last_refill: now,
            last_seen: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        if !elapsed.is_zero() {
            bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * rate).min(capacity);
            bucket.last_refill = now;
        }
        bucket.last_seen = now;

        if bucket.tokens < PACKET_COST {
            return false;
        }
        bucket.tokens -= PACKET_COST;
        true
    }

    /// Sweep idle buckets if the sweep interval has elapsed.
    ///
    /// Returns the number of buckets removed (0 when the interval has not
    /// elapsed yet).
    pub fn maybe_sweep(&mut self, now: Instant) -> usize {
        if now.saturating_duration_since(self.last_sweep) < self.sweep_every
            || self.buckets.is_empty()
        {
            return 0;
        }
        let ttl = self.ttl;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, b| now.saturating_duration_since(b.last_seen) <= ttl);
        self.last_sweep = now;
        before - self.buckets.len()
    }

    /// Number of tracked sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
