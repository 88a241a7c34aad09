// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # LATTICE - consent-based latency measurement
//!
//! LATTICE emits authenticated UDP probes from a client to a set of
//! geographically tagged echo endpoints, records per-burst round-trip
//! statistics, and analyzes them offline to falsify a claimed egress region
//! (the speed of light upper-bounds the physical origin) or to estimate a
//! coarse origin by weighted least squares over multiple endpoints.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |  tools: lattice-client | lattice-server | lattice-analyze    |
//! +--------------------------------------------------------------+
//! |  session: window state, marker, auto-baseline, calib worker  |
//! +--------------------------------------------------------------+
//! |  analyze: bounds | claims | grid estimate | calibrate | base |
//! |  health:  completeness | hygiene | log-reset watch           |
//! +--------------------------------------------------------------+
//! |  probe: targets -> paced bursts -> summaries   record: JSONL |
//! |  responder: token-bucket authenticated 1:1 echo              |
//! +--------------------------------------------------------------+
//! |  wire: 32-byte packet, truncated HMAC-SHA256 tag             |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use lattice::config::Config;
//! use lattice::record::RecordSink;
//! use lattice::probe::ProbeEngine;
//! use std::sync::Arc;
//!
//! fn main() -> lattice::Result<()> {
//!     let cfg = Config::load("lattice.json")?;
//!     let secret = lattice::secret::from_hex(&cfg.secret_hex)?;
//!     let sink = RecordSink::open(&cfg.output_path)?;
//!     let engine = ProbeEngine::start(Arc::new(cfg), Arc::new(secret), sink.sender());
//!     // ... run until shutdown, then:
//!     drop(engine);
//!     sink.close();
//!     Ok(())
//! }
//! ```
//!
//! Probes are fixed-size and authenticated; the responder echoes request
//! bytes 1:1 behind a per-source token bucket, so it can never amplify.

/// Offline analysis: physics bounds, claims, estimation, calibration.
pub mod analyze;
/// Monotonic/realtime/wall clock access.
pub mod clock;
/// Constants and the configuration document.
pub mod config;
/// Crate-wide error type.
pub mod error;
/// Endpoint health, config hygiene, and log-reset detection.
pub mod health;
/// Probe engine: bursts, pacing, path monitoring.
pub mod probe;
/// Burst records and the JSONL sink.
pub mod record;
/// Authenticated UDP echo responder.
pub mod responder;
/// Shared-secret sourcing.
pub mod secret;
/// Dashboard-facing session state and calibration worker.
pub mod session;
/// Probe packet codec.
pub mod wire;

pub use config::Config;
pub use error::{Error, Result};
