// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! LATTICE global configuration - single source of truth.
//!
//! This module centralizes the wire, responder, probe, and analyzer constants
//! plus the on-disk configuration document. **Never hardcode these elsewhere.**

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

// =======================================================================
// Wire protocol
// =======================================================================

/// Fixed datagram length. Anything else is discarded unread.
pub const PACKET_LEN: usize = 32;

/// Leading magic: `LATO`.
pub const MAGIC: [u8; 4] = *b"LATO";

/// Wire version written into every packet. Read but not enforced on receive.
pub const WIRE_VERSION: u32 = 1;

/// Truncated HMAC-SHA256 tag length.
pub const TAG_LEN: usize = 4;

/// Bytes covered by the tag (everything before it).
pub const TAGGED_PREFIX_LEN: usize = PACKET_LEN - TAG_LEN;

/// Minimum shared-secret length in bytes.
pub const MIN_SECRET_LEN: usize = 16;

/// Default responder port.
pub const DEFAULT_PORT: u16 = 9000;

// =======================================================================
// Responder rate limiting (per source IP, not ip:port)
// =======================================================================

/// Token refill rate per second.
pub const REFILL_PER_S: f64 = 30.0;

/// Burst capacity of a source bucket.
pub const BUCKET_CAPACITY: f64 = 60.0;

/// Tokens consumed per echoed packet.
pub const PACKET_COST: f64 = 1.0;

/// Idle time after which a bucket is eligible for sweeping.
pub const BUCKET_TTL_SECS: u64 = 120;

/// Coarse sweep interval for idle buckets.
pub const SWEEP_EVERY_SECS: u64 = 30;

// =======================================================================
// Probe engine
// =======================================================================

/// Default busy-spin window before each scheduled send, in microseconds.
pub const DEFAULT_PACING_SPIN_US: u64 = 200;

/// Consecutive all-loss bursts before the worker rebuilds its socket.
pub const RECONNECT_EMPTY_BURSTS: usize = 2;

/// Bursts between periodic socket rebuilds (route changes, DNS moves).
pub const RECONNECT_INTERVAL_BURSTS: usize = 6;

/// A kernel receive timestamp is trusted only within this window of the
/// matching clock; outside it the application-level fallback is used.
pub const RX_TIMESTAMP_TRUST_NS: u64 = 5_000_000_000;

/// RTTs above this are discarded as clock artifacts.
pub const MAX_PLAUSIBLE_RTT_MS: f64 = 60_000.0;

// =======================================================================
// Analyzer physics and fitting
// =======================================================================

/// Effective signal speed in fiber, km/s (roughly 2/3 of c in vacuum).
pub const DEFAULT_SPEED_KM_S: f64 = 200_000.0;

/// Default routing-stretch factor applied on top of the fiber speed.
/// 1.0 yields the most conservative falsification.
pub const DEFAULT_PATH_STRETCH: f64 = 1.1;

/// RTT covers the path twice.
pub const RTT_FACTOR: f64 = 2.0;

pub const MS_PER_SEC: f64 = 1_000.0;
pub const MS_PER_MIN: f64 = 60_000.0;

/// Mean earth radius for great-circle distances.
pub const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Coarse grid step for the global search pass, degrees.
pub const DEFAULT_GRID_DEG: f64 = 1.0;

/// Fine grid step for the refinement pass, degrees.
pub const DEFAULT_REFINE_DEG: f64 = 0.1;

/// Refinement window = `max(grid, refine * REFINE_WINDOW_MULT)`.
pub const REFINE_WINDOW_MULT: f64 = 30.0;

/// Default half-width of the band scan around the best cell, degrees.
pub const DEFAULT_BAND_WINDOW_DEG: f64 = 3.0;

/// SSE multiplier bounding the tight uncertainty band.
pub const DEFAULT_BAND_FACTOR_TIGHT: f64 = 1.5;

/// SSE multiplier bounding the loose uncertainty band.
pub const DEFAULT_BAND_FACTOR_LOOSE: f64 = 4.0;

/// Guard so a zero-SSE best cell still admits its own cell into the band.
pub const SSE_EPSILON: f64 = 1e-9;

/// Floor for jitter-based weights, ms.
pub const MIN_JITTER_MS: f64 = 1.0;

/// Grid latitudes are clamped to +/- this; poles carry no routes.
pub const WORLD_LAT_MAX: f64 = 85.0;
pub const WORLD_LON_MAX: f64 = 180.0;

// =======================================================================
// Calibration
// =======================================================================

/// Median absolute drift at which the calibration is flagged stale.
pub const CALIB_DRIFT_WARN_MS: f64 = 5.0;

// =======================================================================
// Session windows
// =======================================================================

/// Default sliding analysis window, minutes.
pub const DEFAULT_WINDOW_MINUTES: f64 = 30.0;

/// Default auto-baseline capture length, minutes.
pub const DEFAULT_AUTO_BASELINE_MINUTES: f64 = 5.0;

// =======================================================================
// Configuration document
// =======================================================================

/// A geographically tagged echo endpoint. Immutable once loaded; a config
/// reload produces a new set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub region_hint: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
}

/// A local binding used to duplicate probes across network routes
/// (e.g. VPN vs direct). Endpoints are duplicated once per path under the
/// key `<endpointId>@<pathId>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbePath {
    pub id: String,
    #[serde(default)]
    pub bind_interface: Option<String>,
    #[serde(default)]
    pub bind_ip: Option<String>,
}

/// The client configuration document (JSON, camelCase keys).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub secret_hex: String,
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub probe_paths: Vec<ProbePath>,
    pub samples_per_endpoint: usize,
    pub spacing_ms: u64,
    pub timeout_ms: u64,
    pub interval_seconds: u64,
    #[serde(default = "default_pacing_spin_us")]
    pub pacing_spin_us: u64,
    pub output_path: String,
    #[serde(default)]
    pub claimed_egress_region: Option<String>,
    pub physics_mismatch_threshold_ms: f64,
}

fn default_pacing_spin_us() -> u64 {
    DEFAULT_PACING_SPIN_US
}

impl Config {
    /// Load and validate a configuration document.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read(path)?;
        let cfg: Config = serde_json::from_slice(&data)
            .map_err(|e| Error::ConfigInvalid(vec![format!("not valid JSON: {}", e)]))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the document, collecting every per-field error before failing.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.endpoints.is_empty() {
            problems.push("endpoints must not be empty".to_string());
        }
        let mut seen_ids = std::collections::HashSet::new();
        for ep in &self.endpoints {
            if ep.id.trim().is_empty() {
                problems.push("endpoints entries must include a non-empty id".to_string());
            } else if !seen_ids.insert(ep.id.as_str()) {
                problems.push(format!("duplicate endpoint id: {}", ep.id));
            }
            if ep.host.trim().is_empty() {
                problems.push(format!("endpoint {}: host must not be empty", ep.id));
            }
            if ep.port == 0 {
                problems.push(format!("endpoint {}: port must be > 0", ep.id));
            }
            if let Some(lat) = ep.lat {
                if !(-90.0..=90.0).contains(&lat) {
                    problems.push(format!("endpoint {}: lat out of range", ep.id));
                }
            }
            if let Some(lon) = ep.lon {
                if !(-180.0..=180.0).contains(&lon) {
                    problems.push(format!("endpoint {}: lon out of range", ep.id));
                }
            }
        }
        let mut seen_paths = std::collections::HashSet::new();
        for path in &self.probe_paths {
            if path.id.trim().is_empty() {
                problems.push("probePaths entries must include a non-empty id".to_string());
            } else if !seen_paths.insert(path.id.as_str()) {
                problems.push(format!("duplicate probe path id: {}", path.id));
            }
        }
        if self.samples_per_endpoint == 0 {
            problems.push("samplesPerEndpoint must be > 0".to_string());
        }
        if self.timeout_ms == 0 {
            problems.push("timeoutMs must be > 0".to_string());
        }
        if self.interval_seconds == 0 {
            problems.push("intervalSeconds must be > 0".to_string());
        }
        if self.output_path.trim().is_empty() {
            problems.push("outputPath must not be empty".to_string());
        }
        if !self.physics_mismatch_threshold_ms.is_finite()
            || self.physics_mismatch_threshold_ms < 0.0
        {
            problems.push("physicsMismatchThresholdMs must be finite and >= 0".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::ConfigInvalid(problems))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            secret_hex: "00112233445566778899aabbccddeeff".to_string(),
            endpoints: vec![Endpoint {
                id: "local".to_string(),
                host: "127.0.0.1".to_string(),
                port: DEFAULT_PORT,
                region_hint: None,
                lat: None,
                lon: None,
            }],
            probe_paths: Vec::new(),
            samples_per_endpoint: 5,
            spacing_ms: 10,
            timeout_ms: 200,
            interval_seconds: 10,
            pacing_spin_us: 0,
            output_path: "out.jsonl".to_string(),
            claimed_egress_region: None,
            physics_mismatch_threshold_ms: 30.0,
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validation_collects_all_problems() {
        let mut cfg = valid_config();
        cfg.endpoints.clear();
        cfg.samples_per_endpoint = 0;
        cfg.timeout_ms = 0;

        let err = cfg.validate().expect_err("validation should fail");
        match err {
            Error::ConfigInvalid(problems) => {
                assert_eq!(problems.len(), 3, "problems: {:?}", problems);
            }
            other => panic!("expected ConfigInvalid, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_endpoint_ids_rejected() {
        let mut cfg = valid_config();
        let dup = cfg.endpoints[0].clone();
        cfg.endpoints.push(dup);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_out_of_range_coordinates_rejected() {
        let mut cfg = valid_config();
        cfg.endpoints[0].lat = Some(91.0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_pacing_spin_defaults_when_absent() {
        let json = r#"{
            "secretHex": "00112233445566778899aabbccddeeff",
            "endpoints": [{"id": "a", "host": "127.0.0.1", "port": 9000}],
            "samplesPerEndpoint": 5,
            "spacingMs": 10,
            "timeoutMs": 200,
            "intervalSeconds": 10,
            "outputPath": "out.jsonl",
            "physicsMismatchThresholdMs": 30.0
        }"#;
        let cfg: Config = serde_json::from_str(json).expect("config should parse");
        assert_eq!(cfg.pacing_spin_us, DEFAULT_PACING_SPIN_US);
    }
}
