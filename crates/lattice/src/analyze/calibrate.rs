// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Calibration packs: per-endpoint additive bias measured at a known origin.
//!
//! A pack is generated from a window of samples taken at a known lat/lon:
//! whatever RTT remains after subtracting the physics expectation is access
//! overhead, stored as `biasMs` and subtracted from future quantiles before
//! budgets and residuals are computed. `scale` is carried in the format but
//! reserved; the load path accepts and ignores it.

use crate::analyze::geo::haversine_km;
use crate::analyze::stats::EndpointStats;
use crate::clock::now_unix_ms;
use crate::config::{Endpoint, CALIB_DRIFT_WARN_MS, MS_PER_SEC, RTT_FACTOR};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

/// One endpoint's calibration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationEntry {
    pub id: String,
    pub bias_ms: f64,
    /// Reserved for regression refinement; fixed at 1.0 today.
    #[serde(default = "default_scale")]
    pub scale: f64,
    pub sample_count: usize,
}

fn default_scale() -> f64 {
    1.0
}

/// A calibration pack built from a known-origin window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Calibration {
    pub calibration_lat: f64,
    pub calibration_lon: f64,
    /// Total samples across entries at build time.
    pub sample_count: usize,
    pub build_ms: i64,
    pub entries: Vec<CalibrationEntry>,
}

impl Calibration {
    /// Build a pack from window stats at a known origin.
    ///
    /// `biasMs = max(0, median(RTT) - expected)` where the expectation uses
    /// the effective (stretch-widened) speed, matching the estimator's
    /// prediction model so generate-then-apply cancels.
    #[must_use]
    pub fn generate(
        stats: &HashMap<String, EndpointStats>,
        endpoints: &HashMap<String, Endpoint>,
        lat: f64,
        lon: f64,
        effective_speed_km_s: f64,
    ) -> Self {
        let mut entries = Vec::new();
        let mut total = 0usize;
        let mut ids: Vec<&String> = stats.keys().collect();
        ids.sort();
        for id in ids {
            let st = &stats[id];
            let Some(ep) = lookup_endpoint(endpoints, id) else {
                continue;
            };
            let (Some(ep_lat), Some(ep_lon)) = (ep.lat, ep.lon) else {
                continue;
            };
            let rtt = match st.p50.or(st.min) {
                Some(v) if v.is_finite() && v > 0.0 => v,
                _ => continue,
            };
            let expected =
                expected_rtt_ms(haversine_km(lat, lon, ep_lat, ep_lon), effective_speed_km_s);
            entries.push(CalibrationEntry {
                id: id.clone(),
                bias_ms: (rtt - expected).max(0.0),
                scale: 1.0,
                sample_count: st.count,
            });
            total += st.count;
        }
        Self {
            calibration_lat: lat,
            calibration_lon: lon,
            sample_count: total,
            build_ms: now_unix_ms(),
            entries,
        }
    }

    /// Load and sanity-check a pack.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::CalibrationInvalid(format!("{}: not found", path.as_ref().display()))
            } else {
                Error::Io(e)
            }
        })?;
        let cal: Calibration = serde_json::from_reader(file)
            .map_err(|e| Error::CalibrationInvalid(e.to_string()))?;
        if !cal.calibration_lat.is_finite() || !cal.calibration_lon.is_finite() {
            return Err(Error::CalibrationInvalid(
                "calibration location must be finite".to_string(),
            ));
        }
        if let Some(bad) = cal.entries.iter().find(|e| !e.bias_ms.is_finite()) {
            return Err(Error::CalibrationInvalid(format!(
                "entry {} has a non-finite biasMs",
                bad.id
            )));
        }
        Ok(cal)
    }

    /// Serialize the pack as pretty JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
    }

    /// Entry for an endpoint id; `<id>@<path>` falls back to the base id.
    #[must_use]
    pub fn entry(&self, endpoint_id: &str) -> Option<&CalibrationEntry> {
        if let Some(e) = self.entries.iter().find(|e| e.id == endpoint_id) {
            return Some(e);
        }
        let base = endpoint_id.split('@').next()?;
        self.entries.iter().find(|e| e.id == base)
    }

    /// Subtract the endpoint's bias, clamped at zero.
    #[must_use]
    pub fn apply(&self, rtt_ms: f64, endpoint_id: &str) -> f64 {
        match self.entry(endpoint_id) {
            Some(e) => (rtt_ms - e.bias_ms).max(0.0),
            None => rtt_ms,
        }
    }
}

/// Apply an optional calibration to an RTT quantile.
#[must_use]
pub fn adjust_rtt_ms(calibration: Option<&Calibration>, rtt_ms: f64, endpoint_id: &str) -> f64 {
    match calibration {
        Some(cal) => cal.apply(rtt_ms, endpoint_id),
        None => rtt_ms,
    }
}

/// Physics-expected RTT for a distance under the effective speed.
#[must_use]
pub fn expected_rtt_ms(dist_km: f64, effective_speed_km_s: f64) -> f64 {
    RTT_FACTOR * dist_km / (effective_speed_km_s / MS_PER_SEC)
}

/// Endpoint lookup with `<id>@<path>` base fallback.
#[must_use]
pub fn lookup_endpoint<'a>(
    endpoints: &'a HashMap<String, Endpoint>,
    id: &str,
) -> Option<&'a Endpoint> {
    if let Some(ep) = endpoints.get(id) {
        return Some(ep);
    }
    endpoints.get(id.split('@').next()?)
}

// =======================================================================
// Drift
// =======================================================================

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriftEntry {
    pub id: String,
    pub delta_ms: f64,
}

/// Live-vs-stored bias comparison for the loaded calibration.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriftReport {
    pub count: usize,
    pub median_abs_ms: f64,
    pub max_abs_ms: f64,
    /// Three largest absolute deltas, worst first.
    pub worst: Vec<DriftEntry>,
    pub warn: bool,
    pub warn_threshold_ms: f64,
}

/// Recompute each entry's bias from the current window and compare.
///
/// Returns `None` when no calibrated endpoint has usable live data.
#[must_use]
pub fn drift_report(
    calibration: &Calibration,
    stats: &HashMap<String, EndpointStats>,
    endpoints: &HashMap<String, Endpoint>,
    effective_speed_km_s: f64,
) -> Option<DriftReport> {
    let mut deltas = Vec::new();
    for entry in &calibration.entries {
        let Some(st) = stats.get(&entry.id) else {
            continue;
        };
        let Some(ep) = lookup_endpoint(endpoints, &entry.id) else {
            continue;
        };
        let (Some(ep_lat), Some(ep_lon)) = (ep.lat, ep.lon) else {
            continue;
        };
        let rtt = match st.p50.or(st.min) {
            Some(v) if v.is_finite() && v > 0.0 => v,
            _ => continue,
        };
        let expected = expected_rtt_ms(
            haversine_km(
                calibration.calibration_lat,
                calibration.calibration_lon,
                ep_lat,
                ep_lon,
            ),
            effective_speed_km_s,
        );
        let live_bias = (rtt - expected).max(0.0);
        deltas.push(DriftEntry {
            id: entry.id.clone(),
            delta_ms: live_bias - entry.bias_ms,
        });
    }
    if deltas.is_empty() {
        return None;
    }

    let mut abs: Vec<f64> = deltas.iter().map(|d| d.delta_ms.abs()).collect();
    abs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median_abs_ms =
        crate::analyze::stats::median_sorted(&abs).unwrap_or(0.0);
    let max_abs_ms = abs.last().copied().unwrap_or(0.0);

    let mut worst = deltas.clone();
    worst.sort_by(|a, b| {
        b.delta_ms
            .abs()
            .partial_cmp(&a.delta_ms.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    worst.truncate(3);

    Some(DriftReport {
        count: deltas.len(),
        median_abs_ms,
        max_abs_ms,
        worst,
        warn: median_abs_ms >= CALIB_DRIFT_WARN_MS,
        warn_threshold_ms: CALIB_DRIFT_WARN_MS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_PORT;

    fn endpoint(id: &str, lat: f64, lon: f64) -> Endpoint {
        Endpoint {
            id: id.to_string(),
            host: "198.51.100.1".to_string(),
            port: DEFAULT_PORT,
            region_hint: None,
            lat: Some(lat),
            lon: Some(lon),
        }
    }

    fn stats_entry(p50: f64) -> EndpointStats {
        EndpointStats {
            count: 10,
            min: Some(p50),
            p05: Some(p50),
            p50: Some(p50),
            p95: Some(p50),
            jitter_ms: Some(0.0),
        }
    }

    const EFF_SPEED: f64 = 220_000.0;

    #[test]
    fn test_generate_at_endpoint_location_stores_full_rtt() {
        // Zero distance means the whole observed RTT is bias.
        let mut stats = HashMap::new();
        stats.insert("a".to_string(), stats_entry(12.5));
        let mut endpoints = HashMap::new();
        endpoints.insert("a".to_string(), endpoint("a", 0.0, 0.0));

        let cal = Calibration::generate(&stats, &endpoints, 0.0, 0.0, EFF_SPEED);
        assert_eq!(cal.entries.len(), 1);
        assert!((cal.entries[0].bias_ms - 12.5).abs() < 1e-9);
        assert_eq!(cal.entries[0].scale, 1.0);
        assert_eq!(cal.sample_count, 10);
    }

    #[test]
    fn test_generate_skips_endpoints_without_coords() {
        let mut stats = HashMap::new();
        stats.insert("nowhere".to_string(), stats_entry(10.0));
        let mut endpoints = HashMap::new();
        let mut ep = endpoint("nowhere", 0.0, 0.0);
        ep.lat = None;
        endpoints.insert("nowhere".to_string(), ep);

        let cal = Calibration::generate(&stats, &endpoints, 0.0, 0.0, EFF_SPEED);
        assert!(cal.entries.is_empty());
    }

    #[test]
    fn test_calibration_inversion_drift_near_zero() {
        // Generate and immediately re-measure from the same window: live bias
        // must match stored bias within numeric tolerance.
        let mut stats = HashMap::new();
        stats.insert("a".to_string(), stats_entry(30.0));
        stats.insert("b".to_string(), stats_entry(55.0));
        let mut endpoints = HashMap::new();
        endpoints.insert("a".to_string(), endpoint("a", 10.0, 10.0));
        endpoints.insert("b".to_string(), endpoint("b", -20.0, 40.0));

        let cal = Calibration::generate(&stats, &endpoints, 5.0, 5.0, EFF_SPEED);
        let drift = drift_report(&cal, &stats, &endpoints, EFF_SPEED)
            .expect("both endpoints have live data");
        assert_eq!(drift.count, 2);
        assert!(drift.median_abs_ms < 1e-9);
        assert!(drift.max_abs_ms < 1e-9);
        assert!(!drift.warn);
    }

    #[test]
    fn test_drift_warns_past_threshold() {
        let mut stats = HashMap::new();
        stats.insert("a".to_string(), stats_entry(30.0));
        let mut endpoints = HashMap::new();
        endpoints.insert("a".to_string(), endpoint("a", 0.0, 0.0));

        let mut cal = Calibration::generate(&stats, &endpoints, 0.0, 0.0, EFF_SPEED);
        // Pretend the stored bias was 10 ms lower than today's reality.
        cal.entries[0].bias_ms -= 10.0;
        let drift =
            drift_report(&cal, &stats, &endpoints, EFF_SPEED).expect("drift computable");
        assert!((drift.max_abs_ms - 10.0).abs() < 1e-9);
        assert!(drift.warn);
        assert_eq!(drift.worst.len(), 1);
    }

    #[test]
    fn test_entry_falls_back_to_base_id() {
        let cal = Calibration {
            calibration_lat: 0.0,
            calibration_lon: 0.0,
            sample_count: 0,
            build_ms: 0,
            entries: vec![CalibrationEntry {
                id: "nyc".to_string(),
                bias_ms: 5.0,
                scale: 1.0,
                sample_count: 4,
            }],
        };
        assert!(cal.entry("nyc@vpn").is_some());
        assert_eq!(cal.apply(9.0, "nyc@vpn"), 4.0);
        // Clamped at zero, never negative.
        assert_eq!(cal.apply(3.0, "nyc"), 0.0);
        // Unknown ids pass through.
        assert_eq!(cal.apply(7.0, "sfo"), 7.0);
    }

    #[test]
    fn test_load_accepts_missing_scale() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cal.json");
        std::fs::write(
            &path,
            r#"{
                "calibrationLat": 1.0,
                "calibrationLon": 2.0,
                "sampleCount": 3,
                "buildMs": 1700000000000,
                "entries": [{"id": "a", "biasMs": 4.5, "sampleCount": 3}]
            }"#,
        )
        .expect("write");
        let cal = Calibration::load(&path).expect("pack should parse");
        assert_eq!(cal.entries[0].scale, 1.0);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cal.json");
        std::fs::write(&path, "{not json").expect("write");
        assert!(matches!(
            Calibration::load(&path),
            Err(crate::error::Error::CalibrationInvalid(_))
        ));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cal.json");
        let mut stats = HashMap::new();
        stats.insert("a".to_string(), stats_entry(12.0));
        let mut endpoints = HashMap::new();
        endpoints.insert("a".to_string(), endpoint("a", 3.0, 4.0));

        let cal = Calibration::generate(&stats, &endpoints, 0.0, 0.0, EFF_SPEED);
        cal.save(&path).expect("save");
        let loaded = Calibration::load(&path).expect("load");
        assert_eq!(cal, loaded);
    }
}
