// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Claimed-egress falsification.
//!
//! A claim is a lat/lon the traffic supposedly originates from. If any
//! endpoint's tight physics disk excludes that point, light itself could not
//! have made the trip and the claim is falsified.

use crate::analyze::calibrate::{adjust_rtt_ms, lookup_endpoint, Calibration};
use crate::analyze::geo::haversine_km;
use crate::analyze::report::max_distance_km;
use crate::analyze::stats::EndpointStats;
use crate::config::Endpoint;
use serde::Serialize;
use std::collections::HashMap;

/// One endpoint's verdict on a claimed origin.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimCheck {
    pub id: String,
    pub dist_km: f64,
    pub max_tight_km: Option<f64>,
    pub max_loose_km: Option<f64>,
    pub falsify_tight: Option<bool>,
    pub falsify_loose: Option<bool>,
}

/// Aggregate verdict over all checks.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimVerdict {
    /// At least one endpoint falsifies on the tight bound.
    pub falsified: bool,
    /// More than one endpoint falsifies on the tight bound.
    pub strongly_falsified: bool,
    pub tight_count: usize,
    pub loose_count: usize,
}

/// Check the claim against every endpoint with coordinates and samples.
#[must_use]
pub fn claim_checks(
    stats: &HashMap<String, EndpointStats>,
    endpoints: &HashMap<String, Endpoint>,
    claim_lat: f64,
    claim_lon: f64,
    effective_speed_km_s: f64,
    calibration: Option<&Calibration>,
) -> Vec<ClaimCheck> {
    let mut ids: Vec<&String> = stats.keys().collect();
    ids.sort();

    let mut out = Vec::new();
    for id in ids {
        let st = &stats[id];
        let Some(ep) = lookup_endpoint(endpoints, id) else {
            continue;
        };
        let (Some(ep_lat), Some(ep_lon)) = (ep.lat, ep.lon) else {
            continue;
        };
        let dist_km = haversine_km(claim_lat, claim_lon, ep_lat, ep_lon);
        let tight = st
            .p05
            .map(|v| adjust_rtt_ms(calibration, v, id))
            .map(|v| max_distance_km(v, effective_speed_km_s));
        let loose = st
            .p95
            .map(|v| adjust_rtt_ms(calibration, v, id))
            .map(|v| max_distance_km(v, effective_speed_km_s));
        out.push(ClaimCheck {
            id: id.clone(),
            dist_km,
            max_tight_km: tight,
            max_loose_km: loose,
            falsify_tight: tight.map(|t| dist_km > t),
            falsify_loose: loose.map(|l| dist_km > l),
        });
    }
    out
}

/// Fold checks into the claim-level verdict.
#[must_use]
pub fn claim_verdict(checks: &[ClaimCheck]) -> ClaimVerdict {
    let tight_count = checks
        .iter()
        .filter(|c| c.falsify_tight == Some(true))
        .count();
    let loose_count = checks
        .iter()
        .filter(|c| c.falsify_loose == Some(true))
        .count();
    ClaimVerdict {
        falsified: tight_count >= 1,
        strongly_falsified: tight_count > 1,
        tight_count,
        loose_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_PATH_STRETCH, DEFAULT_PORT, DEFAULT_SPEED_KM_S};

    fn endpoint(id: &str, lat: f64, lon: f64) -> Endpoint {
        Endpoint {
            id: id.to_string(),
            host: "h".to_string(),
            port: DEFAULT_PORT,
            region_hint: None,
            lat: Some(lat),
            lon: Some(lon),
        }
    }

    fn stats_with(id: &str, p05: f64, p95: f64) -> HashMap<String, EndpointStats> {
        let mut stats = HashMap::new();
        stats.insert(
            id.to_string(),
            EndpointStats {
                count: 20,
                min: Some(p05),
                p05: Some(p05),
                p50: Some(p05),
                p95: Some(p95),
                jitter_ms: Some(p95 - p05),
            },
        );
        stats
    }

    /// A 2 ms p05 to a San Francisco endpoint cannot coexist with a claimed
    /// Stockholm origin.
    #[test]
    fn test_stockholm_claim_falsified_by_sf_endpoint() {
        let eff_speed = DEFAULT_SPEED_KM_S * DEFAULT_PATH_STRETCH;
        let mut endpoints = HashMap::new();
        endpoints.insert("sfo".to_string(), endpoint("sfo", 37.77, -122.42));
        let stats = stats_with("sfo", 2.0, 3.0);

        let checks = claim_checks(&stats, &endpoints, 59.3293, 18.0686, eff_speed, None);
        assert_eq!(checks.len(), 1);
        let c = &checks[0];
        assert!((8_400.0..8_800.0).contains(&c.dist_km), "dist {}", c.dist_km);
        let tight = c.max_tight_km.expect("tight bound");
        assert!((tight - 220.0).abs() < 1.0, "tight {}", tight);
        assert_eq!(c.falsify_tight, Some(true));
        assert_eq!(c.falsify_loose, Some(true));

        let verdict = claim_verdict(&checks);
        assert!(verdict.falsified);
        assert!(!verdict.strongly_falsified);
    }

    #[test]
    fn test_nearby_claim_survives() {
        let eff_speed = DEFAULT_SPEED_KM_S * DEFAULT_PATH_STRETCH;
        let mut endpoints = HashMap::new();
        endpoints.insert("ams".to_string(), endpoint("ams", 52.37, 4.90));
        // 20 ms tight budget covers ~2,200 km; Paris is well inside.
        let stats = stats_with("ams", 20.0, 30.0);

        let checks = claim_checks(&stats, &endpoints, 48.85, 2.35, eff_speed, None);
        assert_eq!(checks[0].falsify_tight, Some(false));
        assert!(!claim_verdict(&checks).falsified);
    }

    #[test]
    fn test_strong_falsification_needs_two_endpoints() {
        let eff_speed = DEFAULT_SPEED_KM_S * DEFAULT_PATH_STRETCH;
        let mut endpoints = HashMap::new();
        endpoints.insert("sfo".to_string(), endpoint("sfo", 37.77, -122.42));
        endpoints.insert("nyc".to_string(), endpoint("nyc", 40.71, -74.01));
        let mut stats = stats_with("sfo", 2.0, 3.0);
        stats.extend(stats_with("nyc", 2.0, 3.0));

        let checks = claim_checks(&stats, &endpoints, 59.3293, 18.0686, eff_speed, None);
        let verdict = claim_verdict(&checks);
        assert_eq!(verdict.tight_count, 2);
        assert!(verdict.strongly_falsified);
    }

    #[test]
    fn test_endpoints_without_coords_are_skipped() {
        let eff_speed = DEFAULT_SPEED_KM_S * DEFAULT_PATH_STRETCH;
        let mut endpoints = HashMap::new();
        let mut ep = endpoint("x", 0.0, 0.0);
        ep.lon = None;
        endpoints.insert("x".to_string(), ep);
        let stats = stats_with("x", 5.0, 6.0);

        assert!(claim_checks(&stats, &endpoints, 0.0, 0.0, eff_speed, None).is_empty());
    }

    /// Falsification consistency: whenever the tight disk excludes the claim,
    /// the flag must be set.
    #[test]
    fn test_falsify_flag_matches_distance_comparison() {
        let eff_speed = DEFAULT_SPEED_KM_S * DEFAULT_PATH_STRETCH;
        let mut endpoints = HashMap::new();
        endpoints.insert("a".to_string(), endpoint("a", 10.0, 10.0));
        for p05 in [1.0, 5.0, 25.0, 125.0] {
            let stats = stats_with("a", p05, p05 * 2.0);
            let checks = claim_checks(&stats, &endpoints, 0.0, 0.0, eff_speed, None);
            let c = &checks[0];
            let expected = c.dist_km > c.max_tight_km.expect("tight");
            assert_eq!(c.falsify_tight, Some(expected));
        }
    }
}
