// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Offline analysis: physics bounds, claim falsification, origin estimation,
//! calibration, and baseline comparison.
//!
//! Everything here is pure over its inputs; file handles live with the
//! callers. A refresh may therefore recompute freely and publish only the
//! latest result.

pub mod baseline;
pub mod calibrate;
pub mod claim;
pub mod estimate;
pub mod geo;
pub mod report;
pub mod stats;

pub use baseline::{deltas, AutoBaseline, AutoBaselineStatus, Delta};
pub use calibrate::{adjust_rtt_ms, drift_report, Calibration, CalibrationEntry, DriftReport};
pub use claim::{claim_checks, claim_verdict, ClaimCheck, ClaimVerdict};
pub use estimate::{estimate_location, Band, Ellipse, Estimate, FitParams};
pub use geo::haversine_km;
pub use report::{endpoint_reports, max_distance_km, EndpointReport};
pub use stats::{build_stats, EndpointStats};

use crate::config::{
    Config, Endpoint, DEFAULT_BAND_FACTOR_LOOSE, DEFAULT_BAND_FACTOR_TIGHT,
    DEFAULT_BAND_WINDOW_DEG, DEFAULT_GRID_DEG, DEFAULT_PATH_STRETCH, DEFAULT_REFINE_DEG,
    DEFAULT_SPEED_KM_S,
};
use crate::record::BurstRecord;
use serde::Serialize;
use std::collections::HashMap;

/// User-tunable analyzer parameters.
#[derive(Debug, Clone, Copy)]
pub struct AnalyzerParams {
    pub speed_km_s: f64,
    /// Routing-stretch factor; values below 1.0 are clamped to 1.0.
    pub path_stretch: f64,
    pub grid_deg: f64,
    pub refine_deg: f64,
    pub band_factor_tight: f64,
    pub band_factor_loose: f64,
    pub band_window_deg: f64,
}

impl Default for AnalyzerParams {
    fn default() -> Self {
        Self {
            speed_km_s: DEFAULT_SPEED_KM_S,
            path_stretch: DEFAULT_PATH_STRETCH,
            grid_deg: DEFAULT_GRID_DEG,
            refine_deg: DEFAULT_REFINE_DEG,
            band_factor_tight: DEFAULT_BAND_FACTOR_TIGHT,
            band_factor_loose: DEFAULT_BAND_FACTOR_LOOSE,
            band_window_deg: DEFAULT_BAND_WINDOW_DEG,
        }
    }
}

impl AnalyzerParams {
    /// Stretch clamped to its physical floor.
    #[must_use]
    pub fn stretch(&self) -> f64 {
        self.path_stretch.max(1.0)
    }

    /// Bound-widening effective speed: `speed * stretch`.
    #[must_use]
    pub fn effective_speed_km_s(&self) -> f64 {
        self.speed_km_s * self.stretch()
    }

    #[must_use]
    pub fn fit_params(&self) -> FitParams {
        FitParams {
            effective_speed_km_s: self.effective_speed_km_s(),
            grid_deg: self.grid_deg,
            refine_deg: self.refine_deg,
            band_factor_tight: self.band_factor_tight,
            band_factor_loose: self.band_factor_loose,
            band_window_deg: self.band_window_deg,
        }
    }
}

/// Index endpoints by id.
#[must_use]
pub fn endpoints_by_id(endpoints: &[Endpoint]) -> HashMap<String, Endpoint> {
    endpoints
        .iter()
        .map(|ep| (ep.id.clone(), ep.clone()))
        .collect()
}

/// Parameters echoed into the analysis output.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamsView {
    pub speed_km_s: f64,
    pub effective_speed_km_s: f64,
    pub path_stretch: f64,
    pub grid_deg: f64,
    pub refine_deg: f64,
    pub band_factor_tight: f64,
    pub band_factor_loose: f64,
    pub band_window_deg: f64,
}

/// One window's reports and estimate.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub label: String,
    pub records: usize,
    pub endpoint_stats: Vec<EndpointReport>,
    pub estimate: Option<Estimate>,
}

/// Full result of one analysis pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisOutput {
    pub params: ParamsView,
    pub session: SessionView,
    pub baseline: Option<SessionView>,
    pub claim_checks: Option<Vec<ClaimCheck>>,
    pub claim_verdict: Option<ClaimVerdict>,
    pub deltas: Option<Vec<Delta>>,
    pub estimate_separation_km: Option<f64>,
    pub calibration_drift: Option<DriftReport>,
}

/// Analyze a session (and optional baseline) against a config.
#[must_use]
pub fn analyze_session(
    cfg: &Config,
    session_records: &[BurstRecord],
    baseline_records: Option<&[BurstRecord]>,
    claim: Option<(f64, f64)>,
    calibration: Option<&Calibration>,
    params: &AnalyzerParams,
) -> AnalysisOutput {
    let endpoints = endpoints_by_id(&cfg.endpoints);
    let eff_speed = params.effective_speed_km_s();
    let fit = params.fit_params();

    let session_stats = build_stats(session_records);
    let session = SessionView {
        label: "session".to_string(),
        records: session_records.len(),
        endpoint_stats: endpoint_reports(&session_stats, &endpoints, eff_speed, calibration),
        estimate: estimate_location(&session_stats, &endpoints, calibration, &fit),
    };

    let checks = claim.map(|(lat, lon)| {
        claim_checks(&session_stats, &endpoints, lat, lon, eff_speed, calibration)
    });
    let verdict = checks.as_deref().map(claim_verdict);

    let mut baseline_view = None;
    let mut delta_rows = None;
    let mut separation = None;
    let mut drift = None;
    if let Some(records) = baseline_records {
        let baseline_stats = build_stats(records);
        let estimate = estimate_location(&baseline_stats, &endpoints, calibration, &fit);
        if let (Some(b), Some(s)) = (&estimate, &session.estimate) {
            separation = Some(haversine_km(b.lat, b.lon, s.lat, s.lon));
        }
        delta_rows = Some(deltas(&baseline_stats, &session_stats));
        baseline_view = Some(SessionView {
            label: "baseline".to_string(),
            records: records.len(),
            endpoint_stats: endpoint_reports(&baseline_stats, &endpoints, eff_speed, calibration),
            estimate,
        });
    }
    if let Some(cal) = calibration {
        drift = drift_report(cal, &session_stats, &endpoints, eff_speed);
    }

    AnalysisOutput {
        params: ParamsView {
            speed_km_s: params.speed_km_s,
            effective_speed_km_s: eff_speed,
            path_stretch: params.stretch(),
            grid_deg: params.grid_deg,
            refine_deg: params.refine_deg,
            band_factor_tight: params.band_factor_tight,
            band_factor_loose: params.band_factor_loose,
            band_window_deg: params.band_window_deg,
        },
        session,
        baseline: baseline_view,
        claim_checks: checks,
        claim_verdict: verdict,
        deltas: delta_rows,
        estimate_separation_km: separation,
        calibration_drift: drift,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_PORT;
    use crate::record::test_record;

    fn config_with_endpoints(endpoints: Vec<Endpoint>) -> Config {
        Config {
            secret_hex: "00112233445566778899aabbccddeeff".to_string(),
            endpoints,
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

    #[test]
    fn test_stretch_clamps_at_one() {
        let params = AnalyzerParams {
            path_stretch: 0.5,
            ..AnalyzerParams::default()
        };
        assert_eq!(params.stretch(), 1.0);
        assert_eq!(params.effective_speed_km_s(), params.speed_km_s);
    }

    #[test]
    fn test_analysis_without_coordinates_has_no_estimate() {
        let mut ep = endpoint("a", 0.0, 0.0);
        ep.lat = None;
        ep.lon = None;
        let cfg = config_with_endpoints(vec![ep]);
        let records = vec![test_record("a", vec![10.0, 11.0, 12.0])];

        let out = analyze_session(&cfg, &records, None, None, None, &AnalyzerParams::default());
        assert_eq!(out.session.records, 1);
        assert_eq!(out.session.endpoint_stats.len(), 1);
        assert!(out.session.estimate.is_none(), "no coords means no estimate");
        assert!(out.claim_checks.is_none());
        assert!(out.baseline.is_none());
    }

    #[test]
    fn test_baseline_produces_deltas_and_labels() {
        let cfg = config_with_endpoints(vec![endpoint("a", 0.0, 0.0)]);
        let baseline = vec![test_record("a", vec![20.0; 5])];
        let session = vec![test_record("a", vec![80.0; 5])];

        let out = analyze_session(
            &cfg,
            &session,
            Some(&baseline),
            None,
            None,
            &AnalyzerParams::default(),
        );
        let deltas = out.deltas.expect("deltas with baseline present");
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].delta_p05_ms, 60.0);
        assert_eq!(out.baseline.expect("baseline view").label, "baseline");
    }

    #[test]
    fn test_claim_checks_fill_verdict() {
        let cfg = config_with_endpoints(vec![endpoint("sfo", 37.77, -122.42)]);
        let records = vec![test_record("sfo", vec![2.0; 10])];

        let out = analyze_session(
            &cfg,
            &records,
            None,
            Some((59.3293, 18.0686)),
            None,
            &AnalyzerParams::default(),
        );
        let verdict = out.claim_verdict.expect("verdict with a claim");
        assert!(verdict.falsified);
        assert_eq!(out.claim_checks.expect("checks").len(), 1);
    }

    #[test]
    fn test_output_serializes_to_camel_case_json() {
        let cfg = config_with_endpoints(vec![endpoint("a", 0.0, 0.0)]);
        let records = vec![test_record("a", vec![10.0])];
        let out = analyze_session(&cfg, &records, None, None, None, &AnalyzerParams::default());
        let json = serde_json::to_string(&out).expect("serialize");
        assert!(json.contains("\"effectiveSpeedKmS\""));
        assert!(json.contains("\"endpointStats\""));
        assert!(!json.contains("\"endpoint_stats\""));
    }
}
