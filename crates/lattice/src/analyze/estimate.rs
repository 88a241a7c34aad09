// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Grid-search origin estimation with uncertainty bands.
//!
//! For a candidate (lat, lon) the model predicts `2 * tau_k + b` per endpoint,
//! where `tau_k` is one-way propagation at the effective speed and `b` is a
//! shared access-delay intercept with a closed-form optimum per cell. A coarse
//! global pass picks the best cell, a fine pass refines it, and the cells
//! whose SSE stays within a factor of the minimum form the uncertainty bands.

use crate::analyze::calibrate::{adjust_rtt_ms, lookup_endpoint, Calibration};
use crate::analyze::geo::{haversine_km, km_per_deg};
use crate::analyze::stats::EndpointStats;
use crate::config::{
    Endpoint, DEFAULT_BAND_FACTOR_LOOSE, DEFAULT_BAND_FACTOR_TIGHT, DEFAULT_BAND_WINDOW_DEG,
    DEFAULT_GRID_DEG, DEFAULT_PATH_STRETCH, DEFAULT_REFINE_DEG, DEFAULT_SPEED_KM_S, MS_PER_SEC,
    REFINE_WINDOW_MULT, RTT_FACTOR, SSE_EPSILON, WORLD_LAT_MAX, WORLD_LON_MAX,
};
use serde::Serialize;
use std::collections::HashMap;

/// Weight floor for the band covariance; keeps the best cell's weight finite.
const ELLIPSE_WEIGHT_EPSILON: f64 = 1e-3;

/// Fitting knobs, all resolvable from config defaults.
#[derive(Debug, Clone, Copy)]
pub struct FitParams {
    /// `speed_km_s * path_stretch`.
    pub effective_speed_km_s: f64,
    pub grid_deg: f64,
    pub refine_deg: f64,
    pub band_factor_tight: f64,
    pub band_factor_loose: f64,
    pub band_window_deg: f64,
}

impl Default for FitParams {
    fn default() -> Self {
        Self {
            effective_speed_km_s: DEFAULT_SPEED_KM_S * DEFAULT_PATH_STRETCH,
            grid_deg: DEFAULT_GRID_DEG,
            refine_deg: DEFAULT_REFINE_DEG,
            band_factor_tight: DEFAULT_BAND_FACTOR_TIGHT,
            band_factor_loose: DEFAULT_BAND_FACTOR_LOOSE,
            band_window_deg: DEFAULT_BAND_WINDOW_DEG,
        }
    }
}

/// 1-sigma contour of the band cell distribution, in km.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ellipse {
    pub major_km: f64,
    pub minor_km: f64,
    pub angle_deg: f64,
}

/// Cells whose SSE stays within `sse_threshold` of the minimum.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Band {
    pub radius_km: f64,
    pub sse_threshold: f64,
    pub points: usize,
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
    /// Present when at least three cells qualify; otherwise the band
    /// degrades to the circle described by `radius_km`.
    pub ellipse: Option<Ellipse>,
}

/// Best-fit origin with its uncertainty bands.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Estimate {
    pub lat: f64,
    pub lon: f64,
    /// Fitted shared access-delay intercept.
    pub bias_ms: f64,
    pub sse: f64,
    /// Endpoints contributing to the fit.
    pub points: usize,
    pub band_tight: Option<Band>,
    pub band_loose: Option<Band>,
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    lat: f64,
    lon: f64,
    rtt_ms: f64,
    jitter_ms: f64,
}

/// Estimate the origin from windowed endpoint stats.
///
/// Returns `None` with fewer than three endpoints that have coordinates and a
/// positive calibrated RTT: better no estimate than a fabricated one.
#[must_use]
pub fn estimate_location(
    stats: &HashMap<String, EndpointStats>,
    endpoints: &HashMap<String, Endpoint>,
    calibration: Option<&Calibration>,
    params: &FitParams,
) -> Option<Estimate> {
    let obs = observations(stats, endpoints, calibration);
    if obs.len() < 3 {
        return None;
    }

    let speed = params.effective_speed_km_s;
    let (best_lat, best_lon, _, _) = grid_search(
        &obs,
        speed,
        -WORLD_LAT_MAX,
        WORLD_LAT_MAX,
        -WORLD_LON_MAX,
        WORLD_LON_MAX,
        params.grid_deg,
    )?;

    let window = params.grid_deg.max(params.refine_deg * REFINE_WINDOW_MULT);
    let (lat, lon, sse, bias) = grid_search(
        &obs,
        speed,
        best_lat - window,
        best_lat + window,
        best_lon - window,
        best_lon + window,
        params.refine_deg,
    )?;

    let band_window = params.band_window_deg.max(window);
    let band_tight = fit_band(
        &obs,
        speed,
        lat,
        lon,
        sse,
        params.refine_deg,
        params.band_factor_tight,
        band_window,
    );
    let band_loose = fit_band(
        &obs,
        speed,
        lat,
        lon,
        sse,
        params.refine_deg,
        params.band_factor_loose,
        band_window,
    );

    Some(Estimate {
        lat,
        lon,
        bias_ms: bias,
        sse,
        points: obs.len(),
        band_tight,
        band_loose,
    })
}

fn observations(
    stats: &HashMap<String, EndpointStats>,
    endpoints: &HashMap<String, Endpoint>,
    calibration: Option<&Calibration>,
) -> Vec<Observation> {
    let mut obs = Vec::new();
    for (id, st) in stats {
        let Some(ep) = lookup_endpoint(endpoints, id) else {
            continue;
        };
        let (Some(lat), Some(lon)) = (ep.lat, ep.lon) else {
            continue;
        };
        let rtt = match st.p05.or(st.min) {
            Some(v) if v.is_finite() && v > 0.0 => adjust_rtt_ms(calibration, v, id),
            _ => continue,
        };
        if !rtt.is_finite() || rtt <= 0.0 {
            continue;
        }
        obs.push(Observation {
            lat,
            lon,
            rtt_ms: rtt,
            jitter_ms: st.weight_jitter_ms(),
        });
    }
    obs
}

/// Exhaustive scan of a lat/lon box at `step` degrees.
fn grid_search(
    obs: &[Observation],
    speed_km_s: f64,
    lat_min: f64,
    lat_max: f64,
    lon_min: f64,
    lon_max: f64,
    step: f64,
) -> Option<(f64, f64, f64, f64)> {
    if step <= 0.0 {
        return None;
    }
    let mut best: Option<(f64, f64, f64, f64)> = None;
    let mut lat = lat_min.max(-WORLD_LAT_MAX);
    let lat_stop = lat_max.min(WORLD_LAT_MAX);
    while lat <= lat_stop {
        let mut lon = lon_min;
        while lon <= lon_max {
            let (sse, bias) = sse_for_candidate(lat, lon, obs, speed_km_s);
            if best.map(|(_, _, b, _)| sse < b).unwrap_or(true) {
                best = Some((lat, lon, sse, bias));
            }
            lon += step;
        }
        lat += step;
    }
    best
}

/// Weighted SSE for a candidate, with the closed-form optimal intercept
/// `b* = sum(w * (obs - 2 tau)) / sum(w)`, clamped non-negative since the
/// intercept models access delay.
fn sse_for_candidate(
    lat: f64,
    lon: f64,
    obs: &[Observation],
    speed_km_s: f64,
) -> (f64, f64) {
    let speed_km_ms = speed_km_s / MS_PER_SEC;
    let mut sum_w = 0.0;
    let mut sum_wx = 0.0;
    for o in obs {
        let dist = haversine_km(lat, lon, o.lat, o.lon);
        let pred_no_bias = RTT_FACTOR * dist / speed_km_ms;
        let w = 1.0 / o.jitter_ms;
        sum_w += w;
        sum_wx += w * (o.rtt_ms - pred_no_bias);
    }
    let bias = if sum_w > 0.0 { (sum_wx / sum_w).max(0.0) } else { 0.0 };

    let mut sse = 0.0;
    for o in obs {
        let dist = haversine_km(lat, lon, o.lat, o.lon);
        let pred = RTT_FACTOR * dist / speed_km_ms + bias;
        let w = 1.0 / o.jitter_ms;
        let err = o.rtt_ms - pred;
        sse += w * err * err;
    }
    (sse, bias)
}

/// Collect the cells with `SSE <= best * factor` around the refined center.
#[allow(clippy::too_many_arguments)]
fn fit_band(
    obs: &[Observation],
    speed_km_s: f64,
    center_lat: f64,
    center_lon: f64,
    best_sse: f64,
    step: f64,
    factor: f64,
    window_deg: f64,
) -> Option<Band> {
    if step <= 0.0 {
        return None;
    }
    let threshold = (best_sse * factor).max(best_sse + SSE_EPSILON);
    let lat_min = (center_lat - window_deg).max(-WORLD_LAT_MAX);
    let lat_max = (center_lat + window_deg).min(WORLD_LAT_MAX);
    let lon_min = center_lon - window_deg;
    let lon_max = center_lon + window_deg;
    let km_deg = km_per_deg();

    let mut min_lat = center_lat;
    let mut max_lat = center_lat;
    let mut min_lon = center_lon;
    let mut max_lon = center_lon;
    let mut max_dist: f64 = 0.0;
    let mut points = 0usize;

    // Weighted covariance accumulators over local km offsets from the center.
    let mut sum_w = 0.0;
    let mut sum_dx = 0.0;
    let mut sum_dy = 0.0;
    let mut sum_dx2 = 0.0;
    let mut sum_dy2 = 0.0;
    let mut sum_dxdy = 0.0;

    let mut lat = lat_min;
    while lat <= lat_max {
        let mut lon = lon_min;
        while lon <= lon_max {
            let (sse, _) = sse_for_candidate(lat, lon, obs, speed_km_s);
            if sse <= threshold {
                points += 1;
                max_dist = max_dist.max(haversine_km(center_lat, center_lon, lat, lon));
                min_lat = min_lat.min(lat);
                max_lat = max_lat.max(lat);
                min_lon = min_lon.min(lon);
                max_lon = max_lon.max(lon);

                let w = 1.0 / (sse - best_sse + ELLIPSE_WEIGHT_EPSILON);
                let dx = (lon - center_lon) * center_lat.to_radians().cos() * km_deg;
                let dy = (lat - center_lat) * km_deg;
                sum_w += w;
                sum_dx += w * dx;
                sum_dy += w * dy;
                sum_dx2 += w * dx * dx;
                sum_dy2 += w * dy * dy;
                sum_dxdy += w * dx * dy;
            }
            lon += step;
        }
        lat += step;
    }

    if points == 0 {
        return None;
    }

    let ellipse = if points >= 3 && sum_w > 0.0 {
        let mean_dx = sum_dx / sum_w;
        let mean_dy = sum_dy / sum_w;
        let var_x = (sum_dx2 / sum_w - mean_dx * mean_dx).max(0.0);
        let var_y = (sum_dy2 / sum_w - mean_dy * mean_dy).max(0.0);
        let cov_xy = sum_dxdy / sum_w - mean_dx * mean_dy;

        let trace = var_x + var_y;
        let det = var_x * var_y - cov_xy * cov_xy;
        let root = (trace * trace / 4.0 - det).max(0.0).sqrt();
        let eig1 = (trace / 2.0 + root).max(0.0);
        let eig2 = (trace / 2.0 - root).max(0.0);
        Some(Ellipse {
            major_km: eig1.sqrt(),
            minor_km: eig2.sqrt(),
            angle_deg: 0.5 * (2.0 * cov_xy).atan2(var_x - var_y).to_degrees(),
        })
    } else {
        None
    };

    Some(Band {
        radius_km: max_dist,
        sse_threshold: threshold,
        points,
        min_lat,
        max_lat,
        min_lon,
        max_lon,
        ellipse,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::calibrate::Calibration;
    use crate::config::DEFAULT_PORT;

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

    fn stats_entry(p05: f64) -> EndpointStats {
        EndpointStats {
            count: 20,
            min: Some(p05),
            p05: Some(p05),
            p50: Some(p05),
            p95: Some(p05 + 1.0),
            jitter_ms: Some(1.0),
        }
    }

    /// RTT an origin at (lat, lon) would see to an endpoint, plus overhead.
    fn synth_rtt(
        origin: (f64, f64),
        ep: (f64, f64),
        speed_km_s: f64,
        overhead_ms: f64,
    ) -> f64 {
        RTT_FACTOR * haversine_km(origin.0, origin.1, ep.0, ep.1) / (speed_km_s / MS_PER_SEC)
            + overhead_ms
    }

    fn corners() -> Vec<(&'static str, f64, f64)> {
        vec![
            ("a", 0.0, 0.0),
            ("b", 0.0, 10.0),
            ("c", 10.0, 0.0),
            ("d", 10.0, 10.0),
        ]
    }

    fn params() -> FitParams {
        FitParams {
            // Stretch 1.0 so synthesized RTTs invert exactly.
            effective_speed_km_s: DEFAULT_SPEED_KM_S,
            ..FitParams::default()
        }
    }

    #[test]
    fn test_insufficient_endpoints_yield_none() {
        let mut stats = HashMap::new();
        let mut endpoints = HashMap::new();
        for (id, lat, lon) in corners().into_iter().take(2) {
            stats.insert(id.to_string(), stats_entry(10.0));
            endpoints.insert(id.to_string(), endpoint(id, lat, lon));
        }
        assert!(estimate_location(&stats, &endpoints, None, &params()).is_none());
    }

    #[test]
    fn test_recovers_center_of_square_with_uniform_overhead() {
        let origin = (5.0, 5.0);
        let p = params();
        let mut stats = HashMap::new();
        let mut endpoints = HashMap::new();
        for (id, lat, lon) in corners() {
            let rtt = synth_rtt(origin, (lat, lon), p.effective_speed_km_s, 1.0);
            stats.insert(id.to_string(), stats_entry(rtt));
            endpoints.insert(id.to_string(), endpoint(id, lat, lon));
        }

        let est = estimate_location(&stats, &endpoints, None, &p).expect("estimate");
        assert_eq!(est.points, 4);
        assert!((est.lat - 5.0).abs() <= 0.3, "lat {}", est.lat);
        assert!((est.lon - 5.0).abs() <= 0.3, "lon {}", est.lon);
        assert!((est.bias_ms - 1.0).abs() <= 0.5, "bias {}", est.bias_ms);

        let tight = est.band_tight.as_ref().expect("tight band");
        let loose = est.band_loose.as_ref().expect("loose band");
        assert!(tight.points <= loose.points);
        assert!(tight.radius_km <= loose.radius_km);
        // Loose band always carries a bounding box around the estimate.
        assert!(loose.min_lat <= est.lat && est.lat <= loose.max_lat);
        assert!(loose.min_lon <= est.lon && est.lon <= loose.max_lon);
    }

    #[test]
    fn test_calibration_tightens_band_under_heterogeneous_bias() {
        let origin = (5.0, 5.0);
        let p = params();
        let biases = [30.0, 5.0, 15.0, 0.0];

        let mut stats = HashMap::new();
        let mut endpoints = HashMap::new();
        for ((id, lat, lon), bias) in corners().into_iter().zip(biases) {
            let rtt = synth_rtt(origin, (lat, lon), p.effective_speed_km_s, bias);
            stats.insert(id.to_string(), stats_entry(rtt));
            endpoints.insert(id.to_string(), endpoint(id, lat, lon));
        }

        let uncalibrated =
            estimate_location(&stats, &endpoints, None, &p).expect("uncalibrated estimate");

        // A pack generated at the true origin removes each endpoint's bias.
        let cal = Calibration::generate(
            &stats,
            &endpoints,
            origin.0,
            origin.1,
            p.effective_speed_km_s,
        );
        let calibrated =
            estimate_location(&stats, &endpoints, Some(&cal), &p).expect("calibrated estimate");

        assert!(calibrated.sse <= uncalibrated.sse);
        let r_cal = calibrated.band_tight.as_ref().expect("band").radius_km;
        let r_raw = uncalibrated.band_tight.as_ref().expect("band").radius_km;
        assert!(
            r_cal < r_raw,
            "calibration should shrink the tight band: {} vs {}",
            r_cal,
            r_raw
        );
        assert!((calibrated.lat - 5.0).abs() <= 0.3);
        assert!((calibrated.lon - 5.0).abs() <= 0.3);
    }

    #[test]
    fn test_band_ellipse_present_with_enough_cells() {
        let origin = (5.0, 5.0);
        let p = params();
        let mut stats = HashMap::new();
        let mut endpoints = HashMap::new();
        for (id, lat, lon) in corners() {
            // 3 ms of spread keeps the SSE valley wide enough for many cells.
            let rtt = synth_rtt(origin, (lat, lon), p.effective_speed_km_s, 3.0);
            stats.insert(id.to_string(), stats_entry(rtt));
            endpoints.insert(id.to_string(), endpoint(id, lat, lon));
        }
        let est = estimate_location(&stats, &endpoints, None, &p).expect("estimate");
        let loose = est.band_loose.as_ref().expect("loose band");
        if loose.points >= 3 {
            let ellipse = loose.ellipse.as_ref().expect("ellipse");
            assert!(ellipse.major_km >= ellipse.minor_km);
            assert!(ellipse.major_km >= 0.0);
        }
    }

    #[test]
    fn test_zero_rtt_observations_are_excluded() {
        let mut stats = HashMap::new();
        let mut endpoints = HashMap::new();
        for (id, lat, lon) in corners() {
            stats.insert(id.to_string(), stats_entry(0.0));
            endpoints.insert(id.to_string(), endpoint(id, lat, lon));
        }
        assert!(estimate_location(&stats, &endpoints, None, &params()).is_none());
    }
}
