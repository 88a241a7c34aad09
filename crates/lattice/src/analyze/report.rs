// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-endpoint physics bounds.
//!
//! Each endpoint with samples induces a disk around its coordinates: the RTT
//! quantile, minus calibration bias, bounds how far away the origin can be at
//! the effective signal speed. Tight uses p05, loose uses p95.

use crate::analyze::calibrate::{adjust_rtt_ms, Calibration};
use crate::analyze::stats::EndpointStats;
use crate::config::{Endpoint, MS_PER_SEC, RTT_FACTOR};
use serde::Serialize;
use std::collections::HashMap;

use super::calibrate::lookup_endpoint;

/// Window stats plus physics budgets for one endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointReport {
    pub id: String,
    pub host: String,
    pub count: usize,
    pub p05_ms: Option<f64>,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    /// p05 after calibration bias removal.
    pub p05_adj_ms: Option<f64>,
    pub p95_adj_ms: Option<f64>,
    pub max_dist_km_tight: Option<f64>,
    pub max_dist_km_loose: Option<f64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

/// Maximum origin distance for an RTT budget at the effective speed.
///
/// Non-negative for any input; strictly positive iff the budget is.
#[must_use]
pub fn max_distance_km(budget_ms: f64, effective_speed_km_s: f64) -> f64 {
    let budget = budget_ms.max(0.0);
    budget / RTT_FACTOR / MS_PER_SEC * effective_speed_km_s
}

/// Build one report per endpoint with samples, sorted by id.
#[must_use]
pub fn endpoint_reports(
    stats: &HashMap<String, EndpointStats>,
    endpoints: &HashMap<String, Endpoint>,
    effective_speed_km_s: f64,
    calibration: Option<&Calibration>,
) -> Vec<EndpointReport> {
    let mut ids: Vec<&String> = stats.keys().collect();
    ids.sort();

    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let st = &stats[id];
        let ep = lookup_endpoint(endpoints, id);
        let p05_adj = st.p05.map(|v| adjust_rtt_ms(calibration, v, id));
        let p95_adj = st.p95.map(|v| adjust_rtt_ms(calibration, v, id));
        out.push(EndpointReport {
            id: id.clone(),
            host: ep.map(|e| e.host.clone()).unwrap_or_else(|| "?".to_string()),
            count: st.count,
            p05_ms: st.p05,
            p50_ms: st.p50,
            p95_ms: st.p95,
            jitter_ms: st.jitter_ms,
            p05_adj_ms: p05_adj,
            p95_adj_ms: p95_adj,
            max_dist_km_tight: p05_adj.map(|v| max_distance_km(v, effective_speed_km_s)),
            max_dist_km_loose: p95_adj.map(|v| max_distance_km(v, effective_speed_km_s)),
            lat: ep.and_then(|e| e.lat),
            lon: ep.and_then(|e| e.lon),
        });
    }
    out
}
