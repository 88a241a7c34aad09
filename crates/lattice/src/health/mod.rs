// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Endpoint health and configuration hygiene.

pub mod logwatch;

pub use logwatch::{LogDelta, LogWatcher, ResetReason};

use crate::config::Endpoint;
use crate::record::BurstRecord;
use serde::Serialize;
use std::collections::HashMap;

/// Sample-completeness report for one endpoint over the analysis window.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub id: String,
    pub burst_count: usize,
    pub sample_count: usize,
    pub expected_samples: usize,
    /// `100 * (1 - actual/expected)`, clamped to [0, 100].
    pub loss_pct: f64,
    pub last_seen_ms: Option<i64>,
}

/// Health per endpoint, sorted by id.
///
/// The expectation is schedule-derived: `ceil(window_minutes * 60 /
/// interval_seconds)` bursts of `samples_per_endpoint` each.
#[must_use]
pub fn health_reports(
    records: &[BurstRecord],
    samples_per_endpoint: usize,
    interval_seconds: u64,
    window_minutes: f64,
) -> Vec<HealthReport> {
    let expected_bursts = if interval_seconds == 0 {
        0
    } else {
        (window_minutes * 60.0 / interval_seconds as f64).ceil() as usize
    };
    let expected_samples = expected_bursts * samples_per_endpoint;

    let mut per_endpoint: HashMap<&str, (usize, usize, Option<i64>)> = HashMap::new();
    for rec in records {
        let entry = per_endpoint
            .entry(rec.endpoint_id.as_str())
            .or_insert((0, 0, None));
        entry.0 += 1;
        entry.1 += rec.samples_ms.len();
        entry.2 = Some(entry.2.map_or(rec.ts_unix_ms, |t: i64| t.max(rec.ts_unix_ms)));
    }

    let mut ids: Vec<&&str> = per_endpoint.keys().collect();
    ids.sort();
    ids.iter()
        .map(|id| {
            let (burst_count, sample_count, last_seen_ms) = per_endpoint[**id];
            let loss_pct = if expected_samples == 0 {
                0.0
            } else {
                ((1.0 - sample_count as f64 / expected_samples as f64) * 100.0).clamp(0.0, 100.0)
            };
            HealthReport {
                id: (**id).to_string(),
                burst_count,
                sample_count,
                expected_samples,
                loss_pct,
                last_seen_ms,
            }
        })
        .collect()
}

/// Endpoints sharing one host.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateHostGroup {
    pub host: String,
    pub ids: Vec<String>,
}

/// Config-quality findings that degrade analysis without breaking it.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Hygiene {
    /// Endpoints the estimator and claim checks must skip.
    pub missing_coords: Vec<String>,
    /// Endpoints the region detector cannot match.
    pub missing_region: Vec<String>,
    pub duplicate_hosts: Vec<DuplicateHostGroup>,
}

/// Enumerate hygiene findings over the loaded endpoint set.
#[must_use]
pub fn endpoint_hygiene(endpoints: &[Endpoint]) -> Hygiene {
    let mut missing_coords = Vec::new();
    let mut missing_region = Vec::new();
    let mut host_map: HashMap<&str, Vec<String>> = HashMap::new();

    for ep in endpoints {
        if ep.lat.is_none() || ep.lon.is_none() {
            missing_coords.push(ep.id.clone());
        }
        if ep
            .region_hint
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .is_empty()
        {
            missing_region.push(ep.id.clone());
        }
        if !ep.host.is_empty() {
            host_map.entry(ep.host.as_str()).or_default().push(ep.id.clone());
        }
    }

    let mut duplicate_hosts: Vec<DuplicateHostGroup> = host_map
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(host, ids)| DuplicateHostGroup {
            host: host.to_string(),
            ids,
        })
        .collect();
    duplicate_hosts.sort_by(|a, b| a.host.cmp(&b.host));

    Hygiene {
        missing_coords,
        missing_region,
        duplicate_hosts,
    }
}
