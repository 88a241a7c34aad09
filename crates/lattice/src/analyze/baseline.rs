// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Baseline/session comparison and the auto-baseline capture window.
//!
//! The auto-baseline records the first N minutes of a fresh log (by record
//! timestamp), locks once the window has elapsed, and thereafter serves as
//! the implicit baseline for deltas and drift.

use crate::analyze::stats::{build_stats, EndpointStats};
use crate::config::MS_PER_MIN;
use crate::record::BurstRecord;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// Per-endpoint p05 shift between a baseline and the current session.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub id: String,
    pub delta_p05_ms: f64,
    pub baseline_p05_ms: f64,
    pub session_p05_ms: f64,
}

/// Deltas for every endpoint present in both windows, sorted by id.
#[must_use]
pub fn deltas(
    baseline: &HashMap<String, EndpointStats>,
    session: &HashMap<String, EndpointStats>,
) -> Vec<Delta> {
    let mut ids: Vec<&String> = baseline.keys().collect();
    ids.sort();

    let mut out = Vec::new();
    for id in ids {
        let Some(s) = session.get(id) else { continue };
        let b = &baseline[id];
        let (Some(bv), Some(sv)) = (b.p05, s.p05) else {
            continue;
        };
        out.push(Delta {
            id: id.clone(),
            delta_p05_ms: sv - bv,
            baseline_p05_ms: bv,
            session_p05_ms: sv,
        });
    }
    out
}

/// Publicly visible auto-baseline progress.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoBaselineStatus {
    pub enabled: bool,
    pub minutes: f64,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
    pub complete: bool,
}

/// Capture window for the implicit baseline.
#[derive(Debug)]
pub struct AutoBaseline {
    minutes: f64,
    out_path: Option<PathBuf>,
    start_ms: Option<i64>,
    end_ms: Option<i64>,
    records: Vec<BurstRecord>,
    complete: bool,
    stats: Option<HashMap<String, EndpointStats>>,
}

impl AutoBaseline {
    /// A window of `minutes` (disabled when 0), optionally persisted to
    /// `out_path` as JSONL on lock.
    #[must_use]
    pub fn new(minutes: f64, out_path: Option<PathBuf>) -> Self {
        Self {
            minutes,
            out_path,
            start_ms: None,
            end_ms: None,
            records: Vec::new(),
            complete: false,
            stats: None,
        }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.minutes > 0.0
    }

    /// Feed a record; the first one anchors the window.
    pub fn observe(&mut self, rec: &BurstRecord) {
        if !self.enabled() || self.complete {
            return;
        }
        let ts = rec.ts_unix_ms;
        if self.start_ms.is_none() {
            self.start_ms = Some(ts);
            self.end_ms = Some(ts + (self.minutes * MS_PER_MIN) as i64);
        }
        if ts <= self.end_ms.unwrap_or(i64::MAX) {
            self.records.push(rec.clone());
        }
    }

    /// Lock the window once wall time has passed its end.
    ///
    /// Returns `true` on the transition. Locking computes the baseline stats
    /// and, when configured, writes the captured records out as JSONL.
    pub fn maybe_finalize(&mut self, now_ms: i64) -> bool {
        if !self.enabled() || self.complete {
            return false;
        }
        let Some(end_ms) = self.end_ms else {
            return false;
        };
        if now_ms < end_ms {
            return false;
        }

        self.stats = Some(build_stats(&self.records));
        if let Some(path) = &self.out_path {
            if let Err(e) = write_jsonl(path, &self.records) {
                log::warn!("[baseline] failed to persist capture to {}: {}", path.display(), e);
            }
        }
        self.records = Vec::new();
        self.complete = true;
        log::info!("[baseline] auto-baseline locked after {} minutes", self.minutes);
        true
    }

    /// Baseline stats, available once locked.
    #[must_use]
    pub fn stats(&self) -> Option<&HashMap<String, EndpointStats>> {
        self.stats.as_ref()
    }

    #[must_use]
    pub fn status(&self) -> AutoBaselineStatus {
        AutoBaselineStatus {
            enabled: self.enabled(),
            minutes: self.minutes,
            start_ms: self.start_ms,
            end_ms: self.end_ms,
            complete: self.complete,
        }
    }

    /// Forget everything, e.g. after a log reset.
    pub fn reset(&mut self) {
        self.start_ms = None;
        self.end_ms = None;
        self.records.clear();
        self.complete = false;
        self.stats = None;
    }
}

fn write_jsonl(path: &PathBuf, records: &[BurstRecord]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = fs::File::create(path)?;
    for rec in records {
        let line = serde_json::to_string(rec)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
    }
    Ok(())
}
