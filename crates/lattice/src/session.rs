// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session state for the dashboard host.
//!
//! Maintains the sliding in-memory window over the probe log and exposes the
//! typed operations the UI consumes: state snapshots, the session marker,
//! clear/reset, and calibration generate/load/clear with a pollable status.
//!
//! The loaded calibration lives behind an `ArcSwapOption`: immutable per run,
//! replaced atomically when a worker task completes, shared by reference with
//! each analysis pass.

use crate::analyze::{
    baseline::{AutoBaseline, AutoBaselineStatus},
    build_stats, deltas, drift_report, endpoint_reports, endpoints_by_id, estimate_location,
    AnalyzerParams, Calibration, Delta, DriftReport, EndpointReport, EndpointStats, Estimate,
};
use crate::clock::now_unix_ms;
use crate::config::{
    Config, Endpoint, DEFAULT_AUTO_BASELINE_MINUTES, DEFAULT_WINDOW_MINUTES, MS_PER_MIN,
};
use crate::error::{Error, Result};
use crate::health::{endpoint_hygiene, health_reports, HealthReport, Hygiene, LogWatcher};
use crate::record::{load_records, BurstRecord};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

// =======================================================================
// Calibration worker
// =======================================================================

/// What the background worker is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibKind {
    Generate,
    Load,
}

/// Pollable worker status.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibStatus {
    pub running: bool,
    pub kind: Option<CalibKind>,
    pub error: Option<String>,
    pub completed_ms: Option<i64>,
}

/// Runs calibration generate/load off the refresh path.
///
/// Results land in the shared calibration slot; errors land in the status.
/// One task at a time: starting a second returns [`Error::CalibrationRunning`].
pub struct CalibrationWorker {
    status: Arc<Mutex<CalibStatus>>,
    slot: Arc<ArcSwapOption<Calibration>>,
}

impl CalibrationWorker {
    #[must_use]
    pub fn new(slot: Arc<ArcSwapOption<Calibration>>) -> Self {
        Self {
            status: Arc::new(Mutex::new(CalibStatus::default())),
            slot,
        }
    }

    #[must_use]
    pub fn status(&self) -> CalibStatus {
        self.status.lock().clone()
    }

    /// Build a pack from `stats` at a known origin, optionally persist it,
    /// and publish it as the loaded calibration.
    pub fn try_generate(
        &self,
        stats: HashMap<String, EndpointStats>,
        endpoints: HashMap<String, Endpoint>,
        lat: f64,
        lon: f64,
        effective_speed_km_s: f64,
        out_path: Option<PathBuf>,
    ) -> Result<()> {
        self.begin(CalibKind::Generate)?;
        let status = Arc::clone(&self.status);
        let slot = Arc::clone(&self.slot);
        let spawned = thread::Builder::new()
            .name("lattice-calib".to_string())
            .spawn(move || {
                let cal = Calibration::generate(&stats, &endpoints, lat, lon, effective_speed_km_s);
                let outcome = match &out_path {
                    Some(path) => cal.save(path).map_err(|e| e.to_string()),
                    None => Ok(()),
                };
                match outcome {
                    Ok(()) => {
                        slot.store(Some(Arc::new(cal)));
                        finish(&status, None);
                    }
                    Err(msg) => finish(&status, Some(msg)),
                }
            });
        self.after_spawn(spawned)
    }

    /// Parse a pack from disk and publish it.
    pub fn try_load(&self, path: PathBuf) -> Result<()> {
        self.begin(CalibKind::Load)?;
        let status = Arc::clone(&self.status);
        let slot = Arc::clone(&self.slot);
        let spawned = thread::Builder::new()
            .name("lattice-calib".to_string())
            .spawn(move || match Calibration::load(&path) {
                Ok(cal) => {
                    slot.store(Some(Arc::new(cal)));
                    finish(&status, None);
                }
                Err(e) => finish(&status, Some(e.to_string())),
            });
        self.after_spawn(spawned)
    }

    /// A failed spawn must not leave the status stuck on running.
    fn after_spawn(&self, spawned: std::io::Result<thread::JoinHandle<()>>) -> Result<()> {
        match spawned {
            Ok(_) => Ok(()),
            Err(e) => {
                finish(&self.status, Some(e.to_string()));
                Err(e.into())
            }
        }
    }

    fn begin(&self, kind: CalibKind) -> Result<()> {
        let mut status = self.status.lock();
        if status.running {
            return Err(Error::CalibrationRunning);
        }
        *status = CalibStatus {
            running: true,
            kind: Some(kind),
            error: None,
            completed_ms: None,
        };
        Ok(())
    }
}

fn finish(status: &Mutex<CalibStatus>, error: Option<String>) {
    let mut status = status.lock();
    status.running = false;
    status.error = error;
    status.completed_ms = Some(now_unix_ms());
}

// =======================================================================
// Session state
// =======================================================================

/// Session-level tuning.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub window_minutes: f64,
    pub auto_baseline_minutes: f64,
    /// Where to persist the auto-baseline capture on lock.
    pub auto_baseline_out: Option<PathBuf>,
    /// Explicit baseline log; disables the auto-baseline when it loads.
    pub baseline_path: Option<PathBuf>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            window_minutes: DEFAULT_WINDOW_MINUTES,
            auto_baseline_minutes: DEFAULT_AUTO_BASELINE_MINUTES,
            auto_baseline_out: None,
            baseline_path: None,
        }
    }
}

/// A log-reset event surfaced to the UI.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResetNotice {
    pub reason: String,
    pub at_ms: i64,
}

/// Log presence and history.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogStatus {
    pub path: String,
    pub exists: bool,
    pub last_reset: Option<ResetNotice>,
}

/// Loaded-calibration summary for display.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationMeta {
    pub calibration_lat: f64,
    pub calibration_lon: f64,
    pub build_ms: i64,
    pub entry_count: usize,
    pub sample_count: usize,
}

/// Everything the dashboard renders in one refresh.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub now_ms: i64,
    pub records_in_window: usize,
    pub log: LogStatus,
    pub endpoint_stats: Vec<EndpointReport>,
    pub health: Vec<HealthReport>,
    pub hygiene: Hygiene,
    pub estimate: Option<Estimate>,
    pub deltas: Option<Vec<Delta>>,
    pub calibration_drift: Option<DriftReport>,
    pub calibration: Option<CalibrationMeta>,
    pub calibration_status: CalibStatus,
    pub auto_baseline: AutoBaselineStatus,
    pub session_marker_ms: Option<i64>,
    pub claimed_egress_region: Option<String>,
}

/// Owner of the sliding window and all dashboard-facing operations.
pub struct SessionState {
    cfg: Config,
    endpoints: HashMap<String, Endpoint>,
    params: AnalyzerParams,
    opts: SessionOptions,
    watcher: LogWatcher,
    window: VecDeque<BurstRecord>,
    session_marker_ms: Option<i64>,
    baseline_stats: Option<HashMap<String, EndpointStats>>,
    auto_baseline: AutoBaseline,
    calibration: Arc<ArcSwapOption<Calibration>>,
    worker: CalibrationWorker,
    last_reset: Option<ResetNotice>,
}

impl SessionState {
    /// Build session state over the config's output log.
    pub fn new(cfg: Config, params: AnalyzerParams, opts: SessionOptions) -> Result<Self> {
        cfg.validate()?;

        let baseline_stats = match &opts.baseline_path {
            Some(path) => match load_records(path) {
                Ok(records) => Some(build_stats(&records)),
                Err(e) => {
                    log::warn!("[session] baseline {} unreadable: {}", path.display(), e);
                    None
                }
            },
            None => None,
        };
        // A real baseline wins over auto-capture.
        let auto_minutes = if baseline_stats.is_some() {
            0.0
        } else {
            opts.auto_baseline_minutes
        };
        let auto_baseline = AutoBaseline::new(auto_minutes, opts.auto_baseline_out.clone());

        let calibration: Arc<ArcSwapOption<Calibration>> = Arc::new(ArcSwapOption::empty());
        let worker = CalibrationWorker::new(Arc::clone(&calibration));
        let watcher = LogWatcher::new(&cfg.output_path);
        let endpoints = endpoints_by_id(&cfg.endpoints);

        Ok(Self {
            cfg,
            endpoints,
            params,
            opts,
            watcher,
            window: VecDeque::new(),
            session_marker_ms: None,
            baseline_stats,
            auto_baseline,
            calibration,
            worker,
            last_reset: None,
        })
    }

    /// Ingest new log content and groom the window.
    pub fn refresh(&mut self) -> Result<bool> {
        let delta = self.watcher.poll()?;
        let now_ms = now_unix_ms();

        if let Some(reason) = delta.reset {
            log::warn!("[session] log reset detected: {}", reason.as_str());
            self.window.clear();
            self.auto_baseline.reset();
            self.last_reset = Some(ResetNotice {
                reason: reason.as_str().to_string(),
                at_ms: now_ms,
            });
        }
        for rec in delta.records {
            self.auto_baseline.observe(&rec);
            self.window.push_back(rec);
        }
        self.auto_baseline.maybe_finalize(now_ms);

        let cutoff = now_ms - (self.opts.window_minutes * MS_PER_MIN) as i64;
        while self
            .window
            .front()
            .map(|r| r.ts_unix_ms < cutoff)
            .unwrap_or(false)
        {
            self.window.pop_front();
        }
        Ok(delta.exists)
    }

    /// Start treating "now" as the session of interest.
    pub fn mark_session(&mut self) {
        self.session_marker_ms = Some(now_unix_ms());
    }

    /// Forget in-memory state; optionally truncate the log on disk too.
    pub fn clear_state(&mut self, truncate_log: bool) -> Result<()> {
        self.window.clear();
        self.session_marker_ms = None;
        self.auto_baseline.reset();
        self.last_reset = None;
        if truncate_log {
            std::fs::File::create(&self.cfg.output_path)?;
            // Self-inflicted truncation is not a reset event.
            self.watcher = LogWatcher::new(&self.cfg.output_path);
        }
        Ok(())
    }

    /// One full snapshot for the UI.
    pub fn get_state(&mut self) -> Result<StateSnapshot> {
        let exists = self.refresh()?;
        let now_ms = now_unix_ms();
        let eff_speed = self.params.effective_speed_km_s();
        let calibration = self.calibration.load_full();
        let cal_ref = calibration.as_deref();

        let session_records: Vec<BurstRecord> = match self.session_marker_ms {
            Some(marker) => self
                .window
                .iter()
                .filter(|r| r.ts_unix_ms >= marker)
                .cloned()
                .collect(),
            None => self.window.iter().cloned().collect(),
        };
        let session_stats = build_stats(&session_records);

        let baseline_stats = self
            .baseline_stats
            .as_ref()
            .or_else(|| self.auto_baseline.stats());
        let delta_rows = baseline_stats.map(|b| deltas(b, &session_stats));
        let drift =
            cal_ref.and_then(|cal| drift_report(cal, &session_stats, &self.endpoints, eff_speed));

        Ok(StateSnapshot {
            now_ms,
            records_in_window: session_records.len(),
            log: LogStatus {
                path: self.cfg.output_path.clone(),
                exists,
                last_reset: self.last_reset.clone(),
            },
            endpoint_stats: endpoint_reports(&session_stats, &self.endpoints, eff_speed, cal_ref),
            health: health_reports(
                &session_records,
                self.cfg.samples_per_endpoint,
                self.cfg.interval_seconds,
                self.opts.window_minutes,
            ),
            hygiene: endpoint_hygiene(&self.cfg.endpoints),
            estimate: estimate_location(
                &session_stats,
                &self.endpoints,
                cal_ref,
                &self.params.fit_params(),
            ),
            deltas: delta_rows,
            calibration_drift: drift,
            calibration: cal_ref.map(|cal| CalibrationMeta {
                calibration_lat: cal.calibration_lat,
                calibration_lon: cal.calibration_lon,
                build_ms: cal.build_ms,
                entry_count: cal.entries.len(),
                sample_count: cal.sample_count,
            }),
            calibration_status: self.worker.status(),
            auto_baseline: self.auto_baseline.status(),
            session_marker_ms: self.session_marker_ms,
            claimed_egress_region: self.cfg.claimed_egress_region.clone(),
        })
    }

    /// Kick off pack generation from the best window available.
    ///
    /// Prefers the locked baseline window (known-good, pre-tunnel) over the
    /// live session window.
    pub fn generate_calibration(
        &mut self,
        lat: f64,
        lon: f64,
        out_path: Option<PathBuf>,
    ) -> Result<()> {
        self.refresh()?;
        let session_records: Vec<BurstRecord> = self.window.iter().cloned().collect();
        let stats = self
            .baseline_stats
            .clone()
            .or_else(|| self.auto_baseline.stats().cloned())
            .unwrap_or_else(|| build_stats(&session_records));
        self.worker.try_generate(
            stats,
            self.endpoints.clone(),
            lat,
            lon,
            self.params.effective_speed_km_s(),
            out_path,
        )
    }

    /// Load a pack from disk on the worker.
    pub fn load_calibration(&self, path: PathBuf) -> Result<()> {
        self.worker.try_load(path)
    }

    /// Drop the loaded calibration immediately.
    pub fn clear_calibration(&self) {
        self.calibration.store(None);
    }

    #[must_use]
    pub fn calibration_status(&self) -> CalibStatus {
        self.worker.status()
    }

    /// The loaded calibration, if any.
    #[must_use]
    pub fn calibration(&self) -> Option<Arc<Calibration>> {
        self.calibration.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_PORT, Endpoint};
    use crate::record::test_record;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_config(output_path: &str) -> Config {
        Config {
            secret_hex: "00112233445566778899aabbccddeeff".to_string(),
            endpoints: vec![Endpoint {
                id: "a".to_string(),
                host: "127.0.0.1".to_string(),
                port: DEFAULT_PORT,
                region_hint: Some("eu".to_string()),
                lat: Some(1.0),
                lon: Some(2.0),
            }],
            probe_paths: Vec::new(),
            samples_per_endpoint: 5,
            spacing_ms: 10,
            timeout_ms: 200,
            interval_seconds: 10,
            pacing_spin_us: 0,
            output_path: output_path.to_string(),
            claimed_egress_region: None,
            physics_mismatch_threshold_ms: 30.0,
        }
    }

    fn append_record(path: &std::path::Path, id: &str, samples: Vec<f64>) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open log");
        let line = serde_json::to_string(&test_record(id, samples)).expect("serialize");
        writeln!(file, "{}", line).expect("append");
    }

    fn wait_for_worker(state: &SessionState) {
        for _ in 0..100 {
            if !state.calibration_status().running {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("calibration worker did not finish");
    }

    #[test]
    fn test_snapshot_reflects_appended_records() {
        let dir = tempdir().expect("tempdir");
        let log = dir.path().join("probe.jsonl");
        let cfg = test_config(log.to_str().expect("utf8 path"));
        let mut state =
            SessionState::new(cfg, AnalyzerParams::default(), SessionOptions::default())
                .expect("session");

        append_record(&log, "a", vec![10.0, 12.0, 11.0]);
        let snap = state.get_state().expect("snapshot");
        assert!(snap.log.exists);
        assert_eq!(snap.records_in_window, 1);
        assert_eq!(snap.endpoint_stats.len(), 1);
        assert_eq!(snap.health.len(), 1);
        assert!(snap.estimate.is_none(), "one endpoint cannot locate");
        assert!(snap.auto_baseline.enabled);
    }

    #[test]
    fn test_missing_log_is_status_not_error() {
        let dir = tempdir().expect("tempdir");
        let log = dir.path().join("absent.jsonl");
        let cfg = test_config(log.to_str().expect("utf8 path"));
        let mut state =
            SessionState::new(cfg, AnalyzerParams::default(), SessionOptions::default())
                .expect("session");
        let snap = state.get_state().expect("snapshot");
        assert!(!snap.log.exists);
        assert_eq!(snap.records_in_window, 0);
    }

    #[test]
    fn test_session_marker_filters_window() {
        let dir = tempdir().expect("tempdir");
        let log = dir.path().join("probe.jsonl");
        let cfg = test_config(log.to_str().expect("utf8 path"));
        let mut state =
            SessionState::new(cfg, AnalyzerParams::default(), SessionOptions::default())
                .expect("session");

        append_record(&log, "a", vec![10.0]);
        state.get_state().expect("ingest");
        thread::sleep(Duration::from_millis(5));
        state.mark_session();
        thread::sleep(Duration::from_millis(5));
        append_record(&log, "a", vec![20.0]);

        let snap = state.get_state().expect("snapshot");
        assert_eq!(snap.records_in_window, 1, "pre-marker record filtered");
        assert!(snap.session_marker_ms.is_some());
    }

    #[test]
    fn test_log_truncation_surfaces_reset_notice() {
        let dir = tempdir().expect("tempdir");
        let log = dir.path().join("probe.jsonl");
        let cfg = test_config(log.to_str().expect("utf8 path"));
        let mut state =
            SessionState::new(cfg, AnalyzerParams::default(), SessionOptions::default())
                .expect("session");

        append_record(&log, "a", vec![10.0]);
        append_record(&log, "a", vec![11.0]);
        state.get_state().expect("ingest");

        std::fs::write(&log, b"").expect("truncate");
        append_record(&log, "a", vec![5.0]);
        let snap = state.get_state().expect("snapshot");
        let reset = snap.log.last_reset.expect("reset notice");
        assert_eq!(reset.reason, "truncated");
        assert_eq!(snap.records_in_window, 1, "window reseeded from new content");
    }

    #[test]
    fn test_clear_state_with_truncate_empties_log_silently() {
        let dir = tempdir().expect("tempdir");
        let log = dir.path().join("probe.jsonl");
        let cfg = test_config(log.to_str().expect("utf8 path"));
        let mut state =
            SessionState::new(cfg, AnalyzerParams::default(), SessionOptions::default())
                .expect("session");

        append_record(&log, "a", vec![10.0]);
        state.get_state().expect("ingest");
        state.clear_state(true).expect("clear");

        let snap = state.get_state().expect("snapshot");
        assert_eq!(snap.records_in_window, 0);
        assert!(snap.log.last_reset.is_none(), "self-truncation is not a reset");
        assert_eq!(std::fs::metadata(&log).expect("meta").len(), 0);
    }

    #[test]
    fn test_calibration_generate_publishes_and_reports() {
        let dir = tempdir().expect("tempdir");
        let log = dir.path().join("probe.jsonl");
        let out = dir.path().join("cal.json");
        let cfg = test_config(log.to_str().expect("utf8 path"));
        let mut state =
            SessionState::new(cfg, AnalyzerParams::default(), SessionOptions::default())
                .expect("session");

        append_record(&log, "a", vec![10.0, 10.0, 10.0]);
        state
            .generate_calibration(1.0, 2.0, Some(out.clone()))
            .expect("start generate");
        wait_for_worker(&state);

        let status = state.calibration_status();
        assert_eq!(status.error, None);
        assert_eq!(status.kind, Some(CalibKind::Generate));
        let cal = state.calibration().expect("published pack");
        assert_eq!(cal.entries.len(), 1);
        assert!(out.exists());

        state.clear_calibration();
        assert!(state.calibration().is_none());
    }

    #[test]
    fn test_load_surfaces_parse_error_in_status() {
        let dir = tempdir().expect("tempdir");
        let log = dir.path().join("probe.jsonl");
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{nope").expect("write");
        let cfg = test_config(log.to_str().expect("utf8 path"));
        let state = SessionState::new(cfg, AnalyzerParams::default(), SessionOptions::default())
            .expect("session");

        state.load_calibration(bad).expect("start load");
        for _ in 0..100 {
            if !state.calibration_status().running {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let status = state.calibration_status();
        assert!(status.error.is_some());
        assert!(state.calibration().is_none());
    }
}
