// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Burst records and the append-only JSONL sink.
//!
//! One record per endpoint per burst, one JSON object per line. The sink owns
//! the only file handle and serializes writes, so records from concurrent
//! probe workers interleave at record granularity, never within a record.

use crate::error::{Error, Result};
use crate::probe::netmon::TunnelInterface;
use crossbeam::channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

/// One burst's outcome for one `(path, endpoint)`.
///
/// When `samples_ms` is empty every summary field is `None` and the record
/// documents loss; otherwise `min <= p05 <= median`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BurstRecord {
    pub ts_unix_ms: i64,
    pub endpoint_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub probe_path: String,
    #[serde(default)]
    pub probe_bind_iface: String,
    #[serde(default)]
    pub probe_bind_ip: String,
    #[serde(default)]
    pub local_addr: String,
    pub region_hint: Option<String>,
    pub samples_ms: Vec<f64>,
    pub min_ms: Option<f64>,
    pub p05_ms: Option<f64>,
    pub median_ms: Option<f64>,
    /// Interface class: wifi, ethernet, cellular, loopback, other.
    pub iface: String,
    #[serde(default)]
    pub iface_name: String,
    #[serde(default)]
    pub iface_is_tunnel: bool,
    #[serde(default)]
    pub utun_present: bool,
    #[serde(default)]
    pub utun_active: bool,
    #[serde(default)]
    pub utun_interfaces: Vec<TunnelInterface>,
    #[serde(default)]
    pub dest_is_loopback: bool,
    pub claimed_egress_region: Option<String>,
    pub notes: Vec<String>,
}

/// Append-only JSONL writer fed from a channel.
///
/// Probe workers clone the sender; the single writer thread drains it and
/// appends line-atomically, flushing after each record so the analyzer and
/// log watcher see fresh data.
pub struct RecordSink {
    tx: Option<Sender<BurstRecord>>,
    handle: Option<JoinHandle<()>>,
}

impl RecordSink {
    /// Create parent directories, open the log for append, start the writer.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let (tx, rx) = unbounded::<BurstRecord>();
        let handle = thread::Builder::new()
            .name("lattice-sink".to_string())
            .spawn(move || writer_loop(path, file, rx))?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Channel end handed to probe workers.
    #[must_use]
    pub fn sender(&self) -> Sender<BurstRecord> {
        self.tx
            .as_ref()
            .expect("sender only taken while the sink is open")
            .clone()
    }

    /// Drop the sender and wait for the writer to drain.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RecordSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn writer_loop(path: PathBuf, file: File, rx: Receiver<BurstRecord>) {
    let mut writer = BufWriter::new(file);
    for rec in rx {
        if let Err(e) = serde_json::to_writer(&mut writer, &rec) {
            log::warn!("[sink] serialize failed for {}: {}", rec.endpoint_id, e);
            continue;
        }
        if let Err(e) = writer.write_all(b"\n").and_then(|()| writer.flush()) {
            log::warn!("[sink] write to {} failed: {}", path.display(), e);
        }
    }
    let _ = writer.flush();
    log::debug!("[sink] writer for {} drained", path.display());
}

/// Read every parseable record from a JSONL log.
///
/// Blank and corrupt lines are skipped: a truncated tail from a crashed
/// writer must not poison the whole session.
pub fn load_records<P: AsRef<Path>>(path: P) -> Result<Vec<BurstRecord>> {
    let file = File::open(path.as_ref()).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::LogMissing(path.as_ref().display().to_string())
        } else {
            Error::Io(e)
        }
    })?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(rec) = serde_json::from_str::<BurstRecord>(&line) {
            out.push(rec);
        }
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) fn test_record(endpoint_id: &str, samples_ms: Vec<f64>) -> BurstRecord {
    use crate::probe::stats::summarize;

    let summary = summarize(&samples_ms);
    BurstRecord {
        ts_unix_ms: crate::clock::now_unix_ms(),
        endpoint_id: endpoint_id.to_string(),
        host: "127.0.0.1".to_string(),
        port: crate::config::DEFAULT_PORT,
        probe_path: "default".to_string(),
        probe_bind_iface: String::new(),
        probe_bind_ip: String::new(),
        local_addr: String::new(),
        region_hint: None,
        samples_ms,
        min_ms: summary.min_ms,
        p05_ms: summary.p05_ms,
        median_ms: summary.median_ms,
        iface: "loopback".to_string(),
        iface_name: "lo".to_string(),
        iface_is_tunnel: false,
        utun_present: false,
        utun_active: false,
        utun_interfaces: Vec::new(),
        dest_is_loopback: true,
        claimed_egress_region: None,
        notes: Vec::new(),
    }
}
