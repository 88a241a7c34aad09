// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! lattice-client - the probe engine binary.
//!
//! Fans paced bursts out to every configured `(path, endpoint)`, prints one
//! status line per burst, and appends records to the JSONL log.

use clap::Parser;
use colored::Colorize;
use crossbeam::channel::{unbounded, RecvTimeoutError};
use lattice::config::Config;
use lattice::probe::ProbeEngine;
use lattice::record::{BurstRecord, RecordSink};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Latency probe client
#[derive(Parser, Debug)]
#[command(name = "lattice-client")]
#[command(about = "Emit authenticated UDP probe bursts per the config")]
struct Args {
    /// Path to the configuration document (JSON)
    config: PathBuf,

    /// Quiet mode - only log warnings, no per-burst lines
    #[arg(long)]
    quiet: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = Config::load(&args.config)?;
    let secret = lattice::secret::from_hex(&cfg.secret_hex)?;
    let output_path = expand_tilde(&cfg.output_path);

    if !args.quiet {
        eprintln!("{} LATTICE probe client", ">>>".green().bold());
        eprintln!("    endpoints: {}", cfg.endpoints.len());
        eprintln!("    paths:     {}", cfg.probe_paths.len().max(1));
        eprintln!("    interval:  {}s", cfg.interval_seconds);
        eprintln!("    output:    {}", output_path.display());
        if let Some(claimed) = &cfg.claimed_egress_region {
            eprintln!("    claimed:   {}", claimed);
        }
    }

    let sink = RecordSink::open(&output_path)?;
    let sink_tx = sink.sender();

    // Records flow engine -> here (status line) -> sink.
    let (tx, rx) = unbounded::<BurstRecord>();
    let mut engine = ProbeEngine::start(Arc::new(cfg), Arc::new(secret), tx);

    let stop = Arc::new(AtomicBool::new(false));
    let stop_handler = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        stop_handler.store(true, Ordering::SeqCst);
    })?;

    while !stop.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(rec) => {
                if !args.quiet {
                    print_burst_line(&rec);
                }
                if sink_tx.send(rec).is_err() {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if !args.quiet {
        eprintln!("{}", "    Stopping...".dimmed());
    }
    engine.stop();
    drop(sink_tx);
    sink.close();
    Ok(())
}

fn print_burst_line(rec: &BurstRecord) {
    if !rec.notes.is_empty() {
        println!(
            "{} {} {}",
            "[!]".yellow().bold(),
            rec.endpoint_id,
            rec.notes.join(" | ")
        );
    } else if let (Some(min), Some(p05), Some(med)) = (rec.min_ms, rec.p05_ms, rec.median_ms) {
        println!(
            "{} {} min={:.1}ms p05={:.1}ms med={:.1}ms",
            "[ok]".green(),
            rec.endpoint_id,
            min,
            p05,
            med
        );
    } else {
        println!(
            "{} {} no samples (timeout?)",
            "[??]".red(),
            rec.endpoint_id
        );
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
