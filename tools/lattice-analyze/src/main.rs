// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! lattice-analyze - offline analysis over JSONL probe logs.
//!
//! Computes per-endpoint physics bounds, falsifies a claimed egress location,
//! estimates a coarse origin, and compares a session window to a baseline.

use clap::Parser;
use colored::Colorize;
use lattice::analyze::{
    analyze_session, endpoints_by_id, AnalysisOutput, AnalyzerParams, Calibration,
};
use lattice::config::{
    Config, DEFAULT_BAND_FACTOR_LOOSE, DEFAULT_BAND_FACTOR_TIGHT, DEFAULT_BAND_WINDOW_DEG,
    DEFAULT_GRID_DEG, DEFAULT_PATH_STRETCH, DEFAULT_REFINE_DEG, DEFAULT_SPEED_KM_S,
};
use lattice::record::load_records;
use std::path::PathBuf;

/// Offline probe-log analyzer
#[derive(Parser, Debug)]
#[command(name = "lattice-analyze")]
#[command(about = "Analyze LATTICE JSONL logs for physics bounds and location estimates")]
struct Args {
    /// Configuration document (endpoint coordinates come from here)
    #[arg(long)]
    config: PathBuf,

    /// Session log (JSONL)
    #[arg(long)]
    session: PathBuf,

    /// Optional baseline log (JSONL)
    #[arg(long)]
    baseline: Option<PathBuf>,

    /// Claimed egress latitude to falsify
    #[arg(long)]
    claim_lat: Option<f64>,

    /// Claimed egress longitude to falsify
    #[arg(long)]
    claim_lon: Option<f64>,

    /// Calibration pack to apply
    #[arg(long)]
    calibration: Option<PathBuf>,

    /// Write a calibration pack here (requires --calib-lat/--calib-lon)
    #[arg(long)]
    calibration_out: Option<PathBuf>,

    /// Known latitude for calibration generation
    #[arg(long)]
    calib_lat: Option<f64>,

    /// Known longitude for calibration generation
    #[arg(long)]
    calib_lon: Option<f64>,

    /// Coarse grid step, degrees
    #[arg(long, default_value_t = DEFAULT_GRID_DEG)]
    grid: f64,

    /// Refinement grid step, degrees
    #[arg(long, default_value_t = DEFAULT_REFINE_DEG)]
    refine: f64,

    /// Signal speed in fiber, km/s
    #[arg(long, default_value_t = DEFAULT_SPEED_KM_S)]
    speed_km_s: f64,

    /// Routing stretch factor (>= 1.0 widens bounds)
    #[arg(long, default_value_t = DEFAULT_PATH_STRETCH)]
    path_stretch: f64,

    /// Loose-band SSE factor; the tight factor scales down proportionally
    #[arg(long, default_value_t = DEFAULT_BAND_FACTOR_LOOSE)]
    band_factor: f64,

    /// Half-width of the band scan around the best cell, degrees
    #[arg(long, default_value_t = DEFAULT_BAND_WINDOW_DEG)]
    band_window_deg: f64,

    /// Emit the full analysis as JSON
    #[arg(long)]
    json: bool,
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
    let params = analyzer_params(args);

    let session_records = load_records(&args.session)?;
    let baseline_records = match &args.baseline {
        Some(path) => Some(load_records(path)?),
        None => None,
    };

    let mut calibration = match &args.calibration {
        Some(path) => Some(Calibration::load(path)?),
        None => None,
    };

    if let Some(out_path) = &args.calibration_out {
        let (lat, lon) = match (args.calib_lat, args.calib_lon) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => {
                return Err("--calibration-out requires --calib-lat and --calib-lon".into());
            }
        };
        // Prefer the baseline window (known-good) as the calibration source.
        let source = baseline_records.as_deref().unwrap_or(&session_records);
        let stats = lattice::analyze::build_stats(source);
        let cal = Calibration::generate(
            &stats,
            &endpoints_by_id(&cfg.endpoints),
            lat,
            lon,
            params.effective_speed_km_s(),
        );
        cal.save(out_path)?;
        if !args.json {
            println!(
                "Calibration pack written to {} ({} endpoints)",
                out_path.display(),
                cal.entries.len()
            );
        }
        calibration = Some(cal);
    }

    let claim = match (args.claim_lat, args.claim_lon) {
        (Some(lat), Some(lon)) => Some((lat, lon)),
        _ => None,
    };

    let output = analyze_session(
        &cfg,
        &session_records,
        baseline_records.as_deref(),
        claim,
        calibration.as_ref(),
        &params,
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_human(&output, args);
    }
    Ok(())
}

fn analyzer_params(args: &Args) -> AnalyzerParams {
    // The CLI exposes one band factor; it drives the loose band and the tight
    // factor scales down in the default 1.5:4.0 ratio (floored at 1.0).
    let tight_ratio = DEFAULT_BAND_FACTOR_TIGHT / DEFAULT_BAND_FACTOR_LOOSE;
    AnalyzerParams {
        speed_km_s: args.speed_km_s,
        path_stretch: args.path_stretch,
        grid_deg: args.grid,
        refine_deg: args.refine,
        band_factor_tight: (args.band_factor * tight_ratio).max(1.0),
        band_factor_loose: args.band_factor.max(1.0),
        band_window_deg: args.band_window_deg,
    }
}

fn print_human(output: &AnalysisOutput, args: &Args) {
    if output.params.path_stretch != args.path_stretch {
        println!(
            "Note: path_stretch < 1.0 is invalid; clamped to {:.2}",
            output.params.path_stretch
        );
    }

    println!(
        "{} {} records",
        "Session:".bold(),
        output.session.records
    );
    print_stats_summary(&output.session);

    if let Some(checks) = &output.claim_checks {
        println!(
            "\n{} lat={:.4}, lon={:.4}",
            "Claim check:".bold(),
            args.claim_lat.unwrap_or(f64::NAN),
            args.claim_lon.unwrap_or(f64::NAN)
        );
        for c in checks {
            let falsify_tight = c.falsify_tight.unwrap_or(false);
            let line = format!(
                "- {} dist={:.1}km max_tight={:.1} max_loose={:.1} falsify_tight={} falsify_loose={}",
                c.id,
                c.dist_km,
                c.max_tight_km.unwrap_or(f64::NAN),
                c.max_loose_km.unwrap_or(f64::NAN),
                falsify_tight,
                c.falsify_loose.unwrap_or(false)
            );
            if falsify_tight {
                println!("{}", line.red());
            } else {
                println!("{}", line);
            }
        }
        if let Some(verdict) = &output.claim_verdict {
            let text = if verdict.strongly_falsified {
                "STRONGLY FALSIFIED".red().bold()
            } else if verdict.falsified {
                "FALSIFIED".red().bold()
            } else {
                "not falsified".green().bold()
            };
            println!(
                "  verdict: {} ({} tight, {} loose)",
                text, verdict.tight_count, verdict.loose_count
            );
        }
    }

    match &output.session.estimate {
        Some(est) => {
            println!(
                "\n{} (treats RTTs as direct path; for VPN this approximates the exit)",
                "Session estimate".bold()
            );
            print_estimate(est);
        }
        None => println!(
            "\n{} insufficient endpoint data (need lat/lon + RTTs on >=3 endpoints).",
            "Session estimate:".bold()
        ),
    }

    if let Some(baseline) = &output.baseline {
        println!("\n{} {} records", "Baseline:".bold(), baseline.records);
        print_stats_summary(baseline);
        if let Some(est) = &baseline.estimate {
            println!("\n{}", "Baseline estimate".bold());
            print_estimate(est);
        }
        if let Some(deltas) = &output.deltas {
            println!("\n{}", "Baseline vs session deltas (p05):".bold());
            for d in deltas {
                println!(
                    "- {} delta_p05={:+.2}ms (baseline {:.2} -> session {:.2})",
                    d.id, d.delta_p05_ms, d.baseline_p05_ms, d.session_p05_ms
                );
            }
        }
        if let Some(sep) = output.estimate_separation_km {
            println!(
                "\nEstimate separation: {:.1} km (a tunnel often shifts the fit toward its exit)",
                sep
            );
        }
    }

    if let Some(drift) = &output.calibration_drift {
        println!("\n{}", "Calibration drift:".bold());
        println!(
            "- {} endpoints, median |delta|={:.2}ms, max |delta|={:.2}ms{}",
            drift.count,
            drift.median_abs_ms,
            drift.max_abs_ms,
            if drift.warn {
                " [stale?]".yellow().to_string()
            } else {
                String::new()
            }
        );
        for w in &drift.worst {
            println!("  worst: {} {:+.2}ms", w.id, w.delta_ms);
        }
    }
}

fn print_stats_summary(view: &lattice::analyze::SessionView) {
    println!("\n{} endpoint stats (p05/p50/p95 in ms):", view.label);
    for r in &view.endpoint_stats {
        println!(
            "- {} ({}) count={} p05={:.2} p50={:.2} p95={:.2} jitter={:.2}",
            r.id,
            r.host,
            r.count,
            r.p05_ms.unwrap_or(f64::NAN),
            r.p50_ms.unwrap_or(f64::NAN),
            r.p95_ms.unwrap_or(f64::NAN),
            r.jitter_ms.unwrap_or(f64::NAN)
        );
        if let (Some(tight), Some(loose)) = (r.max_dist_km_tight, r.max_dist_km_loose) {
            println!("  max_dist_km tight={:.1} loose={:.1}", tight, loose);
        }
    }
}

fn print_estimate(est: &lattice::analyze::Estimate) {
    println!(
        "- lat={:.4}, lon={:.4}, bias={:.2}ms, sse={:.2}, endpoints_used={}",
        est.lat, est.lon, est.bias_ms, est.sse, est.points
    );
    for (label, band) in [("tight", &est.band_tight), ("loose", &est.band_loose)] {
        if let Some(band) = band {
            println!(
                "  {}_band: radius={:.1}km cells={} sse_threshold={:.2}",
                label, band.radius_km, band.points, band.sse_threshold
            );
            println!(
                "  {}_bounds: lat[{:.2},{:.2}] lon[{:.2},{:.2}]",
                label, band.min_lat, band.max_lat, band.min_lon, band.max_lon
            );
            if let Some(e) = &band.ellipse {
                println!(
                    "  {}_ellipse: major={:.1}km minor={:.1}km angle={:.1}deg",
                    label, e.major_km, e.minor_km, e.angle_deg
                );
            }
        }
    }
}
