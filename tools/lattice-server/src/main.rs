// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! lattice-server - stateless authenticated UDP echo responder.
//!
//! Validates the 32-byte probe packet (magic + truncated HMAC tag), rate
//! limits per source IP, and echoes accepted packets byte-for-byte.

use clap::Parser;
use colored::Colorize;
use lattice::config::DEFAULT_PORT;
use lattice::responder::Responder;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;

/// Authenticated UDP echo responder
#[derive(Parser, Debug)]
#[command(name = "lattice-server")]
#[command(about = "LATTICE UDP echo responder (secret via LATTICE_SECRET_HEX)")]
struct Args {
    /// UDP port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Address to bind
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Quiet mode - suppress the startup banner
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
    let secret = lattice::secret::from_env()?;

    let addr = SocketAddr::new(args.bind, args.port);
    let mut responder = Responder::bind(addr, secret)?;
    let stats = responder.stats();
    let running = responder.running();

    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })?;

    if !args.quiet {
        eprintln!(
            "{} LATTICE echo listening on {}/udp",
            ">>>".green().bold(),
            responder.local_addr()?
        );
        eprintln!("{}", "    Press Ctrl+C to stop".dimmed());
    }

    responder.run();

    let snap = stats.snapshot();
    if !args.quiet {
        eprintln!();
        eprintln!("{}", "--- Responder counters ---".dimmed());
        eprintln!("  {} {}", "Received:".cyan(), snap.received);
        eprintln!("  {} {}", "Echoed:".cyan(), snap.echoed);
        eprintln!(
            "  {} length={} magic={} rate={} tag={}",
            "Dropped:".cyan(),
            snap.dropped_length,
            snap.dropped_magic,
            snap.dropped_rate,
            snap.dropped_tag
        );
    }
    Ok(())
}
