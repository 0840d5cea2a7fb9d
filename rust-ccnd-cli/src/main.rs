//! The ccnd executable.

use anyhow::Context;
use clap::Parser;
use log::info;
use rust_ccnd_core::{Config, Daemon};

/// CCNx forwarding daemon.
///
/// Flags override the corresponding environment variables
/// (CCN_LOCAL_PORT, CCND_DEBUG, CCND_CAP, CCND_LISTEN_ON, CCND_MTU,
/// CCND_DATA_PAUSE_MICROSEC, CCND_KEYSTORE_DIRECTORY, CCND_AUTOREG).
#[derive(Parser, Debug)]
#[command(name = "ccnd", version, about)]
struct Args {
    /// Port for the TCP/UDP listeners.
    #[arg(long)]
    port: Option<u16>,

    /// Debug bitmask (-1 for everything).
    #[arg(long, allow_hyphen_values = true)]
    debug: Option<i64>,

    /// Content store capacity, in ContentObjects.
    #[arg(long)]
    cap: Option<usize>,

    /// Comma-separated bind addresses ('*' for wildcards).
    #[arg(long)]
    listen_on: Option<String>,

    /// Packet stuffing target, bytes (0 disables).
    #[arg(long)]
    mtu: Option<usize>,

    /// Base data pacing delay, microseconds.
    #[arg(long)]
    data_pause: Option<u32>,

    /// Keystore directory.
    #[arg(long)]
    keystore_dir: Option<String>,

    /// URIs to auto-register on new external faces.
    #[arg(long)]
    autoreg: Option<String>,
}

fn main() {
    env_logger::Builder::from_default_env()
        .format_timestamp_micros()
        .init();
    if let Err(e) = run() {
        eprintln!("ccnd: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut cfg = Config::from_env();
    if let Some(p) = args.port {
        cfg.port = p.to_string();
    }
    if let Some(v) = args.debug {
        cfg.debug = if v < 0 { u32::MAX } else { v as u32 };
    }
    if let Some(v) = args.cap {
        if v == 0 {
            cfg.force_zero_freshness = true;
        } else {
            cfg.capacity = v;
        }
    }
    if let Some(v) = args.listen_on {
        cfg.listen_on = Some(v);
    }
    if let Some(v) = args.mtu {
        cfg.mtu = v.min(8800);
    }
    if let Some(v) = args.data_pause {
        cfg.data_pause_microsec = v.clamp(1, 1_000_000);
    }
    if let Some(v) = args.keystore_dir {
        cfg.keystore_directory = Some(v);
    }
    if let Some(v) = args.autoreg {
        cfg.autoreg = rust_ccnd_core::config::parse_uri_list(&v);
    }
    let mut daemon = Daemon::new(cfg);
    daemon.start().context("startup failed")?;
    info!(
        "ccnd starting, id {}",
        daemon
            .ccnd_id()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>()
    );
    daemon.run();
    Ok(())
}
