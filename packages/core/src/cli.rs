use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Nowcast monitor CLI arguments
#[derive(Debug, Parser)]
#[command(
    name = "nowcast-monitor",
    version,
    about = "Resident precipitation nowcast monitor with threshold alerts"
)]
pub struct Cli {
    /// Path to the JSON configuration file (re-read every cycle)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory for the heartbeat file and the operational log
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Serve /health and /metrics on this address
    #[arg(long)]
    pub http_addr: Option<SocketAddr>,

    /// Forecast provider base URL
    #[arg(long)]
    pub forecast_url: Option<String>,

    /// Run a single cycle and exit
    #[arg(long)]
    pub once: bool,

    /// Send a test notification through the configured transport and exit
    #[arg(long)]
    pub test_notify: bool,
}
