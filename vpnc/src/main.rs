use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vpnc::config::Settings;
use vpnc::supervisor;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "vpnc")]
#[command(version = VERSION)]
#[command(about = "Multi-tenant VPN concentrator control plane")]
struct Args {
    /// Root of the tenant configuration store
    #[arg(long, default_value = "/opt/ncubed/config/vpnc")]
    config_dir: PathBuf,

    /// Listen address for the read-only status endpoint
    #[arg(long, default_value = "127.0.0.1:9090")]
    status_listen: String,

    /// Seconds between scans of the active configuration
    #[arg(long, default_value_t = 1)]
    watch_interval: u64,

    /// Seconds between routing-daemon neighbor polls
    #[arg(long, default_value_t = 10)]
    bgp_poll_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vpnc=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();
    info!("starting vpnc v{VERSION}");

    let settings = Settings {
        active_dir: args.config_dir.join("active"),
        candidate_dir: args.config_dir.join("candidate"),
        status_listen: args.status_listen,
        watch_interval_secs: args.watch_interval,
        bgp_poll_interval_secs: args.bgp_poll_interval,
        ..Settings::default()
    };

    supervisor::run(settings).await?;
    info!("vpnc stopped");
    Ok(())
}
