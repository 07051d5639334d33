mod client;
mod exporter;

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::{runtime::Builder, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::client::HttpSpeedtestClient;
use crate::exporter::{http_server, SpeedtestMetrics, SpeedtestRunner};

const DEFAULT_PORT: u16 = 9798;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Speedwatch - a Prometheus exporter that runs a speedtest on every scrape"
)]
struct Args {
    /// Port for the metrics HTTP server
    #[arg(short, long, help = "Prometheus metrics HTTP port")]
    port: Option<u16>,

    /// Speedtest server ID to probe; omit to pick the closest server
    #[arg(short, long, help = "Speedtest server ID to probe")]
    server: Option<String>,

    /// Also expose process-level metrics
    #[arg(long, default_value_t = false, help = "Also expose process-level metrics")]
    process_metrics: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // parse command line arguments
    let args = Args::parse();

    // Resolve settings: command line arg > environment variable > default
    let port = resolve_port(args.port, env::var("SPEEDTEST_PORT").ok());
    let server = resolve_server(args.server, env::var("SPEEDTEST_SERVER").ok());
    let process_metrics =
        resolve_process_metrics(args.process_metrics, env::var("SPEEDTEST_EXPORTER_DEBUG").ok());

    info!(port, server = server.as_deref().unwrap_or("auto"), "starting speedwatch");

    let client = HttpSpeedtestClient::new().context("failed to create speedtest client")?;
    let runner = SpeedtestRunner::new(server, client);
    let metrics =
        Arc::new(SpeedtestMetrics::new(runner, process_metrics).context("failed to register metrics")?);

    let rt = Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(run_server(metrics, port))
}

async fn run_server(metrics: Arc<SpeedtestMetrics>, port: u16) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
            let _ = shutdown_tx.send(());
        }
    });

    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    info!("metrics available at http://{addr}/metrics");

    http_server::start_metrics_server(metrics, addr, shutdown_rx)
        .await
        .map_err(|err| anyhow::anyhow!(err))
}

fn resolve_port(cli: Option<u16>, env: Option<String>) -> u16 {
    cli.or_else(|| env.and_then(|value| value.parse().ok()))
        .unwrap_or(DEFAULT_PORT)
}

// An empty server ID means auto-select, matching the environment surface
// where unset and empty are equivalent.
fn resolve_server(cli: Option<String>, env: Option<String>) -> Option<String> {
    cli.or(env).filter(|id| !id.is_empty())
}

fn resolve_process_metrics(cli: bool, env: Option<String>) -> bool {
    cli || env.map_or(false, |value| !value.is_empty())
}
