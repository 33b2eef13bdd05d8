use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use graphite_backend::{BackendConfig, BackendListener, SenderKind, ThreadTracker};

mod load_generator;

#[derive(Parser, Debug)]
#[command(name = "graphite-backend")]
#[command(about = "Synthetic load run reporting live metrics to Graphite or StatsD", long_about = None)]
#[command(version)]
struct Cli {
    /// JSON backend configuration; flags below override it
    #[arg(long, env = "GRAPHITE_BACKEND_CONFIG")]
    config: Option<PathBuf>,

    /// Collector host
    #[arg(long)]
    host: Option<String>,

    /// Collector port
    #[arg(long)]
    port: Option<u16>,

    /// Transport: text or datagram
    #[arg(long)]
    sender: Option<SenderKind>,

    /// Concurrent virtual users
    #[arg(long, default_value_t = 10)]
    users: u32,

    /// How long the synthetic load runs (seconds)
    #[arg(long, default_value_t = 30)]
    duration_secs: u64,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let cli = Cli::parse();

    // ── 1. Resolve configuration ─────────────────────────────────
    let mut config = match &cli.config {
        Some(path) => BackendConfig::from_json_file(path)?,
        None => BackendConfig::default(),
    };
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(sender) = cli.sender {
        config.sender = sender;
    }

    println!();
    println!("📈 Reporting to {} ({}:{})", config.sender, config.host, config.port);
    println!("   prefix      {}", config.root_metrics_prefix);
    println!("   percentiles {}", config.percentiles);
    println!("   load        {} users × {}s", cli.users, cli.duration_secs);
    println!();

    // ── 2. Arm the backend ───────────────────────────────────────
    let threads = Arc::new(ThreadTracker::new());
    let mut listener = BackendListener::new(config, threads.clone())?;
    listener.setup().await?;

    // ── 3. Run the synthetic load ────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let mut load = tokio::spawn(load_generator::run(
        running.clone(),
        listener.collector(),
        threads,
        cli.users,
        cli.duration_secs,
    ));

    tokio::select! {
        _ = &mut load => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, stopping virtual users");
            running.store(false, Ordering::SeqCst);
            let _ = (&mut load).await;
        }
    }

    // ── 4. Flush the trailing interval and shut down ─────────────
    let last = listener.teardown().await?;
    println!("✓ done ({} metrics in the final flush, {} dropped)", last.sent, last.dropped);
    Ok(())
}
