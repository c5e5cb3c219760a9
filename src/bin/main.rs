//! discover-dns binary entry point.

use clap::Parser;
use discover_dns::{telemetry, ComponentRegistry, Config, Orchestrator};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Service-discovery DNS daemon driven by a component manifest.
#[derive(Parser, Debug)]
#[command(name = "discover-dns")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML). Optional; defaults apply when absent.
    #[arg(short, long, default_value = "discover-dns.toml")]
    config: PathBuf,

    /// Manifest path, overriding `daemon.manifest_path`.
    #[arg(short, long)]
    manifest: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config: Config = config::Config::builder()
        .add_source(config::File::from(args.config.clone()).required(false))
        .add_source(
            config::Environment::with_prefix("DISCOVER_DNS")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;
    if let Some(manifest) = args.manifest {
        config.daemon.manifest_path = manifest;
    }

    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = %args.config.display(),
        manifest = %config.daemon.manifest_path.display(),
        poll_interval_ms = config.daemon.poll_interval_ms,
        "Starting discover-dns"
    );

    let shutdown = CancellationToken::new();
    let orchestrator = Orchestrator::new(
        &config.daemon,
        ComponentRegistry::with_defaults(),
        shutdown.clone(),
    );

    // Startup hooks may write the environment; do it before worker threads exist.
    match orchestrator.run_startup_hooks() {
        Ok(ran) => info!(hooks = ran, "startup hooks applied"),
        Err(e) => warn!(error = %e, "startup hooks skipped, manifest unreadable"),
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(orchestrator, shutdown));

    info!("discover-dns shutdown complete");
    Ok(())
}

async fn serve(orchestrator: Orchestrator, shutdown: CancellationToken) {
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for interrupt: {}", e);
                return;
            }
            info!("interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    orchestrator.run().await;
}
