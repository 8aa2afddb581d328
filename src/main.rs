use std::sync::Arc;

use chrono::Duration;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use solarflux::api::{self, ApiState};
use solarflux::benchmark;
use solarflux::config::Config;
use solarflux::fetcher::FluxFetcher;
use solarflux::importer::archive::ArchiveImporter;
use solarflux::importer::catalog::HttpCatalog;
use solarflux::importer::live::LiveImporter;
use solarflux::importer::{restart_delay, run_import_loop, run_supervised};
use solarflux::storage::Store;

#[derive(Parser)]
#[command(name = "solarflux", about = "Solar X-ray flux server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run only the archive importer.
    Archive,
    /// Run only the live importer.
    Live,
    /// Serve the API and run both importers (the default).
    All,
    /// Simulate panning viewers against a running instance.
    Benchmark {
        #[arg(default_value = "http://localhost:8000")]
        base_url: String,
        #[arg(long, default_value_t = 200)]
        viewers: usize,
        #[arg(long)]
        seed: Option<u64>,
    },
}

async fn run_archive(config: &Config) -> anyhow::Result<()> {
    let store = Store::connect(config).await?;
    let catalog = Arc::new(HttpCatalog::new(config.archive_catalog_url.clone()));
    let import_start = config.import_start;
    let staging = config.archive_staging_dir.clone();
    run_supervised("archive", restart_delay(), || {
        let store = store.clone();
        let catalog = catalog.clone();
        let staging = staging.clone();
        async move {
            let mut importer = ArchiveImporter::new(store.clone(), catalog, staging);
            run_import_loop(&store, &mut importer, import_start).await
        }
    })
    .await;
    Ok(())
}

async fn run_live(config: &Config) -> anyhow::Result<()> {
    let store = Store::connect(config).await?;
    let import_start = config.import_start;
    run_supervised("live", restart_delay(), || {
        let store = store.clone();
        async move {
            let mut importer = LiveImporter::new(store.clone());
            run_import_loop(&store, &mut importer, import_start).await
        }
    })
    .await;
    Ok(())
}

async fn run_all(config: &Config) -> anyhow::Result<()> {
    if config.only_api {
        info!("Importers disabled (ONLY_API)");
    } else {
        let archive_config = config.clone();
        tokio::spawn(async move { run_archive(&archive_config).await });
        let live_config = config.clone();
        tokio::spawn(async move { run_live(&live_config).await });
    }

    let store = Store::connect(config).await?;
    let fetcher = FluxFetcher::spawn(Arc::new(store.clone()), Duration::seconds(10));
    let router = api::router(ApiState {
        fetcher: fetcher.clone(),
        max_resolution: config.flux_max_resolution,
        query_timeout: config.flux_query_timeout,
    });

    info!("Serving API on {}", config.api_bind);
    let listener = tokio::net::TcpListener::bind(&config.api_bind).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    fetcher.cancel();
    store.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    info!("Starting solarflux");

    match cli.command.unwrap_or(Command::All) {
        Command::Archive => run_archive(&config).await,
        Command::Live => run_live(&config).await,
        Command::All => run_all(&config).await,
        Command::Benchmark {
            base_url,
            viewers,
            seed,
        } => benchmark::run(base_url, viewers, seed, config.flux_max_resolution).await,
    }
}
