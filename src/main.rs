use std::env::consts::{ARCH, FAMILY, OS};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Error};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, trace};

use crate::archive::{
    AppConfig, ContentStore, CrawlEngine, CrawlSettings, Downloader, FileStorage, Maintenance,
    MaintenanceSettings, Scheduler, init_config,
};
use crate::server::AppState;
use crate::sites::http::build_client;
use crate::sites::{DanbooruAdapter, HttpFetcher, RetryPolicy, SiteRegistry};

mod archive;
mod server;
mod sites;

/// Self-hosted media archive that mirrors tag subscriptions from booru sites
#[derive(Parser, Debug)]
#[command(name = "booru_archive", version, about)]
struct Cli {
    /// Path to config.toml (created with defaults if missing)
    #[arg(short, long, env = "ARCHIVE_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Recover interrupted runs, run one scheduler tick and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();

    let config = init_config(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    archive::logger::init_tracing(&config)?;
    log_system_information();

    let services = build_services(&config)?;

    if cli.once {
        services.scheduler.recover().await?;
        services.scheduler.tick().await?;
        info!("Single tick complete");
        return Ok(());
    }

    run(config, services).await
}

/// Everything the service runs, wired together
struct Services {
    state: AppState,
    scheduler: Arc<Scheduler>,
    maintenance: Arc<Maintenance>,
}

fn build_services(config: &AppConfig) -> Result<Services, Error> {
    let store = Arc::new(ContentStore::open(&config.paths.database_file)?);
    let storage = Arc::new(FileStorage::new(config.files_directory())?);

    let client = build_client(&config.crawl.user_agent, config.crawl.request_timeout())?;
    let policy = RetryPolicy {
        attempts: config.crawl.retry_attempts,
        base_delay_ms: config.crawl.retry_backoff_ms,
    };

    let mut registry = SiteRegistry::new();
    registry.register(Arc::new(DanbooruAdapter::new(client.clone(), policy)));
    let sites = Arc::new(registry);
    info!("Supported sites: {}", sites.names().join(", "));

    let fetcher = Arc::new(HttpFetcher::new(client, policy, config.limits.file_size_cap));
    let downloader = Arc::new(Downloader::new(store.clone(), storage.clone(), sites.clone(), fetcher));

    let engine = Arc::new(CrawlEngine::new(
        store.clone(),
        sites.clone(),
        downloader.clone(),
        CrawlSettings {
            item_delay: config.crawl.item_delay(),
            skip_streak_limit: config.crawl.skip_streak_limit,
        },
    ));
    let scheduler = Arc::new(Scheduler::new(store.clone(), engine, config.crawl.tick_interval()));

    let maintenance = Arc::new(Maintenance::new(
        store.clone(),
        storage,
        MaintenanceSettings {
            trash_retention: chrono::Duration::days(config.maintenance.trash_retention_days),
            delete_misplaced_files: config.maintenance.delete_misplaced_files,
            interval: std::time::Duration::from_secs(config.maintenance.interval_secs.max(1)),
        },
    ));

    let state = AppState {
        store,
        downloader,
        sites,
        scheduler: scheduler.clone(),
        default_limit: config.crawl.default_limit,
        max_upload_bytes: usize::try_from(config.limits.file_size_cap).unwrap_or(usize::MAX),
    };

    Ok(Services { state, scheduler, maintenance })
}

async fn run(config: AppConfig, services: Services) -> Result<(), Error> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler_task = tokio::spawn(services.scheduler.run(shutdown_rx.clone()));
    let maintenance_task = tokio::spawn(services.maintenance.run(shutdown_rx.clone()));

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    let served = server::serve(
        services.state,
        &config.server.host,
        config.server.port,
        shutdown_rx,
    )
    .await;

    for task in [scheduler_task, maintenance_task] {
        if let Err(e) = task.await {
            error!("Background task panicked: {}", e);
        }
    }
    served
}

/// Logs important information about the system being used.
fn log_system_information() {
    trace!("ARCH:   \"{}\"", ARCH);
    trace!("FAMILY: \"{}\"", FAMILY);
    trace!("OS:     \"{}\"", OS);
    info!("booru_archive {} starting", env!("CARGO_PKG_VERSION"));
}
