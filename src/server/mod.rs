//! JSON API for managing subscriptions, inspecting runs and adding files.

mod error;
mod handlers;
mod routes;

pub use routes::create_router;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;

use crate::archive::database::ContentStore;
use crate::archive::downloader::Downloader;
use crate::archive::scheduler::Scheduler;
use crate::sites::SiteRegistry;

/// Shared state for the API server
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ContentStore>,
    pub downloader: Arc<Downloader>,
    pub sites: Arc<SiteRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub default_limit: u32,
    /// Largest accepted upload body, 0 for no cap
    pub max_upload_bytes: usize,
}

/// Serve the API until the shutdown signal flips
pub async fn serve(
    state: AppState,
    host: &str,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    Ok(())
}
