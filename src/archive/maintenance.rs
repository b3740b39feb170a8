//! Periodic archive maintenance
//!
//! This module provides functionality for:
//! 1. Finalizing files that have sat in the trash past the retention window
//! 2. Reporting (and optionally removing) files on disk the store does not know

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::archive::database::{ContentStore, StoreError};
use crate::archive::models::FileStatus;
use crate::archive::scheduler::SingleFlight;
use crate::archive::storage::FileStorage;

/// Files younger than this are never treated as misplaced; an ingest may be mid-flight
const MISPLACED_MIN_AGE: Duration = Duration::from_secs(60 * 60);

/// Error types for maintenance
#[derive(Error, Debug)]
pub enum MaintenanceError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for maintenance
pub type MaintenanceResult<T> = Result<T, MaintenanceError>;

#[derive(Debug, Clone, Copy)]
pub struct MaintenanceSettings {
    pub trash_retention: chrono::Duration,
    pub delete_misplaced_files: bool,
    pub interval: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub finalized: usize,
    pub misplaced: Vec<String>,
    pub removed_misplaced: usize,
}

pub struct Maintenance {
    store: Arc<ContentStore>,
    storage: Arc<FileStorage>,
    settings: MaintenanceSettings,
    flight: SingleFlight,
}

impl Maintenance {
    /// Create a new maintenance worker
    pub fn new(
        store: Arc<ContentStore>,
        storage: Arc<FileStorage>,
        settings: MaintenanceSettings,
    ) -> Self {
        Self { store, storage, settings, flight: SingleFlight::new() }
    }

    /// One full sweep; `None` when a sweep is already in progress
    pub async fn sweep(&self, now: DateTime<Utc>) -> MaintenanceResult<Option<MaintenanceReport>> {
        let Some(_guard) = self.flight.try_begin() else {
            return Ok(None);
        };

        let mut report = MaintenanceReport {
            finalized: self.finalize_trash(now).await?,
            ..Default::default()
        };
        self.scan_misplaced(&mut report).await?;

        info!(
            "Maintenance sweep: {} trashed file(s) deleted, {} misplaced file(s) found",
            report.finalized,
            report.misplaced.len()
        );
        Ok(Some(report))
    }

    async fn finalize_trash(&self, now: DateTime<Utc>) -> MaintenanceResult<usize> {
        let expired = self.store.expired_trash(now - self.settings.trash_retention).await?;
        for (id, filename) in &expired {
            self.storage.remove(filename).await?;
            self.store.set_file_status(*id, FileStatus::Deleted, now).await?;
        }
        Ok(expired.len())
    }

    async fn scan_misplaced(&self, report: &mut MaintenanceReport) -> MaintenanceResult<()> {
        let known = self.store.known_filenames().await?;
        let now = SystemTime::now();

        for (name, path) in self.storage.list_files() {
            if known.contains(&name) || !is_managed_name(&name) {
                continue;
            }
            let age = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < MISPLACED_MIN_AGE {
                continue;
            }

            warn!("Misplaced file {}", path.display());
            if self.settings.delete_misplaced_files {
                tokio::fs::remove_file(&path).await?;
                report.removed_misplaced += 1;
            }
            report.misplaced.push(name);
        }
        Ok(())
    }

    /// Sweep on the configured interval until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        error!("Maintenance sweep failed: {}", e);
                    }
                }
            }
        }
        info!("Maintenance stopped");
    }
}

/// Names this archive generates: `<uuid>.<ext>`
fn is_managed_name(name: &str) -> bool {
    name.split_once('.')
        .map(|(stem, _)| Uuid::parse_str(stem).is_ok())
        .unwrap_or(false)
}
