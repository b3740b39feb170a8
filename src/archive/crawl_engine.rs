//! Crawl Engine
//!
//! Drives one subscription run through its gallery pages:
//! 1. Resume skipping up to the last logged URL of an interrupted run
//! 2. Stop checks before every URL (skip streak, download limit)
//! 3. Known-source short circuit without touching the site
//! 4. One durable checkpoint per attempted URL
//! 5. Finishing the run and scheduling the subscription's next run

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::archive::database::{ContentStore, StoreError};
use crate::archive::downloader::{DownloadError, ErrorClass, Ingest, IngestStatus, normalize_url};
use crate::archive::models::{RunOutcome, RunProgress, Subscription, SubscriptionRun};
use crate::sites::{SiteError, SiteRegistry};

/// Error types for crawl runs
#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("No adapter registered for site {0}")]
    UnknownSite(String),

    #[error("Gallery page {page} failed: {source}")]
    Page { page: u32, source: SiteError },

    #[error("Ingestion aborted: {0}")]
    Ingest(DownloadError),
}

impl CrawlError {
    /// Store failures abort the whole tick rather than a single run
    pub fn is_fatal(&self) -> bool {
        matches!(self, CrawlError::Store(_) | CrawlError::Ingest(DownloadError::Store(_)))
    }
}

/// Result type for crawl runs
pub type CrawlResult<T> = Result<T, CrawlError>;

#[derive(Debug, Clone, Copy)]
pub struct CrawlSettings {
    /// Pause after every URL handed to the downloader
    pub item_delay: Duration,
    /// Consecutive skips that end a run
    pub skip_streak_limit: u32,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self { item_delay: Duration::from_secs(1), skip_streak_limit: 20 }
    }
}

/// Where an interrupted run picks up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumePoint {
    /// Last URL logged by the run. Only the first page fetched on resume is
    /// searched for it; items up to and including it are skipped.
    pub cursor: Option<String>,
    pub skip_streak: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Exhausted,
    SkipStreak,
    LimitReached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: i64,
    pub progress: RunProgress,
    pub stop: StopReason,
}

/// Per-run accumulator, threaded through the loop by value
#[derive(Debug, Clone)]
struct RunState {
    progress: RunProgress,
    skip_streak: u32,
    cursor: Option<String>,
}

impl RunState {
    fn stop_reason(&self, limit: u32, streak_limit: u32) -> Option<StopReason> {
        if self.skip_streak >= streak_limit {
            Some(StopReason::SkipStreak)
        } else if self.progress.downloaded >= limit {
            Some(StopReason::LimitReached)
        } else {
            None
        }
    }
}

/// Result of attempting one URL
struct Attempt {
    outcome: RunOutcome,
    file_id: Option<i64>,
    /// Whether the site was contacted, which earns the politeness delay
    contacted: bool,
}

pub struct CrawlEngine {
    store: Arc<ContentStore>,
    sites: Arc<SiteRegistry>,
    ingest: Arc<dyn Ingest>,
    settings: CrawlSettings,
}

impl CrawlEngine {
    /// Create a new crawl engine
    pub fn new(
        store: Arc<ContentStore>,
        sites: Arc<SiteRegistry>,
        ingest: Arc<dyn Ingest>,
        settings: CrawlSettings,
    ) -> Self {
        Self { store, sites, ingest, settings }
    }

    pub fn settings(&self) -> CrawlSettings {
        self.settings
    }

    /// Drive `run` to completion using the subscription's current settings
    #[instrument(name = "crawl_run", skip_all, fields(run_id = run.id, site = %sub.site))]
    pub async fn execute(
        &self,
        sub: &Subscription,
        run: &SubscriptionRun,
        resume: ResumePoint,
    ) -> CrawlResult<RunSummary> {
        let adapter = self
            .sites
            .by_name(&sub.site)
            .ok_or_else(|| CrawlError::UnknownSite(sub.site.clone()))?;

        let mut state = RunState {
            progress: RunProgress::of(run),
            skip_streak: resume.skip_streak,
            cursor: resume.cursor,
        };
        if let Some(cursor) = &state.cursor {
            info!("Resuming run {} on page {} after {}", run.id, state.progress.page_number, cursor);
        }

        let stop = 'pages: loop {
            let page = state.progress.page_number;
            let urls = adapter
                .enumerate_page(&sub.tags, page)
                .await
                .map_err(|source| CrawlError::Page { page, source })?;

            if urls.is_empty() {
                debug!("Page {} is empty", page);
                break StopReason::Exhausted;
            }
            info!("Processing page {} ({} items)", page, urls.len());

            let start = match state.cursor.take() {
                Some(cursor) => match urls.iter().position(|url| *url == cursor) {
                    Some(index) => index + 1,
                    None => {
                        info!("Cursor {} not on page {}, walking it from the start", cursor, page);
                        0
                    }
                },
                None => 0,
            };

            for url in &urls[start..] {
                if let Some(reason) = state.stop_reason(sub.limit, self.settings.skip_streak_limit) {
                    break 'pages reason;
                }

                let attempt = self.attempt(sub, url).await?;
                state = self.checkpoint(run.id, url, &attempt, state).await?;

                if attempt.contacted && !self.settings.item_delay.is_zero() {
                    sleep(self.settings.item_delay).await;
                }
            }

            state.progress = state.progress.next_page();
            self.store.update_run_page(run.id, state.progress.page_number).await?;
        };

        self.finish(sub, run, state.progress, stop).await
    }

    async fn attempt(&self, sub: &Subscription, url: &str) -> CrawlResult<Attempt> {
        if self.store.find_source_by_url(&normalize_url(url)).await?.is_some() {
            debug!("{} already archived", url);
            return Ok(Attempt { outcome: RunOutcome::Skipped, file_id: None, contacted: false });
        }

        let attempt = match self.ingest.ingest(url, Some(&sub.blacklist)).await {
            Ok(ingested) => Attempt {
                outcome: match ingested.status {
                    IngestStatus::Success => RunOutcome::Downloaded,
                    IngestStatus::Exists => RunOutcome::Exists,
                    IngestStatus::Blacklisted => RunOutcome::Blacklisted,
                },
                file_id: ingested.file.map(|f| f.id),
                contacted: true,
            },
            Err(e) => match e.class() {
                ErrorClass::Skip => {
                    debug!("Skipping {}: {}", url, e);
                    Attempt { outcome: RunOutcome::Skipped, file_id: None, contacted: true }
                }
                ErrorClass::Fail => {
                    warn!("Failed to ingest {}: {}", url, e);
                    Attempt { outcome: RunOutcome::Failed, file_id: None, contacted: true }
                }
                ErrorClass::Fatal => return Err(CrawlError::Ingest(e)),
            },
        };
        Ok(attempt)
    }

    /// Persist one outcome; the returned state is only valid once the store accepted it
    async fn checkpoint(
        &self,
        run_id: i64,
        url: &str,
        attempt: &Attempt,
        state: RunState,
    ) -> CrawlResult<RunState> {
        let progress = state.progress.record(attempt.outcome);
        self.store
            .record_outcome(run_id, url, attempt.outcome, attempt.file_id, progress, Utc::now())
            .await?;
        debug!("{} -> {}", url, attempt.outcome);

        let skip_streak = if attempt.outcome.is_skip() { state.skip_streak + 1 } else { 0 };
        Ok(RunState { progress, skip_streak, ..state })
    }

    async fn finish(
        &self,
        sub: &Subscription,
        run: &SubscriptionRun,
        progress: RunProgress,
        stop: StopReason,
    ) -> CrawlResult<RunSummary> {
        let now = Utc::now();
        self.store.finish_run(run.id, progress, now).await?;
        self.store.complete_subscription(sub.id, now + sub.interval.duration()).await?;

        info!(
            "Run {} finished ({:?}): {} downloaded, {} skipped, {} failed",
            run.id, stop, progress.downloaded, progress.skipped, progress.failed
        );
        Ok(RunSummary { run_id: run.id, progress, stop })
    }
}
