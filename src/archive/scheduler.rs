//! Subscription scheduler
//!
//! This module provides functionality for:
//! 1. Startup recovery of runs interrupted by a crash or shutdown
//! 2. Periodic ticks that start every due subscription, one after another
//! 3. Single-flight protection so ticks never overlap
//! 4. Reconciliation of runs whose subscription has disappeared

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::archive::crawl_engine::{CrawlEngine, CrawlError, ResumePoint};
use crate::archive::database::{ContentStore, StoreError};
use crate::archive::models::{Subscription, SubscriptionRun, SubscriptionStatus};

/// Error types for the scheduler
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Crawl error: {0}")]
    Crawl(#[from] CrawlError),
}

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlightState {
    Idle,
    Ticking,
}

const IDLE: u8 = 0;
const TICKING: u8 = 1;

/// Compare-and-swap guard admitting one holder at a time
#[derive(Debug, Default)]
pub struct SingleFlight {
    state: AtomicU8,
}

/// Held while work runs; dropping it returns the flight to `Idle`
pub struct FlightGuard<'a> {
    flight: &'a SingleFlight,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the flight, or `None` when someone already holds it
    pub fn try_begin(&self) -> Option<FlightGuard<'_>> {
        self.state
            .compare_exchange(IDLE, TICKING, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard { flight: self })
    }

    pub fn state(&self) -> FlightState {
        match self.state.load(Ordering::Acquire) {
            IDLE => FlightState::Idle,
            _ => FlightState::Ticking,
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flight.state.store(IDLE, Ordering::Release);
    }
}

/// What one tick did
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub resumed: usize,
    pub orphaned: usize,
    pub started: usize,
    pub failed: usize,
}

impl TickReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            resumed: 0,
            orphaned: 0,
            started: 0,
            failed: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// Another tick held the flight
    Busy,
    Completed(TickReport),
}

/// Snapshot for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub state: FlightState,
    pub tick_interval_secs: u64,
    pub last_tick: Option<TickReport>,
}

pub struct Scheduler {
    store: Arc<ContentStore>,
    engine: Arc<CrawlEngine>,
    flight: SingleFlight,
    tick_interval: Duration,
    last_tick: Mutex<Option<TickReport>>,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(store: Arc<ContentStore>, engine: Arc<CrawlEngine>, tick_interval: Duration) -> Self {
        Self {
            store,
            engine,
            flight: SingleFlight::new(),
            tick_interval,
            last_tick: Mutex::new(None),
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            state: self.flight.state(),
            tick_interval_secs: self.tick_interval.as_secs(),
            last_tick: self.last_tick.lock().clone(),
        }
    }

    /// Resume every run left `running` by a previous process
    pub async fn recover(&self) -> SchedulerResult<TickOutcome> {
        let Some(_guard) = self.flight.try_begin() else {
            return Ok(TickOutcome::Busy);
        };

        let mut report = TickReport::new();
        self.resume_interrupted(&mut report).await?;
        Ok(TickOutcome::Completed(self.complete(report)))
    }

    /// Resume interrupted runs, then start every due subscription in turn
    pub async fn tick(&self) -> SchedulerResult<TickOutcome> {
        let Some(_guard) = self.flight.try_begin() else {
            debug!("Tick skipped, previous tick still running");
            return Ok(TickOutcome::Busy);
        };

        let mut report = TickReport::new();
        self.resume_interrupted(&mut report).await?;

        let due = self.store.find_due_subscriptions(Utc::now()).await?;
        if !due.is_empty() {
            info!("{} subscription(s) due", due.len());
        }
        for sub in due {
            let run = self.store.create_run(&sub.site, &sub.tags, Utc::now()).await?;
            self.store
                .update_subscription_status(sub.id, SubscriptionStatus::Running, None)
                .await?;
            report.started += 1;
            self.drive(&sub, &run, ResumePoint::default(), &mut report).await?;
        }

        Ok(TickOutcome::Completed(self.complete(report)))
    }

    /// Recover, then tick on the configured interval until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        match self.recover().await {
            Ok(TickOutcome::Completed(report)) if report.resumed + report.orphaned > 0 => {
                info!("Recovered {} run(s), {} orphaned", report.resumed, report.orphaned);
            }
            Ok(_) => {}
            Err(e) => error!("Startup recovery failed: {}", e),
        }

        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        result = self.tick() => {
                            if let Err(e) = result {
                                error!("Scheduler tick aborted: {}", e);
                            }
                        }
                        _ = shutdown.changed() => {
                            info!("Shutdown during tick, interrupted runs resume on next start");
                            break;
                        }
                    }
                }
            }
        }
        info!("Scheduler stopped");
    }

    async fn resume_interrupted(&self, report: &mut TickReport) -> SchedulerResult<()> {
        for run in self.store.find_running_runs().await? {
            let Some(sub) = self.store.find_subscription_by_identity(&run.site, &run.tags).await? else {
                warn!(
                    "Run {} has no subscription for {} [{}], closing it as orphaned",
                    run.id,
                    run.site,
                    run.tags.join(" ")
                );
                self.store.mark_run_orphaned(run.id, Utc::now()).await?;
                report.orphaned += 1;
                continue;
            };

            let resume = ResumePoint {
                cursor: self.store.last_log_entry(run.id).await?.map(|entry| entry.url),
                skip_streak: self
                    .store
                    .trailing_skip_streak(run.id, self.engine.settings().skip_streak_limit)
                    .await?,
            };
            report.resumed += 1;
            self.drive(&sub, &run, resume, report).await?;
        }
        Ok(())
    }

    /// Execute one run; only store failures abort the tick
    async fn drive(
        &self,
        sub: &Subscription,
        run: &SubscriptionRun,
        resume: ResumePoint,
        report: &mut TickReport,
    ) -> SchedulerResult<()> {
        match self.engine.execute(sub, run, resume).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                error!("Run {} for subscription {} stopped: {}", run.id, sub.id, e);
                report.failed += 1;
                Ok(())
            }
        }
    }

    fn complete(&self, mut report: TickReport) -> TickReport {
        report.finished_at = Some(Utc::now());
        *self.last_tick.lock() = Some(report.clone());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::crawl_engine::CrawlSettings;
    use crate::archive::models::{Interval, NewSubscription, RunOutcome, RunProgress, RunStatus};
    use crate::archive::test_support::{FakeSite, Reply, ScriptedIngest, TestArchive, item_url};
    use crate::sites::SiteRegistry;

    const HOST: &str = "fake.test";

    fn scheduler(archive: &TestArchive, site: FakeSite, ingest: Arc<ScriptedIngest>) -> Scheduler {
        let mut registry = SiteRegistry::new();
        registry.register(Arc::new(site));
        let settings = CrawlSettings { item_delay: Duration::ZERO, skip_streak_limit: 20 };
        let engine = CrawlEngine::new(archive.store.clone(), Arc::new(registry), ingest, settings);
        Scheduler::new(archive.store.clone(), Arc::new(engine), Duration::from_secs(900))
    }

    async fn subscribe(archive: &TestArchive, tag: &str) -> Subscription {
        let new = NewSubscription {
            site: "fake".to_string(),
            tags: vec![tag.to_string()],
            blacklist: Vec::new(),
            limit: 200,
            interval: Interval::Weekly,
        };
        let created_at = Utc::now() - chrono::Duration::minutes(1);
        archive.store.create_subscription(&new, created_at).await.unwrap().subscription
    }

    #[test]
    fn test_single_flight_admits_one_holder() {
        let flight = SingleFlight::new();
        let guard = flight.try_begin();
        assert!(guard.is_some());
        assert_eq!(flight.state(), FlightState::Ticking);
        assert!(flight.try_begin().is_none());

        drop(guard);
        assert_eq!(flight.state(), FlightState::Idle);
        assert!(flight.try_begin().is_some());
    }

    #[tokio::test]
    async fn test_tick_while_busy_does_nothing() {
        let archive = TestArchive::new();
        let site = FakeSite::new("fake", HOST).with_page(0, vec![item_url(HOST, 1)]);
        let ingest = Arc::new(ScriptedIngest::new(Reply::Success));
        let scheduler = scheduler(&archive, site, ingest.clone());
        subscribe(&archive, "scenery").await;

        let guard = scheduler.flight.try_begin().unwrap();
        assert!(matches!(scheduler.tick().await.unwrap(), TickOutcome::Busy));
        assert!(ingest.calls().is_empty());
        drop(guard);

        assert!(matches!(scheduler.tick().await.unwrap(), TickOutcome::Completed(_)));
        assert_eq!(ingest.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_tick_with_nothing_due_releases_flight() {
        let archive = TestArchive::new();
        let ingest = Arc::new(ScriptedIngest::new(Reply::Success));
        let scheduler = scheduler(&archive, FakeSite::new("fake", HOST), ingest);

        let TickOutcome::Completed(report) = scheduler.tick().await.unwrap() else {
            panic!("tick should run");
        };
        assert_eq!(report.started, 0);
        assert_eq!(scheduler.status().state, FlightState::Idle);
        assert!(scheduler.status().last_tick.is_some());
        assert!(matches!(scheduler.tick().await.unwrap(), TickOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_tick_runs_due_subscriptions_sequentially() {
        let archive = TestArchive::new();
        let site = FakeSite::new("fake", HOST).with_page(0, vec![item_url(HOST, 1)]);
        let ingest = Arc::new(ScriptedIngest::new(Reply::Success));
        let scheduler = scheduler(&archive, site, ingest.clone());
        let first = subscribe(&archive, "first").await;
        let second = subscribe(&archive, "second").await;

        let TickOutcome::Completed(report) = scheduler.tick().await.unwrap() else {
            panic!("tick should run");
        };
        assert_eq!(report.started, 2);
        assert_eq!(ingest.calls().len(), 2);

        for sub in [first, second] {
            let sub = archive.store.find_subscription(sub.id).await.unwrap().unwrap();
            assert_eq!(sub.status, SubscriptionStatus::Finished);
            assert!(sub.next_run_at > Utc::now() + chrono::Duration::days(6));
        }

        let TickOutcome::Completed(report) = scheduler.tick().await.unwrap() else {
            panic!("tick should run");
        };
        assert_eq!(report.started, 0);
    }

    #[tokio::test]
    async fn test_paused_subscription_is_not_started() {
        let archive = TestArchive::new();
        let ingest = Arc::new(ScriptedIngest::new(Reply::Success));
        let scheduler = scheduler(&archive, FakeSite::new("fake", HOST), ingest);
        let sub = subscribe(&archive, "scenery").await;
        archive
            .store
            .update_subscription_status(sub.id, SubscriptionStatus::Paused, None)
            .await
            .unwrap();

        let TickOutcome::Completed(report) = scheduler.tick().await.unwrap() else {
            panic!("tick should run");
        };
        assert_eq!(report.started, 0);
    }

    #[tokio::test]
    async fn test_recovery_resumes_from_last_logged_url() {
        let archive = TestArchive::new();
        let page: Vec<String> = (1..=4).map(|id| item_url(HOST, id)).collect();
        let site = FakeSite::new("fake", HOST).with_page(0, page);
        let ingest = Arc::new(ScriptedIngest::new(Reply::Success));
        let scheduler = scheduler(&archive, site, ingest.clone());

        let sub = subscribe(&archive, "scenery").await;
        archive
            .store
            .update_subscription_status(sub.id, SubscriptionStatus::Running, None)
            .await
            .unwrap();
        let run = archive.store.create_run("fake", &sub.tags, Utc::now()).await.unwrap();
        let progress = RunProgress { downloaded: 2, ..Default::default() };
        for id in 1..=2 {
            archive
                .store
                .record_outcome(run.id, &item_url(HOST, id), RunOutcome::Downloaded, None, progress, Utc::now())
                .await
                .unwrap();
        }

        let TickOutcome::Completed(report) = scheduler.recover().await.unwrap() else {
            panic!("recovery should run");
        };
        assert_eq!(report.resumed, 1);
        assert_eq!(ingest.calls(), vec![item_url(HOST, 3), item_url(HOST, 4)]);

        let run = archive.store.find_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Finished);
        assert_eq!(run.downloaded_count, 4);
    }

    #[tokio::test]
    async fn test_recovery_after_page_turn_processes_next_page() {
        let archive = TestArchive::new();
        let site = FakeSite::new("fake", HOST)
            .with_page(0, (1..=2).map(|id| item_url(HOST, id)).collect())
            .with_page(1, (3..=5).map(|id| item_url(HOST, id)).collect());
        let ingest = Arc::new(ScriptedIngest::new(Reply::Success));
        let scheduler = scheduler(&archive, site, ingest.clone());

        let sub = subscribe(&archive, "scenery").await;
        archive
            .store
            .update_subscription_status(sub.id, SubscriptionStatus::Running, None)
            .await
            .unwrap();
        let run = archive.store.create_run("fake", &sub.tags, Utc::now()).await.unwrap();
        let progress = RunProgress { downloaded: 2, ..Default::default() };
        for id in 1..=2 {
            archive
                .store
                .record_outcome(run.id, &item_url(HOST, id), RunOutcome::Downloaded, None, progress, Utc::now())
                .await
                .unwrap();
        }
        archive.store.update_run_page(run.id, 1).await.unwrap();

        scheduler.recover().await.unwrap();
        let expected: Vec<String> = (3..=5).map(|id| item_url(HOST, id)).collect();
        assert_eq!(ingest.calls(), expected);

        let run = archive.store.find_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Finished);
        assert_eq!(run.downloaded_count, 5);
        assert_eq!(run.page_number, 2);
    }

    #[tokio::test]
    async fn test_orphaned_run_is_closed() {
        let archive = TestArchive::new();
        let ingest = Arc::new(ScriptedIngest::new(Reply::Success));
        let scheduler = scheduler(&archive, FakeSite::new("fake", HOST), ingest.clone());
        let run = archive
            .store
            .create_run("fake", &["gone".to_string()], Utc::now())
            .await
            .unwrap();

        let TickOutcome::Completed(report) = scheduler.recover().await.unwrap() else {
            panic!("recovery should run");
        };
        assert_eq!(report.orphaned, 1);
        assert!(ingest.calls().is_empty());

        let run = archive.store.find_run(run.id).await.unwrap().unwrap();
        assert!(run.finished && run.orphaned);
        assert!(archive.store.find_running_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_run_does_not_block_others() {
        let archive = TestArchive::new();
        let site = FakeSite::new("fake", HOST).with_failing_page(0);
        let ingest = Arc::new(ScriptedIngest::new(Reply::Success));
        let scheduler = scheduler(&archive, site, ingest);
        subscribe(&archive, "first").await;
        subscribe(&archive, "second").await;

        let TickOutcome::Completed(report) = scheduler.tick().await.unwrap() else {
            panic!("tick should run");
        };
        assert_eq!(report.started, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(archive.store.find_running_runs().await.unwrap().len(), 2);
    }
}
