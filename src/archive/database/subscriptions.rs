//! Subscriptions, runs and the run log

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use super::{
    ContentStore, StoreError, StoreResult, enum_col, json_col, opt_time_col, time_col,
    to_db_time,
};
use crate::archive::models::{
    NewSubscription, RunLogEntry, RunOutcome, RunProgress, RunStatus, Subscription,
    SubscriptionRun, SubscriptionStatus, tag_key,
};

/// Result of `create_subscription`
#[derive(Debug, Clone)]
pub struct CreatedSubscription {
    pub subscription: Subscription,
    /// False when an identical (site, tag set) subscription already existed
    pub created: bool,
}

/// Subscription with its run count, used for listings
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionSummary {
    #[serde(flatten)]
    pub subscription: Subscription,
    pub run_count: u32,
}

const SUBSCRIPTION_COLUMNS: &str =
    "id, site, tags, blacklist, item_limit, interval, status, next_run_at, created_at";

const RUN_COLUMNS: &str = "id, site, tags, status, page_number, downloaded_count, skipped_count, \
     failed_count, finished, finished_at, orphaned, created_at";

const LOG_COLUMNS: &str = "id, run_id, url, outcome, file_id, created_at";

impl ContentStore {
    /// Create a subscription, or return the existing one for the same site and tag set
    pub async fn create_subscription(
        &self,
        new: &NewSubscription,
        now: DateTime<Utc>,
    ) -> StoreResult<CreatedSubscription> {
        let conn = self.conn.lock().await;
        let key = tag_key(&new.tags);
        let inserted = conn.execute(
            "INSERT INTO subscriptions
                (site, tags, tag_key, blacklist, item_limit, interval, status, next_run_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(site, tag_key) DO NOTHING",
            params![
                new.site,
                serde_json::to_string(&new.tags)?,
                key,
                serde_json::to_string(&new.blacklist)?,
                new.limit,
                new.interval.as_str(),
                SubscriptionStatus::Waiting.as_str(),
                to_db_time(&now),
            ],
        )?;

        let subscription = find_subscription_by_key(&conn, &new.site, &key)?
            .ok_or_else(|| StoreError::NotFound(format!("subscription {} [{}]", new.site, key)))?;
        Ok(CreatedSubscription { subscription, created: inserted > 0 })
    }

    /// Lookup by the order-insensitive (site, tag set) identity
    pub async fn find_subscription_by_identity(
        &self,
        site: &str,
        tags: &[String],
    ) -> StoreResult<Option<Subscription>> {
        let conn = self.conn.lock().await;
        find_subscription_by_key(&conn, site, &tag_key(tags))
    }

    pub async fn find_subscription(&self, id: i64) -> StoreResult<Option<Subscription>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM subscriptions WHERE id = ?1", SUBSCRIPTION_COLUMNS);
        Ok(conn.query_row(&sql, [id], subscription_from_row).optional()?)
    }

    /// All subscriptions, newest first, with the number of runs each has had
    pub async fn list_subscriptions(&self) -> StoreResult<Vec<SubscriptionSummary>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {}, (SELECT COUNT(*) FROM subscription_runs r
                         WHERE r.site = s.site AND r.tag_key = s.tag_key)
             FROM subscriptions s ORDER BY s.id DESC",
            prefixed(SUBSCRIPTION_COLUMNS, "s")
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SubscriptionSummary {
                    subscription: subscription_from_row(row)?,
                    run_count: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Subscriptions that are waiting or finished and whose next run is due
    pub async fn find_due_subscriptions(&self, now: DateTime<Utc>) -> StoreResult<Vec<Subscription>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM subscriptions
             WHERE status IN (?1, ?2) AND next_run_at < ?3
             ORDER BY next_run_at, id",
            SUBSCRIPTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![
                    SubscriptionStatus::Waiting.as_str(),
                    SubscriptionStatus::Finished.as_str(),
                    to_db_time(&now),
                ],
                subscription_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Set status and next run time
    pub async fn update_subscription_status(
        &self,
        id: i64,
        status: SubscriptionStatus,
        next_run_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE subscriptions SET status = ?1, next_run_at = COALESCE(?2, next_run_at)
             WHERE id = ?3",
            params![status.as_str(), next_run_at.as_ref().map(to_db_time), id],
        )?;
        Ok(())
    }

    /// Mark a subscription finished after a run; a pause requested meanwhile is kept
    pub async fn complete_subscription(&self, id: i64, next_run_at: DateTime<Utc>) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE subscriptions
             SET status = CASE WHEN status = ?1 THEN ?1 ELSE ?2 END, next_run_at = ?3
             WHERE id = ?4",
            params![
                SubscriptionStatus::Paused.as_str(),
                SubscriptionStatus::Finished.as_str(),
                to_db_time(&next_run_at),
                id,
            ],
        )?;
        Ok(())
    }

    pub async fn create_run(
        &self,
        site: &str,
        tags: &[String],
        now: DateTime<Utc>,
    ) -> StoreResult<SubscriptionRun> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO subscription_runs (site, tags, tag_key, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                site,
                serde_json::to_string(tags)?,
                tag_key(tags),
                RunStatus::Running.as_str(),
                to_db_time(&now),
            ],
        )?;
        let id = conn.last_insert_rowid();
        load_run(&conn, id)?.ok_or_else(|| StoreError::NotFound(format!("run {}", id)))
    }

    pub async fn find_run(&self, id: i64) -> StoreResult<Option<SubscriptionRun>> {
        let conn = self.conn.lock().await;
        load_run(&conn, id)
    }

    pub async fn find_running_runs(&self) -> StoreResult<Vec<SubscriptionRun>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM subscription_runs WHERE status = ?1 ORDER BY id",
            RUN_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([RunStatus::Running.as_str()], run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Runs for a (site, tag set) identity, newest first
    pub async fn runs_for_identity(
        &self,
        site: &str,
        tags: &[String],
    ) -> StoreResult<Vec<SubscriptionRun>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM subscription_runs WHERE site = ?1 AND tag_key = ?2 ORDER BY id DESC",
            RUN_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![site, tag_key(tags)], run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Persist the page number before the next page is fetched
    pub async fn update_run_page(&self, run_id: i64, page_number: u32) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE subscription_runs SET page_number = ?1 WHERE id = ?2",
            params![page_number, run_id],
        )?;
        Ok(())
    }

    /// Durable checkpoint: append the log entry and persist the counters atomically
    pub async fn record_outcome(
        &self,
        run_id: i64,
        url: &str,
        outcome: RunOutcome,
        file_id: Option<i64>,
        progress: RunProgress,
        now: DateTime<Utc>,
    ) -> StoreResult<RunLogEntry> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let entry_id = append_log_entry(&tx, run_id, url, outcome, file_id, &now)?;
        update_run(&tx, run_id, &progress)?;
        tx.commit()?;

        Ok(RunLogEntry {
            id: entry_id,
            run_id,
            url: url.to_string(),
            outcome,
            file_id,
            created_at: now,
        })
    }

    pub async fn finish_run(
        &self,
        run_id: i64,
        progress: RunProgress,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        update_run(&tx, run_id, &progress)?;
        tx.execute(
            "UPDATE subscription_runs SET status = ?1, finished = 1, finished_at = ?2 WHERE id = ?3",
            params![RunStatus::Finished.as_str(), to_db_time(&now), run_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Close a running run whose subscription no longer exists
    pub async fn mark_run_orphaned(&self, run_id: i64, now: DateTime<Utc>) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE subscription_runs
             SET status = ?1, finished = 1, finished_at = ?2, orphaned = 1
             WHERE id = ?3",
            params![RunStatus::Finished.as_str(), to_db_time(&now), run_id],
        )?;
        Ok(())
    }

    /// Most recent log entry of a run; its URL is the resume cursor
    pub async fn last_log_entry(&self, run_id: i64) -> StoreResult<Option<RunLogEntry>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM run_log WHERE run_id = ?1 ORDER BY id DESC LIMIT 1",
            LOG_COLUMNS
        );
        Ok(conn.query_row(&sql, [run_id], log_from_row).optional()?)
    }

    /// Number of consecutive skip outcomes at the tail of a run's log, up to `cap`
    pub async fn trailing_skip_streak(&self, run_id: i64, cap: u32) -> StoreResult<u32> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT outcome FROM run_log WHERE run_id = ?1 ORDER BY id DESC LIMIT ?2")?;
        let outcomes = stmt
            .query_map(params![run_id, cap], |row| enum_col::<RunOutcome>(row, 0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(outcomes.iter().take_while(|o| o.is_skip()).count() as u32)
    }

    /// Log entries of a run, newest first
    pub async fn run_log(&self, run_id: i64) -> StoreResult<Vec<RunLogEntry>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM run_log WHERE run_id = ?1 ORDER BY id DESC", LOG_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([run_id], log_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn append_log_entry(
    conn: &Connection,
    run_id: i64,
    url: &str,
    outcome: RunOutcome,
    file_id: Option<i64>,
    now: &DateTime<Utc>,
) -> StoreResult<i64> {
    conn.execute(
        "INSERT INTO run_log (run_id, url, outcome, file_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![run_id, url, outcome.as_str(), file_id, to_db_time(now)],
    )?;
    Ok(conn.last_insert_rowid())
}

fn update_run(conn: &Connection, run_id: i64, progress: &RunProgress) -> StoreResult<()> {
    let changed = conn.execute(
        "UPDATE subscription_runs
         SET page_number = ?1, downloaded_count = ?2, skipped_count = ?3, failed_count = ?4
         WHERE id = ?5",
        params![
            progress.page_number,
            progress.downloaded,
            progress.skipped,
            progress.failed,
            run_id,
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound(format!("run {}", run_id)));
    }
    Ok(())
}

fn find_subscription_by_key(
    conn: &Connection,
    site: &str,
    key: &str,
) -> StoreResult<Option<Subscription>> {
    let sql = format!(
        "SELECT {} FROM subscriptions WHERE site = ?1 AND tag_key = ?2",
        SUBSCRIPTION_COLUMNS
    );
    Ok(conn.query_row(&sql, params![site, key], subscription_from_row).optional()?)
}

fn load_run(conn: &Connection, id: i64) -> StoreResult<Option<SubscriptionRun>> {
    let sql = format!("SELECT {} FROM subscription_runs WHERE id = ?1", RUN_COLUMNS);
    Ok(conn.query_row(&sql, [id], run_from_row).optional()?)
}

fn prefixed(columns: &str, alias: &str) -> String {
    columns
        .split(", ")
        .map(|c| format!("{}.{}", alias, c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn subscription_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subscription> {
    Ok(Subscription {
        id: row.get(0)?,
        site: row.get(1)?,
        tags: json_col(row, 2)?,
        blacklist: json_col(row, 3)?,
        limit: row.get(4)?,
        interval: enum_col(row, 5)?,
        status: enum_col(row, 6)?,
        next_run_at: time_col(row, 7)?,
        created_at: time_col(row, 8)?,
    })
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SubscriptionRun> {
    Ok(SubscriptionRun {
        id: row.get(0)?,
        site: row.get(1)?,
        tags: json_col(row, 2)?,
        status: enum_col(row, 3)?,
        page_number: row.get(4)?,
        downloaded_count: row.get(5)?,
        skipped_count: row.get(6)?,
        failed_count: row.get(7)?,
        finished: row.get(8)?,
        finished_at: opt_time_col(row, 9)?,
        orphaned: row.get(10)?,
        created_at: time_col(row, 11)?,
    })
}

fn log_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunLogEntry> {
    Ok(RunLogEntry {
        id: row.get(0)?,
        run_id: row.get(1)?,
        url: row.get(2)?,
        outcome: enum_col(row, 3)?,
        file_id: row.get(4)?,
        created_at: time_col(row, 5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::models::Interval;
    use chrono::Duration;

    fn new_sub(tags: &[&str]) -> NewSubscription {
        NewSubscription {
            site: "danbooru".to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            blacklist: vec!["meta:animated".to_string()],
            limit: 200,
            interval: Interval::Daily,
        }
    }

    #[tokio::test]
    async fn test_subscription_identity_ignores_tag_order() {
        let store = ContentStore::open_in_memory().unwrap();
        let now = Utc::now();
        let first = store.create_subscription(&new_sub(&["a", "b"]), now).await.unwrap();
        let second = store.create_subscription(&new_sub(&["b", "a"]), now).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.subscription.id, second.subscription.id);
        assert_eq!(first.subscription.blacklist, vec!["meta:animated".to_string()]);

        let found = store
            .find_subscription_by_identity("danbooru", &["b".to_string(), "a".to_string()])
            .await
            .unwrap();
        assert_eq!(found.map(|s| s.id), Some(first.subscription.id));
    }

    #[tokio::test]
    async fn test_due_subscriptions_exclude_paused_and_future() {
        let store = ContentStore::open_in_memory().unwrap();
        let past = Utc::now() - Duration::hours(1);
        let due = store.create_subscription(&new_sub(&["due"]), past).await.unwrap().subscription;
        let paused = store.create_subscription(&new_sub(&["paused"]), past).await.unwrap().subscription;
        let future = store.create_subscription(&new_sub(&["future"]), past).await.unwrap().subscription;
        let running = store.create_subscription(&new_sub(&["running"]), past).await.unwrap().subscription;

        store.update_subscription_status(paused.id, SubscriptionStatus::Paused, None).await.unwrap();
        store
            .update_subscription_status(
                future.id,
                SubscriptionStatus::Finished,
                Some(Utc::now() + Duration::days(1)),
            )
            .await
            .unwrap();
        store.update_subscription_status(running.id, SubscriptionStatus::Running, None).await.unwrap();

        let found = store.find_due_subscriptions(Utc::now()).await.unwrap();
        assert_eq!(found.iter().map(|s| s.id).collect::<Vec<_>>(), vec![due.id]);
    }

    #[tokio::test]
    async fn test_complete_keeps_pause() {
        let store = ContentStore::open_in_memory().unwrap();
        let now = Utc::now();
        let sub = store.create_subscription(&new_sub(&["a"]), now).await.unwrap().subscription;
        store.update_subscription_status(sub.id, SubscriptionStatus::Paused, None).await.unwrap();
        store.complete_subscription(sub.id, now + Duration::days(1)).await.unwrap();

        let sub = store.find_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Paused);
        assert_eq!(sub.next_run_at.timestamp(), (now + Duration::days(1)).timestamp());
    }

    #[tokio::test]
    async fn test_checkpoint_persists_log_and_counters() {
        let store = ContentStore::open_in_memory().unwrap();
        let tags = vec!["a".to_string()];
        let run = store.create_run("danbooru", &tags, Utc::now()).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);

        let progress = RunProgress::of(&run).record(RunOutcome::Downloaded);
        store
            .record_outcome(run.id, "https://x/posts/1", RunOutcome::Downloaded, None, progress, Utc::now())
            .await
            .unwrap();
        let progress = progress.record(RunOutcome::Skipped);
        store
            .record_outcome(run.id, "https://x/posts/2", RunOutcome::Skipped, None, progress, Utc::now())
            .await
            .unwrap();

        let stored = store.find_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.downloaded_count, 1);
        assert_eq!(stored.skipped_count, 1);

        let last = store.last_log_entry(run.id).await.unwrap().unwrap();
        assert_eq!(last.url, "https://x/posts/2");
        assert_eq!(store.run_log(run.id).await.unwrap().len(), 2);
        assert_eq!(store.trailing_skip_streak(run.id, 20).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_finish_and_orphan_runs() {
        let store = ContentStore::open_in_memory().unwrap();
        let tags = vec!["a".to_string()];
        let finished = store.create_run("danbooru", &tags, Utc::now()).await.unwrap();
        let orphan = store.create_run("danbooru", &tags, Utc::now()).await.unwrap();

        store
            .finish_run(finished.id, RunProgress { page_number: 3, ..Default::default() }, Utc::now())
            .await
            .unwrap();
        store.mark_run_orphaned(orphan.id, Utc::now()).await.unwrap();

        assert!(store.find_running_runs().await.unwrap().is_empty());
        let finished = store.find_run(finished.id).await.unwrap().unwrap();
        assert!(finished.finished && !finished.orphaned);
        assert_eq!(finished.page_number, 3);
        assert!(finished.finished_at.is_some());
        assert!(store.find_run(orphan.id).await.unwrap().unwrap().orphaned);
    }

    #[tokio::test]
    async fn test_list_subscriptions_counts_runs() {
        let store = ContentStore::open_in_memory().unwrap();
        let sub = store.create_subscription(&new_sub(&["b", "a"]), Utc::now()).await.unwrap().subscription;
        store.create_run("danbooru", &["a".to_string(), "b".to_string()], Utc::now()).await.unwrap();

        let list = store.list_subscriptions().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].run_count, 1);
        assert_eq!(store.runs_for_identity(&sub.site, &sub.tags).await.unwrap().len(), 1);
    }
}
