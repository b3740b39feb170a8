//! Request handlers for the JSON API

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::AppState;
use super::error::{ApiError, ApiResult, FieldError};
use crate::archive::database::SubscriptionSummary;
use crate::archive::downloader::{Ingest, IngestStatus, Ingested, Upload};
use crate::archive::models::{
    FileRecord, FileStatus, Interval, NewSubscription, Rating, RunLogEntry, Subscription,
    SubscriptionRun, SubscriptionStatus, normalize_tag_name,
};
use crate::archive::scheduler::{FlightState, SchedulerStatus, TickOutcome};
use crate::sites::SiteRegistry;

pub const MAX_SUBSCRIPTION_TAGS: usize = 2;
pub const MAX_BLACKLIST_ENTRY_LEN: usize = 100;
pub const MAX_SUBSCRIPTION_LIMIT: i64 = 1_000_000;

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub site: String,
    pub tags: Vec<String>,
    #[serde(default, alias = "tagBlacklist")]
    pub blacklist: Vec<String>,
    pub interval: String,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub site: String,
    /// Comma separated
    pub tags: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub tags: Option<String>,
    pub rating: Option<String>,
    pub sources: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FetchRequest {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionDetail {
    #[serde(flatten)]
    pub subscription: Subscription,
    pub runs: Vec<SubscriptionRun>,
}

#[derive(Debug, Serialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: SubscriptionRun,
    pub log: Vec<RunLogEntry>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub status: &'static str,
    pub file: FileRecord,
}

/// Validate and normalize a subscription request
pub fn validate_subscription(
    req: CreateSubscriptionRequest,
    sites: &SiteRegistry,
    default_limit: u32,
) -> ApiResult<NewSubscription> {
    let mut errors = Vec::new();

    let site = req.site.trim().to_lowercase();
    if !sites.contains(&site) {
        errors.push(FieldError::new(
            "site",
            format!("must be one of: {}", sites.names().join(", ")),
        ));
    }

    let mut tags: Vec<String> = req.tags.iter().map(|t| normalize_tag_name(t)).collect();
    tags.dedup();
    if tags.iter().any(|t| t.is_empty()) {
        errors.push(FieldError::new("tags", "tags must not be empty"));
    }
    if tags.is_empty() || tags.len() > MAX_SUBSCRIPTION_TAGS {
        errors.push(FieldError::new(
            "tags",
            format!("between 1 and {} tags required", MAX_SUBSCRIPTION_TAGS),
        ));
    }

    let blacklist: Vec<String> = req
        .blacklist
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    if blacklist.iter().any(|t| t.chars().count() > MAX_BLACKLIST_ENTRY_LEN) {
        errors.push(FieldError::new(
            "blacklist",
            format!("entries must be at most {} characters", MAX_BLACKLIST_ENTRY_LEN),
        ));
    }

    let interval = match req.interval.trim().to_lowercase().parse::<Interval>() {
        Ok(interval) => Some(interval),
        Err(_) => {
            errors.push(FieldError::new("interval", "must be daily, weekly or monthly"));
            None
        }
    };

    let limit = req.limit.unwrap_or(default_limit as i64);
    if !(1..=MAX_SUBSCRIPTION_LIMIT).contains(&limit) {
        errors.push(FieldError::new(
            "limit",
            format!("must be between 1 and {}", MAX_SUBSCRIPTION_LIMIT),
        ));
    }

    match interval {
        Some(interval) if errors.is_empty() => Ok(NewSubscription {
            site,
            tags,
            blacklist,
            limit: limit as u32,
            interval,
        }),
        _ => Err(ApiError::Validation(errors)),
    }
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn ingest_response(ingested: Ingested) -> ApiResult<(StatusCode, Json<IngestResponse>)> {
    let file = ingested
        .file
        .ok_or_else(|| ApiError::Internal("ingest returned no file".to_string()))?;
    let (code, status) = match ingested.status {
        IngestStatus::Success => (StatusCode::CREATED, "success"),
        IngestStatus::Exists => (StatusCode::OK, "exists"),
        IngestStatus::Blacklisted => {
            return Err(ApiError::Internal("unexpected blacklist outcome".to_string()));
        }
    };
    Ok((code, Json(IngestResponse { status, file })))
}

/// POST /api/subscriptions
pub async fn create_subscription(
    State(state): State<AppState>,
    Json(req): Json<CreateSubscriptionRequest>,
) -> ApiResult<(StatusCode, Json<Subscription>)> {
    let new = validate_subscription(req, &state.sites, state.default_limit)?;
    let created = state.store.create_subscription(&new, Utc::now()).await?;
    let code = if created.created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((code, Json(created.subscription)))
}

/// GET /api/subscriptions
pub async fn list_subscriptions(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<SubscriptionSummary>>> {
    Ok(Json(state.store.list_subscriptions().await?))
}

/// GET /api/subscriptions/:id
pub async fn get_subscription(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<SubscriptionDetail>> {
    let subscription = state
        .store
        .find_subscription(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("subscription {}", id)))?;
    let runs = state.store.runs_for_identity(&subscription.site, &subscription.tags).await?;
    Ok(Json(SubscriptionDetail { subscription, runs }))
}

/// PUT /api/subscriptions/:id/status
pub async fn update_subscription_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<StatusRequest>,
) -> ApiResult<Json<Subscription>> {
    let status = match req.status.trim().to_lowercase().parse::<SubscriptionStatus>() {
        Ok(s @ (SubscriptionStatus::Waiting | SubscriptionStatus::Paused)) => s,
        _ => {
            return Err(ApiError::Validation(vec![FieldError::new(
                "status",
                "must be waiting or paused",
            )]));
        }
    };

    let current = state
        .store
        .find_subscription(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("subscription {}", id)))?;
    if current.status == SubscriptionStatus::Running && status == SubscriptionStatus::Waiting {
        return Err(ApiError::Conflict(format!("subscription {} is running", id)));
    }

    state.store.update_subscription_status(id, status, None).await?;
    let updated = state
        .store
        .find_subscription(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("subscription {}", id)))?;
    Ok(Json(updated))
}

/// GET /api/runs?site=..&tags=a,b
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> ApiResult<Json<Vec<SubscriptionRun>>> {
    let tags = split_list(Some(&query.tags));
    if tags.is_empty() {
        return Err(ApiError::Validation(vec![FieldError::new("tags", "at least one tag required")]));
    }
    let site = query.site.trim().to_lowercase();
    Ok(Json(state.store.runs_for_identity(&site, &tags).await?))
}

/// GET /api/runs/:id/log
pub async fn get_run_log(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<RunDetail>> {
    let run = state
        .store
        .find_run(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("run {}", id)))?;
    let log = state.store.run_log(id).await?;
    Ok(Json(RunDetail { run, log }))
}

/// POST /api/files: raw image body
pub async fn upload_file(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<IngestResponse>)> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let rating = match query.rating.as_deref() {
        None => Rating::Explicit,
        Some(raw) => raw.trim().to_lowercase().parse::<Rating>().map_err(|_| {
            ApiError::Validation(vec![FieldError::new(
                "rating",
                "must be safe, questionable or explicit",
            )])
        })?,
    };

    let upload = Upload {
        bytes: body.to_vec(),
        content_type,
        tags: split_list(query.tags.as_deref()),
        rating,
        sources: split_list(query.sources.as_deref()),
    };
    ingest_response(state.downloader.import_upload(upload).await?)
}

/// POST /api/fetch: ingest one item page through its site adapter
pub async fn fetch_file(
    State(state): State<AppState>,
    Json(req): Json<FetchRequest>,
) -> ApiResult<(StatusCode, Json<IngestResponse>)> {
    if req.url.trim().is_empty() {
        return Err(ApiError::Validation(vec![FieldError::new("url", "required")]));
    }
    ingest_response(state.downloader.ingest(&req.url, None).await?)
}

/// GET /api/files/:id
pub async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<FileRecord>> {
    state
        .store
        .find_file(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("file {}", id)))
}

/// PUT /api/files/:id/status
pub async fn update_file_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<StatusRequest>,
) -> ApiResult<Json<FileRecord>> {
    let status = match req.status.trim().to_lowercase().parse::<FileStatus>() {
        Ok(s @ (FileStatus::Inbox | FileStatus::Archived | FileStatus::Trash)) => s,
        _ => {
            return Err(ApiError::Validation(vec![FieldError::new(
                "status",
                "must be inbox, archived or trash",
            )]));
        }
    };
    set_file_status(&state, id, status).await
}

/// DELETE /api/files/:id moves the file to the trash
pub async fn trash_file(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<FileRecord>> {
    set_file_status(&state, id, FileStatus::Trash).await
}

async fn set_file_status(state: &AppState, id: i64, status: FileStatus) -> ApiResult<Json<FileRecord>> {
    let current = state
        .store
        .find_file(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("file {}", id)))?;
    if current.status == FileStatus::Deleted {
        return Err(ApiError::Conflict(format!("file {} has been deleted", id)));
    }
    state
        .store
        .set_file_status(id, status, Utc::now())
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("file {}", id)))
}

/// GET /api/scheduler
pub async fn scheduler_status(State(state): State<AppState>) -> Json<SchedulerStatus> {
    Json(state.scheduler.status())
}

/// POST /api/scheduler/tick starts a tick in the background
pub async fn trigger_tick(State(state): State<AppState>) -> ApiResult<StatusCode> {
    if state.scheduler.status().state == FlightState::Ticking {
        return Err(ApiError::Conflict("a tick is already running".to_string()));
    }

    let scheduler = state.scheduler.clone();
    tokio::spawn(async move {
        match scheduler.tick().await {
            Ok(TickOutcome::Busy) => tracing::debug!("Manual tick raced another tick"),
            Ok(TickOutcome::Completed(_)) => {}
            Err(e) => tracing::error!("Manual tick aborted: {}", e),
        }
    });
    Ok(StatusCode::ACCEPTED)
}
