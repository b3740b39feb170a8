//! Single-item ingestion
//!
//! This module provides functionality for:
//! 1. Normalizing item URLs and resolving their site adapter
//! 2. Blacklist and media-type screening before any bytes are fetched
//! 3. Content-hash deduplication (MD5) against the store
//! 4. Writing new media under an opaque, sharded filename
//! 5. Manual uploads through the same deduplication path

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::archive::database::{ContentStore, StoreError};
use crate::archive::models::{FileRecord, NewFile, NewSource, Rating, Tag};
use crate::archive::storage::FileStorage;
use crate::sites::{FetchError, ItemMetadata, MediaFetcher, SiteError, SiteRegistry};

/// Extensions accepted from remote sites
pub const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Error types for ingestion
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Unsupported site: {0}")]
    UnsupportedSite(String),

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    #[error("Site error: {0}")]
    Site(#[from] SiteError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for ingestion
pub type DownloadResult<T> = Result<T, DownloadError>;

/// How a crawl treats an ingestion error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Logged as `skipped`; the item is not something this archive takes
    Skip,
    /// Logged as `failed`; the crawl moves on
    Fail,
    /// Aborts the run
    Fatal,
}

impl DownloadError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DownloadError::UnsupportedSite(_) | DownloadError::UnsupportedMediaType(_) => {
                ErrorClass::Skip
            }
            DownloadError::Store(_) => ErrorClass::Fatal,
            _ => ErrorClass::Fail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStatus {
    Success,
    Exists,
    Blacklisted,
}

/// Result of a successful ingestion call
#[derive(Debug, Clone)]
pub struct Ingested {
    pub status: IngestStatus,
    /// The new or pre-existing file; `None` when blacklisted
    pub file: Option<FileRecord>,
}

/// Anything that can ingest an item URL
#[async_trait]
pub trait Ingest: Send + Sync {
    async fn ingest(&self, url: &str, blacklist: Option<&[String]>) -> DownloadResult<Ingested>;
}

/// A manual upload
#[derive(Debug, Clone)]
pub struct Upload {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub tags: Vec<String>,
    pub rating: Rating,
    pub sources: Vec<String>,
}

pub struct Downloader {
    store: Arc<ContentStore>,
    storage: Arc<FileStorage>,
    sites: Arc<SiteRegistry>,
    fetcher: Arc<dyn MediaFetcher>,
}

impl Downloader {
    /// Create a new downloader
    pub fn new(
        store: Arc<ContentStore>,
        storage: Arc<FileStorage>,
        sites: Arc<SiteRegistry>,
        fetcher: Arc<dyn MediaFetcher>,
    ) -> Self {
        Self { store, storage, sites, fetcher }
    }

    /// Store a manually uploaded file, deduplicated by content hash
    #[instrument(skip(self, upload), fields(size = upload.bytes.len()))]
    pub async fn import_upload(&self, upload: Upload) -> DownloadResult<Ingested> {
        if upload.bytes.is_empty() {
            return Err(DownloadError::InvalidUpload("empty body".to_string()));
        }
        let extension = extension_for_mime(&upload.content_type)
            .ok_or_else(|| DownloadError::UnsupportedMediaType(upload.content_type.clone()))?;

        let tags = upload.tags.iter().map(|t| Tag::parse(t)).collect();
        let sources = upload
            .sources
            .iter()
            .map(|url| NewSource { url: url.clone(), site: self.sites.source_site(url) })
            .collect();

        self.persist(upload.bytes, extension, tags, upload.rating, sources).await
    }

    fn item_sources(&self, item: &ItemMetadata, item_url: &str) -> Vec<NewSource> {
        let mut urls = Vec::new();
        if let Some(pixiv_id) = item.pixiv_id {
            urls.push(format!("https://www.pixiv.net/artworks/{}", pixiv_id));
        } else if let Some(source) = &item.source {
            urls.push(source.trim().to_lowercase());
        }
        urls.push(item_url.to_string());
        urls.dedup();

        urls.into_iter()
            .map(|url| {
                let site = self.sites.source_site(&url);
                NewSource { url, site }
            })
            .collect()
    }

    /// Hash, deduplicate, write and record
    async fn persist(
        &self,
        bytes: Vec<u8>,
        extension: &str,
        tags: Vec<Tag>,
        rating: Rating,
        sources: Vec<NewSource>,
    ) -> DownloadResult<Ingested> {
        let hash = format!("{:x}", md5::compute(&bytes));

        if let Some(existing) = self.store.find_file_by_hash(&hash).await? {
            debug!("Content {} already archived as file {}", hash, existing.id);
            return Ok(Ingested { status: IngestStatus::Exists, file: Some(existing) });
        }

        let filename = FileStorage::generate_filename(extension);
        self.storage.write(&filename, &bytes).await?;

        let new_file = NewFile {
            filename: filename.clone(),
            hash,
            size_bytes: bytes.len() as u64,
            rating,
            tags,
            sources,
        };

        let created = match self.store.create_file(&new_file).await {
            Ok(created) => created,
            Err(e) => {
                if let Err(remove_err) = self.storage.remove(&filename).await {
                    warn!("Failed to remove {} after store error: {}", filename, remove_err);
                }
                return Err(e.into());
            }
        };

        if created.existed {
            self.storage.remove(&filename).await?;
            return Ok(Ingested { status: IngestStatus::Exists, file: Some(created.file) });
        }

        info!("Archived {} ({} bytes)", created.file.filename, created.file.size_bytes);
        Ok(Ingested { status: IngestStatus::Success, file: Some(created.file) })
    }
}

#[async_trait]
impl Ingest for Downloader {
    #[instrument(skip(self, blacklist))]
    async fn ingest(&self, url: &str, blacklist: Option<&[String]>) -> DownloadResult<Ingested> {
        let url = normalize_url(url);
        let adapter = self
            .sites
            .for_url(&url)
            .ok_or_else(|| DownloadError::UnsupportedSite(url.clone()))?;

        let item = adapter.fetch_item(&url).await?;
        let tags: Vec<Tag> = item.tags.combined().iter().map(|t| Tag::parse(t)).collect();

        if let Some(blacklist) = blacklist {
            if let Some(hit) = blacklist_hit(&tags, blacklist) {
                info!("Skipping {}: blacklisted tag {}", url, hit);
                return Ok(Ingested { status: IngestStatus::Blacklisted, file: None });
            }
        }

        let extension = item.extension.to_lowercase();
        if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(DownloadError::UnsupportedMediaType(extension));
        }

        let bytes = self.fetcher.fetch(&item.media_url).await?;
        let sources = self.item_sources(&item, &url);
        self.persist(bytes, &extension, tags, map_rating(&item.rating), sources).await
    }
}

/// Canonical form of an item URL: https, no query string, no trailing slash
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();

    let mut url = if lower.starts_with("https://") {
        format!("https://{}", &trimmed[8..])
    } else if lower.starts_with("http://") {
        format!("https://{}", &trimmed[7..])
    } else {
        format!("https://{}", trimmed)
    };

    if let Some(pos) = url.find(['?', '#']) {
        url.truncate(pos);
    }
    while url.ends_with('/') {
        url.pop();
    }
    url
}

/// Rating code to rating; unknown codes are treated as explicit
pub fn map_rating(code: &str) -> Rating {
    match code.trim().to_lowercase().as_str() {
        "g" | "s" | "safe" | "general" | "sensitive" => Rating::Safe,
        "q" | "questionable" => Rating::Questionable,
        _ => Rating::Explicit,
    }
}

/// First blacklist entry present among the item's tags
fn blacklist_hit(tags: &[Tag], blacklist: &[String]) -> Option<String> {
    blacklist
        .iter()
        .map(|entry| Tag::parse(entry))
        .find(|banned| tags.contains(banned))
        .map(|banned| banned.combined())
}

fn extension_for_mime(content_type: &str) -> Option<&'static str> {
    let mime = content_type.split(';').next().unwrap_or("").trim().to_lowercase();
    match mime.as_str() {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        _ => None,
    }
}
