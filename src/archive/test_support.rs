//! Scripted sites, fetchers and ingestors for tests

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::archive::database::{ContentStore, StoreError};
use crate::archive::downloader::{DownloadError, Ingest, IngestStatus, Ingested, DownloadResult};
use crate::archive::storage::FileStorage;
use crate::sites::http::FetchResult;
use crate::sites::{
    FetchError, ItemMetadata, ItemTags, MediaFetcher, SiteAdapter, SiteError, SiteResult,
};

/// A store and file storage in a temporary directory
pub struct TestArchive {
    pub dir: TempDir,
    pub store: Arc<ContentStore>,
    pub storage: Arc<FileStorage>,
}

impl TestArchive {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ContentStore::open(dir.path().join("archive.sqlite")).unwrap());
        let storage = Arc::new(FileStorage::new(dir.path().join("files")).unwrap());
        Self { dir, store, storage }
    }
}

/// Metadata for item `id` with one creator and one general tag
pub fn item(id: u64, extension: &str) -> ItemMetadata {
    ItemMetadata {
        tags: ItemTags {
            creator: vec![format!("artist_{}", id)],
            general: vec!["scenery".to_string()],
            ..Default::default()
        },
        rating: "s".to_string(),
        pixiv_id: None,
        source: None,
        media_url: format!("https://cdn.fake.test/{}.{}", id, extension),
        extension: extension.to_string(),
    }
}

pub fn item_url(host: &str, id: u64) -> String {
    format!("https://{}/posts/{}", host, id)
}

/// Site with fixed items and gallery pages
pub struct FakeSite {
    name: String,
    hosts: Vec<&'static str>,
    items: HashMap<String, ItemMetadata>,
    pages: HashMap<u32, Vec<String>>,
    failing_pages: Vec<u32>,
    requested_pages: Mutex<Vec<u32>>,
}

impl FakeSite {
    pub fn new(name: &str, host: &'static str) -> Self {
        Self {
            name: name.to_string(),
            hosts: vec![host],
            items: HashMap::new(),
            pages: HashMap::new(),
            failing_pages: Vec::new(),
            requested_pages: Mutex::new(Vec::new()),
        }
    }

    pub fn host(&self) -> &'static str {
        self.hosts[0]
    }

    pub fn with_item(mut self, id: u64, meta: ItemMetadata) -> Self {
        self.items.insert(item_url(self.host(), id), meta);
        self
    }

    pub fn with_page(mut self, page: u32, urls: Vec<String>) -> Self {
        self.pages.insert(page, urls);
        self
    }

    pub fn with_failing_page(mut self, page: u32) -> Self {
        self.failing_pages.push(page);
        self
    }

    pub fn requested_pages(&self) -> Vec<u32> {
        self.requested_pages.lock().clone()
    }
}

#[async_trait]
impl SiteAdapter for FakeSite {
    fn name(&self) -> &str {
        &self.name
    }

    fn hosts(&self) -> &[&str] {
        &self.hosts
    }

    async fn fetch_item(&self, url: &str) -> SiteResult<ItemMetadata> {
        self.items
            .get(url)
            .cloned()
            .ok_or_else(|| SiteError::NotFound(url.to_string()))
    }

    async fn enumerate_page(&self, _tags: &[String], page: u32) -> SiteResult<Vec<String>> {
        self.requested_pages.lock().push(page);
        if self.failing_pages.contains(&page) {
            return Err(SiteError::Upstream(format!("page {} unavailable", page)));
        }
        Ok(self.pages.get(&page).cloned().unwrap_or_default())
    }
}

/// Serves media bytes keyed by the item id in the media URL
#[derive(Default)]
pub struct FakeFetcher {
    media: HashMap<u64, Vec<u8>>,
    calls: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_media(mut self, id: u64, bytes: &[u8]) -> Self {
        self.media.insert(id, bytes.to_vec());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> FetchResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let id = url
            .rsplit('/')
            .next()
            .and_then(|name| name.split('.').next())
            .and_then(|stem| stem.parse::<u64>().ok());
        id.and_then(|id| self.media.get(&id).cloned())
            .ok_or_else(|| FetchError::Status { status: 404, url: url.to_string() })
    }
}

/// Scripted reply of `ScriptedIngest`
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Success,
    Exists,
    Blacklisted,
    Unsupported,
    Upstream,
    StoreDown,
}

/// Ingest that answers from a script and records every call
pub struct ScriptedIngest {
    replies: HashMap<String, Reply>,
    default: Reply,
    calls: Mutex<Vec<String>>,
}

impl ScriptedIngest {
    pub fn new(default: Reply) -> Self {
        Self { replies: HashMap::new(), default, calls: Mutex::new(Vec::new()) }
    }

    pub fn reply(mut self, url: &str, reply: Reply) -> Self {
        self.replies.insert(url.to_string(), reply);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Ingest for ScriptedIngest {
    async fn ingest(&self, url: &str, _blacklist: Option<&[String]>) -> DownloadResult<Ingested> {
        self.calls.lock().push(url.to_string());
        let reply = self.replies.get(url).copied().unwrap_or(self.default);
        let status = match reply {
            Reply::Success => IngestStatus::Success,
            Reply::Exists => IngestStatus::Exists,
            Reply::Blacklisted => IngestStatus::Blacklisted,
            Reply::Unsupported => {
                return Err(DownloadError::UnsupportedMediaType("webm".to_string()));
            }
            Reply::Upstream => {
                return Err(DownloadError::Site(SiteError::Upstream("HTTP 503".to_string())));
            }
            Reply::StoreDown => {
                return Err(DownloadError::Store(StoreError::NotFound("database".to_string())));
            }
        };
        Ok(Ingested { status, file: None })
    }
}
