//! Site adapters
//!
//! This module provides functionality for:
//! 1. The contract every remote gallery site implements
//! 2. A host-keyed registry that picks the adapter for a URL
//! 3. Provenance labels for source URLs
//! 4. Shared HTTP plumbing (client, retries, size-capped media fetches)

pub mod danbooru;
pub mod http;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub use danbooru::DanbooruAdapter;
pub use http::{FetchError, HttpFetcher, MediaFetcher, RetryPolicy};

/// Error types for site adapters
#[derive(Error, Debug)]
pub enum SiteError {
    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Invalid item URL: {0}")]
    InvalidUrl(String),

    #[error("Unexpected response: {0}")]
    Parse(String),

    #[error("Request failed: {0}")]
    Fetch(#[from] FetchError),
}

/// Result type for site adapter operations
pub type SiteResult<T> = Result<T, SiteError>;

/// Tags of a remote item, grouped by namespace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemTags {
    pub creator: Vec<String>,
    pub character: Vec<String>,
    pub series: Vec<String>,
    pub general: Vec<String>,
    pub meta: Vec<String>,
}

impl ItemTags {
    /// Flatten into `creator:`, `character:`, `series:`, bare general and `meta:` strings
    pub fn combined(&self) -> Vec<String> {
        let prefixed = |prefix: &str, tags: &[String]| -> Vec<String> {
            tags.iter().map(|t| format!("{}:{}", prefix, t)).collect()
        };

        let mut all = prefixed("creator", &self.creator);
        all.extend(prefixed("character", &self.character));
        all.extend(prefixed("series", &self.series));
        all.extend(self.general.iter().cloned());
        all.extend(prefixed("meta", &self.meta));
        all
    }
}

/// Metadata of one remote item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemMetadata {
    pub tags: ItemTags,
    /// Single-letter rating code as reported by the site
    pub rating: String,
    pub pixiv_id: Option<u64>,
    pub source: Option<String>,
    pub media_url: String,
    pub extension: String,
}

/// A remote gallery site
#[async_trait]
pub trait SiteAdapter: Send + Sync {
    /// Site identifier stored on subscriptions and sources
    fn name(&self) -> &str;

    /// Hosts served by this adapter, lowercase without `www.`
    fn hosts(&self) -> &[&str];

    /// Fetch the metadata of one item page
    async fn fetch_item(&self, url: &str) -> SiteResult<ItemMetadata>;

    /// Item URLs of one gallery page for the tag set; empty means exhausted
    async fn enumerate_page(&self, tags: &[String], page: u32) -> SiteResult<Vec<String>>;
}

/// Hosts that only ever appear as provenance
const PROVENANCE_HOSTS: &[(&str, &str)] = &[("pixiv.net", "pixiv")];

/// Adapter lookup by host and by site name
#[derive(Default, Clone)]
pub struct SiteRegistry {
    by_host: HashMap<String, Arc<dyn SiteAdapter>>,
    by_name: HashMap<String, Arc<dyn SiteAdapter>>,
}

impl SiteRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter for all of its hosts
    pub fn register(&mut self, adapter: Arc<dyn SiteAdapter>) {
        for host in adapter.hosts() {
            self.by_host.insert(host.to_string(), adapter.clone());
        }
        debug!("Registered site adapter {}", adapter.name());
        self.by_name.insert(adapter.name().to_string(), adapter);
    }

    /// Adapter serving the host of `url`
    pub fn for_url(&self, url: &str) -> Option<Arc<dyn SiteAdapter>> {
        let host = host_of(url)?;
        self.by_host.get(&host).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<dyn SiteAdapter>> {
        self.by_name.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Registered site names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Provenance label for a source URL
    pub fn source_site(&self, url: &str) -> String {
        let Some(host) = host_of(url) else {
            return "unknown".to_string();
        };
        if let Some(adapter) = self.by_host.get(&host) {
            return adapter.name().to_string();
        }
        PROVENANCE_HOSTS
            .iter()
            .find(|(h, _)| *h == host)
            .map(|(_, site)| site.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Lowercase host of a URL with any `www.` prefix removed
pub fn host_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    Some(host.strip_prefix("www.").map(str::to_string).unwrap_or(host))
}
