//! Danbooru adapter
//!
//! Item pages look like `https://danbooru.donmai.us/posts/<id>`; metadata is
//! read from the JSON API next to them. Gallery pages are numbered from 0 by
//! the crawl engine and from 1 by Danbooru.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

use super::http::{RetryPolicy, get_with_retry};
use super::{ItemMetadata, ItemTags, SiteAdapter, SiteError, SiteResult};

pub const DANBOORU_BASE_URL: &str = "https://danbooru.donmai.us";

/// A post as returned by `/posts.json` and `/posts/<id>.json`
#[derive(Debug, Clone, Deserialize)]
pub struct DanbooruPost {
    pub id: Option<u64>,
    #[serde(default)]
    pub rating: Option<String>,
    #[serde(default)]
    pub tag_string_general: String,
    #[serde(default)]
    pub tag_string_character: String,
    #[serde(default)]
    pub tag_string_copyright: String,
    #[serde(default)]
    pub tag_string_artist: String,
    #[serde(default)]
    pub tag_string_meta: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub pixiv_id: Option<u64>,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub file_ext: Option<String>,
}

pub struct DanbooruAdapter {
    client: Client,
    base_url: String,
    policy: RetryPolicy,
}

impl DanbooruAdapter {
    /// Create a new adapter against the public Danbooru instance
    pub fn new(client: Client, policy: RetryPolicy) -> Self {
        Self { client, base_url: DANBOORU_BASE_URL.to_string(), policy }
    }

    pub fn post_url(&self, id: u64) -> String {
        format!("{}/posts/{}", self.base_url, id)
    }

    fn gallery_api_url(&self, tags: &[String], page: u32) -> SiteResult<String> {
        let mut url = Url::parse(&format!("{}/posts.json", self.base_url))
            .map_err(|e| SiteError::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("tags", &tags.join(" "))
            .append_pair("page", &(page + 1).to_string());
        Ok(url.to_string())
    }

    async fn get_json(&self, url: &str) -> SiteResult<Value> {
        let response = get_with_retry(&self.client, url, self.policy)
            .await
            .map_err(|e| match e.status() {
                Some(404) => SiteError::NotFound(url.to_string()),
                Some(status) => SiteError::Upstream(format!("HTTP {} from {}", status, url)),
                None => SiteError::Fetch(e),
            })?;
        response
            .json::<Value>()
            .await
            .map_err(|e| SiteError::Parse(e.to_string()))
    }
}

#[async_trait]
impl SiteAdapter for DanbooruAdapter {
    fn name(&self) -> &str {
        "danbooru"
    }

    fn hosts(&self) -> &[&str] {
        &["danbooru.donmai.us"]
    }

    #[instrument(skip(self))]
    async fn fetch_item(&self, url: &str) -> SiteResult<ItemMetadata> {
        let id = post_id_from_url(url)?;
        let api_url = format!("{}/posts/{}.json", self.base_url, id);
        let body = self.get_json(&api_url).await?;
        parse_item(body)
    }

    #[instrument(skip(self))]
    async fn enumerate_page(&self, tags: &[String], page: u32) -> SiteResult<Vec<String>> {
        let api_url = self.gallery_api_url(tags, page)?;
        let body = self.get_json(&api_url).await?;
        let posts: Vec<DanbooruPost> =
            serde_json::from_value(body).map_err(|e| SiteError::Parse(e.to_string()))?;
        let urls = gallery_urls(&posts, |id| self.post_url(id));
        debug!("Danbooru page {} yielded {} items", page, urls.len());
        Ok(urls)
    }
}

/// Extract the numeric post id from an item URL
pub fn post_id_from_url(url: &str) -> SiteResult<u64> {
    let parsed = Url::parse(url).map_err(|e| SiteError::InvalidUrl(format!("{}: {}", url, e)))?;
    let mut segments = parsed
        .path_segments()
        .ok_or_else(|| SiteError::InvalidUrl(url.to_string()))?;
    match (segments.next(), segments.next()) {
        (Some("posts"), Some(id)) => {
            let id = id.strip_suffix(".json").unwrap_or(id);
            id.parse::<u64>().map_err(|_| SiteError::InvalidUrl(url.to_string()))
        }
        _ => Err(SiteError::InvalidUrl(url.to_string())),
    }
}

/// Item URLs for a gallery page; posts without an id are dropped
pub fn gallery_urls(posts: &[DanbooruPost], post_url: impl Fn(u64) -> String) -> Vec<String> {
    posts.iter().filter_map(|p| p.id).map(post_url).collect()
}

/// Turn an item API response into metadata
pub fn parse_item(body: Value) -> SiteResult<ItemMetadata> {
    if body.get("success").and_then(Value::as_bool) == Some(false) {
        let message = body
            .get("message")
            .or_else(|| body.get("error"))
            .and_then(Value::as_str)
            .unwrap_or("post unavailable");
        return Err(SiteError::NotFound(message.to_string()));
    }

    let post: DanbooruPost =
        serde_json::from_value(body).map_err(|e| SiteError::Parse(e.to_string()))?;
    let media_url = post
        .file_url
        .clone()
        .ok_or_else(|| SiteError::NotFound(format!("post {:?} has no file", post.id)))?;
    let extension = post
        .file_ext
        .clone()
        .or_else(|| extension_from_url(&media_url))
        .unwrap_or_default()
        .to_lowercase();

    Ok(ItemMetadata {
        tags: ItemTags {
            creator: split_tags(&post.tag_string_artist),
            character: split_tags(&post.tag_string_character),
            series: split_tags(&post.tag_string_copyright),
            general: split_tags(&post.tag_string_general),
            meta: split_tags(&post.tag_string_meta),
        },
        rating: post.rating.unwrap_or_default(),
        pixiv_id: post.pixiv_id,
        source: post.source.filter(|s| !s.trim().is_empty()),
        media_url,
        extension,
    })
}

fn split_tags(tag_string: &str) -> Vec<String> {
    tag_string.split_whitespace().map(str::to_string).collect()
}

/// Lowercase extension of the last path segment of a URL
pub fn extension_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    let (_, ext) = last.rsplit_once('.')?;
    Some(ext.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter() -> DanbooruAdapter {
        DanbooruAdapter::new(Client::new(), RetryPolicy::default())
    }

    #[test]
    fn test_post_id_from_url() {
        assert_eq!(post_id_from_url("https://danbooru.donmai.us/posts/123").unwrap(), 123);
        assert_eq!(post_id_from_url("https://danbooru.donmai.us/posts/123.json").unwrap(), 123);
        assert!(post_id_from_url("https://danbooru.donmai.us/pools/5").is_err());
        assert!(post_id_from_url("https://danbooru.donmai.us/posts/undefined").is_err());
    }

    #[test]
    fn test_gallery_url_maps_page_and_tags() {
        let url = adapter()
            .gallery_api_url(&["landscape".to_string(), "sky".to_string()], 0)
            .unwrap();
        assert_eq!(url, "https://danbooru.donmai.us/posts.json?tags=landscape+sky&page=1");
    }

    #[test]
    fn test_gallery_drops_posts_without_id() {
        let posts: Vec<DanbooruPost> =
            serde_json::from_value(json!([{ "id": 1 }, { "id": null }, { "id": 3 }])).unwrap();
        let adapter = adapter();
        let urls = gallery_urls(&posts, |id| adapter.post_url(id));
        assert_eq!(
            urls,
            vec![
                "https://danbooru.donmai.us/posts/1".to_string(),
                "https://danbooru.donmai.us/posts/3".to_string(),
            ]
        );
    }

    #[test]
    fn test_parse_item() {
        let item = parse_item(json!({
            "id": 42,
            "rating": "q",
            "tag_string_general": "1girl  sky",
            "tag_string_character": "hakurei_reimu",
            "tag_string_copyright": "touhou",
            "tag_string_artist": "some_artist",
            "tag_string_meta": "highres",
            "source": "https://twitter.com/x/status/1",
            "pixiv_id": null,
            "file_url": "https://cdn.donmai.us/original/ab/cd/abcd.JPG",
        }))
        .unwrap();

        assert_eq!(item.rating, "q");
        assert_eq!(item.extension, "jpg");
        assert_eq!(item.tags.general, vec!["1girl", "sky"]);
        assert_eq!(item.tags.series, vec!["touhou"]);
        assert_eq!(item.source.as_deref(), Some("https://twitter.com/x/status/1"));
        assert_eq!(
            item.tags.combined(),
            vec![
                "creator:some_artist",
                "character:hakurei_reimu",
                "series:touhou",
                "1girl",
                "sky",
                "meta:highres",
            ]
        );
    }

    #[test]
    fn test_parse_item_failure_payload() {
        let err = parse_item(json!({ "success": false, "error": "ActiveRecord::RecordNotFound" }))
            .unwrap_err();
        assert!(matches!(err, SiteError::NotFound(_)));

        let err = parse_item(json!({ "id": 7, "rating": "s" })).unwrap_err();
        assert!(matches!(err, SiteError::NotFound(_)));
    }
}
