//! Domain records shared by the store, the crawl engine and the HTTP API.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Error returned when a stored or submitted enum value is not recognised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

/// Declares a lowercase string-backed enum with Display/FromStr
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant { kind: $kind, value: other.to_string() }),
                }
            }
        }
    };
}

string_enum!(
    /// Content rating of an archived file
    Rating, "rating" {
        Safe => "safe",
        Questionable => "questionable",
        Explicit => "explicit",
    }
);

string_enum!(
    /// Lifecycle of an archived file
    FileStatus, "file status" {
        Inbox => "inbox",
        Archived => "archived",
        Trash => "trash",
        Deleted => "deleted",
    }
);

string_enum!(
    /// Tag namespace
    TagCategory, "tag category" {
        General => "general",
        Creator => "creator",
        Character => "character",
        Series => "series",
        Meta => "meta",
    }
);

string_enum!(
    /// How often a subscription is re-crawled
    Interval, "interval" {
        Daily => "daily",
        Weekly => "weekly",
        Monthly => "monthly",
    }
);

string_enum!(
    SubscriptionStatus, "subscription status" {
        Waiting => "waiting",
        Running => "running",
        Paused => "paused",
        Finished => "finished",
    }
);

string_enum!(
    RunStatus, "run status" {
        Running => "running",
        Finished => "finished",
    }
);

string_enum!(
    /// Result recorded for one URL of a crawl run
    RunOutcome, "run outcome" {
        Downloaded => "downloaded",
        Skipped => "skipped",
        Failed => "failed",
        Exists => "exists",
        Blacklisted => "blacklisted",
    }
);

impl Interval {
    pub fn duration(&self) -> Duration {
        match self {
            Interval::Daily => Duration::days(1),
            Interval::Weekly => Duration::days(7),
            Interval::Monthly => Duration::days(30),
        }
    }
}

impl RunOutcome {
    /// Outcomes that count as "nothing new here" for the skip streak
    pub fn is_skip(&self) -> bool {
        matches!(self, RunOutcome::Skipped | RunOutcome::Exists)
    }
}

impl TagCategory {
    /// Prefix used when a tag is written in its combined `namespace:name` form
    pub fn prefix(&self) -> Option<&'static str> {
        match self {
            TagCategory::General => None,
            TagCategory::Creator => Some("creator"),
            TagCategory::Character => Some("character"),
            TagCategory::Series => Some("series"),
            TagCategory::Meta => Some("meta"),
        }
    }
}

/// A namespaced tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub category: TagCategory,
}

impl Tag {
    pub fn new(name: impl Into<String>, category: TagCategory) -> Self {
        Self { name: normalize_tag_name(&name.into()), category }
    }

    /// Parse a combined tag string such as `creator:some_artist`.
    ///
    /// Only the known namespace prefixes are split off; any other colon is
    /// part of the tag name.
    pub fn parse(combined: &str) -> Self {
        let combined = combined.trim();
        if let Some((prefix, rest)) = combined.split_once(':') {
            let category = match prefix.to_lowercase().as_str() {
                "creator" | "artist" => Some(TagCategory::Creator),
                "character" => Some(TagCategory::Character),
                "series" | "copyright" => Some(TagCategory::Series),
                "meta" => Some(TagCategory::Meta),
                "general" => Some(TagCategory::General),
                _ => None,
            };
            if let Some(category) = category {
                return Tag::new(rest, category);
            }
        }
        Tag::new(combined, TagCategory::General)
    }

    /// Combined `namespace:name` form, bare for general tags
    pub fn combined(&self) -> String {
        match self.category.prefix() {
            Some(prefix) => format!("{}:{}", prefix, self.name),
            None => self.name.clone(),
        }
    }
}

pub fn normalize_tag_name(raw: &str) -> String {
    raw.trim().to_lowercase().replace(' ', "_")
}

/// A provenance URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub url: String,
    pub site: String,
}

/// A source URL about to be attached to a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSource {
    pub url: String,
    pub site: String,
}

/// An archived media file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: i64,
    pub filename: String,
    pub hash: String,
    pub size_bytes: u64,
    pub rating: Rating,
    pub status: FileStatus,
    pub tags: Vec<Tag>,
    pub sources: Vec<Source>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything needed to insert a file row
#[derive(Debug, Clone)]
pub struct NewFile {
    pub filename: String,
    pub hash: String,
    pub size_bytes: u64,
    pub rating: Rating,
    pub tags: Vec<Tag>,
    pub sources: Vec<NewSource>,
}

/// A recurring crawl of one site for a tag set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub site: String,
    pub tags: Vec<String>,
    pub blacklist: Vec<String>,
    pub limit: u32,
    pub interval: Interval,
    pub status: SubscriptionStatus,
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a subscription
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub site: String,
    pub tags: Vec<String>,
    pub blacklist: Vec<String>,
    pub limit: u32,
    pub interval: Interval,
}

/// One execution of a subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRun {
    pub id: i64,
    pub site: String,
    pub tags: Vec<String>,
    pub status: RunStatus,
    pub page_number: u32,
    pub downloaded_count: u32,
    pub skipped_count: u32,
    pub failed_count: u32,
    pub finished: bool,
    pub finished_at: Option<DateTime<Utc>>,
    pub orphaned: bool,
    pub created_at: DateTime<Utc>,
}

/// One append-only log line of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub id: i64,
    pub run_id: i64,
    pub url: String,
    pub outcome: RunOutcome,
    pub file_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Mutable counters of a run, persisted with every checkpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    pub page_number: u32,
    pub downloaded: u32,
    pub skipped: u32,
    pub failed: u32,
}

impl RunProgress {
    pub fn of(run: &SubscriptionRun) -> Self {
        Self {
            page_number: run.page_number,
            downloaded: run.downloaded_count,
            skipped: run.skipped_count,
            failed: run.failed_count,
        }
    }

    /// Counters after one more outcome
    pub fn record(self, outcome: RunOutcome) -> Self {
        let mut next = self;
        match outcome {
            RunOutcome::Downloaded => next.downloaded += 1,
            RunOutcome::Failed => next.failed += 1,
            RunOutcome::Skipped | RunOutcome::Exists | RunOutcome::Blacklisted => next.skipped += 1,
        }
        next
    }

    pub fn next_page(self) -> Self {
        Self { page_number: self.page_number + 1, ..self }
    }
}

/// Order-insensitive identity of a tag set
pub fn tag_key(tags: &[String]) -> String {
    let mut sorted: Vec<String> = tags.iter().map(|t| normalize_tag_name(t)).collect();
    sorted.sort();
    sorted.dedup();
    sorted.join(" ")
}
