//! Core domain model for the news harvester: listing items and crawl state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod crawl;

pub use crawl::{Horizon, NextAction, PageUrlTemplate, StopReason, StreamCursor, StreamCursors};

/// Which listing a discovered entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Article,
    Video,
}

impl ItemType {
    pub const ALL: [ItemType; 2] = [ItemType::Article, ItemType::Video];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Article => "article",
            ItemType::Video => "video",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown item type {0:?}")]
pub struct UnknownItemType(pub String);

impl FromStr for ItemType {
    type Err = UnknownItemType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "article" => Ok(ItemType::Article),
            "video" => Ok(ItemType::Video),
            other => Err(UnknownItemType(other.to_string())),
        }
    }
}

/// One entry discovered on a listing page.
///
/// `url` is the natural key used for persistence. `score` stays `None` until an
/// enrichment hook fills it in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub url: String,
    pub title: String,
    pub identifier: String,
    pub category: Option<String>,
    pub item_type: ItemType,
    pub published_time: DateTime<Utc>,
    #[serde(default)]
    pub score: Option<f64>,
}

impl Item {
    pub fn new(
        url: impl Into<String>,
        title: impl Into<String>,
        identifier: impl Into<String>,
        item_type: ItemType,
        published_time: DateTime<Utc>,
    ) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            identifier: identifier.into(),
            category: None,
            item_type,
            published_time,
            score: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    /// Publish time as seconds since the Unix epoch.
    pub fn published_timestamp(&self) -> i64 {
        self.published_time.timestamp()
    }
}
