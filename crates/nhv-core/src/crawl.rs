//! Per-stream pagination state and the page-termination decision.
//!
//! Listing pages arrive newest-first, so the last item on a page is the oldest
//! one. A stream keeps paging while that item is strictly newer than the crawl
//! horizon and stops at the first page whose last item is at or before it.
//! Only the last item is consulted; a page that is not perfectly sorted can
//! end a stream one page early or late.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Item, ItemType};

pub const PAGE_PLACEHOLDER: &str = "{page}";
pub const DEFAULT_ARTICLE_URL_TEMPLATE: &str = "https://tuoitre.vn/timeline/0/trang-{page}.htm";
pub const DEFAULT_VIDEO_URL_TEMPLATE: &str =
    "https://tuoitre.vn/timeline/search.htm?pageindex={page}";

/// Earliest publish instant still considered in range for a crawl run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Horizon {
    from: DateTime<Utc>,
}

impl Horizon {
    pub fn at(from: DateTime<Utc>) -> Self {
        Self { from }
    }

    /// Saturates at the earliest representable instant for very large `days`.
    pub fn days_ago(now: DateTime<Utc>, days: u32) -> Self {
        let from = now
            .checked_sub_signed(Duration::days(i64::from(days)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self { from }
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.from
    }

    /// True when `published_time` is strictly newer than the horizon.
    pub fn admits(&self, published_time: DateTime<Utc>) -> bool {
        published_time > self.from
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("page url template {0:?} has no {{page}} placeholder")]
pub struct InvalidTemplate(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageUrlTemplate(String);

impl PageUrlTemplate {
    pub fn new(template: impl Into<String>) -> Result<Self, InvalidTemplate> {
        let template = template.into();
        if !template.contains(PAGE_PLACEHOLDER) {
            return Err(InvalidTemplate(template));
        }
        Ok(Self(template))
    }

    pub fn default_for(item_type: ItemType) -> Self {
        match item_type {
            ItemType::Article => Self(DEFAULT_ARTICLE_URL_TEMPLATE.to_string()),
            ItemType::Video => Self(DEFAULT_VIDEO_URL_TEMPLATE.to_string()),
        }
    }

    pub fn render(&self, page_index: u32) -> String {
        self.0.replace(PAGE_PLACEHOLDER, &page_index.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The page produced no comparable item.
    EmptyPage,
    /// The last item on the page is at or before the horizon.
    ReachedHorizon,
}

/// What the driving loop should do after a page has been processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    FetchNext(String),
    Stop(StopReason),
}

impl NextAction {
    pub fn next_url(&self) -> Option<&str> {
        match self {
            NextAction::FetchNext(url) => Some(url),
            NextAction::Stop(_) => None,
        }
    }
}

/// Pagination position of one stream. Lives for a single crawl run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCursor {
    item_type: ItemType,
    page_index: u32,
    template: PageUrlTemplate,
}

impl StreamCursor {
    pub fn new(item_type: ItemType, template: PageUrlTemplate) -> Self {
        Self {
            item_type,
            page_index: 1,
            template,
        }
    }

    pub fn item_type(&self) -> ItemType {
        self.item_type
    }

    pub fn page_index(&self) -> u32 {
        self.page_index
    }

    pub fn page_url(&self) -> String {
        self.template.render(self.page_index)
    }

    /// Decide whether this stream continues after the page whose oldest
    /// comparable item is `last_item`.
    ///
    /// Advances the cursor only when continuing.
    pub fn decide_next(&mut self, last_item: Option<&Item>, horizon: &Horizon) -> NextAction {
        let Some(last_item) = last_item else {
            return NextAction::Stop(StopReason::EmptyPage);
        };
        if !horizon.admits(last_item.published_time) {
            return NextAction::Stop(StopReason::ReachedHorizon);
        }
        self.page_index = self.page_index.saturating_add(1);
        NextAction::FetchNext(self.page_url())
    }
}

/// The article and video cursors of one crawl run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCursors {
    pub article: StreamCursor,
    pub video: StreamCursor,
}

impl Default for StreamCursors {
    fn default() -> Self {
        Self::new(
            PageUrlTemplate::default_for(ItemType::Article),
            PageUrlTemplate::default_for(ItemType::Video),
        )
    }
}

impl StreamCursors {
    pub fn new(article: PageUrlTemplate, video: PageUrlTemplate) -> Self {
        Self {
            article: StreamCursor::new(ItemType::Article, article),
            video: StreamCursor::new(ItemType::Video, video),
        }
    }

    pub fn get(&self, item_type: ItemType) -> &StreamCursor {
        match item_type {
            ItemType::Article => &self.article,
            ItemType::Video => &self.video,
        }
    }

    fn get_mut(&mut self, item_type: ItemType) -> &mut StreamCursor {
        match item_type {
            ItemType::Article => &mut self.article,
            ItemType::Video => &mut self.video,
        }
    }

    /// Apply the decision for a page of `item_type`; only that stream's cursor
    /// can move.
    pub fn decide_next(
        &mut self,
        item_type: ItemType,
        last_item: Option<&Item>,
        horizon: &Horizon,
    ) -> NextAction {
        self.get_mut(item_type).decide_next(last_item, horizon)
    }
}
