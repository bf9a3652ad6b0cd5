//! Listing page extractors: raw HTML in, newest-first items out.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use nhv_core::{Item, ItemType};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: &'static str, message: String },
    #[error("entry {position} on {page_url} is missing {field}")]
    MissingField {
        page_url: String,
        position: usize,
        field: &'static str,
    },
    #[error("cannot resolve link {href:?} against {page_url}: {source}")]
    InvalidUrl {
        page_url: String,
        href: String,
        #[source]
        source: url::ParseError,
    },
}

/// An entry that was dropped because its publish time could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub position: usize,
    pub raw_time: Option<String>,
}

/// Items of one listing page in page order (newest first).
#[derive(Debug, Clone, PartialEq)]
pub struct ListingPage {
    pub page_url: String,
    pub item_type: ItemType,
    pub items: Vec<Item>,
    pub skipped: Vec<SkippedEntry>,
}

impl ListingPage {
    pub fn empty(page_url: impl Into<String>, item_type: ItemType) -> Self {
        Self {
            page_url: page_url.into(),
            item_type,
            items: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// The oldest well-formed item; entries with unreadable times never get here.
    pub fn last_item(&self) -> Option<&Item> {
        self.items.last()
    }
}

pub trait ListingExtractor: Send + Sync {
    fn site_id(&self) -> &'static str;

    fn parse_listing(
        &self,
        item_type: ItemType,
        page_url: &str,
        html: &str,
    ) -> Result<ListingPage, ExtractError>;
}

const ENTRY_SELECTOR: &str = ".box-category-item";
const LINK_SELECTOR: &str = ".box-category-link-title";
const CATEGORY_SELECTOR: &str = ".box-category-category";
const ARTICLE_TIME_SELECTOR: &str = ".time-ago-last-news";
const VIDEO_TIME_SELECTOR: &str = "span.time";
const ARTICLE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const VIDEO_DATE_FORMAT: &str = "%d/%m/%Y";
const SOURCE_OFFSET_SECS: i32 = 7 * 3600;

/// tuoitre.vn timeline listings. Times on the site are local (+07:00).
#[derive(Debug, Clone, Copy)]
pub struct TuoiTreExtractor {
    source_offset: FixedOffset,
}

impl Default for TuoiTreExtractor {
    fn default() -> Self {
        Self {
            source_offset: FixedOffset::east_opt(SOURCE_OFFSET_SECS)
                .expect("+07:00 is a valid offset"),
        }
    }
}

impl TuoiTreExtractor {
    pub fn with_offset(source_offset: FixedOffset) -> Self {
        Self { source_offset }
    }

    /// Returns the parsed time (if readable) together with the raw text.
    fn published_time(
        &self,
        entry: &ElementRef<'_>,
        item_type: ItemType,
    ) -> Result<(Option<DateTime<Utc>>, Option<String>), ExtractError> {
        let raw = match item_type {
            ItemType::Article => {
                let sel = selector(ARTICLE_TIME_SELECTOR)?;
                entry
                    .select(&sel)
                    .next()
                    .and_then(|n| n.value().attr("title"))
                    .map(str::to_string)
            }
            ItemType::Video => {
                let sel = selector(VIDEO_TIME_SELECTOR)?;
                entry.select(&sel).next().map(|n| n.text().collect::<String>())
            }
        };
        let parsed = raw
            .as_deref()
            .and_then(|raw| parse_local_time(raw, item_type, self.source_offset));
        Ok((parsed, raw))
    }
}

/// Parse a listing timestamp in the site's local offset and normalise to UTC.
pub fn parse_local_time(
    raw: &str,
    item_type: ItemType,
    offset: FixedOffset,
) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    let naive = match item_type {
        ItemType::Article => NaiveDateTime::parse_from_str(raw, ARTICLE_TIME_FORMAT).ok()?,
        ItemType::Video => NaiveDate::parse_from_str(raw, VIDEO_DATE_FORMAT)
            .ok()?
            .and_hms_opt(0, 0, 0)?,
    };
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

fn selector(css: &'static str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector {
        selector: css,
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl ListingExtractor for TuoiTreExtractor {
    fn site_id(&self) -> &'static str {
        "tuoitre"
    }

    fn parse_listing(
        &self,
        item_type: ItemType,
        page_url: &str,
        html: &str,
    ) -> Result<ListingPage, ExtractError> {
        let base = Url::parse(page_url).map_err(|source| ExtractError::InvalidUrl {
            page_url: page_url.to_string(),
            href: page_url.to_string(),
            source,
        })?;
        let document = Html::parse_document(html);
        let entry_sel = selector(ENTRY_SELECTOR)?;
        let link_sel = selector(LINK_SELECTOR)?;
        let category_sel = selector(CATEGORY_SELECTOR)?;

        let mut page = ListingPage::empty(page_url, item_type);
        for (position, entry) in document.select(&entry_sel).enumerate() {
            let missing = |field| ExtractError::MissingField {
                page_url: page_url.to_string(),
                position,
                field,
            };
            let link = entry.select(&link_sel).next().ok_or_else(|| missing("link"))?;
            // Absent attributes fail the page; present-but-blank ones are kept
            // except for href, which becomes the storage key.
            let attr = |name: &'static str| {
                link.value()
                    .attr(name)
                    .map(|v| v.trim().to_string())
                    .ok_or_else(|| missing(name))
            };
            let href = attr("href")?;
            if href.is_empty() {
                return Err(missing("href"));
            }
            let title = attr("title")?;
            let identifier = attr("data-id")?;
            let url = base
                .join(&href)
                .map_err(|source| ExtractError::InvalidUrl {
                    page_url: page_url.to_string(),
                    href: href.clone(),
                    source,
                })?;
            let category = entry
                .select(&category_sel)
                .next()
                .and_then(|n| text_or_none(n.text().collect::<String>()));

            let (published_time, raw_time) = self.published_time(&entry, item_type)?;
            let Some(published_time) = published_time else {
                page.skipped.push(SkippedEntry { position, raw_time });
                continue;
            };

            page.items.push(Item {
                url: url.to_string(),
                title,
                identifier,
                category,
                item_type,
                published_time,
                score: None,
            });
        }
        Ok(page)
    }
}

pub fn extractor_for_site(site_id: &str) -> Option<Box<dyn ListingExtractor>> {
    match site_id {
        "tuoitre" => Some(Box::new(TuoiTreExtractor::default())),
        _ => None,
    }
}
