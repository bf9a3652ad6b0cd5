//! Comment counts from the tuoitre.vn comment service.
//!
//! The service answers `{"Data": ..., "Success": true}` where `Data` is a list
//! of `{object_id, total_comment}` rows, sometimes delivered as a JSON-encoded
//! string instead of an array.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use nhv_core::ItemType;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::hooks::CommentCountSource;
use crate::PageSource;

pub const IDS_PLACEHOLDER: &str = "{ids}";
pub const DEFAULT_COMMENT_COUNT_URL_TEMPLATE: &str =
    "https://id.tuoitre.vn/api/getcount-comment.api?ids={ids}";
const MAX_IDS_PER_REQUEST: usize = 50;

#[derive(Debug, Deserialize)]
struct CountResponse {
    #[serde(rename = "Data", default)]
    data: Option<CountData>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CountData {
    Rows(Vec<CountRow>),
    Encoded(String),
}

#[derive(Debug, Deserialize)]
struct CountRow {
    object_id: ObjectId,
    #[serde(alias = "total", alias = "TotalComment", default)]
    total_comment: u64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ObjectId {
    Number(u64),
    Text(String),
}

impl ObjectId {
    fn into_key(self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s.trim().to_string(),
        }
    }
}

fn parse_counts(body: &str) -> Result<HashMap<String, u64>> {
    let response: CountResponse =
        serde_json::from_str(body).context("decoding comment count response")?;
    let rows = match response.data {
        None => Vec::new(),
        Some(CountData::Rows(rows)) => rows,
        Some(CountData::Encoded(raw)) if raw.trim().is_empty() => Vec::new(),
        Some(CountData::Encoded(raw)) => {
            serde_json::from_str(&raw).context("decoding embedded comment count rows")?
        }
    };
    Ok(rows
        .into_iter()
        .map(|row| (row.object_id.into_key(), row.total_comment))
        .collect())
}

/// Looks up comment counts over HTTP, batching identifiers per request.
pub struct TuoiTreCommentCounts {
    pages: Arc<dyn PageSource>,
    url_template: String,
}

impl TuoiTreCommentCounts {
    pub fn new(pages: Arc<dyn PageSource>, url_template: impl Into<String>) -> Self {
        Self {
            pages,
            url_template: url_template.into(),
        }
    }

    fn request_url(&self, identifiers: &[&str]) -> String {
        let ids = identifiers
            .iter()
            .map(|id| url::form_urlencoded::byte_serialize(id.as_bytes()).collect::<String>())
            .collect::<Vec<_>>()
            .join(",");
        self.url_template.replace(IDS_PLACEHOLDER, &ids)
    }
}

#[async_trait]
impl CommentCountSource for TuoiTreCommentCounts {
    async fn comment_counts(
        &self,
        item_type: ItemType,
        identifiers: &[String],
    ) -> Result<HashMap<String, u64>> {
        let wanted: Vec<&str> = identifiers
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .collect();

        let lookup_id = Uuid::new_v4();
        let mut counts = HashMap::with_capacity(wanted.len());
        for chunk in wanted.chunks(MAX_IDS_PER_REQUEST) {
            let url = self.request_url(chunk);
            let body = self
                .pages
                .fetch_page(lookup_id, item_type, &url)
                .await
                .with_context(|| format!("fetching comment counts from {url}"))?;
            counts.extend(parse_counts(&body)?);
        }
        debug!(
            %item_type,
            requested = wanted.len(),
            found = counts.len(),
            "comment counts fetched"
        );
        Ok(counts)
    }
}
