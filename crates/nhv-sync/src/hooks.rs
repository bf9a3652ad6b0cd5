//! Post-extraction enrichment applied to each page before it is persisted.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use nhv_core::{Item, ItemType};

#[async_trait]
pub trait EnrichmentHook: Send + Sync {
    /// Fill in derived fields in place. Items must not be added or removed.
    async fn apply(&self, items: &mut [Item]) -> Result<()>;
}

#[derive(Default)]
pub struct NoopEnrichmentHook;

#[async_trait]
impl EnrichmentHook for NoopEnrichmentHook {
    async fn apply(&self, _items: &mut [Item]) -> Result<()> {
        Ok(())
    }
}

/// Looks up comment counts by site identifier.
#[async_trait]
pub trait CommentCountSource: Send + Sync {
    async fn comment_counts(
        &self,
        item_type: ItemType,
        identifiers: &[String],
    ) -> Result<HashMap<String, u64>>;
}

/// Scores items by their comment count. Items the source does not know keep
/// their current score.
pub struct CommentCountEnrichment<S> {
    source: S,
}

impl<S: CommentCountSource> CommentCountEnrichment<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

#[async_trait]
impl<S: CommentCountSource> EnrichmentHook for CommentCountEnrichment<S> {
    async fn apply(&self, items: &mut [Item]) -> Result<()> {
        let mut by_type: BTreeMap<ItemType, Vec<String>> = BTreeMap::new();
        for item in items.iter() {
            by_type
                .entry(item.item_type)
                .or_default()
                .push(item.identifier.clone());
        }

        for (item_type, identifiers) in by_type {
            let counts = self.source.comment_counts(item_type, &identifiers).await?;
            for item in items.iter_mut().filter(|i| i.item_type == item_type) {
                if let Some(count) = counts.get(&item.identifier) {
                    item.score = Some(*count as f64);
                }
            }
        }
        Ok(())
    }
}
