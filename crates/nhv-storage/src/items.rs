//! Item table access and the idempotent bulk upsert.
//!
//! Rows are keyed by `url`. Re-upserting a known url refreshes `score` and
//! `update_time` only; every other column keeps its first-seen value.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nhv_core::{Item, ItemType};
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row};
use tokio::sync::Mutex;
use tracing::debug;

use crate::filter::Column;
use crate::repository::{Entity, PgRepository};
use crate::PersistenceError;

/// Rows per `INSERT` statement; seven binds each keeps far below the
/// Postgres parameter limit.
pub const MAX_ROWS_PER_STATEMENT: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredItem {
    pub id: i64,
    #[serde(flatten)]
    pub item: Item,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for StoredItem {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let item_type: String = row.try_get("item_type")?;
        let item_type = item_type
            .parse::<ItemType>()
            .map_err(|err| sqlx::Error::ColumnDecode {
                index: "item_type".to_string(),
                source: Box::new(err),
            })?;
        Ok(Self {
            id: row.try_get("id")?,
            item: Item {
                url: row.try_get("url")?,
                title: row.try_get("title")?,
                identifier: row.try_get("identifier")?,
                category: row.try_get("category")?,
                item_type,
                published_time: row.try_get("published_time")?,
                score: row.try_get("score")?,
            },
            create_time: row.try_get("create_time")?,
            update_time: row.try_get("update_time")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemColumn {
    Id,
    Url,
    Title,
    Identifier,
    Category,
    ItemType,
    PublishedTime,
    Score,
    CreateTime,
    UpdateTime,
}

impl Column for ItemColumn {
    fn name(self) -> &'static str {
        match self {
            ItemColumn::Id => "id",
            ItemColumn::Url => "url",
            ItemColumn::Title => "title",
            ItemColumn::Identifier => "identifier",
            ItemColumn::Category => "category",
            ItemColumn::ItemType => "item_type",
            ItemColumn::PublishedTime => "published_time",
            ItemColumn::Score => "score",
            ItemColumn::CreateTime => "create_time",
            ItemColumn::UpdateTime => "update_time",
        }
    }
}

impl Entity for StoredItem {
    type Column = ItemColumn;

    const TABLE: &'static str = "items";
    const KEY: ItemColumn = ItemColumn::Url;
    const COLUMNS: &'static [ItemColumn] = &[
        ItemColumn::Id,
        ItemColumn::Url,
        ItemColumn::Title,
        ItemColumn::Identifier,
        ItemColumn::Category,
        ItemColumn::ItemType,
        ItemColumn::PublishedTime,
        ItemColumn::Score,
        ItemColumn::CreateTime,
        ItemColumn::UpdateTime,
    ];
    const ORDER_BY: &'static str = "published_time DESC, id DESC";
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
}

impl UpsertOutcome {
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }

    pub fn absorb(&mut self, other: UpsertOutcome) {
        self.inserted += other.inserted;
        self.updated += other.updated;
    }
}

#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Insert new urls and refresh `score`/`update_time` of known ones, all or
    /// nothing. An empty batch is a no-op.
    async fn bulk_upsert(&self, items: &[Item]) -> Result<UpsertOutcome, PersistenceError>;
}

/// Validate urls and collapse repeated urls within one batch. The last
/// occurrence supplies the values; the first occurrence keeps its position.
pub fn prepare_batch(items: &[Item]) -> Result<Vec<&Item>, PersistenceError> {
    let mut positions: HashMap<&str, usize> = HashMap::with_capacity(items.len());
    let mut batch: Vec<&Item> = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        if item.url.trim().is_empty() {
            return Err(PersistenceError::MissingUrl { index });
        }
        match positions.get(item.url.as_str()) {
            Some(&pos) => batch[pos] = item,
            None => {
                positions.insert(item.url.as_str(), batch.len());
                batch.push(item);
            }
        }
    }
    Ok(batch)
}

pub(crate) fn upsert_statement(rows: &[&Item]) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(
        "INSERT INTO items (url, title, identifier, category, item_type, published_time, score) ",
    );
    qb.push_values(rows.iter(), |mut row, item| {
        row.push_bind(item.url.clone())
            .push_bind(item.title.clone())
            .push_bind(item.identifier.clone())
            .push_bind(item.category.clone())
            .push_bind(item.item_type.as_str())
            .push_bind(item.published_time)
            .push_bind(item.score);
    });
    qb.push(
        " ON CONFLICT (url) DO UPDATE SET score = EXCLUDED.score, update_time = NOW() \
         RETURNING (xmax = 0) AS inserted",
    );
    qb
}

/// One statement per `MAX_ROWS_PER_STATEMENT` rows, in batch order.
pub(crate) fn upsert_statements<'a>(
    batch: &'a [&'a Item],
) -> impl Iterator<Item = QueryBuilder<'static, Postgres>> + 'a {
    batch.chunks(MAX_ROWS_PER_STATEMENT).map(upsert_statement)
}

/// Postgres-backed item table.
#[derive(Clone)]
pub struct PgItemStore {
    repo: PgRepository<StoredItem>,
}

impl PgItemStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            repo: PgRepository::new(pool),
        }
    }

    pub fn repository(&self) -> &PgRepository<StoredItem> {
        &self.repo
    }
}

#[async_trait]
impl ItemStore for PgItemStore {
    async fn bulk_upsert(&self, items: &[Item]) -> Result<UpsertOutcome, PersistenceError> {
        let batch = prepare_batch(items)?;
        if batch.is_empty() {
            return Ok(UpsertOutcome::default());
        }
        debug!(count = batch.len(), "[db] upserting items");

        // Dropping the transaction on an early return rolls it back.
        let mut tx = self.repo.pool().begin().await?;
        let mut outcome = UpsertOutcome::default();
        for mut statement in upsert_statements(&batch) {
            let rows = statement.build().fetch_all(&mut *tx).await?;
            for row in rows {
                if row.try_get::<bool, _>("inserted")? {
                    outcome.inserted += 1;
                } else {
                    outcome.updated += 1;
                }
            }
        }
        tx.commit().await?;
        Ok(outcome)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    rows: BTreeMap<String, StoredItem>,
}

/// In-process store with the same conflict rules as [`PgItemStore`].
#[derive(Debug, Default)]
pub struct MemoryItemStore {
    state: Mutex<MemoryState>,
}

impl MemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, url: &str) -> Option<StoredItem> {
        self.state.lock().await.rows.get(url).cloned()
    }

    /// Rows ordered by url.
    pub async fn rows(&self) -> Vec<StoredItem> {
        self.state.lock().await.rows.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ItemStore for MemoryItemStore {
    async fn bulk_upsert(&self, items: &[Item]) -> Result<UpsertOutcome, PersistenceError> {
        let batch = prepare_batch(items)?;
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut outcome = UpsertOutcome::default();
        for item in batch {
            if let Some(existing) = state.rows.get_mut(&item.url) {
                existing.item.score = item.score;
                existing.update_time = now;
                outcome.updated += 1;
                continue;
            }
            state.next_id += 1;
            let stored = StoredItem {
                id: state.next_id,
                item: item.clone(),
                create_time: now,
                update_time: now,
            };
            state.rows.insert(item.url.clone(), stored);
            outcome.inserted += 1;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use chrono::TimeZone;

    fn item(url: &str, title: &str, score: Option<f64>) -> Item {
        let published = Utc.with_ymd_and_hms(2026, 10, 1, 3, 0, 0).unwrap();
        let mut item = Item::new(url, title, "1001", ItemType::Article, published);
        item.score = score;
        item
    }

    #[test]
    fn upsert_statement_only_refreshes_score_and_update_time() {
        let a = item("a", "A", Some(1.0));
        let b = item("b", "B", None);
        let qb = upsert_statement(&[&a, &b]);
        assert_eq!(
            qb.sql(),
            "INSERT INTO items \
             (url, title, identifier, category, item_type, published_time, score) \
             VALUES ($1, $2, $3, $4, $5, $6, $7), ($8, $9, $10, $11, $12, $13, $14) \
             ON CONFLICT (url) DO UPDATE SET score = EXCLUDED.score, update_time = NOW() \
             RETURNING (xmax = 0) AS inserted"
        );
    }

    #[test]
    fn large_batches_are_split_into_bounded_statements() {
        let items: Vec<Item> = (0..2 * MAX_ROWS_PER_STATEMENT + 1)
            .map(|n| item(&format!("https://tuoitre.vn/{n}.htm"), "T", None))
            .collect();
        let batch = prepare_batch(&items).unwrap();

        let statements: Vec<_> = upsert_statements(&batch).collect();

        assert_eq!(statements.len(), 3);
        let last_placeholder = format!("${})", 7 * MAX_ROWS_PER_STATEMENT);
        assert!(statements[0].sql().contains(&last_placeholder));
        assert!(!statements[0].sql().contains(&format!("${}", 7 * MAX_ROWS_PER_STATEMENT + 1)));
        assert!(statements[2].sql().contains("VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT"));
    }

    #[test]
    fn prepare_batch_rejects_blank_urls() {
        let items = vec![item("a", "A", None), item("  ", "blank", None)];
        let err = prepare_batch(&items).unwrap_err();
        assert!(matches!(err, PersistenceError::MissingUrl { index: 1 }));
    }

    #[test]
    fn prepare_batch_keeps_last_values_for_repeated_urls() {
        let items = vec![
            item("a", "A", Some(1.0)),
            item("b", "B", None),
            item("a", "A again", Some(7.0)),
        ];
        let batch = prepare_batch(&items).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].url, "a");
        assert_eq!(batch[0].score, Some(7.0));
        assert_eq!(batch[1].url, "b");
    }

    #[test]
    fn repository_select_uses_typed_columns() {
        let filter = Filter::new()
            .eq(ItemColumn::ItemType, ItemType::Video)
            .eq(ItemColumn::Category, "Thể thao");
        let qb = PgRepository::<StoredItem>::select(&filter);
        assert_eq!(
            qb.sql(),
            "SELECT id, url, title, identifier, category, item_type, published_time, score, \
             create_time, update_time FROM items WHERE item_type = $1 AND category = $2 \
             ORDER BY published_time DESC, id DESC"
        );
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let store = MemoryItemStore::new();
        let outcome = store.bulk_upsert(&[]).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::default());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn repeated_batch_keeps_one_row_per_url() {
        let store = MemoryItemStore::new();
        let batch = vec![item("a", "A", Some(1.0)), item("b", "B", None)];

        let first = store.bulk_upsert(&batch).await.unwrap();
        let before = store.rows().await;
        let second = store.bulk_upsert(&batch).await.unwrap();
        let after = store.rows().await;

        assert_eq!(first, UpsertOutcome { inserted: 2, updated: 0 });
        assert_eq!(second, UpsertOutcome { inserted: 0, updated: 2 });
        assert_eq!(after.len(), 2);
        for (b, a) in before.iter().zip(&after) {
            assert_eq!(b.id, a.id);
            assert_eq!(b.item, a.item);
            assert_eq!(b.create_time, a.create_time);
            assert!(a.update_time >= b.update_time);
        }
    }

    #[tokio::test]
    async fn conflict_updates_score_but_not_title() {
        let store = MemoryItemStore::new();
        store.bulk_upsert(&[item("a", "Original", Some(1.0))]).await.unwrap();
        store.bulk_upsert(&[item("a", "Renamed", Some(5.0))]).await.unwrap();

        let row = store.get("a").await.unwrap();
        assert_eq!(store.len().await, 1);
        assert_eq!(row.item.title, "Original");
        assert_eq!(row.item.score, Some(5.0));
    }

    #[tokio::test]
    async fn batches_beyond_one_statement_are_counted_in_full() {
        let store = MemoryItemStore::new();
        let items: Vec<Item> = (0..MAX_ROWS_PER_STATEMENT + 1)
            .map(|n| item(&format!("https://tuoitre.vn/{n}.htm"), "T", Some(n as f64)))
            .collect();

        let first = store.bulk_upsert(&items).await.unwrap();
        let second = store.bulk_upsert(&items).await.unwrap();

        assert_eq!(first, UpsertOutcome { inserted: MAX_ROWS_PER_STATEMENT + 1, updated: 0 });
        assert_eq!(second, UpsertOutcome { inserted: 0, updated: MAX_ROWS_PER_STATEMENT + 1 });
        assert_eq!(store.len().await, MAX_ROWS_PER_STATEMENT + 1);
    }
}
