//! Crawl orchestration: drives the article and video streams page by page,
//! persists each page, and decides when each stream stops.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nhv_adapters::{extractor_for_site, ListingExtractor, ListingPage};
use nhv_core::{Horizon, ItemType, NextAction, StopReason, StreamCursor, StreamCursors};
use nhv_storage::{
    FetchError, HttpClientConfig, HttpFetcher, ItemStore, MemoryItemStore, PgItemStore,
    TokenBucketConfig, UpsertOutcome,
};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod comments;
pub mod config;
pub mod hooks;

pub use comments::TuoiTreCommentCounts;
pub use config::CrawlConfig;
pub use hooks::{CommentCountEnrichment, CommentCountSource, EnrichmentHook, NoopEnrichmentHook};

/// Where listing pages come from.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(
        &self,
        run_id: Uuid,
        item_type: ItemType,
        url: &str,
    ) -> Result<String, FetchError>;
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn fetch_page(
        &self,
        run_id: Uuid,
        item_type: ItemType,
        url: &str,
    ) -> Result<String, FetchError> {
        Ok(self.fetch_text(run_id, item_type.as_str(), url).await?.body)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamSummary {
    pub item_type: ItemType,
    pub pages_fetched: usize,
    pub items_extracted: usize,
    pub entries_skipped: usize,
    pub extraction_failures: usize,
    pub inserted: usize,
    pub updated: usize,
    pub final_page_index: u32,
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub horizon: DateTime<Utc>,
    pub streams: Vec<StreamSummary>,
}

impl CrawlRunSummary {
    pub fn stream(&self, item_type: ItemType) -> Option<&StreamSummary> {
        self.streams.iter().find(|s| s.item_type == item_type)
    }

    pub fn persisted(&self) -> UpsertOutcome {
        let mut total = UpsertOutcome::default();
        for stream in &self.streams {
            total.absorb(UpsertOutcome {
                inserted: stream.inserted,
                updated: stream.updated,
            });
        }
        total
    }
}

pub struct CrawlPipeline {
    config: CrawlConfig,
    pages: Arc<dyn PageSource>,
    extractor: Box<dyn ListingExtractor>,
    store: Arc<dyn ItemStore>,
    enrichment: Box<dyn EnrichmentHook>,
}

impl CrawlPipeline {
    pub fn new(
        config: CrawlConfig,
        pages: Arc<dyn PageSource>,
        store: Arc<dyn ItemStore>,
    ) -> Result<Self> {
        let extractor = extractor_for_site(&config.site_id)
            .with_context(|| format!("no extractor registered for {}", config.site_id))?;
        Ok(Self {
            config,
            pages,
            extractor,
            store,
            enrichment: Box::<NoopEnrichmentHook>::default(),
        })
    }

    /// Pipeline fetching over HTTP with the configured client settings. Comment
    /// counts, when enabled, go through the same client and limits.
    pub fn over_http(config: CrawlConfig, store: Arc<dyn ItemStore>) -> Result<Self> {
        let http: Arc<dyn PageSource> = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            token_bucket: config.requests_per_second.and_then(TokenBucketConfig::per_second),
            ..Default::default()
        })?);
        let comment_counts = config.comment_counts_enabled.then(|| {
            TuoiTreCommentCounts::new(Arc::clone(&http), config.comment_count_url_template.clone())
        });

        let pipeline = Self::new(config, http, store)?;
        Ok(match comment_counts {
            Some(source) => pipeline.with_enrichment(Box::new(CommentCountEnrichment::new(source))),
            None => pipeline,
        })
    }

    pub fn with_enrichment(mut self, enrichment: Box<dyn EnrichmentHook>) -> Self {
        self.enrichment = enrichment;
        self
    }

    /// Crawl both streams back to `days_ago` days before now.
    pub async fn run_once(&self) -> Result<CrawlRunSummary> {
        let horizon = Horizon::days_ago(Utc::now(), self.config.days_ago);
        self.run_until(horizon).await
    }

    pub async fn run_until(&self, horizon: Horizon) -> Result<CrawlRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, horizon = %horizon.instant(), "starting crawl run");

        let StreamCursors { article, video } = StreamCursors::new(
            self.config.article_url_template.clone(),
            self.config.video_url_template.clone(),
        );
        let (article, video) = tokio::try_join!(
            self.run_stream(run_id, article, &horizon)
                .instrument(info_span!("crawl_stream", %run_id, stream = "article")),
            self.run_stream(run_id, video, &horizon)
                .instrument(info_span!("crawl_stream", %run_id, stream = "video"))
        )?;

        let summary = CrawlRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            horizon: horizon.instant(),
            streams: vec![article, video],
        };
        let persisted = summary.persisted();
        info!(
            %run_id,
            inserted = persisted.inserted,
            updated = persisted.updated,
            "crawl run complete"
        );
        Ok(summary)
    }

    /// Walk one stream until its decision says stop. Pages of a stream are
    /// fetched and decided strictly in order.
    async fn run_stream(
        &self,
        run_id: Uuid,
        mut cursor: StreamCursor,
        horizon: &Horizon,
    ) -> Result<StreamSummary> {
        let item_type = cursor.item_type();
        let mut summary = StreamSummary {
            item_type,
            pages_fetched: 0,
            items_extracted: 0,
            entries_skipped: 0,
            extraction_failures: 0,
            inserted: 0,
            updated: 0,
            final_page_index: cursor.page_index(),
            stop_reason: StopReason::EmptyPage,
        };
        let mut url = cursor.page_url();

        loop {
            let html = self
                .pages
                .fetch_page(run_id, item_type, &url)
                .await
                .with_context(|| format!("fetching {item_type} page {url}"))?;
            summary.pages_fetched += 1;

            let mut page = match self.extractor.parse_listing(item_type, &url, &html) {
                Ok(page) => page,
                Err(err) => {
                    warn!(
                        page = %url,
                        error = %err,
                        "listing page could not be extracted; treating it as empty"
                    );
                    summary.extraction_failures += 1;
                    ListingPage::empty(url.clone(), item_type)
                }
            };
            if !page.skipped.is_empty() {
                warn!(
                    page = %url,
                    skipped = page.skipped.len(),
                    "entries with unreadable publish times"
                );
            }
            summary.items_extracted += page.items.len();
            summary.entries_skipped += page.skipped.len();

            if !page.items.is_empty() {
                if let Err(err) = self.enrichment.apply(&mut page.items).await {
                    warn!(
                        page = %url,
                        error = ?err,
                        "enrichment failed; persisting items without it"
                    );
                }
                let outcome = self
                    .store
                    .bulk_upsert(&page.items)
                    .await
                    .with_context(|| format!("persisting {} items from {url}", page.items.len()))?;
                summary.inserted += outcome.inserted;
                summary.updated += outcome.updated;
            }

            if let Some(last) = page.last_item() {
                debug!(
                    published_time = last.published_timestamp(),
                    horizon = horizon.instant().timestamp(),
                    "comparing last item against horizon"
                );
            }
            match cursor.decide_next(page.last_item(), horizon) {
                NextAction::FetchNext(next) => url = next,
                NextAction::Stop(reason) => {
                    summary.final_page_index = cursor.page_index();
                    summary.stop_reason = reason;
                    info!(
                        page_index = cursor.page_index(),
                        ?reason,
                        "stopped going to next page"
                    );
                    return Ok(summary);
                }
            }
        }
    }

    /// Cron-driven repeated crawls; each trigger is an independent run.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.crawl_cron.clone();
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled crawl finished"),
                    Err(err) => error!(error = ?err, "scheduled crawl failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Build the item store for a run: Postgres (migrated) or, for dry runs, memory.
pub async fn store_for(config: &CrawlConfig, dry_run: bool) -> Result<Arc<dyn ItemStore>> {
    if dry_run {
        return Ok(Arc::new(MemoryItemStore::new()));
    }
    let pool = nhv_storage::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to postgres")?;
    nhv_storage::run_migrations(&pool)
        .await
        .context("applying migrations")?;
    Ok(Arc::new(PgItemStore::new(pool)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use nhv_core::Item;
    use nhv_storage::PersistenceError;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves canned HTML by url and records the request order per stream.
    #[derive(Default)]
    struct CannedPages {
        pages: HashMap<String, String>,
        requested: Mutex<Vec<(ItemType, String)>>,
    }

    impl CannedPages {
        fn with(mut self, url: &str, html: String) -> Self {
            self.pages.insert(url.to_string(), html);
            self
        }

        fn requested(&self, item_type: ItemType) -> Vec<String> {
            self.requested
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _)| *t == item_type)
                .map(|(_, u)| u.clone())
                .collect()
        }
    }

    #[async_trait]
    impl PageSource for CannedPages {
        async fn fetch_page(
            &self,
            _run_id: Uuid,
            item_type: ItemType,
            url: &str,
        ) -> Result<String, FetchError> {
            self.requested.lock().unwrap().push((item_type, url.to_string()));
            self.pages.get(url).cloned().ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
        }
    }

    struct FailingStore;

    #[async_trait]
    impl ItemStore for FailingStore {
        async fn bulk_upsert(&self, _items: &[Item]) -> Result<UpsertOutcome, PersistenceError> {
            Err(PersistenceError::Database(sqlx::Error::PoolTimedOut))
        }
    }

    const ARTICLE_1: &str = "https://tuoitre.vn/timeline/0/trang-1.htm";
    const ARTICLE_2: &str = "https://tuoitre.vn/timeline/0/trang-2.htm";
    const ARTICLE_3: &str = "https://tuoitre.vn/timeline/0/trang-3.htm";
    const VIDEO_1: &str = "https://tuoitre.vn/timeline/search.htm?pageindex=1";
    const VIDEO_2: &str = "https://tuoitre.vn/timeline/search.htm?pageindex=2";

    /// Horizon at 2026-10-10 00:00 local time (+07:00).
    fn horizon() -> Horizon {
        Horizon::at(Utc.with_ymd_and_hms(2026, 10, 9, 17, 0, 0).unwrap())
    }

    fn article_page(entries: &[(&str, &str)]) -> String {
        entries
            .iter()
            .map(|(id, local_time)| {
                format!(
                    r#"<div class="box-category-item">
                         <a class="box-category-link-title" href="/{id}.htm"
                            title="Bài {id}" data-id="{id}"></a>
                         <a class="box-category-category">Thời sự</a>
                         <span class="time-ago-last-news" title="{local_time}"></span>
                       </div>"#
                )
            })
            .collect()
    }

    fn video_page(entries: &[(&str, &str)]) -> String {
        entries
            .iter()
            .map(|(id, local_date)| {
                format!(
                    r#"<div class="box-category-item">
                         <a class="box-category-link-title" href="/video/{id}.htm"
                            title="Clip {id}" data-id="{id}"></a>
                         <span class="time">{local_date}</span>
                       </div>"#
                )
            })
            .collect()
    }

    fn config() -> CrawlConfig {
        CrawlConfig::from_lookup(|_| None).unwrap()
    }

    fn pipeline(pages: Arc<CannedPages>, store: Arc<dyn ItemStore>) -> CrawlPipeline {
        CrawlPipeline::new(config(), pages, store).unwrap()
    }

    #[tokio::test]
    async fn streams_walk_to_their_own_depth() {
        let pages = Arc::new(
            CannedPages::default()
                .with(
                    ARTICLE_1,
                    article_page(&[("a1", "2026-10-12T09:00:00"), ("a2", "2026-10-11T08:00:00")]),
                )
                .with(
                    ARTICLE_2,
                    article_page(&[("a3", "2026-10-10T12:00:00"), ("a4", "2026-10-10T00:00:10")]),
                )
                .with(
                    ARTICLE_3,
                    article_page(&[("a5", "2026-10-09T23:00:00"), ("a6", "2026-10-08T10:00:00")]),
                )
                .with(VIDEO_1, video_page(&[("v1", "11/10/2026"), ("v2", "05/10/2026")])),
        );
        let store = Arc::new(MemoryItemStore::new());

        let summary = pipeline(pages.clone(), store.clone())
            .run_until(horizon())
            .await
            .unwrap();

        assert_eq!(pages.requested(ItemType::Article), vec![ARTICLE_1, ARTICLE_2, ARTICLE_3]);
        assert_eq!(pages.requested(ItemType::Video), vec![VIDEO_1]);

        let articles = summary.stream(ItemType::Article).unwrap();
        assert_eq!(articles.pages_fetched, 3);
        assert_eq!(articles.final_page_index, 3);
        assert_eq!(articles.stop_reason, StopReason::ReachedHorizon);
        assert_eq!(articles.inserted, 6);

        let videos = summary.stream(ItemType::Video).unwrap();
        assert_eq!(videos.pages_fetched, 1);
        assert_eq!(videos.final_page_index, 1);
        assert_eq!(videos.inserted, 2);

        assert_eq!(store.len().await, 8);
        let v1 = store.get("https://tuoitre.vn/video/v1.htm").await.unwrap();
        assert_eq!(v1.item.item_type, ItemType::Video);
        assert_eq!(summary.horizon, horizon().instant());
    }

    #[tokio::test]
    async fn recrawl_updates_instead_of_duplicating() {
        let pages = Arc::new(
            CannedPages::default()
                .with(
                    ARTICLE_1,
                    article_page(&[("a1", "2026-10-12T09:00:00"), ("a2", "2026-10-01T08:00:00")]),
                )
                .with(VIDEO_1, video_page(&[("v1", "01/10/2026")])),
        );
        let store = Arc::new(MemoryItemStore::new());
        let pipeline = pipeline(pages, store.clone());

        let first = pipeline.run_until(horizon()).await.unwrap();
        let second = pipeline.run_until(horizon()).await.unwrap();

        assert_eq!(first.persisted(), UpsertOutcome { inserted: 3, updated: 0 });
        assert_eq!(second.persisted(), UpsertOutcome { inserted: 0, updated: 3 });
        assert_ne!(first.run_id, second.run_id);
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn malformed_page_ends_only_its_stream() {
        let broken = r#"<div class="box-category-item">
            <span class="time-ago-last-news" title="2026-10-12T09:00:00"></span>
        </div>"#;
        let pages = Arc::new(
            CannedPages::default()
                .with(ARTICLE_1, broken.to_string())
                .with(VIDEO_1, video_page(&[("v1", "12/10/2026")]))
                .with(VIDEO_2, String::new()),
        );
        let store = Arc::new(MemoryItemStore::new());

        let summary = pipeline(pages.clone(), store.clone())
            .run_until(horizon())
            .await
            .unwrap();

        let articles = summary.stream(ItemType::Article).unwrap();
        assert_eq!(articles.extraction_failures, 1);
        assert_eq!(articles.stop_reason, StopReason::EmptyPage);
        assert_eq!(articles.final_page_index, 1);

        let videos = summary.stream(ItemType::Video).unwrap();
        assert_eq!(pages.requested(ItemType::Video), vec![VIDEO_1, VIDEO_2]);
        assert_eq!(videos.stop_reason, StopReason::EmptyPage);
        assert_eq!(videos.final_page_index, 2);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn unreadable_last_time_falls_back_to_previous_entry() {
        let mut html =
            article_page(&[("a1", "2026-10-12T09:00:00"), ("a2", "2026-10-08T08:00:00")]);
        html.push_str(&article_page(&[("a3", "không rõ")]));
        let pages = Arc::new(
            CannedPages::default()
                .with(ARTICLE_1, html)
                .with(VIDEO_1, String::new()),
        );
        let store = Arc::new(MemoryItemStore::new());

        let summary = pipeline(pages.clone(), store).run_until(horizon()).await.unwrap();

        let articles = summary.stream(ItemType::Article).unwrap();
        assert_eq!(articles.entries_skipped, 1);
        assert_eq!(articles.stop_reason, StopReason::ReachedHorizon);
        assert_eq!(pages.requested(ItemType::Article), vec![ARTICLE_1]);
    }

    #[tokio::test]
    async fn enrichment_scores_reach_the_store() {
        struct FixedCounts;

        #[async_trait]
        impl CommentCountSource for FixedCounts {
            async fn comment_counts(
                &self,
                _item_type: ItemType,
                identifiers: &[String],
            ) -> Result<HashMap<String, u64>> {
                Ok(identifiers.iter().map(|id| (id.clone(), 4)).collect())
            }
        }

        let pages = Arc::new(
            CannedPages::default()
                .with(ARTICLE_1, article_page(&[("a1", "2026-10-01T09:00:00")]))
                .with(VIDEO_1, String::new()),
        );
        let store = Arc::new(MemoryItemStore::new());
        pipeline(pages, store.clone())
            .with_enrichment(Box::new(CommentCountEnrichment::new(FixedCounts)))
            .run_until(horizon())
            .await
            .unwrap();

        let a1 = store.get("https://tuoitre.vn/a1.htm").await.unwrap();
        assert_eq!(a1.item.score, Some(4.0));
    }

    #[tokio::test]
    async fn comment_counts_from_the_service_become_scores() {
        let counts_url = "http://counts.test/?ids=a1,a2";
        let pages = Arc::new(
            CannedPages::default()
                .with(
                    ARTICLE_1,
                    article_page(&[("a1", "2026-10-12T09:00:00"), ("a2", "2026-10-01T08:00:00")]),
                )
                .with(
                    counts_url,
                    r#"{"Data":[{"object_id":"a1","total_comment":9}],"Success":true}"#.to_string(),
                )
                .with(VIDEO_1, video_page(&[("v1", "01/10/2026")])),
        );
        let store = Arc::new(MemoryItemStore::new());
        let counts = TuoiTreCommentCounts::new(pages.clone(), "http://counts.test/?ids={ids}");

        let summary = pipeline(pages.clone(), store.clone())
            .with_enrichment(Box::new(CommentCountEnrichment::new(counts)))
            .run_until(horizon())
            .await
            .unwrap();

        assert_eq!(summary.persisted().inserted, 3);
        let a1 = store.get("https://tuoitre.vn/a1.htm").await.unwrap();
        assert_eq!(a1.item.score, Some(9.0));
        let a2 = store.get("https://tuoitre.vn/a2.htm").await.unwrap();
        assert_eq!(a2.item.score, None);
        // The video lookup has no canned answer; its items are still stored.
        let v1 = store.get("https://tuoitre.vn/video/v1.htm").await.unwrap();
        assert_eq!(v1.item.score, None);
        assert_eq!(
            pages.requested(ItemType::Article),
            vec![ARTICLE_1.to_string(), counts_url.to_string()]
        );
    }

    #[test]
    fn http_pipeline_accepts_comment_counts_and_rate_limit() {
        let config = CrawlConfig::from_lookup(|key| match key {
            "NHV_COMMENT_COUNTS" => Some("true".to_string()),
            "NHV_REQUESTS_PER_SECOND" => Some("2".to_string()),
            _ => None,
        })
        .unwrap();
        assert!(CrawlPipeline::over_http(config, Arc::new(MemoryItemStore::new())).is_ok());
    }

    #[tokio::test]
    async fn persistence_failure_aborts_the_run() {
        let pages = Arc::new(
            CannedPages::default()
                .with(ARTICLE_1, article_page(&[("a1", "2026-10-12T09:00:00")]))
                .with(VIDEO_1, String::new()),
        );
        let err = pipeline(pages, Arc::new(FailingStore))
            .run_until(horizon())
            .await
            .unwrap_err();
        assert!(err.chain().any(|e| e.downcast_ref::<PersistenceError>().is_some()));
    }

    #[tokio::test]
    async fn fetch_failure_aborts_the_run() {
        let pages = Arc::new(CannedPages::default().with(VIDEO_1, String::new()));
        let err = pipeline(pages, Arc::new(MemoryItemStore::new()))
            .run_until(horizon())
            .await
            .unwrap_err();
        assert!(err.to_string().contains(ARTICLE_1));
    }

    #[tokio::test]
    async fn scheduler_is_only_built_when_enabled() {
        let pages = Arc::new(CannedPages::default());
        let pipeline = Arc::new(pipeline(pages, Arc::new(MemoryItemStore::new())));
        assert!(pipeline.maybe_build_scheduler().await.unwrap().is_none());
    }
}
