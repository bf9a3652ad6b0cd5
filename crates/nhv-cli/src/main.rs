use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nhv_core::ItemType;
use nhv_storage::{Filter, ItemColumn, PgItemStore};
use nhv_sync::{CrawlConfig, CrawlPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "nhv-cli")]
#[command(about = "News harvester command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl article and video listings back to the horizon and upsert them.
    Crawl {
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        days_ago: Option<u32>,
        /// Keep results in memory instead of writing to Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Run crawls on NHV_CRAWL_CRON until interrupted.
    Schedule,
    /// Print stored items, newest first.
    List {
        #[arg(long)]
        item_type: Option<ItemType>,
        #[arg(long)]
        category: Option<String>,
    },
    /// Print one stored item by url.
    Get { url: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = CrawlConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Crawl {
        days_ago: None,
        dry_run: false,
    }) {
        Commands::Crawl { days_ago, dry_run } => {
            let config = match days_ago {
                Some(days_ago) => config.with_days_ago(days_ago)?,
                None => config,
            };
            let store = nhv_sync::store_for(&config, dry_run).await?;
            let summary = CrawlPipeline::over_http(config, store)?.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Migrate => {
            let pool = nhv_storage::connect(&config.database_url, 1).await?;
            nhv_storage::run_migrations(&pool).await?;
            info!("migrations applied");
        }
        Commands::Schedule => {
            let store = nhv_sync::store_for(&config, false).await?;
            let pipeline = Arc::new(CrawlPipeline::over_http(config, store)?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set NHV_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::List { item_type, category } => {
            let store = connect_store(&config).await?;
            let mut filter = Filter::new();
            if let Some(item_type) = item_type {
                filter = filter.eq(ItemColumn::ItemType, item_type);
            }
            if let Some(category) = category {
                filter = filter.eq(ItemColumn::Category, category);
            }
            for row in store.repository().get_list(&filter).await? {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
        Commands::Get { url } => {
            let store = connect_store(&config).await?;
            match store.repository().get(url.as_str()).await? {
                Some(row) => println!("{}", serde_json::to_string_pretty(&row)?),
                None => bail!("no item stored for {url}"),
            }
        }
    }

    Ok(())
}

async fn connect_store(config: &CrawlConfig) -> Result<PgItemStore> {
    let pool = nhv_storage::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to postgres")?;
    Ok(PgItemStore::new(pool))
}
