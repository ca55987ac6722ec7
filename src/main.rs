use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;

use tally::analytics::{DailyAggregator, MetricsReconciler};
use tally::catalog::{Catalog, PostgresCatalog, SqliteCatalog};
use tally::client::AnalyticsClient;
use tally::config::{Config, DatabaseBackend};
use tally::jobs::Jobs;
use tally::models::EntityType;
use tally::resolver::{PatternRouter, UrlResolver};
use tally::storage::{MetricsStore, PostgresMetricsStore, SqliteMetricsStore};

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Analytics ingestion and metrics reconciliation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Count today's metrics so far
    Current,
    /// Count yesterday's final metrics
    Yesterday,
    /// Recount a range of days, both ends inclusive
    Fill {
        /// First day (YYYY-MM-DD), defaults to the end day
        #[arg(long)]
        start: Option<NaiveDate>,
        /// Last day (YYYY-MM-DD), defaults to today
        #[arg(long)]
        end: Option<NaiveDate>,
    },
    /// Remove every stored point of a day
    Clear {
        day: NaiveDate,
    },
    /// Refresh cached counters from stored metrics
    Reconcile {
        /// Only this entity type (dataset, resource, community-resource, organization, user, reuse)
        entity: Option<EntityType>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    info!("Loaded configuration");

    let max_connections = config.database.max_connections;
    let store: Arc<dyn MetricsStore>;
    let catalog: Arc<dyn Catalog>;
    match config.database.backend {
        DatabaseBackend::Sqlite => {
            info!("Using SQLite metrics store: {}", config.database.url);
            let sqlite_catalog =
                SqliteCatalog::new(&config.database.catalog_url, max_connections).await?;
            sqlite_catalog.init().await?;
            store = Arc::new(SqliteMetricsStore::new(&config.database.url, max_connections).await?);
            catalog = Arc::new(sqlite_catalog);
        }
        DatabaseBackend::Postgres => {
            info!("Using PostgreSQL metrics store: {}", config.database.url);
            let pg_catalog =
                PostgresCatalog::new(&config.database.catalog_url, max_connections).await?;
            pg_catalog.init().await?;
            store =
                Arc::new(PostgresMetricsStore::new(&config.database.url, max_connections).await?);
            catalog = Arc::new(pg_catalog);
        }
    }

    store.init().await?;
    info!("Database initialized successfully");

    let router = PatternRouter::with_default_routes(&config.site.route_prefix)
        .context("invalid ROUTE_PREFIX")?;
    let resolver = Arc::new(UrlResolver::new(
        Arc::new(router),
        Arc::clone(&catalog),
        config.site.server_name.clone(),
        &config.resolver,
    ));
    let client = AnalyticsClient::from_config(&config.analytics)?;

    let aggregator = Arc::new(DailyAggregator::new(
        Arc::new(client),
        resolver,
        Arc::clone(&store),
        config.database.write_timeout(),
    ));
    let reconciler = Arc::new(MetricsReconciler::new(Arc::clone(&store), catalog));
    let jobs = Jobs::new(aggregator, reconciler);

    match cli.command {
        Commands::Current => {
            let report = jobs.current_metrics().await?;
            println!("✓ Counted {} row(s), wrote {} point(s)", report.rows, report.points_written);
        }
        Commands::Yesterday => {
            let report = jobs.yesterday_metrics().await?;
            println!("✓ Counted {} row(s), wrote {} point(s)", report.rows, report.points_written);
        }
        Commands::Fill { start, end } => {
            let reports = jobs.fill(start, end).await?;
            for report in reports {
                if let Some(day) = report.day {
                    println!(
                        "✓ {}: {} row(s), {} unresolved, {} point(s)",
                        day, report.rows, report.unresolved, report.points_written
                    );
                }
            }
        }
        Commands::Clear { day } => {
            let removed = jobs.clear(day).await?;
            println!("✓ Removed {} point(s) for {}", removed, day);
        }
        Commands::Reconcile { entity } => {
            let report = jobs.reconcile(entity).await?;
            println!(
                "✓ Updated {} entities and {} roll-ups ({} missing)",
                report.updated, report.rollups_updated, report.missing
            );
        }
    }

    Ok(())
}
