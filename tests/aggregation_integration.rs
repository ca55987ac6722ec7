//! Integration tests for daily aggregation and the scheduled jobs
//!
//! Reports come from an in-process fixture source, entities from the
//! in-memory catalog and points land in an in-memory SQLite store.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tally::analytics::{AggregateError, DailyAggregator, MetricsReconciler};
use tally::catalog::{Catalog, MemoryCatalog};
use tally::client::{ClientError, ClientResult, Report, ReportSource};
use tally::config::ResolverConfig;
use tally::jobs::Jobs;
use tally::models::{
    AuthorKind, CommunityResource, Counts, Dataset, EntityType, MetricField, RawReportRow, Resource,
};
use tally::resolver::{hash_url, PatternRouter, UrlResolver};
use tally::storage::{MetricsStore, SqliteMetricsStore};

const SERVER: &str = "data.test";
const SHARED_URL: &str = "http://files.test/shared.csv";
const R1: &str = "0f2c8a4e-1b3d-4e5f-8a9b-0c1d2e3f4a5b";
const R2: &str = "7a6b5c4d-3e2f-4a1b-9c8d-7e6f5a4b3c2d";
const R3: &str = "11111111-2222-4333-8444-555555555555";
const R4: &str = "99999999-8888-4777-8666-555555555555";
const CR1: &str = "aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee";

/// Report source answering from fixed row trees.
#[derive(Default)]
struct FixtureSource {
    reports: HashMap<Report, Vec<RawReportRow>>,
    failing: Option<Report>,
}

impl FixtureSource {
    fn with(mut self, report: Report, rows: Vec<RawReportRow>) -> Self {
        self.reports.insert(report, rows);
        self
    }

    fn failing(mut self, report: Report) -> Self {
        self.failing = Some(report);
        self
    }
}

#[async_trait]
impl ReportSource for FixtureSource {
    async fn fetch_report(&self, report: Report, _day: NaiveDate) -> ClientResult<Vec<RawReportRow>> {
        if self.failing == Some(report) {
            return Err(ClientError::Rejected("invalid token_auth".into()));
        }
        Ok(self.reports.get(&report).cloned().unwrap_or_default())
    }
}

fn permalink(id: &str) -> String {
    format!("http://{SERVER}/datasets/r/{id}")
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
}

fn create_catalog() -> Arc<MemoryCatalog> {
    let catalog = MemoryCatalog::new();
    catalog.insert_organization("org-1", "acme");
    catalog.insert_user("u-1", "jane");
    catalog.insert_reuse("re-1", "viz", Some("org-1"), None);
    catalog.insert_dataset(Dataset {
        id: "d1".into(),
        slug: "budget".into(),
        organization: Some("org-1".into()),
        owner: Some("u-1".into()),
        resources: vec![Resource::with_url(R1, SHARED_URL)],
    });
    catalog.insert_dataset(Dataset {
        id: "d2".into(),
        slug: "census".into(),
        organization: None,
        owner: Some("u-1".into()),
        resources: vec![
            Resource::with_url(R2, SHARED_URL),
            Resource::with_url(R3, "http://files.test/census.csv"),
        ],
    });
    // Its only resource points at R1's permalink.
    catalog.insert_dataset(Dataset {
        id: "d3".into(),
        slug: "mirror".into(),
        organization: None,
        owner: Some("u-1".into()),
        resources: vec![Resource::with_url(R4, permalink(R1))],
    });
    catalog.insert_community_resource(CommunityResource {
        id: CR1.into(),
        dataset: Some("d2".into()),
        organization: None,
        owner: Some("u-1".into()),
        url: "http://files.test/extra.csv".into(),
        urlhash: hash_url("http://files.test/extra.csv"),
    });
    Arc::new(catalog)
}

async fn create_store() -> Arc<dyn MetricsStore> {
    let store = SqliteMetricsStore::new("sqlite::memory:", 1).await.unwrap();
    store.init().await.unwrap();
    Arc::new(store)
}

fn create_aggregator(
    source: FixtureSource,
    catalog: Arc<MemoryCatalog>,
    store: Arc<dyn MetricsStore>,
) -> DailyAggregator {
    let router = PatternRouter::with_default_routes("").unwrap();
    let catalog: Arc<dyn Catalog> = catalog;
    let resolver = UrlResolver::new(Arc::new(router), catalog, SERVER, &ResolverConfig::default());
    DailyAggregator::new(Arc::new(source), Arc::new(resolver), store, Duration::from_secs(5))
}

async fn counts(store: &Arc<dyn MetricsStore>, entity_type: EntityType, id: &str) -> Counts {
    store.sum_for_entity(entity_type, id).await.unwrap()
}

#[tokio::test]
async fn test_aggregating_twice_doubles_counts() {
    let store = create_store().await;
    let source = FixtureSource::default()
        .with(
            Report::PageUrls,
            vec![RawReportRow::leaf("http://data.test/datasets/budget/", 3, 2, 1)],
        )
        .with(
            Report::Downloads,
            vec![RawReportRow::leaf("http://files.test/census.csv", 4, 3, 2)],
        );
    let aggregator = create_aggregator(source, create_catalog(), Arc::clone(&store));

    aggregator.aggregate(day(1)).await.unwrap();
    assert_eq!(counts(&store, EntityType::Dataset, "d1").await, Counts::new(3, 2, 1));

    aggregator.aggregate(day(1)).await.unwrap();
    assert_eq!(counts(&store, EntityType::Dataset, "d1").await, Counts::new(6, 4, 2));
    assert_eq!(counts(&store, EntityType::Resource, R3).await, Counts::new(8, 6, 4));

    // Recount re-derives the day exactly.
    aggregator.recount(day(1)).await.unwrap();
    assert_eq!(counts(&store, EntityType::Dataset, "d1").await, Counts::new(3, 2, 1));
}

#[tokio::test]
async fn test_shared_url_fans_out_to_every_resource() {
    let store = create_store().await;
    let source = FixtureSource::default()
        .with(Report::Downloads, vec![RawReportRow::leaf(SHARED_URL, 5, 4, 3)]);
    let aggregator = create_aggregator(source, create_catalog(), Arc::clone(&store));

    let report = aggregator.aggregate(day(2)).await.unwrap();
    assert_eq!(report.resolved, 1);
    assert_eq!(report.points_written, 2);

    assert_eq!(counts(&store, EntityType::Resource, R1).await, Counts::new(5, 4, 3));
    assert_eq!(counts(&store, EntityType::Resource, R2).await, Counts::new(5, 4, 3));

    let r1 = store.point(EntityType::Resource, R1, day(2)).await.unwrap().unwrap();
    assert_eq!(r1.tags.author_type, Some(AuthorKind::Organization));
    assert_eq!(r1.tags.author_id.as_deref(), Some("org-1"));
    assert_eq!(r1.tags.dataset_id.as_deref(), Some("d1"));
    assert!(!r1.latest_url_alias);

    let r2 = store.point(EntityType::Resource, R2, day(2)).await.unwrap().unwrap();
    assert_eq!(r2.tags.author_type, Some(AuthorKind::User));
    assert_eq!(r2.tags.author_id.as_deref(), Some("u-1"));

    assert!(report.dirty_organizations.contains("org-1"));
}

#[tokio::test]
async fn test_permalink_takes_precedence_over_hash() {
    let store = create_store().await;
    let source = FixtureSource::default()
        .with(Report::Downloads, vec![RawReportRow::leaf(permalink(R1), 2, 2, 2)]);
    let aggregator = create_aggregator(source, create_catalog(), Arc::clone(&store));

    aggregator.aggregate(day(3)).await.unwrap();

    let r1 = store.point(EntityType::Resource, R1, day(3)).await.unwrap().unwrap();
    assert_eq!(r1.counts, Counts::new(2, 2, 2));
    assert!(r1.latest_url_alias);
    assert_eq!(counts(&store, EntityType::Resource, R4).await, Counts::default());
}

#[tokio::test]
async fn test_datasets_sharing_a_url_can_diverge() {
    let store = create_store().await;
    let source = FixtureSource::default().with(
        Report::Downloads,
        vec![
            RawReportRow::leaf(SHARED_URL, 1, 1, 1),
            RawReportRow::leaf(permalink(R2), 1, 1, 1),
        ],
    );
    let aggregator = create_aggregator(source, create_catalog(), Arc::clone(&store));

    aggregator.aggregate(day(4)).await.unwrap();

    assert_eq!(counts(&store, EntityType::Resource, R1).await.nb_hits, 1);
    assert_eq!(counts(&store, EntityType::Resource, R2).await.nb_hits, 2);

    let r2 = store.point(EntityType::Resource, R2, day(4)).await.unwrap().unwrap();
    assert!(r2.latest_url_alias);
}

#[tokio::test]
async fn test_nested_rows_are_all_visited() {
    let store = create_store().await;
    let views = vec![RawReportRow::group(
        "data.test",
        vec![
            RawReportRow::group(
                "datasets",
                vec![
                    RawReportRow::leaf("http://data.test/datasets/budget/", 1, 1, 1),
                    RawReportRow::group(
                        "census",
                        vec![RawReportRow::leaf("http://data.test/datasets/census/", 2, 2, 2)],
                    ),
                ],
            ),
            RawReportRow::leaf("http://data.test/reuses/viz/", 3, 3, 3),
        ],
    )];
    let outlinks = vec![RawReportRow::group(
        "files.test",
        vec![RawReportRow::leaf("http://files.test/extra.csv", 4, 4, 4)],
    )];
    let source = FixtureSource::default()
        .with(Report::PageUrls, views)
        .with(Report::Outlinks, outlinks);
    let aggregator = create_aggregator(source, create_catalog(), Arc::clone(&store));

    let report = aggregator.aggregate(day(5)).await.unwrap();
    assert_eq!(report.rows, 4);
    assert_eq!(report.resolved, 4);

    assert_eq!(counts(&store, EntityType::Dataset, "d1").await, Counts::new(1, 1, 1));
    assert_eq!(counts(&store, EntityType::Dataset, "d2").await, Counts::new(2, 2, 2));
    assert_eq!(counts(&store, EntityType::Reuse, "re-1").await, Counts::new(3, 3, 3));
    assert_eq!(
        counts(&store, EntityType::CommunityResource, CR1).await,
        Counts::new(4, 4, 4)
    );

    let organizations: Vec<&str> = report.dirty_organizations.iter().map(String::as_str).collect();
    assert_eq!(organizations, vec!["org-1"]);
}

#[tokio::test]
async fn test_unresolvable_rows_are_skipped() {
    let store = create_store().await;
    let source = FixtureSource::default()
        .with(
            Report::PageUrls,
            vec![
                RawReportRow::leaf("http://elsewhere.test/datasets/budget/", 9, 9, 9),
                RawReportRow::leaf("http://data.test/nowhere/", 9, 9, 9),
                RawReportRow::leaf("http://data.test/datasets/unknown-slug/", 9, 9, 9),
                RawReportRow::leaf("http://data.test/datasets/budget/", 1, 1, 1),
            ],
        )
        .with(
            Report::Downloads,
            vec![RawReportRow::leaf("http://files.test/unknown.csv", 9, 9, 9)],
        );
    let aggregator = create_aggregator(source, create_catalog(), Arc::clone(&store));

    let report = aggregator.aggregate(day(6)).await.unwrap();
    assert_eq!(report.rows, 5);
    assert_eq!(report.resolved, 1);
    assert_eq!(report.unresolved, 4);
    assert_eq!(report.failed, 0);
    assert_eq!(report.points_written, 1);

    assert_eq!(counts(&store, EntityType::Dataset, "d1").await, Counts::new(1, 1, 1));
}

#[tokio::test]
async fn test_views_follow_one_redirect_and_relative_urls() {
    let store = create_store().await;
    let source = FixtureSource::default().with(
        Report::PageUrls,
        vec![
            // Missing trailing slash redirects to the canonical route
            RawReportRow::leaf("http://data.test/datasets/budget", 1, 1, 1),
            RawReportRow::leaf("/users/jane/", 2, 2, 1),
            RawReportRow::leaf("http://data.test/organizations/acme/", 3, 2, 2),
        ],
    );
    let aggregator = create_aggregator(source, create_catalog(), Arc::clone(&store));

    let report = aggregator.aggregate(day(7)).await.unwrap();
    assert_eq!(report.unresolved, 0);

    assert_eq!(counts(&store, EntityType::Dataset, "d1").await, Counts::new(1, 1, 1));
    assert_eq!(counts(&store, EntityType::User, "u-1").await, Counts::new(2, 2, 1));
    assert_eq!(
        counts(&store, EntityType::Organization, "org-1").await,
        Counts::new(3, 2, 2)
    );
}

#[tokio::test]
async fn test_fetch_failure_aborts_before_writing() {
    let store = create_store().await;
    let source = FixtureSource::default()
        .with(
            Report::PageUrls,
            vec![RawReportRow::leaf("http://data.test/datasets/budget/", 1, 1, 1)],
        )
        .failing(Report::Downloads);
    let aggregator = create_aggregator(source, create_catalog(), Arc::clone(&store));

    let err = aggregator.aggregate(day(8)).await.unwrap_err();
    assert!(matches!(
        err,
        AggregateError::Fetch {
            report: Report::Downloads,
            source: ClientError::Rejected(_),
        }
    ));
    assert!(store
        .point(EntityType::Dataset, "d1", day(8))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_failed_recount_keeps_stored_day() {
    let catalog = create_catalog();
    let store = create_store().await;
    let source = FixtureSource::default().with(
        Report::PageUrls,
        vec![RawReportRow::leaf("http://data.test/datasets/budget/", 3, 2, 1)],
    );
    create_aggregator(source, Arc::clone(&catalog), Arc::clone(&store))
        .aggregate(day(20))
        .await
        .unwrap();

    let broken = FixtureSource::default().failing(Report::PageUrls);
    let err = create_aggregator(broken, catalog, Arc::clone(&store))
        .recount(day(20))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AggregateError::Fetch {
            report: Report::PageUrls,
            ..
        }
    ));
    assert_eq!(counts(&store, EntityType::Dataset, "d1").await, Counts::new(3, 2, 1));
}

fn create_jobs(catalog: Arc<MemoryCatalog>, store: Arc<dyn MetricsStore>) -> Jobs {
    let source = FixtureSource::default()
        .with(
            Report::PageUrls,
            vec![
                RawReportRow::leaf("http://data.test/datasets/budget/", 5, 3, 2),
                RawReportRow::leaf("http://data.test/reuses/viz/", 2, 1, 1),
            ],
        )
        .with(Report::Downloads, vec![RawReportRow::leaf(SHARED_URL, 4, 2, 2)]);
    create_jobs_with(source, catalog, store)
}

fn create_jobs_with(
    source: FixtureSource,
    catalog: Arc<MemoryCatalog>,
    store: Arc<dyn MetricsStore>,
) -> Jobs {
    let aggregator = create_aggregator(source, Arc::clone(&catalog), Arc::clone(&store));
    let catalog: Arc<dyn Catalog> = catalog;
    let reconciler = MetricsReconciler::new(store, catalog);
    Jobs::new(Arc::new(aggregator), Arc::new(reconciler))
}

#[tokio::test]
async fn test_run_day_is_repeatable() {
    let catalog = create_catalog();
    let store = create_store().await;
    let jobs = create_jobs(Arc::clone(&catalog), Arc::clone(&store));

    jobs.run_day(day(10)).await.unwrap();
    jobs.run_day(day(10)).await.unwrap();

    assert_eq!(
        catalog.current_metric(EntityType::Dataset, "d1", MetricField::Views),
        Some(3)
    );
    assert_eq!(
        catalog.current_metric(EntityType::Resource, R2, MetricField::Views),
        Some(2)
    );
    assert_eq!(
        catalog.current_metric(EntityType::Organization, "org-1", MetricField::DatasetViews),
        Some(3)
    );
    assert_eq!(
        catalog.current_metric(EntityType::Organization, "org-1", MetricField::ReuseViews),
        Some(1)
    );
    assert_eq!(
        catalog.current_metric(EntityType::Organization, "org-1", MetricField::ResourceDownloads),
        Some(2)
    );
    assert_eq!(catalog.side_effect_count(EntityType::Dataset, "d1"), 0);
}

#[tokio::test]
async fn test_fill_counts_every_day_in_range() {
    let catalog = create_catalog();
    let store = create_store().await;
    let jobs = create_jobs(Arc::clone(&catalog), Arc::clone(&store));

    let reports = jobs.fill(Some(day(11)), Some(day(13))).await.unwrap();
    let days: Vec<NaiveDate> = reports.iter().filter_map(|r| r.day).collect();
    assert_eq!(days, vec![day(11), day(12), day(13)]);

    assert_eq!(
        catalog.current_metric(EntityType::Dataset, "d1", MetricField::Views),
        Some(9)
    );
    assert_eq!(
        catalog.current_metric(EntityType::Organization, "org-1", MetricField::ResourceDownloads),
        Some(6)
    );

    assert!(jobs.fill(Some(day(14)), Some(day(13))).await.is_err());
}

#[tokio::test]
async fn test_run_day_resets_entities_it_no_longer_counts() {
    let catalog = create_catalog();
    let store = create_store().await;
    create_jobs(Arc::clone(&catalog), Arc::clone(&store))
        .run_day(day(21))
        .await
        .unwrap();
    assert_eq!(
        catalog.current_metric(EntityType::Dataset, "d1", MetricField::Views),
        Some(3)
    );

    // The same day, recounted from a report that no longer lists anything.
    let jobs = create_jobs_with(FixtureSource::default(), Arc::clone(&catalog), Arc::clone(&store));
    let report = jobs.run_day(day(21)).await.unwrap();
    assert!(report
        .cleared
        .contains(&(EntityType::Dataset, "d1".to_string())));
    assert_eq!(report.points_written, 0);

    assert_eq!(counts(&store, EntityType::Dataset, "d1").await, Counts::default());
    let metric = |entity_type, id: &str, field| catalog.current_metric(entity_type, id, field);
    assert_eq!(metric(EntityType::Dataset, "d1", MetricField::Views), Some(0));
    assert_eq!(metric(EntityType::Reuse, "re-1", MetricField::Views), Some(0));
    assert_eq!(metric(EntityType::Resource, R2, MetricField::Views), Some(0));
    assert_eq!(
        metric(EntityType::Organization, "org-1", MetricField::DatasetViews),
        Some(0)
    );
    assert_eq!(
        metric(EntityType::Organization, "org-1", MetricField::ResourceDownloads),
        Some(0)
    );

    jobs.reconcile(None).await.unwrap();
    assert_eq!(metric(EntityType::Dataset, "d1", MetricField::Views), Some(0));
}

#[tokio::test]
async fn test_clear_resets_cached_counters() {
    let catalog = create_catalog();
    let store = create_store().await;
    let jobs = create_jobs(Arc::clone(&catalog), Arc::clone(&store));

    jobs.run_day(day(22)).await.unwrap();
    assert_eq!(
        catalog.current_metric(EntityType::Organization, "org-1", MetricField::ReuseViews),
        Some(1)
    );

    // d1, re-1 and both resources behind the shared URL
    assert_eq!(jobs.clear(day(22)).await.unwrap(), 4);

    assert_eq!(
        catalog.current_metric(EntityType::Reuse, "re-1", MetricField::Views),
        Some(0)
    );
    assert_eq!(
        catalog.current_metric(EntityType::Organization, "org-1", MetricField::ReuseViews),
        Some(0)
    );
    assert_eq!(catalog.side_effect_count(EntityType::Reuse, "re-1"), 0);
}
