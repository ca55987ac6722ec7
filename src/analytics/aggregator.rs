//! Daily report ingestion
//!
//! Pulls one day of page-view, download and outlink reports, resolves every
//! row to the entities it designates and merges the counts into the metrics
//! store. Same-key contributions are batched locally so each
//! `(entity_type, entity_id, day)` key gets a single additive upsert per run.

use chrono::NaiveDate;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::client::{ClientError, Report, ReportSource};
use crate::models::{AuthorKind, Counts, DailyMetricPoint, EntityType, RawReportRow, Tags};
use crate::resolver::{ResolvedTarget, RowKind, TargetMatch, UrlResolver};
use crate::storage::{MetricsStore, StoreError};

/// Entity types a page view may be credited to.
const VIEW_TARGETS: [EntityType; 4] = [
    EntityType::Dataset,
    EntityType::Reuse,
    EntityType::Organization,
    EntityType::User,
];

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("failed to fetch {report:?} report: {source}")]
    Fetch {
        report: Report,
        #[source]
        source: ClientError,
    },
    #[error("failed to write metrics: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of one aggregation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationReport {
    pub day: Option<NaiveDate>,
    /// Rows carrying a URL across all reports
    pub rows: usize,
    pub resolved: usize,
    pub unresolved: usize,
    /// Rows skipped because an entity lookup failed
    pub failed: usize,
    pub points_written: usize,
    /// Organizations whose roll-ups are stale after this run
    pub dirty_organizations: BTreeSet<String>,
    /// Entities that held points for the day before a recount cleared it
    pub cleared: BTreeSet<PointKey>,
}

pub type PointKey = (EntityType, String);

pub struct DailyAggregator {
    source: Arc<dyn ReportSource>,
    resolver: Arc<UrlResolver>,
    store: Arc<dyn MetricsStore>,
    write_timeout: Duration,
}

impl DailyAggregator {
    pub fn new(
        source: Arc<dyn ReportSource>,
        resolver: Arc<UrlResolver>,
        store: Arc<dyn MetricsStore>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            source,
            resolver,
            store,
            write_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn MetricsStore> {
        &self.store
    }

    /// Ingest `day` on top of whatever is already stored for it.
    ///
    /// Running twice for the same day doubles its counts; use
    /// [`DailyAggregator::recount`] to re-derive a day exactly.
    pub async fn aggregate(&self, day: NaiveDate) -> Result<AggregationReport, AggregateError> {
        info!("Aggregating analytics for {}", day);

        let (mut report, points) = self.tally(day).await?;
        self.flush(points, &mut report).await?;
        log_report(&report, day);
        Ok(report)
    }

    /// Replace whatever is stored for `day` with a fresh count.
    ///
    /// The stored day is only cleared once every report has been fetched,
    /// so a failed fetch leaves it untouched.
    pub async fn recount(&self, day: NaiveDate) -> Result<AggregationReport, AggregateError> {
        info!("Recounting analytics for {}", day);

        let (mut report, points) = self.tally(day).await?;

        report.cleared = self.store.entities_on_day(day).await?.into_iter().collect();
        let removed = self.store.clear_day(day).await?;
        debug!("Cleared {} point(s) for {}", removed, day);

        self.flush(points, &mut report).await?;
        log_report(&report, day);
        Ok(report)
    }

    /// Fetch every report of `day` and batch the resolved rows, without
    /// touching the store.
    async fn tally(
        &self,
        day: NaiveDate,
    ) -> Result<(AggregationReport, Vec<DailyMetricPoint>), AggregateError> {
        let views = self.fetch(Report::PageUrls, day).await?;
        let downloads = self.fetch(Report::Downloads, day).await?;
        let outlinks = self.fetch(Report::Outlinks, day).await?;

        let mut report = AggregationReport {
            day: Some(day),
            ..Default::default()
        };
        let mut pending: HashMap<PointKey, DailyMetricPoint> = HashMap::new();

        for row in RawReportRow::flatten(&views) {
            self.handle_row(row, RowKind::View, day, &mut pending, &mut report)
                .await;
        }
        for row in RawReportRow::flatten(&downloads)
            .into_iter()
            .chain(RawReportRow::flatten(&outlinks))
        {
            self.handle_row(row, RowKind::Download, day, &mut pending, &mut report)
                .await;
        }

        Ok((report, pending.into_values().collect()))
    }

    async fn flush(
        &self,
        points: Vec<DailyMetricPoint>,
        report: &mut AggregationReport,
    ) -> Result<(), StoreError> {
        for point in points {
            self.write(&point).await?;
            report.points_written += 1;
        }
        Ok(())
    }

    async fn fetch(&self, report: Report, day: NaiveDate) -> Result<Vec<RawReportRow>, AggregateError> {
        let rows = self
            .source
            .fetch_report(report, day)
            .await
            .map_err(|source| AggregateError::Fetch { report, source })?;
        info!("Fetched {} top-level row(s) from {}", rows.len(), report.method());
        Ok(rows)
    }

    async fn handle_row(
        &self,
        row: &RawReportRow,
        kind: RowKind,
        day: NaiveDate,
        pending: &mut HashMap<PointKey, DailyMetricPoint>,
        report: &mut AggregationReport,
    ) {
        let Some(url) = row.url.as_deref() else {
            return;
        };
        report.rows += 1;

        let resolved = match self.resolver.resolve(url, kind).await {
            Ok(resolved) => resolved,
            Err(e) => {
                error!("Skipping {:?} row {}: {}", kind, url, e);
                report.failed += 1;
                return;
            }
        };

        let targets: Vec<&TargetMatch> = match (kind, &resolved) {
            (RowKind::View, ResolvedTarget::Entity(found))
                if VIEW_TARGETS.contains(&found.target.entity_type) =>
            {
                vec![found]
            }
            (RowKind::View, _) => Vec::new(),
            (RowKind::Download, resolved) => resolved
                .matches()
                .iter()
                .filter(|m| {
                    matches!(
                        m.target.entity_type,
                        EntityType::Resource | EntityType::CommunityResource
                    )
                })
                .collect(),
        };

        if targets.is_empty() {
            debug!("Unresolved {:?} row: {}", kind, url);
            report.unresolved += 1;
            return;
        }
        report.resolved += 1;

        let counts = row.counts();
        for found in targets {
            merge(pending, day, found, counts);
            if let Some(org) = dirty_organization(found) {
                report.dirty_organizations.insert(org);
            }
        }
    }

    async fn write(&self, point: &DailyMetricPoint) -> Result<(), StoreError> {
        tokio::time::timeout(self.write_timeout, self.store.upsert(point))
            .await
            .map_err(|_| StoreError::Timeout(self.write_timeout))?
    }
}

fn log_report(report: &AggregationReport, day: NaiveDate) {
    info!(
        "Aggregated {}: {} rows, {} resolved, {} unresolved, {} failed, {} points written",
        day,
        report.rows,
        report.resolved,
        report.unresolved,
        report.failed,
        report.points_written
    );
}

fn merge(
    pending: &mut HashMap<PointKey, DailyMetricPoint>,
    day: NaiveDate,
    found: &TargetMatch,
    counts: Counts,
) {
    let target = &found.target;
    let dataset_id = match target.entity_type {
        EntityType::Resource | EntityType::CommunityResource => target.parent_id.as_deref(),
        _ => None,
    };

    let point = pending
        .entry((target.entity_type, target.id.clone()))
        .or_insert_with(|| {
            DailyMetricPoint::new(target.entity_type, target.id.clone(), day, Counts::default())
                .with_tags(Tags::new(found.author.as_ref(), dataset_id))
        });
    point.counts += counts;
    point.latest_url_alias |= found.latest_url_alias;
}

/// Organization whose roll-up a contribution to `found` changes.
fn dirty_organization(found: &TargetMatch) -> Option<String> {
    match found.target.entity_type {
        EntityType::Dataset | EntityType::Reuse => found.target.parent_id.clone(),
        EntityType::Resource => found
            .author
            .as_ref()
            .filter(|author| author.kind == AuthorKind::Organization)
            .map(|author| author.id.clone()),
        _ => None,
    }
}
