//! Scheduled job entry points
//!
//! Each job clears the days it covers before counting them, so a scheduler
//! may re-run any of them safely.

use anyhow::{bail, Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use std::sync::Arc;
use tracing::info;

use crate::analytics::{AggregationReport, DailyAggregator, MetricsReconciler, ReconcileReport};
use crate::models::EntityType;

pub struct Jobs {
    aggregator: Arc<DailyAggregator>,
    reconciler: Arc<MetricsReconciler>,
}

impl Jobs {
    pub fn new(aggregator: Arc<DailyAggregator>, reconciler: Arc<MetricsReconciler>) -> Self {
        Self {
            aggregator,
            reconciler,
        }
    }

    /// Today so far.
    pub async fn current_metrics(&self) -> Result<AggregationReport> {
        self.run_day(today()).await
    }

    /// Final counts for yesterday.
    pub async fn yesterday_metrics(&self) -> Result<AggregationReport> {
        self.run_day(today() - Duration::days(1)).await
    }

    /// Recount `day`, then refresh the counters it touched.
    pub async fn run_day(&self, day: NaiveDate) -> Result<AggregationReport> {
        let report = self.recount(day).await?;
        self.refresh_since(day, &report).await?;
        Ok(report)
    }

    /// Recount every day from `start` to `end`, both inclusive.
    ///
    /// `end` defaults to today and `start` to `end`.
    pub async fn fill(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<AggregationReport>> {
        let end = end.unwrap_or_else(today);
        let start = start.unwrap_or(end);
        if start > end {
            bail!("fill range is empty: {} is after {}", start, end);
        }

        info!("Filling metrics from {} to {}", start, end);
        let mut reports = Vec::new();
        for day in start.iter_days().take_while(|day| *day <= end) {
            reports.push(self.recount(day).await?);
        }

        let mut merged = AggregationReport::default();
        for report in &reports {
            merged
                .dirty_organizations
                .extend(report.dirty_organizations.iter().cloned());
            merged.cleared.extend(report.cleared.iter().cloned());
        }
        self.refresh_since(start, &merged).await?;
        Ok(reports)
    }

    /// Clear `day` and aggregate it again.
    pub async fn recount(&self, day: NaiveDate) -> Result<AggregationReport> {
        self.aggregator
            .recount(day)
            .await
            .with_context(|| format!("metrics aggregation failed for {day}"))
    }

    /// Remove every point of `day` and refresh the counters that relied on them.
    pub async fn clear(&self, day: NaiveDate) -> Result<u64> {
        let store = self.aggregator.store();
        let cleared = AggregationReport {
            day: Some(day),
            cleared: store.entities_on_day(day).await?.into_iter().collect(),
            ..Default::default()
        };
        let removed = store
            .clear_day(day)
            .await
            .with_context(|| format!("failed to clear metrics for {day}"))?;

        self.refresh_cleared(&cleared).await?;
        Ok(removed)
    }

    /// Refresh cached counters of `entity_type`, or of everything.
    pub async fn reconcile(&self, entity_type: Option<EntityType>) -> Result<ReconcileReport> {
        let report = match entity_type {
            Some(entity_type) => self.reconciler.reconcile(entity_type).await?,
            None => self.reconciler.reconcile_all().await?,
        };
        Ok(report)
    }

    async fn refresh_since(&self, since: NaiveDate, report: &AggregationReport) -> Result<()> {
        for entity_type in EntityType::ALL {
            self.reconciler
                .reconcile_since(entity_type, Some(since))
                .await
                .with_context(|| format!("failed to reconcile {entity_type} views"))?;
        }
        self.refresh_cleared(report).await
    }

    /// Entities cleared by a recount may have no point left, so the
    /// grouped totals no longer list them.
    async fn refresh_cleared(&self, report: &AggregationReport) -> Result<()> {
        self.reconciler
            .reconcile_entities(&report.cleared)
            .await
            .context("failed to reconcile cleared entities")?;

        let mut organizations = report.dirty_organizations.clone();
        organizations.extend(self.reconciler.organizations_of(&report.cleared).await?);
        self.reconciler
            .refresh_rollups(&organizations)
            .await
            .context("failed to refresh organization roll-ups")?;
        Ok(())
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}
