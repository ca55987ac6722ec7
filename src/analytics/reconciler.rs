//! Cached counter refresh
//!
//! Overwrites the denormalized counters carried by catalog entities with
//! totals recomputed from the metrics store. Writes are quiet: they never
//! run the catalog's save side effects.

use chrono::NaiveDate;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::analytics::PointKey;
use crate::catalog::{Catalog, CatalogError};
use crate::models::{EntityType, MetricField, SaveOptions};
use crate::storage::{MetricsStore, StoreError};

/// Organization roll-up fields and the member type each one sums.
const ROLLUPS: [(MetricField, EntityType); 3] = [
    (MetricField::DatasetViews, EntityType::Dataset),
    (MetricField::ReuseViews, EntityType::Reuse),
    (MetricField::ResourceDownloads, EntityType::Resource),
];

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("metrics store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub updated: usize,
    /// Entities with stored points that no longer exist in the catalog
    pub missing: usize,
    pub rollups_updated: usize,
}

impl ReconcileReport {
    fn absorb(&mut self, other: ReconcileReport) {
        self.updated += other.updated;
        self.missing += other.missing;
        self.rollups_updated += other.rollups_updated;
    }
}

pub struct MetricsReconciler {
    store: Arc<dyn MetricsStore>,
    catalog: Arc<dyn Catalog>,
}

impl MetricsReconciler {
    pub fn new(store: Arc<dyn MetricsStore>, catalog: Arc<dyn Catalog>) -> Self {
        Self { store, catalog }
    }

    /// Refresh `views` on every tracked entity of `entity_type`.
    pub async fn reconcile(&self, entity_type: EntityType) -> Result<ReconcileReport, ReconcileError> {
        self.reconcile_since(entity_type, None).await
    }

    /// Like [`MetricsReconciler::reconcile`], limited to entities with points
    /// on or after `since` when given.
    pub async fn reconcile_since(
        &self,
        entity_type: EntityType,
        since: Option<NaiveDate>,
    ) -> Result<ReconcileReport, ReconcileError> {
        let totals = self.store.grouped_totals(entity_type, since).await?;
        let mut report = ReconcileReport::default();

        for total in totals {
            let views = total.counts.views();
            let found = self
                .catalog
                .set_current_metric(
                    entity_type,
                    &total.entity_id,
                    MetricField::Views,
                    views,
                    SaveOptions::QUIET,
                )
                .await?;

            if found {
                debug!("{} {} views = {}", entity_type, total.entity_id, views);
                report.updated += 1;
            } else {
                warn!(
                    "{} {} has metrics but no longer exists, skipping",
                    entity_type, total.entity_id
                );
                report.missing += 1;
            }
        }

        info!(
            "Reconciled {}: {} updated, {} missing",
            entity_type, report.updated, report.missing
        );
        Ok(report)
    }

    /// Refresh `views` on exactly the entities in `keys`.
    ///
    /// Entities without any stored point are reset to zero, which covers
    /// entities whose last points were cleared by a recount.
    pub async fn reconcile_entities<'a, I>(&self, keys: I) -> Result<ReconcileReport, ReconcileError>
    where
        I: IntoIterator<Item = &'a PointKey>,
    {
        let mut report = ReconcileReport::default();

        for (entity_type, entity_id) in keys {
            let views = self.store.sum_for_entity(*entity_type, entity_id).await?.views();
            let found = self
                .catalog
                .set_current_metric(
                    *entity_type,
                    entity_id,
                    MetricField::Views,
                    views,
                    SaveOptions::QUIET,
                )
                .await?;

            if found {
                debug!("{} {} views = {}", entity_type, entity_id, views);
                report.updated += 1;
            } else {
                warn!("{} {} no longer exists, skipping", entity_type, entity_id);
                report.missing += 1;
            }
        }

        Ok(report)
    }

    /// Organizations whose roll-ups include any of `keys`.
    pub async fn organizations_of<'a, I>(&self, keys: I) -> Result<BTreeSet<String>, ReconcileError>
    where
        I: IntoIterator<Item = &'a PointKey>,
    {
        let mut organizations = BTreeSet::new();
        for (entity_type, entity_id) in keys {
            if !ROLLUPS.iter().any(|(_, member_type)| member_type == entity_type) {
                continue;
            }
            let record = self.catalog.find_by_id(*entity_type, entity_id).await?;
            if let Some(org) = record.and_then(|record| record.organization) {
                organizations.insert(org);
            }
        }
        Ok(organizations)
    }

    /// Recompute the roll-up counters of each organization in `org_ids`.
    pub async fn refresh_rollups<I, S>(&self, org_ids: I) -> Result<ReconcileReport, ReconcileError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut report = ReconcileReport::default();

        for org_id in org_ids {
            let org_id = org_id.as_ref();
            for (field, member_type) in ROLLUPS {
                let members = self.catalog.organization_members(org_id, member_type).await?;
                let total = self.store.sum_for_entity_set(member_type, &members).await?;

                let found = self
                    .catalog
                    .set_current_metric(
                        EntityType::Organization,
                        org_id,
                        field,
                        total.views(),
                        SaveOptions::QUIET,
                    )
                    .await?;
                if !found {
                    warn!("Organization {} no longer exists, skipping roll-ups", org_id);
                    report.missing += 1;
                    break;
                }
                report.rollups_updated += 1;
            }
        }

        Ok(report)
    }

    /// Refresh every entity type, then every organization's roll-ups.
    pub async fn reconcile_all(&self) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::default();
        for entity_type in EntityType::ALL {
            report.absorb(self.reconcile(entity_type).await?);
        }

        let organizations = self.catalog.organization_ids().await?;
        report.absorb(self.refresh_rollups(&organizations).await?);
        Ok(report)
    }
}
