use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::time::Duration;
use thiserror::Error;

use crate::models::{Counts, DailyMetricPoint, EntityTotals, EntityType};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("metrics backend error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("metrics backend did not answer within {0:?}")]
    Timeout(Duration),
    #[error("corrupt metric row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Daily metric points keyed by `(entity_type, entity_id, day)`.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Initialize the storage (create tables and indexes)
    async fn init(&self) -> Result<()>;

    /// Add `point.counts` to the stored point for the same key, creating it
    /// when absent. Incoming tags replace stored ones unless empty, and
    /// `latest_url_alias` stays set once set.
    async fn upsert(&self, point: &DailyMetricPoint) -> StoreResult<()>;

    /// Remove every point of `day`. Returns the number of points removed.
    async fn clear_day(&self, day: NaiveDate) -> StoreResult<u64>;

    /// Keys of the entities holding a point on `day`.
    async fn entities_on_day(&self, day: NaiveDate) -> StoreResult<Vec<(EntityType, String)>>;

    async fn point(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        day: NaiveDate,
    ) -> StoreResult<Option<DailyMetricPoint>>;

    /// Points of one entity between `start` and `end`, both inclusive, oldest first.
    async fn range(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> StoreResult<Vec<DailyMetricPoint>>;

    /// Totals across all days.
    async fn sum_for_entity(&self, entity_type: EntityType, entity_id: &str) -> StoreResult<Counts>;

    /// Totals across all days and all `ids`.
    async fn sum_for_entity_set(&self, entity_type: EntityType, ids: &[String]) -> StoreResult<Counts>;

    /// Lifetime totals per entity of `entity_type`, restricted to entities
    /// having at least one point on or after `since` when given.
    async fn grouped_totals(
        &self,
        entity_type: EntityType,
        since: Option<NaiveDate>,
    ) -> StoreResult<Vec<EntityTotals>>;
}
