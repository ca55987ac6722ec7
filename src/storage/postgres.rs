use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;

use super::{to_counts, to_db_count, to_entity_keys, to_totals, PointRow, POINT_COLUMNS};
use crate::models::{day_key, Counts, DailyMetricPoint, EntityTotals, EntityType};
use crate::storage::{MetricsStore, StoreResult};

pub struct PostgresMetricsStore {
    pool: Arc<PgPool>,
}

impl PostgresMetricsStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

#[async_trait]
impl MetricsStore for PostgresMetricsStore {
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metric_points (
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                day TEXT NOT NULL,
                nb_hits BIGINT NOT NULL DEFAULT 0,
                nb_visits BIGINT NOT NULL DEFAULT 0,
                nb_uniq_visitors BIGINT NOT NULL DEFAULT 0,
                author_type TEXT,
                author_id TEXT,
                dataset_id TEXT,
                latest_url_alias BOOLEAN NOT NULL DEFAULT FALSE,
                updated_at BIGINT NOT NULL,
                PRIMARY KEY (entity_type, entity_id, day)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_metric_points_day ON metric_points(day)")
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }

    async fn upsert(&self, point: &DailyMetricPoint) -> StoreResult<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO metric_points (
                entity_type, entity_id, day, nb_hits, nb_visits, nb_uniq_visitors,
                author_type, author_id, dataset_id, latest_url_alias, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (entity_type, entity_id, day) DO UPDATE SET
                nb_hits = metric_points.nb_hits + EXCLUDED.nb_hits,
                nb_visits = metric_points.nb_visits + EXCLUDED.nb_visits,
                nb_uniq_visitors = metric_points.nb_uniq_visitors + EXCLUDED.nb_uniq_visitors,
                author_type = COALESCE(EXCLUDED.author_type, metric_points.author_type),
                author_id = COALESCE(EXCLUDED.author_id, metric_points.author_id),
                dataset_id = COALESCE(EXCLUDED.dataset_id, metric_points.dataset_id),
                latest_url_alias = metric_points.latest_url_alias OR EXCLUDED.latest_url_alias,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(point.entity_type.as_str())
        .bind(&point.entity_id)
        .bind(day_key(point.day))
        .bind(to_db_count(point.counts.nb_hits)?)
        .bind(to_db_count(point.counts.nb_visits)?)
        .bind(to_db_count(point.counts.nb_uniq_visitors)?)
        .bind(point.tags.author_type.map(|kind| kind.as_str()))
        .bind(point.tags.author_id.as_deref())
        .bind(point.tags.dataset_id.as_deref())
        .bind(point.latest_url_alias)
        .bind(now)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn clear_day(&self, day: NaiveDate) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM metric_points WHERE day = $1")
            .bind(day_key(day))
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected())
    }

    async fn entities_on_day(&self, day: NaiveDate) -> StoreResult<Vec<(EntityType, String)>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT entity_type, entity_id FROM metric_points \
             WHERE day = $1 ORDER BY entity_type, entity_id",
        )
        .bind(day_key(day))
        .fetch_all(self.pool.as_ref())
        .await?;

        to_entity_keys(rows)
    }

    async fn point(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        day: NaiveDate,
    ) -> StoreResult<Option<DailyMetricPoint>> {
        let row = sqlx::query_as::<_, PointRow>(&format!(
            "SELECT {POINT_COLUMNS} FROM metric_points \
             WHERE entity_type = $1 AND entity_id = $2 AND day = $3"
        ))
        .bind(entity_type.as_str())
        .bind(entity_id)
        .bind(day_key(day))
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.map(DailyMetricPoint::try_from).transpose()
    }

    async fn range(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> StoreResult<Vec<DailyMetricPoint>> {
        let rows = sqlx::query_as::<_, PointRow>(&format!(
            "SELECT {POINT_COLUMNS} FROM metric_points \
             WHERE entity_type = $1 AND entity_id = $2 AND day >= $3 AND day <= $4 \
             ORDER BY day"
        ))
        .bind(entity_type.as_str())
        .bind(entity_id)
        .bind(day_key(start))
        .bind(day_key(end))
        .fetch_all(self.pool.as_ref())
        .await?;

        rows.into_iter().map(DailyMetricPoint::try_from).collect()
    }

    async fn sum_for_entity(&self, entity_type: EntityType, entity_id: &str) -> StoreResult<Counts> {
        let (hits, visits, visitors) = sqlx::query_as::<_, (i64, i64, i64)>(
            r#"
            SELECT COALESCE(SUM(nb_hits), 0)::BIGINT, COALESCE(SUM(nb_visits), 0)::BIGINT,
                   COALESCE(SUM(nb_uniq_visitors), 0)::BIGINT
            FROM metric_points
            WHERE entity_type = $1 AND entity_id = $2
            "#,
        )
        .bind(entity_type.as_str())
        .bind(entity_id)
        .fetch_one(self.pool.as_ref())
        .await?;

        to_counts(hits, visits, visitors)
    }

    async fn sum_for_entity_set(&self, entity_type: EntityType, ids: &[String]) -> StoreResult<Counts> {
        if ids.is_empty() {
            return Ok(Counts::default());
        }

        let (hits, visits, visitors) = sqlx::query_as::<_, (i64, i64, i64)>(
            r#"
            SELECT COALESCE(SUM(nb_hits), 0)::BIGINT, COALESCE(SUM(nb_visits), 0)::BIGINT,
                   COALESCE(SUM(nb_uniq_visitors), 0)::BIGINT
            FROM metric_points
            WHERE entity_type = $1 AND entity_id = ANY($2)
            "#,
        )
        .bind(entity_type.as_str())
        .bind(ids)
        .fetch_one(self.pool.as_ref())
        .await?;

        to_counts(hits, visits, visitors)
    }

    async fn grouped_totals(
        &self,
        entity_type: EntityType,
        since: Option<NaiveDate>,
    ) -> StoreResult<Vec<EntityTotals>> {
        // A NULL lower bound keeps every entity.
        let rows = sqlx::query_as::<_, (String, i64, i64, i64)>(
            r#"
            SELECT entity_id, SUM(nb_hits)::BIGINT, SUM(nb_visits)::BIGINT,
                   SUM(nb_uniq_visitors)::BIGINT
            FROM metric_points
            WHERE entity_type = $1
              AND ($2::TEXT IS NULL OR entity_id IN (
                  SELECT entity_id FROM metric_points
                  WHERE entity_type = $1 AND day >= $2
              ))
            GROUP BY entity_id
            ORDER BY entity_id
            "#,
        )
        .bind(entity_type.as_str())
        .bind(since.map(day_key))
        .fetch_all(self.pool.as_ref())
        .await?;

        to_totals(rows)
    }
}
