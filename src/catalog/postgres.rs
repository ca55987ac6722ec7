use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;

use super::schema::{
    has_slug, members_sql, record_select, CommunityResourceRow, DatasetRow, RecordRow, ResourceRow,
    COMMUNITY_RESOURCE_COLUMNS, SCHEMA,
};
use super::{check_field, table_name, Catalog, CatalogError, CatalogResult};
use crate::models::{
    CommunityResource, Dataset, EntityRecord, EntityType, MetricField, SaveOptions,
};

/// Catalog reading the platform's Postgres database.
pub struct PostgresCatalog {
    pool: Arc<PgPool>,
}

impl PostgresCatalog {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub async fn init(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(self.pool.as_ref()).await?;
        }
        Ok(())
    }

    async fn load_dataset(&self, id: &str) -> CatalogResult<Option<Dataset>> {
        let Some(row) = sqlx::query_as::<_, DatasetRow>(
            "SELECT id, slug, organization_id, owner_id FROM datasets WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?
        else {
            return Ok(None);
        };

        let resources = sqlx::query_as::<_, ResourceRow>(
            "SELECT id, url, urlhash FROM resources WHERE dataset_id = $1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(Some(Dataset {
            id: row.id,
            slug: row.slug,
            organization: row.organization_id,
            owner: row.owner_id,
            resources: resources.into_iter().map(Into::into).collect(),
        }))
    }
}

#[async_trait]
impl Catalog for PostgresCatalog {
    async fn find_dataset_by_resource_id(&self, resource_id: &str) -> CatalogResult<Option<Dataset>> {
        let dataset_id: Option<String> =
            sqlx::query_scalar("SELECT dataset_id FROM resources WHERE id = $1")
                .bind(resource_id)
                .fetch_optional(self.pool.as_ref())
                .await?;

        match dataset_id {
            Some(id) => self.load_dataset(&id).await,
            None => Ok(None),
        }
    }

    async fn find_datasets_by_resource_url_hash(&self, hash: &str) -> CatalogResult<Vec<Dataset>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT dataset_id FROM resources WHERE urlhash = $1 ORDER BY dataset_id",
        )
        .bind(hash)
        .fetch_all(self.pool.as_ref())
        .await?;

        let mut datasets = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(dataset) = self.load_dataset(&id).await? {
                datasets.push(dataset);
            }
        }
        Ok(datasets)
    }

    async fn find_community_resource_by_id(&self, id: &str) -> CatalogResult<Option<CommunityResource>> {
        let row = sqlx::query_as::<_, CommunityResourceRow>(&format!(
            "SELECT {COMMUNITY_RESOURCE_COLUMNS} FROM community_resources WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(row.map(Into::into))
    }

    async fn find_community_resources_by_url_hash(
        &self,
        hash: &str,
    ) -> CatalogResult<Vec<CommunityResource>> {
        let rows = sqlx::query_as::<_, CommunityResourceRow>(&format!(
            "SELECT {COMMUNITY_RESOURCE_COLUMNS} FROM community_resources \
             WHERE urlhash = $1 ORDER BY id"
        ))
        .bind(hash)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn find_by_id(&self, entity_type: EntityType, key: &str) -> CatalogResult<Option<EntityRecord>> {
        let select = record_select(entity_type);
        let sql = if has_slug(entity_type) {
            format!(
                "{select} WHERE t.id = $1 OR t.slug = $1 \
                 ORDER BY CASE WHEN t.id = $1 THEN 0 ELSE 1 END LIMIT 1"
            )
        } else {
            format!("{select} WHERE t.id = $1")
        };

        let row = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(key)
            .fetch_optional(self.pool.as_ref())
            .await?;

        Ok(row.map(|r| r.into_record(entity_type)))
    }

    async fn organization_members(
        &self,
        org_id: &str,
        member_type: EntityType,
    ) -> CatalogResult<Vec<String>> {
        let Some(sql) = members_sql(member_type, "$1") else {
            return Ok(Vec::new());
        };
        let ids = sqlx::query_scalar(&sql)
            .bind(org_id)
            .fetch_all(self.pool.as_ref())
            .await?;
        Ok(ids)
    }

    async fn organization_ids(&self) -> CatalogResult<Vec<String>> {
        let ids = sqlx::query_scalar("SELECT id FROM organizations ORDER BY id")
            .fetch_all(self.pool.as_ref())
            .await?;
        Ok(ids)
    }

    async fn set_current_metric(
        &self,
        entity_type: EntityType,
        id: &str,
        field: MetricField,
        value: u64,
        options: SaveOptions,
    ) -> CatalogResult<bool> {
        check_field(entity_type, field)?;
        let value = i64::try_from(value)
            .map_err(|_| CatalogError::Corrupt(format!("counter {value} overflows")))?;
        let table = table_name(entity_type);
        let column = field.column();

        let result = if options.suppress_side_effects {
            sqlx::query(&format!("UPDATE {table} SET {column} = $1 WHERE id = $2"))
                .bind(value)
                .bind(id)
                .execute(self.pool.as_ref())
                .await?
        } else {
            sqlx::query(&format!(
                "UPDATE {table} SET {column} = $1, last_modified = $2 WHERE id = $3"
            ))
            .bind(value)
            .bind(chrono::Utc::now().timestamp())
            .bind(id)
            .execute(self.pool.as_ref())
            .await?
        };

        Ok(result.rows_affected() > 0)
    }
}
