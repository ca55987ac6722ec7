use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;

use super::schema::{
    has_slug, members_sql, record_select, CommunityResourceRow, DatasetRow, RecordRow, ResourceRow,
    COMMUNITY_RESOURCE_COLUMNS, SCHEMA,
};
use super::{check_field, table_name, Catalog, CatalogError, CatalogResult};
use crate::models::{
    CommunityResource, Dataset, EntityRecord, EntityType, MetricField, SaveOptions,
};

/// Catalog backed by a SQLite copy of the platform's entities.
pub struct SqliteCatalog {
    pool: Arc<SqlitePool>,
}

impl SqliteCatalog {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
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

    pub async fn insert_organization(&self, id: &str, slug: &str) -> Result<()> {
        sqlx::query("INSERT INTO organizations (id, slug) VALUES (?, ?)")
            .bind(id)
            .bind(slug)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    pub async fn insert_user(&self, id: &str, slug: &str) -> Result<()> {
        sqlx::query("INSERT INTO users (id, slug) VALUES (?, ?)")
            .bind(id)
            .bind(slug)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    pub async fn insert_reuse(
        &self,
        id: &str,
        slug: &str,
        organization: Option<&str>,
        owner: Option<&str>,
    ) -> Result<()> {
        sqlx::query("INSERT INTO reuses (id, slug, organization_id, owner_id) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(slug)
            .bind(organization)
            .bind(owner)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    /// Insert a dataset together with its resources.
    pub async fn insert_dataset(&self, dataset: &Dataset) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO datasets (id, slug, organization_id, owner_id) VALUES (?, ?, ?, ?)")
            .bind(&dataset.id)
            .bind(&dataset.slug)
            .bind(dataset.organization.as_deref())
            .bind(dataset.owner.as_deref())
            .execute(&mut *tx)
            .await?;

        for resource in &dataset.resources {
            sqlx::query("INSERT INTO resources (id, dataset_id, url, urlhash) VALUES (?, ?, ?, ?)")
                .bind(&resource.id)
                .bind(&dataset.id)
                .bind(&resource.url)
                .bind(&resource.urlhash)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_community_resource(&self, resource: &CommunityResource) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO community_resources (id, dataset_id, organization_id, owner_id, url, urlhash)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&resource.id)
        .bind(resource.dataset.as_deref())
        .bind(resource.organization.as_deref())
        .bind(resource.owner.as_deref())
        .bind(&resource.url)
        .bind(&resource.urlhash)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    /// Cached counter currently stored on an entity.
    pub async fn current_metric(
        &self,
        entity_type: EntityType,
        id: &str,
        field: MetricField,
    ) -> CatalogResult<Option<u64>> {
        check_field(entity_type, field)?;
        let value: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT {} FROM {} WHERE id = ?",
            field.column(),
            table_name(entity_type)
        ))
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        value
            .map(|v| u64::try_from(v).map_err(|_| CatalogError::Corrupt(format!("negative counter {v}"))))
            .transpose()
    }

    /// Unix timestamp of the last save that ran side effects.
    pub async fn last_modified(&self, entity_type: EntityType, id: &str) -> CatalogResult<Option<i64>> {
        let value: Option<Option<i64>> = sqlx::query_scalar(&format!(
            "SELECT last_modified FROM {} WHERE id = ?",
            table_name(entity_type)
        ))
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(value.flatten())
    }

    async fn load_dataset(&self, id: &str) -> CatalogResult<Option<Dataset>> {
        let Some(row) = sqlx::query_as::<_, DatasetRow>(
            "SELECT id, slug, organization_id, owner_id FROM datasets WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?
        else {
            return Ok(None);
        };

        let resources = sqlx::query_as::<_, ResourceRow>(
            "SELECT id, url, urlhash FROM resources WHERE dataset_id = ? ORDER BY id",
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
impl Catalog for SqliteCatalog {
    async fn find_dataset_by_resource_id(&self, resource_id: &str) -> CatalogResult<Option<Dataset>> {
        let dataset_id: Option<String> =
            sqlx::query_scalar("SELECT dataset_id FROM resources WHERE id = ?")
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
            "SELECT DISTINCT dataset_id FROM resources WHERE urlhash = ? ORDER BY dataset_id",
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
            "SELECT {COMMUNITY_RESOURCE_COLUMNS} FROM community_resources WHERE id = ?"
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
             WHERE urlhash = ? ORDER BY id"
        ))
        .bind(hash)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn find_by_id(&self, entity_type: EntityType, key: &str) -> CatalogResult<Option<EntityRecord>> {
        let select = record_select(entity_type);
        let row = if has_slug(entity_type) {
            // An exact id match wins over a slug match.
            sqlx::query_as::<_, RecordRow>(&format!(
                "{select} WHERE t.id = ? OR t.slug = ? \
                 ORDER BY CASE WHEN t.id = ? THEN 0 ELSE 1 END LIMIT 1"
            ))
            .bind(key)
            .bind(key)
            .bind(key)
            .fetch_optional(self.pool.as_ref())
            .await?
        } else {
            sqlx::query_as::<_, RecordRow>(&format!("{select} WHERE t.id = ?"))
                .bind(key)
                .fetch_optional(self.pool.as_ref())
                .await?
        };

        Ok(row.map(|r| r.into_record(entity_type)))
    }

    async fn organization_members(
        &self,
        org_id: &str,
        member_type: EntityType,
    ) -> CatalogResult<Vec<String>> {
        let Some(sql) = members_sql(member_type, "?") else {
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
            sqlx::query(&format!("UPDATE {table} SET {column} = ? WHERE id = ?"))
                .bind(value)
                .bind(id)
                .execute(self.pool.as_ref())
                .await?
        } else {
            sqlx::query(&format!(
                "UPDATE {table} SET {column} = ?, last_modified = ? WHERE id = ?"
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Resource;

    async fn setup() -> SqliteCatalog {
        let catalog = SqliteCatalog::new("sqlite::memory:", 1).await.unwrap();
        catalog.init().await.unwrap();
        catalog.insert_organization("org-1", "acme").await.unwrap();
        catalog.insert_user("u-1", "jane").await.unwrap();
        catalog
            .insert_dataset(&Dataset {
                id: "d1".into(),
                slug: "budget".into(),
                organization: Some("org-1".into()),
                owner: Some("u-1".into()),
                resources: vec![
                    Resource::with_url("r1", "http://files.test/a.csv"),
                    Resource::with_url("r2", "http://files.test/b.csv"),
                ],
            })
            .await
            .unwrap();
        catalog
            .insert_dataset(&Dataset {
                id: "d2".into(),
                slug: "census".into(),
                organization: None,
                owner: Some("u-1".into()),
                resources: vec![Resource::with_url("r3", "http://files.test/a.csv")],
            })
            .await
            .unwrap();
        catalog
            .insert_reuse("re-1", "viz", Some("org-1"), None)
            .await
            .unwrap();
        catalog
    }

    #[tokio::test]
    async fn test_dataset_lookups() {
        let catalog = setup().await;

        let dataset = catalog.find_dataset_by_resource_id("r2").await.unwrap().unwrap();
        assert_eq!(dataset.id, "d1");
        assert_eq!(dataset.resources.len(), 2);

        let shared = catalog
            .find_datasets_by_resource_url_hash(&crate::resolver::hash_url("http://files.test/a.csv"))
            .await
            .unwrap();
        let ids: Vec<&str> = shared.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "d2"]);

        assert!(catalog.find_dataset_by_resource_id("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_by_id_or_slug() {
        let catalog = setup().await;

        let by_slug = catalog.find_by_id(EntityType::Dataset, "census").await.unwrap().unwrap();
        assert_eq!(by_slug.id, "d2");
        assert_eq!(by_slug.owner.as_deref(), Some("u-1"));

        let resource = catalog.find_by_id(EntityType::Resource, "r1").await.unwrap().unwrap();
        assert_eq!(resource.dataset.as_deref(), Some("d1"));
        assert_eq!(resource.organization.as_deref(), Some("org-1"));

        let user = catalog.find_by_id(EntityType::User, "jane").await.unwrap().unwrap();
        assert_eq!(user.id, "u-1");

        assert!(catalog.find_by_id(EntityType::Reuse, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_organization_members() {
        let catalog = setup().await;

        let resources = catalog
            .organization_members("org-1", EntityType::Resource)
            .await
            .unwrap();
        assert_eq!(resources, vec!["r1".to_string(), "r2".to_string()]);

        let reuses = catalog.organization_members("org-1", EntityType::Reuse).await.unwrap();
        assert_eq!(reuses, vec!["re-1".to_string()]);

        assert_eq!(catalog.organization_ids().await.unwrap(), vec!["org-1".to_string()]);
    }

    #[tokio::test]
    async fn test_set_current_metric() {
        let catalog = setup().await;

        let updated = catalog
            .set_current_metric(EntityType::Dataset, "d1", MetricField::Views, 12, SaveOptions::QUIET)
            .await
            .unwrap();
        assert!(updated);
        assert_eq!(
            catalog.current_metric(EntityType::Dataset, "d1", MetricField::Views).await.unwrap(),
            Some(12)
        );
        assert_eq!(catalog.last_modified(EntityType::Dataset, "d1").await.unwrap(), None);

        catalog
            .set_current_metric(
                EntityType::Organization,
                "org-1",
                MetricField::ResourceDownloads,
                3,
                SaveOptions::NORMAL,
            )
            .await
            .unwrap();
        assert!(catalog
            .last_modified(EntityType::Organization, "org-1")
            .await
            .unwrap()
            .is_some());

        let missing = catalog
            .set_current_metric(EntityType::Reuse, "gone", MetricField::Views, 1, SaveOptions::QUIET)
            .await
            .unwrap();
        assert!(!missing);
    }
}
