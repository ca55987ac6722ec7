//! Domain entity catalog
//!
//! Lookup and counter-cache mutation capabilities over the content platform's
//! entities. The platform owns the data; this crate only reads it and writes
//! the cached metric fields.

pub mod memory;
pub mod postgres;
mod schema;
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{CommunityResource, Dataset, EntityRecord, EntityType, MetricField, SaveOptions};

pub use memory::MemoryCatalog;
pub use postgres::PostgresCatalog;
pub use sqlite::SqliteCatalog;

#[derive(Debug, Error)]
pub enum CatalogError {
    /// The lookup backend could not be reached or failed mid-query.
    #[error("catalog backend unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
    #[error("corrupt catalog record: {0}")]
    Corrupt(String),
    #[error("{field:?} is not tracked on {entity_type}")]
    UnsupportedField {
        entity_type: EntityType,
        field: MetricField,
    },
}

pub type CatalogResult<T> = Result<T, CatalogError>;

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Dataset holding the resource with id `resource_id`.
    async fn find_dataset_by_resource_id(&self, resource_id: &str) -> CatalogResult<Option<Dataset>>;

    /// Every dataset holding at least one resource whose URL hash is `hash`.
    async fn find_datasets_by_resource_url_hash(&self, hash: &str) -> CatalogResult<Vec<Dataset>>;

    async fn find_community_resource_by_id(&self, id: &str) -> CatalogResult<Option<CommunityResource>>;

    async fn find_community_resources_by_url_hash(
        &self,
        hash: &str,
    ) -> CatalogResult<Vec<CommunityResource>>;

    /// Look an entity up by id, or by slug for the types that have one.
    async fn find_by_id(&self, entity_type: EntityType, key: &str) -> CatalogResult<Option<EntityRecord>>;

    /// Ids of the `member_type` entities owned by organization `org_id`.
    /// Resources are owned through their dataset.
    async fn organization_members(
        &self,
        org_id: &str,
        member_type: EntityType,
    ) -> CatalogResult<Vec<String>>;

    async fn organization_ids(&self) -> CatalogResult<Vec<String>>;

    /// Overwrite a cached counter. Returns `false` when the entity does not exist.
    async fn set_current_metric(
        &self,
        entity_type: EntityType,
        id: &str,
        field: MetricField,
        value: u64,
        options: SaveOptions,
    ) -> CatalogResult<bool>;
}

/// Table holding each entity type in the SQL catalogs.
pub(crate) const fn table_name(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Dataset => "datasets",
        EntityType::Resource => "resources",
        EntityType::CommunityResource => "community_resources",
        EntityType::Organization => "organizations",
        EntityType::User => "users",
        EntityType::Reuse => "reuses",
    }
}

/// Whether `field` exists on entities of `entity_type`.
pub(crate) const fn supports_field(entity_type: EntityType, field: MetricField) -> bool {
    match field {
        MetricField::Views => true,
        MetricField::DatasetViews | MetricField::ReuseViews | MetricField::ResourceDownloads => {
            matches!(entity_type, EntityType::Organization)
        }
    }
}

pub(crate) fn check_field(entity_type: EntityType, field: MetricField) -> CatalogResult<()> {
    if supports_field(entity_type, field) {
        Ok(())
    } else {
        Err(CatalogError::UnsupportedField { entity_type, field })
    }
}
