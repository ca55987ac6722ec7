use async_trait::async_trait;
use dashmap::DashMap;

use super::{check_field, Catalog, CatalogResult};
use crate::models::{
    CommunityResource, Dataset, EntityRecord, EntityType, MetricField, SaveOptions,
};

type EntityKey = (EntityType, String);

/// Catalog kept entirely in memory.
///
/// Handy for embedding and for tests. Saves that do not suppress side
/// effects are counted per entity, standing in for the platform's save hooks.
#[derive(Default)]
pub struct MemoryCatalog {
    datasets: DashMap<String, Dataset>,
    community_resources: DashMap<String, CommunityResource>,
    /// Organizations, users and reuses
    records: DashMap<EntityKey, EntityRecord>,
    metrics: DashMap<(EntityType, String, MetricField), u64>,
    side_effects: DashMap<EntityKey, u64>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_dataset(&self, dataset: Dataset) {
        self.datasets.insert(dataset.id.clone(), dataset);
    }

    pub fn insert_community_resource(&self, resource: CommunityResource) {
        self.community_resources.insert(resource.id.clone(), resource);
    }

    pub fn insert_organization(&self, id: &str, slug: &str) {
        self.insert_record(EntityType::Organization, id, slug, None, None);
    }

    pub fn insert_user(&self, id: &str, slug: &str) {
        self.insert_record(EntityType::User, id, slug, None, None);
    }

    pub fn insert_reuse(&self, id: &str, slug: &str, organization: Option<&str>, owner: Option<&str>) {
        self.insert_record(EntityType::Reuse, id, slug, organization, owner);
    }

    fn insert_record(
        &self,
        entity_type: EntityType,
        id: &str,
        slug: &str,
        organization: Option<&str>,
        owner: Option<&str>,
    ) {
        self.records.insert(
            (entity_type, id.to_string()),
            EntityRecord {
                entity_type,
                id: id.to_string(),
                slug: Some(slug.to_string()),
                organization: organization.map(str::to_string),
                owner: owner.map(str::to_string),
                dataset: None,
            },
        );
    }

    /// Delete an entity, as the platform would.
    pub fn remove(&self, entity_type: EntityType, id: &str) {
        match entity_type {
            EntityType::Dataset => {
                self.datasets.remove(id);
            }
            EntityType::Resource => {
                for mut dataset in self.datasets.iter_mut() {
                    dataset.resources.retain(|r| r.id != id);
                }
            }
            EntityType::CommunityResource => {
                self.community_resources.remove(id);
            }
            _ => {
                self.records.remove(&(entity_type, id.to_string()));
            }
        }
    }

    /// Cached counter last written for an entity.
    pub fn current_metric(&self, entity_type: EntityType, id: &str, field: MetricField) -> Option<u64> {
        self.metrics
            .get(&(entity_type, id.to_string(), field))
            .map(|entry| *entry.value())
    }

    /// Number of saves that ran the platform's side effects.
    pub fn side_effect_count(&self, entity_type: EntityType, id: &str) -> u64 {
        self.side_effects
            .get(&(entity_type, id.to_string()))
            .map(|entry| *entry.value())
            .unwrap_or(0)
    }

    fn exists(&self, entity_type: EntityType, id: &str) -> bool {
        match entity_type {
            EntityType::Dataset => self.datasets.contains_key(id),
            EntityType::Resource => self
                .datasets
                .iter()
                .any(|d| d.resources.iter().any(|r| r.id == id)),
            EntityType::CommunityResource => self.community_resources.contains_key(id),
            _ => self.records.contains_key(&(entity_type, id.to_string())),
        }
    }

    fn dataset_record(dataset: &Dataset) -> EntityRecord {
        EntityRecord {
            entity_type: EntityType::Dataset,
            id: dataset.id.clone(),
            slug: Some(dataset.slug.clone()),
            organization: dataset.organization.clone(),
            owner: dataset.owner.clone(),
            dataset: None,
        }
    }

    fn community_resource_record(resource: &CommunityResource) -> EntityRecord {
        EntityRecord {
            entity_type: EntityType::CommunityResource,
            id: resource.id.clone(),
            slug: None,
            organization: resource.organization.clone(),
            owner: resource.owner.clone(),
            dataset: resource.dataset.clone(),
        }
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn find_dataset_by_resource_id(&self, resource_id: &str) -> CatalogResult<Option<Dataset>> {
        Ok(self
            .datasets
            .iter()
            .find(|d| d.resources.iter().any(|r| r.id == resource_id))
            .map(|d| d.value().clone()))
    }

    async fn find_datasets_by_resource_url_hash(&self, hash: &str) -> CatalogResult<Vec<Dataset>> {
        let mut found: Vec<Dataset> = self
            .datasets
            .iter()
            .filter(|d| d.resources.iter().any(|r| r.urlhash == hash))
            .map(|d| d.value().clone())
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn find_community_resource_by_id(&self, id: &str) -> CatalogResult<Option<CommunityResource>> {
        Ok(self.community_resources.get(id).map(|r| r.value().clone()))
    }

    async fn find_community_resources_by_url_hash(
        &self,
        hash: &str,
    ) -> CatalogResult<Vec<CommunityResource>> {
        let mut found: Vec<CommunityResource> = self
            .community_resources
            .iter()
            .filter(|r| r.urlhash == hash)
            .map(|r| r.value().clone())
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn find_by_id(&self, entity_type: EntityType, key: &str) -> CatalogResult<Option<EntityRecord>> {
        let record = match entity_type {
            EntityType::Dataset => self
                .datasets
                .get(key)
                .map(|d| Self::dataset_record(d.value()))
                .or_else(|| {
                    self.datasets
                        .iter()
                        .find(|d| d.slug == key)
                        .map(|d| Self::dataset_record(d.value()))
                }),
            EntityType::Resource => self.datasets.iter().find_map(|d| {
                d.resources.iter().find(|r| r.id == key).map(|r| EntityRecord {
                    entity_type: EntityType::Resource,
                    id: r.id.clone(),
                    slug: None,
                    organization: d.organization.clone(),
                    owner: d.owner.clone(),
                    dataset: Some(d.id.clone()),
                })
            }),
            EntityType::CommunityResource => self
                .community_resources
                .get(key)
                .map(|r| Self::community_resource_record(r.value())),
            _ => self
                .records
                .get(&(entity_type, key.to_string()))
                .map(|r| r.value().clone())
                .or_else(|| {
                    self.records
                        .iter()
                        .find(|r| r.entity_type == entity_type && r.slug.as_deref() == Some(key))
                        .map(|r| r.value().clone())
                }),
        };
        Ok(record)
    }

    async fn organization_members(
        &self,
        org_id: &str,
        member_type: EntityType,
    ) -> CatalogResult<Vec<String>> {
        let owned_by = |organization: &Option<String>| organization.as_deref() == Some(org_id);

        let mut ids: Vec<String> = match member_type {
            EntityType::Dataset => self
                .datasets
                .iter()
                .filter(|d| owned_by(&d.organization))
                .map(|d| d.id.clone())
                .collect(),
            EntityType::Resource => self
                .datasets
                .iter()
                .filter(|d| owned_by(&d.organization))
                .flat_map(|d| d.resources.iter().map(|r| r.id.clone()).collect::<Vec<_>>())
                .collect(),
            EntityType::CommunityResource => self
                .community_resources
                .iter()
                .filter(|r| owned_by(&r.organization))
                .map(|r| r.id.clone())
                .collect(),
            EntityType::Reuse => self
                .records
                .iter()
                .filter(|r| r.entity_type == EntityType::Reuse && owned_by(&r.organization))
                .map(|r| r.id.clone())
                .collect(),
            EntityType::Organization | EntityType::User => Vec::new(),
        };
        ids.sort();
        Ok(ids)
    }

    async fn organization_ids(&self) -> CatalogResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.entity_type == EntityType::Organization)
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
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
        if !self.exists(entity_type, id) {
            return Ok(false);
        }

        self.metrics.insert((entity_type, id.to_string(), field), value);
        if !options.suppress_side_effects {
            *self
                .side_effects
                .entry((entity_type, id.to_string()))
                .or_insert(0) += 1;
        }
        Ok(true)
    }
}
