//! Tables and statements shared by the SQL catalogs.

use super::table_name;
use crate::models::{CommunityResource, EntityRecord, EntityType, Resource};

/// Statements run by `init()`. Both SQLite and Postgres accept them as is.
pub(crate) const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS organizations (
        id TEXT PRIMARY KEY,
        slug TEXT NOT NULL UNIQUE,
        views BIGINT NOT NULL DEFAULT 0,
        dataset_views BIGINT NOT NULL DEFAULT 0,
        reuse_views BIGINT NOT NULL DEFAULT 0,
        resource_downloads BIGINT NOT NULL DEFAULT 0,
        last_modified BIGINT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        slug TEXT NOT NULL UNIQUE,
        views BIGINT NOT NULL DEFAULT 0,
        last_modified BIGINT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS datasets (
        id TEXT PRIMARY KEY,
        slug TEXT NOT NULL UNIQUE,
        organization_id TEXT,
        owner_id TEXT,
        views BIGINT NOT NULL DEFAULT 0,
        last_modified BIGINT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS resources (
        id TEXT PRIMARY KEY,
        dataset_id TEXT NOT NULL,
        url TEXT NOT NULL,
        urlhash TEXT NOT NULL,
        views BIGINT NOT NULL DEFAULT 0,
        last_modified BIGINT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_resources_urlhash ON resources(urlhash)",
    "CREATE INDEX IF NOT EXISTS idx_resources_dataset ON resources(dataset_id)",
    r#"
    CREATE TABLE IF NOT EXISTS community_resources (
        id TEXT PRIMARY KEY,
        dataset_id TEXT,
        organization_id TEXT,
        owner_id TEXT,
        url TEXT NOT NULL,
        urlhash TEXT NOT NULL,
        views BIGINT NOT NULL DEFAULT 0,
        last_modified BIGINT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_community_resources_urlhash ON community_resources(urlhash)",
    r#"
    CREATE TABLE IF NOT EXISTS reuses (
        id TEXT PRIMARY KEY,
        slug TEXT NOT NULL UNIQUE,
        organization_id TEXT,
        owner_id TEXT,
        views BIGINT NOT NULL DEFAULT 0,
        last_modified BIGINT
    )
    "#,
];

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct DatasetRow {
    pub id: String,
    pub slug: String,
    pub organization_id: Option<String>,
    pub owner_id: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ResourceRow {
    pub id: String,
    pub url: String,
    pub urlhash: String,
}

impl From<ResourceRow> for Resource {
    fn from(row: ResourceRow) -> Self {
        Resource {
            id: row.id,
            url: row.url,
            urlhash: row.urlhash,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct CommunityResourceRow {
    pub id: String,
    pub dataset_id: Option<String>,
    pub organization_id: Option<String>,
    pub owner_id: Option<String>,
    pub url: String,
    pub urlhash: String,
}

impl From<CommunityResourceRow> for CommunityResource {
    fn from(row: CommunityResourceRow) -> Self {
        CommunityResource {
            id: row.id,
            dataset: row.dataset_id,
            organization: row.organization_id,
            owner: row.owner_id,
            url: row.url,
            urlhash: row.urlhash,
        }
    }
}

pub(crate) const COMMUNITY_RESOURCE_COLUMNS: &str =
    "id, dataset_id, organization_id, owner_id, url, urlhash";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RecordRow {
    pub id: String,
    pub slug: Option<String>,
    pub organization_id: Option<String>,
    pub owner_id: Option<String>,
    pub dataset_id: Option<String>,
}

impl RecordRow {
    pub fn into_record(self, entity_type: EntityType) -> EntityRecord {
        EntityRecord {
            entity_type,
            id: self.id,
            slug: self.slug,
            organization: self.organization_id,
            owner: self.owner_id,
            dataset: self.dataset_id,
        }
    }
}

/// `SELECT` producing a [`RecordRow`], with the entity's own table aliased `t`.
pub(crate) const fn record_select(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Dataset => {
            "SELECT t.id, t.slug, t.organization_id, t.owner_id, \
             CAST(NULL AS TEXT) AS dataset_id FROM datasets t"
        }
        // Resources are credited to their dataset's author.
        EntityType::Resource => {
            "SELECT t.id, CAST(NULL AS TEXT) AS slug, d.organization_id, d.owner_id, \
             t.dataset_id FROM resources t LEFT JOIN datasets d ON d.id = t.dataset_id"
        }
        EntityType::CommunityResource => {
            "SELECT t.id, CAST(NULL AS TEXT) AS slug, t.organization_id, t.owner_id, \
             t.dataset_id FROM community_resources t"
        }
        EntityType::Organization => {
            "SELECT t.id, t.slug, CAST(NULL AS TEXT) AS organization_id, \
             CAST(NULL AS TEXT) AS owner_id, CAST(NULL AS TEXT) AS dataset_id \
             FROM organizations t"
        }
        EntityType::User => {
            "SELECT t.id, t.slug, CAST(NULL AS TEXT) AS organization_id, \
             CAST(NULL AS TEXT) AS owner_id, CAST(NULL AS TEXT) AS dataset_id FROM users t"
        }
        EntityType::Reuse => {
            "SELECT t.id, t.slug, t.organization_id, t.owner_id, \
             CAST(NULL AS TEXT) AS dataset_id FROM reuses t"
        }
    }
}

pub(crate) const fn has_slug(entity_type: EntityType) -> bool {
    matches!(
        entity_type,
        EntityType::Dataset | EntityType::Organization | EntityType::User | EntityType::Reuse
    )
}

/// Query listing the ids of an organization's `member_type` entities, with
/// the organization id bound to `param`. `None` for types nothing owns.
pub(crate) fn members_sql(member_type: EntityType, param: &str) -> Option<String> {
    match member_type {
        EntityType::Dataset | EntityType::CommunityResource | EntityType::Reuse => Some(format!(
            "SELECT id FROM {} WHERE organization_id = {param} ORDER BY id",
            table_name(member_type)
        )),
        EntityType::Resource => Some(format!(
            "SELECT r.id FROM resources r JOIN datasets d ON d.id = r.dataset_id \
             WHERE d.organization_id = {param} ORDER BY r.id"
        )),
        EntityType::Organization | EntityType::User => None,
    }
}
