use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Trackable domain object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Dataset,
    Resource,
    CommunityResource,
    Organization,
    User,
    Reuse,
}

impl EntityType {
    pub const ALL: [EntityType; 6] = [
        EntityType::Dataset,
        EntityType::Resource,
        EntityType::CommunityResource,
        EntityType::Organization,
        EntityType::User,
        EntityType::Reuse,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            EntityType::Dataset => "dataset",
            EntityType::Resource => "resource",
            EntityType::CommunityResource => "community_resource",
            EntityType::Organization => "organization",
            EntityType::User => "user",
            EntityType::Reuse => "reuse",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "dataset" => Ok(EntityType::Dataset),
            "resource" => Ok(EntityType::Resource),
            "community_resource" => Ok(EntityType::CommunityResource),
            "organization" => Ok(EntityType::Organization),
            "user" => Ok(EntityType::User),
            "reuse" => Ok(EntityType::Reuse),
            other => Err(format!("unknown entity type '{other}'")),
        }
    }
}

/// Reference to a resolved entity.
///
/// `parent_id` is the container that matters for attribution: the dataset
/// of a resource or community resource, the organization of a dataset or
/// reuse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub id: String,
    pub parent_id: Option<String>,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, id: impl Into<String>) -> Self {
        Self {
            entity_type,
            id: id.into(),
            parent_id: None,
        }
    }

    pub fn with_parent(mut self, parent_id: Option<String>) -> Self {
        self.parent_id = parent_id;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorKind {
    Organization,
    User,
}

impl AuthorKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AuthorKind::Organization => "organization",
            AuthorKind::User => "user",
        }
    }
}

impl FromStr for AuthorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "organization" => Ok(AuthorKind::Organization),
            "user" => Ok(AuthorKind::User),
            other => Err(format!("unknown author type '{other}'")),
        }
    }
}

/// Who a published object is credited to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Author {
    pub kind: AuthorKind,
    pub id: String,
}

impl Author {
    /// The organization when there is one, otherwise the individual owner.
    pub fn of(organization: Option<&str>, owner: Option<&str>) -> Option<Author> {
        match (organization, owner) {
            (Some(org), _) => Some(Author {
                kind: AuthorKind::Organization,
                id: org.to_string(),
            }),
            (None, Some(user)) => Some(Author {
                kind: AuthorKind::User,
                id: user.to_string(),
            }),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub url: String,
    pub urlhash: String,
}

impl Resource {
    /// Resource whose hash is derived from `url`.
    pub fn with_url(id: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            id: id.into(),
            urlhash: crate::resolver::hash_url(&url),
            url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub slug: String,
    pub organization: Option<String>,
    pub owner: Option<String>,
    pub resources: Vec<Resource>,
}

impl Dataset {
    pub fn author(&self) -> Option<Author> {
        Author::of(self.organization.as_deref(), self.owner.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityResource {
    pub id: String,
    pub dataset: Option<String>,
    pub organization: Option<String>,
    pub owner: Option<String>,
    pub url: String,
    pub urlhash: String,
}

impl CommunityResource {
    pub fn author(&self) -> Option<Author> {
        Author::of(self.organization.as_deref(), self.owner.as_deref())
    }
}

/// Flat view of any entity, as returned by id/slug lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_type: EntityType,
    pub id: String,
    pub slug: Option<String>,
    pub organization: Option<String>,
    pub owner: Option<String>,
    pub dataset: Option<String>,
}

impl EntityRecord {
    pub fn author(&self) -> Option<Author> {
        Author::of(self.organization.as_deref(), self.owner.as_deref())
    }

    pub fn entity_ref(&self) -> EntityRef {
        let parent = match self.entity_type {
            EntityType::Resource | EntityType::CommunityResource => self.dataset.clone(),
            EntityType::Dataset | EntityType::Reuse => self.organization.clone(),
            EntityType::Organization | EntityType::User => None,
        };
        EntityRef::new(self.entity_type, self.id.clone()).with_parent(parent)
    }
}

/// Denormalized counters cached on entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricField {
    Views,
    DatasetViews,
    ReuseViews,
    ResourceDownloads,
}

impl MetricField {
    pub const fn column(&self) -> &'static str {
        match self {
            MetricField::Views => "views",
            MetricField::DatasetViews => "dataset_views",
            MetricField::ReuseViews => "reuse_views",
            MetricField::ResourceDownloads => "resource_downloads",
        }
    }
}

/// How a cached counter write interacts with the domain layer's save hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveOptions {
    pub suppress_side_effects: bool,
}

impl SaveOptions {
    /// Cache refresh: no "on save" side effects.
    pub const QUIET: SaveOptions = SaveOptions {
        suppress_side_effects: true,
    };

    pub const NORMAL: SaveOptions = SaveOptions {
        suppress_side_effects: false,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_round_trips_through_str() {
        for entity_type in EntityType::ALL {
            assert_eq!(entity_type.as_str().parse::<EntityType>(), Ok(entity_type));
        }
        assert_eq!("community-resource".parse(), Ok(EntityType::CommunityResource));
        assert!("post".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_author_prefers_organization() {
        let author = Author::of(Some("org-1"), Some("user-1")).unwrap();
        assert_eq!(author.kind, AuthorKind::Organization);

        let author = Author::of(None, Some("user-1")).unwrap();
        assert_eq!(author.kind, AuthorKind::User);
        assert_eq!(author.id, "user-1");

        assert!(Author::of(None, None).is_none());
    }

    #[test]
    fn test_entity_ref_parent() {
        let record = EntityRecord {
            entity_type: EntityType::Resource,
            id: "r1".into(),
            slug: None,
            organization: Some("org".into()),
            owner: None,
            dataset: Some("d1".into()),
        };
        assert_eq!(record.entity_ref().parent_id.as_deref(), Some("d1"));
    }
}
