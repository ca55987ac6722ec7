//! Tracked URL to domain entity resolution
//!
//! Page views are resolved by reverse routing against the application's URL
//! scheme. Downloads are resolved by stable permalink first, then by URL
//! hash, fanning out to every resource sharing the URL.

pub mod hash;
pub mod router;

use moka::future::Cache;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::catalog::{Catalog, CatalogError};
use crate::config::ResolverConfig;
use crate::models::{Author, CommunityResource, Dataset, EntityRef, EntityType, Resource};

pub use hash::{hash_url, permalink_id};
pub use router::{PatternRouter, RouteError, RouteMatch, Router, DEFAULT_ROUTES};

/// Redirects followed while reverse routing a view URL.
const MAX_REDIRECTS: usize = 1;

/// View endpoints identifying a tracked entity, with the route parameter
/// carrying its id or slug.
pub const VIEW_ENDPOINTS: &[(&str, EntityType, &str)] = &[
    ("datasets.show", EntityType::Dataset, "dataset"),
    ("reuses.show", EntityType::Reuse, "reuse"),
    ("organizations.show", EntityType::Organization, "org"),
    ("users.show", EntityType::User, "user"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowKind {
    View,
    Download,
}

/// One entity a tracked URL was attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetMatch {
    pub target: EntityRef,
    pub author: Option<Author>,
    /// Matched through a stable permalink rather than the content URL.
    pub latest_url_alias: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedTarget {
    Entity(TargetMatch),
    /// Several entities legitimately share the URL; each gets the full count.
    Ambiguous(Vec<TargetMatch>),
    Unresolved,
}

impl ResolvedTarget {
    pub fn from_matches(mut matches: Vec<TargetMatch>) -> Self {
        match matches.len() {
            0 => ResolvedTarget::Unresolved,
            1 => ResolvedTarget::Entity(matches.remove(0)),
            _ => ResolvedTarget::Ambiguous(matches),
        }
    }

    pub fn matches(&self) -> &[TargetMatch] {
        match self {
            ResolvedTarget::Entity(single) => std::slice::from_ref(single),
            ResolvedTarget::Ambiguous(all) => all,
            ResolvedTarget::Unresolved => &[],
        }
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self, ResolvedTarget::Unresolved)
    }
}

/// Failure to run a lookup, as opposed to a lookup that found nothing.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("entity lookup failed: {0}")]
    Lookup(#[from] CatalogError),
}

pub struct UrlResolver {
    router: Arc<dyn Router>,
    catalog: Arc<dyn Catalog>,
    server_name: String,
    endpoints: HashMap<String, (EntityType, String)>,
    cache: Cache<(RowKind, String), ResolvedTarget>,
}

impl UrlResolver {
    pub fn new(
        router: Arc<dyn Router>,
        catalog: Arc<dyn Catalog>,
        server_name: impl Into<String>,
        config: &ResolverConfig,
    ) -> Self {
        let endpoints = VIEW_ENDPOINTS
            .iter()
            .map(|(endpoint, entity_type, param)| {
                (endpoint.to_string(), (*entity_type, param.to_string()))
            })
            .collect();

        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(Duration::from_secs(config.cache_ttl_secs))
            .build();

        Self {
            router,
            catalog,
            server_name: server_name.into().to_lowercase(),
            endpoints,
            cache,
        }
    }

    /// Track views of another endpoint.
    pub fn with_endpoint(mut self, endpoint: &str, entity_type: EntityType, param: &str) -> Self {
        self.endpoints
            .insert(endpoint.to_string(), (entity_type, param.to_string()));
        self
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// Resolve `url` reported as a row of `kind`.
    ///
    /// URLs matching nothing are `Ok(ResolvedTarget::Unresolved)`; errors
    /// only come from the lookup backend.
    pub async fn resolve(&self, url: &str, kind: RowKind) -> Result<ResolvedTarget, ResolveError> {
        let key = (kind, url.to_string());
        if let Some(hit) = self.cache.get(&key).await {
            return Ok(hit);
        }

        let resolved = match kind {
            RowKind::View => self.resolve_view(url).await?,
            RowKind::Download => self.resolve_download(url).await?,
        };

        self.cache.insert(key, resolved.clone()).await;
        Ok(resolved)
    }

    fn host_matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let netloc = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        netloc == self.server_name
    }

    fn parse_view_url(&self, raw: &str) -> Option<Url> {
        match Url::parse(raw.trim()) {
            Ok(url) => Some(url),
            // Path-only URLs belong to the application
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = Url::parse(&format!("http://{}/", self.server_name)).ok()?;
                base.join(raw.trim()).ok()
            }
            Err(_) => None,
        }
    }

    async fn resolve_view(&self, raw: &str) -> Result<ResolvedTarget, ResolveError> {
        let Some(mut url) = self.parse_view_url(raw) else {
            debug!("Unparsable view URL {}", raw);
            return Ok(ResolvedTarget::Unresolved);
        };

        let mut redirects = 0;
        loop {
            if !self.host_matches(&url) {
                debug!("Ignoring view on foreign host: {}", url);
                return Ok(ResolvedTarget::Unresolved);
            }

            match self.router.match_route(&url) {
                RouteMatch::Matched { endpoint, params } => {
                    return self.view_target(&endpoint, &params, raw).await;
                }
                RouteMatch::NotFound => {
                    debug!("No route for {}", raw);
                    return Ok(ResolvedTarget::Unresolved);
                }
                RouteMatch::Redirect(next) => {
                    if redirects == MAX_REDIRECTS {
                        warn!("Giving up on {} after {} redirect(s)", raw, redirects);
                        return Ok(ResolvedTarget::Unresolved);
                    }
                    redirects += 1;
                    debug!("Following redirect {} -> {}", url, next);
                    url = next;
                }
            }
        }
    }

    async fn view_target(
        &self,
        endpoint: &str,
        params: &HashMap<String, String>,
        raw: &str,
    ) -> Result<ResolvedTarget, ResolveError> {
        let Some((entity_type, param)) = self.endpoints.get(endpoint) else {
            debug!("Endpoint {} is not tracked ({})", endpoint, raw);
            return Ok(ResolvedTarget::Unresolved);
        };
        let Some(key) = params.get(param) else {
            return Ok(ResolvedTarget::Unresolved);
        };

        match self.catalog.find_by_id(*entity_type, key).await? {
            Some(record) => {
                debug!("Found matching route {} for {}", endpoint, raw);
                Ok(ResolvedTarget::Entity(TargetMatch {
                    target: record.entity_ref(),
                    author: record.author(),
                    latest_url_alias: false,
                }))
            }
            None => {
                debug!("No {} matching '{}' ({})", entity_type, key, raw);
                Ok(ResolvedTarget::Unresolved)
            }
        }
    }

    async fn resolve_download(&self, raw: &str) -> Result<ResolvedTarget, ResolveError> {
        if let Some(id) = permalink_id(raw) {
            if let Some(found) = self.permalink_target(&id.to_string()).await? {
                debug!("Found permalink download: {}", raw);
                return Ok(ResolvedTarget::Entity(found));
            }
            warn!("Permalink {} matches no resource, trying its URL hash", raw);
        }

        let hashed = hash_url(raw);
        let mut matches = Vec::new();

        for dataset in self.catalog.find_datasets_by_resource_url_hash(&hashed).await? {
            for resource in dataset.resources.iter().filter(|r| r.urlhash == hashed) {
                matches.push(resource_match(&dataset, resource, false));
            }
        }
        for resource in self
            .catalog
            .find_community_resources_by_url_hash(&hashed)
            .await?
        {
            matches.push(community_resource_match(&resource, false));
        }

        if matches.is_empty() {
            debug!("No resource for download {}", raw);
        } else {
            debug!("Found {} resource(s) for download {}", matches.len(), raw);
        }
        Ok(ResolvedTarget::from_matches(matches))
    }

    async fn permalink_target(&self, id: &str) -> Result<Option<TargetMatch>, ResolveError> {
        if let Some(dataset) = self.catalog.find_dataset_by_resource_id(id).await? {
            if let Some(resource) = dataset.resources.iter().find(|r| r.id == id) {
                return Ok(Some(resource_match(&dataset, resource, true)));
            }
        }

        Ok(self
            .catalog
            .find_community_resource_by_id(id)
            .await?
            .map(|resource| community_resource_match(&resource, true)))
    }
}

fn resource_match(dataset: &Dataset, resource: &Resource, latest_url_alias: bool) -> TargetMatch {
    TargetMatch {
        target: EntityRef::new(EntityType::Resource, resource.id.clone())
            .with_parent(Some(dataset.id.clone())),
        author: dataset.author(),
        latest_url_alias,
    }
}

fn community_resource_match(resource: &CommunityResource, latest_url_alias: bool) -> TargetMatch {
    TargetMatch {
        target: EntityRef::new(EntityType::CommunityResource, resource.id.clone())
            .with_parent(resource.dataset.clone()),
        author: resource.author(),
        latest_url_alias,
    }
}
