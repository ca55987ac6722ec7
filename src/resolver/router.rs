//! Reverse routing: from a tracked page URL back to an application endpoint.

use std::collections::HashMap;
use thiserror::Error;
use url::Url;

/// Endpoints of the default application URL scheme.
pub const DEFAULT_ROUTES: &[(&str, &str)] = &[
    ("datasets.show", "/datasets/<dataset>/"),
    ("reuses.show", "/reuses/<reuse>/"),
    ("organizations.show", "/organizations/<org>/"),
    ("users.show", "/users/<user>/"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMatch {
    Matched {
        endpoint: String,
        params: HashMap<String, String>,
    },
    NotFound,
    /// The route layer would answer with a redirect to this URL.
    Redirect(Url),
}

/// URL matching capability.
pub trait Router: Send + Sync {
    fn match_route(&self, url: &Url) -> RouteMatch;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("invalid route template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone)]
struct RoutePattern {
    endpoint: String,
    segments: Vec<Segment>,
    trailing_slash: bool,
}

impl RoutePattern {
    fn parse(endpoint: &str, template: &str) -> Result<Self, RouteError> {
        let invalid = |reason: &str| RouteError::InvalidTemplate {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        if !template.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }

        let trailing_slash = template.len() > 1 && template.ends_with('/');
        let body = template.trim_matches('/');
        let mut segments = Vec::new();

        if !body.is_empty() {
            for part in body.split('/') {
                if part.is_empty() {
                    return Err(invalid("empty path segment"));
                }
                match part.strip_prefix('<').and_then(|p| p.strip_suffix('>')) {
                    Some("") => return Err(invalid("unnamed parameter")),
                    Some(name) => segments.push(Segment::Param(name.to_string())),
                    None if part.contains(['<', '>']) => {
                        return Err(invalid("parameters must span a whole segment"))
                    }
                    None => segments.push(Segment::Literal(part.to_string())),
                }
            }
        }

        Ok(Self {
            endpoint: endpoint.to_string(),
            segments,
            trailing_slash,
        })
    }

    fn capture(&self, parts: &[&str]) -> Option<HashMap<String, String>> {
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), (*part).to_string());
                }
            }
        }
        Some(params)
    }
}

/// Router matching paths against `/literal/<param>/` templates.
///
/// Templates ending with a slash are strict: the same path without the
/// trailing slash redirects to the canonical form, the way web frameworks
/// usually do.
#[derive(Debug, Clone, Default)]
pub struct PatternRouter {
    routes: Vec<RoutePattern>,
}

impl PatternRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Router over [`DEFAULT_ROUTES`], each template prefixed with `prefix`.
    pub fn with_default_routes(prefix: &str) -> Result<Self, RouteError> {
        let prefix = prefix.trim_end_matches('/');
        DEFAULT_ROUTES
            .iter()
            .try_fold(Self::new(), |router, (endpoint, template)| {
                router.route(endpoint, &format!("{prefix}{template}"))
            })
    }

    pub fn route(mut self, endpoint: &str, template: &str) -> Result<Self, RouteError> {
        self.routes.push(RoutePattern::parse(endpoint, template)?);
        Ok(self)
    }
}

impl Router for PatternRouter {
    fn match_route(&self, url: &Url) -> RouteMatch {
        let path = url.path();
        let has_trailing_slash = path.len() > 1 && path.ends_with('/');
        let body = path.trim_matches('/');
        let parts: Vec<&str> = if body.is_empty() {
            Vec::new()
        } else {
            body.split('/').collect()
        };

        for route in &self.routes {
            let Some(params) = route.capture(&parts) else {
                continue;
            };

            match (route.trailing_slash, has_trailing_slash) {
                (true, false) => {
                    let mut canonical = url.clone();
                    canonical.set_path(&format!("{path}/"));
                    return RouteMatch::Redirect(canonical);
                }
                (false, true) => continue,
                _ => {
                    return RouteMatch::Matched {
                        endpoint: route.endpoint.clone(),
                        params,
                    }
                }
            }
        }

        RouteMatch::NotFound
    }
}
