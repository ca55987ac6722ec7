use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub analytics: AnalyticsConfig,
    pub site: SiteConfig,
    pub database: DatabaseConfig,
    pub resolver: ResolverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    pub scheme: String,
    /// Host (and optional path) of the analytics engine, without scheme
    pub url: String,
    pub site_id: u32,
    pub token_auth: Option<String>,
    pub report_timeout_secs: u64,
    pub track_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// `host[:port]` the tracked pages are served from
    pub server_name: String,
    /// Optional prefix prepended to every route template, e.g. `/<lang>`
    pub route_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: String,
    pub catalog_url: String,
    pub max_connections: u32,
    pub write_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    pub cache_capacity: u64,
    pub cache_ttl_secs: u64,
}

impl AnalyticsConfig {
    pub const fn default_report_timeout_secs() -> u64 {
        300
    }

    pub const fn default_track_timeout_secs() -> u64 {
        60
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.url.trim_end_matches('/'))
    }

    pub fn report_timeout(&self) -> Duration {
        Duration::from_secs(self.report_timeout_secs)
    }

    pub fn track_timeout(&self) -> Duration {
        Duration::from_secs(self.track_timeout_secs)
    }
}

impl DatabaseConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            cache_ttl_secs: 300,
        }
    }
}

fn env_or_parse<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{name} has an invalid value '{raw}'")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let analytics_url =
            std::env::var("ANALYTICS_URL").context("ANALYTICS_URL must be set")?;
        let scheme = std::env::var("ANALYTICS_SCHEME")
            .unwrap_or_else(|_| "http".to_string())
            .to_lowercase();
        if scheme != "http" && scheme != "https" {
            anyhow::bail!("ANALYTICS_SCHEME must be 'http' or 'https', got '{scheme}'");
        }
        let token_auth = std::env::var("ANALYTICS_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());

        let server_name = std::env::var("SERVER_NAME").context("SERVER_NAME must be set")?;
        let route_prefix = std::env::var("ROUTE_PREFIX").unwrap_or_default();

        let backend_str =
            std::env::var("DATABASE_BACKEND").unwrap_or_else(|_| "sqlite".to_string());
        let backend = match backend_str.to_lowercase().as_str() {
            "postgres" | "postgresql" => DatabaseBackend::Postgres,
            "sqlite" => DatabaseBackend::Sqlite,
            other => {
                tracing::warn!(
                    "Unknown DATABASE_BACKEND '{other}', falling back to 'sqlite'. Supported values: sqlite, postgres"
                );
                DatabaseBackend::Sqlite
            }
        };

        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://./tally.db".to_string());
        let catalog_url =
            std::env::var("CATALOG_DATABASE_URL").unwrap_or_else(|_| database_url.clone());

        let defaults = ResolverConfig::default();

        Ok(Config {
            analytics: AnalyticsConfig {
                scheme,
                url: analytics_url,
                site_id: env_or_parse("ANALYTICS_SITE_ID", 1)?,
                token_auth,
                report_timeout_secs: env_or_parse(
                    "ANALYTICS_REPORT_TIMEOUT_SECS",
                    AnalyticsConfig::default_report_timeout_secs(),
                )?,
                track_timeout_secs: env_or_parse(
                    "ANALYTICS_TRACK_TIMEOUT_SECS",
                    AnalyticsConfig::default_track_timeout_secs(),
                )?,
            },
            site: SiteConfig {
                server_name,
                route_prefix,
            },
            database: DatabaseConfig {
                backend,
                url: database_url,
                catalog_url,
                max_connections: env_or_parse("DATABASE_MAX_CONNECTIONS", 5)?,
                write_timeout_secs: env_or_parse("METRICS_WRITE_TIMEOUT_SECS", 60)?,
            },
            resolver: ResolverConfig {
                cache_capacity: env_or_parse("RESOLVER_CACHE_CAPACITY", defaults.cache_capacity)?,
                cache_ttl_secs: env_or_parse("RESOLVER_CACHE_TTL_SECS", defaults.cache_ttl_secs)?,
            },
        })
    }
}
