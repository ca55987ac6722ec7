//! Analytics engine HTTP client
//!
//! Fetches daily report trees from the reporting API and submits tracking
//! requests, one at a time or in bulk.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::AnalyticsConfig;
use crate::models::{day_key, RawReportRow};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("analytics request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("analytics engine answered with status {0}")]
    Status(StatusCode),
    /// The engine understood the request and refused it (bad token, unknown site...).
    #[error("analytics engine rejected the request: {0}")]
    Rejected(String),
    #[error("unexpected analytics payload: {0}")]
    Decode(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Report types consumed by the aggregation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Report {
    PageUrls,
    Downloads,
    Outlinks,
}

impl Report {
    pub const fn method(&self) -> &'static str {
        match self {
            Report::PageUrls => "Actions.getPageUrls",
            Report::Downloads => "Actions.getDownloads",
            Report::Outlinks => "Actions.getOutlinks",
        }
    }
}

/// Source of daily report trees.
#[async_trait]
pub trait ReportSource: Send + Sync {
    /// Fetch the expanded report tree of `report` for `day`.
    async fn fetch_report(&self, report: Report, day: NaiveDate) -> ClientResult<Vec<RawReportRow>>;
}

/// A tracking request queued for bulk submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackEntry {
    pub url: String,
    pub timestamp: DateTime<Utc>,
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BulkTrackResponse {
    pub status: String,
    #[serde(default)]
    pub tracked: u64,
    #[serde(default)]
    pub invalid: u64,
}

#[derive(Clone)]
pub struct AnalyticsClient {
    client: Client,
    base_url: String,
    site_id: u32,
    token_auth: Option<String>,
    report_timeout: Duration,
    track_timeout: Duration,
}

impl AnalyticsClient {
    pub fn from_config(config: &AnalyticsConfig) -> ClientResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("tally/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url(),
            site_id: config.site_id,
            token_auth: config.token_auth.clone(),
            report_timeout: config.report_timeout(),
            track_timeout: config.track_timeout(),
        })
    }

    fn api_url(&self) -> String {
        format!("{}/index.php", self.base_url)
    }

    fn tracking_url(&self) -> String {
        format!("{}/piwik.php", self.base_url)
    }

    /// Retrieve a JSON report for `method` on `day`.
    ///
    /// An empty report (no data yet) is an empty vector; an explicit error
    /// payload from the engine is [`ClientError::Rejected`].
    pub async fn get_report(
        &self,
        method: &str,
        day: NaiveDate,
        expanded: bool,
    ) -> ClientResult<Vec<RawReportRow>> {
        let mut params: Vec<(&str, String)> = vec![
            ("module", "API".to_string()),
            ("idSite", self.site_id.to_string()),
            ("method", method.to_string()),
            ("format", "json".to_string()),
            ("period", "day".to_string()),
            ("date", day_key(day)),
            ("expanded", u8::from(expanded).to_string()),
        ];
        if let Some(token) = &self.token_auth {
            params.push(("token_auth", token.clone()));
        }

        debug!("Fetching {} report for {}", method, day);

        let response = self
            .client
            .get(self.api_url())
            .query(&params)
            .timeout(self.report_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status(status));
        }

        let payload: Value = response.json().await?;
        parse_report(payload)
    }

    /// Record a single hit on `url`.
    pub async fn track(&self, url: &str, extra: &BTreeMap<String, String>) -> ClientResult<()> {
        let mut form: BTreeMap<String, String> = extra.clone();
        form.insert("rec".to_string(), "1".to_string());
        form.insert("idsite".to_string(), self.site_id.to_string());
        form.insert("url".to_string(), url.to_string());
        if let Some(token) = &self.token_auth {
            form.insert("token_auth".to_string(), token.clone());
        }

        let response = self
            .client
            .post(self.tracking_url())
            .form(&form)
            .timeout(self.track_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status(status));
        }

        Ok(())
    }

    /// Submit several tracking requests in one call.
    ///
    /// Entries must already be sorted chronologically; the engine expects
    /// it and this method does not reorder them.
    pub async fn bulk_track(&self, entries: &[TrackEntry]) -> ClientResult<BulkTrackResponse> {
        let requests: Vec<String> = entries
            .iter()
            .map(|entry| self.encode_bulk_entry(entry))
            .collect();

        let mut body = serde_json::json!({ "requests": requests });
        if let Some(token) = &self.token_auth {
            body["token_auth"] = Value::String(token.clone());
        }

        let response = self
            .client
            .post(self.tracking_url())
            .json(&body)
            .timeout(self.track_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status(status));
        }

        let result: BulkTrackResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        if result.status != "success" {
            return Err(ClientError::Rejected(format!(
                "bulk tracking status '{}'",
                result.status
            )));
        }

        Ok(result)
    }

    fn encode_bulk_entry(&self, entry: &TrackEntry) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query
            .append_pair("idsite", &self.site_id.to_string())
            .append_pair("rec", "1")
            .append_pair("url", &entry.url)
            .append_pair("cdt", &entry.timestamp.timestamp().to_string());
        for (key, value) in &entry.params {
            query.append_pair(key, value);
        }
        format!("?{}", query.finish())
    }
}

#[async_trait]
impl ReportSource for AnalyticsClient {
    async fn fetch_report(&self, report: Report, day: NaiveDate) -> ClientResult<Vec<RawReportRow>> {
        self.get_report(report.method(), day, true).await
    }
}

fn parse_report(payload: Value) -> ClientResult<Vec<RawReportRow>> {
    if let Some(object) = payload.as_object() {
        if object.get("result").and_then(Value::as_str) == Some("error") {
            let message = object
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(ClientError::Rejected(message));
        }
        // Empty reports may come back as `{}`
        if object.is_empty() {
            return Ok(Vec::new());
        }
    }

    serde_json::from_value(payload).map_err(|e| ClientError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, token: Option<&str>) -> AnalyticsClient {
        let address = server.uri().trim_start_matches("http://").to_string();
        AnalyticsClient::from_config(&AnalyticsConfig {
            scheme: "http".to_string(),
            url: address,
            site_id: 3,
            token_auth: token.map(str::to_string),
            report_timeout_secs: 5,
            track_timeout_secs: 5,
        })
        .unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 17).unwrap()
    }

    #[tokio::test]
    async fn test_get_report_sends_expected_query() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/index.php"))
            .and(query_param("module", "API"))
            .and(query_param("idSite", "3"))
            .and(query_param("method", "Actions.getPageUrls"))
            .and(query_param("format", "json"))
            .and(query_param("period", "day"))
            .and(query_param("date", "2024-05-17"))
            .and(query_param("expanded", "1"))
            .and(query_param("token_auth", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"label": "datasets", "nb_hits": 3, "nb_visits": 2, "subtable": [
                    {"label": "/a", "url": "http://site/datasets/a/", "nb_hits": 3, "nb_visits": 2, "nb_uniq_visitors": 1}
                ]}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Some("secret"));
        let rows = client
            .fetch_report(Report::PageUrls, day())
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        let flat = RawReportRow::flatten(&rows);
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].nb_uniq_visitors, 1);
    }

    #[tokio::test]
    async fn test_get_report_distinguishes_engine_errors() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/index.php"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": "error",
                "message": "You can't access this resource"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let err = client
            .get_report("Actions.getDownloads", day(), true)
            .await
            .unwrap_err();

        match err {
            ClientError::Rejected(message) => assert!(message.contains("can't access")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_report_empty_payloads() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/index.php"))
            .and(query_param("method", "Actions.getOutlinks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/index.php"))
            .and(query_param("method", "Actions.getDownloads"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        assert!(client.fetch_report(Report::Outlinks, day()).await.unwrap().is_empty());
        assert!(client.fetch_report(Report::Downloads, day()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_report_http_failure() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/index.php"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let err = client.fetch_report(Report::PageUrls, day()).await.unwrap_err();
        assert!(matches!(err, ClientError::Status(StatusCode::BAD_GATEWAY)));
    }

    #[tokio::test]
    async fn test_track_posts_form() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/piwik.php"))
            .and(body_string_contains("rec=1"))
            .and(body_string_contains("idsite=3"))
            .and(body_string_contains("token_auth=secret"))
            .and(body_string_contains("uid=user-1"))
            .and(body_string_contains("url=https%3A%2F%2Fdata.example.org%2Fapi%2F1%2Fdatasets%2F"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Some("secret"));
        let mut extra = BTreeMap::new();
        extra.insert("uid".to_string(), "user-1".to_string());
        client
            .track("https://data.example.org/api/1/datasets/", &extra)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bulk_track_encodes_sub_requests() {
        let server = MockServer::start().await;
        let first = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let second = DateTime::from_timestamp(1_700_000_060, 0).unwrap();

        Mock::given(method("POST"))
            .and(path("/piwik.php"))
            .and(body_json(json!({
                "token_auth": "secret",
                "requests": [
                    "?idsite=3&rec=1&url=http%3A%2F%2Fsite%2Fa&cdt=1700000000",
                    "?idsite=3&rec=1&url=http%3A%2F%2Fsite%2Fb&cdt=1700000060&uid=u"
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "tracked": 2,
                "invalid": 0
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Some("secret"));
        let mut params = BTreeMap::new();
        params.insert("uid".to_string(), "u".to_string());
        let entries = vec![
            TrackEntry {
                url: "http://site/a".to_string(),
                timestamp: first,
                params: BTreeMap::new(),
            },
            TrackEntry {
                url: "http://site/b".to_string(),
                timestamp: second,
                params,
            },
        ];

        let result = client.bulk_track(&entries).await.unwrap();
        assert_eq!(result.tracked, 2);
    }

    #[test]
    fn test_parse_report_rejects_unknown_shape() {
        let err = parse_report(json!("nope")).unwrap_err();
        assert!(matches!(err, ClientError::Decode(_)));
    }
}
