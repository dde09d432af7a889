//! Generic JSON search collector over HTTP.
//!
//! Issues `GET {base_url}?query=<terms>&year=<year>&limit=<n>` and accepts a
//! top-level array or an object wrapping the array in `data`, `results` or
//! `items`. Each element's `title` becomes the record title; every other key
//! is kept as a field.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;

use super::error::CollectorError;
use super::{CollectorAdapter, RawRecord};
use crate::config::SourceConfig;
use crate::work::SearchQuery;

const WRAPPER_KEYS: &[&str] = &["data", "results", "items"];

pub struct HttpCollector {
    client: Client,
    base_url: String,
    api_key: Option<(String, String)>,
}

impl HttpCollector {
    pub fn new(base_url: impl Into<String>) -> Result<Self, CollectorError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: None,
        })
    }

    /// Send `key` in the `header` request header on every call.
    pub fn with_api_key(mut self, header: impl Into<String>, key: impl Into<String>) -> Self {
        self.api_key = Some((header.into(), key.into()));
        self
    }

    /// Build a collector from `[sources.<name>]`, or `None` if it has no `base_url`.
    pub fn from_config(source: &SourceConfig) -> Result<Option<Self>, CollectorError> {
        let Some(base_url) = &source.base_url else {
            return Ok(None);
        };
        let mut collector = Self::new(base_url.clone())?;
        if let Some(var) = &source.api_key_env
            && let Ok(key) = std::env::var(var)
            && !key.is_empty()
        {
            collector = collector.with_api_key(source.api_key_header.clone(), key);
        }
        Ok(Some(collector))
    }

    async fn fetch(&self, query: &SearchQuery) -> Result<Vec<RawRecord>, CollectorError> {
        let mut params = vec![
            ("query", query.terms.clone()),
            ("limit", query.max_results.to_string()),
        ];
        if let Some(year) = query.year {
            params.push(("year", year.to_string()));
        }

        let mut request = self.client.get(&self.base_url).query(&params);
        if let Some((header, key)) = &self.api_key {
            request = request.header(header.as_str(), key.as_str());
        }

        let response = request.send().await.map_err(classify_send_error)?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            return Err(CollectorError::RateLimited { retry_after_ms });
        }

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            let message = format!("HTTP {}: {}", status.as_u16(), body.trim());
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CollectorError::Offline(message),
                StatusCode::REQUEST_TIMEOUT => CollectorError::Transient(message),
                s if s.is_server_error() => CollectorError::Transient(message),
                _ => CollectorError::Rejected(message),
            });
        }

        let body = response.text().await.map_err(classify_send_error)?;
        let records = parse_records(&body)?;
        debug!(source = %query.source, terms = %query.terms, count = records.len(), "search returned");
        Ok(records)
    }
}

impl CollectorAdapter for HttpCollector {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<RawRecord>, CollectorError> {
        self.fetch(query).await
    }
}

fn classify_send_error(err: reqwest::Error) -> CollectorError {
    if err.is_timeout() || err.is_connect() {
        CollectorError::Transient(err.to_string())
    } else {
        CollectorError::Network(err)
    }
}

fn parse_records(body: &str) -> Result<Vec<RawRecord>, CollectorError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| CollectorError::Rejected(format!("malformed response body: {e}")))?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => WRAPPER_KEYS
            .iter()
            .find_map(|key| match obj.remove(*key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .ok_or_else(|| CollectorError::Rejected("response has no record array".into()))?,
        _ => return Err(CollectorError::Rejected("unexpected response shape".into())),
    };

    Ok(items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(mut obj) => {
                let title = match obj.remove("title") {
                    Some(Value::String(title)) => title,
                    _ => return None,
                };
                let fields: BTreeMap<String, Value> = obj.into_iter().collect();
                Some(RawRecord { title, fields })
            }
            _ => None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn query() -> SearchQuery {
        SearchQuery {
            source: "openalex".into(),
            terms: "graph neural networks".into(),
            year: Some(2022),
            max_results: 25,
        }
    }

    #[tokio::test]
    async fn parses_wrapped_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("query", "graph neural networks"))
            .and(query_param("year", "2022"))
            .and(query_param("limit", "25"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    {"title": "GNNs at scale", "doi": "10.1/abc", "year": 2022},
                    {"title": "Message passing revisited"},
                    {"no_title": true}
                ]
            })))
            .mount(&server)
            .await;

        let collector = HttpCollector::new(format!("{}/search", server.uri())).unwrap();
        let records = collector.search(&query()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].title, "GNNs at scale");
        assert_eq!(records[0].fields["doi"], json!("10.1/abc"));
        assert!(!records[0].fields.contains_key("title"));
    }

    #[tokio::test]
    async fn sends_api_key_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("x-api-key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"title": "A"}])))
            .mount(&server)
            .await;

        let collector = HttpCollector::new(server.uri())
            .unwrap()
            .with_api_key("x-api-key", "secret");
        assert_eq!(collector.search(&query()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn too_many_requests_maps_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
            .mount(&server)
            .await;

        let collector = HttpCollector::new(server.uri()).unwrap();
        let err = collector.search(&query()).await.unwrap_err();
        assert!(matches!(
            err,
            CollectorError::RateLimited {
                retry_after_ms: Some(2000)
            }
        ));
    }

    #[tokio::test]
    async fn forbidden_maps_to_offline() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("quota exhausted"))
            .mount(&server)
            .await;

        let collector = HttpCollector::new(server.uri()).unwrap();
        let err = collector.search(&query()).await.unwrap_err();
        assert!(matches!(err, CollectorError::Offline(msg) if msg.contains("quota exhausted")));
    }

    #[tokio::test]
    async fn server_error_is_transient_and_bad_request_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("query", "flaky"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("query", "broken"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let collector = HttpCollector::new(server.uri()).unwrap();
        let mut q = query();
        q.terms = "flaky".into();
        assert!(matches!(
            collector.search(&q).await.unwrap_err(),
            CollectorError::Transient(_)
        ));
        q.terms = "broken".into();
        assert!(matches!(
            collector.search(&q).await.unwrap_err(),
            CollectorError::Rejected(_)
        ));
    }

    #[test]
    fn malformed_body_is_rejected() {
        assert!(matches!(
            parse_records("not json"),
            Err(CollectorError::Rejected(_))
        ));
        assert!(matches!(
            parse_records(r#"{"total": 3}"#),
            Err(CollectorError::Rejected(_))
        ));
    }

    #[test]
    fn from_config_without_base_url_is_none() {
        let cfg = SourceConfig::default();
        assert!(HttpCollector::from_config(&cfg).unwrap().is_none());
    }
}
