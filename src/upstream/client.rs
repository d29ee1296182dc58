use std::num::NonZeroU32;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use rand::Rng;
use serde_json::Value;

use crate::config::Config;

use super::{
    PaperApi, RelationKind, RelationPage, SearchFilters, SearchPage, UpstreamError,
};

/// HTTP client for the Semantic Scholar graph API with token-bucket
/// admission and bounded, jittered retries.
pub struct GraphApiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    limiter: DefaultDirectRateLimiter,
    retry_max_attempts: u32,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
}

impl GraphApiClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("scholar-proxy/0.1")
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let rps = NonZeroU32::new(config.rate_limit_rps.max(1)).unwrap_or(NonZeroU32::MIN);
        let limiter = RateLimiter::direct(Quota::per_second(rps));

        Ok(Self {
            client,
            base_url: config.upstream_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            limiter,
            retry_max_attempts: config.retry_max_attempts.max(1),
            retry_base_delay: config.retry_base_delay,
            retry_max_delay: config.retry_max_delay,
        })
    }

    fn url_for(&self, segments: &[&str]) -> Result<url::Url, UpstreamError> {
        let mut url = url::Url::parse(&self.base_url)
            .map_err(|e| UpstreamError::Transport(format!("bad base url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| UpstreamError::Transport("base url cannot be a base".to_string()))?
            .extend(segments);
        Ok(url)
    }

    fn add_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("x-api-key", key),
            None => req,
        }
    }

    /// One admission-gated attempt, no retries.
    async fn send_once(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<Value, UpstreamError> {
        self.limiter.until_ready().await;
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return resp.json().await.map_err(UpstreamError::from);
        }
        match status.as_u16() {
            404 => Err(UpstreamError::NotFound),
            429 => {
                let retry_after_secs = resp
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                Err(UpstreamError::RateLimited { retry_after_secs })
            }
            401 | 403 => Err(UpstreamError::Unauthorized),
            400 => {
                let text = resp.text().await.unwrap_or_default();
                Err(UpstreamError::BadRequest(text))
            }
            500..=599 => Err(UpstreamError::Unavailable(format!("upstream returned {}", status))),
            _ => {
                let text = resp.text().await.unwrap_or_default();
                Err(UpstreamError::Transport(format!("unexpected status {}: {}", status, text)))
            }
        }
    }

    /// Retry transient failures with exponential backoff and jitter,
    /// honoring any Retry-After hint.
    async fn send_with_retries<F>(&self, build: F) -> Result<Value, UpstreamError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(self.add_auth(build())).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.retry_max_attempts => {
                    let delay = self.backoff_delay(attempt, &err);
                    tracing::warn!(
                        "Upstream attempt {} failed: {}; retrying in {:?}",
                        attempt,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32, err: &UpstreamError) -> Duration {
        if let UpstreamError::RateLimited { retry_after_secs } = err {
            if *retry_after_secs > 0 {
                return Duration::from_secs(*retry_after_secs);
            }
        }
        let exp = self
            .retry_base_delay
            .saturating_mul(1u32 << (attempt - 1).min(16));
        let capped = exp.min(self.retry_max_delay);
        let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 2 + 1);
        capped + Duration::from_millis(jitter_ms)
    }
}

/// Prefix neighbor paper fields with the nested key the relation endpoint
/// expects; edge attributes stay top-level.
fn relation_fields_param(kind: RelationKind, fields: &str) -> String {
    fields
        .split(',')
        .map(|f| {
            let f = f.trim();
            if matches!(f, "contexts" | "intents" | "isInfluential") {
                f.to_string()
            } else {
                format!("{}.{}", kind.nested_key(), f)
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Flatten a relation edge object into a neighbor summary carrying the edge
/// attributes inline.
fn flatten_relation_item(item: &Value, kind: RelationKind) -> Option<Value> {
    let mut paper = match item.get(kind.nested_key()) {
        Some(Value::Object(m)) => m.clone(),
        _ => return None,
    };
    for attr in ["contexts", "intents", "isInfluential"] {
        if let Some(v) = item.get(attr) {
            if !v.is_null() {
                paper.insert(attr.to_string(), v.clone());
            }
        }
    }
    Some(Value::Object(paper))
}

fn parse_u64(value: Option<&Value>) -> Option<u64> {
    value.and_then(Value::as_u64)
}

#[async_trait]
impl PaperApi for GraphApiClient {
    async fn fetch_paper(&self, paper_ref: &str, fields: &str) -> Result<Value, UpstreamError> {
        let url = self.url_for(&["paper", paper_ref])?;
        self.send_with_retries(|| {
            self.client
                .get(url.clone())
                .query(&[("fields", fields)])
        })
        .await
    }

    async fn fetch_relation_page(
        &self,
        paper_id: &str,
        kind: RelationKind,
        offset: u64,
        limit: u64,
        fields: &str,
    ) -> Result<RelationPage, UpstreamError> {
        let url = self.url_for(&["paper", paper_id, kind.as_str()])?;
        let fields_param = relation_fields_param(kind, fields);
        let value = self
            .send_with_retries(|| {
                self.client.get(url.clone()).query(&[
                    ("offset", offset.to_string()),
                    ("limit", limit.to_string()),
                    ("fields", fields_param.clone()),
                ])
            })
            .await?;

        let items: Vec<Value> = value
            .get("data")
            .and_then(Value::as_array)
            .map(|data| {
                data.iter()
                    .filter_map(|item| flatten_relation_item(item, kind))
                    .collect()
            })
            .unwrap_or_default();
        let got_offset = parse_u64(value.get("offset")).unwrap_or(offset);
        let next = parse_u64(value.get("next"));
        let total =
            parse_u64(value.get("total")).unwrap_or(got_offset + items.len() as u64);
        Ok(RelationPage { total, offset: got_offset, next, items })
    }

    async fn fetch_batch(
        &self,
        paper_refs: &[String],
        fields: &str,
    ) -> Result<Vec<Option<Value>>, UpstreamError> {
        let url = self.url_for(&["paper", "batch"])?;
        let body = serde_json::json!({ "ids": paper_refs });
        let value = self
            .send_with_retries(|| {
                self.client
                    .post(url.clone())
                    .query(&[("fields", fields)])
                    .json(&body)
            })
            .await?;
        let entries = value
            .as_array()
            .ok_or_else(|| UpstreamError::Transport("batch response is not an array".into()))?;
        Ok(entries
            .iter()
            .map(|e| if e.is_null() { None } else { Some(e.clone()) })
            .collect())
    }

    async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        offset: u64,
        limit: u64,
        fields: &str,
    ) -> Result<SearchPage, UpstreamError> {
        let url = self.url_for(&["paper", "search"])?;
        let mut params: Vec<(&str, String)> = vec![
            ("query", query.to_string()),
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
            ("fields", fields.to_string()),
        ];
        params.extend(filters.to_query());
        let value = self
            .send_with_retries(|| self.client.get(url.clone()).query(&params))
            .await?;
        let items = value
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let got_offset = parse_u64(value.get("offset")).unwrap_or(offset);
        Ok(SearchPage {
            total: parse_u64(value.get("total")).unwrap_or(items.len() as u64),
            offset: got_offset,
            next: parse_u64(value.get("next")),
            items,
        })
    }

    async fn match_title(&self, query: &str, fields: &str) -> Result<Value, UpstreamError> {
        let url = self.url_for(&["paper", "search", "match"])?;
        let value = self
            .send_with_retries(|| {
                self.client
                    .get(url.clone())
                    .query(&[("query", query), ("fields", fields)])
            })
            .await?;
        // The match endpoint wraps the single best hit in a `data` array.
        match value.get("data").and_then(Value::as_array) {
            Some(data) => data.first().cloned().ok_or(UpstreamError::NotFound),
            None => Ok(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: &str) -> Config {
        let mut cfg = Config::from_env();
        cfg.upstream_base_url = base_url.to_string();
        cfg.api_key = None;
        cfg.rate_limit_rps = 1000;
        cfg.retry_max_attempts = 3;
        cfg.retry_base_delay = Duration::from_millis(1);
        cfg.retry_max_delay = Duration::from_millis(5);
        cfg
    }

    #[tokio::test]
    async fn test_fetch_paper_parses_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/paper/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "paperId": "abc",
                "title": "A Paper"
            })))
            .mount(&server)
            .await;

        let client = GraphApiClient::new(&test_config(&server.uri())).unwrap();
        let paper = client.fetch_paper("abc", "paperId,title").await.unwrap();
        assert_eq!(paper["title"], "A Paper");
    }

    #[tokio::test]
    async fn test_404_is_not_found_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/paper/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = GraphApiClient::new(&test_config(&server.uri())).unwrap();
        let err = client.fetch_paper("missing", "title").await.unwrap_err();
        assert!(matches!(err, UpstreamError::NotFound));
    }

    #[tokio::test]
    async fn test_5xx_retried_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/paper/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/paper/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "paperId": "flaky", "title": "Recovered"
            })))
            .mount(&server)
            .await;

        let client = GraphApiClient::new(&test_config(&server.uri())).unwrap();
        let paper = client.fetch_paper("flaky", "title").await.unwrap();
        assert_eq!(paper["title"], "Recovered");
    }

    #[tokio::test]
    async fn test_batch_preserves_positions() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/paper/batch"))
            .and(body_partial_json(json!({"ids": ["a", "b", "c"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"paperId": "a", "title": "First"},
                null,
                {"paperId": "c", "title": "Third"}
            ])))
            .mount(&server)
            .await;

        let client = GraphApiClient::new(&test_config(&server.uri())).unwrap();
        let got = client
            .fetch_batch(
                &["a".to_string(), "b".to_string(), "c".to_string()],
                "title",
            )
            .await
            .unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].as_ref().unwrap()["title"], "First");
        assert!(got[1].is_none());
        assert_eq!(got[2].as_ref().unwrap()["paperId"], "c");
    }

    #[tokio::test]
    async fn test_relation_page_flattened() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/paper/abc/citations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "offset": 0,
                "next": 2,
                "total": 5,
                "data": [
                    {"isInfluential": true, "contexts": ["ctx"],
                     "citingPaper": {"paperId": "n1", "title": "Neighbor One"}},
                    {"isInfluential": false,
                     "citingPaper": {"paperId": "n2", "title": "Neighbor Two"}}
                ]
            })))
            .mount(&server)
            .await;

        let client = GraphApiClient::new(&test_config(&server.uri())).unwrap();
        let page = client
            .fetch_relation_page("abc", RelationKind::Citations, 0, 2, "paperId,title")
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.next, Some(2));
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0]["paperId"], "n1");
        assert_eq!(page.items[0]["isInfluential"], true);
        assert!(page.items[1].get("contexts").is_none());
    }

    #[test]
    fn test_relation_fields_param() {
        let param = relation_fields_param(RelationKind::References, "paperId,title,isInfluential");
        assert_eq!(param, "citedPaper.paperId,citedPaper.title,isInfluential");
    }
}
