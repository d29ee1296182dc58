pub mod client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Relation kinds the graph API paginates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    Citations,
    References,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Citations => "citations",
            RelationKind::References => "references",
        }
    }

    /// Key under which the relation endpoint nests the neighbor paper.
    pub fn nested_key(&self) -> &'static str {
        match self {
            RelationKind::Citations => "citingPaper",
            RelationKind::References => "citedPaper",
        }
    }
}

impl std::fmt::Display for RelationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One page of a paginated relation listing. Items are flattened neighbor
/// summaries: the neighbor's paper fields plus `contexts`, `intents` and
/// `isInfluential` edge attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationPage {
    pub total: u64,
    pub offset: u64,
    pub next: Option<u64>,
    pub items: Vec<Value>,
}

/// One page of search results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchPage {
    pub total: u64,
    pub offset: u64,
    pub next: Option<u64>,
    pub items: Vec<Value>,
}

/// Search filters forwarded to the upstream search endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilters {
    pub year: Option<String>,
    pub venue: Option<Vec<String>>,
    pub fields_of_study: Option<Vec<String>>,
    pub publication_types: Option<Vec<String>>,
    pub open_access_pdf: bool,
    pub min_citation_count: Option<u64>,
}

impl SearchFilters {
    /// Query parameters for the upstream request.
    pub fn to_query(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(ref year) = self.year {
            params.push(("year", year.clone()));
        }
        if let Some(ref venues) = self.venue {
            params.push(("venue", venues.join(",")));
        }
        if let Some(ref fos) = self.fields_of_study {
            params.push(("fieldsOfStudy", fos.join(",")));
        }
        if let Some(ref types) = self.publication_types {
            params.push(("publicationTypes", types.join(",")));
        }
        if self.open_access_pdf {
            params.push(("openAccessPdf", String::new()));
        }
        if let Some(min) = self.min_citation_count {
            params.push(("minCitationCount", min.to_string()));
        }
        params
    }

    /// Stable `key=value` pairs for fingerprinting, sorted by key.
    pub fn canonical_pairs(&self) -> Vec<String> {
        let mut pairs: Vec<String> = self
            .to_query()
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        pairs.sort();
        pairs
    }
}

/// Failure taxonomy surfaced by the upstream client.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("paper not found")]
    NotFound,
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("upstream request timed out")]
    Timeout,
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("unauthorized: missing or invalid API key")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl UpstreamError {
    /// Only transient failures are retried; everything else surfaces
    /// immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpstreamError::RateLimited { .. }
                | UpstreamError::Timeout
                | UpstreamError::Unavailable(_)
                | UpstreamError::Transport(_)
        )
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout
        } else if err.is_connect() {
            UpstreamError::Unavailable(err.to_string())
        } else {
            UpstreamError::Transport(err.to_string())
        }
    }
}

/// Field list requested on every full paper fetch: the stored record is a
/// superset of anything a caller can project.
pub const WIDE_PAPER_FIELDS: &str = "paperId,title,abstract,venue,year,publicationDate,\
authors,citationCount,referenceCount,influentialCitationCount,isOpenAccess,openAccessPdf,\
fieldsOfStudy,publicationTypes,journal,citationStyles,tldr,embedding,externalIds";

/// Field list requested for relation neighbors and search results.
pub const RELATION_ITEM_FIELDS: &str =
    "paperId,title,abstract,venue,year,authors,citationCount,externalIds,contexts,intents,isInfluential";

/// Field list requested for search results (no edge attributes).
pub const SEARCH_ITEM_FIELDS: &str =
    "paperId,title,abstract,venue,year,authors,citationCount,externalIds,openAccessPdf";

/// Typed access to the upstream graph API. The HTTP client implements this;
/// tests substitute an in-memory fake.
#[async_trait]
pub trait PaperApi: Send + Sync {
    /// Fetch a single paper by canonical id or prefixed external id.
    async fn fetch_paper(&self, paper_ref: &str, fields: &str) -> Result<Value, UpstreamError>;

    /// Fetch one page of a paper's citations or references.
    async fn fetch_relation_page(
        &self,
        paper_id: &str,
        kind: RelationKind,
        offset: u64,
        limit: u64,
        fields: &str,
    ) -> Result<RelationPage, UpstreamError>;

    /// Fetch up to 500 papers in one call. The result preserves input order;
    /// unknown ids come back as `None`.
    async fn fetch_batch(
        &self,
        paper_refs: &[String],
        fields: &str,
    ) -> Result<Vec<Option<Value>>, UpstreamError>;

    /// Relevance search.
    async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        offset: u64,
        limit: u64,
        fields: &str,
    ) -> Result<SearchPage, UpstreamError>;

    /// Single best title match, or `NotFound`.
    async fn match_title(&self, query: &str, fields: &str) -> Result<Value, UpstreamError>;
}
