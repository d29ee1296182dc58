use std::sync::Arc;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::cache::HotCache;
use crate::config::Config;
use crate::project::{project_item, project_paper, FieldExpr};
use crate::resolve::{PaperResolver, ResolveError};
use crate::store::GraphStore;
use crate::title_index::TitleIndex;
use crate::upstream::{PaperApi, SearchFilters, SearchPage, UpstreamError, SEARCH_ITEM_FIELDS, WIDE_PAPER_FIELDS};

const MAX_SEARCH_LIMIT: u64 = 100;

/// Caches search results by query fingerprint, optionally serving matches
/// from the local graph store before falling back to upstream.
pub struct SearchCoordinator {
    api: Arc<dyn PaperApi>,
    cache: Arc<HotCache>,
    store: Arc<GraphStore>,
    titles: Option<Arc<Mutex<TitleIndex>>>,
    resolver: PaperResolver,
    config: Arc<Config>,
}

impl SearchCoordinator {
    pub fn new(
        api: Arc<dyn PaperApi>,
        cache: Arc<HotCache>,
        store: Arc<GraphStore>,
        titles: Option<Arc<Mutex<TitleIndex>>>,
        resolver: PaperResolver,
        config: Arc<Config>,
    ) -> Self {
        Self { api, cache, store, titles, resolver, config }
    }

    /// Fingerprinted, cached search. Projection is applied per request, so
    /// one cached page serves every field expression.
    pub async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        offset: u64,
        limit: u64,
        expr: &FieldExpr,
    ) -> Result<Value, ResolveError> {
        let limit = limit.clamp(1, MAX_SEARCH_LIMIT);
        let key = fingerprint(query, filters, offset, limit);

        if let Some(page) = self.cache.get_search(&key).await {
            return Ok(search_response(&page, expr));
        }

        if self.config.prefer_local_search {
            if let Some(page) = self.local_search(query, offset, limit).await {
                self.cache.put_search(&key, page.clone()).await;
                return Ok(search_response(&page, expr));
            }
        }

        let page = self
            .api
            .search(query, filters, offset, limit, SEARCH_ITEM_FIELDS)
            .await?;
        self.cache.put_search(&key, page.clone()).await;
        Ok(search_response(&page, expr))
    }

    /// Resolve a free-text title to the single best paper via upstream's
    /// match endpoint, adopting the record into the cache tiers.
    pub async fn match_title(
        &self,
        query: &str,
        expr: &FieldExpr,
    ) -> Result<Value, ResolveError> {
        let record = match self.api.match_title(query, WIDE_PAPER_FIELDS).await {
            Ok(record) => record,
            Err(UpstreamError::NotFound) => return Err(ResolveError::NotFound),
            Err(err) => return Err(err.into()),
        };
        let clean = self.resolver.adopt_record(record).await?;
        Ok(project_paper(&clean, expr))
    }

    /// Best-effort match against papers already in the graph store. Returns
    /// `None` when the local index is missing or yields too few hits; the
    /// ranking makes no attempt to mirror upstream's.
    async fn local_search(&self, query: &str, offset: u64, limit: u64) -> Option<SearchPage> {
        let titles = self.titles.as_ref()?;
        let fetch = (offset + limit) as usize + self.config.local_search_min_results;
        let mut hits = {
            let index = titles.lock().await;
            match index.search(query, fetch) {
                Ok(hits) => hits,
                Err(e) => {
                    tracing::warn!("Local title search failed: {}", e);
                    return None;
                }
            }
        };
        if hits.len() < self.config.local_search_min_results {
            return None;
        }

        let query_lower = query.to_lowercase();
        hits.sort_by(|a, b| {
            let sa = strsim::jaro_winkler(&query_lower, &a.1.to_lowercase());
            let sb = strsim::jaro_winkler(&query_lower, &b.1.to_lowercase());
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });

        let total = hits.len() as u64;
        let start = (offset as usize).min(hits.len());
        let end = (start + limit as usize).min(hits.len());

        let mut items = Vec::with_capacity(end - start);
        for (paper_id, _, _) in &hits[start..end] {
            match self.store.papers.get(paper_id).await {
                Ok(Some(stored)) => items.push(stored.record),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Store lookup failed during local search: {}", e);
                    return None;
                }
            }
        }
        let next = if end < hits.len() { Some(end as u64) } else { None };
        Some(SearchPage { total, offset, next, items })
    }
}

/// Canonical fingerprint of a search request. Independent of the field
/// expression: one cached page serves every projection.
pub fn fingerprint(query: &str, filters: &SearchFilters, offset: u64, limit: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.trim().to_lowercase().as_bytes());
    hasher.update(b"\n");
    for pair in filters.canonical_pairs() {
        hasher.update(pair.as_bytes());
        hasher.update(b"&");
    }
    hasher.update(offset.to_le_bytes());
    hasher.update(limit.to_le_bytes());
    hex::encode(hasher.finalize())
}

fn search_response(page: &SearchPage, expr: &FieldExpr) -> Value {
    let data: Vec<Value> = page.items.iter().map(|item| project_item(item, expr)).collect();
    let mut out = Map::new();
    out.insert("total".to_string(), Value::from(page.total));
    out.insert("offset".to_string(), Value::from(page.offset));
    if let Some(next) = page.next {
        out.insert("next".to_string(), Value::from(next));
    }
    // Compatibility: some clients read `papers`, others `data`.
    out.insert("data".to_string(), Value::Array(data.clone()));
    out.insert("papers".to_string(), Value::Array(data));
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::HotCache;
    use crate::ingest::RelationIngestor;
    use crate::upstream::{RelationKind, RelationPage};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct SearchApi {
        search_calls: AtomicUsize,
    }

    #[async_trait]
    impl PaperApi for SearchApi {
        async fn fetch_paper(&self, _r: &str, _f: &str) -> Result<Value, UpstreamError> {
            Err(UpstreamError::NotFound)
        }

        async fn fetch_relation_page(
            &self,
            _p: &str,
            _k: RelationKind,
            offset: u64,
            _l: u64,
            _f: &str,
        ) -> Result<RelationPage, UpstreamError> {
            Ok(RelationPage { total: 0, offset, next: None, items: vec![] })
        }

        async fn fetch_batch(
            &self,
            _refs: &[String],
            _f: &str,
        ) -> Result<Vec<Option<Value>>, UpstreamError> {
            Ok(vec![])
        }

        async fn search(
            &self,
            query: &str,
            _filters: &SearchFilters,
            offset: u64,
            _limit: u64,
            _fields: &str,
        ) -> Result<SearchPage, UpstreamError> {
            self.search_calls.fetch_add(1, Ordering::SeqCst);
            Ok(SearchPage {
                total: 2,
                offset,
                next: None,
                items: vec![
                    json!({"paperId": "s1", "title": format!("About {}", query), "year": 2020}),
                    json!({"paperId": "s2", "title": "Another Result", "year": 2021}),
                ],
            })
        }

        async fn match_title(&self, query: &str, _f: &str) -> Result<Value, UpstreamError> {
            if query.contains("known") {
                Ok(json!({"paperId": "m1", "title": "Known Paper", "year": 2019}))
            } else {
                Err(UpstreamError::NotFound)
            }
        }
    }

    struct Ctx {
        _tmp: TempDir,
        api: Arc<SearchApi>,
        coordinator: SearchCoordinator,
    }

    async fn setup() -> Ctx {
        let tmp = TempDir::new().unwrap();
        let config = Arc::new(Config::from_env());
        let api = Arc::new(SearchApi { search_calls: AtomicUsize::new(0) });
        let store = Arc::new(GraphStore::create_or_open(tmp.path()).await.unwrap());
        let cache = Arc::new(HotCache::new(&config));
        let ingestor = Arc::new(RelationIngestor::new(
            api.clone() as Arc<dyn PaperApi>,
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&config),
        ));
        let resolver = PaperResolver::new(
            api.clone() as Arc<dyn PaperApi>,
            Arc::clone(&store),
            Arc::clone(&cache),
            ingestor,
            None,
            Arc::clone(&config),
        );
        let coordinator = SearchCoordinator::new(
            api.clone() as Arc<dyn PaperApi>,
            cache,
            store,
            None,
            resolver,
            config,
        );
        Ctx { _tmp: tmp, api, coordinator }
    }

    #[tokio::test]
    async fn test_search_cached_by_fingerprint() {
        let ctx = setup().await;
        let filters = SearchFilters::default();
        let expr = FieldExpr::parse(Some("title")).unwrap();

        let first = ctx.coordinator.search("graph neural", &filters, 0, 10, &expr).await.unwrap();
        assert_eq!(first["total"], 2);
        assert_eq!(first["data"][0]["title"], "About graph neural");
        assert_eq!(first["papers"], first["data"]);
        assert_eq!(ctx.api.search_calls.load(Ordering::SeqCst), 1);

        // Same query, different projection: served from cache.
        let wide = FieldExpr::parse(Some("title,year")).unwrap();
        let second = ctx.coordinator.search("Graph Neural ", &filters, 0, 10, &wide).await.unwrap();
        assert_eq!(second["data"][0]["year"], 2020);
        assert_eq!(ctx.api.search_calls.load(Ordering::SeqCst), 1);

        // Different offset misses.
        ctx.coordinator.search("graph neural", &filters, 10, 10, &expr).await.unwrap();
        assert_eq!(ctx.api.search_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_match_title_adopts_record() {
        let ctx = setup().await;
        let expr = FieldExpr::parse(Some("title,year")).unwrap();

        let out = ctx.coordinator.match_title("the known paper", &expr).await.unwrap();
        assert_eq!(out["paperId"], "m1");
        assert_eq!(out["year"], 2019);

        let err = ctx.coordinator.match_title("nothing here", &expr).await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound));
    }

    #[test]
    fn test_fingerprint_canonicalization() {
        let filters = SearchFilters::default();
        // Case and surrounding whitespace do not matter.
        assert_eq!(
            fingerprint("Graph Neural", &filters, 0, 10),
            fingerprint("  graph neural ", &filters, 0, 10)
        );
        // Offset, limit, and filters do.
        assert_ne!(
            fingerprint("graph neural", &filters, 0, 10),
            fingerprint("graph neural", &filters, 10, 10)
        );
        let filtered = SearchFilters { year: Some("2020".to_string()), ..Default::default() };
        assert_ne!(
            fingerprint("graph neural", &filters, 0, 10),
            fingerprint("graph neural", &filtered, 0, 10)
        );
    }
}
