use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::cache::{HotCache, RelationView};
use crate::config::Config;
use crate::store::relations::{IngestProgress, IngestState};
use crate::store::GraphStore;
use crate::upstream::{PaperApi, RelationKind, RELATION_ITEM_FIELDS};

/// Background pagination of large citation/reference lists: pages are
/// fetched from upstream, merged by neighbor id, and persisted as stubs,
/// edges, and one relation blob.
pub struct RelationIngestor {
    api: Arc<dyn PaperApi>,
    store: Arc<GraphStore>,
    cache: Arc<HotCache>,
    config: Arc<Config>,
}

impl RelationIngestor {
    pub fn new(
        api: Arc<dyn PaperApi>,
        store: Arc<GraphStore>,
        cache: Arc<HotCache>,
        config: Arc<Config>,
    ) -> Self {
        Self { api, store, cache, config }
    }

    /// Spawn an ingest task when the relation count crosses the threshold.
    /// Below it, the inline items fetched with the paper body suffice.
    pub fn maybe_spawn(self: &Arc<Self>, paper_id: &str, kind: RelationKind, expected_total: u64) {
        if expected_total < self.config.large_relation_threshold {
            return;
        }
        let this = Arc::clone(self);
        let paper_id = paper_id.to_string();
        tokio::spawn(async move {
            this.run(&paper_id, kind, expected_total).await;
        });
    }

    /// Run one ingest to completion. At most one task per `(paper, kind)`
    /// holds the slot; a second caller observes the running state and
    /// returns immediately.
    pub async fn run(&self, paper_id: &str, kind: RelationKind, expected_total: u64) {
        let lock_name = format!("ingest:{}:{}", paper_id, kind.as_str());
        let Some(owner) = self.cache.try_lock(&lock_name).await else {
            tracing::debug!("Ingest already in flight for {} {}", paper_id, kind);
            return;
        };

        if let Err(err) = self.run_inner(paper_id, kind, expected_total).await {
            tracing::warn!("Relation ingest failed for {} {}: {}", paper_id, kind, err);
            let mut progress = self
                .store
                .relations
                .get_progress(paper_id, kind)
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| IngestProgress::new(Some(expected_total)));
            progress.state = IngestState::Failed;
            if let Err(e) = self.store.relations.set_progress(paper_id, kind, &progress).await {
                tracing::warn!("Failed to persist failed ingest state: {}", e);
            }
            self.cache.put_progress(paper_id, kind, progress).await;
        }

        self.cache.unlock(&lock_name, owner).await;
    }

    async fn run_inner(
        &self,
        paper_id: &str,
        kind: RelationKind,
        expected_total: u64,
    ) -> anyhow::Result<()> {
        let mut progress = self
            .store
            .relations
            .get_progress(paper_id, kind)
            .await?
            .unwrap_or_else(|| IngestProgress::new(Some(expected_total)));
        if progress.state == IngestState::Complete {
            return Ok(());
        }

        progress.state = IngestState::Running;
        self.store.relations.set_progress(paper_id, kind, &progress).await?;
        self.cache.put_progress(paper_id, kind, progress.clone()).await;

        // Seed the accumulator from a previous partial blob so a resumed
        // run does not lose merged pages.
        let mut acc = Accumulator::new();
        if progress.pages_fetched > 0 {
            if let Some(blob) = self.store.relations.get_blob(paper_id, kind).await? {
                for item in blob.items {
                    acc.merge(item);
                }
            }
        }

        let page_size = self.config.relation_page_size;
        let mut total = expected_total;
        let mut offset = progress.pages_fetched * page_size;

        loop {
            if progress.pages_fetched >= self.config.ingest_page_cap {
                tracing::warn!(
                    "Ingest page cap reached for {} {} ({} pages)",
                    paper_id,
                    kind,
                    progress.pages_fetched
                );
                break;
            }

            let page = self
                .api
                .fetch_relation_page(paper_id, kind, offset, page_size, RELATION_ITEM_FIELDS)
                .await?;
            total = page.total;

            for item in &page.items {
                acc.merge(item.clone());
            }

            self.cache
                .put_relation_page(paper_id, kind, progress.pages_fetched, page.clone())
                .await;
            self.persist_page(paper_id, kind, &page.items).await?;

            progress.pages_fetched += 1;
            progress.last_cursor = page.next;
            progress.expected_total = Some(total);
            self.store.relations.set_progress(paper_id, kind, &progress).await?;
            self.cache.put_progress(paper_id, kind, progress.clone()).await;

            // Publish the partial view so slice reads can be served while
            // pagination continues.
            self.cache
                .put_relations(
                    paper_id,
                    kind,
                    RelationView {
                        total,
                        fetched: acc.len() as u64,
                        items: acc.items(),
                    },
                )
                .await;

            match page.next {
                Some(next) if progress.pages_fetched * page_size < total => offset = next,
                _ => break,
            }
        }

        let items = acc.items();
        self.store
            .relations
            .store_blob(paper_id, kind, &items, total)
            .await?;
        self.cache
            .put_relations(
                paper_id,
                kind,
                RelationView { total, fetched: items.len() as u64, items },
            )
            .await;

        progress.state = IngestState::Complete;
        self.store.relations.set_progress(paper_id, kind, &progress).await?;
        self.cache.put_progress(paper_id, kind, progress).await;
        Ok(())
    }

    /// Persist one page's side effects: neighbor stubs and citation edges.
    async fn persist_page(
        &self,
        paper_id: &str,
        kind: RelationKind,
        items: &[Value],
    ) -> anyhow::Result<()> {
        self.store.papers.upsert_stubs(items).await?;

        let pairs: Vec<(String, Value)> = items
            .iter()
            .filter_map(|item| {
                let neighbor = item.get("paperId")?.as_str()?.to_string();
                Some((neighbor, edge_attrs(item)))
            })
            .collect();
        match kind {
            // Citations: the neighbors cite this paper.
            RelationKind::Citations => {
                self.store.edges.merge_edges_reverse(paper_id, &pairs).await?
            }
            // References: this paper cites the neighbors.
            RelationKind::References => self.store.edges.merge_edges(paper_id, &pairs).await?,
        }
        Ok(())
    }
}

/// Extract the edge attribute set from a flattened neighbor summary.
fn edge_attrs(item: &Value) -> Value {
    let mut attrs = Map::new();
    for key in ["contexts", "intents", "isInfluential"] {
        if let Some(v) = item.get(key) {
            if !v.is_null() {
                attrs.insert(key.to_string(), v.clone());
            }
        }
    }
    if attrs.is_empty() {
        Value::Null
    } else {
        Value::Object(attrs)
    }
}

/// Order-preserving merge of neighbor summaries keyed by neighbor
/// `paperId`; repeated neighbors merge field-wise, last writer wins.
struct Accumulator {
    order: Vec<String>,
    by_id: HashMap<String, Value>,
}

impl Accumulator {
    fn new() -> Self {
        Self { order: Vec::new(), by_id: HashMap::new() }
    }

    fn merge(&mut self, item: Value) {
        let Some(id) = item.get("paperId").and_then(Value::as_str).map(str::to_string) else {
            return;
        };
        match self.by_id.get_mut(&id) {
            Some(existing) => {
                if let (Value::Object(old), Value::Object(new)) = (existing, &item) {
                    for (k, v) in new {
                        if !v.is_null() {
                            old.insert(k.clone(), v.clone());
                        }
                    }
                }
            }
            None => {
                self.order.push(id.clone());
                self.by_id.insert(id, item);
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn items(&self) -> Vec<Value> {
        self.order
            .iter()
            .filter_map(|id| self.by_id.get(id).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{RelationPage, SearchFilters, SearchPage, UpstreamError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Upstream fake serving `total` synthetic neighbors in fixed pages.
    struct PagedApi {
        total: u64,
        page_calls: AtomicUsize,
    }

    #[async_trait]
    impl PaperApi for PagedApi {
        async fn fetch_paper(&self, _r: &str, _f: &str) -> Result<Value, UpstreamError> {
            Err(UpstreamError::NotFound)
        }

        async fn fetch_relation_page(
            &self,
            _paper_id: &str,
            _kind: RelationKind,
            offset: u64,
            limit: u64,
            _fields: &str,
        ) -> Result<RelationPage, UpstreamError> {
            self.page_calls.fetch_add(1, Ordering::SeqCst);
            let end = (offset + limit).min(self.total);
            let items = (offset..end)
                .map(|i| json!({"paperId": format!("n{}", i), "title": format!("N {}", i)}))
                .collect();
            let next = if end < self.total { Some(end) } else { None };
            Ok(RelationPage { total: self.total, offset, next, items })
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
            _q: &str,
            _filters: &SearchFilters,
            _o: u64,
            _l: u64,
            _f: &str,
        ) -> Result<SearchPage, UpstreamError> {
            Err(UpstreamError::NotFound)
        }

        async fn match_title(&self, _q: &str, _f: &str) -> Result<Value, UpstreamError> {
            Err(UpstreamError::NotFound)
        }
    }

    async fn setup(total: u64) -> (TempDir, Arc<RelationIngestor>, Arc<GraphStore>, Arc<HotCache>) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::from_env();
        config.relation_page_size = 10;
        config.large_relation_threshold = 20;
        config.ingest_page_cap = 100;
        let config = Arc::new(config);
        let store = Arc::new(GraphStore::create_or_open(tmp.path()).await.unwrap());
        let cache = Arc::new(HotCache::new(&config));
        let api = Arc::new(PagedApi { total, page_calls: AtomicUsize::new(0) });
        let ingestor = Arc::new(RelationIngestor::new(
            api,
            Arc::clone(&store),
            Arc::clone(&cache),
            config,
        ));
        (tmp, ingestor, store, cache)
    }

    #[tokio::test]
    async fn test_ingest_merges_all_pages() {
        let (_tmp, ingestor, store, cache) = setup(35).await;

        ingestor.run("abc", RelationKind::Citations, 35).await;

        let blob = store
            .relations
            .get_blob("abc", RelationKind::Citations)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(blob.total, 35);
        assert_eq!(blob.items.len(), 35);
        // No neighbor appears twice.
        let mut ids: Vec<&str> =
            blob.items.iter().map(|i| i["paperId"].as_str().unwrap()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 35);

        let progress = store
            .relations
            .get_progress("abc", RelationKind::Citations)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(progress.state, IngestState::Complete);
        assert_eq!(progress.pages_fetched, 4);

        let view = cache.get_relations("abc", RelationKind::Citations).await.unwrap();
        assert_eq!(view.fetched, 35);

        // Stubs and reverse edges landed in the graph store.
        assert_eq!(store.papers.count().await.unwrap(), 35);
        assert_eq!(store.edges.edges_to("abc").await.unwrap().len(), 35);
    }

    #[tokio::test]
    async fn test_ingest_is_idempotent() {
        let (_tmp, ingestor, store, _cache) = setup(25).await;

        ingestor.run("abc", RelationKind::References, 25).await;
        ingestor.run("abc", RelationKind::References, 25).await;

        let blob = store
            .relations
            .get_blob("abc", RelationKind::References)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(blob.items.len(), 25);
        assert_eq!(store.edges.edges_from("abc").await.unwrap().len(), 25);
    }

    #[tokio::test]
    async fn test_references_direction() {
        let (_tmp, ingestor, store, _cache) = setup(21).await;

        ingestor.run("abc", RelationKind::References, 21).await;

        // This paper cites its references, not the other way around.
        assert_eq!(store.edges.edges_from("abc").await.unwrap().len(), 21);
        assert!(store.edges.edges_to("abc").await.unwrap().is_empty());
    }

    #[test]
    fn test_accumulator_last_writer_wins() {
        let mut acc = Accumulator::new();
        acc.merge(json!({"paperId": "a", "title": "Old", "year": 2019}));
        acc.merge(json!({"paperId": "b", "title": "Other"}));
        acc.merge(json!({"paperId": "a", "title": "New"}));

        let items = acc.items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["title"], "New");
        // Fields absent from the newer copy are kept.
        assert_eq!(items[0]["year"], 2019);
        assert_eq!(items[1]["paperId"], "b");
    }

    #[test]
    fn test_edge_attrs_extraction() {
        let attrs = edge_attrs(&json!({
            "paperId": "n", "title": "T", "isInfluential": true, "contexts": ["c"]
        }));
        assert_eq!(attrs["isInfluential"], true);
        assert!(attrs.get("title").is_none());
        assert!(edge_attrs(&json!({"paperId": "n"})).is_null());
    }
}
