use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::store::relations::IngestProgress;
use crate::upstream::{RelationKind, RelationPage, SearchPage};

/// Merged relation view published for a `(paper, kind)` pair. `fetched`
/// counts contiguous items from offset 0; it may trail `total` while
/// ingestion is underway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationView {
    pub total: u64,
    pub fetched: u64,
    pub items: Vec<Value>,
}

/// Short-TTL tier: full paper records, relation views and raw pages,
/// search results, negative entries, and single-flight tokens. One cache
/// per namespace so each gets its own TTL.
pub struct HotCache {
    papers: Cache<String, Arc<Value>>,
    relations: Cache<String, Arc<RelationView>>,
    pages: Cache<String, Arc<RelationPage>>,
    progress: Cache<String, IngestProgress>,
    searches: Cache<String, Arc<SearchPage>>,
    negatives: Cache<String, ()>,
    locks: Cache<String, u64>,
}

fn build_cache<V>(capacity: u64, ttl: Duration) -> Cache<String, V>
where
    V: Clone + Send + Sync + 'static,
{
    Cache::builder()
        .max_capacity(capacity)
        .time_to_live(ttl)
        .support_invalidation_closures()
        .build()
}

fn rel_key(paper_id: &str, kind: RelationKind) -> String {
    format!("{}:{}", paper_id, kind.as_str())
}

impl HotCache {
    pub fn new(config: &Config) -> Self {
        let cap = config.cache_capacity;
        Self {
            papers: build_cache(cap, config.paper_ttl),
            relations: build_cache(cap, config.relation_ttl),
            pages: build_cache(cap, config.relation_ttl),
            progress: build_cache(cap, config.relation_ttl),
            searches: build_cache(cap, config.search_ttl),
            negatives: build_cache(cap, config.negative_ttl),
            locks: build_cache(cap, config.lock_ttl),
        }
    }

    // ── papers ──────────────────────────────────────────────────────────

    pub async fn get_paper(&self, paper_id: &str) -> Option<Arc<Value>> {
        self.papers.get(paper_id).await
    }

    pub async fn put_paper(&self, paper_id: &str, record: Value) {
        self.papers.insert(paper_id.to_string(), Arc::new(record)).await;
    }

    // ── negative entries ────────────────────────────────────────────────

    pub async fn negative_hit(&self, paper_id: &str) -> bool {
        self.negatives.get(paper_id).await.is_some()
    }

    pub async fn mark_negative(&self, paper_id: &str) {
        self.negatives.insert(paper_id.to_string(), ()).await;
    }

    pub async fn clear_negative(&self, paper_id: &str) {
        self.negatives.invalidate(paper_id).await;
    }

    // ── relation views and pages ────────────────────────────────────────

    pub async fn get_relations(&self, paper_id: &str, kind: RelationKind) -> Option<Arc<RelationView>> {
        self.relations.get(&rel_key(paper_id, kind)).await
    }

    pub async fn put_relations(&self, paper_id: &str, kind: RelationKind, view: RelationView) {
        self.relations
            .insert(rel_key(paper_id, kind), Arc::new(view))
            .await;
    }

    pub async fn get_relation_page(
        &self,
        paper_id: &str,
        kind: RelationKind,
        page_index: u64,
    ) -> Option<Arc<RelationPage>> {
        let key = format!("{}:page:{}", rel_key(paper_id, kind), page_index);
        self.pages.get(&key).await
    }

    pub async fn put_relation_page(
        &self,
        paper_id: &str,
        kind: RelationKind,
        page_index: u64,
        page: RelationPage,
    ) {
        let key = format!("{}:page:{}", rel_key(paper_id, kind), page_index);
        self.pages.insert(key, Arc::new(page)).await;
    }

    // ── ingest progress ─────────────────────────────────────────────────

    pub async fn get_progress(&self, paper_id: &str, kind: RelationKind) -> Option<IngestProgress> {
        self.progress.get(&rel_key(paper_id, kind)).await
    }

    pub async fn put_progress(&self, paper_id: &str, kind: RelationKind, progress: IngestProgress) {
        self.progress.insert(rel_key(paper_id, kind), progress).await;
    }

    // ── search results ──────────────────────────────────────────────────

    pub async fn get_search(&self, fingerprint: &str) -> Option<Arc<SearchPage>> {
        self.searches.get(fingerprint).await
    }

    pub async fn put_search(&self, fingerprint: &str, page: SearchPage) {
        self.searches
            .insert(fingerprint.to_string(), Arc::new(page))
            .await;
    }

    // ── single-flight tokens ────────────────────────────────────────────

    /// Atomic set-if-absent. Returns the owner token when this caller won
    /// the slot, `None` when another flight is already in progress.
    pub async fn try_lock(&self, name: &str) -> Option<u64> {
        let owner: u64 = rand::random();
        let entry = self.locks.entry(name.to_string()).or_insert(owner).await;
        if entry.is_fresh() {
            Some(owner)
        } else {
            None
        }
    }

    /// Delete the token, conditional on ownership.
    pub async fn unlock(&self, name: &str, owner: u64) {
        if self.locks.get(name).await == Some(owner) {
            self.locks.invalidate(name).await;
        }
    }

    // ── invalidation ────────────────────────────────────────────────────

    /// Drop every cached entry for a paper: the record, relation views and
    /// pages, ingest progress, and any negative entry. The durable store is
    /// untouched.
    pub async fn invalidate_paper(&self, paper_id: &str) {
        self.papers.invalidate(paper_id).await;
        self.negatives.invalidate(paper_id).await;
        let prefix = format!("{}:", paper_id);
        let p1 = prefix.clone();
        if let Err(e) = self.relations.invalidate_entries_if(move |k, _| k.starts_with(&p1)) {
            tracing::warn!("Relation view invalidation failed: {}", e);
        }
        let p2 = prefix.clone();
        if let Err(e) = self.pages.invalidate_entries_if(move |k, _| k.starts_with(&p2)) {
            tracing::warn!("Relation page invalidation failed: {}", e);
        }
        if let Err(e) = self.progress.invalidate_entries_if(move |k, _| k.starts_with(&prefix)) {
            tracing::warn!("Progress invalidation failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_cache() -> HotCache {
        HotCache::new(&Config::from_env())
    }

    #[tokio::test]
    async fn test_paper_roundtrip() {
        let cache = test_cache();
        cache.put_paper("abc", json!({"paperId": "abc", "title": "T"})).await;
        let got = cache.get_paper("abc").await.unwrap();
        assert_eq!(got["title"], "T");
        assert!(cache.get_paper("other").await.is_none());
    }

    #[tokio::test]
    async fn test_single_flight_exclusive() {
        let cache = test_cache();
        let owner = cache.try_lock("paper:abc").await.expect("first acquire");
        assert!(cache.try_lock("paper:abc").await.is_none());

        // Wrong owner cannot release.
        cache.unlock("paper:abc", owner.wrapping_add(1)).await;
        assert!(cache.try_lock("paper:abc").await.is_none());

        cache.unlock("paper:abc", owner).await;
        assert!(cache.try_lock("paper:abc").await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_paper_clears_all_namespaces() {
        let cache = test_cache();
        cache.put_paper("abc", json!({"paperId": "abc"})).await;
        cache.mark_negative("abc").await;
        cache
            .put_relations(
                "abc",
                RelationKind::Citations,
                RelationView { total: 1, fetched: 1, items: vec![json!({"paperId": "n"})] },
            )
            .await;

        cache.invalidate_paper("abc").await;
        assert!(cache.get_paper("abc").await.is_none());
        assert!(!cache.negative_hit("abc").await);
        assert!(cache.get_relations("abc", RelationKind::Citations).await.is_none());
    }

    #[tokio::test]
    async fn test_negative_entry() {
        let cache = test_cache();
        assert!(!cache.negative_hit("gone").await);
        cache.mark_negative("gone").await;
        assert!(cache.negative_hit("gone").await);
    }
}
