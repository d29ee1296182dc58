use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::cache::{HotCache, RelationView};
use crate::config::Config;
use crate::ids::{self, AliasKind, PaperRef};
use crate::ingest::RelationIngestor;
use crate::project::{project_item, project_paper, FieldExpr};
use crate::store::relations::IngestState;
use crate::store::GraphStore;
use crate::title_index::TitleIndex;
use crate::upstream::{PaperApi, RelationKind, UpstreamError, WIDE_PAPER_FIELDS};

/// Error kinds surfaced to callers of the read path.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("paper not found")]
    NotFound,
    #[error("request deadline exceeded")]
    Timeout,
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<UpstreamError> for ResolveError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::NotFound => ResolveError::NotFound,
            UpstreamError::BadRequest(m) => ResolveError::BadRequest(m),
            UpstreamError::Timeout => ResolveError::Timeout,
            UpstreamError::Unauthorized => {
                ResolveError::Internal("upstream rejected the API credential".to_string())
            }
            UpstreamError::RateLimited { .. } => {
                ResolveError::Unavailable("upstream rate limit exhausted".to_string())
            }
            UpstreamError::Unavailable(m) | UpstreamError::Transport(m) => {
                ResolveError::Unavailable(m)
            }
        }
    }
}

/// The read path for papers and relations, and the writer that keeps the
/// hot cache, graph store, and alias index coherent.
#[derive(Clone)]
pub struct PaperResolver {
    api: Arc<dyn PaperApi>,
    store: Arc<GraphStore>,
    cache: Arc<HotCache>,
    ingestor: Arc<RelationIngestor>,
    titles: Option<Arc<Mutex<TitleIndex>>>,
    config: Arc<Config>,
}

impl PaperResolver {
    pub fn new(
        api: Arc<dyn PaperApi>,
        store: Arc<GraphStore>,
        cache: Arc<HotCache>,
        ingestor: Arc<RelationIngestor>,
        titles: Option<Arc<Mutex<TitleIndex>>>,
        config: Arc<Config>,
    ) -> Self {
        Self { api, store, cache, ingestor, titles, config }
    }

    // ── single paper ────────────────────────────────────────────────────

    /// Resolve one paper reference and project the requested fields.
    pub async fn get_paper(&self, raw_ref: &str, expr: &FieldExpr) -> Result<Value, ResolveError> {
        match tokio::time::timeout(self.config.request_deadline, self.get_paper_inner(raw_ref, expr))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ResolveError::Timeout),
        }
    }

    async fn get_paper_inner(
        &self,
        raw_ref: &str,
        expr: &FieldExpr,
    ) -> Result<Value, ResolveError> {
        let paper_ref =
            PaperRef::parse(raw_ref).map_err(|e| ResolveError::BadRequest(e.to_string()))?;
        let known_id = self.known_id(&paper_ref).await;

        if let Some(id) = &known_id {
            if let Some(record) = self.cache.get_paper(id).await {
                return Ok(project_paper(record.as_ref(), expr));
            }
            if self.cache.negative_hit(id).await {
                return Err(ResolveError::NotFound);
            }
            match self.store.papers.get(id).await {
                Ok(Some(stored)) if stored.is_fresh(self.config.freshness_window_hours) => {
                    self.cache.put_paper(id, stored.record.clone()).await;
                    return Ok(project_paper(&stored.record, expr));
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Graph store read failed for {}: {}", id, e),
            }

            // Single-flight: only one upstream fetch per canonical id.
            let lock_name = format!("paper:{}", id);
            match self.cache.try_lock(&lock_name).await {
                Some(owner) => {
                    return self
                        .fetch_projected(paper_ref, known_id, Some((lock_name, owner)), expr)
                        .await;
                }
                None => {
                    if let Some(result) = self.poll_for_result(id, expr).await {
                        return result;
                    }
                    // Holder slow or gone; fall through to a redundant fetch.
                    return self.fetch_projected(paper_ref, known_id, None, expr).await;
                }
            }
        }

        // Identity unknown: speculative upstream fetch defines it.
        self.fetch_projected(paper_ref, None, None, expr).await
    }

    async fn known_id(&self, paper_ref: &PaperRef) -> Option<String> {
        match paper_ref {
            PaperRef::Canonical(id) => Some(id.clone()),
            PaperRef::Alias { kind, value } => {
                match self.store.aliases.resolve(*kind, value).await {
                    Ok(found) => found,
                    Err(e) => {
                        tracing::warn!("Alias lookup failed for {}:{}: {}", kind.as_str(), value, e);
                        None
                    }
                }
            }
        }
    }

    /// Poll the paper key while another flight is in progress. `None` means
    /// the wait budget ran out.
    async fn poll_for_result(
        &self,
        paper_id: &str,
        expr: &FieldExpr,
    ) -> Option<Result<Value, ResolveError>> {
        let deadline = tokio::time::Instant::now() + self.config.poll_wait;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(self.config.poll_interval).await;
            if let Some(record) = self.cache.get_paper(paper_id).await {
                return Some(Ok(project_paper(record.as_ref(), expr)));
            }
            if self.cache.negative_hit(paper_id).await {
                return Some(Err(ResolveError::NotFound));
            }
        }
        None
    }

    /// Fetch upstream on a background task (it survives the caller's
    /// deadline), then project, tagging stale fallbacks.
    async fn fetch_projected(
        &self,
        paper_ref: PaperRef,
        known_id: Option<String>,
        lock: Option<(String, u64)>,
        expr: &FieldExpr,
    ) -> Result<Value, ResolveError> {
        let this = self.clone();
        let handle =
            tokio::spawn(async move { this.fetch_and_populate(paper_ref, known_id, lock).await });
        match handle.await {
            Ok(Ok((record, outdated))) => {
                let mut projected = project_paper(&record, expr);
                if outdated {
                    if let Value::Object(m) = &mut projected {
                        m.insert("data_may_be_outdated".to_string(), Value::Bool(true));
                    }
                }
                Ok(projected)
            }
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(ResolveError::Internal(format!("fetch task failed: {}", join_err))),
        }
    }

    /// The single-flight holder's work: fetch wide, write through the hot
    /// cache, schedule durable persistence, release the token. Returns the
    /// clean record and whether it is a stale fallback.
    async fn fetch_and_populate(
        &self,
        paper_ref: PaperRef,
        known_id: Option<String>,
        lock: Option<(String, u64)>,
    ) -> Result<(Value, bool), ResolveError> {
        let release = |cache: Arc<HotCache>| async move {
            if let Some((name, owner)) = lock {
                cache.unlock(&name, owner).await;
            }
        };

        let Some(upstream_ref) = paper_ref.upstream_ref() else {
            release(Arc::clone(&self.cache)).await;
            return Err(ResolveError::NotFound);
        };

        match self.api.fetch_paper(&upstream_ref, &wide_fetch_fields()).await {
            Ok(record) => {
                let Some(paper_id) = record.get("paperId").and_then(Value::as_str).map(String::from)
                else {
                    release(Arc::clone(&self.cache)).await;
                    return Err(ResolveError::Internal(
                        "upstream record is missing paperId".to_string(),
                    ));
                };
                let (clean, inline) = split_inline(record);
                self.cache.clear_negative(&paper_id).await;
                self.cache.put_paper(&paper_id, clean.clone()).await;
                self.spawn_persist(paper_id, clean.clone(), inline);
                release(Arc::clone(&self.cache)).await;
                Ok((clean, false))
            }
            Err(UpstreamError::NotFound) => {
                if let Some(id) = &known_id {
                    self.cache.mark_negative(id).await;
                }
                release(Arc::clone(&self.cache)).await;
                Err(ResolveError::NotFound)
            }
            Err(err) => {
                release(Arc::clone(&self.cache)).await;
                if let Some(id) = &known_id {
                    if let Ok(Some(stored)) = self.store.papers.get(id).await {
                        if stored.record.is_object() && !stored.record.is_null() {
                            tracing::warn!("Serving stale graph store copy for {}: {}", id, err);
                            return Ok((stored.record, true));
                        }
                    }
                }
                Err(err.into())
            }
        }
    }

    /// Fan out a fetched record to the durable tiers on a background task.
    /// Failures are logged and swallowed; the hot cache already serves the
    /// result.
    fn spawn_persist(
        &self,
        paper_id: String,
        record: Value,
        inline: Vec<(RelationKind, Vec<Value>)>,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.persist(&paper_id, &record, inline).await {
                tracing::warn!("Background persistence failed for {}: {}", paper_id, e);
            }
        });
    }

    async fn persist(
        &self,
        paper_id: &str,
        record: &Value,
        inline: Vec<(RelationKind, Vec<Value>)>,
    ) -> anyhow::Result<()> {
        self.store.papers.upsert_full(record).await?;

        let aliases = harvest_aliases(record);
        for conflict in self.store.aliases.record(paper_id, &aliases).await? {
            tracing::warn!(
                "Alias conflict: {}:{} already points at {}, not re-pointing at {}",
                conflict.kind.as_str(),
                conflict.value,
                conflict.existing_target,
                conflict.attempted_target
            );
        }

        if let Some(titles) = &self.titles {
            if let Some(title) = record.get("title").and_then(Value::as_str) {
                let mut index = titles.lock().await;
                index.add_paper(paper_id, title)?;
                index.commit()?;
            }
        }

        for (kind, mut items) in inline {
            let total = relation_total(record, kind).unwrap_or(items.len() as u64);
            items.truncate(self.config.relation_inline_cap);

            self.cache
                .put_relations(
                    paper_id,
                    kind,
                    RelationView { total, fetched: items.len() as u64, items: items.clone() },
                )
                .await;

            self.store.papers.upsert_stubs(&items).await?;
            let pairs: Vec<(String, Value)> = items
                .iter()
                .filter_map(|i| {
                    Some((i.get("paperId")?.as_str()?.to_string(), Value::Null))
                })
                .collect();
            match kind {
                RelationKind::Citations => {
                    self.store.edges.merge_edges_reverse(paper_id, &pairs).await?
                }
                RelationKind::References => {
                    self.store.edges.merge_edges(paper_id, &pairs).await?
                }
            }

            if total as usize <= items.len() {
                // The inline list is complete; no pagination needed.
                self.store.relations.store_blob(paper_id, kind, &items, total).await?;
            } else {
                self.ingestor.maybe_spawn(paper_id, kind, total);
            }
        }
        Ok(())
    }

    /// Adopt a record obtained outside the normal read path (title match):
    /// write through the cache, fan out persistence, return the clean record.
    pub async fn adopt_record(&self, record: Value) -> Result<Value, ResolveError> {
        let Some(paper_id) = record.get("paperId").and_then(Value::as_str).map(String::from)
        else {
            return Err(ResolveError::Internal("record is missing paperId".to_string()));
        };
        let (clean, inline) = split_inline(record);
        self.cache.put_paper(&paper_id, clean.clone()).await;
        self.spawn_persist(paper_id, clean.clone(), inline);
        Ok(clean)
    }

    // ── batch ───────────────────────────────────────────────────────────

    /// Resolve up to the batch cap of references in one pass. Output order
    /// matches input order; unresolved entries are `None`.
    pub async fn get_batch(
        &self,
        raw_refs: &[String],
        expr: &FieldExpr,
    ) -> Result<Vec<Option<Value>>, ResolveError> {
        match tokio::time::timeout(self.config.request_deadline, self.get_batch_inner(raw_refs, expr))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ResolveError::Timeout),
        }
    }

    async fn get_batch_inner(
        &self,
        raw_refs: &[String],
        expr: &FieldExpr,
    ) -> Result<Vec<Option<Value>>, ResolveError> {
        if raw_refs.len() > self.config.batch_cap {
            return Err(ResolveError::BadRequest(format!(
                "batch size {} exceeds the cap of {}",
                raw_refs.len(),
                self.config.batch_cap
            )));
        }
        let mut parsed = Vec::with_capacity(raw_refs.len());
        for raw in raw_refs {
            parsed.push(PaperRef::parse(raw).map_err(|e| ResolveError::BadRequest(e.to_string()))?);
        }

        let mut results: Vec<Option<Value>> = vec![None; parsed.len()];
        let mut miss_positions = Vec::new();
        let mut miss_refs = Vec::new();

        for (position, paper_ref) in parsed.iter().enumerate() {
            if let Some(id) = self.known_id(paper_ref).await {
                if let Some(record) = self.cache.get_paper(&id).await {
                    results[position] = Some(project_item(record.as_ref(), expr));
                    continue;
                }
                if self.cache.negative_hit(&id).await {
                    continue;
                }
            }
            if let Some(upstream_ref) = paper_ref.upstream_ref() {
                miss_positions.push(position);
                miss_refs.push(upstream_ref);
            }
        }

        if !miss_refs.is_empty() {
            let entries = self.api.fetch_batch(&miss_refs, WIDE_PAPER_FIELDS).await?;
            for (position, entry) in miss_positions.into_iter().zip(entries) {
                let Some(record) = entry else { continue };
                let Some(paper_id) =
                    record.get("paperId").and_then(Value::as_str).map(String::from)
                else {
                    continue;
                };
                let (clean, inline) = split_inline(record);
                self.cache.put_paper(&paper_id, clean.clone()).await;
                self.spawn_persist(paper_id, clean.clone(), inline);
                results[position] = Some(project_item(&clean, expr));
            }
        }

        Ok(results)
    }

    // ── relations ───────────────────────────────────────────────────────

    /// Serve a citations/references slice: cached view, then durable blob,
    /// then a direct upstream page.
    pub async fn get_relations(
        &self,
        raw_ref: &str,
        kind: RelationKind,
        offset: u64,
        limit: u64,
        expr: &FieldExpr,
    ) -> Result<Value, ResolveError> {
        match tokio::time::timeout(
            self.config.request_deadline,
            self.get_relations_inner(raw_ref, kind, offset, limit, expr),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ResolveError::Timeout),
        }
    }

    async fn get_relations_inner(
        &self,
        raw_ref: &str,
        kind: RelationKind,
        offset: u64,
        limit: u64,
        expr: &FieldExpr,
    ) -> Result<Value, ResolveError> {
        let paper_ref =
            PaperRef::parse(raw_ref).map_err(|e| ResolveError::BadRequest(e.to_string()))?;
        let paper_id = match self.known_id(&paper_ref).await {
            Some(id) => id,
            None => {
                // Establish identity first; the fetch also primes caches.
                let (record, _) = self.fetch_and_populate(paper_ref, None, None).await?;
                record
                    .get("paperId")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .ok_or_else(|| {
                        ResolveError::Internal("upstream record is missing paperId".to_string())
                    })?
            }
        };

        let ingest_failed = match self.cache.get_progress(&paper_id, kind).await {
            Some(progress) => progress.state == IngestState::Failed,
            None => self
                .store
                .relations
                .get_progress(&paper_id, kind)
                .await
                .ok()
                .flatten()
                .map(|p| p.state == IngestState::Failed)
                .unwrap_or(false),
        };

        // 1. Cached merged view.
        if let Some(view) = self.cache.get_relations(&paper_id, kind).await {
            let covered =
                offset + limit <= view.fetched || view.fetched >= view.total || offset >= view.total;
            if covered {
                return Ok(slice_response(&view.items, view.total, offset, limit, expr, ingest_failed));
            }
        }

        // 2. Durable blob, when it covers the slice.
        match self.store.relations.get_blob(&paper_id, kind).await {
            Ok(Some(blob)) => {
                let have = blob.items.len() as u64;
                if have >= (offset + limit).min(blob.total) {
                    let view = RelationView {
                        total: blob.total,
                        fetched: have,
                        items: blob.items.clone(),
                    };
                    self.cache.put_relations(&paper_id, kind, view).await;
                    return Ok(slice_response(
                        &blob.items,
                        blob.total,
                        offset,
                        limit,
                        expr,
                        ingest_failed,
                    ));
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Relation blob read failed for {}: {}", paper_id, e),
        }

        // 3. Direct page from upstream; the ingestor backfills the rest.
        let page = self
            .api
            .fetch_relation_page(
                &paper_id,
                kind,
                offset,
                limit,
                crate::upstream::RELATION_ITEM_FIELDS,
            )
            .await?;
        self.ingestor.maybe_spawn(&paper_id, kind, page.total);

        // Fold a contiguous page into the cached view, best effort.
        match self.cache.get_relations(&paper_id, kind).await {
            Some(view) if offset == view.fetched => {
                let mut items = view.items.clone();
                items.extend(page.items.iter().cloned());
                let fetched = items.len() as u64;
                self.cache
                    .put_relations(
                        &paper_id,
                        kind,
                        RelationView { total: page.total, fetched, items },
                    )
                    .await;
            }
            None if offset == 0 => {
                self.cache
                    .put_relations(
                        &paper_id,
                        kind,
                        RelationView {
                            total: page.total,
                            fetched: page.items.len() as u64,
                            items: page.items.clone(),
                        },
                    )
                    .await;
            }
            _ => {}
        }

        let data: Vec<Value> = page.items.iter().map(|i| project_item(i, expr)).collect();
        Ok(page_response(page.total, offset, data, ingest_failed))
    }

    // ── cache management ────────────────────────────────────────────────

    /// Drop every hot cache entry for a paper. The graph store is untouched.
    pub async fn invalidate(&self, raw_ref: &str) -> Result<(), ResolveError> {
        let paper_ref =
            PaperRef::parse(raw_ref).map_err(|e| ResolveError::BadRequest(e.to_string()))?;
        if let Some(id) = self.known_id(&paper_ref).await {
            self.cache.invalidate_paper(&id).await;
        }
        Ok(())
    }

    /// Populate the hot cache for a paper, fetching when absent.
    pub async fn warm(&self, raw_ref: &str) -> Result<(), ResolveError> {
        self.get_paper(raw_ref, &FieldExpr::default_paper()).await.map(|_| ())
    }
}

/// Wide field set plus bounded inline relations for the primary fetch.
fn wide_fetch_fields() -> String {
    format!(
        "{},citations.paperId,citations.title,citations.year,\
references.paperId,references.title,references.year",
        WIDE_PAPER_FIELDS
    )
}

/// Split inline relation lists out of a fetched record; they are cached and
/// persisted separately, never stored on the paper node.
fn split_inline(record: Value) -> (Value, Vec<(RelationKind, Vec<Value>)>) {
    let Value::Object(mut map) = record else {
        return (record, Vec::new());
    };
    let mut inline = Vec::new();
    for kind in [RelationKind::Citations, RelationKind::References] {
        if let Some(Value::Array(items)) = map.remove(kind.as_str()) {
            if !items.is_empty() {
                inline.push((kind, items));
            }
        }
    }
    (Value::Object(map), inline)
}

fn relation_total(record: &Value, kind: RelationKind) -> Option<u64> {
    let field = match kind {
        RelationKind::Citations => "citationCount",
        RelationKind::References => "referenceCount",
    };
    record.get(field).and_then(Value::as_u64)
}

/// Collect every alias discoverable from a fetched record: the external id
/// map, the landing URL, and the normalized title.
fn harvest_aliases(record: &Value) -> Vec<(AliasKind, String)> {
    let mut aliases = Vec::new();
    if let Some(Value::Object(external)) = record.get("externalIds") {
        for (key, value) in external {
            let kind = match key.as_str() {
                "DOI" => AliasKind::Doi,
                "ArXiv" => AliasKind::Arxiv,
                "CorpusId" => AliasKind::CorpusId,
                "MAG" => AliasKind::Mag,
                "ACL" => AliasKind::Acl,
                "PubMed" => AliasKind::Pmid,
                "PubMedCentral" => AliasKind::Pmcid,
                _ => continue,
            };
            let raw = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => continue,
            };
            if let Some(normalized) = ids::normalize(kind, &raw) {
                aliases.push((kind, normalized));
            }
        }
    }
    if let Some(url) = record.get("url").and_then(Value::as_str) {
        if let Some(normalized) = ids::normalize(AliasKind::Url, url) {
            aliases.push((AliasKind::Url, normalized));
        }
    }
    if let Some(title) = record.get("title").and_then(Value::as_str) {
        let normalized = ids::normalize_title(title);
        if !normalized.is_empty() {
            aliases.push((AliasKind::TitleNorm, normalized));
        }
    }
    aliases
}

fn slice_response(
    items: &[Value],
    total: u64,
    offset: u64,
    limit: u64,
    expr: &FieldExpr,
    ingest_failed: bool,
) -> Value {
    let start = (offset as usize).min(items.len());
    let end = (start + limit as usize).min(items.len());
    let data: Vec<Value> = items[start..end].iter().map(|i| project_item(i, expr)).collect();
    page_response(total, offset, data, ingest_failed)
}

fn page_response(total: u64, offset: u64, data: Vec<Value>, ingest_failed: bool) -> Value {
    let mut out = Map::new();
    out.insert("total".to_string(), Value::from(total));
    out.insert("offset".to_string(), Value::from(offset));
    let end = offset + data.len() as u64;
    if !data.is_empty() && end < total {
        out.insert("next".to_string(), Value::from(end));
    }
    out.insert("data".to_string(), Value::Array(data));
    if ingest_failed {
        out.insert(
            "warning".to_string(),
            Value::from("relation ingest failed; results may be incomplete"),
        );
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{RelationPage, SearchFilters, SearchPage};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    const PAPER_ID: &str = "649def34f8be52c8b66281af98ae884c09aef38b";

    /// In-memory upstream: records keyed by every accepted reference form.
    struct FakeApi {
        papers: HashMap<String, Value>,
        paper_calls: AtomicUsize,
        batch_calls: AtomicUsize,
        fetch_delay: Duration,
        fail_with: Option<UpstreamError>,
    }

    impl FakeApi {
        fn new() -> Self {
            Self {
                papers: HashMap::new(),
                paper_calls: AtomicUsize::new(0),
                batch_calls: AtomicUsize::new(0),
                fetch_delay: Duration::ZERO,
                fail_with: None,
            }
        }

        fn with_sample_paper() -> Self {
            let mut api = Self::new();
            let record = sample_record();
            for key in [
                PAPER_ID,
                "DOI:10.18653/v1/n18-3011",
                "ARXIV:1805.02262",
            ] {
                api.papers.insert(key.to_string(), record.clone());
            }
            api
        }

        fn clone_error(err: &UpstreamError) -> UpstreamError {
            match err {
                UpstreamError::NotFound => UpstreamError::NotFound,
                UpstreamError::Timeout => UpstreamError::Timeout,
                UpstreamError::Unauthorized => UpstreamError::Unauthorized,
                UpstreamError::RateLimited { retry_after_secs } => {
                    UpstreamError::RateLimited { retry_after_secs: *retry_after_secs }
                }
                UpstreamError::Unavailable(m) => UpstreamError::Unavailable(m.clone()),
                UpstreamError::BadRequest(m) => UpstreamError::BadRequest(m.clone()),
                UpstreamError::Transport(m) => UpstreamError::Transport(m.clone()),
            }
        }
    }

    fn sample_record() -> Value {
        json!({
            "paperId": PAPER_ID,
            "title": "Construction of the Literature Graph in Semantic Scholar",
            "year": 2018,
            "venue": "NAACL",
            "citationCount": 3,
            "referenceCount": 2,
            "authors": [
                {"authorId": "1741101", "name": "Waleed Ammar"}
            ],
            "externalIds": {
                "DOI": "10.18653/v1/N18-3011",
                "ArXiv": "1805.02262",
                "CorpusId": 19170988
            },
            "citations": [
                {"paperId": "c1", "title": "Citing One"},
                {"paperId": "c2", "title": "Citing Two"},
                {"paperId": "c3", "title": "Citing Three"}
            ],
            "references": [
                {"paperId": "r1", "title": "Ref One"},
                {"paperId": "r2", "title": "Ref Two"}
            ]
        })
    }

    #[async_trait]
    impl PaperApi for FakeApi {
        async fn fetch_paper(&self, paper_ref: &str, _fields: &str) -> Result<Value, UpstreamError> {
            self.paper_calls.fetch_add(1, Ordering::SeqCst);
            if !self.fetch_delay.is_zero() {
                tokio::time::sleep(self.fetch_delay).await;
            }
            if let Some(err) = &self.fail_with {
                return Err(Self::clone_error(err));
            }
            self.papers.get(paper_ref).cloned().ok_or(UpstreamError::NotFound)
        }

        async fn fetch_relation_page(
            &self,
            _paper_id: &str,
            _kind: RelationKind,
            offset: u64,
            limit: u64,
            _fields: &str,
        ) -> Result<RelationPage, UpstreamError> {
            let total = 30u64;
            let end = (offset + limit).min(total);
            let items = (offset..end)
                .map(|i| json!({"paperId": format!("n{}", i), "title": format!("N {}", i)}))
                .collect();
            Ok(RelationPage {
                total,
                offset,
                next: if end < total { Some(end) } else { None },
                items,
            })
        }

        async fn fetch_batch(
            &self,
            refs: &[String],
            _fields: &str,
        ) -> Result<Vec<Option<Value>>, UpstreamError> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = &self.fail_with {
                return Err(Self::clone_error(err));
            }
            Ok(refs.iter().map(|r| self.papers.get(r).cloned()).collect())
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

    struct Harness {
        _tmp: TempDir,
        api: Arc<FakeApi>,
        store: Arc<GraphStore>,
        cache: Arc<HotCache>,
        resolver: PaperResolver,
    }

    async fn harness(api: FakeApi) -> Harness {
        harness_with(api, |_| {}).await
    }

    async fn harness_with(api: FakeApi, tweak: impl FnOnce(&mut Config)) -> Harness {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::from_env();
        config.poll_interval = Duration::from_millis(20);
        config.poll_wait = Duration::from_millis(2_000);
        config.large_relation_threshold = 100;
        tweak(&mut config);
        let config = Arc::new(config);

        let api = Arc::new(api);
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
            config,
        );
        Harness { _tmp: tmp, api, store, cache, resolver }
    }

    /// Background persistence is asynchronous; poll until it settles.
    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_cold_fetch_by_doi_records_aliases() {
        let h = harness(FakeApi::with_sample_paper()).await;
        let expr = FieldExpr::parse(Some("title,year,authors.name")).unwrap();

        let out = h.resolver.get_paper("DOI:10.18653/v1/N18-3011", &expr).await.unwrap();
        assert_eq!(out["paperId"], PAPER_ID);
        assert_eq!(out["year"], 2018);
        assert_eq!(out["authors"][0]["name"], "Waleed Ammar");
        assert_eq!(h.api.paper_calls.load(Ordering::SeqCst), 1);

        // Aliases and the paper node land asynchronously.
        let store = Arc::clone(&h.store);
        wait_until(|| {
            let store = Arc::clone(&store);
            async move {
                store
                    .aliases
                    .resolve(AliasKind::Doi, "10.18653/v1/n18-3011")
                    .await
                    .unwrap()
                    .is_some()
            }
        })
        .await;
        assert_eq!(
            h.store.aliases.resolve(AliasKind::Arxiv, "1805.02262").await.unwrap(),
            Some(PAPER_ID.to_string())
        );
        assert_eq!(
            h.store.aliases.resolve(AliasKind::CorpusId, "19170988").await.unwrap(),
            Some(PAPER_ID.to_string())
        );
        let stored = h.store.papers.get(PAPER_ID).await.unwrap().unwrap();
        // Inline relations are split off the stored node.
        assert!(stored.record.get("citations").is_none());
    }

    #[tokio::test]
    async fn test_second_fetch_by_other_alias_hits_cache() {
        let h = harness(FakeApi::with_sample_paper()).await;
        let expr = FieldExpr::default_paper();

        h.resolver.get_paper("ARXIV:1805.02262v2", &expr).await.unwrap();
        assert_eq!(h.api.paper_calls.load(Ordering::SeqCst), 1);

        let store = Arc::clone(&h.store);
        wait_until(|| {
            let store = Arc::clone(&store);
            async move {
                store.aliases.resolve(AliasKind::Arxiv, "1805.02262").await.unwrap().is_some()
            }
        })
        .await;

        let out = h.resolver.get_paper("ARXIV:1805.02262", &expr).await.unwrap();
        assert_eq!(out["paperId"], PAPER_ID);
        // Served from the hot cache: no second upstream call.
        assert_eq!(h.api.paper_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_flight_coalesces_concurrent_fetches() {
        let mut api = FakeApi::with_sample_paper();
        api.fetch_delay = Duration::from_millis(100);
        let h = harness(api).await;
        let expr = FieldExpr::default_paper();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let resolver = h.resolver.clone();
            let expr = expr.clone();
            handles.push(tokio::spawn(async move {
                resolver.get_paper(PAPER_ID, &expr).await
            }));
        }
        for handle in handles {
            let out = handle.await.unwrap().unwrap();
            assert_eq!(out["paperId"], PAPER_ID);
        }
        assert_eq!(h.api.paper_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_found_populates_negative_cache() {
        let h = harness(FakeApi::new()).await;
        let expr = FieldExpr::default_paper();
        let missing = "0000000000000000000000000000000000000000";

        let err = h.resolver.get_paper(missing, &expr).await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound));
        assert_eq!(h.api.paper_calls.load(Ordering::SeqCst), 1);

        let err = h.resolver.get_paper(missing, &expr).await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound));
        // Second miss answered by the negative cache.
        assert_eq!(h.api.paper_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bad_refs_rejected() {
        let h = harness(FakeApi::new()).await;
        let expr = FieldExpr::default_paper();

        let err = h.resolver.get_paper("definitely-not-an-id", &expr).await.unwrap_err();
        assert!(matches!(err, ResolveError::BadRequest(_)));
        assert_eq!(h.api.paper_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_fallback_when_upstream_down() {
        // Freshness window of zero makes every stored record stale.
        let h = harness_with(FakeApi::with_sample_paper(), |c| c.freshness_window_hours = 0).await;
        let expr = FieldExpr::parse(Some("title,year")).unwrap();

        h.resolver.get_paper(PAPER_ID, &expr).await.unwrap();
        let store = Arc::clone(&h.store);
        wait_until(|| {
            let store = Arc::clone(&store);
            async move { store.papers.get(PAPER_ID).await.unwrap().is_some() }
        })
        .await;
        h.cache.invalidate_paper(PAPER_ID).await;

        // Upstream goes down; the stale store copy is served, tagged.
        let mut api = FakeApi::with_sample_paper();
        api.fail_with = Some(UpstreamError::Unavailable("503".to_string()));
        let api = Arc::new(api);
        let resolver = PaperResolver::new(
            api.clone() as Arc<dyn PaperApi>,
            Arc::clone(&h.store),
            Arc::clone(&h.cache),
            Arc::new(RelationIngestor::new(
                api as Arc<dyn PaperApi>,
                Arc::clone(&h.store),
                Arc::clone(&h.cache),
                Arc::new(Config::from_env()),
            )),
            None,
            Arc::new({
                let mut c = Config::from_env();
                c.freshness_window_hours = 0;
                c
            }),
        );

        let out = resolver.get_paper(PAPER_ID, &expr).await.unwrap();
        assert_eq!(out["title"], "Construction of the Literature Graph in Semantic Scholar");
        assert_eq!(out["data_may_be_outdated"], true);
    }

    #[tokio::test]
    async fn test_batch_preserves_order_with_nulls() {
        let h = harness(FakeApi::with_sample_paper()).await;
        let expr = FieldExpr::parse(Some("title")).unwrap();

        let refs = vec![
            PAPER_ID.to_string(),
            "DOI:10.invalid/none".to_string(),
            "ARXIV:1805.02262".to_string(),
        ];
        let out = h.resolver.get_batch(&refs, &expr).await.unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].as_ref().unwrap()["paperId"], PAPER_ID);
        assert!(out[1].is_none());
        assert_eq!(
            out[2].as_ref().unwrap()["title"],
            "Construction of the Literature Graph in Semantic Scholar"
        );
        assert_eq!(h.api.batch_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_batch_cap_enforced() {
        let h = harness_with(FakeApi::new(), |c| c.batch_cap = 500).await;
        let expr = FieldExpr::default_paper();

        let ok_refs: Vec<String> = (0..500).map(|_| PAPER_ID.to_string()).collect();
        assert!(h.resolver.get_batch(&ok_refs, &expr).await.is_ok());

        let too_many: Vec<String> = (0..501).map(|_| PAPER_ID.to_string()).collect();
        let err = h.resolver.get_batch(&too_many, &expr).await.unwrap_err();
        assert!(matches!(err, ResolveError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_relations_served_from_blob() {
        let h = harness(FakeApi::with_sample_paper()).await;
        let expr = FieldExpr::parse(Some("title")).unwrap();

        let neighbors: Vec<Value> = (0..20)
            .map(|i| json!({"paperId": format!("n{}", i), "title": format!("N {}", i)}))
            .collect();
        h.store
            .relations
            .store_blob(PAPER_ID, RelationKind::Citations, &neighbors, 20)
            .await
            .unwrap();

        let out = h
            .resolver
            .get_relations(PAPER_ID, RelationKind::Citations, 5, 3, &expr)
            .await
            .unwrap();
        assert_eq!(out["total"], 20);
        assert_eq!(out["offset"], 5);
        let data = out["data"].as_array().unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(data[0]["paperId"], "n5");
        assert_eq!(out["next"], 8);

        // Served without any upstream paper fetch.
        assert_eq!(h.api.paper_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_relations_offset_beyond_total_is_empty() {
        let h = harness(FakeApi::with_sample_paper()).await;
        let expr = FieldExpr::default_paper();

        let neighbors: Vec<Value> =
            (0..4).map(|i| json!({"paperId": format!("n{}", i), "title": "t"})).collect();
        h.store
            .relations
            .store_blob(PAPER_ID, RelationKind::References, &neighbors, 4)
            .await
            .unwrap();

        let out = h
            .resolver
            .get_relations(PAPER_ID, RelationKind::References, 10, 5, &expr)
            .await
            .unwrap();
        assert_eq!(out["total"], 4);
        assert!(out["data"].as_array().unwrap().is_empty());
        assert!(out.get("next").is_none());
    }

    #[tokio::test]
    async fn test_invalidate_then_read_repopulates() {
        let h = harness(FakeApi::with_sample_paper()).await;
        let expr = FieldExpr::default_paper();

        h.resolver.get_paper(PAPER_ID, &expr).await.unwrap();
        assert_eq!(h.api.paper_calls.load(Ordering::SeqCst), 1);
        assert!(h.cache.get_paper(PAPER_ID).await.is_some());

        h.resolver.invalidate(PAPER_ID).await.unwrap();
        assert!(h.cache.get_paper(PAPER_ID).await.is_none());

        // Next read repopulates (store copy is fresh, so no upstream call).
        let out = h.resolver.get_paper(PAPER_ID, &expr).await.unwrap();
        assert_eq!(out["paperId"], PAPER_ID);
        assert!(h.cache.get_paper(PAPER_ID).await.is_some());
    }

    #[tokio::test]
    async fn test_warm_populates_cache() {
        let h = harness(FakeApi::with_sample_paper()).await;
        h.resolver.warm(PAPER_ID).await.unwrap();
        assert!(h.cache.get_paper(PAPER_ID).await.is_some());
    }

    #[test]
    fn test_harvest_aliases_includes_title_norm() {
        let aliases = harvest_aliases(&sample_record());
        assert!(aliases.contains(&(AliasKind::Doi, "10.18653/v1/n18-3011".to_string())));
        assert!(aliases.contains(&(AliasKind::CorpusId, "19170988".to_string())));
        assert!(aliases
            .iter()
            .any(|(kind, value)| *kind == AliasKind::TitleNorm
                && value == "constructionoftheliteraturegraphinsemanticscholar"));
    }

    #[test]
    fn test_split_inline_strips_relations() {
        let (clean, inline) = split_inline(sample_record());
        assert!(clean.get("citations").is_none());
        assert!(clean.get("references").is_none());
        assert_eq!(inline.len(), 2);
        assert_eq!(inline[0].0, RelationKind::Citations);
        assert_eq!(inline[0].1.len(), 3);
    }
}
