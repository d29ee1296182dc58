use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Int64Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::upstream::RelationKind;

use super::{col_i64, col_str, col_time, escape, ensure_table};

const BLOB_TABLE: &str = "relations";
const PROGRESS_TABLE: &str = "ingest_progress";

/// State of a paginated relation ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestState {
    Pending,
    Running,
    Complete,
    Failed,
}

impl IngestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestState::Pending => "pending",
            IngestState::Running => "running",
            IngestState::Complete => "complete",
            IngestState::Failed => "failed",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "running" => IngestState::Running,
            "complete" => IngestState::Complete,
            "failed" => IngestState::Failed,
            _ => IngestState::Pending,
        }
    }
}

/// Persistent cursor for a `(paper, kind)` pagination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestProgress {
    pub state: IngestState,
    pub pages_fetched: u64,
    pub expected_total: Option<u64>,
    pub last_cursor: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

impl IngestProgress {
    pub fn new(expected_total: Option<u64>) -> Self {
        Self {
            state: IngestState::Pending,
            pages_fetched: 0,
            expected_total,
            last_cursor: None,
            updated_at: Utc::now(),
        }
    }
}

/// A contiguous slice of a merged relation blob.
#[derive(Debug, Clone)]
pub struct RelationSlice {
    pub total: u64,
    pub offset: u64,
    pub items: Vec<Value>,
}

/// The full merged neighbor list for a `(paper, kind)` pair.
#[derive(Debug, Clone)]
pub struct RelationBlob {
    pub total: u64,
    pub items: Vec<Value>,
    pub updated_at: DateTime<Utc>,
}

fn blob_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("rel_key", DataType::Utf8, false),
        Field::new("paper_id", DataType::Utf8, false),
        Field::new("kind", DataType::Utf8, false),
        Field::new("items_json", DataType::Utf8, false),
        Field::new("total", DataType::Int64, false),
        Field::new("updated_at", DataType::Utf8, false),
    ]))
}

fn progress_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("rel_key", DataType::Utf8, false),
        Field::new("paper_id", DataType::Utf8, false),
        Field::new("kind", DataType::Utf8, false),
        Field::new("state", DataType::Utf8, false),
        Field::new("pages_fetched", DataType::Int64, false),
        Field::new("expected_total", DataType::Int64, true),
        Field::new("last_cursor", DataType::Int64, true),
        Field::new("updated_at", DataType::Utf8, false),
    ]))
}

fn rel_key(paper_id: &str, kind: RelationKind) -> String {
    format!("{}:{}", paper_id, kind.as_str())
}

/// Relation blobs and ingest progress.
pub struct RelationStore {
    db: lancedb::Connection,
    blob_schema: Arc<Schema>,
    progress_schema: Arc<Schema>,
}

impl RelationStore {
    pub async fn create_or_open(db: &lancedb::Connection) -> Result<Self> {
        let blob_schema = blob_schema();
        let progress_schema = progress_schema();
        ensure_table(db, BLOB_TABLE, blob_schema.clone()).await?;
        ensure_table(db, PROGRESS_TABLE, progress_schema.clone()).await?;
        Ok(Self { db: db.clone(), blob_schema, progress_schema })
    }

    async fn blob_table(&self) -> Result<lancedb::Table> {
        self.db
            .open_table(BLOB_TABLE)
            .execute()
            .await
            .context("Failed to open relations table")
    }

    async fn progress_table(&self) -> Result<lancedb::Table> {
        self.db
            .open_table(PROGRESS_TABLE)
            .execute()
            .await
            .context("Failed to open ingest_progress table")
    }

    /// Replace the merged blob for a `(paper, kind)` pair.
    pub async fn store_blob(
        &self,
        paper_id: &str,
        kind: RelationKind,
        items: &[Value],
        total: u64,
    ) -> Result<()> {
        let items_json = serde_json::to_string(items)?;
        let now = Utc::now().to_rfc3339();
        let key = rel_key(paper_id, kind);

        let batch = RecordBatch::try_new(
            self.blob_schema.clone(),
            vec![
                Arc::new(StringArray::from(vec![key.as_str()])),
                Arc::new(StringArray::from(vec![paper_id])),
                Arc::new(StringArray::from(vec![kind.as_str()])),
                Arc::new(StringArray::from(vec![items_json.as_str()])),
                Arc::new(Int64Array::from(vec![total as i64])),
                Arc::new(StringArray::from(vec![now.as_str()])),
            ],
        )
        .context("Failed to build relation batch")?;

        let table = self.blob_table().await?;
        let iter = RecordBatchIterator::new(vec![Ok(batch)], self.blob_schema.clone());
        let mut builder = table.merge_insert(&["rel_key"]);
        builder.when_matched_update_all(None);
        builder.when_not_matched_insert_all();
        builder
            .execute(Box::new(iter))
            .await
            .context("Failed to store relation blob")?;
        Ok(())
    }

    /// Read the full merged blob.
    pub async fn get_blob(
        &self,
        paper_id: &str,
        kind: RelationKind,
    ) -> Result<Option<RelationBlob>> {
        let table = self.blob_table().await?;
        let filter = format!("rel_key = '{}'", escape(&rel_key(paper_id, kind)));
        let mut stream = table
            .query()
            .only_if(filter)
            .limit(1)
            .execute()
            .await
            .context("Failed to query relation blob")?;

        if let Some(batch) = stream.next().await {
            let batch = batch.context("Failed to read relation row")?;
            if batch.num_rows() > 0 {
                let items: Vec<Value> = col_str(&batch, "items_json", 0)
                    .map(|s| serde_json::from_str(&s))
                    .transpose()
                    .context("Corrupt items_json")?
                    .unwrap_or_default();
                return Ok(Some(RelationBlob {
                    total: col_i64(&batch, "total", 0).unwrap_or(items.len() as i64) as u64,
                    items,
                    updated_at: col_time(&batch, "updated_at", 0).unwrap_or_else(Utc::now),
                }));
            }
        }
        Ok(None)
    }

    /// Slice the merged blob. `offset` past the end yields an empty item
    /// list with the total unchanged.
    pub async fn get_slice(
        &self,
        paper_id: &str,
        kind: RelationKind,
        offset: u64,
        limit: u64,
    ) -> Result<Option<RelationSlice>> {
        let Some(blob) = self.get_blob(paper_id, kind).await? else {
            return Ok(None);
        };
        let start = (offset as usize).min(blob.items.len());
        let end = (start + limit as usize).min(blob.items.len());
        Ok(Some(RelationSlice {
            total: blob.total,
            offset,
            items: blob.items[start..end].to_vec(),
        }))
    }

    pub async fn get_progress(
        &self,
        paper_id: &str,
        kind: RelationKind,
    ) -> Result<Option<IngestProgress>> {
        let table = self.progress_table().await?;
        let filter = format!("rel_key = '{}'", escape(&rel_key(paper_id, kind)));
        let mut stream = table
            .query()
            .only_if(filter)
            .limit(1)
            .execute()
            .await
            .context("Failed to query ingest progress")?;

        if let Some(batch) = stream.next().await {
            let batch = batch.context("Failed to read progress row")?;
            if batch.num_rows() > 0 {
                return Ok(Some(IngestProgress {
                    state: IngestState::from_str(
                        col_str(&batch, "state", 0).unwrap_or_default().as_str(),
                    ),
                    pages_fetched: col_i64(&batch, "pages_fetched", 0).unwrap_or(0) as u64,
                    expected_total: col_i64(&batch, "expected_total", 0).map(|v| v as u64),
                    last_cursor: col_i64(&batch, "last_cursor", 0).map(|v| v as u64),
                    updated_at: col_time(&batch, "updated_at", 0).unwrap_or_else(Utc::now),
                }));
            }
        }
        Ok(None)
    }

    pub async fn set_progress(
        &self,
        paper_id: &str,
        kind: RelationKind,
        progress: &IngestProgress,
    ) -> Result<()> {
        let key = rel_key(paper_id, kind);
        let now = Utc::now().to_rfc3339();

        let batch = RecordBatch::try_new(
            self.progress_schema.clone(),
            vec![
                Arc::new(StringArray::from(vec![key.as_str()])),
                Arc::new(StringArray::from(vec![paper_id])),
                Arc::new(StringArray::from(vec![kind.as_str()])),
                Arc::new(StringArray::from(vec![progress.state.as_str()])),
                Arc::new(Int64Array::from(vec![progress.pages_fetched as i64])),
                Arc::new(Int64Array::from(vec![progress.expected_total.map(|v| v as i64)])),
                Arc::new(Int64Array::from(vec![progress.last_cursor.map(|v| v as i64)])),
                Arc::new(StringArray::from(vec![now.as_str()])),
            ],
        )
        .context("Failed to build progress batch")?;

        let table = self.progress_table().await?;
        let iter = RecordBatchIterator::new(vec![Ok(batch)], self.progress_schema.clone());
        let mut builder = table.merge_insert(&["rel_key"]);
        builder.when_matched_update_all(None);
        builder.when_not_matched_insert_all();
        builder
            .execute(Box::new(iter))
            .await
            .context("Failed to set ingest progress")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_store(tmp: &TempDir) -> RelationStore {
        let db = lancedb::connect(tmp.path().to_str().unwrap())
            .execute()
            .await
            .unwrap();
        RelationStore::create_or_open(&db).await.unwrap()
    }

    fn neighbors(n: usize) -> Vec<Value> {
        (0..n)
            .map(|i| json!({"paperId": format!("n{}", i), "title": format!("Neighbor {}", i)}))
            .collect()
    }

    #[tokio::test]
    async fn test_blob_replace_and_slice() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        store
            .store_blob("abc", RelationKind::Citations, &neighbors(10), 10)
            .await
            .unwrap();

        let slice = store
            .get_slice("abc", RelationKind::Citations, 3, 4)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(slice.total, 10);
        assert_eq!(slice.offset, 3);
        assert_eq!(slice.items.len(), 4);
        assert_eq!(slice.items[0]["paperId"], "n3");

        // Replacing shrinks the blob atomically.
        store
            .store_blob("abc", RelationKind::Citations, &neighbors(2), 2)
            .await
            .unwrap();
        let blob = store.get_blob("abc", RelationKind::Citations).await.unwrap().unwrap();
        assert_eq!(blob.items.len(), 2);
        assert_eq!(blob.total, 2);
    }

    #[tokio::test]
    async fn test_slice_past_end_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        store
            .store_blob("abc", RelationKind::References, &neighbors(5), 5)
            .await
            .unwrap();
        let slice = store
            .get_slice("abc", RelationKind::References, 100, 10)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(slice.total, 5);
        assert!(slice.items.is_empty());
    }

    #[tokio::test]
    async fn test_kinds_are_distinct() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        store
            .store_blob("abc", RelationKind::Citations, &neighbors(3), 3)
            .await
            .unwrap();
        assert!(store
            .get_blob("abc", RelationKind::References)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_progress_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        assert!(store
            .get_progress("abc", RelationKind::Citations)
            .await
            .unwrap()
            .is_none());

        let mut progress = IngestProgress::new(Some(3500));
        progress.state = IngestState::Running;
        progress.pages_fetched = 7;
        progress.last_cursor = Some(700);
        store
            .set_progress("abc", RelationKind::Citations, &progress)
            .await
            .unwrap();

        let got = store
            .get_progress("abc", RelationKind::Citations)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.state, IngestState::Running);
        assert_eq!(got.pages_fetched, 7);
        assert_eq!(got.expected_total, Some(3500));
        assert_eq!(got.last_cursor, Some(700));

        progress.state = IngestState::Complete;
        store
            .set_progress("abc", RelationKind::Citations, &progress)
            .await
            .unwrap();
        let done = store
            .get_progress("abc", RelationKind::Citations)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.state, IngestState::Complete);
    }
}
