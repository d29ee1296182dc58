use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use serde_json::{Map, Value};

use super::{col_str, col_time, escape, ensure_table};

const TABLE_NAME: &str = "papers";

/// How a paper entered the store: as a bare neighbor reference, or fetched
/// in its own right.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStatus {
    Stub,
    Full,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Stub => "stub",
            IngestStatus::Full => "full",
        }
    }

    fn from_str(s: &str) -> Self {
        if s == "full" {
            IngestStatus::Full
        } else {
            IngestStatus::Stub
        }
    }
}

/// A paper node as persisted: identity, ingest bookkeeping, and the merged
/// superset record.
#[derive(Debug, Clone)]
pub struct StoredPaper {
    pub paper_id: String,
    pub ingest_status: IngestStatus,
    pub fetched_at: Option<DateTime<Utc>>,
    pub metadata_updated_at: Option<DateTime<Utc>>,
    pub record: Value,
}

impl StoredPaper {
    /// A record is fresh when its last metadata update is inside the
    /// freshness window. Stubs are never fresh.
    pub fn is_fresh(&self, window_hours: i64) -> bool {
        if self.ingest_status != IngestStatus::Full {
            return false;
        }
        self.metadata_updated_at
            .map(|t| Utc::now() - t < chrono::Duration::hours(window_hours))
            .unwrap_or(false)
    }
}

fn make_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("paper_id", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, true),
        Field::new("ingest_status", DataType::Utf8, false),
        Field::new("fetched_at", DataType::Utf8, true),
        Field::new("metadata_updated_at", DataType::Utf8, true),
        Field::new("record_json", DataType::Utf8, false),
    ]))
}

/// Paper node table.
pub struct PaperStore {
    db: lancedb::Connection,
    schema: Arc<Schema>,
}

impl PaperStore {
    pub async fn create_or_open(db: &lancedb::Connection) -> Result<Self> {
        let schema = make_schema();
        ensure_table(db, TABLE_NAME, schema.clone()).await?;
        Ok(Self { db: db.clone(), schema })
    }

    async fn table(&self) -> Result<lancedb::Table> {
        self.db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .context("Failed to open papers table")
    }

    /// Fetch a paper node by canonical id.
    pub async fn get(&self, paper_id: &str) -> Result<Option<StoredPaper>> {
        let table = self.table().await?;
        let filter = format!("paper_id = '{}'", escape(paper_id));
        let mut stream = table
            .query()
            .only_if(filter)
            .limit(1)
            .execute()
            .await
            .context("Failed to query papers")?;

        if let Some(batch) = stream.next().await {
            let batch = batch.context("Failed to read paper row")?;
            if batch.num_rows() > 0 {
                return Ok(Some(row_to_paper(&batch, 0)?));
            }
        }
        Ok(None)
    }

    /// Merge a freshly fetched record into the node. Existing fields absent
    /// from the new record are kept; `full` status is never downgraded;
    /// timestamps advance.
    pub async fn upsert_full(&self, record: &Value) -> Result<String> {
        let paper_id = record
            .get("paperId")
            .and_then(Value::as_str)
            .context("Record is missing paperId")?
            .to_string();

        let existing = self.get(&paper_id).await?;
        let mut merged = match existing.as_ref().map(|e| &e.record) {
            Some(Value::Object(m)) => m.clone(),
            _ => Map::new(),
        };
        if let Value::Object(new_fields) = record {
            for (key, value) in new_fields {
                if !value.is_null() {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }

        let now = Utc::now();
        let stored = StoredPaper {
            paper_id: paper_id.clone(),
            ingest_status: IngestStatus::Full,
            fetched_at: Some(now),
            metadata_updated_at: Some(now),
            record: Value::Object(merged),
        };
        self.put(&stored).await?;
        Ok(paper_id)
    }

    /// Create missing neighbor nodes with `stub` status and minimal fields.
    /// Existing nodes are left untouched.
    pub async fn upsert_stubs(&self, neighbors: &[Value]) -> Result<usize> {
        let mut ids = Vec::new();
        let mut titles = Vec::new();
        let mut records = Vec::new();
        for neighbor in neighbors {
            let Some(id) = neighbor.get("paperId").and_then(Value::as_str) else {
                continue;
            };
            let title = neighbor.get("title").and_then(Value::as_str);
            let mut record = Map::new();
            record.insert("paperId".to_string(), Value::String(id.to_string()));
            if let Some(t) = title {
                record.insert("title".to_string(), Value::String(t.to_string()));
            }
            ids.push(id.to_string());
            titles.push(title.map(|t| t.to_string()));
            records.push(serde_json::to_string(&Value::Object(record))?);
        }
        if ids.is_empty() {
            return Ok(0);
        }

        let count = ids.len();
        let batch = RecordBatch::try_new(
            self.schema.clone(),
            vec![
                Arc::new(StringArray::from(
                    ids.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(
                    titles.iter().map(|t| t.as_deref()).collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(vec![IngestStatus::Stub.as_str(); count])),
                Arc::new(StringArray::from(vec![None::<&str>; count])),
                Arc::new(StringArray::from(vec![None::<&str>; count])),
                Arc::new(StringArray::from(
                    records.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
                )),
            ],
        )
        .context("Failed to build stub batch")?;

        let table = self.table().await?;
        let iter = RecordBatchIterator::new(vec![Ok(batch)], self.schema.clone());
        let mut builder = table.merge_insert(&["paper_id"]);
        builder.when_not_matched_insert_all();
        builder
            .execute(Box::new(iter))
            .await
            .context("Failed to insert neighbor stubs")?;
        Ok(count)
    }

    async fn put(&self, stored: &StoredPaper) -> Result<()> {
        let title = stored
            .record
            .get("title")
            .and_then(Value::as_str)
            .map(|t| t.to_string());
        let record_json = serde_json::to_string(&stored.record)?;
        let fetched = stored.fetched_at.map(|t| t.to_rfc3339());
        let updated = stored.metadata_updated_at.map(|t| t.to_rfc3339());

        let batch = RecordBatch::try_new(
            self.schema.clone(),
            vec![
                Arc::new(StringArray::from(vec![stored.paper_id.as_str()])),
                Arc::new(StringArray::from(vec![title.as_deref()])),
                Arc::new(StringArray::from(vec![stored.ingest_status.as_str()])),
                Arc::new(StringArray::from(vec![fetched.as_deref()])),
                Arc::new(StringArray::from(vec![updated.as_deref()])),
                Arc::new(StringArray::from(vec![record_json.as_str()])),
            ],
        )
        .context("Failed to build paper batch")?;

        let table = self.table().await?;
        let iter = RecordBatchIterator::new(vec![Ok(batch)], self.schema.clone());
        let mut builder = table.merge_insert(&["paper_id"]);
        builder.when_matched_update_all(None);
        builder.when_not_matched_insert_all();
        builder
            .execute(Box::new(iter))
            .await
            .context("Failed to upsert paper")?;
        Ok(())
    }

    pub async fn count(&self) -> Result<usize> {
        let table = self.table().await?;
        table.count_rows(None).await.context("Failed to count papers")
    }
}

fn row_to_paper(batch: &RecordBatch, row: usize) -> Result<StoredPaper> {
    let record = col_str(batch, "record_json", row)
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .context("Corrupt record_json")?
        .unwrap_or(Value::Null);
    Ok(StoredPaper {
        paper_id: col_str(batch, "paper_id", row).unwrap_or_default(),
        ingest_status: IngestStatus::from_str(
            col_str(batch, "ingest_status", row).unwrap_or_default().as_str(),
        ),
        fetched_at: col_time(batch, "fetched_at", row),
        metadata_updated_at: col_time(batch, "metadata_updated_at", row),
        record,
    })
}
