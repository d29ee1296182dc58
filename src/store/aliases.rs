use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use chrono::Utc;
use futures::StreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};

use crate::ids::AliasKind;

use super::{col_str, escape, ensure_table};

const TABLE_NAME: &str = "aliases";

/// An alias write that found the pair already pointing at a different
/// paper. The original target is kept.
#[derive(Debug, Clone)]
pub struct AliasConflict {
    pub kind: AliasKind,
    pub value: String,
    pub existing_target: String,
    pub attempted_target: String,
}

fn make_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("alias_key", DataType::Utf8, false),
        Field::new("kind", DataType::Utf8, false),
        Field::new("value", DataType::Utf8, false),
        Field::new("paper_id", DataType::Utf8, false),
        Field::new("created_at", DataType::Utf8, false),
        Field::new("updated_at", DataType::Utf8, false),
    ]))
}

fn alias_key(kind: AliasKind, value: &str) -> String {
    format!("{}:{}", kind.as_str(), value)
}

/// Durable `(kind, normalized_value) → paper_id` index.
pub struct AliasStore {
    db: lancedb::Connection,
    schema: Arc<Schema>,
}

impl AliasStore {
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
            .context("Failed to open aliases table")
    }

    /// Look up the canonical paper id for a normalized alias value.
    pub async fn resolve(&self, kind: AliasKind, value: &str) -> Result<Option<String>> {
        let table = self.table().await?;
        let filter = format!("alias_key = '{}'", escape(&alias_key(kind, value)));
        let mut stream = table
            .query()
            .only_if(filter)
            .limit(1)
            .execute()
            .await
            .context("Failed to query aliases")?;

        if let Some(batch) = stream.next().await {
            let batch = batch.context("Failed to read alias row")?;
            if batch.num_rows() > 0 {
                return Ok(col_str(&batch, "paper_id", 0));
            }
        }
        Ok(None)
    }

    /// Record aliases for a paper. An alias already pointing elsewhere is
    /// left alone and reported as a conflict; writes are atomic per alias.
    pub async fn record(
        &self,
        paper_id: &str,
        aliases: &[(AliasKind, String)],
    ) -> Result<Vec<AliasConflict>> {
        let mut conflicts = Vec::new();
        for (kind, value) in aliases {
            match self.resolve(*kind, value).await? {
                Some(existing) if existing != paper_id => {
                    conflicts.push(AliasConflict {
                        kind: *kind,
                        value: value.clone(),
                        existing_target: existing,
                        attempted_target: paper_id.to_string(),
                    });
                }
                Some(_) => {}
                None => self.insert(*kind, value, paper_id).await?,
            }
        }
        Ok(conflicts)
    }

    /// All recorded aliases of a paper as `(kind, normalized_value)` pairs.
    pub async fn aliases_of(&self, paper_id: &str) -> Result<Vec<(String, String)>> {
        let table = self.table().await?;
        let filter = format!("paper_id = '{}'", escape(paper_id));
        let mut stream = table
            .query()
            .only_if(filter)
            .execute()
            .await
            .context("Failed to query aliases by paper")?;

        let mut out = Vec::new();
        while let Some(batch) = stream.next().await {
            let batch = batch.context("Failed to read alias rows")?;
            for row in 0..batch.num_rows() {
                if let (Some(kind), Some(value)) =
                    (col_str(&batch, "kind", row), col_str(&batch, "value", row))
                {
                    out.push((kind, value));
                }
            }
        }
        Ok(out)
    }

    async fn insert(&self, kind: AliasKind, value: &str, paper_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let key = alias_key(kind, value);
        let batch = RecordBatch::try_new(
            self.schema.clone(),
            vec![
                Arc::new(StringArray::from(vec![key.as_str()])),
                Arc::new(StringArray::from(vec![kind.as_str()])),
                Arc::new(StringArray::from(vec![value])),
                Arc::new(StringArray::from(vec![paper_id])),
                Arc::new(StringArray::from(vec![now.as_str()])),
                Arc::new(StringArray::from(vec![now.as_str()])),
            ],
        )
        .context("Failed to build alias batch")?;

        let table = self.table().await?;
        let iter = RecordBatchIterator::new(vec![Ok(batch)], self.schema.clone());
        // Insert-if-absent keeps the first recorded target under races.
        let mut builder = table.merge_insert(&["alias_key"]);
        builder.when_not_matched_insert_all();
        builder
            .execute(Box::new(iter))
            .await
            .context("Failed to insert alias")?;
        Ok(())
    }

    pub async fn count(&self) -> Result<usize> {
        let table = self.table().await?;
        table.count_rows(None).await.context("Failed to count aliases")
    }
}
