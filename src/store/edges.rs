use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use chrono::Utc;
use futures::StreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use serde_json::Value;

use super::{col_str, escape, ensure_table};

const TABLE_NAME: &str = "cites";

/// A directed citation edge with merged attributes (contexts, intents,
/// isInfluential).
#[derive(Debug, Clone)]
pub struct CitationEdge {
    pub citing_id: String,
    pub cited_id: String,
    pub attrs: Value,
}

fn make_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("edge_key", DataType::Utf8, false),
        Field::new("citing_id", DataType::Utf8, false),
        Field::new("cited_id", DataType::Utf8, false),
        Field::new("attrs_json", DataType::Utf8, true),
        Field::new("updated_at", DataType::Utf8, false),
    ]))
}

/// Citation edge table. At most one edge per ordered pair; attribute sets
/// are last-writer-wins.
pub struct EdgeStore {
    db: lancedb::Connection,
    schema: Arc<Schema>,
}

impl EdgeStore {
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
            .context("Failed to open cites table")
    }

    /// Merge edges from one citing paper to many cited papers
    /// (a references listing).
    pub async fn merge_edges(
        &self,
        citing_id: &str,
        cited: &[(String, Value)],
    ) -> Result<()> {
        let pairs: Vec<(String, String, &Value)> = cited
            .iter()
            .map(|(cited_id, attrs)| (citing_id.to_string(), cited_id.clone(), attrs))
            .collect();
        self.merge(&pairs).await
    }

    /// Merge edges from many citing papers to one cited paper
    /// (a citations listing).
    pub async fn merge_edges_reverse(
        &self,
        cited_id: &str,
        citing: &[(String, Value)],
    ) -> Result<()> {
        let pairs: Vec<(String, String, &Value)> = citing
            .iter()
            .map(|(citing_id, attrs)| (citing_id.clone(), cited_id.to_string(), attrs))
            .collect();
        self.merge(&pairs).await
    }

    async fn merge(&self, pairs: &[(String, String, &Value)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        let keys: Vec<String> = pairs
            .iter()
            .map(|(from, to, _)| format!("{}->{}", from, to))
            .collect();
        let attrs: Vec<Option<String>> = pairs
            .iter()
            .map(|(_, _, a)| {
                if a.is_null() {
                    None
                } else {
                    serde_json::to_string(a).ok()
                }
            })
            .collect();

        let batch = RecordBatch::try_new(
            self.schema.clone(),
            vec![
                Arc::new(StringArray::from(
                    keys.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(
                    pairs.iter().map(|(from, _, _)| from.as_str()).collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(
                    pairs.iter().map(|(_, to, _)| to.as_str()).collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(
                    attrs.iter().map(|a| a.as_deref()).collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(vec![now.as_str(); pairs.len()])),
            ],
        )
        .context("Failed to build edge batch")?;

        let table = self.table().await?;
        let iter = RecordBatchIterator::new(vec![Ok(batch)], self.schema.clone());
        let mut builder = table.merge_insert(&["edge_key"]);
        builder.when_matched_update_all(None);
        builder.when_not_matched_insert_all();
        builder
            .execute(Box::new(iter))
            .await
            .context("Failed to merge edges")?;
        Ok(())
    }

    /// Edges leaving a paper (its references).
    pub async fn edges_from(&self, citing_id: &str) -> Result<Vec<CitationEdge>> {
        self.select(&format!("citing_id = '{}'", escape(citing_id))).await
    }

    /// Edges arriving at a paper (its citations).
    pub async fn edges_to(&self, cited_id: &str) -> Result<Vec<CitationEdge>> {
        self.select(&format!("cited_id = '{}'", escape(cited_id))).await
    }

    async fn select(&self, filter: &str) -> Result<Vec<CitationEdge>> {
        let table = self.table().await?;
        let mut stream = table
            .query()
            .only_if(filter.to_string())
            .execute()
            .await
            .context("Failed to query edges")?;

        let mut edges = Vec::new();
        while let Some(batch) = stream.next().await {
            let batch = batch.context("Failed to read edge rows")?;
            for row in 0..batch.num_rows() {
                let attrs = col_str(&batch, "attrs_json", row)
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or(Value::Null);
                edges.push(CitationEdge {
                    citing_id: col_str(&batch, "citing_id", row).unwrap_or_default(),
                    cited_id: col_str(&batch, "cited_id", row).unwrap_or_default(),
                    attrs,
                });
            }
        }
        Ok(edges)
    }

    pub async fn count(&self) -> Result<usize> {
        let table = self.table().await?;
        table.count_rows(None).await.context("Failed to count edges")
    }
}
