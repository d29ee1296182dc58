pub mod aliases;
pub mod edges;
pub mod papers;
pub mod relations;

use std::path::Path;

use anyhow::{Context, Result};
use arrow_array::{Array, Int64Array, RecordBatch, StringArray};

/// Durable tier: paper nodes, the alias index, citation edges, relation
/// blobs, and ingest progress, all in one LanceDB database.
pub struct GraphStore {
    pub papers: papers::PaperStore,
    pub aliases: aliases::AliasStore,
    pub edges: edges::EdgeStore,
    pub relations: relations::RelationStore,
}

impl GraphStore {
    /// Create or open the store at the given data directory.
    pub async fn create_or_open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path).context("Failed to create graph store directory")?;

        let db = lancedb::connect(path.to_str().context("Store path is not valid UTF-8")?)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        Ok(Self {
            papers: papers::PaperStore::create_or_open(&db).await?,
            aliases: aliases::AliasStore::create_or_open(&db).await?,
            edges: edges::EdgeStore::create_or_open(&db).await?,
            relations: relations::RelationStore::create_or_open(&db).await?,
        })
    }
}

/// Ensure a table exists, creating it empty when missing.
pub(crate) async fn ensure_table(
    db: &lancedb::Connection,
    name: &str,
    schema: std::sync::Arc<arrow_schema::Schema>,
) -> Result<()> {
    let tables = db
        .table_names()
        .execute()
        .await
        .context("Failed to list tables")?;
    if !tables.contains(&name.to_string()) {
        db.create_empty_table(name, schema)
            .execute()
            .await
            .with_context(|| format!("Failed to create {} table", name))?;
    }
    Ok(())
}

pub(crate) fn escape(s: &str) -> String {
    s.replace('\'', "''")
}

/// Read an optional string column value at the given row.
pub(crate) fn col_str(batch: &RecordBatch, name: &str, row: usize) -> Option<String> {
    batch
        .column_by_name(name)?
        .as_any()
        .downcast_ref::<StringArray>()
        .and_then(|a| {
            if a.is_null(row) {
                None
            } else {
                Some(a.value(row).to_string())
            }
        })
}

/// Read an optional i64 column value at the given row.
pub(crate) fn col_i64(batch: &RecordBatch, name: &str, row: usize) -> Option<i64> {
    batch
        .column_by_name(name)?
        .as_any()
        .downcast_ref::<Int64Array>()
        .and_then(|a| if a.is_null(row) { None } else { Some(a.value(row)) })
}

/// Parse an RFC 3339 column value into a UTC timestamp.
pub(crate) fn col_time(
    batch: &RecordBatch,
    name: &str,
    row: usize,
) -> Option<chrono::DateTime<chrono::Utc>> {
    col_str(batch, name, row)
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&chrono::Utc))
}
