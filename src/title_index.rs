use std::path::Path;

use anyhow::{Context, Result};
use tantivy::{
    collector::TopDocs,
    doc,
    query::QueryParser,
    schema::*,
    Index, IndexReader, IndexWriter, ReloadPolicy, Term,
};

/// Tantivy BM25 index over stored paper titles. Backs the search
/// coordinator's prefer-local mode only; it is not a full-text index.
pub struct TitleIndex {
    index: Index,
    reader: IndexReader,
    writer: IndexWriter,
    f_id: Field,
    f_title: Field,
}

impl TitleIndex {
    /// Create or open the index at the given directory.
    pub fn create_or_open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path).context("Failed to create title index directory")?;

        let mut schema_builder = Schema::builder();
        let f_id = schema_builder.add_text_field("paper_id", STRING | STORED);
        let f_title = schema_builder.add_text_field("title", TEXT | STORED);
        let schema = schema_builder.build();

        let dir = tantivy::directory::MmapDirectory::open(path)
            .context("Failed to open MmapDirectory")?;
        let index = Index::open_or_create(dir, schema)
            .context("Failed to open or create title index")?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .context("Failed to create index reader")?;

        let writer = index.writer(15_000_000).context("Failed to create index writer")?;

        Ok(Self { index, reader, writer, f_id, f_title })
    }

    /// Add or replace a paper's title.
    pub fn add_paper(&mut self, paper_id: &str, title: &str) -> Result<()> {
        self.writer
            .delete_term(Term::from_field_text(self.f_id, paper_id));
        self.writer
            .add_document(doc!(
                self.f_id => paper_id,
                self.f_title => title,
            ))
            .context("Failed to add title document")?;
        Ok(())
    }

    /// Commit pending changes to make them searchable.
    pub fn commit(&mut self) -> Result<()> {
        self.writer.commit().context("Failed to commit")?;
        self.reader.reload().context("Failed to reload reader")?;
        Ok(())
    }

    /// Search titles. Returns `(paper_id, title, score)` ranked by BM25.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<(String, String, f32)>> {
        let searcher = self.reader.searcher();
        let query_parser = QueryParser::for_index(&self.index, vec![self.f_title]);
        let parsed = query_parser
            .parse_query(query)
            .context("Failed to parse title query")?;

        let top_docs = searcher
            .search(&parsed, &TopDocs::with_limit(limit))
            .context("Title search failed")?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(doc_address)
                .context("Failed to retrieve document")?;
            let id = doc.get_first(self.f_id).and_then(|v| v.as_str());
            let title = doc.get_first(self.f_title).and_then(|v| v.as_str());
            if let (Some(id), Some(title)) = (id, title) {
                results.push((id.to_string(), title.to_string(), score));
            }
        }
        Ok(results)
    }

    pub fn count(&self) -> u64 {
        self.reader.searcher().num_docs()
    }
}
