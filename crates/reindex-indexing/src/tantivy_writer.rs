//! Search index writer backed by a tantivy index on disk.
//!
//! Every document lives under a `"{index}/{id}"` key: an upsert deletes the
//! key then adds the new document. Writes are invisible until
//! [`SearchIndexWriter::commit`]. Version checks only see committed
//! documents.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tantivy::collector::TopDocs;
use tantivy::query::TermQuery;
use tantivy::schema::{Field, IndexRecordOption, Schema, Value as _, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tracing::{debug, info};

use crate::error::WriteError;
use crate::source::SearchIndexWriter;

#[derive(Debug, Clone, Copy)]
struct DocumentFields {
    /// `"{index}/{id}"`, the delete key (STRING)
    doc_key: Field,
    /// Logical index name (STRING | STORED)
    index_name: Field,
    doc_id: Field,
    /// External version (STORED)
    version: Field,
    /// Document JSON, searchable (TEXT | STORED)
    body: Field,
}

fn build_schema() -> (Schema, DocumentFields) {
    let mut builder = Schema::builder();
    let doc_key = builder.add_text_field("doc_key", STRING);
    let index_name = builder.add_text_field("index_name", STRING | STORED);
    let doc_id = builder.add_text_field("doc_id", STRING | STORED);
    let version = builder.add_i64_field("version", STORED);
    let body = builder.add_text_field("body", TEXT | STORED);
    let fields = DocumentFields {
        doc_key,
        index_name,
        doc_id,
        version,
        body,
    };
    (builder.build(), fields)
}

fn fields_from_schema(schema: &Schema) -> Result<DocumentFields, WriteError> {
    let field = |name: &str| {
        schema
            .get_field(name)
            .map_err(|_| WriteError::Rejected(format!("index schema is missing the {} field", name)))
    };
    Ok(DocumentFields {
        doc_key: field("doc_key")?,
        index_name: field("index_name")?,
        doc_id: field("doc_id")?,
        version: field("version")?,
        body: field("body")?,
    })
}

fn doc_key(index: &str, id: &str) -> String {
    format!("{}/{}", index, id)
}

pub struct TantivyIndexWriter {
    writer: Arc<Mutex<IndexWriter>>,
    reader: IndexReader,
    fields: DocumentFields,
}

impl TantivyIndexWriter {
    /// Open the index at `path`, creating it if needed.
    pub fn open_or_create(path: &Path, writer_memory_mb: usize) -> Result<Self, WriteError> {
        let (index, fields) = if path.join("meta.json").exists() {
            debug!(path = ?path, "Opening existing search index");
            let index = Index::open_in_dir(path)?;
            let fields = fields_from_schema(&index.schema())?;
            (index, fields)
        } else {
            info!(path = ?path, "Creating new search index");
            std::fs::create_dir_all(path)?;
            let (schema, fields) = build_schema();
            (Index::create_in_dir(path, schema)?, fields)
        };
        Self::from_index(index, fields, writer_memory_mb)
    }

    /// RAM-only index, for tests and dry runs.
    pub fn in_memory(writer_memory_mb: usize) -> Result<Self, WriteError> {
        let (schema, fields) = build_schema();
        Self::from_index(Index::create_in_ram(schema), fields, writer_memory_mb)
    }

    fn from_index(index: Index, fields: DocumentFields, writer_memory_mb: usize) -> Result<Self, WriteError> {
        let writer = index.writer(writer_memory_mb * 1024 * 1024)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()?;
        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            reader,
            fields,
        })
    }

    /// Committed documents across all logical indexes.
    pub fn doc_count(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    /// Committed version and body of one document.
    pub fn get(&self, index: &str, id: &str) -> Result<Option<(i64, serde_json::Value)>, WriteError> {
        let searcher = self.reader.searcher();
        let term = Term::from_field_text(self.fields.doc_key, &doc_key(index, id));
        let query = TermQuery::new(term, IndexRecordOption::Basic);
        let top = searcher.search(&query, &TopDocs::with_limit(1))?;
        let Some((_, address)) = top.into_iter().next() else {
            return Ok(None);
        };
        let doc: TantivyDocument = searcher.doc(address)?;
        let version = doc
            .get_first(self.fields.version)
            .and_then(|v| v.as_i64())
            .unwrap_or_default();
        let body = doc
            .get_first(self.fields.body)
            .and_then(|v| v.as_str())
            .map(|raw| serde_json::from_str::<serde_json::Value>(raw))
            .transpose()
            .map_err(|e| WriteError::Rejected(format!("stored body is not JSON: {}", e)))?
            .unwrap_or(serde_json::Value::Null);
        Ok(Some((version, body)))
    }
}

#[async_trait]
impl SearchIndexWriter for TantivyIndexWriter {
    async fn upsert(&self, index: &str, id: &str, version: i64, doc: &serde_json::Value) -> Result<(), WriteError> {
        if let Some((current, _)) = self.get(index, id)? {
            if current > version {
                return Err(WriteError::Conflict {
                    id: id.to_string(),
                    version,
                    current,
                });
            }
        }
        let body = serde_json::to_string(doc)
            .map_err(|e| WriteError::Rejected(format!("document is not serializable: {}", e)))?;
        let key = doc_key(index, id);

        let writer = self
            .writer
            .lock()
            .map_err(|e| WriteError::IndexLocked(e.to_string()))?;
        writer.delete_term(Term::from_field_text(self.fields.doc_key, &key));
        writer.add_document(doc!(
            self.fields.doc_key => key,
            self.fields.index_name => index,
            self.fields.doc_id => id,
            self.fields.version => version,
            self.fields.body => body
        ))?;
        debug!(index, id, version, "Indexed document");
        Ok(())
    }

    async fn commit(&self) -> Result<(), WriteError> {
        let opstamp = {
            let mut writer = self
                .writer
                .lock()
                .map_err(|e| WriteError::IndexLocked(e.to_string()))?;
            writer.commit()?
        };
        self.reader.reload()?;
        debug!(opstamp, "Committed search index");
        Ok(())
    }
}
