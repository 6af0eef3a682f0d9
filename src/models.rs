//! Core data models used throughout kb-index.
//!
//! These types mirror the metadata store's three tables (knowledge bases,
//! documents, chunks) plus the docstore entries that flow into an on-disk
//! vector index artifact.

use serde::{Deserialize, Serialize};

/// A named, independently searchable collection of documents.
#[derive(Debug, Clone)]
pub struct KnowledgeBase {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub category: String,
    pub created_at: String,
    pub updated_at: String,
    pub is_active: bool,
    pub created_by: String,
}

/// Document processing state as recorded in the metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    Pending,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    /// Unknown values decode as `pending` — the schema default.
    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => ProcessingStatus::Completed,
            "failed" => ProcessingStatus::Failed,
            _ => ProcessingStatus::Pending,
        }
    }
}

/// A document record owned by exactly one knowledge base.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: i64,
    pub kb_id: i64,
    pub title: String,
    pub file_path: Option<String>,
    pub content_type: String,
    pub file_size: i64,
    pub upload_date: String,
    pub processed: bool,
    pub processing_status: ProcessingStatus,
    pub metadata_json: String,
}

/// Fields for a document about to be inserted; the store assigns the id
/// and the upload timestamp.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub kb_id: i64,
    pub title: String,
    pub file_path: Option<String>,
    pub content_type: String,
    pub file_size: i64,
    pub processed: bool,
    pub processing_status: ProcessingStatus,
    pub metadata_json: String,
}

/// A raw chunk row: a bounded span of a document's content, the unit
/// indexed and retrieved.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: i64,
    pub doc_id: i64,
    pub chunk_index: i64,
    pub content: String,
    pub metadata_json: String,
}

/// A chunk about to be inserted alongside its parent document. Indexes
/// must form a contiguous run starting at 0 within the document.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub chunk_index: i64,
    pub content: String,
    pub metadata_json: String,
}

/// A chunk joined with its owning document's context, in the order the
/// index builder consumes it (by document, then chunk index).
#[derive(Debug, Clone)]
pub struct IndexableChunk {
    pub chunk_id: i64,
    pub doc_id: i64,
    pub chunk_index: i64,
    pub content: String,
    pub metadata_json: String,
    pub document_title: String,
    pub file_path: Option<String>,
}

/// One docstore entry of a vector index artifact. Entry *i* corresponds to
/// row *i* of the embedding index file. Metadata carries the chunk's own
/// mapping augmented with provenance (kb id/name, document title, source
/// path, chunk index).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocstoreEntry {
    #[serde(default)]
    pub chunk_id: i64,
    #[serde(default)]
    pub doc_id: i64,
    pub content: String,
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}
