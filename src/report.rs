//! Structured reports returned by lifecycle operations.
//!
//! Every operation accounts for what it touched: chunks processed, chunks
//! skipped (with reasons), documents synthesized (with the inference basis
//! so heuristic assignments can be audited), and the final artifact state.

use serde::Serialize;

/// A chunk excluded from a build, with the reason it was skipped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedChunk {
    pub chunk_id: i64,
    pub doc_id: i64,
    pub reason: String,
}

/// A document record synthesized for orphaned chunks. `basis` records how
/// the owning knowledge base was inferred; it is a heuristic, not ground
/// truth, and operators are expected to audit it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynthesizedDocument {
    pub doc_id: i64,
    pub kb_id: i64,
    pub title: String,
    pub basis: String,
}

/// An orphaned document id the inference policy could not place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnassignedOrphan {
    pub doc_id: i64,
    pub reason: String,
}

/// Final artifact state after an operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ArtifactState {
    Built { rows: usize },
    Unchanged,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationReport {
    pub operation: &'static str,
    pub kb_id: i64,
    pub kb_name: String,
    pub chunks_processed: usize,
    pub skipped: Vec<SkippedChunk>,
    pub synthesized: Vec<SynthesizedDocument>,
    pub unassigned_orphans: Vec<UnassignedOrphan>,
    pub state: ArtifactState,
    pub notes: Vec<String>,
}

impl OperationReport {
    pub fn new(operation: &'static str, kb_id: i64, kb_name: impl Into<String>) -> Self {
        Self {
            operation,
            kb_id,
            kb_name: kb_name.into(),
            chunks_processed: 0,
            skipped: Vec::new(),
            synthesized: Vec::new(),
            unassigned_orphans: Vec::new(),
            state: ArtifactState::Unchanged,
            notes: Vec::new(),
        }
    }
}

/// Read-only drift report from `verify`. Identical inputs produce identical
/// reports; nothing is modified.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifyReport {
    pub kb_id: i64,
    pub kb_name: String,
    /// Row count of the artifact on disk, `None` when not yet built.
    pub artifact_rows: Option<usize>,
    /// Current chunk count of the knowledge base's processed documents.
    pub chunk_count: i64,
    pub issues: Vec<String>,
}

impl VerifyReport {
    pub fn in_sync(&self) -> bool {
        self.issues.is_empty()
    }
}
