//! Error taxonomy for lifecycle operations.
//!
//! Component-local failures (a single chunk's embedding error) are absorbed
//! into operation reports by the caller; the variants here cover the
//! structural outcomes an operation can surface. [`KbError::SwapVerification`]
//! and [`KbError::ArtifactCorruption`] are recoverable by policy: the first
//! aborts a swap leaving the previous artifact authoritative, the second
//! triggers a full rebuild from the metadata store.

use std::path::PathBuf;

use thiserror::Error;

pub type KbResult<T> = Result<T, KbError>;

#[derive(Debug, Error)]
pub enum KbError {
    /// A relational constraint was violated; the offending key is named so
    /// the operator can decide whether to repair or abort.
    #[error("referential integrity violation: {key}")]
    ReferentialIntegrity { key: String },

    #[error("knowledge base {0} not found")]
    KnowledgeBaseNotFound(i64),

    /// Inactive knowledge bases keep their records and last-built artifact
    /// but are excluded from rebuild and retrieval.
    #[error("knowledge base {id} ({name}) is inactive")]
    KnowledgeBaseInactive { id: i64, name: String },

    #[error("embedding provider error: {0}")]
    EmbeddingProvider(String),

    /// An on-disk artifact could not be loaded or has an unrecognized shape.
    #[error("artifact at {path} is unreadable: {reason}")]
    ArtifactCorruption { path: PathBuf, reason: String },

    /// Post-build row-count check failed; the swap was aborted and the
    /// previous artifact pair is untouched.
    #[error("swap verification failed for {path}: index has {index_rows} rows, docstore has {docstore_rows}")]
    SwapVerification {
        path: PathBuf,
        index_rows: usize,
        docstore_rows: usize,
    },

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl KbError {
    /// Map a database error to [`KbError::ReferentialIntegrity`] when it is a
    /// constraint violation, naming the offending key. Other errors pass
    /// through unchanged.
    pub fn from_constraint(err: sqlx::Error, key: impl Into<String>) -> Self {
        match &err {
            sqlx::Error::Database(db)
                if db.is_unique_violation() || db.is_foreign_key_violation() =>
            {
                KbError::ReferentialIntegrity { key: key.into() }
            }
            _ => KbError::Database(err),
        }
    }
}
