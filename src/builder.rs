//! Index builder: deterministic full rebuild of a knowledge base's artifact.
//!
//! A build streams the knowledge base's chunks in document/chunk-index
//! order, embeds them in batches, and assembles the vector rows plus a
//! docstore entry per row carrying provenance metadata. The index structure
//! is always built over the full batch — never incrementally — so the
//! artifact's row count matches the chunk count exactly and cannot drift
//! from partial updates.
//!
//! Both files are written to temporary names, the written docstore is
//! re-read and checked against the vector row count, and only then is the
//! pair renamed over the canonical names. A crash or abort anywhere before
//! the swap leaves the previous artifact intact.

use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::artifact::{self, Artifact};
use crate::config::Config;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::{KbError, KbResult};
use crate::models::{DocstoreEntry, IndexableChunk, KnowledgeBase};
use crate::report::{ArtifactState, SkippedChunk};
use crate::store;

/// What a single build did, folded into the operation report by the caller.
#[derive(Debug)]
pub struct BuildOutcome {
    pub chunks_total: usize,
    pub skipped: Vec<SkippedChunk>,
    pub state: ArtifactState,
}

/// Rebuild the artifact for one knowledge base from the metadata store.
///
/// An empty chunk set is not an error: the knowledge base may legitimately
/// have no processed content yet, so nothing is produced and any prior
/// artifact stays in place (removing it would break retrieval for a
/// knowledge base that is merely empty of new content).
pub async fn build_index(
    config: &Config,
    pool: &SqlitePool,
    kb: &KnowledgeBase,
) -> KbResult<BuildOutcome> {
    if !kb.is_active {
        return Err(KbError::KnowledgeBaseInactive {
            id: kb.id,
            name: kb.name.clone(),
        });
    }

    let chunks = store::list_chunks(pool, kb.id).await?;
    if chunks.is_empty() {
        debug!(kb_id = kb.id, "no processed content; prior artifact left untouched");
        return Ok(BuildOutcome {
            chunks_total: 0,
            skipped: Vec::new(),
            state: ArtifactState::Unchanged,
        });
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let dims = provider.dims();

    let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());
    let mut entries: Vec<DocstoreEntry> = Vec::with_capacity(chunks.len());
    let mut skipped: Vec<SkippedChunk> = Vec::new();

    for batch in chunks.chunks(config.embedding.batch_size) {
        let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();

        match embedding::embed_texts(provider.as_ref(), &config.embedding, &texts).await {
            Ok(batch_vectors) => {
                for (chunk, vector) in batch.iter().zip(batch_vectors) {
                    push_row(kb, chunk, vector, dims, &mut vectors, &mut entries, &mut skipped);
                }
            }
            Err(batch_err) => {
                // The batch already went through the provider's retries.
                // Fall back to one call per chunk so a single malformed
                // chunk cannot take the whole rebuild down with it.
                warn!(
                    kb_id = kb.id,
                    error = %batch_err,
                    "embedding batch failed; retrying chunks individually"
                );
                for chunk in batch {
                    let single = embedding::embed_texts(
                        provider.as_ref(),
                        &config.embedding,
                        std::slice::from_ref(&chunk.content),
                    )
                    .await;
                    match single {
                        Ok(mut vecs) if !vecs.is_empty() => {
                            let vector = vecs.remove(0);
                            push_row(kb, chunk, vector, dims, &mut vectors, &mut entries, &mut skipped);
                        }
                        Ok(_) => skipped.push(SkippedChunk {
                            chunk_id: chunk.chunk_id,
                            doc_id: chunk.doc_id,
                            reason: "provider returned an empty response".to_string(),
                        }),
                        Err(e) => skipped.push(SkippedChunk {
                            chunk_id: chunk.chunk_id,
                            doc_id: chunk.doc_id,
                            reason: e.to_string(),
                        }),
                    }
                }
            }
        }
    }

    if vectors.is_empty() {
        return Ok(BuildOutcome {
            chunks_total: chunks.len(),
            skipped,
            state: ArtifactState::Failed {
                reason: "no chunk could be embedded".to_string(),
            },
        });
    }

    let dir = artifact::artifact_dir(config, kb.id);
    artifact::sweep_stale_temps(&dir)?;

    let built = Artifact::new(dims, vectors, entries);
    let rows = built.row_count();
    let pair = built.write_temp(&dir)?;

    // Pre-swap verification: the written docstore must agree with the
    // vector row count, otherwise the old pair stays authoritative.
    let read_back = pair.read_back_docstore_len()?;
    if read_back != rows {
        pair.discard();
        return Err(KbError::SwapVerification {
            path: dir,
            index_rows: rows,
            docstore_rows: read_back,
        });
    }

    pair.promote(&dir)?;

    Ok(BuildOutcome {
        chunks_total: chunks.len(),
        skipped,
        state: ArtifactState::Built { rows },
    })
}

fn push_row(
    kb: &KnowledgeBase,
    chunk: &IndexableChunk,
    vector: Vec<f32>,
    dims: usize,
    vectors: &mut Vec<Vec<f32>>,
    entries: &mut Vec<DocstoreEntry>,
    skipped: &mut Vec<SkippedChunk>,
) {
    if vector.len() != dims {
        skipped.push(SkippedChunk {
            chunk_id: chunk.chunk_id,
            doc_id: chunk.doc_id,
            reason: format!("vector has {} dims, expected {}", vector.len(), dims),
        });
        return;
    }
    vectors.push(vector);
    entries.push(docstore_entry(kb, chunk));
}

/// Build a docstore entry: the chunk's own metadata augmented with
/// provenance — knowledge base id/name, document title, source path, and
/// the chunk's index.
fn docstore_entry(kb: &KnowledgeBase, chunk: &IndexableChunk) -> DocstoreEntry {
    let mut metadata = match serde_json::from_str::<serde_json::Value>(&chunk.metadata_json) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    metadata.insert("kb_id".to_string(), serde_json::json!(kb.id));
    metadata.insert("kb_name".to_string(), serde_json::json!(kb.name));
    metadata.insert("title".to_string(), serde_json::json!(chunk.document_title));
    metadata.insert("file_path".to_string(), serde_json::json!(chunk.file_path));
    metadata.insert("chunk_index".to_string(), serde_json::json!(chunk.chunk_index));

    DocstoreEntry {
        chunk_id: chunk.chunk_id,
        doc_id: chunk.doc_id,
        content: chunk.content.clone(),
        metadata: serde_json::Value::Object(metadata),
    }
}
