//! Document ingestion: text file → document record plus chunk set.
//!
//! Writes the document and its full chunk set in one transaction through
//! the metadata store; partial ingestion is never observable. Re-adding a
//! file already known to the knowledge base reprocesses it: the document
//! record is updated and the whole chunk set replaced. Extraction from
//! binary formats (PDF, OCR) happens upstream; this command accepts text.

use anyhow::{Context, Result};
use std::path::Path;

use crate::chunk::chunk_text;
use crate::config::Config;
use crate::db;
use crate::models::{NewChunk, NewDocument, ProcessingStatus};
use crate::store;

pub async fn run_add(
    config: &Config,
    kb_id: i64,
    path: &Path,
    title: Option<String>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let kb = store::require_active_knowledge_base(&pool, kb_id).await?;

    let body = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let title = title.unwrap_or_else(|| {
        path.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "Untitled".to_string())
    });
    let file_path = path.display().to_string();

    // Chunk metadata carries the title so a synthesized parent record can
    // recover it later if this document row is ever lost.
    let metadata_json = serde_json::json!({
        "title": title,
        "file_path": file_path,
    })
    .to_string();

    let chunks: Vec<NewChunk> = chunk_text(&body, config.chunking.max_tokens)
        .into_iter()
        .enumerate()
        .map(|(i, content)| NewChunk {
            chunk_index: i as i64,
            content,
            metadata_json: metadata_json.clone(),
        })
        .collect();

    let doc = NewDocument {
        kb_id,
        title: title.clone(),
        file_path: Some(file_path.clone()),
        content_type: "text/plain".to_string(),
        file_size: body.len() as i64,
        processed: true,
        processing_status: ProcessingStatus::Completed,
        metadata_json,
    };

    let (doc_id, reprocessed) = match store::find_document_by_path(&pool, kb_id, &file_path).await?
    {
        Some(existing) => {
            store::reprocess_document(&pool, existing.id, &doc, &chunks).await?;
            (existing.id, true)
        }
        None => {
            let id = store::insert_document_with_chunks(&pool, &doc, &chunks).await?;
            (id, false)
        }
    };

    println!("add kb {} ({})", kb.id, kb.name);
    println!("  document: {} \"{}\"", doc_id, title);
    if reprocessed {
        println!("  reprocessed: chunk set replaced");
    }
    println!("  chunks written: {}", chunks.len());
    println!("ok");

    pool.close().await;
    Ok(())
}
