//! Metadata store: the authoritative relational record of knowledge bases,
//! documents, and chunks.
//!
//! Everything an artifact contains is derivable from here; nothing here is
//! ever derived from an artifact. Multi-row writes (a document plus its
//! chunk set) run inside a single transaction so partial ingestion is never
//! observable. Constraint violations surface as
//! [`KbError::ReferentialIntegrity`] naming the offending key.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{KbError, KbResult};
use crate::models::{
    Chunk, Document, IndexableChunk, KnowledgeBase, NewChunk, NewDocument, ProcessingStatus,
};

fn kb_from_row(row: &SqliteRow) -> KnowledgeBase {
    KnowledgeBase {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        category: row.get("category"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        is_active: row.get("is_active"),
        created_by: row.get("created_by"),
    }
}

fn document_from_row(row: &SqliteRow) -> Document {
    let status: String = row.get("processing_status");
    Document {
        id: row.get("id"),
        kb_id: row.get("kb_id"),
        title: row.get("title"),
        file_path: row.get("file_path"),
        content_type: row.get("content_type"),
        file_size: row.get::<Option<i64>, _>("file_size").unwrap_or(0),
        upload_date: row.get("upload_date"),
        processed: row.get("processed"),
        processing_status: ProcessingStatus::parse(&status),
        metadata_json: row
            .get::<Option<String>, _>("metadata")
            .unwrap_or_else(|| "{}".to_string()),
    }
}

pub async fn list_knowledge_bases(
    pool: &SqlitePool,
    active_only: bool,
) -> KbResult<Vec<KnowledgeBase>> {
    let sql = if active_only {
        "SELECT * FROM knowledge_bases WHERE is_active = 1 ORDER BY id"
    } else {
        "SELECT * FROM knowledge_bases ORDER BY id"
    };
    let rows = sqlx::query(sql).fetch_all(pool).await?;
    Ok(rows.iter().map(kb_from_row).collect())
}

pub async fn list_active_knowledge_bases(pool: &SqlitePool) -> KbResult<Vec<KnowledgeBase>> {
    list_knowledge_bases(pool, true).await
}

pub async fn get_knowledge_base(pool: &SqlitePool, kb_id: i64) -> KbResult<Option<KnowledgeBase>> {
    let row = sqlx::query("SELECT * FROM knowledge_bases WHERE id = ?")
        .bind(kb_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(kb_from_row))
}

/// Fetch a knowledge base and require it to be active, the precondition
/// shared by every index-touching operation.
pub async fn require_active_knowledge_base(
    pool: &SqlitePool,
    kb_id: i64,
) -> KbResult<KnowledgeBase> {
    let kb = get_knowledge_base(pool, kb_id)
        .await?
        .ok_or(KbError::KnowledgeBaseNotFound(kb_id))?;
    if !kb.is_active {
        return Err(KbError::KnowledgeBaseInactive {
            id: kb.id,
            name: kb.name,
        });
    }
    Ok(kb)
}

pub async fn create_knowledge_base(
    pool: &SqlitePool,
    name: &str,
    description: Option<&str>,
    category: &str,
    created_by: &str,
) -> KbResult<i64> {
    let now = chrono::Utc::now().to_rfc3339();
    let result = sqlx::query(
        r#"
        INSERT INTO knowledge_bases (name, description, category, created_at, updated_at, is_active, created_by)
        VALUES (?, ?, ?, ?, ?, 1, ?)
        "#,
    )
    .bind(name)
    .bind(description)
    .bind(category)
    .bind(&now)
    .bind(&now)
    .bind(created_by)
    .execute(pool)
    .await
    .map_err(|e| KbError::from_constraint(e, format!("knowledge_bases(name={})", name)))?;

    Ok(result.last_insert_rowid())
}

/// Knowledge bases are never hard-deleted while referenced; deactivation
/// retains records and the last-built artifact. Returns false when the id
/// does not exist.
pub async fn deactivate_knowledge_base(pool: &SqlitePool, kb_id: i64) -> KbResult<bool> {
    let now = chrono::Utc::now().to_rfc3339();
    let result = sqlx::query("UPDATE knowledge_bases SET is_active = 0, updated_at = ? WHERE id = ?")
        .bind(&now)
        .bind(kb_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_document(pool: &SqlitePool, doc_id: i64) -> KbResult<Option<Document>> {
    let row = sqlx::query("SELECT * FROM knowledge_documents WHERE id = ?")
        .bind(doc_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(document_from_row))
}

/// Find a document by its source path within a knowledge base, used to
/// detect reprocessing of already-ingested content.
pub async fn find_document_by_path(
    pool: &SqlitePool,
    kb_id: i64,
    file_path: &str,
) -> KbResult<Option<Document>> {
    let row = sqlx::query("SELECT * FROM knowledge_documents WHERE kb_id = ? AND file_path = ?")
        .bind(kb_id)
        .bind(file_path)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(document_from_row))
}

/// Insert a document record with an explicit id, as when the consistency
/// checker synthesizes a missing parent for orphaned chunks. Works on a
/// pool or an open transaction.
pub async fn insert_document_record<'a, E>(executor: E, doc: &Document) -> KbResult<()>
where
    E: sqlx::Executor<'a, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO knowledge_documents
            (id, kb_id, title, file_path, content_type, file_size, upload_date, processed, processing_status, metadata)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(doc.id)
    .bind(doc.kb_id)
    .bind(&doc.title)
    .bind(&doc.file_path)
    .bind(&doc.content_type)
    .bind(doc.file_size)
    .bind(&doc.upload_date)
    .bind(doc.processed)
    .bind(doc.processing_status.as_str())
    .bind(&doc.metadata_json)
    .execute(executor)
    .await
    .map_err(|e| KbError::from_constraint(e, format!("knowledge_documents(id={})", doc.id)))?;
    Ok(())
}

fn check_contiguous(chunks: &[NewChunk]) -> KbResult<()> {
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.chunk_index != i as i64 {
            return Err(KbError::ReferentialIntegrity {
                key: format!(
                    "document_chunks(chunk_index={}, expected {})",
                    chunk.chunk_index, i
                ),
            });
        }
    }
    Ok(())
}

/// Insert a document and its full chunk set in one transaction: either all
/// of it becomes visible, or none of it. Returns the new document id.
pub async fn insert_document_with_chunks(
    pool: &SqlitePool,
    doc: &NewDocument,
    chunks: &[NewChunk],
) -> KbResult<i64> {
    check_contiguous(chunks)?;

    // Foreign keys are not enforced on the connection, so the ownership
    // precondition is checked explicitly before writing.
    if get_knowledge_base(pool, doc.kb_id).await?.is_none() {
        return Err(KbError::ReferentialIntegrity {
            key: format!("knowledge_documents(kb_id={})", doc.kb_id),
        });
    }

    let now = chrono::Utc::now().to_rfc3339();
    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        r#"
        INSERT INTO knowledge_documents
            (kb_id, title, file_path, content_type, file_size, upload_date, processed, processing_status, metadata)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(doc.kb_id)
    .bind(&doc.title)
    .bind(&doc.file_path)
    .bind(&doc.content_type)
    .bind(doc.file_size)
    .bind(&now)
    .bind(doc.processed)
    .bind(doc.processing_status.as_str())
    .bind(&doc.metadata_json)
    .execute(&mut *tx)
    .await?;

    let doc_id = result.last_insert_rowid();

    for chunk in chunks {
        insert_chunk_row(&mut tx, doc_id, chunk).await?;
    }

    tx.commit().await?;
    Ok(doc_id)
}

/// Reprocess an existing document: update its record and replace the whole
/// chunk set in one transaction. Chunks are never mutated in place.
pub async fn reprocess_document(
    pool: &SqlitePool,
    doc_id: i64,
    doc: &NewDocument,
    chunks: &[NewChunk],
) -> KbResult<()> {
    check_contiguous(chunks)?;

    let now = chrono::Utc::now().to_rfc3339();
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE knowledge_documents SET
            title = ?, file_path = ?, content_type = ?, file_size = ?,
            upload_date = ?, processed = ?, processing_status = ?, metadata = ?
        WHERE id = ?
        "#,
    )
    .bind(&doc.title)
    .bind(&doc.file_path)
    .bind(&doc.content_type)
    .bind(doc.file_size)
    .bind(&now)
    .bind(doc.processed)
    .bind(doc.processing_status.as_str())
    .bind(&doc.metadata_json)
    .bind(doc_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM document_chunks WHERE doc_id = ?")
        .bind(doc_id)
        .execute(&mut *tx)
        .await?;

    for chunk in chunks {
        insert_chunk_row(&mut tx, doc_id, chunk).await?;
    }

    tx.commit().await?;
    Ok(())
}

async fn insert_chunk_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    doc_id: i64,
    chunk: &NewChunk,
) -> KbResult<()> {
    sqlx::query(
        "INSERT INTO document_chunks (doc_id, chunk_index, content, metadata) VALUES (?, ?, ?, ?)",
    )
    .bind(doc_id)
    .bind(chunk.chunk_index)
    .bind(&chunk.content)
    .bind(&chunk.metadata_json)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        KbError::from_constraint(
            e,
            format!(
                "document_chunks(doc_id={}, chunk_index={})",
                doc_id, chunk.chunk_index
            ),
        )
    })?;
    Ok(())
}

/// All chunks of a knowledge base's processed documents, ordered by
/// document then chunk index — exactly the set an artifact must represent.
pub async fn list_chunks(pool: &SqlitePool, kb_id: i64) -> KbResult<Vec<IndexableChunk>> {
    let rows = sqlx::query(
        r#"
        SELECT dc.id AS chunk_id, dc.doc_id, dc.chunk_index, dc.content,
               dc.metadata, kd.title, kd.file_path
        FROM document_chunks dc
        JOIN knowledge_documents kd ON dc.doc_id = kd.id
        WHERE kd.kb_id = ? AND kd.processed = 1
        ORDER BY dc.doc_id, dc.chunk_index
        "#,
    )
    .bind(kb_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| IndexableChunk {
            chunk_id: row.get("chunk_id"),
            doc_id: row.get("doc_id"),
            chunk_index: row.get("chunk_index"),
            content: row.get("content"),
            metadata_json: row
                .get::<Option<String>, _>("metadata")
                .unwrap_or_else(|| "{}".to_string()),
            document_title: row.get("title"),
            file_path: row.get("file_path"),
        })
        .collect())
}

pub async fn count_chunks(pool: &SqlitePool, kb_id: i64) -> KbResult<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM document_chunks dc
        JOIN knowledge_documents kd ON dc.doc_id = kd.id
        WHERE kd.kb_id = ? AND kd.processed = 1
        "#,
    )
    .bind(kb_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Distinct chunk `doc_id`s with no corresponding document record — the
/// observed failure mode the consistency checker repairs.
pub async fn orphaned_doc_ids(pool: &SqlitePool) -> KbResult<Vec<i64>> {
    let ids: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT dc.doc_id
        FROM document_chunks dc
        LEFT JOIN knowledge_documents kd ON kd.id = dc.doc_id
        WHERE kd.id IS NULL
        ORDER BY dc.doc_id
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// The lowest-index chunk for a document, used to recover a representative
/// title when synthesizing a missing document record.
pub async fn first_chunk_for(pool: &SqlitePool, doc_id: i64) -> KbResult<Option<Chunk>> {
    let row = sqlx::query(
        "SELECT * FROM document_chunks WHERE doc_id = ? ORDER BY chunk_index LIMIT 1",
    )
    .bind(doc_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| Chunk {
        id: row.get("id"),
        doc_id: row.get("doc_id"),
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
        metadata_json: row
            .get::<Option<String>, _>("metadata")
            .unwrap_or_else(|| "{}".to_string()),
    }))
}

/// Ids of processed documents in a knowledge base, for drift checks.
pub async fn processed_document_ids(pool: &SqlitePool, kb_id: i64) -> KbResult<Vec<i64>> {
    let ids: Vec<i64> = sqlx::query_scalar(
        "SELECT id FROM knowledge_documents WHERE kb_id = ? AND processed = 1 ORDER BY id",
    )
    .bind(kb_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Processed documents that own zero chunks — a repair-worthy anomaly
/// (`processed = 1` promises at least one chunk).
pub async fn unchunked_processed_documents(pool: &SqlitePool, kb_id: i64) -> KbResult<Vec<i64>> {
    let ids: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT kd.id
        FROM knowledge_documents kd
        LEFT JOIN document_chunks dc ON dc.doc_id = kd.id
        WHERE kd.kb_id = ? AND kd.processed = 1
        GROUP BY kd.id
        HAVING COUNT(dc.id) = 0
        ORDER BY kd.id
        "#,
    )
    .bind(kb_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Per-knowledge-base counts for the status overview.
pub async fn kb_counts(pool: &SqlitePool, kb_id: i64) -> KbResult<(i64, i64, i64)> {
    let doc_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM knowledge_documents WHERE kb_id = ?")
            .bind(kb_id)
            .fetch_one(pool)
            .await?;
    let processed_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM knowledge_documents WHERE kb_id = ? AND processed = 1",
    )
    .bind(kb_id)
    .fetch_one(pool)
    .await?;
    let chunk_count = count_chunks(pool, kb_id).await?;
    Ok((doc_count, processed_count, chunk_count))
}
