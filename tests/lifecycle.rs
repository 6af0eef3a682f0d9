//! End-to-end lifecycle tests against a real SQLite store and on-disk
//! artifacts, using the deterministic fixture embedding provider.

use std::collections::BTreeSet;
use std::path::Path;

use sqlx::SqlitePool;
use tempfile::TempDir;

use kb_index::artifact::{self, Artifact, DOCSTORE_FILENAME, INDEX_FILENAME, LEGACY_FILENAME};
use kb_index::checker;
use kb_index::config::{
    ArtifactsConfig, ChunkingConfig, Config, DbConfig, EmbeddingConfig, KbRange, RepairConfig,
};
use kb_index::db;
use kb_index::error::KbError;
use kb_index::lifecycle;
use kb_index::migrate;
use kb_index::models::{NewChunk, NewDocument, ProcessingStatus};
use kb_index::report::ArtifactState;
use kb_index::store;

fn test_config(root: &Path) -> Config {
    Config {
        db: DbConfig {
            path: root.join("kb.sqlite"),
        },
        artifacts: ArtifactsConfig {
            root: root.join("knowledge_bases"),
        },
        chunking: ChunkingConfig::default(),
        embedding: EmbeddingConfig {
            provider: "fixture".to_string(),
            dims: Some(16),
            ..Default::default()
        },
        repair: RepairConfig {
            kb_ranges: vec![
                KbRange {
                    max_doc_id: 7,
                    kb_id: 1,
                },
                KbRange {
                    max_doc_id: 14,
                    kb_id: 2,
                },
            ],
            default_kb_id: Some(3),
        },
    }
}

async fn setup() -> (TempDir, Config, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    migrate::run_migrations(&config).await.unwrap();
    let pool = db::connect(&config).await.unwrap();
    (tmp, config, pool)
}

async fn create_kb(pool: &SqlitePool, name: &str) -> i64 {
    store::create_knowledge_base(pool, name, None, "technical", "admin")
        .await
        .unwrap()
}

async fn add_document(pool: &SqlitePool, kb_id: i64, title: &str, chunk_texts: &[&str]) -> i64 {
    let metadata = serde_json::json!({ "title": title }).to_string();
    let chunks: Vec<NewChunk> = chunk_texts
        .iter()
        .enumerate()
        .map(|(i, text)| NewChunk {
            chunk_index: i as i64,
            content: text.to_string(),
            metadata_json: metadata.clone(),
        })
        .collect();
    let doc = NewDocument {
        kb_id,
        title: title.to_string(),
        file_path: Some(format!("{}.txt", title)),
        content_type: "text/plain".to_string(),
        file_size: 100,
        processed: true,
        processing_status: ProcessingStatus::Completed,
        metadata_json: metadata,
    };
    store::insert_document_with_chunks(pool, &doc, &chunks)
        .await
        .unwrap()
}

fn docstore_doc_ids(artifact: &Artifact) -> BTreeSet<i64> {
    artifact.docstore.iter().map(|e| e.doc_id).collect()
}

fn docstore_chunk_ids(artifact: &Artifact) -> BTreeSet<i64> {
    artifact.docstore.iter().map(|e| e.chunk_id).collect()
}

#[tokio::test]
async fn test_migrations_are_idempotent() {
    let (_tmp, config, pool) = setup().await;
    // setup already ran migrations once; a second run must be safe
    migrate::run_migrations(&config).await.unwrap();

    let kb_id = create_kb(&pool, "Still Works").await;
    add_document(&pool, kb_id, "Doc", &["a"]).await;
    assert_eq!(store::count_chunks(&pool, kb_id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_verify_flags_processed_document_without_chunks() {
    let (_tmp, config, pool) = setup().await;
    let kb_id = create_kb(&pool, "Anomalous").await;

    let doc = NewDocument {
        kb_id,
        title: "Hollow".to_string(),
        file_path: Some("hollow.txt".to_string()),
        content_type: "text/plain".to_string(),
        file_size: 0,
        processed: true,
        processing_status: ProcessingStatus::Completed,
        metadata_json: "{}".to_string(),
    };
    let doc_id = store::insert_document_with_chunks(&pool, &doc, &[])
        .await
        .unwrap();

    let report = lifecycle::verify(&config, &pool, kb_id).await.unwrap();
    assert!(!report.in_sync());
    assert!(report
        .issues
        .iter()
        .any(|i| i.contains(&format!("document {} is processed but owns no chunks", doc_id))));
}

#[tokio::test]
async fn test_recreate_row_count_matches_chunks() {
    let (_tmp, config, pool) = setup().await;
    let kb_id = create_kb(&pool, "Technical Regulations").await;
    add_document(&pool, kb_id, "Uplink", &["alpha", "beta", "gamma"]).await;
    add_document(&pool, kb_id, "Downlink", &["delta", "epsilon"]).await;

    let report = lifecycle::recreate(&config, &pool, kb_id).await.unwrap();
    assert_eq!(report.chunks_processed, 5);
    assert!(report.skipped.is_empty());
    assert_eq!(report.state, ArtifactState::Built { rows: 5 });

    let loaded = Artifact::load(&artifact::artifact_dir(&config, kb_id)).unwrap();
    assert_eq!(loaded.row_count() as i64, store::count_chunks(&pool, kb_id).await.unwrap());
    assert_eq!(loaded.dims, 16);

    // Provenance metadata is present on every entry
    for entry in &loaded.docstore {
        let meta = entry.metadata.as_object().unwrap();
        assert_eq!(meta["kb_id"], kb_id);
        assert_eq!(meta["kb_name"], "Technical Regulations");
        assert!(meta.contains_key("chunk_index"));
    }
}

#[tokio::test]
async fn test_create_is_noop_when_artifact_exists() {
    let (_tmp, config, pool) = setup().await;
    let kb_id = create_kb(&pool, "Tariffs").await;
    add_document(&pool, kb_id, "Rates", &["one", "two"]).await;

    let first = lifecycle::create(&config, &pool, kb_id).await.unwrap();
    assert_eq!(first.state, ArtifactState::Built { rows: 2 });

    let second = lifecycle::create(&config, &pool, kb_id).await.unwrap();
    assert_eq!(second.state, ArtifactState::Unchanged);
    assert!(second.notes.iter().any(|n| n.contains("already present")));
}

#[tokio::test]
async fn test_empty_kb_reports_unchanged_and_builds_nothing() {
    let (_tmp, config, pool) = setup().await;
    let kb_id = create_kb(&pool, "Empty").await;

    let report = lifecycle::create(&config, &pool, kb_id).await.unwrap();
    assert_eq!(report.state, ArtifactState::Unchanged);
    assert!(!artifact::exists(&artifact::artifact_dir(&config, kb_id)));
}

#[tokio::test]
async fn test_verify_is_idempotent() {
    let (_tmp, config, pool) = setup().await;
    let kb_id = create_kb(&pool, "Stable").await;
    add_document(&pool, kb_id, "Doc", &["a", "b"]).await;
    lifecycle::recreate(&config, &pool, kb_id).await.unwrap();

    let first = lifecycle::verify(&config, &pool, kb_id).await.unwrap();
    let second = lifecycle::verify(&config, &pool, kb_id).await.unwrap();
    assert_eq!(first, second);
    assert!(first.in_sync());
    assert_eq!(first.artifact_rows, Some(2));
}

#[tokio::test]
async fn test_verify_detects_drift_after_new_content() {
    let (_tmp, config, pool) = setup().await;
    let kb_id = create_kb(&pool, "Drifting").await;
    add_document(&pool, kb_id, "Doc", &["a", "b"]).await;
    lifecycle::recreate(&config, &pool, kb_id).await.unwrap();

    add_document(&pool, kb_id, "Late", &["c"]).await;

    let report = lifecycle::verify(&config, &pool, kb_id).await.unwrap();
    assert!(!report.in_sync());
    assert_eq!(report.artifact_rows, Some(2));
    assert_eq!(report.chunk_count, 3);
    assert!(report.issues.iter().any(|i| i.contains("2 rows")));
}

#[tokio::test]
async fn test_repair_on_consistent_kb_is_round_trip() {
    let (_tmp, config, pool) = setup().await;
    let kb_id = create_kb(&pool, "Consistent").await;
    add_document(&pool, kb_id, "Doc", &["a", "b", "c"]).await;

    lifecycle::create(&config, &pool, kb_id).await.unwrap();
    let before = Artifact::load(&artifact::artifact_dir(&config, kb_id)).unwrap();

    let report = lifecycle::repair(&config, &pool, kb_id).await.unwrap();
    assert!(report.synthesized.is_empty());
    assert!(report.unassigned_orphans.is_empty());
    assert_eq!(report.state, ArtifactState::Built { rows: 3 });

    let after = Artifact::load(&artifact::artifact_dir(&config, kb_id)).unwrap();
    assert_eq!(before.row_count(), after.row_count());
    assert_eq!(docstore_chunk_ids(&before), docstore_chunk_ids(&after));
}

#[tokio::test]
async fn test_orphan_repair_synthesizes_document_42() {
    let (_tmp, config, pool) = setup().await;
    create_kb(&pool, "Technical Regulations").await;
    create_kb(&pool, "User Instructions").await;
    let kb3 = create_kb(&pool, "Security Policies").await;

    // Chunks whose document record was never written
    let metadata = serde_json::json!({ "title": "Orphaned Manual" }).to_string();
    for i in 0..3 {
        sqlx::query(
            "INSERT INTO document_chunks (doc_id, chunk_index, content, metadata) VALUES (?, ?, ?, ?)",
        )
        .bind(42i64)
        .bind(i as i64)
        .bind(format!("orphan chunk {}", i))
        .bind(&metadata)
        .execute(&pool)
        .await
        .unwrap();
    }

    let scan = checker::synthesize_missing_documents(&pool, &config.repair)
        .await
        .unwrap();
    assert_eq!(scan.orphaned, 1);
    assert_eq!(scan.synthesized.len(), 1);
    let synthesized = &scan.synthesized[0];
    assert_eq!(synthesized.doc_id, 42);
    assert_eq!(synthesized.kb_id, kb3); // 42 is past every range -> default
    assert_eq!(synthesized.title, "Orphaned Manual");
    assert!(synthesized.basis.starts_with("default"));

    let doc = store::get_document(&pool, 42).await.unwrap().unwrap();
    assert!(doc.processed);
    assert_eq!(doc.kb_id, kb3);

    // The join now succeeds: the orphaned chunks are listed for kb3
    let chunks = store::list_chunks(&pool, kb3).await.unwrap();
    assert_eq!(chunks.len(), 3);
    assert!(chunks.iter().all(|c| c.doc_id == 42));

    // Running the checker again finds nothing left to synthesize
    let second = checker::synthesize_missing_documents(&pool, &config.repair)
        .await
        .unwrap();
    assert_eq!(second.orphaned, 0);
    assert!(second.synthesized.is_empty());
}

#[tokio::test]
async fn test_technical_regulations_scenario() {
    let (_tmp, config, pool) = setup().await;
    let kb1 = create_kb(&pool, "Technical Regulations").await;
    create_kb(&pool, "User Instructions").await;
    create_kb(&pool, "Security Policies").await;

    // Documents 1..=7, two chunks each except document 5 which has three
    for i in 1..=7 {
        let chunks: Vec<String> = if i == 5 {
            (0..3).map(|c| format!("doc {} chunk {}", i, c)).collect()
        } else {
            (0..2).map(|c| format!("doc {} chunk {}", i, c)).collect()
        };
        let refs: Vec<&str> = chunks.iter().map(|s| s.as_str()).collect();
        let doc_id = add_document(&pool, kb1, &format!("Regulation {}", i), &refs).await;
        assert_eq!(doc_id, i);
    }

    // Document 5's record goes missing while its chunks 0,1,2 remain
    sqlx::query("DELETE FROM knowledge_documents WHERE id = 5")
        .execute(&pool)
        .await
        .unwrap();
    let total_chunks = 6 * 2 + 3;

    let report = lifecycle::repair(&config, &pool, kb1).await.unwrap();
    assert_eq!(report.synthesized.len(), 1);
    assert_eq!(report.synthesized[0].doc_id, 5);
    assert_eq!(report.synthesized[0].kb_id, kb1); // id-range policy: 5 <= 7
    assert!(report.synthesized[0].basis.contains("id-range"));
    assert_eq!(report.state, ArtifactState::Built { rows: total_chunks });

    let loaded = Artifact::load(&artifact::artifact_dir(&config, kb1)).unwrap();
    assert_eq!(loaded.row_count(), total_chunks);
    assert_eq!(docstore_doc_ids(&loaded), (1..=7).collect::<BTreeSet<i64>>());
}

#[tokio::test]
async fn test_atomic_swap_crash_leaves_prior_artifact_intact() {
    let (_tmp, config, pool) = setup().await;
    let kb_id = create_kb(&pool, "Crashy").await;
    add_document(&pool, kb_id, "Doc", &["a", "b"]).await;
    lifecycle::recreate(&config, &pool, kb_id).await.unwrap();

    let dir = artifact::artifact_dir(&config, kb_id);
    let before = Artifact::load(&dir).unwrap();

    // Simulate a crash after temp-file write but before rename: a newer
    // build's temp pair sits next to the canonical files, never promoted.
    let newer = Artifact::new(
        16,
        vec![vec![0.0; 16]],
        vec![kb_index::models::DocstoreEntry {
            chunk_id: 999,
            doc_id: 999,
            content: "never promoted".to_string(),
            metadata: serde_json::json!({}),
        }],
    );
    let _unpromoted = newer.write_temp(&dir).unwrap();

    // The previous pair is fully intact and loadable
    let after = Artifact::load(&dir).unwrap();
    assert_eq!(before.docstore, after.docstore);
    assert_eq!(before.vectors, after.vectors);

    // The next build sweeps the stale temps and succeeds
    let report = lifecycle::recreate(&config, &pool, kb_id).await.unwrap();
    assert_eq!(report.state, ArtifactState::Built { rows: 2 });
    let leftovers: Vec<_> = std::fs::read_dir(&dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| name.contains(".tmp-"))
        .collect();
    assert!(leftovers.is_empty(), "stale temps remain: {:?}", leftovers);
}

#[tokio::test]
async fn test_legacy_tuple_migration_preserves_entries() {
    let (_tmp, config, pool) = setup().await;
    let kb_id = create_kb(&pool, "Legacy").await;

    let dir = artifact::artifact_dir(&config, kb_id);
    std::fs::create_dir_all(&dir).unwrap();
    let legacy = serde_json::json!([
        [[0.1, 0.2], [0.3, 0.4], [0.5, 0.6]],
        [
            {"chunk_id": 1, "doc_id": 1, "content": "first", "metadata": {}},
            {"chunk_id": 2, "doc_id": 1, "content": "second", "metadata": {}},
            {"chunk_id": 3, "doc_id": 2, "content": "third", "metadata": {}}
        ]
    ]);
    std::fs::write(dir.join(LEGACY_FILENAME), serde_json::to_vec(&legacy).unwrap()).unwrap();

    let report = lifecycle::migrate(&config, &pool, kb_id).await.unwrap();
    assert_eq!(report.state, ArtifactState::Built { rows: 3 });
    assert!(report.notes.iter().any(|n| n.contains("tuple")));

    assert!(!dir.join(LEGACY_FILENAME).exists());
    let loaded = Artifact::load(&dir).unwrap();
    assert_eq!(loaded.row_count(), 3);
    let contents: Vec<&str> = loaded.docstore.iter().map(|e| e.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_unreadable_legacy_falls_back_to_rebuild() {
    let (_tmp, config, pool) = setup().await;
    let kb_id = create_kb(&pool, "Mangled").await;
    add_document(&pool, kb_id, "Doc", &["a", "b"]).await;

    let dir = artifact::artifact_dir(&config, kb_id);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(LEGACY_FILENAME), b"\x80\x02 pickled garbage").unwrap();

    let report = lifecycle::migrate(&config, &pool, kb_id).await.unwrap();
    assert_eq!(report.state, ArtifactState::Built { rows: 2 });
    assert!(report.notes.iter().any(|n| n.contains("rebuilt")));

    // The unreadable original is kept; once canonical files exist it is
    // ignored as an unrecognized extra file.
    assert!(dir.join(LEGACY_FILENAME).exists());
    assert!(dir.join(INDEX_FILENAME).exists());
    assert!(dir.join(DOCSTORE_FILENAME).exists());
    assert!(Artifact::load(&dir).is_ok());
}

#[tokio::test]
async fn test_inactive_kb_is_excluded_from_rebuild() {
    let (_tmp, config, pool) = setup().await;
    let kb_id = create_kb(&pool, "Retired").await;
    add_document(&pool, kb_id, "Doc", &["a"]).await;
    lifecycle::recreate(&config, &pool, kb_id).await.unwrap();

    assert!(store::deactivate_knowledge_base(&pool, kb_id).await.unwrap());

    match lifecycle::recreate(&config, &pool, kb_id).await {
        Err(KbError::KnowledgeBaseInactive { id, .. }) => assert_eq!(id, kb_id),
        other => panic!("expected inactive error, got {:?}", other),
    }

    // Records and the last-built artifact are retained
    assert!(artifact::exists(&artifact::artifact_dir(&config, kb_id)));
    assert_eq!(store::count_chunks(&pool, kb_id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_unprocessed_documents_are_excluded_from_build() {
    let (_tmp, config, pool) = setup().await;
    let kb_id = create_kb(&pool, "Partial").await;
    add_document(&pool, kb_id, "Ready", &["a", "b"]).await;

    let pending = NewDocument {
        kb_id,
        title: "Pending".to_string(),
        file_path: Some("pending.txt".to_string()),
        content_type: "text/plain".to_string(),
        file_size: 10,
        processed: false,
        processing_status: ProcessingStatus::Pending,
        metadata_json: "{}".to_string(),
    };
    let chunk = NewChunk {
        chunk_index: 0,
        content: "not yet visible".to_string(),
        metadata_json: "{}".to_string(),
    };
    store::insert_document_with_chunks(&pool, &pending, &[chunk])
        .await
        .unwrap();

    let report = lifecycle::recreate(&config, &pool, kb_id).await.unwrap();
    assert_eq!(report.state, ArtifactState::Built { rows: 2 });

    let loaded = Artifact::load(&artifact::artifact_dir(&config, kb_id)).unwrap();
    assert!(loaded.docstore.iter().all(|e| e.content != "not yet visible"));
}

#[tokio::test]
async fn test_document_insert_is_atomic() {
    let (_tmp, _config, pool) = setup().await;
    let kb_id = create_kb(&pool, "Atomic").await;

    // A non-contiguous chunk run is rejected and nothing becomes visible
    let doc = NewDocument {
        kb_id,
        title: "Broken".to_string(),
        file_path: Some("broken.txt".to_string()),
        content_type: "text/plain".to_string(),
        file_size: 10,
        processed: true,
        processing_status: ProcessingStatus::Completed,
        metadata_json: "{}".to_string(),
    };
    let chunks = vec![
        NewChunk {
            chunk_index: 0,
            content: "a".to_string(),
            metadata_json: "{}".to_string(),
        },
        NewChunk {
            chunk_index: 2,
            content: "b".to_string(),
            metadata_json: "{}".to_string(),
        },
    ];

    match store::insert_document_with_chunks(&pool, &doc, &chunks).await {
        Err(KbError::ReferentialIntegrity { key }) => assert!(key.contains("chunk_index")),
        other => panic!("expected referential integrity error, got {:?}", other),
    }

    let docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM knowledge_documents")
        .fetch_one(&pool)
        .await
        .unwrap();
    let chunks_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(docs, 0);
    assert_eq!(chunks_count, 0);

    // Unknown knowledge base is named in the error
    let stray = NewDocument { kb_id: 99, ..doc };
    match store::insert_document_with_chunks(&pool, &stray, &[]).await {
        Err(KbError::ReferentialIntegrity { key }) => assert!(key.contains("kb_id=99")),
        other => panic!("expected referential integrity error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_duplicate_chunk_index_names_offending_key() {
    let (_tmp, _config, pool) = setup().await;
    let kb_id = create_kb(&pool, "Duplicates").await;
    let doc_id = add_document(&pool, kb_id, "Doc", &["a"]).await;

    let result = sqlx::query(
        "INSERT INTO document_chunks (doc_id, chunk_index, content, metadata) VALUES (?, 0, 'dup', '{}')",
    )
    .bind(doc_id)
    .execute(&pool)
    .await;

    let err = KbError::from_constraint(
        result.unwrap_err(),
        format!("document_chunks(doc_id={}, chunk_index=0)", doc_id),
    );
    match err {
        KbError::ReferentialIntegrity { key } => {
            assert!(key.contains(&format!("doc_id={}", doc_id)))
        }
        other => panic!("expected referential integrity error, got {:?}", other),
    }
}
