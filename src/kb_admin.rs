//! Knowledge base administration: create, list, deactivate.
//!
//! Knowledge bases are created once and only ever deactivated, never
//! hard-deleted while referenced. Deactivation retains all records and the
//! last-built artifact; the knowledge base simply drops out of rebuild and
//! retrieval.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::store;

pub async fn run_kb_create(
    config: &Config,
    name: &str,
    description: Option<&str>,
    category: &str,
    created_by: &str,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let kb_id =
        store::create_knowledge_base(&pool, name, description, category, created_by).await?;
    println!("created knowledge base {} (\"{}\")", kb_id, name);
    pool.close().await;
    Ok(())
}

pub async fn run_kb_list(config: &Config, include_inactive: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let kbs = store::list_knowledge_bases(&pool, !include_inactive).await?;

    println!(
        "  {:<4} {:<28} {:<16} {:<7} {:<12} {}",
        "ID", "NAME", "CATEGORY", "ACTIVE", "CREATED BY", "UPDATED"
    );
    println!("  {}", "-".repeat(84));
    for kb in &kbs {
        println!(
            "  {:<4} {:<28} {:<16} {:<7} {:<12} {}",
            kb.id,
            kb.name,
            kb.category,
            if kb.is_active { "yes" } else { "no" },
            kb.created_by,
            kb.updated_at
        );
    }

    pool.close().await;
    Ok(())
}

pub async fn run_kb_deactivate(config: &Config, kb_id: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    if store::deactivate_knowledge_base(&pool, kb_id).await? {
        println!("deactivated knowledge base {}", kb_id);
    } else {
        anyhow::bail!("knowledge base {} not found", kb_id);
    }
    pool.close().await;
    Ok(())
}
