use anyhow::{bail, Result};
use chat_recall_core::alias::AliasResolver;
use chat_recall_core::models::ChunkStatus;
use chat_recall_core::store::Store;

use crate::config::Config;
use crate::index_lock::{self, LockMode};
use crate::ingest::{IndexOptions, Indexer};
use crate::progress::IndexProgressReporter;
use crate::sqlite_store::SqliteStore;
use crate::{db, embedding, migrate};

/// Retry chunks whose embedding failed in an earlier run.
///
/// Takes the indexing lock like `index` does. Messages and chunk
/// boundaries are not touched.
pub async fn run_embed_pending(
    config: &Config,
    dry_run: bool,
    progress: &dyn IndexProgressReporter,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;
    let store = SqliteStore::new(pool.clone());

    if dry_run {
        let pending = store.chunks_with_status(ChunkStatus::Pending).await?;
        println!("embed pending (dry-run)");
        println!("  chunks needing embeddings: {}", pending.len());
        pool.close().await;
        return Ok(());
    }

    let _lock = index_lock::acquire(&config.db.lock_path(), LockMode::Index)?;
    let provider = embedding::create_provider(&config.embedding)?;
    let aliases = AliasResolver::new();
    let indexer = Indexer::new(
        &store,
        &store,
        provider,
        &aliases,
        IndexOptions::from_config(config),
        progress,
    );
    let report = indexer.retry_pending().await?;

    println!("embed pending");
    if report.chunks_seen == 0 && report.recovered == 0 {
        println!("  all chunks up to date");
    } else {
        println!("  total pending: {}", report.chunks_seen);
        println!("  embedded: {}", report.embedded);
        println!("  failed: {}", report.pending);
    }

    pool.close().await;
    Ok(())
}
