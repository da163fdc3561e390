//! Indexing pipeline: export → messages → chunks → vectors.
//!
//! One run of [`Indexer`]:
//!
//! 1. **Recover.** Chunks left in `writing` by a crashed run lose their
//!    vector and go back to `pending`. Vectors with no committed chunk are
//!    deleted.
//! 2. **Ingest.** Messages are upserted in batches; unchanged messages
//!    are not written. New senders become identities.
//! 3. **Re-chunk.** Chunking restarts at the chunk covering
//!    `min(watermark, earliest changed message)`, so appending to a chat
//!    only re-chunks the tail. Committed chunks with an unchanged
//!    fingerprint are left alone. Chunks whose fingerprint no longer
//!    appears are stale: uncommitted ones are deleted at once, committed
//!    ones stay searchable until their replacements are committed.
//! 4. **Embed.** New and pending chunks are embedded in batches, at most
//!    `embedding.concurrency` batches in flight.
//! 5. **Commit.** Per chunk: status `writing` → vector upsert → status
//!    `committed`. A failed batch leaves its chunks `pending` with the
//!    error, to be retried by the next run or `recall embed pending`.
//! 6. **Settle.** If every chunk of the re-chunked range is committed, the
//!    stale chunks are deleted and the watermark advances to the greatest
//!    message key. Otherwise the stale chunks are kept and the watermark
//!    is held at the restart point, so the next run rebuilds the same
//!    range. The watermark is written only when it moved.
//!
//! Running the pipeline twice over the same export performs no writes the
//! second time.

use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chat_recall_core::alias::AliasResolver;
use chat_recall_core::chunk::{chunk_messages, ChunkPolicy};
use chat_recall_core::embedding::EmbeddingProvider;
use chat_recall_core::error::ProviderError;
use chat_recall_core::models::{Chunk, ChunkStatus, Message, MessageKey};
use chat_recall_core::store::{Store, UpsertSummary, VectorIndex};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::export::{stream_export, ExportReport};
use crate::index_lock::{self, LockMode};
use crate::progress::{IndexProgressEvent, IndexProgressReporter};
use crate::sqlite_store::SqliteStore;
use crate::{db, embedding, migrate};

/// Messages per store upsert while streaming an export.
const MESSAGE_BATCH: usize = 500;

/// Chunks per embedding request.
pub const EMBED_BATCH: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct IndexOptions {
    pub chunk_policy: ChunkPolicy,
    /// Embedding batches in flight.
    pub concurrency: usize,
    pub batch_size: usize,
}

impl IndexOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_policy: config.chunking.policy(),
            concurrency: config.embedding.concurrency.max(1),
            batch_size: EMBED_BATCH,
        }
    }
}

/// What one run did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexReport {
    pub export: Option<ExportReport>,
    pub messages: UpsertSummary,
    pub identities_saved: usize,
    /// Chunks reset from `writing` to `pending` by crash recovery.
    pub recovered: usize,
    pub orphan_vectors: usize,
    /// Start of the re-chunked range; `None` means from the beginning.
    pub restart_from: Option<MessageKey>,
    pub chunks_seen: usize,
    pub chunks_unchanged: usize,
    pub chunks_removed: usize,
    /// Stale committed chunks kept because a replacement is still pending.
    pub chunks_deferred: usize,
    pub embedded: usize,
    pub pending: usize,
    pub watermark: Option<MessageKey>,
}

/// Output of re-chunking the affected range.
struct Rechunk {
    /// Chunks that need vectors.
    work: Vec<Chunk>,
    /// Every chunk id the range now consists of.
    range: HashSet<String>,
    /// Committed chunks the range no longer contains.
    stale: Vec<String>,
}

/// Outcome of committing embedded chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitCounts {
    pub embedded: usize,
    pub pending: usize,
}

pub struct Indexer<'a> {
    store: &'a dyn Store,
    index: &'a dyn VectorIndex,
    provider: Arc<dyn EmbeddingProvider>,
    aliases: &'a AliasResolver,
    options: IndexOptions,
    progress: &'a dyn IndexProgressReporter,
}

impl<'a> Indexer<'a> {
    pub fn new(
        store: &'a dyn Store,
        index: &'a dyn VectorIndex,
        provider: Arc<dyn EmbeddingProvider>,
        aliases: &'a AliasResolver,
        options: IndexOptions,
        progress: &'a dyn IndexProgressReporter,
    ) -> Self {
        Self {
            store,
            index,
            provider,
            aliases,
            options,
            progress,
        }
    }

    /// Index an in-memory message list end to end.
    pub async fn index_messages(&self, messages: &[Message]) -> Result<IndexReport> {
        let mut report = IndexReport::default();
        self.recover(&mut report).await?;
        for batch in messages.chunks(MESSAGE_BATCH) {
            self.ingest_batch(batch, &mut report).await?;
        }
        self.finish(&mut report).await?;
        Ok(report)
    }

    /// Stream an export file through the pipeline.
    pub async fn index_export(&self, path: &Path) -> Result<IndexReport> {
        let mut report = IndexReport::default();
        self.recover(&mut report).await?;

        let file = File::open(path)
            .with_context(|| format!("Failed to open export: {}", path.display()))?;
        let (tx, mut rx) = mpsc::channel::<Message>(MESSAGE_BATCH * 2);
        let parser = tokio::task::spawn_blocking(move || {
            stream_export(file, |msg| tx.blocking_send(msg).is_ok())
        });

        let mut batch = Vec::with_capacity(MESSAGE_BATCH);
        let mut read = 0u64;
        while let Some(msg) = rx.recv().await {
            batch.push(msg);
            if batch.len() >= MESSAGE_BATCH {
                read += batch.len() as u64;
                self.ingest_batch(&batch, &mut report).await?;
                self.progress.report(IndexProgressEvent::Parsing { n: read });
                batch.clear();
            }
        }
        if !batch.is_empty() {
            read += batch.len() as u64;
            self.ingest_batch(&batch, &mut report).await?;
            self.progress.report(IndexProgressEvent::Parsing { n: read });
        }

        let export = parser.await.context("export parser task failed")??;
        info!(
            parsed = export.parsed,
            service = export.skipped_service,
            empty = export.skipped_empty,
            malformed = export.malformed,
            "export parsed"
        );
        report.export = Some(export);

        self.finish(&mut report).await?;
        Ok(report)
    }

    /// Re-chunk and embed from already stored messages.
    pub async fn index_stored(&self) -> Result<IndexReport> {
        let mut report = IndexReport::default();
        self.recover(&mut report).await?;
        self.finish(&mut report).await?;
        Ok(report)
    }

    /// Embed only the chunks left pending by earlier runs.
    pub async fn retry_pending(&self) -> Result<IndexReport> {
        let mut report = IndexReport::default();
        self.recover(&mut report).await?;
        let work: Vec<Chunk> = self
            .store
            .chunks_with_status(ChunkStatus::Pending)
            .await?
            .into_iter()
            .map(|r| r.chunk)
            .collect();
        report.chunks_seen = work.len();
        let counts = self.embed_and_commit(work).await?;
        report.embedded = counts.embedded;
        report.pending = counts.pending;
        report.watermark = self.store.watermark().await?;
        Ok(report)
    }

    /// Drop every chunk, vector, and the watermark.
    pub async fn reset(&self) -> Result<()> {
        for id in self.index.ids().await? {
            self.index.delete(&id).await?;
        }
        self.store.clear_chunks().await?;
        self.store.set_watermark(None).await?;
        info!("cleared chunks, vectors, and watermark");
        Ok(())
    }

    /// Crash recovery: `writing` → `pending`, then drop orphan vectors.
    async fn recover(&self, report: &mut IndexReport) -> Result<()> {
        for record in self.store.chunks_with_status(ChunkStatus::Writing).await? {
            let id = &record.chunk.chunk_id;
            self.index.delete(id).await?;
            self.store
                .set_chunk_status(id, ChunkStatus::Pending, Some("interrupted while writing"))
                .await?;
            report.recovered += 1;
        }

        let vector_ids = self.index.ids().await?;
        if !vector_ids.is_empty() {
            let committed: HashSet<String> = self
                .store
                .get_chunks(&vector_ids)
                .await?
                .into_iter()
                .filter(|r| r.status == ChunkStatus::Committed)
                .map(|r| r.chunk.chunk_id)
                .collect();
            for id in vector_ids.iter().filter(|id| !committed.contains(*id)) {
                self.index.delete(id).await?;
                report.orphan_vectors += 1;
            }
        }

        if report.recovered > 0 || report.orphan_vectors > 0 {
            warn!(
                recovered = report.recovered,
                orphan_vectors = report.orphan_vectors,
                "recovered from an interrupted run"
            );
        }
        Ok(())
    }

    async fn ingest_batch(&self, batch: &[Message], report: &mut IndexReport) -> Result<()> {
        let summary = self.store.upsert_messages(batch).await?;
        report.messages.merge(summary);

        let mut seen = HashSet::new();
        for msg in batch {
            if !seen.insert(msg.sender_identity.as_str()) {
                continue;
            }
            if let Some(identity) = self
                .aliases
                .observe_sender(&msg.sender_identity, &msg.sender_name)
            {
                self.store.save_identity(&identity).await?;
                report.identities_saved += 1;
            }
        }
        Ok(())
    }

    async fn finish(&self, report: &mut IndexReport) -> Result<()> {
        let plan = self.rechunk(report).await?;
        let counts = self.embed_and_commit(plan.work).await?;
        report.embedded = counts.embedded;
        report.pending = counts.pending;

        let pending: HashSet<String> = self
            .store
            .chunks_with_status(ChunkStatus::Pending)
            .await?
            .into_iter()
            .map(|r| r.chunk.chunk_id)
            .collect();
        let settled = plan.range.iter().all(|id| !pending.contains(id));

        let target = if settled {
            for id in &plan.stale {
                self.index.delete(id).await?;
                self.store.delete_chunk(id).await?;
                report.chunks_removed += 1;
            }
            self.store.last_message_key().await?
        } else {
            report.chunks_deferred = plan.stale.len();
            if !plan.stale.is_empty() {
                warn!(
                    stale = plan.stale.len(),
                    "replacements still pending, keeping superseded chunks searchable"
                );
            }
            report.restart_from
        };
        if self.store.watermark().await? != target {
            self.store.set_watermark(target).await?;
        }
        report.watermark = target;
        Ok(())
    }

    /// Restart point for incremental chunking.
    async fn restart_point(&self, earliest_changed: Option<MessageKey>) -> Result<Option<MessageKey>> {
        let Some(watermark) = self.store.watermark().await? else {
            return Ok(None);
        };
        let boundary = earliest_changed.map_or(watermark, |e| e.min(watermark));
        Ok(self
            .store
            .chunk_at_or_before(boundary)
            .await?
            .map(|record| record.chunk.start_key()))
    }

    /// Re-chunk the affected tail.
    async fn rechunk(&self, report: &mut IndexReport) -> Result<Rechunk> {
        let restart = self.restart_point(report.messages.earliest_changed).await?;
        report.restart_from = restart;

        let messages = self.store.messages_from(restart).await?;
        let chunks = chunk_messages(&messages, &self.options.chunk_policy);
        report.chunks_seen = chunks.len();
        debug!(restart = ?restart, messages = messages.len(), chunks = chunks.len(), "re-chunked");

        let fresh: HashSet<&str> = chunks
            .iter()
            .map(|c| c.content_fingerprint.as_str())
            .collect();
        let mut stale = Vec::new();
        for old in self.store.chunks_from(restart).await? {
            if fresh.contains(old.chunk.content_fingerprint.as_str()) {
                continue;
            }
            if old.status == ChunkStatus::Committed {
                stale.push(old.chunk.chunk_id);
            } else {
                self.index.delete(&old.chunk.chunk_id).await?;
                self.store.delete_chunk(&old.chunk.chunk_id).await?;
                report.chunks_removed += 1;
            }
        }
        let range: HashSet<String> = chunks.iter().map(|c| c.chunk_id.clone()).collect();

        let mut work = Vec::new();
        let mut queued = HashSet::new();
        for chunk in chunks {
            match self.store.chunk_by_fingerprint(&chunk.content_fingerprint).await? {
                Some(existing) if existing.status == ChunkStatus::Committed => {
                    report.chunks_unchanged += 1;
                }
                Some(existing) if existing.status == ChunkStatus::Pending => {
                    queued.insert(chunk.chunk_id.clone());
                    work.push(existing.chunk);
                }
                _ => {
                    self.store.put_chunk(&chunk, ChunkStatus::Pending, None).await?;
                    queued.insert(chunk.chunk_id.clone());
                    work.push(chunk);
                }
            }
        }

        // Pending chunks outside the re-chunked range get another try too.
        for record in self.store.chunks_with_status(ChunkStatus::Pending).await? {
            if queued.insert(record.chunk.chunk_id.clone()) {
                work.push(record.chunk);
            }
        }
        Ok(Rechunk { work, range, stale })
    }

    /// Embed `chunks` with bounded concurrency and commit each batch.
    pub async fn embed_and_commit(&self, chunks: Vec<Chunk>) -> Result<CommitCounts> {
        let mut counts = CommitCounts::default();
        if chunks.is_empty() {
            return Ok(counts);
        }
        let total = chunks.len() as u64;
        let sem = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut set = JoinSet::new();

        for batch in chunks.chunks(self.options.batch_size.max(1)) {
            let permit = sem
                .clone()
                .acquire_owned()
                .await
                .context("acquire embedding permit")?;
            let provider = Arc::clone(&self.provider);
            let batch = batch.to_vec();
            set.spawn(async move {
                let texts: Vec<String> = batch.iter().map(|c| c.normalized_text.clone()).collect();
                let result = provider.embed(&texts).await;
                drop(permit);
                (batch, result)
            });

            while let Some(done) = set.try_join_next() {
                let (batch, result) = done.context("join embedding task")?;
                self.commit_batch(&batch, result, &mut counts).await?;
                self.progress.report(IndexProgressEvent::Embedding {
                    n: (counts.embedded + counts.pending) as u64,
                    total,
                });
            }
        }

        while let Some(done) = set.join_next().await {
            let (batch, result) = done.context("join embedding task")?;
            self.commit_batch(&batch, result, &mut counts).await?;
            self.progress.report(IndexProgressEvent::Embedding {
                n: (counts.embedded + counts.pending) as u64,
                total,
            });
        }
        Ok(counts)
    }

    async fn commit_batch(
        &self,
        batch: &[Chunk],
        result: std::result::Result<Vec<Vec<f32>>, ProviderError>,
        counts: &mut CommitCounts,
    ) -> Result<()> {
        let vectors = match result {
            Ok(v) if v.len() == batch.len() => v,
            Ok(v) => {
                let msg = format!("provider returned {} vectors for {} chunks", v.len(), batch.len());
                return self.leave_pending(batch, &msg, counts).await;
            }
            Err(e) => {
                warn!(error = %e, chunks = batch.len(), "embedding batch failed");
                return self.leave_pending(batch, &e.to_string(), counts).await;
            }
        };

        for (chunk, vector) in batch.iter().zip(vectors) {
            self.store.put_chunk(chunk, ChunkStatus::Writing, None).await?;
            self.index.upsert(&chunk.chunk_id, &vector).await?;
            self.store
                .set_chunk_status(&chunk.chunk_id, ChunkStatus::Committed, None)
                .await?;
            counts.embedded += 1;
        }
        Ok(())
    }

    async fn leave_pending(&self, batch: &[Chunk], error: &str, counts: &mut CommitCounts) -> Result<()> {
        for chunk in batch {
            self.store
                .set_chunk_status(&chunk.chunk_id, ChunkStatus::Pending, Some(error))
                .await?;
            counts.pending += 1;
        }
        Ok(())
    }
}

/// `recall index` / `recall reindex`.
pub async fn run_index(
    config: &Config,
    export: Option<&Path>,
    mode: LockMode,
    progress: &dyn IndexProgressReporter,
) -> Result<IndexReport> {
    let _lock = index_lock::acquire(&config.db.lock_path(), mode)?;

    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;
    let store = SqliteStore::new(pool.clone());
    let aliases = AliasResolver::from_identities(store.load_identities().await?)?;
    let provider = embedding::create_provider(&config.embedding)?;
    let indexer = Indexer::new(
        &store,
        &store,
        provider,
        &aliases,
        IndexOptions::from_config(config),
        progress,
    );

    if mode == LockMode::Reindex {
        indexer.reset().await?;
    }
    let report = match export {
        Some(path) => indexer.index_export(path).await?,
        None => indexer.index_stored().await?,
    };

    print_report(mode, &report);
    pool.close().await;
    Ok(report)
}

fn print_report(mode: LockMode, report: &IndexReport) {
    println!("{}", mode.as_str());
    if let Some(export) = &report.export {
        println!("  parsed: {} messages", export.parsed);
        if export.malformed > 0 {
            println!("  malformed: {}", export.malformed);
        }
    }
    println!(
        "  messages: {} new, {} updated, {} unchanged",
        report.messages.inserted, report.messages.updated, report.messages.unchanged
    );
    if report.recovered > 0 {
        println!("  recovered: {} interrupted chunks", report.recovered);
    }
    println!(
        "  chunks: {} ({} unchanged, {} removed)",
        report.chunks_seen, report.chunks_unchanged, report.chunks_removed
    );
    if report.chunks_deferred > 0 {
        println!("  superseded: {} kept until replacements commit", report.chunks_deferred);
    }
    println!("  embedded: {}", report.embedded);
    if report.pending > 0 {
        println!("  pending: {} (retry with `recall embed pending`)", report.pending);
    }
    match report.watermark {
        Some(wm) => println!("  watermark: {}", wm),
        None => println!("  watermark: (empty corpus)"),
    }
    println!("ok");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use async_trait::async_trait;
    use chat_recall_core::embedding::HashingProvider;
    use chat_recall_core::store::memory::InMemoryStore;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn msg(id: i64, sender: &str, secs: i64, text: &str) -> Message {
        Message {
            id,
            sender_identity: sender.to_string(),
            sender_name: sender.to_uppercase(),
            timestamp: Utc.timestamp_opt(1_600_000_000 + secs, 0).unwrap(),
            raw_text: text.to_string(),
            reply_to_id: None,
            forwarded_from: None,
        }
    }

    fn corpus() -> Vec<Message> {
        vec![
            msg(1, "alice", 0, "crypto is the future"),
            msg(2, "bob", 10, "no way, it is a bubble"),
            msg(3, "alice", 5000, "bought more bitcoin"),
            msg(4, "carol", 10000, "lunch anyone?"),
        ]
    }

    fn options() -> IndexOptions {
        IndexOptions {
            chunk_policy: ChunkPolicy::default(),
            concurrency: 2,
            batch_size: 2,
        }
    }

    /// Fails while the switch is on.
    struct Flaky {
        inner: HashingProvider,
        failing: AtomicBool,
    }

    #[async_trait]
    impl EmbeddingProvider for Flaky {
        fn model_name(&self) -> &str {
            "flaky"
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ProviderError::Transient("quota exceeded".into()));
            }
            self.inner.embed(texts).await
        }
    }

    #[tokio::test]
    async fn test_second_run_writes_nothing() {
        let store = InMemoryStore::new();
        let aliases = AliasResolver::new();
        let indexer = Indexer::new(
            &store,
            &store,
            Arc::new(HashingProvider::new(64)),
            &aliases,
            options(),
            &NoProgress,
        );

        let first = indexer.index_messages(&corpus()).await.unwrap();
        assert_eq!(first.messages.inserted, 4);
        assert_eq!(first.identities_saved, 3);
        assert_eq!(first.embedded, first.chunks_seen);
        assert_eq!(first.pending, 0);

        let revision = store.revision();
        let second = indexer.index_messages(&corpus()).await.unwrap();
        assert_eq!(store.revision(), revision);
        assert_eq!(second.messages.unchanged, 4);
        assert_eq!(second.embedded, 0);
        assert_eq!(second.chunks_unchanged, second.chunks_seen);
    }

    #[tokio::test]
    async fn test_append_only_rechunks_tail() {
        let store = InMemoryStore::new();
        let aliases = AliasResolver::new();
        let indexer = Indexer::new(
            &store,
            &store,
            Arc::new(HashingProvider::new(64)),
            &aliases,
            options(),
            &NoProgress,
        );
        indexer.index_messages(&corpus()).await.unwrap();

        let mut more = corpus();
        more.push(msg(5, "carol", 10020, "pizza then"));
        let report = indexer.index_messages(&more).await.unwrap();
        assert_eq!(report.messages.inserted, 1);
        // Carol's run is rebuilt; everything before it is untouched.
        assert_eq!(report.chunks_removed, 1);
        assert_eq!(report.embedded, 1);
        assert!(report.restart_from.is_some());
        assert_eq!(
            store.watermark().await.unwrap().map(|k| k.id),
            Some(5)
        );
    }

    #[tokio::test]
    async fn test_failed_batches_stay_pending_then_retry() {
        let store = InMemoryStore::new();
        let aliases = AliasResolver::new();
        let provider = Arc::new(Flaky {
            inner: HashingProvider::new(64),
            failing: AtomicBool::new(true),
        });
        let indexer = Indexer::new(&store, &store, provider.clone(), &aliases, options(), &NoProgress);

        let report = indexer.index_messages(&corpus()).await.unwrap();
        assert_eq!(report.embedded, 0);
        assert_eq!(report.pending, report.chunks_seen);
        assert!(store.ids().await.unwrap().is_empty());
        let pending = store.chunks_with_status(ChunkStatus::Pending).await.unwrap();
        assert!(pending[0].last_error.as_deref().unwrap_or("").contains("quota"));

        provider.failing.store(false, Ordering::SeqCst);
        let report = indexer.index_messages(&corpus()).await.unwrap();
        assert_eq!(report.pending, 0);
        assert_eq!(report.embedded, pending.len());
        assert!(store.chunks_with_status(ChunkStatus::Pending).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recovery_resets_writing_chunks() {
        let store = InMemoryStore::new();
        let aliases = AliasResolver::new();
        let indexer = Indexer::new(
            &store,
            &store,
            Arc::new(HashingProvider::new(64)),
            &aliases,
            options(),
            &NoProgress,
        );
        indexer.index_messages(&corpus()).await.unwrap();

        // Simulate a crash between the vector upsert and the commit.
        let victim = store.chunks_from(None).await.unwrap()[0].chunk.clone();
        store
            .set_chunk_status(&victim.chunk_id, ChunkStatus::Writing, None)
            .await
            .unwrap();
        store.upsert("stray", &[0.0; 64]).await.unwrap();

        let report = indexer.index_stored().await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.orphan_vectors, 1);
        assert_eq!(report.embedded, 1);
        let record = store.chunk_by_fingerprint(&victim.content_fingerprint).await.unwrap().unwrap();
        assert_eq!(record.status, ChunkStatus::Committed);
    }

    #[tokio::test]
    async fn test_failed_incremental_keeps_old_chunks_searchable() {
        let store = InMemoryStore::new();
        let aliases = AliasResolver::new();
        let provider = Arc::new(Flaky {
            inner: HashingProvider::new(64),
            failing: AtomicBool::new(false),
        });
        let indexer = Indexer::new(&store, &store, provider.clone(), &aliases, options(), &NoProgress);
        indexer.index_messages(&corpus()).await.unwrap();
        let settled = store.watermark().await.unwrap();

        let lunch = store
            .chunks_from(None)
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.chunk.normalized_text.contains("lunch"))
            .unwrap()
            .chunk;

        let mut more = corpus();
        more.push(msg(5, "carol", 10020, "pizza then"));
        provider.failing.store(true, Ordering::SeqCst);
        let report = indexer.index_messages(&more).await.unwrap();
        assert_eq!(report.pending, 1);
        assert_eq!(report.chunks_removed, 0);
        assert_eq!(report.chunks_deferred, 1);

        // The superseded chunk is still committed with its vector.
        assert!(store.ids().await.unwrap().contains(&lunch.chunk_id));
        let record = store
            .chunk_by_fingerprint(&lunch.content_fingerprint)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ChunkStatus::Committed);
        // The watermark does not move past the unsettled range.
        let held = store.watermark().await.unwrap();
        assert_eq!(held, report.restart_from);
        assert!(held <= settled);

        provider.failing.store(false, Ordering::SeqCst);
        let report = indexer.index_messages(&more).await.unwrap();
        assert_eq!(report.pending, 0);
        assert_eq!(report.embedded, 1);
        assert_eq!(report.chunks_removed, 1);
        assert!(!store.ids().await.unwrap().contains(&lunch.chunk_id));
        assert_eq!(store.watermark().await.unwrap().map(|k| k.id), Some(5));
    }

    #[tokio::test]
    async fn test_recovery_scales_past_sqlite_variable_limit() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("recall.sqlite")).await.unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        let store = SqliteStore::new(pool.clone());

        let committed = 33_000;
        let blob = chat_recall_core::embedding::vec_to_blob(&[1.0, 0.0]);
        let mut tx = pool.begin().await.unwrap();
        for i in 0..committed {
            let id = format!("c{:05}", i);
            sqlx::query(
                "INSERT INTO chunks (chunk_id, fingerprint, message_ids, text, start_ts, start_id, \
                 end_ts, end_id, primary_sender, status, updated_at) \
                 VALUES (?, ?, '[]', 'x', ?, ?, ?, ?, 'alice', 'committed', 0)",
            )
            .bind(&id)
            .bind(&id)
            .bind(i)
            .bind(i)
            .bind(i)
            .bind(i)
            .execute(&mut *tx)
            .await
            .unwrap();
            sqlx::query("INSERT INTO chunk_vectors (chunk_id, dims, embedding) VALUES (?, 2, ?)")
                .bind(&id)
                .bind(&blob)
                .execute(&mut *tx)
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();
        store.upsert("orphan-a", &[0.0, 1.0]).await.unwrap();
        store.upsert("orphan-b", &[0.0, 1.0]).await.unwrap();

        let aliases = AliasResolver::new();
        let indexer = Indexer::new(
            &store,
            &store,
            Arc::new(HashingProvider::new(2)),
            &aliases,
            options(),
            &NoProgress,
        );
        let mut report = IndexReport::default();
        indexer.recover(&mut report).await.unwrap();

        assert_eq!(report.orphan_vectors, 2);
        assert_eq!(store.ids().await.unwrap().len(), committed as usize);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let store = InMemoryStore::new();
        let aliases = AliasResolver::new();
        let indexer = Indexer::new(
            &store,
            &store,
            Arc::new(HashingProvider::new(64)),
            &aliases,
            options(),
            &NoProgress,
        );
        indexer.index_messages(&corpus()).await.unwrap();
        indexer.reset().await.unwrap();
        assert!(store.ids().await.unwrap().is_empty());
        assert!(store.chunks_from(None).await.unwrap().is_empty());
        assert_eq!(store.watermark().await.unwrap(), None);
        assert_eq!(store.messages_from(None).await.unwrap().len(), 4);
    }
}
