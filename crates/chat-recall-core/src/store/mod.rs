//! Storage abstractions for chat-recall.
//!
//! Two traits, matching the two external collaborators the engine talks to:
//!
//! - [`Store`]: durable structured storage for messages, chunk metadata,
//!   identities with their aliases, and the indexing watermark.
//! - [`VectorIndex`]: an abstract nearest-neighbour index keyed by
//!   chunk id.
//!
//! Backends may implement both on one type (the SQLite store and
//! [`memory::InMemoryStore`] do). Implementations must be `Send + Sync` to
//! work with async runtimes.

pub mod memory;

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{
    Chunk, ChunkRecord, ChunkStatus, CorpusStats, DateRange, Identity, Message, MessageKey,
};

/// Outcome of [`Store::upsert_messages`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Smallest key among inserted or changed messages (old or new key).
    pub earliest_changed: Option<MessageKey>,
}

impl UpsertSummary {
    /// Fold another batch's summary into this one.
    pub fn merge(&mut self, other: UpsertSummary) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.earliest_changed = match (self.earliest_changed, other.earliest_changed) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}

/// One nearest-neighbour result.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub chunk_id: String,
    /// Cosine similarity in `[-1, 1]`.
    pub similarity: f32,
}

/// Abstract structured store.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_messages`](Store::upsert_messages) | Insert new messages, update edited ones, leave the rest untouched |
/// | [`messages_from`](Store::messages_from) | Messages at or after a key, in `(timestamp, id)` order |
/// | [`put_chunk`](Store::put_chunk) | Upsert a chunk row keyed by fingerprint with a status |
/// | [`chunk_at_or_before`](Store::chunk_at_or_before) | Restart boundary for incremental re-chunking |
/// | [`watermark`](Store::watermark) | Last message key covered by a successful run |
/// | [`message_counts`](Store::message_counts) | Per-sender message counts for analytics |
/// | [`save_identity`](Store::save_identity) | Persist an identity and its nicknames |
#[async_trait]
pub trait Store: Send + Sync {
    // ---- messages ----

    /// Upsert messages by id. Rows whose content is unchanged are not written.
    async fn upsert_messages(&self, messages: &[Message]) -> Result<UpsertSummary>;

    async fn get_message(&self, id: i64) -> Result<Option<Message>>;

    /// Messages with key `>= from` (all when `None`), ordered by key.
    async fn messages_from(&self, from: Option<MessageKey>) -> Result<Vec<Message>>;

    /// The message `id` with up to `before`/`after` neighbours in key order.
    async fn messages_around(&self, id: i64, before: usize, after: usize)
        -> Result<Vec<Message>>;

    /// Greatest message key in the store.
    async fn last_message_key(&self) -> Result<Option<MessageKey>>;

    /// `(sender identity, message count)` for messages within `range`.
    async fn message_counts(&self, range: Option<DateRange>) -> Result<Vec<(String, u64)>>;

    /// `(sender identity, raw text)` for messages within `range`, only
    /// `identity`'s when set.
    async fn message_texts(
        &self,
        identity: Option<&str>,
        range: Option<DateRange>,
    ) -> Result<Vec<(String, String)>>;

    // ---- chunks ----

    /// Insert or update a chunk row (keyed by fingerprint) with `status`.
    async fn put_chunk(&self, chunk: &Chunk, status: ChunkStatus, error: Option<&str>)
        -> Result<()>;

    async fn set_chunk_status(
        &self,
        chunk_id: &str,
        status: ChunkStatus,
        error: Option<&str>,
    ) -> Result<()>;

    async fn chunk_by_fingerprint(&self, fingerprint: &str) -> Result<Option<ChunkRecord>>;

    /// Chunks by id; missing ids are skipped. Order follows `chunk_ids`.
    async fn get_chunks(&self, chunk_ids: &[String]) -> Result<Vec<ChunkRecord>>;

    async fn chunks_with_status(&self, status: ChunkStatus) -> Result<Vec<ChunkRecord>>;

    /// Chunks whose start key is `>= start` (all when `None`).
    async fn chunks_from(&self, start: Option<MessageKey>) -> Result<Vec<ChunkRecord>>;

    /// The chunk with the greatest start key `<= key`.
    async fn chunk_at_or_before(&self, key: MessageKey) -> Result<Option<ChunkRecord>>;

    /// Ids of committed chunks `identity` contributed to.
    async fn chunk_ids_for_sender(&self, identity: &str) -> Result<Vec<String>>;

    async fn delete_chunk(&self, chunk_id: &str) -> Result<()>;

    /// Drop every chunk row (full reindex).
    async fn clear_chunks(&self) -> Result<()>;

    // ---- watermark ----

    async fn watermark(&self) -> Result<Option<MessageKey>>;

    /// Persist the watermark; `None` clears it.
    async fn set_watermark(&self, key: Option<MessageKey>) -> Result<()>;

    // ---- identities ----

    async fn load_identities(&self) -> Result<Vec<Identity>>;

    /// Insert or replace an identity and its full nickname set.
    async fn save_identity(&self, identity: &Identity) -> Result<()>;

    async fn stats(&self) -> Result<CorpusStats>;
}

/// Abstract nearest-neighbour index.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the vector for `chunk_id`.
    async fn upsert(&self, chunk_id: &str, vector: &[f32]) -> Result<()>;

    /// Top-`k` chunk ids by cosine similarity, descending, ties by chunk id.
    ///
    /// When `allow` is set only those chunk ids are considered.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        allow: Option<&HashSet<String>>,
    ) -> Result<Vec<VectorHit>>;

    async fn delete(&self, chunk_id: &str) -> Result<()>;

    /// Every chunk id that has a vector.
    async fn ids(&self) -> Result<Vec<String>>;
}

/// Sort vector hits best-first with a total order.
pub fn sort_hits(hits: &mut [VectorHit]) {
    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_summary_merge_keeps_earliest() {
        let mut a = UpsertSummary {
            inserted: 1,
            earliest_changed: Some(MessageKey { timestamp: 5, id: 1 }),
            ..Default::default()
        };
        a.merge(UpsertSummary {
            updated: 2,
            earliest_changed: Some(MessageKey { timestamp: 3, id: 9 }),
            ..Default::default()
        });
        assert_eq!(a.inserted, 1);
        assert_eq!(a.updated, 2);
        assert_eq!(a.earliest_changed, Some(MessageKey { timestamp: 3, id: 9 }));
    }

    #[test]
    fn test_sort_hits_ties_by_id() {
        let mut hits = vec![
            VectorHit { chunk_id: "b".into(), similarity: 0.5 },
            VectorHit { chunk_id: "a".into(), similarity: 0.5 },
            VectorHit { chunk_id: "c".into(), similarity: 0.9 },
        ];
        sort_hits(&mut hits);
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }
}
