//! In-memory [`Store`] and [`VectorIndex`] implementation for tests.
//!
//! Uses `BTreeMap`s behind `std::sync::RwLock`. Vector search is brute-force
//! cosine similarity over all stored vectors.
//!
//! Every write that actually changes state bumps a revision counter, so
//! tests can assert that a repeated run left the store untouched.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::{
    Chunk, ChunkRecord, ChunkStatus, CorpusStats, DateRange, Identity, Message, MessageKey,
};

use super::{sort_hits, Store, UpsertSummary, VectorHit, VectorIndex};

/// In-memory store for tests and embedding the engine without SQLite.
#[derive(Default)]
pub struct InMemoryStore {
    messages: RwLock<BTreeMap<i64, Message>>,
    chunks: RwLock<BTreeMap<String, ChunkRecord>>,
    vectors: RwLock<BTreeMap<String, Vec<f32>>>,
    watermark: RwLock<Option<MessageKey>>,
    identities: RwLock<BTreeMap<String, Identity>>,
    revision: AtomicU64,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of state-changing writes so far.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    fn sorted_messages(&self) -> Vec<Message> {
        let mut all: Vec<Message> = read(&self.messages).values().cloned().collect();
        all.sort_by_key(|m| m.key());
        all
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_messages(&self, messages: &[Message]) -> Result<UpsertSummary> {
        let mut summary = UpsertSummary::default();
        let mut stored = write(&self.messages);
        for msg in messages {
            let changed_key = match stored.get(&msg.id) {
                Some(existing) if existing == msg => {
                    summary.unchanged += 1;
                    continue;
                }
                Some(existing) => {
                    summary.updated += 1;
                    existing.key().min(msg.key())
                }
                None => {
                    summary.inserted += 1;
                    msg.key()
                }
            };
            summary.earliest_changed = Some(
                summary
                    .earliest_changed
                    .map_or(changed_key, |k| k.min(changed_key)),
            );
            stored.insert(msg.id, msg.clone());
            self.bump();
        }
        Ok(summary)
    }

    async fn get_message(&self, id: i64) -> Result<Option<Message>> {
        Ok(read(&self.messages).get(&id).cloned())
    }

    async fn messages_from(&self, from: Option<MessageKey>) -> Result<Vec<Message>> {
        Ok(self
            .sorted_messages()
            .into_iter()
            .filter(|m| from.map_or(true, |f| m.key() >= f))
            .collect())
    }

    async fn messages_around(
        &self,
        id: i64,
        before: usize,
        after: usize,
    ) -> Result<Vec<Message>> {
        let all = self.sorted_messages();
        let Some(pos) = all.iter().position(|m| m.id == id) else {
            return Ok(Vec::new());
        };
        let start = pos.saturating_sub(before);
        let end = (pos + after + 1).min(all.len());
        Ok(all[start..end].to_vec())
    }

    async fn last_message_key(&self) -> Result<Option<MessageKey>> {
        Ok(read(&self.messages).values().map(|m| m.key()).max())
    }

    async fn message_counts(&self, range: Option<DateRange>) -> Result<Vec<(String, u64)>> {
        let mut counts: HashMap<String, u64> = HashMap::new();
        for msg in read(&self.messages).values() {
            if range.map_or(true, |r| r.contains(msg.timestamp)) {
                *counts.entry(msg.sender_identity.clone()).or_default() += 1;
            }
        }
        Ok(counts.into_iter().collect())
    }

    async fn message_texts(
        &self,
        identity: Option<&str>,
        range: Option<DateRange>,
    ) -> Result<Vec<(String, String)>> {
        Ok(self
            .sorted_messages()
            .into_iter()
            .filter(|m| identity.map_or(true, |id| m.sender_identity == id))
            .filter(|m| range.map_or(true, |r| r.contains(m.timestamp)))
            .map(|m| (m.sender_identity, m.raw_text))
            .collect())
    }

    async fn put_chunk(
        &self,
        chunk: &Chunk,
        status: ChunkStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let record = ChunkRecord {
            chunk: chunk.clone(),
            status,
            last_error: error.map(str::to_string),
        };
        let mut chunks = write(&self.chunks);
        if chunks.get(&chunk.chunk_id) != Some(&record) {
            chunks.insert(chunk.chunk_id.clone(), record);
            self.bump();
        }
        Ok(())
    }

    async fn set_chunk_status(
        &self,
        chunk_id: &str,
        status: ChunkStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut chunks = write(&self.chunks);
        if let Some(record) = chunks.get_mut(chunk_id) {
            let error = error.map(str::to_string);
            if record.status != status || record.last_error != error {
                record.status = status;
                record.last_error = error;
                self.bump();
            }
        }
        Ok(())
    }

    async fn chunk_by_fingerprint(&self, fingerprint: &str) -> Result<Option<ChunkRecord>> {
        Ok(read(&self.chunks)
            .values()
            .find(|r| r.chunk.content_fingerprint == fingerprint)
            .cloned())
    }

    async fn get_chunks(&self, chunk_ids: &[String]) -> Result<Vec<ChunkRecord>> {
        let chunks = read(&self.chunks);
        Ok(chunk_ids
            .iter()
            .filter_map(|id| chunks.get(id).cloned())
            .collect())
    }

    async fn chunks_with_status(&self, status: ChunkStatus) -> Result<Vec<ChunkRecord>> {
        let mut out: Vec<ChunkRecord> = read(&self.chunks)
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        out.sort_by_key(|r| (r.chunk.start_key(), r.chunk.chunk_id.clone()));
        Ok(out)
    }

    async fn chunks_from(&self, start: Option<MessageKey>) -> Result<Vec<ChunkRecord>> {
        let mut out: Vec<ChunkRecord> = read(&self.chunks)
            .values()
            .filter(|r| start.map_or(true, |s| r.chunk.start_key() >= s))
            .cloned()
            .collect();
        out.sort_by_key(|r| (r.chunk.start_key(), r.chunk.chunk_id.clone()));
        Ok(out)
    }

    async fn chunk_at_or_before(&self, key: MessageKey) -> Result<Option<ChunkRecord>> {
        Ok(read(&self.chunks)
            .values()
            .filter(|r| r.chunk.start_key() <= key)
            .max_by_key(|r| (r.chunk.start_key(), r.chunk.chunk_id.clone()))
            .cloned())
    }

    async fn chunk_ids_for_sender(&self, identity: &str) -> Result<Vec<String>> {
        Ok(read(&self.chunks)
            .values()
            .filter(|r| r.status == ChunkStatus::Committed && r.chunk.has_sender(identity))
            .map(|r| r.chunk.chunk_id.clone())
            .collect())
    }

    async fn delete_chunk(&self, chunk_id: &str) -> Result<()> {
        if write(&self.chunks).remove(chunk_id).is_some() {
            self.bump();
        }
        Ok(())
    }

    async fn clear_chunks(&self) -> Result<()> {
        let mut chunks = write(&self.chunks);
        if !chunks.is_empty() {
            chunks.clear();
            self.bump();
        }
        Ok(())
    }

    async fn watermark(&self) -> Result<Option<MessageKey>> {
        Ok(*read(&self.watermark))
    }

    async fn set_watermark(&self, key: Option<MessageKey>) -> Result<()> {
        let mut wm = write(&self.watermark);
        if *wm != key {
            *wm = key;
            self.bump();
        }
        Ok(())
    }

    async fn load_identities(&self) -> Result<Vec<Identity>> {
        Ok(read(&self.identities).values().cloned().collect())
    }

    async fn save_identity(&self, identity: &Identity) -> Result<()> {
        let mut identities = write(&self.identities);
        if identities.get(&identity.identity_id) != Some(identity) {
            identities.insert(identity.identity_id.clone(), identity.clone());
            self.bump();
        }
        Ok(())
    }

    async fn stats(&self) -> Result<CorpusStats> {
        let messages = read(&self.messages);
        let chunks = read(&self.chunks);
        let identities = read(&self.identities);
        let count = |s: ChunkStatus| chunks.values().filter(|r| r.status == s).count() as i64;
        Ok(CorpusStats {
            messages: messages.len() as i64,
            identities: identities.len() as i64,
            aliases: identities.values().map(|i| i.nicknames.len() as i64).sum(),
            chunks_committed: count(ChunkStatus::Committed),
            chunks_pending: count(ChunkStatus::Pending),
            chunks_writing: count(ChunkStatus::Writing),
            vectors: read(&self.vectors).len() as i64,
            first_message_at: messages.values().map(|m| m.timestamp).min(),
            last_message_at: messages.values().map(|m| m.timestamp).max(),
            watermark: *read(&self.watermark),
        })
    }
}

#[async_trait]
impl VectorIndex for InMemoryStore {
    async fn upsert(&self, chunk_id: &str, vector: &[f32]) -> Result<()> {
        let mut vectors = write(&self.vectors);
        if vectors.get(chunk_id).map(Vec::as_slice) != Some(vector) {
            vectors.insert(chunk_id.to_string(), vector.to_vec());
            self.bump();
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        allow: Option<&HashSet<String>>,
    ) -> Result<Vec<VectorHit>> {
        let mut hits: Vec<VectorHit> = read(&self.vectors)
            .iter()
            .filter(|(id, _)| allow.map_or(true, |a| a.contains(*id)))
            .map(|(id, v)| VectorHit {
                chunk_id: id.clone(),
                similarity: cosine_similarity(vector, v),
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete(&self, chunk_id: &str) -> Result<()> {
        if write(&self.vectors).remove(chunk_id).is_some() {
            self.bump();
        }
        Ok(())
    }

    async fn ids(&self) -> Result<Vec<String>> {
        Ok(read(&self.vectors).keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn msg(id: i64, secs: i64, text: &str) -> Message {
        Message {
            id,
            sender_identity: "u1".into(),
            sender_name: "U".into(),
            timestamp: Utc.timestamp_opt(1_000 + secs, 0).unwrap(),
            raw_text: text.into(),
            reply_to_id: None,
            forwarded_from: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_messages_skips_unchanged() {
        let store = InMemoryStore::new();
        let s1 = store.upsert_messages(&[msg(1, 0, "a"), msg(2, 5, "b")]).await.unwrap();
        assert_eq!(s1.inserted, 2);
        let rev = store.revision();

        let s2 = store.upsert_messages(&[msg(1, 0, "a"), msg(2, 5, "b")]).await.unwrap();
        assert_eq!(s2.unchanged, 2);
        assert_eq!(s2.earliest_changed, None);
        assert_eq!(store.revision(), rev);

        let s3 = store.upsert_messages(&[msg(2, 5, "edited")]).await.unwrap();
        assert_eq!(s3.updated, 1);
        assert_eq!(s3.earliest_changed, Some(MessageKey { timestamp: 1_005, id: 2 }));
    }

    #[tokio::test]
    async fn test_messages_around() {
        let store = InMemoryStore::new();
        let msgs: Vec<Message> = (1..=10).map(|i| msg(i, i * 10, "x")).collect();
        store.upsert_messages(&msgs).await.unwrap();
        let around = store.messages_around(5, 2, 2).await.unwrap();
        let ids: Vec<i64> = around.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![3, 4, 5, 6, 7]);
        let edge = store.messages_around(1, 3, 1).await.unwrap();
        assert_eq!(edge.len(), 2);
        assert!(store.messages_around(99, 1, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vector_query_respects_allow_list() {
        let store = InMemoryStore::new();
        store.upsert("a", &[1.0, 0.0]).await.unwrap();
        store.upsert("b", &[0.9, 0.1]).await.unwrap();
        store.upsert("c", &[0.0, 1.0]).await.unwrap();

        let hits = store.query(&[1.0, 0.0], 2, None).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let allow: HashSet<String> = ["c".to_string()].into_iter().collect();
        let hits = store.query(&[1.0, 0.0], 5, Some(&allow)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c");
    }

    #[tokio::test]
    async fn test_watermark_write_only_on_change() {
        let store = InMemoryStore::new();
        let key = Some(MessageKey { timestamp: 1, id: 1 });
        store.set_watermark(key).await.unwrap();
        let rev = store.revision();
        store.set_watermark(key).await.unwrap();
        assert_eq!(store.revision(), rev);
        assert_eq!(store.watermark().await.unwrap(), key);
    }
}
