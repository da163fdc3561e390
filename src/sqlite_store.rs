//! SQLite-backed [`Store`] and [`VectorIndex`].
//!
//! One pool serves both traits. Vectors live in `chunk_vectors` as
//! little-endian `f32` blobs and are searched brute-force, which is fine
//! for a single chat's worth of chunks.
//!
//! Writes that would not change a row are skipped, so re-running `index`
//! over an unchanged export leaves the database byte-for-byte identical.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use chat_recall_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use chat_recall_core::models::{
    Chunk, ChunkRecord, ChunkStatus, CorpusStats, DateRange, Identity, Message, MessageKey,
};
use chat_recall_core::store::{sort_hits, Store, UpsertSummary, VectorHit, VectorIndex};

const WATERMARK_KEY: &str = "watermark";

/// Ids bound per `IN (...)` query, well under SQLite's variable limit.
const ID_BATCH: usize = 500;

/// SQLite implementation of [`Store`] and [`VectorIndex`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn count(&self, sql: &str) -> Result<i64> {
        Ok(sqlx::query_scalar(sql).fetch_one(&self.pool).await?)
    }

    async fn count_status(&self, status: ChunkStatus) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE status = ?")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?,
        )
    }
}

fn ts_to_datetime(ts: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0).with_context(|| format!("timestamp out of range: {}", ts))
}

/// `[from, to)` as timestamps, open ends widened to the full range.
fn range_bounds(range: Option<DateRange>) -> (i64, i64) {
    let from = range.and_then(|r| r.from).map_or(i64::MIN, |t| t.timestamp());
    let to = range.and_then(|r| r.to).map_or(i64::MAX, |t| t.timestamp());
    (from, to)
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    Ok(Message {
        id: row.get("id"),
        sender_identity: row.get("sender_identity"),
        sender_name: row.get("sender_name"),
        timestamp: ts_to_datetime(row.get("ts"))?,
        raw_text: row.get("raw_text"),
        reply_to_id: row.get("reply_to_id"),
        forwarded_from: row.get("forwarded_from"),
    })
}

const CHUNK_COLUMNS: &str = "chunk_id, fingerprint, message_ids, text, start_ts, end_ts, \
     primary_sender, forwarded, status, last_error, \
     (SELECT group_concat(identity_id, char(31)) FROM chunk_senders s \
      WHERE s.chunk_id = chunks.chunk_id) AS senders";

fn chunk_from_row(row: &SqliteRow) -> Result<ChunkRecord> {
    let ids_json: String = row.get("message_ids");
    let message_ids: Vec<i64> =
        serde_json::from_str(&ids_json).context("corrupt chunks.message_ids")?;
    let status_str: String = row.get("status");
    let status = ChunkStatus::parse(&status_str)
        .with_context(|| format!("unknown chunk status '{}'", status_str))?;
    let senders_joined: Option<String> = row.get("senders");
    let mut senders: Vec<String> = senders_joined
        .map(|s| s.split('\u{1f}').map(str::to_string).collect())
        .unwrap_or_default();
    senders.sort();
    senders.dedup();

    Ok(ChunkRecord {
        chunk: Chunk {
            chunk_id: row.get("chunk_id"),
            message_ids,
            normalized_text: row.get("text"),
            start_time: ts_to_datetime(row.get("start_ts"))?,
            end_time: ts_to_datetime(row.get("end_ts"))?,
            primary_sender: row.get("primary_sender"),
            senders,
            forwarded: row.get::<i64, _>("forwarded") != 0,
            content_fingerprint: row.get("fingerprint"),
        },
        status,
        last_error: row.get("last_error"),
    })
}

fn chunks_from_rows(rows: &[SqliteRow]) -> Result<Vec<ChunkRecord>> {
    rows.iter().map(chunk_from_row).collect()
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_messages(&self, messages: &[Message]) -> Result<UpsertSummary> {
        let mut summary = UpsertSummary::default();
        let mut tx = self.pool.begin().await?;

        for msg in messages {
            let existing = sqlx::query("SELECT * FROM messages WHERE id = ?")
                .bind(msg.id)
                .fetch_optional(&mut *tx)
                .await?;

            let changed_key = match existing {
                Some(row) => {
                    let old = message_from_row(&row)?;
                    if &old == msg {
                        summary.unchanged += 1;
                        continue;
                    }
                    summary.updated += 1;
                    old.key().min(msg.key())
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

            sqlx::query(
                r#"
                INSERT INTO messages (id, sender_identity, sender_name, ts, raw_text,
                                      reply_to_id, forwarded_from)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    sender_identity = excluded.sender_identity,
                    sender_name = excluded.sender_name,
                    ts = excluded.ts,
                    raw_text = excluded.raw_text,
                    reply_to_id = excluded.reply_to_id,
                    forwarded_from = excluded.forwarded_from
                "#,
            )
            .bind(msg.id)
            .bind(&msg.sender_identity)
            .bind(&msg.sender_name)
            .bind(msg.timestamp.timestamp())
            .bind(&msg.raw_text)
            .bind(msg.reply_to_id)
            .bind(&msg.forwarded_from)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(summary)
    }

    async fn get_message(&self, id: i64) -> Result<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn messages_from(&self, from: Option<MessageKey>) -> Result<Vec<Message>> {
        let (ts, id) = from.map_or((i64::MIN, i64::MIN), |k| (k.timestamp, k.id));
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE (ts, id) >= (?, ?) ORDER BY ts ASC, id ASC",
        )
        .bind(ts)
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn messages_around(
        &self,
        id: i64,
        before: usize,
        after: usize,
    ) -> Result<Vec<Message>> {
        let Some(center) = self.get_message(id).await? else {
            return Ok(Vec::new());
        };
        let key = center.key();

        let earlier = sqlx::query(
            "SELECT * FROM messages WHERE (ts, id) < (?, ?) ORDER BY ts DESC, id DESC LIMIT ?",
        )
        .bind(key.timestamp)
        .bind(key.id)
        .bind(before as i64)
        .fetch_all(&self.pool)
        .await?;
        let later = sqlx::query(
            "SELECT * FROM messages WHERE (ts, id) > (?, ?) ORDER BY ts ASC, id ASC LIMIT ?",
        )
        .bind(key.timestamp)
        .bind(key.id)
        .bind(after as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(earlier.len() + later.len() + 1);
        for row in earlier.iter().rev() {
            out.push(message_from_row(row)?);
        }
        out.push(center);
        for row in &later {
            out.push(message_from_row(row)?);
        }
        Ok(out)
    }

    async fn last_message_key(&self) -> Result<Option<MessageKey>> {
        let row = sqlx::query("SELECT ts, id FROM messages ORDER BY ts DESC, id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| MessageKey {
            timestamp: r.get("ts"),
            id: r.get("id"),
        }))
    }

    async fn message_counts(&self, range: Option<DateRange>) -> Result<Vec<(String, u64)>> {
        let (from, to) = range_bounds(range);
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT sender_identity, COUNT(*) FROM messages \
             WHERE ts >= ? AND ts < ? GROUP BY sender_identity",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(sender, n)| (sender, n.max(0) as u64))
            .collect())
    }

    async fn message_texts(
        &self,
        identity: Option<&str>,
        range: Option<DateRange>,
    ) -> Result<Vec<(String, String)>> {
        let (from, to) = range_bounds(range);
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT sender_identity, raw_text FROM messages \
             WHERE ts >= ? AND ts < ? AND (? IS NULL OR sender_identity = ?) \
             ORDER BY ts, id",
        )
        .bind(from)
        .bind(to)
        .bind(identity)
        .bind(identity)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn put_chunk(
        &self,
        chunk: &Chunk,
        status: ChunkStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let start = chunk.start_key();
        let end = chunk.end_key();
        let message_ids = serde_json::to_string(&chunk.message_ids)?;
        let now = Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO chunks (chunk_id, fingerprint, message_ids, text, start_ts, start_id,
                                end_ts, end_id, primary_sender, forwarded, status, last_error,
                                updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                status = excluded.status,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            WHERE chunks.status IS NOT excluded.status
               OR chunks.last_error IS NOT excluded.last_error
            "#,
        )
        .bind(&chunk.chunk_id)
        .bind(&chunk.content_fingerprint)
        .bind(&message_ids)
        .bind(&chunk.normalized_text)
        .bind(start.timestamp)
        .bind(start.id)
        .bind(end.timestamp)
        .bind(end.id)
        .bind(&chunk.primary_sender)
        .bind(chunk.forwarded as i64)
        .bind(status.as_str())
        .bind(error)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for sender in &chunk.senders {
            sqlx::query(
                "INSERT OR IGNORE INTO chunk_senders (chunk_id, identity_id) VALUES (?, ?)",
            )
            .bind(&chunk.chunk_id)
            .bind(sender)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn set_chunk_status(
        &self,
        chunk_id: &str,
        status: ChunkStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE chunks SET status = ?, last_error = ?, updated_at = ?
            WHERE chunk_id = ? AND (status IS NOT ? OR last_error IS NOT ?)
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now().timestamp())
        .bind(chunk_id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn chunk_by_fingerprint(&self, fingerprint: &str) -> Result<Option<ChunkRecord>> {
        let sql = format!("SELECT {} FROM chunks WHERE fingerprint = ?", CHUNK_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(chunk_from_row).transpose()
    }

    async fn get_chunks(&self, chunk_ids: &[String]) -> Result<Vec<ChunkRecord>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut records = Vec::with_capacity(chunk_ids.len());
        for batch in chunk_ids.chunks(ID_BATCH) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!(
                "SELECT {} FROM chunks WHERE chunk_id IN ({})",
                CHUNK_COLUMNS, placeholders
            );
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id);
            }
            let rows = query.fetch_all(&self.pool).await?;
            records.extend(chunks_from_rows(&rows)?);
        }
        let position: HashMap<&str, usize> = chunk_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        records.sort_by_key(|r| position.get(r.chunk.chunk_id.as_str()).copied());
        Ok(records)
    }

    async fn chunks_with_status(&self, status: ChunkStatus) -> Result<Vec<ChunkRecord>> {
        let sql = format!(
            "SELECT {} FROM chunks WHERE status = ? ORDER BY start_ts, start_id, chunk_id",
            CHUNK_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        chunks_from_rows(&rows)
    }

    async fn chunks_from(&self, start: Option<MessageKey>) -> Result<Vec<ChunkRecord>> {
        let (ts, id) = start.map_or((i64::MIN, i64::MIN), |k| (k.timestamp, k.id));
        let sql = format!(
            "SELECT {} FROM chunks WHERE (start_ts, start_id) >= (?, ?) \
             ORDER BY start_ts, start_id, chunk_id",
            CHUNK_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(ts)
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        chunks_from_rows(&rows)
    }

    async fn chunk_at_or_before(&self, key: MessageKey) -> Result<Option<ChunkRecord>> {
        let sql = format!(
            "SELECT {} FROM chunks WHERE (start_ts, start_id) <= (?, ?) \
             ORDER BY start_ts DESC, start_id DESC, chunk_id DESC LIMIT 1",
            CHUNK_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(key.timestamp)
            .bind(key.id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(chunk_from_row).transpose()
    }

    async fn chunk_ids_for_sender(&self, identity: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT c.chunk_id FROM chunks c
            JOIN chunk_senders s ON s.chunk_id = c.chunk_id
            WHERE s.identity_id = ? AND c.status = 'committed'
            ORDER BY c.chunk_id
            "#,
        )
        .bind(identity)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("chunk_id")).collect())
    }

    async fn delete_chunk(&self, chunk_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for sql in [
            "DELETE FROM chunk_vectors WHERE chunk_id = ?",
            "DELETE FROM chunk_senders WHERE chunk_id = ?",
            "DELETE FROM chunks WHERE chunk_id = ?",
        ] {
            sqlx::query(sql).bind(chunk_id).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn clear_chunks(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for sql in [
            "DELETE FROM chunk_vectors",
            "DELETE FROM chunk_senders",
            "DELETE FROM chunks",
        ] {
            sqlx::query(sql).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn watermark(&self) -> Result<Option<MessageKey>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM index_state WHERE key = ?")
                .bind(WATERMARK_KEY)
                .fetch_optional(&self.pool)
                .await?;
        value
            .map(|v| serde_json::from_str(&v).context("corrupt watermark"))
            .transpose()
    }

    async fn set_watermark(&self, key: Option<MessageKey>) -> Result<()> {
        match key {
            Some(key) => {
                let value = serde_json::to_string(&key)?;
                sqlx::query(
                    r#"
                    INSERT INTO index_state (key, value) VALUES (?, ?)
                    ON CONFLICT(key) DO UPDATE SET value = excluded.value
                    WHERE index_state.value IS NOT excluded.value
                    "#,
                )
                .bind(WATERMARK_KEY)
                .bind(value)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM index_state WHERE key = ?")
                    .bind(WATERMARK_KEY)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn load_identities(&self) -> Result<Vec<Identity>> {
        let rows = sqlx::query(
            "SELECT identity_id, display_name, active FROM identities ORDER BY identity_id",
        )
        .fetch_all(&self.pool)
        .await?;
        let alias_rows = sqlx::query("SELECT nickname, identity_id FROM aliases")
            .fetch_all(&self.pool)
            .await?;

        let mut identities: Vec<Identity> = rows
            .iter()
            .map(|r| Identity {
                identity_id: r.get("identity_id"),
                display_name: r.get("display_name"),
                nicknames: Default::default(),
                active: r.get::<i64, _>("active") != 0,
            })
            .collect();
        for row in &alias_rows {
            let owner: String = row.get("identity_id");
            if let Some(identity) = identities.iter_mut().find(|i| i.identity_id == owner) {
                identity.nicknames.insert(row.get("nickname"));
            }
        }
        Ok(identities)
    }

    async fn save_identity(&self, identity: &Identity) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO identities (identity_id, display_name, active) VALUES (?, ?, ?)
            ON CONFLICT(identity_id) DO UPDATE SET
                display_name = excluded.display_name,
                active = excluded.active
            WHERE identities.display_name IS NOT excluded.display_name
               OR identities.active IS NOT excluded.active
            "#,
        )
        .bind(&identity.identity_id)
        .bind(&identity.display_name)
        .bind(identity.active as i64)
        .execute(&mut *tx)
        .await?;

        let stored: Vec<String> =
            sqlx::query_scalar("SELECT nickname FROM aliases WHERE identity_id = ?")
                .bind(&identity.identity_id)
                .fetch_all(&mut *tx)
                .await?;
        for nick in stored.iter().filter(|n| !identity.nicknames.contains(*n)) {
            sqlx::query("DELETE FROM aliases WHERE nickname = ?")
                .bind(nick)
                .execute(&mut *tx)
                .await?;
        }
        for nick in identity.nicknames.iter().filter(|n| !stored.contains(n)) {
            sqlx::query(
                r#"
                INSERT INTO aliases (nickname, identity_id) VALUES (?, ?)
                ON CONFLICT(nickname) DO UPDATE SET identity_id = excluded.identity_id
                "#,
            )
            .bind(nick)
            .bind(&identity.identity_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn stats(&self) -> Result<CorpusStats> {
        let range: (Option<i64>, Option<i64>) =
            sqlx::query_as("SELECT MIN(ts), MAX(ts) FROM messages")
                .fetch_one(&self.pool)
                .await?;

        Ok(CorpusStats {
            messages: self.count("SELECT COUNT(*) FROM messages").await?,
            identities: self.count("SELECT COUNT(*) FROM identities").await?,
            aliases: self.count("SELECT COUNT(*) FROM aliases").await?,
            chunks_committed: self.count_status(ChunkStatus::Committed).await?,
            chunks_pending: self.count_status(ChunkStatus::Pending).await?,
            chunks_writing: self.count_status(ChunkStatus::Writing).await?,
            vectors: self.count("SELECT COUNT(*) FROM chunk_vectors").await?,
            first_message_at: range.0.map(ts_to_datetime).transpose()?,
            last_message_at: range.1.map(ts_to_datetime).transpose()?,
            watermark: self.watermark().await?,
        })
    }
}

#[async_trait]
impl VectorIndex for SqliteStore {
    async fn upsert(&self, chunk_id: &str, vector: &[f32]) -> Result<()> {
        let blob = vec_to_blob(vector);
        sqlx::query(
            r#"
            INSERT INTO chunk_vectors (chunk_id, dims, embedding) VALUES (?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                dims = excluded.dims,
                embedding = excluded.embedding
            WHERE chunk_vectors.embedding IS NOT excluded.embedding
            "#,
        )
        .bind(chunk_id)
        .bind(vector.len() as i64)
        .bind(&blob)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        allow: Option<&HashSet<String>>,
    ) -> Result<Vec<VectorHit>> {
        let rows = sqlx::query("SELECT chunk_id, embedding FROM chunk_vectors")
            .fetch_all(&self.pool)
            .await?;

        let mut hits: Vec<VectorHit> = rows
            .iter()
            .filter_map(|row| {
                let chunk_id: String = row.get("chunk_id");
                if allow.is_some_and(|a| !a.contains(&chunk_id)) {
                    return None;
                }
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(vector, &blob_to_vec(&blob));
                Some(VectorHit {
                    chunk_id,
                    similarity,
                })
            })
            .collect();

        sort_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete(&self, chunk_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
            .bind(chunk_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ids(&self) -> Result<Vec<String>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT chunk_id FROM chunk_vectors ORDER BY chunk_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use chat_recall_core::chunk::{chunk_messages, ChunkPolicy};
    use chrono::TimeZone;
    use tempfile::TempDir;

    async fn open() -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("recall.sqlite"))
            .await
            .unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        (tmp, SqliteStore::new(pool))
    }

    fn msg(id: i64, sender: &str, secs: i64, text: &str) -> Message {
        Message {
            id,
            sender_identity: sender.into(),
            sender_name: sender.to_uppercase(),
            timestamp: Utc.timestamp_opt(1_600_000_000 + secs, 0).unwrap(),
            raw_text: text.into(),
            reply_to_id: None,
            forwarded_from: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_messages_counts_changes() {
        let (_tmp, store) = open().await;
        let batch = vec![msg(1, "a", 0, "hello"), msg(2, "b", 10, "world")];
        let first = store.upsert_messages(&batch).await.unwrap();
        assert_eq!(first.inserted, 2);

        let again = store.upsert_messages(&batch).await.unwrap();
        assert_eq!(again.unchanged, 2);
        assert_eq!(again.earliest_changed, None);

        let edited = store
            .upsert_messages(&[msg(2, "b", 10, "world!")])
            .await
            .unwrap();
        assert_eq!(edited.updated, 1);
        assert_eq!(edited.earliest_changed.map(|k| k.id), Some(2));
        assert_eq!(
            store.get_message(2).await.unwrap().unwrap().raw_text,
            "world!"
        );
    }

    #[tokio::test]
    async fn test_chunk_roundtrip_and_sender_filter() {
        let (_tmp, store) = open().await;
        let messages = vec![
            msg(1, "alice", 0, "crypto is great"),
            msg(2, "bob", 10_000, "weather today"),
        ];
        store.upsert_messages(&messages).await.unwrap();
        let chunks = chunk_messages(&messages, &ChunkPolicy::default());
        for c in &chunks {
            store.put_chunk(c, ChunkStatus::Pending, Some("timeout")).await.unwrap();
        }
        assert!(store.chunk_ids_for_sender("alice").await.unwrap().is_empty());

        store
            .set_chunk_status(&chunks[0].chunk_id, ChunkStatus::Committed, None)
            .await
            .unwrap();
        assert_eq!(
            store.chunk_ids_for_sender("alice").await.unwrap(),
            vec![chunks[0].chunk_id.clone()]
        );

        let record = store
            .chunk_by_fingerprint(&chunks[0].content_fingerprint)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.chunk, chunks[0]);
        assert_eq!(record.status, ChunkStatus::Committed);

        let pending = store.chunks_with_status(ChunkStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("timeout"));

        let before = store
            .chunk_at_or_before(messages[1].key())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before.chunk.chunk_id, chunks[1].chunk_id);
    }

    #[tokio::test]
    async fn test_vector_query_and_delete() {
        let (_tmp, store) = open().await;
        let messages = vec![msg(1, "alice", 0, "crypto")];
        store.upsert_messages(&messages).await.unwrap();
        let chunk = &chunk_messages(&messages, &ChunkPolicy::default())[0];
        store.put_chunk(chunk, ChunkStatus::Committed, None).await.unwrap();
        store.upsert(&chunk.chunk_id, &[1.0, 0.0]).await.unwrap();
        store.upsert("ghost", &[0.0, 1.0]).await.unwrap();

        let hits = store.query(&[1.0, 0.0], 10, None).await.unwrap();
        assert_eq!(hits[0].chunk_id, chunk.chunk_id);
        assert_eq!(hits.len(), 2);

        store.delete("ghost").await.unwrap();
        assert_eq!(store.ids().await.unwrap(), vec![chunk.chunk_id.clone()]);
    }

    #[tokio::test]
    async fn test_identities_and_watermark_persist() {
        let (_tmp, store) = open().await;
        let mut alice = Identity::new("user1", "Alice");
        alice.nicknames.insert("гусь".into());
        store.save_identity(&alice).await.unwrap();

        alice.nicknames.remove("гусь");
        alice.nicknames.insert("goose".into());
        store.save_identity(&alice).await.unwrap();

        let loaded = store.load_identities().await.unwrap();
        assert_eq!(loaded, vec![alice]);

        let key = MessageKey { timestamp: 5, id: 7 };
        store.set_watermark(Some(key)).await.unwrap();
        assert_eq!(store.watermark().await.unwrap(), Some(key));
        store.set_watermark(None).await.unwrap();
        assert_eq!(store.watermark().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_message_counts_and_texts_respect_filters() {
        let (_tmp, store) = open().await;
        store
            .upsert_messages(&[
                msg(1, "alice", 0, "crypto"),
                msg(2, "alice", 100, "more crypto"),
                msg(3, "bob", 200, "lunch"),
            ])
            .await
            .unwrap();

        let mut counts = store.message_counts(None).await.unwrap();
        counts.sort();
        assert_eq!(counts, vec![("alice".to_string(), 2), ("bob".to_string(), 1)]);

        let range = DateRange {
            from: Some(Utc.timestamp_opt(1_600_000_050, 0).unwrap()),
            to: None,
        };
        let mut late = store.message_counts(Some(range)).await.unwrap();
        late.sort();
        assert_eq!(late, vec![("alice".to_string(), 1), ("bob".to_string(), 1)]);

        let texts = store.message_texts(Some("alice"), None).await.unwrap();
        assert_eq!(
            texts,
            vec![
                ("alice".to_string(), "crypto".to_string()),
                ("alice".to_string(), "more crypto".to_string()),
            ]
        );
        assert_eq!(store.message_texts(None, Some(range)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_messages_around_in_key_order() {
        let (_tmp, store) = open().await;
        let msgs: Vec<Message> = (1..=9).map(|i| msg(i, "a", i * 60, "x")).collect();
        store.upsert_messages(&msgs).await.unwrap();
        let ids: Vec<i64> = store
            .messages_around(5, 3, 3)
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![2, 3, 4, 5, 6, 7, 8]);
    }
}
