//! Schema creation. Every statement is idempotent, so `init` and every
//! command that opens the database can run it.
//!
//! # Tables
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `messages` | Parsed chat messages keyed by export id |
//! | `identities` | Canonical people, one per sender id |
//! | `aliases` | Nickname → identity, globally unique |
//! | `chunks` | Chunk metadata keyed by fingerprint, with commit status |
//! | `chunk_senders` | Chunk ↔ identity membership for filtered search |
//! | `chunk_vectors` | Embedding blobs, one per committed chunk |
//! | `index_state` | Key/value state such as the watermark |

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY,
        sender_identity TEXT NOT NULL,
        sender_name TEXT NOT NULL,
        ts INTEGER NOT NULL,
        raw_text TEXT NOT NULL,
        reply_to_id INTEGER,
        forwarded_from TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_key ON messages(ts, id)",
    r#"
    CREATE TABLE IF NOT EXISTS identities (
        identity_id TEXT PRIMARY KEY,
        display_name TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS aliases (
        nickname TEXT PRIMARY KEY,
        identity_id TEXT NOT NULL,
        FOREIGN KEY (identity_id) REFERENCES identities(identity_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_aliases_identity ON aliases(identity_id)",
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        chunk_id TEXT PRIMARY KEY,
        fingerprint TEXT NOT NULL UNIQUE,
        message_ids TEXT NOT NULL,
        text TEXT NOT NULL,
        start_ts INTEGER NOT NULL,
        start_id INTEGER NOT NULL,
        end_ts INTEGER NOT NULL,
        end_id INTEGER NOT NULL,
        primary_sender TEXT NOT NULL,
        forwarded INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        last_error TEXT,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_chunks_start ON chunks(start_ts, start_id)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_status ON chunks(status)",
    r#"
    CREATE TABLE IF NOT EXISTS chunk_senders (
        chunk_id TEXT NOT NULL,
        identity_id TEXT NOT NULL,
        PRIMARY KEY (chunk_id, identity_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_chunk_senders_identity ON chunk_senders(identity_id)",
    r#"
    CREATE TABLE IF NOT EXISTS chunk_vectors (
        chunk_id TEXT PRIMARY KEY,
        dims INTEGER NOT NULL,
        embedding BLOB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS index_state (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
];

/// Open the configured database and create any missing tables.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create any missing tables on an open pool.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    for stmt in SCHEMA {
        sqlx::query(stmt).execute(pool).await?;
    }
    Ok(())
}
