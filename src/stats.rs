//! Corpus statistics for `recall stats`.
//!
//! Message, identity, and alias counts, chunk counts by status, vector
//! coverage, the indexing watermark, and the corpus date range.

use anyhow::Result;
use chat_recall_core::models::CorpusStats;
use chat_recall_core::store::Store;

use crate::config::Config;
use crate::progress::format_number;
use crate::sqlite_store::SqliteStore;
use crate::{db, migrate};

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;
    let store = SqliteStore::new(pool.clone());
    let stats = store.stats().await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    print!("{}", render_stats(&stats, &config.db.path.display().to_string(), db_size));

    pool.close().await;
    Ok(())
}

pub fn render_stats(stats: &CorpusStats, db_path: &str, db_size: u64) -> String {
    let total_chunks = stats.chunks_committed + stats.chunks_pending + stats.chunks_writing;
    let mut out = String::new();
    out.push_str("chat-recall stats\n");
    out.push_str("=================\n\n");
    out.push_str(&format!("  Database:    {}\n", db_path));
    out.push_str(&format!("  Size:        {}\n\n", format_bytes(db_size)));
    out.push_str(&format!("  Messages:    {}\n", format_number(stats.messages as u64)));
    out.push_str(&format!("  Identities:  {}\n", stats.identities));
    out.push_str(&format!("  Aliases:     {}\n", stats.aliases));
    out.push_str(&format!(
        "  Chunks:      {} (committed {}, pending {}, writing {})\n",
        format_number(total_chunks as u64),
        stats.chunks_committed,
        stats.chunks_pending,
        stats.chunks_writing
    ));
    out.push_str(&format!(
        "  Embedded:    {} / {} ({}%)\n",
        stats.vectors,
        total_chunks,
        if total_chunks > 0 {
            (stats.vectors * 100) / total_chunks
        } else {
            0
        }
    ));
    match (stats.first_message_at, stats.last_message_at) {
        (Some(first), Some(last)) => out.push_str(&format!(
            "  Range:       {} .. {}\n",
            first.format("%Y-%m-%d"),
            last.format("%Y-%m-%d")
        )),
        _ => out.push_str("  Range:       (empty)\n"),
    }
    match stats.watermark {
        Some(wm) => out.push_str(&format!(
            "  Watermark:   message {} ({})\n",
            wm.id,
            format_ts_relative(wm.timestamp)
        )),
        None => out.push_str("  Watermark:   never indexed\n"),
    }
    out.push('\n');
    out
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Unix timestamp as "3 days ago", falling back to a date for old values.
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_recall_core::models::MessageKey;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_render_stats_lines() {
        let stats = CorpusStats {
            messages: 1200,
            identities: 3,
            aliases: 2,
            chunks_committed: 8,
            chunks_pending: 2,
            chunks_writing: 0,
            vectors: 8,
            first_message_at: None,
            last_message_at: None,
            watermark: Some(MessageKey {
                timestamp: 1_600_000_000,
                id: 42,
            }),
        };
        let out = render_stats(&stats, "db.sqlite", 100);
        assert!(out.contains("Messages:    1,200"));
        assert!(out.contains("committed 8, pending 2, writing 0"));
        assert!(out.contains("Embedded:    8 / 10 (80%)"));
        assert!(out.contains("Watermark:   message 42"));
        assert!(out.contains("Range:       (empty)"));
    }
}
