//! Core data models shared by the indexing pipeline and the query path.
//!
//! - [`Message`]: one immutable chat message from the export.
//! - [`Chunk`]: the unit of embedding and retrieval, derived from one or
//!   more consecutive messages.
//! - [`Identity`]: a canonical person addressable by nicknames.
//! - [`DateRange`] / [`SearchFilters`]: structured constraints applied
//!   on top of vector similarity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Total order over messages: `(timestamp, id)`.
///
/// Also used as the persisted indexing watermark and as the restart
/// boundary for incremental re-chunking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    /// Unix timestamp (seconds).
    pub timestamp: i64,
    /// Source-assigned message id.
    pub id: i64,
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.timestamp)
    }
}

/// A single chat message as parsed from the export.
///
/// Created once during parsing and never mutated afterwards. Re-importing
/// an export may replace the stored text of a message with the same id
/// (edited messages); that is modelled as a new value, not a mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    /// Canonical identity id of the sender (e.g. `"user123"`).
    pub sender_identity: String,
    /// Display name the export carried for this message.
    pub sender_name: String,
    pub timestamp: DateTime<Utc>,
    pub raw_text: String,
    /// Back-reference to the message this one replies to.
    pub reply_to_id: Option<i64>,
    /// Original author when the message was forwarded from elsewhere.
    pub forwarded_from: Option<String>,
}

impl Message {
    pub fn key(&self) -> MessageKey {
        MessageKey {
            timestamp: self.timestamp.timestamp(),
            id: self.id,
        }
    }

    pub fn is_forwarded(&self) -> bool {
        self.forwarded_from.is_some()
    }
}

/// A normalized, bounded run of consecutive messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Short stable id derived from the fingerprint.
    pub chunk_id: String,
    /// Contributing message ids in `(timestamp, id)` order.
    pub message_ids: Vec<i64>,
    pub normalized_text: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub primary_sender: String,
    /// Every sender that contributed text, sorted and deduplicated.
    pub senders: Vec<String>,
    /// True when the chunk is made of forwarded messages.
    pub forwarded: bool,
    /// SHA-256 of normalized text and member ids.
    pub content_fingerprint: String,
}

impl Chunk {
    /// Key of the first contributing message.
    pub fn start_key(&self) -> MessageKey {
        MessageKey {
            timestamp: self.start_time.timestamp(),
            id: self.message_ids.first().copied().unwrap_or_default(),
        }
    }

    /// Key of the last contributing message.
    pub fn end_key(&self) -> MessageKey {
        MessageKey {
            timestamp: self.end_time.timestamp(),
            id: self.message_ids.last().copied().unwrap_or_default(),
        }
    }

    pub fn has_sender(&self, identity: &str) -> bool {
        self.senders.iter().any(|s| s == identity)
    }
}

/// Lifecycle of a chunk's embedding.
///
/// `Writing` is the write-ahead marker: the metadata row exists and a
/// vector upsert may or may not have happened. Only `Committed` chunks are
/// visible to search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Writing,
    Committed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Writing => "writing",
            ChunkStatus::Committed => "committed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ChunkStatus::Pending),
            "writing" => Some(ChunkStatus::Writing),
            "committed" => Some(ChunkStatus::Committed),
            _ => None,
        }
    }
}

/// A chunk together with its stored status.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub chunk: Chunk,
    pub status: ChunkStatus,
    /// Last provider error for pending chunks.
    pub last_error: Option<String>,
}

/// A canonical person.
///
/// Nicknames are stored lowercased. Identities are never deleted, only
/// deactivated, so historical quotes keep their attribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub identity_id: String,
    pub display_name: String,
    pub nicknames: BTreeSet<String>,
    pub active: bool,
}

impl Identity {
    pub fn new(identity_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            identity_id: identity_id.into(),
            display_name: display_name.into(),
            nicknames: BTreeSet::new(),
            active: true,
        }
    }
}

/// Half-open UTC interval `[from, to)`. Either side may be open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DateRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        if let Some(from) = self.from {
            if ts < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if ts >= to {
                return false;
            }
        }
        true
    }

    pub fn is_open(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }
}

/// How a ranked list is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Relevance,
    Oldest,
    Newest,
}

/// Structured constraints applied on top of vector similarity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Only chunks this identity contributed to.
    pub identity: Option<String>,
    pub date_range: Option<DateRange>,
    #[serde(default)]
    pub sort: SortOrder,
}

/// Stance of a speaker towards a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stance {
    Positive,
    Negative,
    Neutral,
    Unknown,
}

impl Stance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stance::Positive => "positive",
            Stance::Negative => "negative",
            Stance::Neutral => "neutral",
            Stance::Unknown => "unknown",
        }
    }

    /// Lenient parse used for provider output ("Positive.", " negative").
    pub fn parse_loose(s: &str) -> Stance {
        let word = s
            .trim()
            .trim_matches(|c: char| !c.is_alphabetic())
            .to_lowercase();
        match word.as_str() {
            "positive" => Stance::Positive,
            "negative" => Stance::Negative,
            "neutral" => Stance::Neutral,
            _ => Stance::Unknown,
        }
    }
}

impl fmt::Display for Stance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Corpus counters reported by `stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CorpusStats {
    pub messages: i64,
    pub identities: i64,
    pub aliases: i64,
    pub chunks_committed: i64,
    pub chunks_pending: i64,
    pub chunks_writing: i64,
    pub vectors: i64,
    pub first_message_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub watermark: Option<MessageKey>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_message_key_orders_by_time_then_id() {
        let a = MessageKey { timestamp: 10, id: 5 };
        let b = MessageKey { timestamp: 10, id: 6 };
        let c = MessageKey { timestamp: 11, id: 1 };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_date_range_half_open() {
        let from = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
        let range = DateRange {
            from: Some(from),
            to: Some(to),
        };
        assert!(range.contains(from));
        assert!(!range.contains(to));
        assert!(DateRange::default().contains(to));
    }

    #[test]
    fn test_stance_parse_loose() {
        assert_eq!(Stance::parse_loose(" Positive."), Stance::Positive);
        assert_eq!(Stance::parse_loose("NEGATIVE"), Stance::Negative);
        assert_eq!(Stance::parse_loose("maybe"), Stance::Unknown);
    }
}
