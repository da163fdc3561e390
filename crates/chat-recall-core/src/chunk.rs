//! Message chunker and text normalizer.
//!
//! Groups consecutive messages into [`Chunk`]s, the unit of embedding and
//! retrieval.
//!
//! # Algorithm
//!
//! 1. Normalize each message's text (see [`normalize_text`]); messages that
//!    normalize to nothing are dropped.
//! 2. Walk messages in `(timestamp, id)` order, accumulating a run while
//!    the sender is unchanged, the forwarded flag is unchanged, the gap to
//!    the previous message is at most `max_gap_secs`, and the joined text
//!    stays within `max_chars`.
//! 3. When any condition breaks, flush the run as one chunk. Splits always
//!    fall on a message boundary.
//! 4. A single message longer than `max_chars` becomes several chunks,
//!    hard-split at the nearest newline or space boundary.
//!
//! Chunking is deterministic: the same messages and policy always produce
//! the same boundaries and fingerprints.
//!
//! # Example
//!
//! ```rust
//! use chat_recall_core::chunk::normalize_text;
//!
//! assert_eq!(normalize_text("  **Hello**   world \n\n\n  again "), "Hello world\nagain");
//! ```

use sha2::{Digest, Sha256};

use crate::models::{Chunk, Message};

/// Chunking policy. Part of every fingerprint indirectly: changing it
/// changes boundaries, which changes fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    /// Max seconds between consecutive messages of one run.
    pub max_gap_secs: i64,
    /// Max characters of normalized text per chunk.
    pub max_chars: usize,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            max_gap_secs: 300,
            max_chars: 2000,
        }
    }
}

/// Normalize raw message text for indexing and quoting.
///
/// Strips lightweight markup (`**`, `__`, `~~`, backticks), removes
/// zero-width and control characters, collapses runs of spaces, trims each
/// line and drops blank lines. Casing is preserved.
pub fn normalize_text(raw: &str) -> String {
    let mut cleaned = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}' => {}
            '`' => {}
            '*' | '_' | '~' if chars.peek() == Some(&c) => {
                chars.next();
            }
            '\r' => {}
            '\n' | '\t' => cleaned.push(c),
            c if c.is_control() => {}
            c => cleaned.push(c),
        }
    }

    cleaned
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Lowercased alphanumeric word tokens (apostrophes kept inside words).
pub fn word_tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\'' || c == '’'))
        .map(|w| w.trim_matches(|c| c == '\'' || c == '’'))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Compute the content fingerprint of a chunk.
///
/// SHA-256 over the normalized text, a NUL separator, and the member ids
/// joined by commas. `part` distinguishes the pieces of a hard-split
/// message.
pub fn fingerprint(normalized_text: &str, message_ids: &[i64], part: Option<usize>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_text.as_bytes());
    hasher.update([0u8]);
    let ids = message_ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",");
    hasher.update(ids.as_bytes());
    if let Some(part) = part {
        hasher.update(format!("#{}", part).as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

struct Run<'a> {
    members: Vec<(&'a Message, String)>,
    text_len: usize,
}

impl<'a> Run<'a> {
    fn new() -> Self {
        Self {
            members: Vec::new(),
            text_len: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn accepts(&self, msg: &Message, text: &str, policy: &ChunkPolicy) -> bool {
        let Some((last, _)) = self.members.last() else {
            return true;
        };
        let gap = msg.timestamp.timestamp() - last.timestamp.timestamp();
        last.sender_identity == msg.sender_identity
            && last.is_forwarded() == msg.is_forwarded()
            && gap <= policy.max_gap_secs
            && self.text_len + 1 + text.chars().count() <= policy.max_chars
    }

    fn push(&mut self, msg: &'a Message, text: String) {
        if !self.members.is_empty() {
            self.text_len += 1;
        }
        self.text_len += text.chars().count();
        self.members.push((msg, text));
    }

    fn flush(&mut self, out: &mut Vec<Chunk>) {
        if self.members.is_empty() {
            return;
        }
        let members = std::mem::take(&mut self.members);
        self.text_len = 0;
        let text = members
            .iter()
            .map(|(_, t)| t.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let msgs: Vec<&Message> = members.iter().map(|(m, _)| *m).collect();
        out.push(make_chunk(&msgs, text, None));
    }
}

/// Group messages into chunks under `policy`.
///
/// Input order does not matter; messages are processed in `(timestamp, id)`
/// order.
pub fn chunk_messages(messages: &[Message], policy: &ChunkPolicy) -> Vec<Chunk> {
    let mut ordered: Vec<&Message> = messages.iter().collect();
    ordered.sort_by_key(|m| m.key());

    let mut chunks = Vec::new();
    let mut run = Run::new();

    for msg in ordered {
        let text = normalize_text(&msg.raw_text);
        if text.is_empty() {
            continue;
        }

        if text.chars().count() > policy.max_chars {
            run.flush(&mut chunks);
            for (part, piece) in hard_split(&text, policy.max_chars).into_iter().enumerate() {
                chunks.push(make_chunk(&[msg], piece, Some(part)));
            }
            continue;
        }

        if !run.is_empty() && !run.accepts(msg, &text, policy) {
            run.flush(&mut chunks);
        }
        run.push(msg, text);
    }
    run.flush(&mut chunks);

    chunks
}

/// Split an oversized text at newline/space boundaries into pieces of at
/// most `max_chars` characters.
fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        let limit = byte_offset_of_char(remaining, max_chars.max(1));
        let split_at = if limit < remaining.len() {
            remaining[..limit]
                .rfind('\n')
                .or_else(|| remaining[..limit].rfind(' '))
                .map(|pos| pos + 1)
                .unwrap_or(limit)
        } else {
            limit
        };
        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
        remaining = &remaining[split_at..];
    }
    pieces
}

/// Byte offset of the `n`-th character (or the string length).
fn byte_offset_of_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

fn make_chunk(members: &[&Message], text: String, part: Option<usize>) -> Chunk {
    let message_ids: Vec<i64> = members.iter().map(|m| m.id).collect();
    let content_fingerprint = fingerprint(&text, &message_ids, part);
    let mut senders: Vec<String> = members.iter().map(|m| m.sender_identity.clone()).collect();
    senders.sort();
    senders.dedup();

    // Callers never pass an empty member list.
    let first = members[0];
    let last = members[members.len() - 1];

    Chunk {
        chunk_id: content_fingerprint[..16].to_string(),
        message_ids,
        normalized_text: text,
        start_time: first.timestamp,
        end_time: last.timestamp,
        primary_sender: first.sender_identity.clone(),
        senders,
        forwarded: first.is_forwarded(),
        content_fingerprint,
    }
}
