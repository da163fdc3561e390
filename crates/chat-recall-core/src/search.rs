//! Hybrid search: vector similarity + structured filters + recency.
//!
//! The core search algorithm works entirely through the [`Store`] and
//! [`VectorIndex`] traits, with no database or configuration dependencies.
//! The calling application is responsible for embedding the query text and
//! constructing [`SearchParams`].
//!
//! # Ranking Algorithm
//!
//! 1. If an identity filter is set, restrict the vector query to the
//!    committed chunks that identity contributed to.
//! 2. Fetch the top `candidate_k` chunks by cosine similarity.
//! 3. Post-filter: committed status, identity membership, date range,
//!    forwarded-message policy, optional similarity floor.
//! 4. Blend: `score = sim × ((1 − w) + w × 0.5^(age / half_life))`, where
//!    age is measured from the newest message in the store.
//! 5. Sort by score (desc), original similarity rank (asc), start time
//!    (desc), chunk id (asc).
//! 6. Optionally cap results per sender, then apply the requested
//!    chronological sort order.
//! 7. Truncate to `max_results`.
//!
//! The ranked list is a pure function of the store contents and the
//! request, so paginating it with a [`Cursor`] never skips or repeats a
//! result while the corpus is unchanged.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{ChunkStatus, SearchFilters, SortOrder};
use crate::store::{Store, VectorIndex};

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    /// Number of nearest neighbours fetched before filtering.
    pub candidate_k: usize,
    /// Maximum length of the ranked list.
    pub max_results: usize,
    pub recency_half_life_days: f64,
    /// `0.0` ranks by similarity alone.
    pub recency_weight: f64,
    /// `0` means unlimited.
    pub max_per_sender: usize,
    /// Drop forwarded chunks when searching one person's words.
    pub exclude_forwards_for_speaker: bool,
    /// Score multiplier for forwarded chunks in unfiltered searches.
    pub forward_penalty: f64,
    /// Candidates below this similarity are dropped.
    pub min_similarity: Option<f32>,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            candidate_k: 50,
            max_results: 50,
            recency_half_life_days: 365.0,
            recency_weight: 0.2,
            max_per_sender: 0,
            exclude_forwards_for_speaker: true,
            forward_penalty: 0.5,
            min_similarity: None,
        }
    }
}

/// A ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    /// Zero-based position in the ranked list.
    pub rank: usize,
    pub chunk_id: String,
    pub message_ids: Vec<i64>,
    pub text: String,
    pub primary_sender: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub forwarded: bool,
    /// Raw cosine similarity.
    pub similarity: f32,
    /// Blended score used for ordering.
    pub score: f64,
}

/// Pagination cursor: the number of ranked results already returned.
///
/// Encoded as `rank:<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Cursor {
    pub offset: usize,
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rank:{}", self.offset)
    }
}

impl FromStr for Cursor {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.strip_prefix("rank:")
            .and_then(|n| n.parse().ok())
            .map(|offset| Cursor { offset })
            .ok_or_else(|| format!("invalid cursor: '{}' (expected rank:<n>)", s))
    }
}

/// One page of a ranked list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    /// Cursor for the next page, if any results remain.
    pub next_cursor: Option<Cursor>,
    /// Length of the whole ranked list.
    pub total: usize,
    /// One-based page number.
    pub page: usize,
}

impl SearchPage {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

/// Produce the full ranked list for a query vector and filters.
///
/// Returns an empty list, not an error, when nothing survives filtering.
pub async fn rank<S, V>(
    store: &S,
    index: &V,
    query_vec: &[f32],
    filters: &SearchFilters,
    params: &SearchParams,
) -> Result<Vec<SearchHit>>
where
    S: Store + ?Sized,
    V: VectorIndex + ?Sized,
{
    if query_vec.is_empty() || params.candidate_k == 0 {
        return Ok(Vec::new());
    }

    let allow: Option<HashSet<String>> = match &filters.identity {
        Some(identity) => {
            let ids = store.chunk_ids_for_sender(identity).await?;
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            Some(ids.into_iter().collect())
        }
        None => None,
    };

    let vector_hits = index
        .query(query_vec, params.candidate_k, allow.as_ref())
        .await?;
    if vector_hits.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<String> = vector_hits.iter().map(|h| h.chunk_id.clone()).collect();
    let records: HashMap<String, _> = store
        .get_chunks(&ids)
        .await?
        .into_iter()
        .map(|r| (r.chunk.chunk_id.clone(), r))
        .collect();

    let reference = match store.last_message_key().await? {
        Some(key) => DateTime::from_timestamp(key.timestamp, 0),
        None => None,
    };

    struct Scored {
        hit: SearchHit,
        vector_rank: usize,
    }

    let mut scored: Vec<Scored> = Vec::new();
    for (vector_rank, vh) in vector_hits.iter().enumerate() {
        let Some(record) = records.get(&vh.chunk_id) else {
            continue;
        };
        if record.status != ChunkStatus::Committed {
            continue;
        }
        let chunk = &record.chunk;

        if let Some(identity) = &filters.identity {
            if !chunk.has_sender(identity) {
                continue;
            }
            if chunk.forwarded && params.exclude_forwards_for_speaker {
                continue;
            }
        }
        if let Some(range) = &filters.date_range {
            if !range.contains(chunk.start_time) {
                continue;
            }
        }
        if let Some(floor) = params.min_similarity {
            if vh.similarity < floor {
                continue;
            }
        }

        let mut score = blended_score(
            vh.similarity,
            reference.unwrap_or(chunk.end_time),
            chunk.end_time,
            params,
        );
        if chunk.forwarded && filters.identity.is_none() {
            score *= params.forward_penalty;
        }

        scored.push(Scored {
            hit: SearchHit {
                rank: 0,
                chunk_id: chunk.chunk_id.clone(),
                message_ids: chunk.message_ids.clone(),
                text: chunk.normalized_text.clone(),
                primary_sender: chunk.primary_sender.clone(),
                start_time: chunk.start_time,
                end_time: chunk.end_time,
                forwarded: chunk.forwarded,
                similarity: vh.similarity,
                score,
            },
            vector_rank,
        });
    }

    scored.sort_by(|a, b| {
        b.hit
            .score
            .partial_cmp(&a.hit.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.vector_rank.cmp(&b.vector_rank))
            .then(b.hit.start_time.cmp(&a.hit.start_time))
            .then(a.hit.chunk_id.cmp(&b.hit.chunk_id))
    });

    let mut hits: Vec<SearchHit> = scored.into_iter().map(|s| s.hit).collect();

    if params.max_per_sender > 0 {
        hits = cap_per_sender(hits, params.max_per_sender);
    }

    match filters.sort {
        SortOrder::Relevance => {}
        SortOrder::Oldest => hits.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then(a.chunk_id.cmp(&b.chunk_id))
        }),
        SortOrder::Newest => hits.sort_by(|a, b| {
            b.start_time
                .cmp(&a.start_time)
                .then(a.chunk_id.cmp(&b.chunk_id))
        }),
    }

    hits.truncate(params.max_results);
    for (i, hit) in hits.iter_mut().enumerate() {
        hit.rank = i;
    }
    Ok(hits)
}

/// Slice one page out of a ranked list.
pub fn paginate(ranked: &[SearchHit], cursor: Option<Cursor>, page_size: usize) -> SearchPage {
    let page_size = page_size.max(1);
    let offset = cursor.map(|c| c.offset).unwrap_or(0).min(ranked.len());
    let end = (offset + page_size).min(ranked.len());
    SearchPage {
        hits: ranked[offset..end].to_vec(),
        next_cursor: (end < ranked.len()).then_some(Cursor { offset: end }),
        total: ranked.len(),
        page: offset / page_size + 1,
    }
}

/// Rank and return the page starting at `cursor`.
pub async fn search<S, V>(
    store: &S,
    index: &V,
    query_vec: &[f32],
    filters: &SearchFilters,
    params: &SearchParams,
    cursor: Option<Cursor>,
    page_size: usize,
) -> Result<SearchPage>
where
    S: Store + ?Sized,
    V: VectorIndex + ?Sized,
{
    let ranked = rank(store, index, query_vec, filters, params).await?;
    Ok(paginate(&ranked, cursor, page_size))
}

/// Similarity weighted by exponential recency decay.
pub fn blended_score(
    similarity: f32,
    reference: DateTime<Utc>,
    at: DateTime<Utc>,
    params: &SearchParams,
) -> f64 {
    let w = params.recency_weight.clamp(0.0, 1.0);
    if w == 0.0 || params.recency_half_life_days <= 0.0 {
        return similarity as f64;
    }
    let age_days = (reference - at).num_seconds().max(0) as f64 / 86_400.0;
    let decay = 0.5f64.powf(age_days / params.recency_half_life_days);
    similarity as f64 * ((1.0 - w) + w * decay)
}

/// Keep at most `max` hits per primary sender, preserving order.
fn cap_per_sender(hits: Vec<SearchHit>, max: usize) -> Vec<SearchHit> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    hits.into_iter()
        .filter(|h| {
            let n = seen.entry(h.primary_sender.clone()).or_insert(0);
            *n += 1;
            *n <= max
        })
        .collect()
}

/// Format a timestamp as `YYYY-MM-DD`.
pub fn format_date(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}
