//! Flip detection: did a person's stance on a topic change over time?
//!
//! # Algorithm
//!
//! 1. Retrieve the identity's chunks on the topic through [`search::rank`]
//!    with an identity filter and a similarity floor.
//! 2. Order them by start time ascending (ties by chunk id).
//! 3. Split into an early and a late window ([`WindowPolicy`]).
//! 4. Classify every quote on its own and take each window's majority
//!    stance, ignoring `unknown`. A tie is `unknown`.
//! 5. Report a flip only when both window stances are known and differ.
//!
//! Confidence is `agreement_early × agreement_late × n / (n + 1)`, where
//! agreement is the share of a window's known quotes that carry its
//! dominant stance and `n` is the smaller of the two supporting counts.
//!
//! Too little evidence or a stable stance is [`FlipOutcome::NoFlip`],
//! never an error.

use std::collections::HashMap;

use anyhow::Result;
use serde::Serialize;

use crate::models::{SearchFilters, Stance};
use crate::search::{self, SearchHit, SearchParams};
use crate::stance::StanceClassifier;
use crate::store::{Store, VectorIndex};

/// How the ordered quotes are split into two windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPolicy {
    /// Split at the midpoint between the first and last quote timestamps.
    Midpoint,
    /// The first `n` and last `n` quotes. Timelines shorter than `2n`
    /// fall back to two halves.
    Fixed(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlipPolicy {
    pub window: WindowPolicy,
    /// Quotes with a known stance required in each window.
    pub min_quotes_per_window: usize,
    pub candidate_k: usize,
    pub min_similarity: f32,
}

impl Default for FlipPolicy {
    fn default() -> Self {
        Self {
            window: WindowPolicy::Midpoint,
            min_quotes_per_window: 2,
            candidate_k: 100,
            min_similarity: 0.2,
        }
    }
}

/// A detected change of stance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlipResult {
    pub before: SearchHit,
    pub after: SearchHit,
    pub stance_before: Stance,
    pub stance_after: Stance,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub early_quotes: usize,
    pub late_quotes: usize,
}

/// Why no flip was reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoFlipReason {
    /// No matching quotes at all.
    NoQuotes,
    /// A window had fewer than the minimum number of classified quotes.
    InsufficientEvidence,
    /// One of the windows had no dominant stance.
    UnclearStance,
    /// Both windows share the same stance.
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FlipOutcome {
    Flip(FlipResult),
    NoFlip {
        reason: NoFlipReason,
        quotes: usize,
        stance_before: Stance,
        stance_after: Stance,
    },
}

impl FlipOutcome {
    fn none(reason: NoFlipReason, quotes: usize) -> Self {
        FlipOutcome::NoFlip {
            reason,
            quotes,
            stance_before: Stance::Unknown,
            stance_after: Stance::Unknown,
        }
    }
}

/// Run flip detection for `identity` on `topic`.
///
/// `query_vec` is the embedded topic. Provider failures from the stance
/// classifier propagate so the caller can report them as such.
pub async fn detect_flip<S, V, C>(
    store: &S,
    index: &V,
    classifier: &C,
    query_vec: &[f32],
    identity: &str,
    topic: &str,
    policy: &FlipPolicy,
) -> Result<FlipOutcome>
where
    S: Store + ?Sized,
    V: VectorIndex + ?Sized,
    C: StanceClassifier + ?Sized,
{
    let filters = SearchFilters {
        identity: Some(identity.to_string()),
        ..Default::default()
    };
    let params = SearchParams {
        candidate_k: policy.candidate_k,
        max_results: policy.candidate_k,
        recency_weight: 0.0,
        min_similarity: Some(policy.min_similarity),
        ..SearchParams::default()
    };
    let mut quotes = search::rank(store, index, query_vec, &filters, &params).await?;
    if quotes.is_empty() {
        return Ok(FlipOutcome::none(NoFlipReason::NoQuotes, 0));
    }
    quotes.sort_by(|a, b| {
        a.start_time
            .cmp(&b.start_time)
            .then(a.chunk_id.cmp(&b.chunk_id))
    });

    let total = quotes.len();
    let (early, late) = split_windows(&quotes, policy.window);
    if early.len() < policy.min_quotes_per_window || late.len() < policy.min_quotes_per_window {
        return Ok(FlipOutcome::none(NoFlipReason::InsufficientEvidence, total));
    }

    let early_stances = classify_each(classifier, topic, early).await?;
    let late_stances = classify_each(classifier, topic, late).await?;

    let early_vote = majority(&early_stances);
    let late_vote = majority(&late_stances);
    if early_vote.known < policy.min_quotes_per_window
        || late_vote.known < policy.min_quotes_per_window
    {
        return Ok(FlipOutcome::none(NoFlipReason::InsufficientEvidence, total));
    }

    let (before_stance, after_stance) = (early_vote.stance, late_vote.stance);
    if before_stance == Stance::Unknown || after_stance == Stance::Unknown {
        return Ok(FlipOutcome::NoFlip {
            reason: NoFlipReason::UnclearStance,
            quotes: total,
            stance_before: before_stance,
            stance_after: after_stance,
        });
    }
    if before_stance == after_stance {
        return Ok(FlipOutcome::NoFlip {
            reason: NoFlipReason::Stable,
            quotes: total,
            stance_before: before_stance,
            stance_after: after_stance,
        });
    }

    // Earliest quote carrying the early stance, latest carrying the late one.
    let before = early
        .iter()
        .zip(&early_stances)
        .find(|(_, s)| **s == before_stance)
        .map(|(q, _)| q.clone());
    let after = late
        .iter()
        .zip(&late_stances)
        .rev()
        .find(|(_, s)| **s == after_stance)
        .map(|(q, _)| q.clone());
    let (Some(before), Some(after)) = (before, after) else {
        return Ok(FlipOutcome::none(NoFlipReason::UnclearStance, total));
    };

    let n = early_vote.support.min(late_vote.support) as f64;
    let confidence = (early_vote.agreement() * late_vote.agreement() * n / (n + 1.0)).clamp(0.0, 1.0);

    Ok(FlipOutcome::Flip(FlipResult {
        before,
        after,
        stance_before: before_stance,
        stance_after: after_stance,
        confidence,
        early_quotes: early.len(),
        late_quotes: late.len(),
    }))
}

/// Split chronologically ordered quotes into (early, late).
pub fn split_windows(quotes: &[SearchHit], policy: WindowPolicy) -> (&[SearchHit], &[SearchHit]) {
    if quotes.len() < 2 {
        return (quotes, &[]);
    }
    match policy {
        WindowPolicy::Midpoint => {
            let first = quotes[0].start_time.timestamp();
            let last = quotes[quotes.len() - 1].start_time.timestamp();
            if first == last {
                let half = quotes.len() / 2;
                return (&quotes[..half], &quotes[half..]);
            }
            let mid = first + (last - first) / 2;
            let cut = quotes
                .iter()
                .position(|q| q.start_time.timestamp() >= mid)
                .unwrap_or(quotes.len());
            // Both windows are non-empty: `last >= mid` and the cut is >= 1.
            quotes.split_at(cut.max(1))
        }
        WindowPolicy::Fixed(n) => {
            let n = n.max(1);
            if quotes.len() >= 2 * n {
                (&quotes[..n], &quotes[quotes.len() - n..])
            } else {
                let half = quotes.len() / 2;
                (&quotes[..half], &quotes[half..])
            }
        }
    }
}

async fn classify_each<C>(classifier: &C, topic: &str, quotes: &[SearchHit]) -> Result<Vec<Stance>>
where
    C: StanceClassifier + ?Sized,
{
    let mut out = Vec::with_capacity(quotes.len());
    for quote in quotes {
        let stance = classifier
            .classify_stance(topic, std::slice::from_ref(&quote.text))
            .await?;
        out.push(stance);
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Vote {
    stance: Stance,
    /// Quotes carrying `stance`.
    support: usize,
    /// Quotes with any stance other than unknown.
    known: usize,
}

impl Vote {
    fn agreement(&self) -> f64 {
        if self.known == 0 {
            0.0
        } else {
            self.support as f64 / self.known as f64
        }
    }
}

fn majority(stances: &[Stance]) -> Vote {
    let mut counts: HashMap<Stance, usize> = HashMap::new();
    for s in stances.iter().filter(|s| **s != Stance::Unknown) {
        *counts.entry(*s).or_insert(0) += 1;
    }
    let known = counts.values().sum();
    let mut ranked: Vec<(Stance, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.as_str().cmp(b.0.as_str())));
    match ranked.as_slice() {
        [] => Vote {
            stance: Stance::Unknown,
            support: 0,
            known,
        },
        [(_, top), (_, second), ..] if top == second => Vote {
            stance: Stance::Unknown,
            support: 0,
            known,
        },
        [(stance, top), ..] => Vote {
            stance: *stance,
            support: *top,
            known,
        },
    }
}
