//! Conversation state for one reply chain.
//!
//! A chain starts [`TurnState::Fresh`], becomes [`TurnState::Active`] once a
//! turn is recorded, and goes [`TurnState::Stale`] after `ttl` of
//! inactivity. A stale chain is reset and treated as fresh when reused.
//!
//! A follow-up merges with the stored turn: fields it supplies override,
//! fields it omits are inherited. "Show more" with no new fields pages over
//! the stored ranked list instead of searching again.
//!
//! This module is pure state; locking and expiry of whole chains live in
//! the app crate's tracker.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::models::{DateRange, SearchFilters, SortOrder};
use crate::question::{Intent, ParsedQuestion};
use crate::search::{paginate, Cursor, SearchHit, SearchPage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    Fresh,
    Active,
    Stale,
}

/// The query fields a chain carries between turns.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryFields {
    pub identity: Option<String>,
    pub topic: Option<String>,
    pub date_range: Option<DateRange>,
    pub sort: SortOrder,
}

impl QueryFields {
    /// Fields of `parsed` override, the rest are inherited from `self`.
    pub fn merge(&self, parsed: &ParsedQuestion) -> QueryFields {
        QueryFields {
            identity: parsed.identity.clone().or_else(|| self.identity.clone()),
            topic: parsed.topic.clone().or_else(|| self.topic.clone()),
            date_range: parsed.date_range.or(self.date_range),
            sort: parsed.sort.unwrap_or(self.sort),
        }
    }

    pub fn filters(&self) -> SearchFilters {
        SearchFilters {
            identity: self.identity.clone(),
            date_range: self.date_range,
            sort: self.sort,
        }
    }
}

/// What a follow-up asks for, after merging with the chain.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnAction {
    /// Next page of the stored ranking.
    ShowMore,
    Search(QueryFields),
    Flip(QueryFields),
    ShowContext(i64),
    /// Message counts per sender within the date range.
    TopSpeakers(QueryFields),
    /// Mention counts; the term is the topic, or the person when there is
    /// no topic.
    MentionCount(QueryFields),
    Clarify(ClarifyReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClarifyReason {
    /// "Show more" with nothing to continue.
    NothingToContinue,
    MissingTopic,
    MissingIdentity,
    /// No intent could be read from the text or the chain.
    Unclear,
}

/// Stored state of one reply chain.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    pub chain_id: String,
    pub state: TurnState,
    pub intent: Option<Intent>,
    pub fields: QueryFields,
    /// Ranked snapshot the cursor pages over.
    #[serde(skip)]
    pub ranking: Vec<SearchHit>,
    pub cursor: Cursor,
    pub last_active: DateTime<Utc>,
    pub turns: usize,
}

impl ConversationTurn {
    pub fn new(chain_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            chain_id: chain_id.into(),
            state: TurnState::Fresh,
            intent: None,
            fields: QueryFields::default(),
            ranking: Vec::new(),
            cursor: Cursor::default(),
            last_active: now,
            turns: 0,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.last_active > ttl
    }

    /// Mark the chain stale if it sat idle past `ttl`. Returns the state.
    pub fn refresh(&mut self, now: DateTime<Utc>, ttl: Duration) -> TurnState {
        if self.state == TurnState::Active && self.is_expired(now, ttl) {
            self.state = TurnState::Stale;
        }
        self.state
    }

    /// Forget everything and start over as a fresh chain.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        let chain_id = std::mem::take(&mut self.chain_id);
        *self = ConversationTurn::new(chain_id, now);
    }

    /// Decide what `parsed` asks for in the context of this chain.
    ///
    /// Resets a stale chain first. Does not record anything; call one of
    /// the `record_*` methods once the action has run.
    pub fn plan(&mut self, parsed: &ParsedQuestion, now: DateTime<Utc>, ttl: Duration) -> TurnAction {
        if self.refresh(now, ttl) == TurnState::Stale {
            self.reset(now);
        }

        if parsed.wants_more && !parsed.has_search_fields() {
            return if self.state == TurnState::Active && self.intent == Some(Intent::FindQuotes) {
                TurnAction::ShowMore
            } else {
                TurnAction::Clarify(ClarifyReason::NothingToContinue)
            };
        }

        let merged = self.fields.merge(parsed);
        let intent = match parsed.intent {
            Intent::Ambiguous if self.state == TurnState::Active => self.intent,
            Intent::Ambiguous => None,
            // A follow-up that only refines (sort order, dates) keeps a flip a flip.
            Intent::FindQuotes
                if self.intent == Some(Intent::DetectFlip)
                    && parsed.identity.is_none()
                    && parsed.topic.is_none() =>
            {
                Some(Intent::DetectFlip)
            }
            other => Some(other),
        };

        match intent {
            Some(Intent::ShowContext) => match parsed.message_id {
                Some(id) => TurnAction::ShowContext(id),
                None => TurnAction::Clarify(ClarifyReason::Unclear),
            },
            Some(Intent::DetectFlip) => {
                if merged.identity.is_none() {
                    TurnAction::Clarify(ClarifyReason::MissingIdentity)
                } else if merged.topic.is_none() {
                    TurnAction::Clarify(ClarifyReason::MissingTopic)
                } else {
                    TurnAction::Flip(merged)
                }
            }
            Some(Intent::FindQuotes) => {
                if merged.topic.is_none() {
                    TurnAction::Clarify(ClarifyReason::MissingTopic)
                } else {
                    TurnAction::Search(merged)
                }
            }
            Some(Intent::TopSpeakers) => TurnAction::TopSpeakers(merged),
            Some(Intent::MentionCount) => {
                if merged.topic.is_none() && merged.identity.is_none() {
                    TurnAction::Clarify(ClarifyReason::MissingTopic)
                } else {
                    TurnAction::MentionCount(merged)
                }
            }
            Some(Intent::Ambiguous) | None => TurnAction::Clarify(ClarifyReason::Unclear),
        }
    }

    /// Record a search turn and return its first page.
    pub fn record_search(
        &mut self,
        fields: QueryFields,
        ranking: Vec<SearchHit>,
        page_size: usize,
        now: DateTime<Utc>,
    ) -> SearchPage {
        let page = paginate(&ranking, None, page_size);
        self.fields = fields;
        self.intent = Some(Intent::FindQuotes);
        self.ranking = ranking;
        self.cursor = Cursor {
            offset: page.hits.len(),
        };
        self.touch(now);
        page
    }

    /// Next page over the stored ranking; advances the cursor.
    pub fn advance(&mut self, page_size: usize, now: DateTime<Utc>) -> SearchPage {
        let page = paginate(&self.ranking, Some(self.cursor), page_size);
        self.cursor = Cursor {
            offset: self.cursor.offset + page.hits.len(),
        };
        self.touch(now);
        page
    }

    pub fn record_flip(&mut self, fields: QueryFields, now: DateTime<Utc>) {
        self.fields = fields;
        self.intent = Some(Intent::DetectFlip);
        self.ranking.clear();
        self.cursor = Cursor::default();
        self.touch(now);
    }

    /// Record a counting turn; there is nothing to page over afterwards.
    pub fn record_count(&mut self, intent: Intent, fields: QueryFields, now: DateTime<Utc>) {
        self.fields = fields;
        self.intent = Some(intent);
        self.ranking.clear();
        self.cursor = Cursor::default();
        self.touch(now);
    }

    /// A context lookup keeps the chain's query fields and ranking.
    pub fn record_context(&mut self, now: DateTime<Utc>) {
        if self.intent.is_none() {
            self.intent = Some(Intent::ShowContext);
        }
        self.touch(now);
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.state = TurnState::Active;
        self.last_active = now;
        self.turns += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn ttl() -> Duration {
        Duration::seconds(1800)
    }

    fn parsed(intent: Intent) -> ParsedQuestion {
        ParsedQuestion {
            intent,
            identity: None,
            unresolved_mention: None,
            topic: None,
            date_range: None,
            sort: None,
            message_id: None,
            wants_more: false,
        }
    }

    fn more() -> ParsedQuestion {
        ParsedQuestion {
            wants_more: true,
            ..parsed(Intent::FindQuotes)
        }
    }

    fn hits(n: usize) -> Vec<SearchHit> {
        (0..n)
            .map(|i| SearchHit {
                rank: i,
                chunk_id: format!("c{}", i),
                message_ids: vec![i as i64],
                text: format!("quote {}", i),
                primary_sender: "alice".into(),
                start_time: t(i as i64),
                end_time: t(i as i64),
                forwarded: false,
                similarity: 0.5,
                score: 0.5,
            })
            .collect()
    }

    #[test]
    fn test_fresh_to_active_on_first_search() {
        let mut turn = ConversationTurn::new("chain", t(0));
        assert_eq!(turn.state, TurnState::Fresh);
        let q = ParsedQuestion {
            identity: Some("alice".into()),
            topic: Some("crypto".into()),
            ..parsed(Intent::FindQuotes)
        };
        let TurnAction::Search(fields) = turn.plan(&q, t(1), ttl()) else {
            panic!("expected search");
        };
        let page = turn.record_search(fields, hits(7), 3, t(1));
        assert_eq!(page.hits.len(), 3);
        assert_eq!(turn.state, TurnState::Active);
        assert_eq!(turn.cursor.offset, 3);
    }

    #[test]
    fn test_follow_up_inherits_and_overrides() {
        let mut turn = ConversationTurn::new("chain", t(0));
        turn.record_search(
            QueryFields {
                identity: Some("alice".into()),
                topic: Some("crypto".into()),
                ..Default::default()
            },
            hits(2),
            5,
            t(0),
        );
        let follow = ParsedQuestion {
            topic: Some("weather".into()),
            ..parsed(Intent::FindQuotes)
        };
        let TurnAction::Search(fields) = turn.plan(&follow, t(10), ttl()) else {
            panic!("expected search");
        };
        assert_eq!(fields.identity.as_deref(), Some("alice"));
        assert_eq!(fields.topic.as_deref(), Some("weather"));
    }

    #[test]
    fn test_show_more_advances_cursor_over_stored_ranking() {
        let mut turn = ConversationTurn::new("chain", t(0));
        turn.record_search(
            QueryFields {
                topic: Some("crypto".into()),
                ..Default::default()
            },
            hits(7),
            3,
            t(0),
        );
        assert_eq!(turn.plan(&more(), t(5), ttl()), TurnAction::ShowMore);
        let page = turn.advance(3, t(5));
        assert_eq!(
            page.hits.iter().map(|h| h.rank).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
        let page = turn.advance(3, t(6));
        assert_eq!(page.hits.iter().map(|h| h.rank).collect::<Vec<_>>(), vec![6]);
        assert!(page.next_cursor.is_none());
        assert!(turn.advance(3, t(7)).is_empty());
    }

    #[test]
    fn test_stale_chain_is_reset() {
        let mut turn = ConversationTurn::new("chain", t(0));
        turn.record_search(
            QueryFields {
                identity: Some("alice".into()),
                topic: Some("crypto".into()),
                ..Default::default()
            },
            hits(7),
            3,
            t(0),
        );
        assert_eq!(turn.refresh(t(1801), ttl()), TurnState::Stale);
        assert_eq!(
            turn.plan(&more(), t(1801), ttl()),
            TurnAction::Clarify(ClarifyReason::NothingToContinue)
        );
        assert_eq!(turn.state, TurnState::Fresh);
        assert!(turn.ranking.is_empty());
        assert_eq!(turn.fields, QueryFields::default());
    }

    #[test]
    fn test_flip_refinement_keeps_flip_intent() {
        let mut turn = ConversationTurn::new("chain", t(0));
        turn.record_flip(
            QueryFields {
                identity: Some("alice".into()),
                topic: Some("crypto".into()),
                ..Default::default()
            },
            t(0),
        );
        let refine = ParsedQuestion {
            sort: Some(SortOrder::Oldest),
            ..parsed(Intent::FindQuotes)
        };
        assert!(matches!(turn.plan(&refine, t(1), ttl()), TurnAction::Flip(_)));
        assert_eq!(
            turn.plan(&more(), t(1), ttl()),
            TurnAction::Clarify(ClarifyReason::NothingToContinue)
        );
    }

    #[test]
    fn test_missing_fields_ask_for_clarification() {
        let mut turn = ConversationTurn::new("chain", t(0));
        let flip = ParsedQuestion {
            topic: Some("crypto".into()),
            ..parsed(Intent::DetectFlip)
        };
        assert_eq!(
            turn.plan(&flip, t(0), ttl()),
            TurnAction::Clarify(ClarifyReason::MissingIdentity)
        );
        let who = ParsedQuestion {
            identity: Some("alice".into()),
            ..parsed(Intent::FindQuotes)
        };
        assert_eq!(
            turn.plan(&who, t(0), ttl()),
            TurnAction::Clarify(ClarifyReason::MissingTopic)
        );
        assert_eq!(
            turn.plan(&parsed(Intent::Ambiguous), t(0), ttl()),
            TurnAction::Clarify(ClarifyReason::Unclear)
        );
    }

    #[test]
    fn test_ambiguous_reply_repeats_active_intent() {
        let mut turn = ConversationTurn::new("chain", t(0));
        turn.record_search(
            QueryFields {
                topic: Some("crypto".into()),
                ..Default::default()
            },
            hits(1),
            5,
            t(0),
        );
        assert!(matches!(
            turn.plan(&parsed(Intent::Ambiguous), t(1), ttl()),
            TurnAction::Search(_)
        ));
    }

    #[test]
    fn test_counting_turn_has_nothing_to_page() {
        let mut turn = ConversationTurn::new("chain", t(0));
        assert_eq!(
            turn.plan(&parsed(Intent::MentionCount), t(0), ttl()),
            TurnAction::Clarify(ClarifyReason::MissingTopic)
        );

        let top = parsed(Intent::TopSpeakers);
        let TurnAction::TopSpeakers(fields) = turn.plan(&top, t(0), ttl()) else {
            panic!("expected top speakers");
        };
        turn.record_count(Intent::TopSpeakers, fields, t(0));

        assert_eq!(
            turn.plan(&more(), t(1), ttl()),
            TurnAction::Clarify(ClarifyReason::NothingToContinue)
        );
        let crypto = ParsedQuestion {
            topic: Some("crypto".into()),
            ..parsed(Intent::MentionCount)
        };
        assert!(matches!(
            turn.plan(&crypto, t(2), ttl()),
            TurnAction::MentionCount(QueryFields { topic: Some(_), .. })
        ));
    }
}
