//! Question answering over an indexed chat.
//!
//! [`Engine::handle_inbound`] is the single entry point a chat transport
//! needs: it takes the message text, the message it replies to (if any),
//! and who sent it, and always returns a formatted reply. Failures become
//! user-facing replies, never errors.
//!
//! Per message:
//!
//! 1. Open the reply chain and lock it; concurrent follow-ups in one chain
//!    run one at a time.
//! 2. Refuse with `IndexBusy` while a full reindex holds the lock.
//! 3. Parse the question against the current aliases.
//! 4. Let the chain's [`ConversationTurn`] decide what the message asks
//!    for, merging with the previous turn.
//! 5. Search, detect a flip, page over the stored ranking, show context,
//!    or count messages; record the turn; format the answer.
//!
//! The engine also exposes the same operations directly for the CLI.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chat_recall_core::alias::{AliasResolver, SeedReport};
use chat_recall_core::analytics::{self, SpeakerCount, TOP_LIMIT};
use chat_recall_core::context::{ClarifyReason, ConversationTurn, QueryFields, TurnAction};
use chat_recall_core::embedding::EmbeddingProvider;
use chat_recall_core::error::{ProviderError, RecallError};
use chat_recall_core::flip::{detect_flip, FlipOutcome, FlipPolicy};
use chat_recall_core::models::{DateRange, Identity, Message, SearchFilters};
use chat_recall_core::question::{Intent, QuestionParser};
use chat_recall_core::search::{self, Cursor, SearchHit, SearchPage, SearchParams};
use chat_recall_core::stance::StanceClassifier;
use chat_recall_core::store::{Store, VectorIndex};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::format;
use crate::index_lock;
use crate::sqlite_store::SqliteStore;
use crate::tracker::ConversationTracker;
use crate::{db, embedding, migrate, reasoning};

/// Messages shown on each side of a `show_context` target.
pub const CONTEXT_RADIUS: usize = 3;

/// Who sent an inbound message, and where.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderContext {
    /// Conversation scope; reply references are only meaningful within it.
    pub chat_id: String,
    pub sender_id: Option<String>,
    /// Transport id of the inbound message itself.
    pub message_ref: Option<String>,
}

impl SenderContext {
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            ..Self::default()
        }
    }

    pub fn with_message_ref(mut self, message_ref: impl Into<String>) -> Self {
        self.message_ref = Some(message_ref.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub search: SearchParams,
    pub page_size: usize,
    pub flip: FlipPolicy,
    pub context_radius: usize,
    pub ttl: Duration,
    pub max_chains: usize,
    pub bot_names: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            search: SearchParams::default(),
            page_size: 5,
            flip: FlipPolicy::default(),
            context_radius: CONTEXT_RADIUS,
            ttl: Duration::seconds(1800),
            max_chains: 50,
            bot_names: Vec::new(),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            search: config.retrieval.params(),
            page_size: config.retrieval.page_size,
            flip: config.flip.policy(),
            context_radius: CONTEXT_RADIUS,
            ttl: Duration::seconds(config.conversation.ttl_secs),
            max_chains: config.conversation.max_chains,
            bot_names: config.conversation.bot_names.clone(),
        }
    }
}

/// What the engine answered, before formatting.
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    Quotes {
        fields: QueryFields,
        page: SearchPage,
    },
    Flip {
        identity: String,
        topic: String,
        outcome: FlipOutcome,
    },
    Context {
        target: i64,
        messages: Vec<Message>,
    },
    TopSpeakers {
        date_range: Option<DateRange>,
        counts: Vec<SpeakerCount>,
    },
    Mentions {
        term: String,
        /// Only this sender's messages were counted.
        sender: Option<String>,
        counts: Vec<SpeakerCount>,
    },
    Clarify(ClarifyReason),
    Error(RecallError),
}

/// Reply to one inbound message.
#[derive(Debug, Clone)]
pub struct InboundReply {
    pub chain_id: String,
    /// Reference of this answer; replying to it continues the chain.
    pub reply_ref: String,
    pub answer: Answer,
    pub text: String,
}

pub struct Engine {
    store: Arc<dyn Store>,
    index: Arc<dyn VectorIndex>,
    provider: Arc<dyn EmbeddingProvider>,
    classifier: Arc<dyn StanceClassifier>,
    aliases: Arc<AliasResolver>,
    parser: QuestionParser,
    tracker: ConversationTracker,
    settings: EngineSettings,
    lock_path: Option<PathBuf>,
    answers: AtomicU64,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        index: Arc<dyn VectorIndex>,
        provider: Arc<dyn EmbeddingProvider>,
        classifier: Arc<dyn StanceClassifier>,
        aliases: Arc<AliasResolver>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            parser: QuestionParser::with_ignored_mentions(&settings.bot_names),
            tracker: ConversationTracker::new(settings.ttl, settings.max_chains),
            store,
            index,
            provider,
            classifier,
            aliases,
            settings,
            lock_path: None,
            answers: AtomicU64::new(0),
        }
    }

    /// Report `IndexBusy` while a reindex holds the lock at `path`.
    pub fn with_lock_path(mut self, path: PathBuf) -> Self {
        self.lock_path = Some(path);
        self
    }

    /// Open the configured database and providers.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool).await?;
        let store = Arc::new(SqliteStore::new(pool));
        let aliases = AliasResolver::from_identities(store.load_identities().await?)?;

        Ok(Self::new(
            store.clone(),
            store,
            embedding::create_provider(&config.embedding)?,
            reasoning::create_classifier(&config.reasoning)?,
            Arc::new(aliases),
            EngineSettings::from_config(config),
        )
        .with_lock_path(config.db.lock_path()))
    }

    pub fn aliases(&self) -> &AliasResolver {
        &self.aliases
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// Answer one inbound message.
    pub async fn handle_inbound(
        &self,
        text: &str,
        reply_ref: Option<&str>,
        sender: &SenderContext,
    ) -> InboundReply {
        self.handle_inbound_at(text, reply_ref, sender, Utc::now()).await
    }

    /// [`handle_inbound`](Self::handle_inbound) with an explicit clock.
    pub async fn handle_inbound_at(
        &self,
        text: &str,
        reply_ref: Option<&str>,
        sender: &SenderContext,
        now: DateTime<Utc>,
    ) -> InboundReply {
        let (chain_id, handle) = self.tracker.open(
            &sender.chat_id,
            reply_ref,
            sender.message_ref.as_deref(),
            now,
        );

        let answer = {
            let mut turn = handle.lock().await;
            match self.answer(text, &mut turn, now).await {
                Ok(answer) => answer,
                Err(e) => Answer::Error(to_recall_error(e)),
            }
        };

        let seq = self.answers.fetch_add(1, Ordering::Relaxed) as usize;
        let reply_ref = ConversationTracker::answer_ref(&chain_id, seq);
        self.tracker.link(&chain_id, &reply_ref);
        let text = format::render(&answer, &self.aliases);

        InboundReply {
            chain_id,
            reply_ref,
            answer,
            text,
        }
    }

    async fn answer(&self, text: &str, turn: &mut ConversationTurn, now: DateTime<Utc>) -> Result<Answer> {
        if let Some(path) = &self.lock_path {
            index_lock::ensure_readable(path)?;
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(RecallError::MalformedInput("empty question".into()).into());
        }

        let parsed = self.parser.parse(text, &self.aliases);
        debug!(
            intent = parsed.intent.as_str(),
            identity = ?parsed.identity,
            topic = ?parsed.topic,
            more = parsed.wants_more,
            "parsed question"
        );
        if parsed.identity.is_none() {
            if let Some(mention) = &parsed.unresolved_mention {
                // Unknown person: answer with suggestions instead of guessing.
                self.aliases.resolve(mention)?;
            }
        }

        let page_size = self.settings.page_size;
        match turn.plan(&parsed, now, self.tracker.ttl()) {
            TurnAction::ShowMore => {
                let page = turn.advance(page_size, now);
                Ok(Answer::Quotes {
                    fields: turn.fields.clone(),
                    page,
                })
            }
            TurnAction::Search(fields) => {
                let ranking = self.rank(&fields).await?;
                let page = turn.record_search(fields.clone(), ranking, page_size, now);
                Ok(Answer::Quotes { fields, page })
            }
            TurnAction::Flip(fields) => {
                let (Some(identity), Some(topic)) = (fields.identity.clone(), fields.topic.clone()) else {
                    return Ok(Answer::Clarify(ClarifyReason::Unclear));
                };
                let outcome = self.detect(&identity, &topic).await?;
                turn.record_flip(fields, now);
                Ok(Answer::Flip {
                    identity,
                    topic,
                    outcome,
                })
            }
            TurnAction::ShowContext(id) => {
                let messages = self.context(id).await?;
                turn.record_context(now);
                Ok(Answer::Context {
                    target: id,
                    messages,
                })
            }
            TurnAction::TopSpeakers(fields) => {
                let date_range = fields.date_range;
                let counts = self.top_speakers(date_range).await?;
                turn.record_count(Intent::TopSpeakers, fields, now);
                Ok(Answer::TopSpeakers { date_range, counts })
            }
            TurnAction::MentionCount(fields) => {
                // With a topic the person is the sender; alone, they are the term.
                let (term, sender) = match (&fields.topic, &fields.identity) {
                    (Some(topic), sender) => (topic.clone(), sender.clone()),
                    (None, Some(person)) => (self.aliases.display_name(person), None),
                    (None, None) => return Ok(Answer::Clarify(ClarifyReason::MissingTopic)),
                };
                let counts = self
                    .mention_counts(&term, sender.as_deref(), fields.date_range)
                    .await?;
                turn.record_count(Intent::MentionCount, fields, now);
                Ok(Answer::Mentions {
                    term,
                    sender,
                    counts,
                })
            }
            TurnAction::Clarify(reason) => Ok(Answer::Clarify(reason)),
        }
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.provider
            .embed_one(text)
            .await
            .map_err(|e| RecallError::Provider(e).into())
    }

    async fn rank(&self, fields: &QueryFields) -> Result<Vec<SearchHit>> {
        let topic = fields.topic.as_deref().unwrap_or_default();
        let qvec = self.embed_query(topic).await?;
        let ranking = search::rank(
            self.store.as_ref(),
            self.index.as_ref(),
            &qvec,
            &fields.filters(),
            &self.settings.search,
        )
        .await?;
        info!(topic, identity = ?fields.identity, results = ranking.len(), "search");
        Ok(ranking)
    }

    async fn detect(&self, identity: &str, topic: &str) -> Result<FlipOutcome> {
        let qvec = self.embed_query(topic).await?;
        let outcome = detect_flip(
            self.store.as_ref(),
            self.index.as_ref(),
            self.classifier.as_ref(),
            &qvec,
            identity,
            topic,
            &self.settings.flip,
        )
        .await?;
        info!(identity, topic, outcome = outcome_label(&outcome), "flip detection");
        Ok(outcome)
    }

    // ---- direct operations ----

    /// One page of results for `query` under `filters`.
    pub async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        cursor: Option<Cursor>,
    ) -> Result<SearchPage> {
        let fields = QueryFields {
            identity: filters.identity.clone(),
            topic: Some(query.to_string()),
            date_range: filters.date_range,
            sort: filters.sort,
        };
        let ranking = self.rank(&fields).await?;
        Ok(search::paginate(&ranking, cursor, self.settings.page_size))
    }

    /// Resolve `who` and run flip detection on `topic`.
    pub async fn flip(&self, who: &str, topic: &str) -> Result<(String, FlipOutcome)> {
        let identity = self.aliases.resolve(who)?;
        let outcome = self.detect(&identity, topic).await?;
        Ok((identity, outcome))
    }

    /// The message and its neighbours in `(timestamp, id)` order.
    pub async fn context(&self, message_id: i64) -> Result<Vec<Message>> {
        if self.store.get_message(message_id).await?.is_none() {
            return Err(RecallError::not_found("message", message_id.to_string()).into());
        }
        let radius = self.settings.context_radius;
        self.store.messages_around(message_id, radius, radius).await
    }

    /// Senders by message count within `range`.
    pub async fn top_speakers(&self, range: Option<DateRange>) -> Result<Vec<SpeakerCount>> {
        let counts = analytics::top_speakers(self.store.as_ref(), range, TOP_LIMIT).await?;
        info!(senders = counts.len(), "top speakers");
        Ok(counts)
    }

    /// Senders by number of messages mentioning `term` or, when it names a
    /// person, any of their names.
    pub async fn mention_counts(
        &self,
        term: &str,
        sender: Option<&str>,
        range: Option<DateRange>,
    ) -> Result<Vec<SpeakerCount>> {
        let forms = analytics::mention_forms(term, &self.aliases);
        debug!(term, forms = ?forms, "mention forms");
        let counts =
            analytics::mention_counts(self.store.as_ref(), &forms, sender, range, TOP_LIMIT).await?;
        info!(term, senders = counts.len(), "mention counts");
        Ok(counts)
    }

    /// Bind `nickname` to the person `who` resolves to.
    pub async fn add_alias(&self, who: &str, nickname: &str) -> Result<Identity> {
        let identity_id = match self.aliases.identity(who) {
            Some(identity) => identity.identity_id,
            None => self.aliases.resolve(who)?,
        };
        let identity = self.aliases.add_alias(&identity_id, nickname)?;
        self.store.save_identity(&identity).await?;
        info!(identity = %identity_id, nickname, "alias added");
        Ok(identity)
    }

    pub async fn remove_alias(&self, nickname: &str) -> Result<Identity> {
        let identity = self.aliases.remove_alias(nickname)?;
        self.store.save_identity(&identity).await?;
        info!(identity = %identity.identity_id, nickname, "alias removed");
        Ok(identity)
    }

    /// nickname → identity id.
    pub fn list_aliases(&self) -> BTreeMap<String, String> {
        self.aliases.list_aliases()
    }

    /// Apply a seed table (identity id → nicknames) and persist what changed.
    pub async fn seed_aliases(&self, seed: &BTreeMap<String, Vec<String>>) -> Result<SeedReport> {
        let (report, touched) = self.aliases.seed(
            seed.iter()
                .map(|(id, nicks)| (id.as_str(), nicks.iter().map(String::as_str))),
        );
        for identity in &touched {
            self.store.save_identity(identity).await?;
        }
        Ok(report)
    }

    pub async fn deactivate_identity(&self, who: &str) -> Result<Identity> {
        let identity_id = self.aliases.resolve(who)?;
        let identity = self.aliases.deactivate(&identity_id)?;
        self.store.save_identity(&identity).await?;
        Ok(identity)
    }
}

fn outcome_label(outcome: &FlipOutcome) -> &'static str {
    match outcome {
        FlipOutcome::Flip(_) => "flip",
        FlipOutcome::NoFlip { .. } => "no_flip",
    }
}

/// Anything that is not already a [`RecallError`] or a provider failure
/// is logged and reported as a transient provider failure so the user
/// still gets a reply.
fn to_recall_error(err: anyhow::Error) -> RecallError {
    let err = match err.downcast::<RecallError>() {
        Ok(e) => return e,
        Err(e) => e,
    };
    match err.downcast::<ProviderError>() {
        Ok(e) => RecallError::Provider(e),
        Err(other) => {
            error!(error = %format!("{:#}", other), "question handling failed");
            RecallError::Provider(ProviderError::Transient(
                "internal error while answering".to_string(),
            ))
        }
    }
}
