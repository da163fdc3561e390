//! Registry of live reply chains.
//!
//! Each chain owns a [`ConversationTurn`] behind its own `tokio` mutex, so
//! follow-ups in one chain run one at a time while different chains never
//! contend. Message references (the user's question, the bot's answer) are
//! linked to their chain per chat; replying to any linked message continues
//! that chain.
//!
//! Chains idle for longer than the TTL are dropped on the next access, and
//! the least recently used chain goes first once `max_chains` is reached.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chat_recall_core::context::ConversationTurn;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

pub type TurnHandle = Arc<AsyncMutex<ConversationTurn>>;

struct ChainSlot {
    chat_id: String,
    turn: TurnHandle,
    touched: DateTime<Utc>,
}

#[derive(Default)]
struct Registry {
    chains: HashMap<String, ChainSlot>,
    /// `(chat_id, message_ref)` → chain id.
    links: HashMap<(String, String), String>,
    created: u64,
}

pub struct ConversationTracker {
    registry: Mutex<Registry>,
    ttl: Duration,
    max_chains: usize,
}

impl ConversationTracker {
    pub fn new(ttl: Duration, max_chains: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            ttl,
            max_chains: max_chains.max(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The chain a message belongs to.
    ///
    /// Continues the chain `reply_ref` is linked to, or starts a new one
    /// rooted at `root_ref` (the inbound message itself, when known).
    pub fn open(
        &self,
        chat_id: &str,
        reply_ref: Option<&str>,
        root_ref: Option<&str>,
        now: DateTime<Utc>,
    ) -> (String, TurnHandle) {
        let mut reg = self.lock();
        self.evict(&mut reg, now);

        if let Some(reply) = reply_ref {
            let key = (chat_id.to_string(), reply.to_string());
            if let Some(chain_id) = reg.links.get(&key).cloned() {
                if let Some(slot) = reg.chains.get_mut(&chain_id) {
                    slot.touched = now;
                    let turn = Arc::clone(&slot.turn);
                    if let Some(root) = root_ref {
                        reg.links
                            .insert((chat_id.to_string(), root.to_string()), chain_id.clone());
                    }
                    return (chain_id, turn);
                }
            }
        }

        reg.created += 1;
        let chain_id = match root_ref {
            Some(root) => format!("{}:{}", chat_id, root),
            None => format!("{}:~{}", chat_id, reg.created),
        };
        if let Some(slot) = reg.chains.get_mut(&chain_id) {
            slot.touched = now;
            return (chain_id, Arc::clone(&slot.turn));
        }

        if reg.chains.len() >= self.max_chains {
            Self::evict_oldest(&mut reg);
        }
        let turn = Arc::new(AsyncMutex::new(ConversationTurn::new(chain_id.clone(), now)));
        reg.chains.insert(
            chain_id.clone(),
            ChainSlot {
                chat_id: chat_id.to_string(),
                turn: Arc::clone(&turn),
                touched: now,
            },
        );
        if let Some(root) = root_ref {
            reg.links
                .insert((chat_id.to_string(), root.to_string()), chain_id.clone());
        }
        debug!(chain = %chain_id, "chain started");
        (chain_id, turn)
    }

    /// Make replies to `message_ref` continue `chain_id`.
    pub fn link(&self, chain_id: &str, message_ref: &str) {
        let mut reg = self.lock();
        let Some(chat_id) = reg.chains.get(chain_id).map(|s| s.chat_id.clone()) else {
            return;
        };
        reg.links
            .insert((chat_id, message_ref.to_string()), chain_id.to_string());
    }

    /// A short reference for the bot's `turn`-th answer in `chain_id`.
    pub fn answer_ref(chain_id: &str, turn: usize) -> String {
        let digest = Sha256::digest(format!("{}#{}", chain_id, turn).as_bytes());
        hex::encode(&digest[..4])
    }

    pub fn len(&self) -> usize {
        self.lock().chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(&self, reg: &mut Registry, now: DateTime<Utc>) {
        let expired: Vec<String> = reg
            .chains
            .iter()
            .filter(|(_, slot)| now - slot.touched > self.ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            Self::remove(reg, &id);
            debug!(chain = %id, "chain expired");
        }
    }

    fn evict_oldest(reg: &mut Registry) {
        let oldest = reg
            .chains
            .iter()
            .min_by(|a, b| a.1.touched.cmp(&b.1.touched).then_with(|| a.0.cmp(b.0)))
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            Self::remove(reg, &id);
            debug!(chain = %id, "chain evicted");
        }
    }

    fn remove(reg: &mut Registry, chain_id: &str) {
        reg.chains.remove(chain_id);
        reg.links.retain(|_, c| c != chain_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_reply_continues_linked_chain() {
        let tracker = ConversationTracker::new(Duration::seconds(1800), 50);
        let (chain, _) = tracker.open("chat", None, Some("m1"), t(0));
        tracker.link(&chain, "bot1");

        let (again, _) = tracker.open("chat", Some("bot1"), Some("m2"), t(10));
        assert_eq!(again, chain);
        let (via_root, _) = tracker.open("chat", Some("m1"), None, t(20));
        assert_eq!(via_root, chain);

        // Same ref in another chat is a different conversation.
        let (other, _) = tracker.open("elsewhere", Some("bot1"), None, t(30));
        assert_ne!(other, chain);
    }

    #[test]
    fn test_reply_to_own_follow_up_stays_in_chain() {
        let tracker = ConversationTracker::new(Duration::seconds(1800), 50);
        let (chain, _) = tracker.open("chat", None, Some("m1"), t(0));
        tracker.link(&chain, "bot1");

        let (follow, _) = tracker.open("chat", Some("bot1"), Some("m2"), t(10));
        assert_eq!(follow, chain);
        let (again, _) = tracker.open("chat", Some("m2"), Some("m3"), t(20));
        assert_eq!(again, chain);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_idle_chains_expire() {
        let tracker = ConversationTracker::new(Duration::seconds(60), 50);
        let (chain, _) = tracker.open("chat", None, Some("m1"), t(0));
        tracker.link(&chain, "bot1");

        let (fresh, _) = tracker.open("chat", Some("bot1"), None, t(120));
        assert_ne!(fresh, chain);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_max_chains_evicts_least_recent() {
        let tracker = ConversationTracker::new(Duration::seconds(1800), 2);
        let (a, _) = tracker.open("chat", None, Some("a"), t(0));
        let (_b, _) = tracker.open("chat", None, Some("b"), t(1));
        tracker.open("chat", Some("a"), None, t(2));
        tracker.open("chat", None, Some("c"), t(3));

        assert_eq!(tracker.len(), 2);
        let (still_a, _) = tracker.open("chat", Some("a"), None, t(4));
        assert_eq!(still_a, a);
    }

    #[test]
    fn test_answer_ref_is_stable() {
        assert_eq!(
            ConversationTracker::answer_ref("chat:m1", 1),
            ConversationTracker::answer_ref("chat:m1", 1)
        );
        assert_ne!(
            ConversationTracker::answer_ref("chat:m1", 1),
            ConversationTracker::answer_ref("chat:m1", 2)
        );
        assert_eq!(ConversationTracker::answer_ref("x", 0).len(), 8);
    }
}
