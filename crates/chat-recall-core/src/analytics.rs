//! Counting questions: who writes the most, and who mentions a term.
//!
//! Both are plain aggregations over stored messages; no embeddings or
//! stance provider are involved.
//!
//! A mention is a message containing any of the term's forms,
//! case-insensitively. Forms are the term itself plus a stem with the last
//! vowel dropped ("крипту" also matches "крипта"), and when the term names
//! a person, their display name and every nickname.

use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use serde::Serialize;

use crate::alias::AliasResolver;
use crate::models::DateRange;
use crate::store::Store;

/// Rows returned by default.
pub const TOP_LIMIT: usize = 10;

/// Forms shorter than this are not stemmed.
const MIN_STEM_CHARS: usize = 5;

/// One ranked sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpeakerCount {
    pub identity_id: String,
    pub count: u64,
}

/// Sort by count descending, ties by identity id; drop zero rows.
pub fn rank_counts<I>(counts: I, limit: usize) -> Vec<SpeakerCount>
where
    I: IntoIterator<Item = (String, u64)>,
{
    let mut rows: Vec<SpeakerCount> = counts
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(identity_id, count)| SpeakerCount { identity_id, count })
        .collect();
    rows.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.identity_id.cmp(&b.identity_id))
    });
    rows.truncate(limit);
    rows
}

fn ends_with_vowel(word: &str) -> bool {
    word.chars()
        .last()
        .is_some_and(|c| "аеєиіїоуюяьйaeiouy".contains(c))
}

/// Lowercased search forms for `term`, deduplicated.
pub fn mention_forms(term: &str, aliases: &AliasResolver) -> Vec<String> {
    let mut forms = BTreeSet::new();
    let mut push = |form: &str| {
        let form = form.trim().to_lowercase();
        if form.is_empty() {
            return;
        }
        let len = form.chars().count();
        if len >= MIN_STEM_CHARS && ends_with_vowel(&form) {
            forms.insert(form.chars().take(len - 1).collect::<String>());
        }
        forms.insert(form);
    };

    push(term);
    let person = aliases
        .lookup_exact(term)
        .or_else(|| aliases.lookup_inflected(term));
    if let Some(identity) = person.and_then(|id| aliases.identity(&id)) {
        push(&identity.display_name);
        for nick in &identity.nicknames {
            push(nick);
        }
    }
    forms.into_iter().collect()
}

/// True when `text` contains any of `forms` (already lowercased).
pub fn mentions_any(text: &str, forms: &[String]) -> bool {
    let lowered = text.to_lowercase();
    forms.iter().any(|f| lowered.contains(f.as_str()))
}

/// Message counts per sender, highest first.
pub async fn top_speakers<S>(
    store: &S,
    range: Option<DateRange>,
    limit: usize,
) -> Result<Vec<SpeakerCount>>
where
    S: Store + ?Sized,
{
    let counts = store.message_counts(range).await?;
    Ok(rank_counts(counts, limit))
}

/// Senders ranked by how many of their messages mention any of `forms`.
///
/// `identity` restricts the count to one sender.
pub async fn mention_counts<S>(
    store: &S,
    forms: &[String],
    identity: Option<&str>,
    range: Option<DateRange>,
    limit: usize,
) -> Result<Vec<SpeakerCount>>
where
    S: Store + ?Sized,
{
    if forms.is_empty() {
        return Ok(Vec::new());
    }
    let mut counts: HashMap<String, u64> = HashMap::new();
    for (sender, text) in store.message_texts(identity, range).await? {
        if mentions_any(&text, forms) {
            *counts.entry(sender).or_default() += 1;
        }
    }
    Ok(rank_counts(counts, limit))
}

/// "раз" / "рази" / "разів" for `n`.
pub fn times_word(n: u64) -> &'static str {
    if n % 10 == 1 && n % 100 != 11 {
        "раз"
    } else if (2..=4).contains(&(n % 10)) && !(12..=14).contains(&(n % 100)) {
        "рази"
    } else {
        "разів"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Identity, Message};
    use crate::store::memory::InMemoryStore;
    use chrono::{TimeZone, Utc};

    fn msg(id: i64, sender: &str, year: i32, text: &str) -> Message {
        Message {
            id,
            sender_identity: sender.into(),
            sender_name: sender.to_uppercase(),
            timestamp: Utc.with_ymd_and_hms(year, 6, 1, 12, 0, 0).unwrap(),
            raw_text: text.into(),
            reply_to_id: None,
            forwarded_from: None,
        }
    }

    async fn store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store
            .upsert_messages(&[
                msg(1, "alice", 2021, "Крипта це майбутнє"),
                msg(2, "bob", 2021, "гусь знову про крипту"),
                msg(3, "alice", 2022, "купила ще"),
                msg(4, "alice", 2023, "крипти більше не буде"),
                msg(5, "carol", 2023, "Alice, обід?"),
            ])
            .await
            .unwrap();
        store
    }

    #[test]
    fn test_rank_counts_orders_and_truncates() {
        let rows = rank_counts(
            vec![("b".into(), 3), ("a".into(), 3), ("c".into(), 9), ("z".into(), 0)],
            2,
        );
        let ids: Vec<&str> = rows.iter().map(|r| r.identity_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[test]
    fn test_mention_forms_expand_person() {
        let aliases = AliasResolver::from_identities(vec![{
            let mut alice = Identity::new("alice", "Alice");
            alice.nicknames.insert("гусь".into());
            alice
        }])
        .unwrap();
        let forms = mention_forms("Гусь", &aliases);
        assert!(forms.contains(&"гусь".to_string()));
        assert!(forms.contains(&"alice".to_string()));

        let forms = mention_forms("крипту", &aliases);
        assert_eq!(forms, vec!["крипт".to_string(), "крипту".to_string()]);
    }

    #[tokio::test]
    async fn test_top_speakers_with_range() {
        let store = store().await;
        let all = top_speakers(&store, None, TOP_LIMIT).await.unwrap();
        assert_eq!(all[0], SpeakerCount { identity_id: "alice".into(), count: 3 });
        assert_eq!(all.len(), 3);

        let range = DateRange {
            from: Some(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()),
            to: None,
        };
        let late = top_speakers(&store, Some(range), TOP_LIMIT).await.unwrap();
        let ids: Vec<&str> = late.iter().map(|r| r.identity_id.as_str()).collect();
        assert_eq!(ids, vec!["alice", "carol"]);
    }

    #[tokio::test]
    async fn test_mention_counts_match_inflections() {
        let store = store().await;
        let forms = mention_forms("крипту", &AliasResolver::new());
        let rows = mention_counts(&store, &forms, None, None, TOP_LIMIT).await.unwrap();
        assert_eq!(
            rows,
            vec![
                SpeakerCount { identity_id: "alice".into(), count: 2 },
                SpeakerCount { identity_id: "bob".into(), count: 1 },
            ]
        );

        let bob_only = mention_counts(&store, &forms, Some("bob"), None, TOP_LIMIT)
            .await
            .unwrap();
        assert_eq!(bob_only.len(), 1);
        assert!(mention_counts(&store, &[], None, None, TOP_LIMIT)
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_times_word() {
        assert_eq!(times_word(1), "раз");
        assert_eq!(times_word(3), "рази");
        assert_eq!(times_word(5), "разів");
        assert_eq!(times_word(11), "разів");
        assert_eq!(times_word(12), "разів");
        assert_eq!(times_word(22), "рази");
        assert_eq!(times_word(21), "раз");
    }
}
