//! Chat-facing rendering of engine answers.
//!
//! Replies are plain text with a little emoji structure, in Ukrainian like
//! the chats the bot lives in. A quote renders as
//!
//! ```text
//! 📅 2021-03-14 | Alice
//! "crypto is the future"
//! ```

use chat_recall_core::alias::AliasResolver;
use chat_recall_core::analytics::{times_word, SpeakerCount};
use chat_recall_core::context::{ClarifyReason, QueryFields};
use chat_recall_core::error::{ProviderError, RecallError};
use chat_recall_core::flip::{FlipOutcome, NoFlipReason};
use chat_recall_core::models::{DateRange, Message, SortOrder, Stance};
use chat_recall_core::search::{format_date, SearchHit, SearchPage};

use crate::engine::Answer;

/// Characters of a quote shown before it is cut with "...".
pub const MAX_QUOTE_CHARS: usize = 500;
const RULE: &str = "━━━━━━━━━━━━━━━━━━━━";

pub fn render(answer: &Answer, names: &AliasResolver) -> String {
    match answer {
        Answer::Quotes { fields, page } => render_quotes(fields, page, names),
        Answer::Flip {
            identity,
            topic,
            outcome,
        } => render_flip(&names.display_name(identity), topic, outcome),
        Answer::Context { target, messages } => render_context(*target, messages, names),
        Answer::TopSpeakers { date_range, counts } => {
            render_top_speakers(date_range.as_ref(), counts, names)
        }
        Answer::Mentions {
            term,
            sender,
            counts,
        } => render_mentions(term, sender.as_deref(), counts, names),
        Answer::Clarify(reason) => render_clarify(*reason).to_string(),
        Answer::Error(err) => render_error(err),
    }
}

pub fn render_quote(hit: &SearchHit, names: &AliasResolver) -> String {
    format!(
        "📅 {} | {}\n\"{}\"",
        format_date(hit.start_time),
        names.display_name(&hit.primary_sender),
        truncate(&hit.text, MAX_QUOTE_CHARS)
    )
}

fn render_quotes(fields: &QueryFields, page: &SearchPage, names: &AliasResolver) -> String {
    let mut header = format!("🔍 «{}»", fields.topic.as_deref().unwrap_or(""));
    if let Some(identity) = &fields.identity {
        header.push_str(&format!(" · {}", names.display_name(identity)));
    }
    if let Some(range) = &fields.date_range {
        header.push_str(&format!(" · {}", describe_range(range)));
    }
    match fields.sort {
        SortOrder::Oldest => header.push_str(" · старі спочатку"),
        SortOrder::Newest => header.push_str(" · нові спочатку"),
        SortOrder::Relevance => {}
    }

    if page.total == 0 {
        return format!("{}\n\nНічого не знайдено.", header);
    }
    if page.hits.is_empty() {
        return format!("{}\n\nБільше результатів немає.", header);
    }

    let mut lines = vec![header, format!("Знайдено: {}", page.total), RULE.to_string()];
    for hit in &page.hits {
        lines.push(String::new());
        lines.push(render_quote(hit, names));
    }

    let per_page = page.hits.len().max(1);
    let pages = if page.next_cursor.is_some() {
        let shown = (page.page - 1) * per_page + page.hits.len();
        page.page + page.total.saturating_sub(shown).div_ceil(per_page)
    } else {
        page.page
    };
    lines.push(String::new());
    lines.push(format!("[сторінка {}/{}]", page.page, pages.max(page.page)));
    if page.next_cursor.is_some() {
        lines.push("Відповідай «покажи ще» (more), щоб побачити наступні.".to_string());
    }
    lines.join("\n")
}

fn render_flip(name: &str, topic: &str, outcome: &FlipOutcome) -> String {
    let mut lines = vec![format!("🔄 {} про «{}»", name, topic), RULE.to_string(), String::new()];
    match outcome {
        FlipOutcome::Flip(flip) => {
            lines.push(format!(
                "⚠️ Позиція змінилась: {} → {} (впевненість {}%)",
                stance_label(flip.stance_before),
                stance_label(flip.stance_after),
                (flip.confidence * 100.0).round() as i64
            ));
            lines.push(String::new());
            lines.push(format!("Раніше ({} цитат):", flip.early_quotes));
            lines.push(quote_line(&flip.before, name));
            lines.push(String::new());
            lines.push(format!("Пізніше ({} цитат):", flip.late_quotes));
            lines.push(quote_line(&flip.after, name));
        }
        FlipOutcome::NoFlip {
            reason,
            quotes,
            stance_before,
            stance_after,
        } => lines.push(match reason {
            NoFlipReason::NoQuotes => format!("❌ Не знайдено повідомлень від {} про «{}».", name, topic),
            NoFlipReason::InsufficientEvidence => format!(
                "Замало повідомлень, щоб судити про зміну позиції (знайдено {}).",
                quotes
            ),
            NoFlipReason::UnclearStance => format!(
                "Позиція неоднозначна: раніше {}, пізніше {}.",
                stance_label(*stance_before),
                stance_label(*stance_after)
            ),
            NoFlipReason::Stable => format!(
                "✅ Позиція не змінилась: {} ({} цитат).",
                stance_label(*stance_after),
                quotes
            ),
        }),
    }
    lines.join("\n")
}

fn quote_line(hit: &SearchHit, name: &str) -> String {
    format!(
        "📅 {} | {}\n\"{}\"",
        format_date(hit.start_time),
        name,
        truncate(&hit.text, MAX_QUOTE_CHARS)
    )
}

fn render_context(target: i64, messages: &[Message], names: &AliasResolver) -> String {
    let mut lines = vec![format!("💬 Контекст повідомлення #{}", target), RULE.to_string()];
    for msg in messages {
        let marker = if msg.id == target { "▶️" } else { "  " };
        let name = names
            .identity(&msg.sender_identity)
            .map(|i| i.display_name)
            .unwrap_or_else(|| msg.sender_name.clone());
        lines.push(String::new());
        lines.push(format!("{} 📅 {} | {}", marker, format_date(msg.timestamp), name));
        lines.push(format!("   \"{}\"", truncate(&msg.raw_text, MAX_QUOTE_CHARS)));
    }
    lines.join("\n")
}

pub fn render_top_speakers(
    range: Option<&DateRange>,
    counts: &[SpeakerCount],
    names: &AliasResolver,
) -> String {
    if counts.is_empty() {
        return "Не знайдено повідомлень для аналізу.".to_string();
    }
    let mut header = "🏆 Найактивніші учасники".to_string();
    if let Some(range) = range.filter(|r| !r.is_open()) {
        header.push_str(&format!(" · {}", describe_range(range)));
    }
    let mut lines = vec![format!("{}:", header), String::new()];
    const MEDALS: [&str; 3] = ["🥇", "🥈", "🥉"];
    for (i, row) in counts.iter().enumerate() {
        let place = MEDALS
            .get(i)
            .map(|m| m.to_string())
            .unwrap_or_else(|| format!("{}.", i + 1));
        lines.push(format!(
            "{} 👤 {} — {} повідомлень",
            place,
            names.display_name(&row.identity_id),
            row.count
        ));
    }
    lines.join("\n")
}

pub fn render_mentions(
    term: &str,
    sender: Option<&str>,
    counts: &[SpeakerCount],
    names: &AliasResolver,
) -> String {
    if let Some(sender) = sender {
        let name = names.display_name(sender);
        let n = counts.iter().map(|r| r.count).sum::<u64>();
        return if n == 0 {
            format!("{} не згадував «{}».", name, term)
        } else {
            format!("📊 {} згадував «{}» {} {}.", name, term, n, times_word(n))
        };
    }
    if counts.is_empty() {
        return format!("Ніхто не згадував «{}».", term);
    }
    let mut lines = vec![format!("📊 Хто згадував «{}»:", term), String::new()];
    for (i, row) in counts.iter().enumerate() {
        lines.push(format!(
            "{}. 👤 {} — {} {}",
            i + 1,
            names.display_name(&row.identity_id),
            row.count,
            times_word(row.count)
        ));
    }
    lines.join("\n")
}

pub fn render_clarify(reason: ClarifyReason) -> &'static str {
    match reason {
        ClarifyReason::NothingToContinue => "Немає попереднього пошуку, який можна продовжити. Постав питання.",
        ClarifyReason::MissingTopic => "Про що саме шукати? Уточни тему.",
        ClarifyReason::MissingIdentity => "Чию позицію перевірити? Назви людину.",
        ClarifyReason::Unclear => {
            "❓ Не зрозумів питання. Наприклад: «що гусь казав про крипту до 2022?»"
        }
    }
}

pub fn render_error(err: &RecallError) -> String {
    match err {
        RecallError::MalformedInput(detail) => format!("❌ Некоректний запит: {}", detail),
        RecallError::Provider(ProviderError::Transient(_)) => {
            "⏳ Сервіс тимчасово недоступний, спробуй пізніше.".to_string()
        }
        RecallError::Provider(ProviderError::Permanent(detail)) => {
            format!("❌ Помилка провайдера: {}", detail)
        }
        RecallError::Conflict { nickname, bound_to } => {
            format!("❌ Нікнейм «{}» вже належить {}.", nickname, bound_to)
        }
        RecallError::NotFound {
            what: "identity",
            key,
            suggestions,
        } => {
            if suggestions.is_empty() {
                format!("❓ Не знаю, хто такий «{}».", key)
            } else {
                format!("❓ Не знаю, хто такий «{}». Можливо: {}?", key, suggestions.join(", "))
            }
        }
        RecallError::NotFound {
            what: "message",
            key,
            ..
        } => format!("❌ Повідомлення #{} не знайдено.", key),
        RecallError::NotFound { what, key, .. } => format!("❌ Не знайдено ({}): {}", what, key),
        RecallError::AmbiguousIntent(_) => render_clarify(ClarifyReason::Unclear).to_string(),
        RecallError::IndexBusy => "⏳ Іде повна переіндексація, спробуй трохи пізніше.".to_string(),
    }
}

pub fn stance_label(stance: Stance) -> &'static str {
    match stance {
        Stance::Positive => "позитивна",
        Stance::Negative => "негативна",
        Stance::Neutral => "нейтральна",
        Stance::Unknown => "невідома",
    }
}

fn describe_range(range: &DateRange) -> String {
    match (range.from, range.to) {
        (Some(from), Some(to)) => format!("{} – {}", format_date(from), format_date(to)),
        (Some(from), None) => format!("з {}", format_date(from)),
        (None, Some(to)) => format!("до {}", format_date(to)),
        (None, None) => "увесь час".to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_recall_core::search::Cursor;
    use chrono::{TimeZone, Utc};

    fn hit(rank: usize, sender: &str, text: &str) -> SearchHit {
        let at = Utc.with_ymd_and_hms(2021, 3, 14, 12, 0, 0).unwrap();
        SearchHit {
            rank,
            chunk_id: format!("c{}", rank),
            message_ids: vec![rank as i64],
            text: text.to_string(),
            primary_sender: sender.to_string(),
            start_time: at,
            end_time: at,
            forwarded: false,
            similarity: 0.9,
            score: 0.9,
        }
    }

    fn names() -> AliasResolver {
        let r = AliasResolver::new();
        r.observe_sender("user1", "Alice");
        r
    }

    #[test]
    fn test_quote_line_shape() {
        let out = render_quote(&hit(0, "user1", "crypto is the future"), &names());
        assert_eq!(out, "📅 2021-03-14 | Alice\n\"crypto is the future\"");
    }

    #[test]
    fn test_page_footer_offers_more() {
        let page = SearchPage {
            hits: vec![hit(0, "user1", "a"), hit(1, "user1", "b")],
            next_cursor: Some(Cursor { offset: 2 }),
            total: 5,
            page: 1,
        };
        let fields = QueryFields {
            topic: Some("crypto".into()),
            identity: Some("user1".into()),
            ..QueryFields::default()
        };
        let out = render_quotes(&fields, &page, &names());
        assert!(out.starts_with("🔍 «crypto» · Alice"));
        assert!(out.contains("Знайдено: 5"));
        assert!(out.contains("[сторінка 1/3]"));
        assert!(out.contains("покажи ще"));
    }

    #[test]
    fn test_empty_and_exhausted_pages() {
        let fields = QueryFields {
            topic: Some("x".into()),
            ..QueryFields::default()
        };
        let empty = SearchPage {
            hits: vec![],
            next_cursor: None,
            total: 0,
            page: 1,
        };
        assert!(render_quotes(&fields, &empty, &names()).ends_with("Нічого не знайдено."));
        let done = SearchPage {
            total: 3,
            page: 2,
            ..empty
        };
        assert!(render_quotes(&fields, &done, &names()).ends_with("Більше результатів немає."));
    }

    #[test]
    fn test_errors_render_for_users() {
        let err = RecallError::NotFound {
            what: "identity",
            key: "гуска".into(),
            suggestions: vec!["гусь".into()],
        };
        assert_eq!(render_error(&err), "❓ Не знаю, хто такий «гуска». Можливо: гусь?");
        assert!(render_error(&RecallError::IndexBusy).contains("переіндексація"));
    }

    #[test]
    fn test_counting_answers() {
        let counts = vec![
            SpeakerCount { identity_id: "user1".into(), count: 12 },
            SpeakerCount { identity_id: "user2".into(), count: 3 },
        ];
        let top = render_top_speakers(None, &counts, &names());
        assert!(top.starts_with("🏆 Найактивніші учасники:"));
        assert!(top.contains("🥇 👤 Alice — 12 повідомлень"));
        assert!(top.contains("🥈 👤 user2 — 3 повідомлень"));

        let mentions = render_mentions("крипту", None, &counts, &names());
        assert!(mentions.contains("1. 👤 Alice — 12 разів"));
        assert!(mentions.contains("2. 👤 user2 — 3 рази"));

        let own = render_mentions("крипту", Some("user1"), &counts[..1], &names());
        assert_eq!(own, "📊 Alice згадував «крипту» 12 разів.");
        assert_eq!(render_mentions("x", None, &[], &names()), "Ніхто не згадував «x».");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("привіт", 3), "при...");
        assert_eq!(truncate("hi", 3), "hi");
    }
}
