//! Heuristic question parser.
//!
//! Turns free text like `"що @alice казала про крипту до 2022?"` into a
//! [`ParsedQuestion`]: target identity, topic words, date range, sort
//! order, and an [`Intent`].
//!
//! # Rules
//!
//! - Flip language ("changed his mind", "міняв думку", "передумав", …)
//!   routes to [`Intent::DetectFlip`].
//! - A `#123` token, a question that is only a number, or a bare number
//!   that is not a year is a message id and routes to
//!   [`Intent::ShowContext`]. `#2021` is message 2021, never a year.
//! - Years are dates: "до 2022" is before 2022-01-01, "після 2023" is from
//!   2023-01-01, "в 2021 році" and a bare "2021" inside a question are that year,
//!   "з 2020 по 2022" is both years inclusive. ISO dates work in place of
//!   years.
//! - `@mentions` resolve through the [`AliasResolver`] (partial matches
//!   allowed); other tokens only match exactly, then by inflection.
//! - "хто найактивніший" / "who writes the most" routes to
//!   [`Intent::TopSpeakers`]; "скільки разів згадували X" / "how often"
//!   and "who writes most about X" route to [`Intent::MentionCount`].
//! - "покажи ще" / "more" with nothing else is a show-more follow-up.
//! - With nothing to search for, the intent is [`Intent::Ambiguous`].
//!
//! The parser never fails. Unresolvable mentions come back in
//! [`ParsedQuestion::unresolved_mention`] so the caller can ask for
//! clarification.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::Serialize;

use crate::alias::AliasResolver;
use crate::models::{DateRange, SortOrder};

/// What the user wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    FindQuotes,
    DetectFlip,
    ShowContext,
    /// Who writes the most.
    TopSpeakers,
    /// Who mentions a term, and how often.
    MentionCount,
    Ambiguous,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::FindQuotes => "find_quotes",
            Intent::DetectFlip => "detect_flip",
            Intent::ShowContext => "show_context",
            Intent::TopSpeakers => "top_speakers",
            Intent::MentionCount => "mention_count",
            Intent::Ambiguous => "ambiguous",
        }
    }
}

/// Structured reading of one inbound message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedQuestion {
    pub intent: Intent,
    pub identity: Option<String>,
    /// A name the user clearly meant (an `@mention`) that did not resolve.
    pub unresolved_mention: Option<String>,
    pub topic: Option<String>,
    pub date_range: Option<DateRange>,
    /// `None` when the text did not ask for an order.
    pub sort: Option<SortOrder>,
    pub message_id: Option<i64>,
    /// "show more" follow-up with nothing else in it.
    pub wants_more: bool,
}

impl ParsedQuestion {
    /// True when the text carried any search field of its own.
    pub fn has_search_fields(&self) -> bool {
        self.identity.is_some()
            || self.topic.is_some()
            || self.date_range.is_some()
            || self.unresolved_mention.is_some()
    }
}

const FLIP_PHRASES: &[&str] = &[
    "changed his mind",
    "changed her mind",
    "changed their mind",
    "change his mind",
    "change her mind",
    "change their mind",
    "changed his opinion",
    "changed her opinion",
    "used to think",
    "flip-flop",
    "flipped",
    "flip on",
    "міняв думку",
    "міняла думку",
    "змінив думку",
    "змінила думку",
    "змінив свою думку",
    "змінила свою думку",
    "змінював думку",
    "змінювала думку",
    "поміняв думку",
    "поміняла думку",
    "передумав",
    "передумала",
    "переобувся",
    "переобулась",
    "переобулася",
    "раніше думав",
    "раніше думала",
    "менял мнение",
    "поменял мнение",
    "изменил мнение",
    "передумал",
    "переобулся",
    "раньше думал",
];

const TOP_SPEAKER_PHRASES: &[&str] = &[
    "найактивніш",
    "більше пише",
    "більше всіх пише",
    "найбільше пише",
    "частіше пише",
    "більше пишуть",
    "більше говорить",
    "самый активный",
    "самая активная",
    "больше пишет",
    "больше всех пишет",
    "most active",
    "talks the most",
    "talks most",
    "talks more",
    "writes the most",
    "writes most",
    "writes more",
];

const MENTION_PHRASES: &[&str] = &[
    "скільки раз",
    "як часто",
    "згадував",
    "згадувала",
    "згадували",
    "згадує",
    "сколько раз",
    "как часто",
    "упоминал",
    "how many times",
    "how often",
    "mentioned",
];

const MORE_PHRASES: &[&str] = &[
    "ще",
    "більше",
    "more",
    "show more",
    "покажи ще",
    "покажи більше",
    "ще цитати",
    "далі",
    "next",
    "ещё",
    "еще",
    "дальше",
    "покажи ещё",
    "покажи еще",
];

const OLDEST_PHRASES: &[&str] = &[
    "старі спочатку",
    "спочатку старі",
    "від старих",
    "хронологічно",
    "oldest first",
    "старые сначала",
];

const NEWEST_PHRASES: &[&str] = &[
    "нові спочатку",
    "спочатку нові",
    "від нових",
    "newest first",
    "latest first",
    "новые сначала",
];

const BEFORE_WORDS: &[&str] = &["до", "before", "until", "till", "раньше"];
const AFTER_WORDS: &[&str] = &["після", "after", "since", "после", "від", "с", "з", "із"];
const IN_WORDS: &[&str] = &["в", "у", "in", "during", "за"];
const RANGE_START_WORDS: &[&str] = &["з", "із", "від", "from", "between", "між", "с", "от"];
const RANGE_JOIN_WORDS: &[&str] = &["по", "до", "to", "and", "і", "й", "та", "-", "till", "until"];
const YEAR_SUFFIX_WORDS: &[&str] = &["році", "року", "рік", "году", "год", "year"];

const STOPWORDS: &[&str] = &[
    // uk
    "що", "чи", "про", "як", "коли", "де", "хто", "який", "яка", "яке", "які", "казав",
    "казала", "казали", "каже", "говорив", "говорила", "говорили", "писав", "писала",
    "писали", "думає", "думав", "думала", "думали", "думку", "думки", "думка", "мені",
    "покажи", "знайди", "цитати", "цитату", "цитата", "цитат", "і", "й", "та", "а", "в",
    "у", "на", "з", "із", "зі", "до", "після", "по", "від", "це", "ця", "цей", "ще", "більше",
    "він", "вона", "вони", "його", "її", "їх", "все", "всі", "раніше", "зараз", "тепер",
    "там", "тут", "так", "ні", "не", "бо", "за", "над", "під", "для", "усе", "взагалі",
    "чат", "чаті", "нам", "нас", "ну", "ось", "от", "ж", "же", "б", "би", "хоч", "хтось",
    "щось", "когось", "свою", "своє", "свої", "міняв", "міняла", "змінив", "змінила",
    "змінював", "змінювала", "поміняв", "поміняла", "передумав", "передумала",
    "переобувся", "переобулась", "переобулася", "старі", "нові", "спочатку", "хронологічно",
    "старих", "нових", "році", "року", "рік", "між", "далі", "контекст", "контексті",
    "скільки", "раз", "рази", "разів", "часто", "згадував", "згадувала", "згадували",
    "згадує", "згадують", "пише", "пишуть", "найбільше", "частіше", "всіх", "найактивніший",
    "найактивніша", "найактивніші", "говорить",
    // ru
    "что", "о", "об", "как", "кто", "говорил", "говорила", "писал", "писала", "думает",
    "думал", "мнение", "найди", "цитаты", "и", "с", "после", "это", "он", "она", "они",
    "ее", "её", "ещё", "еще", "больше", "менял", "поменял", "изменил", "передумал",
    "переобулся", "раньше", "году", "год", "сначала", "старые", "новые", "дальше", "от",
    "сколько", "упоминал", "упоминала", "упоминали", "часто", "пишет", "всех", "самый",
    "самая", "активный", "активная",
    // en
    "what", "did", "does", "do", "say", "said", "says", "about", "the", "a", "an", "of",
    "on", "in", "is", "was", "were", "are", "to", "and", "or", "for", "when", "how", "who",
    "think", "thinks", "thought", "show", "me", "find", "quotes", "quote", "his", "her",
    "their", "he", "she", "they", "ever", "more", "has", "have", "had", "mind", "changed",
    "change", "used", "opinion", "at", "any", "anything", "tell", "us", "before", "after",
    "since", "until", "till", "from", "between", "first", "oldest", "newest", "latest",
    "flip", "flipped", "flop", "during", "year", "next", "whether", "where", "i",
    "it", "that", "this", "with", "context", "many", "times", "often", "mentioned",
    "mention", "mentions", "most", "active", "talks", "writes",
];

#[derive(Debug)]
struct Tok {
    text: String,
    mention: bool,
    hashed: bool,
    consumed: bool,
}

fn tokenize(text: &str) -> Vec<Tok> {
    let mut toks = Vec::new();
    for raw in text.split_whitespace() {
        let mention = raw.starts_with('@');
        let hashed = raw.starts_with('#');
        let cleaned: String = raw
            .trim_matches(|c: char| !(c.is_alphanumeric() || c == '-' || c == '\'' || c == '’'))
            .trim_matches(|c: char| c == '-' || c == '\'' || c == '’')
            .to_lowercase();
        if cleaned.is_empty() {
            if raw == "-" {
                toks.push(Tok {
                    text: "-".into(),
                    mention: false,
                    hashed: false,
                    consumed: false,
                });
            }
            continue;
        }
        toks.push(Tok {
            text: cleaned,
            mention,
            hashed,
            consumed: false,
        });
    }
    toks
}

/// A parsed date token: `[start, end)` of the year or day it names.
fn parse_date_token(tok: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    if tok.len() == 4 && tok.chars().all(|c| c.is_ascii_digit()) {
        let year: i32 = tok.parse().ok()?;
        if !(1990..=2100).contains(&year) {
            return None;
        }
        return Some((year_start(year)?, year_start(year + 1)?));
    }
    let date = NaiveDate::parse_from_str(tok, "%Y-%m-%d").ok()?;
    let start = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?);
    let end = Utc.from_utc_datetime(&date.succ_opt()?.and_hms_opt(0, 0, 0)?);
    Some((start, end))
}

fn year_start(year: i32) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).single()
}

/// "2020-2022" as one token.
fn parse_year_span(tok: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let (a, b) = tok.split_once('-')?;
    if a.len() != 4 || b.len() != 4 {
        return None;
    }
    let (from, _) = parse_date_token(a)?;
    let (_, to) = parse_date_token(b)?;
    Some((from, to))
}

fn intersect(acc: Option<DateRange>, next: DateRange) -> Option<DateRange> {
    let Some(acc) = acc else {
        return Some(next);
    };
    let from = match (acc.from, next.from) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    let to = match (acc.to, next.to) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    Some(DateRange { from, to })
}

fn contains_phrase(haystack: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|p| haystack.contains(p))
}

/// Heuristic question parser.
#[derive(Debug, Clone, Default)]
pub struct QuestionParser {
    /// Mentions of these names (the bot itself) are ignored.
    ignore_mentions: Vec<String>,
}

impl QuestionParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ignored_mentions<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            ignore_mentions: names
                .into_iter()
                .map(|n| n.as_ref().trim_start_matches('@').to_lowercase())
                .collect(),
        }
    }

    pub fn parse(&self, text: &str, aliases: &AliasResolver) -> ParsedQuestion {
        let lowered = text.to_lowercase();
        let flat = lowered
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let bare = flat
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_string();

        let mut toks = tokenize(text);

        // Ignored mentions first so they never become names or topic.
        for tok in toks.iter_mut().filter(|t| t.mention) {
            if self.ignore_mentions.contains(&tok.text) {
                tok.consumed = true;
            }
        }

        let sort = if contains_phrase(&flat, OLDEST_PHRASES) {
            Some(SortOrder::Oldest)
        } else if contains_phrase(&flat, NEWEST_PHRASES) {
            Some(SortOrder::Newest)
        } else {
            None
        };

        let is_flip = contains_phrase(&flat, FLIP_PHRASES);
        let lone_number = toks.len() == 1 && is_number(&toks[0].text);
        let date_range = if lone_number {
            None
        } else {
            extract_dates(&mut toks)
        };

        // Message id: `#N` first, then a bare number that is not a date.
        let mut message_id = None;
        for hashed in [true, false] {
            for tok in toks
                .iter_mut()
                .filter(|t| !t.consumed && t.hashed == hashed && is_number(&t.text))
            {
                if let Ok(id) = tok.text.parse::<i64>() {
                    if message_id.is_none() {
                        message_id = Some(id);
                    }
                    tok.consumed = true;
                }
            }
        }

        let (identity, unresolved_mention) = extract_identity(&mut toks, aliases);

        let topic_words: Vec<&str> = toks
            .iter()
            .filter(|t| !t.consumed && !t.mention && !t.hashed)
            .map(|t| t.text.as_str())
            .filter(|w| *w != "-" && !STOPWORDS.contains(w))
            .collect();
        let topic = (!topic_words.is_empty()).then(|| topic_words.join(" "));

        let counts_mentions = contains_phrase(&flat, MENTION_PHRASES);
        let counts_speakers = contains_phrase(&flat, TOP_SPEAKER_PHRASES);

        let wants_more = !counts_mentions
            && !counts_speakers
            && (MORE_PHRASES.contains(&bare.as_str())
                || (identity.is_none()
                && topic.is_none()
                && date_range.is_none()
                && message_id.is_none()
                && unresolved_mention.is_none()
                && !is_flip
                && MORE_PHRASES.iter().any(|p| flat.contains(p))));

        let intent = if is_flip {
            Intent::DetectFlip
        } else if message_id.is_some() {
            Intent::ShowContext
        } else if counts_mentions || (counts_speakers && topic.is_some()) {
            // "who writes most about X" ranks senders by mentions of X.
            Intent::MentionCount
        } else if counts_speakers {
            Intent::TopSpeakers
        } else if wants_more
            || identity.is_some()
            || topic.is_some()
            || date_range.is_some()
            || unresolved_mention.is_some()
            || sort.is_some()
        {
            Intent::FindQuotes
        } else {
            Intent::Ambiguous
        };

        ParsedQuestion {
            intent,
            identity,
            unresolved_mention,
            topic,
            date_range,
            sort,
            message_id,
            wants_more,
        }
    }
}

fn is_number(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c.is_ascii_digit())
}

/// Years, days and spans. `#N` tokens are message references and skipped.
fn extract_dates(toks: &mut [Tok]) -> Option<DateRange> {
    let mut range: Option<DateRange> = None;
    let n = toks.len();
    let mut i = 0;
    while i < n {
        if toks[i].consumed || toks[i].hashed {
            i += 1;
            continue;
        }

        // "2020-2022"
        if let Some((from, to)) = parse_year_span(&toks[i].text) {
            toks[i].consumed = true;
            if i > 0 && RANGE_START_WORDS.contains(&toks[i - 1].text.as_str()) {
                toks[i - 1].consumed = true;
            }
            range = intersect(
                range,
                DateRange {
                    from: Some(from),
                    to: Some(to),
                },
            );
            i += 1;
            continue;
        }

        let Some((start, end)) = parse_date_token(&toks[i].text) else {
            i += 1;
            continue;
        };
        let prev = (i > 0 && !toks[i - 1].consumed).then(|| toks[i - 1].text.clone());
        let prev = prev.as_deref();
        toks[i].consumed = true;

        // "з 2020 по 2022"
        if i + 2 < n
            && !toks[i + 2].hashed
            && RANGE_JOIN_WORDS.contains(&toks[i + 1].text.as_str())
        {
            if let Some((_, end2)) = parse_date_token(&toks[i + 2].text) {
                let starts_range = prev.map_or(false, |p| RANGE_START_WORDS.contains(&p));
                let bare_pair = toks[i + 1].text == "-";
                if starts_range || bare_pair {
                    if starts_range {
                        toks[i - 1].consumed = true;
                    }
                    toks[i + 1].consumed = true;
                    toks[i + 2].consumed = true;
                    range = intersect(
                        range,
                        DateRange {
                            from: Some(start),
                            to: Some(end2),
                        },
                    );
                    i += 3;
                    continue;
                }
            }
        }

        let next = match prev {
            Some(p) if BEFORE_WORDS.contains(&p) => DateRange {
                from: None,
                to: Some(start),
            },
            Some(p) if AFTER_WORDS.contains(&p) => DateRange {
                from: Some(start),
                to: None,
            },
            _ => DateRange {
                from: Some(start),
                to: Some(end),
            },
        };
        if let Some(p) = prev {
            if BEFORE_WORDS.contains(&p) || AFTER_WORDS.contains(&p) || IN_WORDS.contains(&p) {
                toks[i - 1].consumed = true;
            }
        }
        if i + 1 < n && YEAR_SUFFIX_WORDS.contains(&toks[i + 1].text.as_str()) {
            toks[i + 1].consumed = true;
        }
        range = intersect(range, next);
        i += 1;
    }
    range
}

fn extract_identity(toks: &mut [Tok], aliases: &AliasResolver) -> (Option<String>, Option<String>) {
    let mut identity: Option<String> = None;
    let mut unresolved: Option<String> = None;

    // Explicit @mentions win.
    for tok in toks.iter_mut().filter(|t| t.mention && !t.consumed) {
        tok.consumed = true;
        match aliases.resolve(&tok.text) {
            Ok(id) => {
                if identity.is_none() {
                    identity = Some(id);
                }
            }
            Err(_) => {
                if unresolved.is_none() {
                    unresolved = Some(tok.text.clone());
                }
            }
        }
    }
    if identity.is_some() {
        return (identity, None);
    }

    // Two-word display names ("bob marley").
    let n = toks.len();
    for i in 0..n.saturating_sub(1) {
        if toks[i].consumed || toks[i + 1].consumed {
            continue;
        }
        let pair = format!("{} {}", toks[i].text, toks[i + 1].text);
        if let Some(id) = aliases.lookup_exact(&pair) {
            toks[i].consumed = true;
            toks[i + 1].consumed = true;
            return (Some(id), unresolved);
        }
    }

    for tok in toks.iter_mut().filter(|t| !t.consumed) {
        if STOPWORDS.contains(&tok.text.as_str()) {
            continue;
        }
        if let Some(id) = aliases.lookup_exact(&tok.text) {
            tok.consumed = true;
            return (Some(id), unresolved);
        }
    }
    for tok in toks.iter_mut().filter(|t| !t.consumed) {
        if STOPWORDS.contains(&tok.text.as_str()) {
            continue;
        }
        if let Some(id) = aliases.lookup_inflected(&tok.text) {
            tok.consumed = true;
            return (Some(id), unresolved);
        }
    }

    (None, unresolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> AliasResolver {
        let r = AliasResolver::new();
        r.observe_sender("user1", "Alice");
        r.observe_sender("user2", "Bob Marley");
        r.add_alias("user1", "гусь").unwrap();
        r
    }

    fn ymd(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_mention_topic_and_before_year() {
        let p = QuestionParser::new().parse("Що @alice казала про крипту до 2022?", &resolver());
        assert_eq!(p.intent, Intent::FindQuotes);
        assert_eq!(p.identity.as_deref(), Some("user1"));
        assert_eq!(p.topic.as_deref(), Some("крипту"));
        assert_eq!(
            p.date_range,
            Some(DateRange {
                from: None,
                to: Some(ymd(2022, 1, 1))
            })
        );
    }

    #[test]
    fn test_after_year() {
        let p = QuestionParser::new().parse("що гусь писав про біткоїн після 2023", &resolver());
        assert_eq!(p.identity.as_deref(), Some("user1"));
        assert_eq!(p.topic.as_deref(), Some("біткоїн"));
        assert_eq!(
            p.date_range,
            Some(DateRange {
                from: Some(ymd(2023, 1, 1)),
                to: None
            })
        );
    }

    #[test]
    fn test_in_year_and_ranges() {
        let r = resolver();
        let parser = QuestionParser::new();
        let p = parser.parse("crypto в 2021 році", &r);
        assert_eq!(
            p.date_range,
            Some(DateRange {
                from: Some(ymd(2021, 1, 1)),
                to: Some(ymd(2022, 1, 1))
            })
        );
        assert_eq!(p.topic.as_deref(), Some("crypto"));

        let p = parser.parse("crypto з 2020 по 2022", &r);
        assert_eq!(
            p.date_range,
            Some(DateRange {
                from: Some(ymd(2020, 1, 1)),
                to: Some(ymd(2023, 1, 1))
            })
        );

        let p = parser.parse("crypto 2019-2020", &r);
        assert_eq!(
            p.date_range,
            Some(DateRange {
                from: Some(ymd(2019, 1, 1)),
                to: Some(ymd(2021, 1, 1))
            })
        );
    }

    #[test]
    fn test_iso_date_before() {
        let p = QuestionParser::new().parse("alice crypto before 2022-03-01", &resolver());
        assert_eq!(
            p.date_range,
            Some(DateRange {
                from: None,
                to: Some(ymd(2022, 3, 1))
            })
        );
    }

    #[test]
    fn test_flip_language_routes_to_detect_flip() {
        let r = resolver();
        let parser = QuestionParser::new();
        let p = parser.parse("коли гусь міняв думку про крипту?", &r);
        assert_eq!(p.intent, Intent::DetectFlip);
        assert_eq!(p.identity.as_deref(), Some("user1"));
        assert_eq!(p.topic.as_deref(), Some("крипту"));

        let p = parser.parse("Has Alice changed her mind about crypto?", &r);
        assert_eq!(p.intent, Intent::DetectFlip);
        assert_eq!(p.identity.as_deref(), Some("user1"));
        assert_eq!(p.topic.as_deref(), Some("crypto"));
    }

    #[test]
    fn test_bare_number_is_show_context() {
        let r = resolver();
        let p = QuestionParser::new().parse("12345", &r);
        assert_eq!(p.intent, Intent::ShowContext);
        assert_eq!(p.message_id, Some(12345));

        let p = QuestionParser::new().parse("покажи контекст #77", &r);
        assert_eq!(p.intent, Intent::ShowContext);
        assert_eq!(p.message_id, Some(77));
    }

    #[test]
    fn test_hashed_year_like_number_is_a_message() {
        let r = resolver();
        let parser = QuestionParser::new();

        let p = parser.parse("покажи контекст #2021", &r);
        assert_eq!(p.intent, Intent::ShowContext);
        assert_eq!(p.message_id, Some(2021));
        assert_eq!(p.date_range, None);

        let p = parser.parse("2021", &r);
        assert_eq!(p.intent, Intent::ShowContext);
        assert_eq!(p.message_id, Some(2021));
        assert_eq!(p.date_range, None);

        // Inside a question a year is still a year.
        let p = parser.parse("crypto 2021", &r);
        assert_eq!(p.intent, Intent::FindQuotes);
        assert_eq!(p.message_id, None);
        assert!(p.date_range.is_some());
    }

    #[test]
    fn test_counting_questions() {
        let r = resolver();
        let parser = QuestionParser::new();

        for text in ["Хто найактивніший у чаті?", "who writes the most?", "хто більше пише"] {
            let p = parser.parse(text, &r);
            assert_eq!(p.intent, Intent::TopSpeakers, "{}", text);
            assert!(!p.wants_more, "{}", text);
            assert_eq!(p.topic, None, "{}", text);
        }

        let p = parser.parse("хто найактивніший у 2022 році", &r);
        assert_eq!(p.intent, Intent::TopSpeakers);
        assert_eq!(p.date_range.and_then(|d| d.from), Some(ymd(2022, 1, 1)));

        let p = parser.parse("скільки разів згадували крипту?", &r);
        assert_eq!(p.intent, Intent::MentionCount);
        assert_eq!(p.topic.as_deref(), Some("крипту"));

        let p = parser.parse("скільки разів згадували гуся?", &r);
        assert_eq!(p.intent, Intent::MentionCount);
        assert_eq!(p.identity.as_deref(), Some("user1"));
        assert_eq!(p.topic, None);

        let p = parser.parse("who writes most about crypto", &r);
        assert_eq!(p.intent, Intent::MentionCount);
        assert_eq!(p.topic.as_deref(), Some("crypto"));
    }

    #[test]
    fn test_show_more() {
        let r = resolver();
        let parser = QuestionParser::new();
        for text in ["покажи ще", "ще", "More!", "ещё"] {
            let p = parser.parse(text, &r);
            assert!(p.wants_more, "{}", text);
            assert!(!p.has_search_fields(), "{}", text);
            assert_eq!(p.intent, Intent::FindQuotes);
        }
    }

    #[test]
    fn test_unresolved_mention_is_reported() {
        let p = QuestionParser::new().parse("@nobody crypto", &resolver());
        assert_eq!(p.identity, None);
        assert_eq!(p.unresolved_mention.as_deref(), Some("nobody"));
        assert_eq!(p.topic.as_deref(), Some("crypto"));
    }

    #[test]
    fn test_bot_mention_ignored() {
        let parser = QuestionParser::with_ignored_mentions(["@recall_bot"]);
        let p = parser.parse("@recall_bot що казав гусь?", &resolver());
        assert_eq!(p.identity.as_deref(), Some("user1"));
        assert_eq!(p.unresolved_mention, None);
        assert_eq!(p.topic, None);
    }

    #[test]
    fn test_nothing_to_search_is_ambiguous() {
        let r = resolver();
        assert_eq!(QuestionParser::new().parse("???", &r).intent, Intent::Ambiguous);
        assert_eq!(
            QuestionParser::new().parse("що про це", &r).intent,
            Intent::Ambiguous
        );
    }

    #[test]
    fn test_sort_order() {
        let r = resolver();
        let p = QuestionParser::new().parse("alice crypto старі спочатку", &r);
        assert_eq!(p.sort, Some(SortOrder::Oldest));
        assert_eq!(p.topic.as_deref(), Some("crypto"));
        let p = QuestionParser::new().parse("alice crypto newest first", &r);
        assert_eq!(p.sort, Some(SortOrder::Newest));
    }

    #[test]
    fn test_two_word_display_name_and_inflection() {
        let r = resolver();
        let p = QuestionParser::new().parse("what did bob marley say about music", &r);
        assert_eq!(p.identity.as_deref(), Some("user2"));
        assert_eq!(p.topic.as_deref(), Some("music"));

        let p = QuestionParser::new().parse("думка гуся про крипту", &r);
        assert_eq!(p.identity.as_deref(), Some("user1"));
    }
}
