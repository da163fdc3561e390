//! Operator commands that go through the [`Engine`]: `ask`, `chat`,
//! `search`, `flip`, `context`, `top`, `mentions`, and `alias`.
//!
//! Each `run_*` opens the engine from config, does one thing, and prints
//! plain text to stdout.

use anyhow::{Context, Result};
use chat_recall_core::models::{DateRange, SearchFilters};
use chat_recall_core::search::Cursor;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::Config;
use crate::engine::{Answer, Engine, SenderContext};
use crate::format;

/// Chat id used for questions asked from the command line.
pub const CLI_CHAT: &str = "cli";

pub async fn run_ask(
    config: &Config,
    text: &str,
    reply_to: Option<&str>,
    chat: Option<&str>,
) -> Result<()> {
    let engine = Engine::open(config).await?;
    let sender = SenderContext::new(chat.unwrap_or(CLI_CHAT));
    let reply = engine.handle_inbound(text, reply_to, &sender).await;
    println!("[{}]", reply.reply_ref);
    println!("{}", reply.text);
    Ok(())
}

/// Interactive loop standing in for a chat transport.
///
/// A line starting with `#REF ` replies to the answer tagged `[REF]`.
pub async fn run_chat(config: &Config) -> Result<()> {
    let engine = Engine::open(config).await?;
    eprintln!("chat-recall: ask a question, reply with `#REF text`, Ctrl-D to quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut seq = 0u64;
    while let Some(line) = lines.next_line().await? {
        let (reply_to, text) = split_reply(&line);
        if text.is_empty() {
            continue;
        }
        seq += 1;
        let sender = SenderContext::new(CLI_CHAT).with_message_ref(format!("q{}", seq));
        let reply = engine.handle_inbound(text, reply_to, &sender).await;
        println!("[{}]", reply.reply_ref);
        println!("{}\n", reply.text);
    }
    Ok(())
}

fn split_reply(line: &str) -> (Option<&str>, &str) {
    let line = line.trim();
    match line.strip_prefix('#') {
        Some(rest) => match rest.split_once(char::is_whitespace) {
            Some((reference, text)) => (Some(reference), text.trim()),
            None => (Some(rest), ""),
        },
        None => (None, line),
    }
}

pub async fn run_search(
    config: &Config,
    query: &str,
    author: Option<&str>,
    since: Option<&str>,
    until: Option<&str>,
    cursor: Option<&str>,
) -> Result<()> {
    let engine = Engine::open(config).await?;

    let identity = match author {
        Some(who) => Some(engine.aliases().resolve(who)?),
        None => None,
    };
    let filters = SearchFilters {
        identity,
        date_range: day_range(since, until)?,
        ..SearchFilters::default()
    };
    let cursor = cursor
        .map(|c| c.parse::<Cursor>().map_err(anyhow::Error::msg))
        .transpose()?;

    let page = engine.search(query, &filters, cursor).await?;
    if page.hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for hit in &page.hits {
        println!(
            "{}. [{:.2}] chunk {} (messages {:?})",
            hit.rank + 1,
            hit.score,
            hit.chunk_id,
            hit.message_ids
        );
        println!("{}\n", format::render_quote(hit, engine.aliases()));
    }
    println!("page {} · {} total", page.page, page.total);
    if let Some(next) = page.next_cursor {
        println!("next: --cursor {}", next);
    }
    Ok(())
}

fn day_range(since: Option<&str>, until: Option<&str>) -> Result<Option<DateRange>> {
    let from = since.map(|s| parse_day(s, "--since")).transpose()?;
    let to = until.map(|s| parse_day(s, "--until")).transpose()?;
    Ok((from.is_some() || to.is_some()).then_some(DateRange { from, to }))
}

/// `--until 2022-01-01` includes that whole day.
fn parse_day(s: &str, flag: &str) -> Result<DateTime<Utc>> {
    let day = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("{} must be YYYY-MM-DD, got '{}'", flag, s))?;
    let day = if flag == "--until" {
        day.succ_opt().unwrap_or(day)
    } else {
        day
    };
    day.and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .with_context(|| format!("{} out of range: '{}'", flag, s))
}

pub async fn run_flip(config: &Config, who: &str, topic: &str) -> Result<()> {
    let engine = Engine::open(config).await?;
    let (identity, outcome) = engine.flip(who, topic).await?;
    let answer = Answer::Flip {
        identity,
        topic: topic.to_string(),
        outcome,
    };
    println!("{}", format::render(&answer, engine.aliases()));
    Ok(())
}

pub async fn run_context(config: &Config, message_id: i64) -> Result<()> {
    let engine = Engine::open(config).await?;
    let messages = engine.context(message_id).await?;
    let answer = Answer::Context {
        target: message_id,
        messages,
    };
    println!("{}", format::render(&answer, engine.aliases()));
    Ok(())
}

pub async fn run_top(config: &Config, since: Option<&str>, until: Option<&str>) -> Result<()> {
    let engine = Engine::open(config).await?;
    let date_range = day_range(since, until)?;
    let counts = engine.top_speakers(date_range).await?;
    let answer = Answer::TopSpeakers { date_range, counts };
    println!("{}", format::render(&answer, engine.aliases()));
    Ok(())
}

pub async fn run_mentions(
    config: &Config,
    term: &str,
    author: Option<&str>,
    since: Option<&str>,
    until: Option<&str>,
) -> Result<()> {
    let engine = Engine::open(config).await?;
    let sender = match author {
        Some(who) => Some(engine.aliases().resolve(who)?),
        None => None,
    };
    let date_range = day_range(since, until)?;
    let counts = engine
        .mention_counts(term, sender.as_deref(), date_range)
        .await?;
    let answer = Answer::Mentions {
        term: term.to_string(),
        sender,
        counts,
    };
    println!("{}", format::render(&answer, engine.aliases()));
    Ok(())
}

pub async fn run_alias_add(config: &Config, who: &str, nickname: &str) -> Result<()> {
    let engine = Engine::open(config).await?;
    let identity = engine.add_alias(who, nickname).await?;
    println!(
        "alias '{}' → {} ({})",
        nickname, identity.display_name, identity.identity_id
    );
    Ok(())
}

pub async fn run_alias_remove(config: &Config, nickname: &str) -> Result<()> {
    let engine = Engine::open(config).await?;
    let identity = engine.remove_alias(nickname).await?;
    println!("removed '{}' from {}", nickname, identity.identity_id);
    Ok(())
}

pub async fn run_alias_list(config: &Config) -> Result<()> {
    let engine = Engine::open(config).await?;
    let aliases = engine.list_aliases();
    if aliases.is_empty() {
        println!("No aliases.");
        return Ok(());
    }
    for (nickname, identity_id) in &aliases {
        println!(
            "{:<20} {} ({})",
            nickname,
            engine.aliases().display_name(identity_id),
            identity_id
        );
    }
    Ok(())
}

/// Apply `[aliases.seed]` from config.
pub async fn run_alias_seed(config: &Config) -> Result<()> {
    let engine = Engine::open(config).await?;
    let report = engine.seed_aliases(&config.aliases.seed).await?;
    println!("alias seed");
    println!("  added: {}", report.added);
    println!("  unchanged: {}", report.unchanged);
    if !report.created.is_empty() {
        println!("  new identities: {}", report.created.join(", "));
    }
    for conflict in &report.conflicts {
        println!("  conflict: {}", conflict);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_reply() {
        assert_eq!(split_reply("#ab12 покажи ще"), (Some("ab12"), "покажи ще"));
        assert_eq!(split_reply("  what did bob say "), (None, "what did bob say"));
        assert_eq!(split_reply("#ab12"), (Some("ab12"), ""));
    }

    #[test]
    fn test_until_includes_the_day() {
        let since = parse_day("2022-01-01", "--since").unwrap();
        let until = parse_day("2022-01-01", "--until").unwrap();
        assert_eq!((until - since).num_hours(), 24);
        assert!(parse_day("01/01/2022", "--since").is_err());
    }

    #[test]
    fn test_day_range_is_none_without_flags() {
        assert!(day_range(None, None).unwrap().is_none());
        let range = day_range(Some("2021-03-01"), None).unwrap().unwrap();
        assert!(range.from.is_some() && range.to.is_none());
    }
}
