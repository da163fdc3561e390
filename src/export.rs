//! Streaming parser for Telegram-style chat exports (`result.json`).
//!
//! The export is one JSON object with chat metadata and a `messages`
//! array. The parser walks the top-level object with a serde visitor and
//! decodes the array one entry at a time, so memory use is bounded by the
//! largest single message rather than the file.
//!
//! Entry handling:
//!
//! - `type != "message"` (joins, pins, calls) → skipped silently
//! - empty text after flattening entities (stickers, photos) → skipped
//! - missing `id`, date, or sender, or a non-object entry → counted as
//!   malformed and skipped
//!
//! A file that is not JSON, or has no `messages` array, is a
//! [`RecallError::MalformedInput`].

use std::fmt;
use std::io::{BufReader, Read};

use anyhow::Result;
use chat_recall_core::error::RecallError;
use chat_recall_core::models::Message;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::{self, DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Counters from one pass over an export.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExportReport {
    pub chat_name: Option<String>,
    pub parsed: usize,
    pub skipped_service: usize,
    pub skipped_empty: usize,
    pub malformed: usize,
    /// The consumer stopped the stream before the end of the file.
    pub cancelled: bool,
}

/// What a single raw entry turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Message(Message),
    Service,
    Empty,
    Malformed(String),
}

/// Stream every message of an export into `sink`.
///
/// `sink` returns `false` to stop early (the report is then marked
/// cancelled).
pub fn stream_export<R, F>(reader: R, mut sink: F) -> Result<ExportReport>
where
    R: Read,
    F: FnMut(Message) -> bool,
{
    let mut report = ExportReport::default();
    let mut found = false;
    let mut json = serde_json::Deserializer::from_reader(BufReader::new(reader));

    let visitor = ExportVisitor {
        sink: &mut sink,
        report: &mut report,
        found: &mut found,
    };
    let outcome = de::Deserializer::deserialize_map(&mut json, visitor);

    match outcome {
        Ok(()) => {
            if let Err(e) = json.end() {
                return Err(RecallError::MalformedInput(format!("trailing data: {}", e)).into());
            }
        }
        Err(_) if report.cancelled => return Ok(report),
        Err(e) => return Err(RecallError::MalformedInput(format!("invalid export: {}", e)).into()),
    }
    if !found {
        return Err(RecallError::MalformedInput("export has no \"messages\" array".into()).into());
    }
    if report.malformed > 0 {
        warn!(malformed = report.malformed, "skipped malformed export entries");
    }
    Ok(report)
}

/// Parse a whole export into memory. Convenient for tests and small chats.
pub fn parse_export<R: Read>(reader: R) -> Result<(Vec<Message>, ExportReport)> {
    let mut messages = Vec::new();
    let report = stream_export(reader, |m| {
        messages.push(m);
        true
    })?;
    Ok((messages, report))
}

struct ExportVisitor<'a, F> {
    sink: &'a mut F,
    report: &'a mut ExportReport,
    found: &'a mut bool,
}

impl<'de, 'a, F> Visitor<'de> for ExportVisitor<'a, F>
where
    F: FnMut(Message) -> bool,
{
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a chat export object with a \"messages\" array")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<(), A::Error> {
        let ExportVisitor {
            sink,
            report,
            found,
        } = self;
        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "messages" => {
                    map.next_value_seed(MessagesSeed {
                        sink: &mut *sink,
                        report: &mut *report,
                    })?;
                    *found = true;
                }
                "name" => {
                    let name: Value = map.next_value()?;
                    report.chat_name = name.as_str().map(str::to_string);
                }
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        Ok(())
    }
}

struct MessagesSeed<'a, F> {
    sink: &'a mut F,
    report: &'a mut ExportReport,
}

impl<'de, 'a, F> DeserializeSeed<'de> for MessagesSeed<'a, F>
where
    F: FnMut(Message) -> bool,
{
    type Value = ();

    fn deserialize<D: de::Deserializer<'de>>(self, deserializer: D) -> std::result::Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, 'a, F> Visitor<'de> for MessagesSeed<'a, F>
where
    F: FnMut(Message) -> bool,
{
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an array of messages")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<(), A::Error> {
        while let Some(raw) = seq.next_element::<Value>()? {
            match parse_entry(&raw) {
                Entry::Message(msg) => {
                    self.report.parsed += 1;
                    if !(self.sink)(msg) {
                        self.report.cancelled = true;
                        return Err(de::Error::custom("cancelled by consumer"));
                    }
                }
                Entry::Service => self.report.skipped_service += 1,
                Entry::Empty => self.report.skipped_empty += 1,
                Entry::Malformed(reason) => {
                    debug!(reason = %reason, "malformed export entry");
                    self.report.malformed += 1;
                }
            }
        }
        Ok(())
    }
}

/// Classify and convert one raw export entry.
pub fn parse_entry(raw: &Value) -> Entry {
    let Some(obj) = raw.as_object() else {
        return Entry::Malformed("entry is not an object".into());
    };
    match obj.get("type").and_then(Value::as_str) {
        Some("message") | None => {}
        Some(_) => return Entry::Service,
    }

    let Some(id) = obj.get("id").and_then(Value::as_i64) else {
        return Entry::Malformed("missing id".into());
    };
    let Some(timestamp) = parse_timestamp(obj.get("date_unixtime"), obj.get("date")) else {
        return Entry::Malformed(format!("message {}: missing or invalid date", id));
    };
    let sender_identity = match obj.get("from_id") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => format!("user{}", n),
        _ => return Entry::Malformed(format!("message {}: missing sender", id)),
    };

    let text = flatten_text(obj.get("text"));
    let text = text.trim();
    if text.is_empty() {
        return Entry::Empty;
    }

    let sender_name = obj
        .get("from")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(&sender_identity)
        .to_string();

    let forwarded_from = ["forwarded_from", "forward_from"]
        .iter()
        .find_map(|k| match obj.get(*k) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::String(_)) | Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        });

    Entry::Message(Message {
        id,
        sender_identity,
        sender_name,
        timestamp,
        raw_text: text.to_string(),
        reply_to_id: obj.get("reply_to_message_id").and_then(Value::as_i64),
        forwarded_from,
    })
}

/// `date_unixtime` (string or number) wins; `date` is local ISO time taken
/// as UTC.
fn parse_timestamp(unix: Option<&Value>, iso: Option<&Value>) -> Option<DateTime<Utc>> {
    let secs = match unix {
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(Value::Number(n)) => n.as_i64(),
        _ => None,
    };
    if let Some(secs) = secs {
        return DateTime::from_timestamp(secs, 0);
    }
    let iso = iso?.as_str()?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(iso) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(iso, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|n| n.and_utc())
}

/// Telegram text is a string or an array of strings and entity objects.
fn flatten_text(text: Option<&Value>) -> String {
    match text {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .map(|p| match p {
                Value::String(s) => s.as_str(),
                Value::Object(o) => o.get("text").and_then(Value::as_str).unwrap_or(""),
                _ => "",
            })
            .collect(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE: &str = r#"{
        "name": "Friends",
        "type": "private_group",
        "id": 42,
        "messages": [
            {"id": 1, "type": "service", "date": "2021-01-01T10:00:00", "actor": "Alice", "action": "create_group"},
            {"id": 2, "type": "message", "date": "2021-01-01T10:01:00", "date_unixtime": "1609495260",
             "from": "Alice", "from_id": "user1", "text": "crypto is the future"},
            {"id": 3, "type": "message", "date": "2021-01-01T10:02:00",
             "from": "Bob", "from_id": "user2",
             "text": ["look at ", {"type": "bold", "text": "this"}, "!"], "reply_to_message_id": 2},
            {"id": 4, "type": "message", "date": "2021-01-01T10:03:00", "from": "Bob", "from_id": "user2",
             "text": "", "photo": "photos/1.jpg"},
            {"type": "message", "date": "2021-01-01T10:04:00", "from": "Bob", "text": "no id"},
            {"id": 6, "type": "message", "date": "2021-01-01T10:05:00", "from": "Carol", "from_id": "user3",
             "forwarded_from": "News Channel", "text": "breaking news"}
        ]
    }"#;

    #[test]
    fn test_parses_sample_export() {
        let (messages, report) = parse_export(SAMPLE.as_bytes()).unwrap();
        assert_eq!(report.chat_name.as_deref(), Some("Friends"));
        assert_eq!(report.parsed, 3);
        assert_eq!(report.skipped_service, 1);
        assert_eq!(report.skipped_empty, 1);
        assert_eq!(report.malformed, 1);

        assert_eq!(messages[0].id, 2);
        assert_eq!(messages[0].timestamp.timestamp(), 1_609_495_260);
        assert_eq!(messages[0].sender_identity, "user1");
        assert_eq!(messages[1].raw_text, "look at this!");
        assert_eq!(messages[1].reply_to_id, Some(2));
        assert_eq!(messages[2].forwarded_from.as_deref(), Some("News Channel"));
    }

    #[test]
    fn test_rejects_non_export_input() {
        let err = parse_export("not json".as_bytes()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RecallError>(),
            Some(RecallError::MalformedInput(_))
        ));
        let err = parse_export(r#"{"name": "x"}"#.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("messages"));
    }

    #[test]
    fn test_sink_can_stop_early() {
        let mut seen = 0;
        let report = stream_export(SAMPLE.as_bytes(), |_| {
            seen += 1;
            false
        })
        .unwrap();
        assert_eq!(seen, 1);
        assert!(report.cancelled);
    }

    #[test]
    fn test_entry_edge_cases() {
        assert!(matches!(parse_entry(&json!("text")), Entry::Malformed(_)));
        assert!(matches!(
            parse_entry(&json!({"id": 1, "date": "bad", "from_id": "user1", "text": "x"})),
            Entry::Malformed(_)
        ));
        let Entry::Message(m) = parse_entry(&json!({
            "id": 9, "date_unixtime": 1700000000, "from_id": 77, "from": null, "text": "  hi  "
        })) else {
            panic!("expected message");
        };
        assert_eq!(m.sender_identity, "user77");
        assert_eq!(m.sender_name, "user77");
        assert_eq!(m.raw_text, "hi");
    }
}
