use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::warn;

use crate::zsxq::model::Topic;

/// Offset applied to source timestamps that carry no zone (Asia/Shanghai).
const DEFAULT_UTC_OFFSET_SECS: i32 = 8 * 3600;

/// One content stream inside a group. Each kind has its own checkpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    Home,
    Digest,
}

/// How a feed kind is paged backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStyle {
    /// Client computes `end_time` from the oldest item of the previous page.
    Time,
    /// Server hands out an opaque `index` with each page.
    Index,
}

impl FeedKind {
    pub const ALL: [FeedKind; 2] = [FeedKind::Home, FeedKind::Digest];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::Home => "home",
            FeedKind::Digest => "digest",
        }
    }

    pub fn cursor_style(&self) -> CursorStyle {
        match self {
            FeedKind::Home => CursorStyle::Time,
            FeedKind::Digest => CursorStyle::Index,
        }
    }

    /// Digest listings only carry summaries; each entry has to be expanded.
    pub fn needs_detail(&self) -> bool {
        match self {
            FeedKind::Home => false,
            FeedKind::Digest => true,
        }
    }

    /// Label shown in the forwarded message.
    pub fn label(&self) -> &'static str {
        match self {
            FeedKind::Home => "主页",
            FeedKind::Digest => "精华",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Topic id. Ordered by creation time within a group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A decoded feed entry. The core only looks at `id` and `created_at`.
#[derive(Debug, Clone)]
pub struct Item {
    pub id: ItemId,
    pub created_at: DateTime<FixedOffset>,
    pub topic: Topic,
}

/// Result of decoding one raw entry.
#[derive(Debug, Clone)]
pub struct DecodedItem {
    pub item: Item,
    /// False when `created_at` was not parseable and "now" was substituted.
    pub trusted_time: bool,
}

impl DecodedItem {
    pub fn decode(entry: Value) -> Result<Self> {
        let topic: Topic = serde_json::from_value(entry).context("malformed topic entry")?;
        if topic.topic_id == 0 {
            anyhow::bail!("topic entry without topic_id");
        }
        let (created_at, trusted_time) = match parse_create_time(&topic.create_time) {
            Some(ts) => (ts, true),
            None => {
                warn!(
                    topic_id = topic.topic_id,
                    raw = %topic.create_time,
                    "unparseable create_time; substituting now"
                );
                (Utc::now().with_timezone(&default_offset()), false)
            }
        };
        Ok(Self {
            item: Item {
                id: ItemId(topic.topic_id),
                created_at,
                topic,
            },
            trusted_time,
        })
    }
}

/// Opaque pagination token for one walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    Time(DateTime<FixedOffset>),
    Index(String),
}

impl PageCursor {
    /// Query parameter carrying this cursor.
    pub fn query_pair(&self) -> (&'static str, String) {
        match self {
            PageCursor::Time(ts) => ("end_time", format_end_time(ts)),
            PageCursor::Index(index) => ("index", index.clone()),
        }
    }
}

/// Durable "last delivered" marker for one (group, feed kind) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    pub last_item_id: ItemId,
    pub update_time: DateTime<Utc>,
}

impl Checkpoint {
    pub fn now(last_item_id: ItemId) -> Self {
        Self {
            last_item_id,
            update_time: Utc::now(),
        }
    }
}

pub fn default_offset() -> FixedOffset {
    FixedOffset::east_opt(DEFAULT_UTC_OFFSET_SECS).expect("valid default offset")
}

/// Parse a zsxq `create_time` such as `2024-03-01T08:15:30.123+0800`.
/// Timestamps without a zone are read as `+0800`.
pub fn parse_create_time(raw: &str) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(ts);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts);
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return default_offset().from_local_datetime(&naive).single();
        }
    }
    None
}

/// Format a time cursor as `YYYY-MM-DDTHH:MM:SS.mmm±HHMM`.
pub fn format_end_time(ts: &DateTime<FixedOffset>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3f%z").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_zoned_and_naive_timestamps() {
        let ts = parse_create_time("2024-03-01T08:15:30.123+0800").unwrap();
        assert_eq!(format_end_time(&ts), "2024-03-01T08:15:30.123+0800");

        let ts = parse_create_time("2024-03-01T08:15:30.5+0000").unwrap();
        assert_eq!(format_end_time(&ts), "2024-03-01T08:15:30.500+0000");

        let ts = parse_create_time("2024-03-01T08:15:30").unwrap();
        assert_eq!(format_end_time(&ts), "2024-03-01T08:15:30.000+0800");

        assert!(parse_create_time("yesterday").is_none());
        assert!(parse_create_time("").is_none());
    }

    #[test]
    fn cursor_query_pairs() {
        let ts = parse_create_time("2024-03-01T08:15:30.123+0800").unwrap();
        assert_eq!(
            PageCursor::Time(ts).query_pair(),
            ("end_time", "2024-03-01T08:15:30.123+0800".to_string())
        );
        assert_eq!(
            PageCursor::Index("1700000000".into()).query_pair(),
            ("index", "1700000000".to_string())
        );
    }

    #[test]
    fn decode_marks_fallback_time_untrusted() {
        let ok = DecodedItem::decode(json!({
            "topic_id": 42,
            "create_time": "2024-03-01T08:15:30.123+0800"
        }))
        .unwrap();
        assert_eq!(ok.item.id, ItemId(42));
        assert!(ok.trusted_time);

        let lossy = DecodedItem::decode(json!({ "topic_id": 43, "create_time": "garbage" })).unwrap();
        assert!(!lossy.trusted_time);

        assert!(DecodedItem::decode(json!({ "title": "no id" })).is_err());
        assert!(DecodedItem::decode(json!("not an object")).is_err());
    }

    #[test]
    fn feed_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&FeedKind::Home).unwrap(), "\"home\"");
        let kind: FeedKind = serde_json::from_str("\"digest\"").unwrap();
        assert_eq!(kind, FeedKind::Digest);
        assert_eq!(kind.cursor_style(), CursorStyle::Index);
        assert!(kind.needs_detail());
    }
}
