//! Topic → Telegram HTML rendering.
//!
//! zsxq bodies are plain text with inline `<e type=".." .. />` elements for
//! mentions, hashtags, links and bold runs. Attribute values are
//! percent-encoded. Everything outside those elements is escaped for
//! Telegram's HTML parse mode.
use html_escape::{decode_html_entities, encode_double_quoted_attribute, encode_text};
use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;
use std::collections::HashMap;

use crate::model::{FeedKind, Item};
use crate::telegram::{Attachment, OutboundMessage};

static INLINE_ELEMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<e\b([^>]*?)/?>|</e>").expect("valid inline element regex"));
static ATTRIBUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([A-Za-z_][\w-]*)\s*=\s*"([^"]*)""#).expect("valid attribute regex"));

/// Turns an item into the message sent downstream.
pub trait Renderer: Send + Sync {
    fn render(&self, item: &Item, kind: FeedKind, group_name: &str) -> OutboundMessage;
}

#[derive(Debug, Clone, Default)]
pub struct TelegramFormatter;

impl Renderer for TelegramFormatter {
    fn render(&self, item: &Item, kind: FeedKind, group_name: &str) -> OutboundMessage {
        OutboundMessage {
            text: format_topic(item, kind, group_name),
            attachments: attachments(item),
        }
    }
}

pub fn format_topic(item: &Item, kind: FeedKind, group_name: &str) -> String {
    let topic = &item.topic;
    let mut parts: Vec<String> = Vec::new();

    let hashtags = extract_hashtags(topic.text());
    if !hashtags.is_empty() {
        let mut tags = vec!["#知识星球".to_string(), format!("#{}", tag_safe(group_name))];
        tags.extend(hashtags.iter().map(|t| format!("#{}", tag_safe(t))));
        parts.push(format!("{}\n", tags.join(" ")));
    }

    if let Some(title) = topic.display_title() {
        parts.push(format!("<b>{}</b>\n", encode_text(&render_inline(title))));
    }

    parts.push(render_body(topic.text()));

    let mut meta = Vec::new();
    if let Some(author) = topic.author().filter(|a| !a.name.is_empty()) {
        meta.push(format!("📝 作者：{}", encode_text(&author.name)));
        if let Some(location) = author.location.as_deref().filter(|l| !l.is_empty()) {
            meta.push(format!("📍 {}", encode_text(location)));
        }
    }
    if !topic.images().is_empty() {
        meta.push(format!("🖼 {}张图片", topic.images().len()));
    }
    if topic.likes_count > 0 {
        let emojis: Vec<String> = topic
            .likes_detail
            .as_ref()
            .map(|d| {
                d.emojis
                    .iter()
                    .map(|e| format!("{}×{}", encode_text(&e.emoji_key), e.likes_count))
                    .collect()
            })
            .unwrap_or_default();
        if emojis.is_empty() {
            meta.push(format!("❤️ {}", topic.likes_count));
        } else {
            meta.push(format!("❤️ {}", emojis.join(" ")));
        }
    }
    if topic.comments_count > 0 {
        meta.push(format!("💬 {}", topic.comments_count));
    }
    if !meta.is_empty() {
        parts.push(format!("\n{}", meta.join(" | ")));
    }

    let files: Vec<String> = topic
        .files()
        .iter()
        .filter(|f| !f.name.is_empty())
        .map(|f| format!("📎 {}", encode_text(&f.name)))
        .collect();
    if !files.is_empty() {
        parts.push(format!("\n{}", files.join("\n")));
    }

    let links: Vec<String> = topic
        .images()
        .iter()
        .filter_map(|img| img.best_url())
        .map(|url| format!("<a href=\"{}\">查看原图</a>", encode_double_quoted_attribute(url)))
        .collect();
    if !links.is_empty() {
        parts.push(format!("\n{}", links.join(" | ")));
    }

    parts.push(format!(
        "\n🏷 {} ⏰ {}",
        kind.label(),
        item.created_at.format("%Y-%m-%d %H:%M:%S")
    ));

    parts
        .into_iter()
        .filter(|p| !p.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn attachments(item: &Item) -> Vec<Attachment> {
    item.topic
        .images()
        .iter()
        .filter_map(|img| img.best_url())
        .map(|url| Attachment::Photo {
            url: url.to_string(),
        })
        .collect()
}

/// Render a zsxq body to Telegram HTML.
pub fn render_body(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in INLINE_ELEMENT.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&escape_plain(&text[last..whole.start()]));
        last = whole.end();
        if let Some(attrs) = caps.get(1) {
            out.push_str(&render_element(&parse_attributes(attrs.as_str())));
        }
    }
    out.push_str(&escape_plain(&text[last..]));
    out.trim().to_string()
}

/// Plain-text rendering of a string that may contain inline elements
/// (used for titles, which are escaped by the caller).
fn render_inline(text: &str) -> String {
    let mut out = String::new();
    let mut last = 0;
    for caps in INLINE_ELEMENT.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&decode_html_entities(&text[last..whole.start()]));
        last = whole.end();
        if let Some(attrs) = caps.get(1) {
            let attrs = parse_attributes(attrs.as_str());
            out.push_str(&attr(&attrs, "title"));
        }
    }
    out.push_str(&decode_html_entities(&text[last..]));
    out.trim().to_string()
}

fn escape_plain(segment: &str) -> String {
    encode_text(&decode_html_entities(segment)).into_owned()
}

fn render_element(attrs: &HashMap<String, String>) -> String {
    let title = attr(attrs, "title");
    match attrs.get("type").map(String::as_str) {
        Some("mention") => format!("@{}", encode_text(title.trim_start_matches('@'))),
        Some("hashtag") => format!("#{}", encode_text(title.trim_matches('#'))),
        Some("web") => {
            let href = attr(attrs, "href");
            let label = if title.is_empty() { href.clone() } else { title };
            if href.is_empty() {
                encode_text(&label).into_owned()
            } else {
                format!(
                    "<a href=\"{}\">{}</a>",
                    encode_double_quoted_attribute(&href),
                    encode_text(&label)
                )
            }
        }
        Some("text_bold") => format!("<b>{}</b>", encode_text(&title)),
        _ => encode_text(&title).into_owned(),
    }
}

fn parse_attributes(raw: &str) -> HashMap<String, String> {
    ATTRIBUTE
        .captures_iter(raw)
        .map(|c| (c[1].to_ascii_lowercase(), c[2].to_string()))
        .collect()
}

/// Percent- and entity-decoded attribute value, or empty.
fn attr(attrs: &HashMap<String, String>, name: &str) -> String {
    attrs
        .get(name)
        .map(|v| percent_decode(&decode_html_entities(v)))
        .unwrap_or_default()
}

fn extract_hashtags(text: &str) -> Vec<String> {
    INLINE_ELEMENT
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| parse_attributes(m.as_str())))
        .filter(|attrs| attrs.get("type").map(String::as_str) == Some("hashtag"))
        .map(|attrs| attr(&attrs, "title").trim_matches('#').trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// Telegram hashtags end at whitespace.
fn tag_safe(tag: &str) -> String {
    encode_text(&tag.split_whitespace().collect::<Vec<_>>().join("_")).into_owned()
}

fn percent_decode(input: &str) -> String {
    percent_decode_str(input).decode_utf8_lossy().into_owned()
}
