use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Response envelope shared by every v2 endpoint.
#[derive(Deserialize, Debug)]
pub struct Envelope {
    #[serde(default)]
    pub succeeded: bool,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub info: Option<String>,
    #[serde(default)]
    pub resp_data: Value,
}

/// `resp_data` of the topic and digest listings. Entries stay raw so that a
/// single malformed topic does not poison the whole page.
#[derive(Deserialize, Debug, Default)]
pub struct TopicsResp {
    #[serde(default)]
    pub topics: Vec<Value>,
    #[serde(default)]
    pub index: Option<Value>,
}

#[derive(Deserialize, Debug)]
pub struct TopicInfoResp {
    pub topic: Value,
}

#[derive(Deserialize, Debug)]
pub struct GroupResp {
    pub group: GroupRef,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Topic {
    #[serde(default, deserialize_with = "flexible_u64")]
    pub topic_id: u64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, rename = "type")]
    pub topic_type: Option<String>,
    #[serde(default)]
    pub create_time: String,
    #[serde(default)]
    pub group: Option<GroupRef>,
    #[serde(default)]
    pub talk: Option<Talk>,
    /// Present on digest summaries, which have no `talk`.
    #[serde(default)]
    pub owner: Option<User>,
    #[serde(default)]
    pub likes_count: u64,
    #[serde(default)]
    pub comments_count: u64,
    #[serde(default)]
    pub likes_detail: Option<LikesDetail>,
    #[serde(default)]
    pub digested: bool,
    #[serde(default)]
    pub sticky: bool,
}

impl Topic {
    pub fn author(&self) -> Option<&User> {
        self.talk
            .as_ref()
            .and_then(|t| t.owner.as_ref())
            .or(self.owner.as_ref())
    }

    pub fn display_title(&self) -> Option<&str> {
        self.title
            .as_deref()
            .or_else(|| self.talk.as_ref().and_then(|t| t.title.as_deref()))
            .filter(|t| !t.trim().is_empty())
    }

    pub fn text(&self) -> &str {
        self.talk.as_ref().map(|t| t.text.as_str()).unwrap_or("")
    }

    pub fn images(&self) -> &[Image] {
        self.talk.as_ref().map(|t| t.images.as_slice()).unwrap_or(&[])
    }

    pub fn files(&self) -> &[FileRef] {
        self.talk.as_ref().map(|t| t.files.as_slice()).unwrap_or(&[])
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct GroupRef {
    #[serde(default, deserialize_with = "flexible_u64")]
    pub group_id: u64,
    #[serde(default)]
    pub name: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Talk {
    #[serde(default)]
    pub owner: Option<User>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub images: Vec<Image>,
    #[serde(default)]
    pub files: Vec<FileRef>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct User {
    #[serde(default, deserialize_with = "flexible_u64")]
    pub user_id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Image {
    #[serde(default, deserialize_with = "flexible_u64")]
    pub image_id: u64,
    #[serde(default)]
    pub thumbnail: Option<ImageSize>,
    #[serde(default)]
    pub large: Option<ImageSize>,
    #[serde(default)]
    pub original: Option<ImageSize>,
}

impl Image {
    /// Largest available rendition.
    pub fn best_url(&self) -> Option<&str> {
        [&self.original, &self.large, &self.thumbnail]
            .into_iter()
            .flatten()
            .map(|size| size.url.as_str())
            .find(|url| !url.is_empty())
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ImageSize {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct FileRef {
    #[serde(default, deserialize_with = "flexible_u64")]
    pub file_id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct LikesDetail {
    #[serde(default)]
    pub emojis: Vec<EmojiLike>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct EmojiLike {
    #[serde(default)]
    pub emoji_key: String,
    #[serde(default)]
    pub likes_count: u64,
}

/// Ids arrive as JSON numbers on most endpoints and as strings on a few.
fn flexible_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(u64),
        Str(String),
    }

    match NumOrStr::deserialize(deserializer)? {
        NumOrStr::Num(n) => Ok(n),
        NumOrStr::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn topic_accepts_string_ids_and_sparse_fields() {
        let topic: Topic = serde_json::from_value(json!({
            "topic_id": "8855421412",
            "create_time": "2024-03-01T08:15:30.123+0800",
            "talk": { "owner": { "user_id": 7, "name": "alice" }, "text": "hi" }
        }))
        .unwrap();
        assert_eq!(topic.topic_id, 8855421412);
        assert_eq!(topic.author().unwrap().name, "alice");
        assert_eq!(topic.text(), "hi");
        assert!(topic.images().is_empty());
        assert!(topic.display_title().is_none());
    }

    #[test]
    fn digest_summary_owner_is_author() {
        let topic: Topic = serde_json::from_value(json!({
            "topic_id": 5,
            "title": "weekly",
            "owner": { "user_id": 1, "name": "bob" }
        }))
        .unwrap();
        assert_eq!(topic.author().unwrap().name, "bob");
        assert_eq!(topic.display_title(), Some("weekly"));
    }

    #[test]
    fn best_url_prefers_original() {
        let image: Image = serde_json::from_value(json!({
            "image_id": 1,
            "thumbnail": { "url": "https://img/t.jpg" },
            "large": { "url": "https://img/l.jpg" },
            "original": { "url": "" }
        }))
        .unwrap();
        assert_eq!(image.best_url(), Some("https://img/l.jpg"));
    }
}
