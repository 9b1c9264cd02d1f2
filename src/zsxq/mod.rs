use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::model::{FeedKind, ItemId, PageCursor};
use crate::zsxq::model::{Envelope, GroupResp, TopicInfoResp, TopicsResp};

pub mod model;

const ZSXQ_API_BASE: &str = "https://api.zsxq.com/v2/";
const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// One page of raw entries, newest first.
#[derive(Debug, Clone, Default)]
pub struct FeedPage {
    pub entries: Vec<Value>,
    /// Server-issued cursor, if the endpoint hands one out.
    pub next_cursor: Option<PageCursor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub group_id: String,
    pub name: String,
}

/// Request/response boundary to the remote feed.
#[async_trait]
pub trait FeedClient: Send + Sync {
    async fn fetch_page(
        &self,
        group_id: &str,
        kind: FeedKind,
        cursor: Option<&PageCursor>,
    ) -> Result<FeedPage>;

    /// Full topic body for listings that only carry summaries.
    async fn fetch_topic(&self, topic_id: ItemId) -> Result<Value>;

    async fn fetch_group(&self, group_id: &str) -> Result<GroupInfo>;
}

#[derive(Clone)]
pub struct ZsxqClient {
    http: Client,
    base_url: Url,
    cookie: String,
    page_size: u32,
}

impl fmt::Debug for ZsxqClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZsxqClient")
            .field("base_url", &self.base_url)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl ZsxqClient {
    pub fn new(cookie: String, page_size: u32, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(ZSXQ_API_BASE).expect("valid default zsxq URL");
        Self::with_base_url(cookie, page_size, timeout, base_url)
    }

    pub fn with_base_url(
        cookie: String,
        page_size: u32,
        timeout: Duration,
        base_url: Url,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            cookie,
            page_size,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.zsxq.base_url)
            .with_context(|| format!("invalid zsxq.base_url: {}", cfg.zsxq.base_url))?;
        Self::with_base_url(
            cfg.zsxq.cookie.clone(),
            cfg.zsxq.page_size,
            Duration::from_secs(cfg.zsxq.timeout_secs),
            base_url,
        )
    }

    /// Cookie header value. Accepts either the bare token or a full
    /// `zsxq_access_token=...` pair.
    fn cookie_header(&self) -> String {
        if self.cookie.contains("zsxq_access_token=") {
            self.cookie.clone()
        } else {
            format!("zsxq_access_token={}", self.cookie)
        }
    }

    fn get(&self, path: &str, query: &[(&str, String)]) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(path)
            .with_context(|| format!("invalid zsxq endpoint: {path}"))?;
        self.http
            .get(endpoint)
            .header("Cookie", self.cookie_header())
            .header("Accept", "application/json")
            .query(query)
            .build()
            .context("failed to build zsxq request")
    }

    pub fn build_page_request(
        &self,
        group_id: &str,
        kind: FeedKind,
        cursor: Option<&PageCursor>,
    ) -> Result<reqwest::Request> {
        let mut query = vec![("count", self.page_size.to_string())];
        let path = match kind {
            FeedKind::Home => {
                query.push(("scope", "all".to_string()));
                format!("groups/{group_id}/topics")
            }
            FeedKind::Digest => {
                query.push(("sort", "by_create_time".to_string()));
                query.push(("direction", "desc".to_string()));
                format!("groups/{group_id}/topics/digests")
            }
        };
        if let Some(cursor) = cursor {
            query.push(cursor.query_pair());
        }
        self.get(&path, &query)
    }

    async fn execute(&self, request: reqwest::Request) -> Result<Value> {
        debug!(url = %request.url(), "zsxq request");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach zsxq")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!("rate limited by zsxq: {}", body);
            return Err(anyhow!("received 429 from zsxq: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("zsxq error {}: {}", status, body));
        }

        let body: Value = res.json().await.context("invalid zsxq response JSON")?;
        unwrap_envelope(body)
    }
}

#[async_trait]
impl FeedClient for ZsxqClient {
    async fn fetch_page(
        &self,
        group_id: &str,
        kind: FeedKind,
        cursor: Option<&PageCursor>,
    ) -> Result<FeedPage> {
        let request = self.build_page_request(group_id, kind, cursor)?;
        let resp_data = self.execute(request).await?;
        parse_topics_page(resp_data)
    }

    async fn fetch_topic(&self, topic_id: ItemId) -> Result<Value> {
        let request = self.get(&format!("topics/{topic_id}/info"), &[])?;
        let resp_data = self.execute(request).await?;
        let info: TopicInfoResp =
            serde_json::from_value(resp_data).context("topic info without topic")?;
        Ok(info.topic)
    }

    async fn fetch_group(&self, group_id: &str) -> Result<GroupInfo> {
        let request = self.get(&format!("groups/{group_id}"), &[])?;
        let resp_data = self.execute(request).await?;
        let resp: GroupResp =
            serde_json::from_value(resp_data).context("group info without group")?;
        Ok(GroupInfo {
            group_id: group_id.to_string(),
            name: resp.group.name,
        })
    }
}

/// Strip the `{succeeded, resp_data}` envelope; `succeeded=false` is an error.
pub fn unwrap_envelope(body: Value) -> Result<Value> {
    let envelope: Envelope = serde_json::from_value(body).context("invalid zsxq envelope")?;
    if !envelope.succeeded {
        bail!(
            "zsxq request failed (code {}): {}",
            envelope
                .code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "?".into()),
            envelope.info.unwrap_or_default()
        );
    }
    Ok(envelope.resp_data)
}

pub fn parse_topics_page(resp_data: Value) -> Result<FeedPage> {
    let resp: TopicsResp = if resp_data.is_null() {
        TopicsResp::default()
    } else {
        serde_json::from_value(resp_data).context("invalid topics payload")?
    };
    let next_cursor = resp.index.and_then(|index| match index {
        Value::String(s) if !s.is_empty() => Some(PageCursor::Index(s)),
        Value::Number(n) => Some(PageCursor::Index(n.to_string())),
        _ => None,
    });
    Ok(FeedPage {
        entries: resp.topics,
        next_cursor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::parse_create_time;
    use serde_json::json;

    fn client() -> ZsxqClient {
        ZsxqClient::new("token-abc".into(), 20, Duration::from_secs(5)).unwrap()
    }

    fn query_of(request: &reqwest::Request) -> Vec<(String, String)> {
        request
            .url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn home_request_carries_time_cursor_and_cookie() {
        let ts = parse_create_time("2024-03-01T08:15:30.123+0800").unwrap();
        let request = client()
            .build_page_request("1234", FeedKind::Home, Some(&PageCursor::Time(ts)))
            .unwrap();
        assert_eq!(request.method(), reqwest::Method::GET);
        assert_eq!(request.url().path(), "/v2/groups/1234/topics");
        let query = query_of(&request);
        assert!(query.contains(&("scope".into(), "all".into())));
        assert!(query.contains(&("count".into(), "20".into())));
        assert!(query.contains(&("end_time".into(), "2024-03-01T08:15:30.123+0800".into())));
        assert_eq!(
            request
                .headers()
                .get("Cookie")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "zsxq_access_token=token-abc"
        );
    }

    #[test]
    fn digest_request_uses_index_cursor() {
        let request = client()
            .build_page_request(
                "1234",
                FeedKind::Digest,
                Some(&PageCursor::Index("99".into())),
            )
            .unwrap();
        assert_eq!(request.url().path(), "/v2/groups/1234/topics/digests");
        let query = query_of(&request);
        assert!(query.contains(&("sort".into(), "by_create_time".into())));
        assert!(query.contains(&("direction".into(), "desc".into())));
        assert!(query.contains(&("index".into(), "99".into())));
        assert!(!query.iter().any(|(k, _)| k == "end_time"));
    }

    #[test]
    fn first_page_has_no_cursor() {
        let request = client()
            .build_page_request("1234", FeedKind::Home, None)
            .unwrap();
        let query = query_of(&request);
        assert!(!query.iter().any(|(k, _)| k == "end_time" || k == "index"));
    }

    #[test]
    fn full_cookie_pair_is_passed_through() {
        let client =
            ZsxqClient::new("zsxq_access_token=xyz".into(), 20, Duration::from_secs(5)).unwrap();
        assert_eq!(client.cookie_header(), "zsxq_access_token=xyz");
    }

    #[test]
    fn envelope_failure_is_an_error() {
        let err = unwrap_envelope(json!({ "succeeded": false, "code": 1059, "info": "busy" }))
            .unwrap_err();
        assert!(err.to_string().contains("1059"));

        let data = unwrap_envelope(json!({ "succeeded": true, "resp_data": { "topics": [] } }))
            .unwrap();
        assert_eq!(data, json!({ "topics": [] }));
    }

    #[test]
    fn page_parsing_reads_numeric_or_string_index() {
        let page = parse_topics_page(json!({ "topics": [{ "topic_id": 1 }], "index": 1700 })).unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.next_cursor, Some(PageCursor::Index("1700".into())));

        let page = parse_topics_page(json!({ "topics": [], "index": "" })).unwrap();
        assert!(page.entries.is_empty());
        assert!(page.next_cursor.is_none());

        let page = parse_topics_page(Value::Null).unwrap();
        assert!(page.entries.is_empty());
    }
}
