use std::collections::HashMap;
use tracing::{info, warn};

use crate::config::GroupConfig;
use crate::zsxq::FeedClient;

/// Display names of the configured groups, resolved once per process.
#[derive(Debug, Clone, Default)]
pub struct GroupDirectory {
    names: HashMap<String, String>,
}

impl GroupDirectory {
    /// Look up every configured group. Lookups that fail are logged and
    /// the group id is shown in its place.
    pub async fn load(feed: &dyn FeedClient, sources: &[GroupConfig]) -> Self {
        let mut directory = Self::default();
        for source in sources {
            match feed.fetch_group(&source.group_id).await {
                Ok(info) if !info.name.trim().is_empty() => {
                    info!(group_id = %source.group_id, name = %info.name, "group resolved");
                    directory.insert(&source.group_id, info.name);
                }
                Ok(_) => warn!(group_id = %source.group_id, "group has no name"),
                Err(err) => warn!(?err, group_id = %source.group_id, "group lookup failed"),
            }
        }
        directory
    }

    pub fn insert(&mut self, group_id: &str, name: impl Into<String>) {
        self.names.insert(group_id.to_string(), name.into());
    }

    pub fn name<'a>(&'a self, group_id: &'a str) -> &'a str {
        self.names.get(group_id).map(String::as_str).unwrap_or(group_id)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FeedKind, ItemId, PageCursor};
    use crate::zsxq::{FeedPage, GroupInfo};
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::BTreeMap;

    struct Names;

    #[async_trait]
    impl FeedClient for Names {
        async fn fetch_page(
            &self,
            _group_id: &str,
            _kind: FeedKind,
            _cursor: Option<&PageCursor>,
        ) -> Result<FeedPage> {
            Ok(FeedPage::default())
        }

        async fn fetch_topic(&self, _topic_id: ItemId) -> Result<Value> {
            bail!("unused")
        }

        async fn fetch_group(&self, group_id: &str) -> Result<GroupInfo> {
            match group_id {
                "1" => Ok(GroupInfo {
                    group_id: "1".into(),
                    name: "Rustaceans".into(),
                }),
                "2" => Ok(GroupInfo {
                    group_id: "2".into(),
                    name: " ".into(),
                }),
                _ => bail!("403"),
            }
        }
    }

    fn source(id: &str) -> GroupConfig {
        GroupConfig {
            group_id: id.into(),
            crawl_home: false,
            thread_ids: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn unresolved_groups_fall_back_to_id() {
        let dir = GroupDirectory::load(&Names, &[source("1"), source("2"), source("3")]).await;
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.name("1"), "Rustaceans");
        assert_eq!(dir.name("2"), "2");
        assert_eq!(dir.name("3"), "3");
    }
}
