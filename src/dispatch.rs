use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::format::Renderer;
use crate::model::{FeedKind, Item, ItemId};
use crate::telegram::Sink;

/// Result of forwarding one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub success_count: usize,
    /// Largest id that was delivered; this becomes the new checkpoint.
    pub last_success: Option<ItemId>,
    pub failed: Vec<ItemId>,
}

impl DispatchOutcome {
    pub fn attempted(&self) -> usize {
        self.success_count + self.failed.len()
    }
}

/// Sends a batch oldest-first, one item at a time. A failed send is logged
/// and skipped; the batch always runs to the end.
pub struct ForwardDispatcher<'a> {
    renderer: &'a dyn Renderer,
    sink: &'a dyn Sink,
    send_delay: Duration,
}

impl<'a> ForwardDispatcher<'a> {
    pub fn new(renderer: &'a dyn Renderer, sink: &'a dyn Sink, send_delay: Duration) -> Self {
        Self {
            renderer,
            sink,
            send_delay,
        }
    }

    #[instrument(skip_all, fields(kind = %kind, items = items.len()))]
    pub async fn forward(
        &self,
        items: &[Item],
        kind: FeedKind,
        group_name: &str,
        thread_id: Option<i32>,
    ) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        for (i, item) in items.iter().enumerate() {
            if i > 0 && !self.send_delay.is_zero() {
                tokio::time::sleep(self.send_delay).await;
            }
            let message = self.renderer.render(item, kind, group_name);
            match self.sink.send(&message, thread_id).await {
                Ok(()) => {
                    info!(item_id = %item.id, "forwarded");
                    outcome.success_count += 1;
                    outcome.last_success = outcome.last_success.max(Some(item.id));
                }
                Err(err) => {
                    error!(?err, item_id = %item.id, "forward failed");
                    outcome.failed.push(item.id);
                }
            }
        }

        if let Some(last) = outcome.last_success {
            let skipped: Vec<ItemId> = outcome.failed.iter().copied().filter(|id| *id < last).collect();
            if !skipped.is_empty() {
                warn!(
                    skipped = ?skipped,
                    checkpoint = %last,
                    "failed items precede the new checkpoint and will not be retried"
                );
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::TelegramFormatter;
    use crate::model::DecodedItem;
    use crate::telegram::OutboundMessage;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FlakySink {
        fail_marker: HashSet<String>,
        sent: Mutex<Vec<(String, Option<i32>)>>,
    }

    #[async_trait]
    impl Sink for FlakySink {
        async fn send(&self, message: &OutboundMessage, thread_id: Option<i32>) -> Result<()> {
            if self.fail_marker.iter().any(|m| message.text.contains(m.as_str())) {
                bail!("telegram said no");
            }
            self.sent
                .lock()
                .unwrap()
                .push((message.text.clone(), thread_id));
            Ok(())
        }
    }

    fn item(id: u64) -> Item {
        DecodedItem::decode(json!({
            "topic_id": id,
            "create_time": format!("2024-03-01T08:{:02}:00.000+0800", id),
            "talk": { "text": format!("body-{id}") }
        }))
        .unwrap()
        .item
    }

    #[tokio::test]
    async fn forwards_in_given_order_into_thread() {
        let sink = FlakySink::default();
        let dispatcher = ForwardDispatcher::new(&TelegramFormatter, &sink, Duration::ZERO);
        let outcome = dispatcher
            .forward(&[item(1), item(2), item(3)], FeedKind::Home, "g", Some(7))
            .await;
        assert_eq!(outcome.success_count, 3);
        assert_eq!(outcome.last_success, Some(ItemId(3)));
        assert!(outcome.failed.is_empty());

        let sent = sink.sent.lock().unwrap();
        let bodies: Vec<bool> = ["body-1", "body-2", "body-3"]
            .iter()
            .zip(sent.iter())
            .map(|(want, (text, thread))| text.contains(want) && *thread == Some(7))
            .collect();
        assert_eq!(bodies, vec![true, true, true]);
    }

    #[tokio::test]
    async fn failures_are_skipped_and_max_success_is_reported() {
        let sink = FlakySink {
            fail_marker: ["body-2".to_string(), "body-4".to_string()].into(),
            ..Default::default()
        };
        let dispatcher = ForwardDispatcher::new(&TelegramFormatter, &sink, Duration::ZERO);
        let outcome = dispatcher
            .forward(&[item(1), item(2), item(3), item(4)], FeedKind::Home, "g", None)
            .await;
        assert_eq!(outcome.success_count, 2);
        assert_eq!(outcome.last_success, Some(ItemId(3)));
        assert_eq!(outcome.failed, vec![ItemId(2), ItemId(4)]);
        assert_eq!(outcome.attempted(), 4);
    }

    #[tokio::test]
    async fn all_failed_leaves_no_success() {
        let sink = FlakySink {
            fail_marker: ["body".to_string()].into(),
            ..Default::default()
        };
        let dispatcher = ForwardDispatcher::new(&TelegramFormatter, &sink, Duration::ZERO);
        let outcome = dispatcher.forward(&[item(1), item(2)], FeedKind::Home, "g", None).await;
        assert_eq!(outcome.success_count, 0);
        assert!(outcome.last_success.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn delay_is_only_between_sends() {
        let sink = FlakySink::default();
        let dispatcher = ForwardDispatcher::new(&TelegramFormatter, &sink, Duration::from_secs(2));
        let started = tokio::time::Instant::now();
        dispatcher
            .forward(&[item(1), item(2), item(3)], FeedKind::Home, "g", None)
            .await;
        assert_eq!(started.elapsed(), Duration::from_secs(4));

        let started = tokio::time::Instant::now();
        dispatcher.forward(&[item(4)], FeedKind::Home, "g", None).await;
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
