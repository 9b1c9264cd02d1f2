//! Backward pagination from "now" to the last delivered item.
//!
//! A walk fetches pages newest-first and ends at the first of:
//! the checkpointed item (dedup boundary), an exhausted feed, a transport
//! error, or the page/item limit chosen by the caller. Whatever was collected
//! before the stop is returned; a walk never fails as a whole.
use chrono::{DateTime, FixedOffset};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::model::{CursorStyle, DecodedItem, FeedKind, Item, ItemId, PageCursor};
use crate::zsxq::{FeedClient, FeedPage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkLimits {
    pub max_pages: usize,
    /// Keep at most this many (newest) items.
    pub max_items: Option<usize>,
}

/// Outcome of consuming one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkStep {
    Continue(PageCursor),
    DedupBoundaryHit,
    Exhausted,
    TransportError(String),
}

/// Why a walk ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkStop {
    DedupBoundaryHit,
    Exhausted,
    LimitReached,
    TransportError(String),
}

#[derive(Debug, Clone)]
pub struct WalkReport {
    /// Newest first, as the feed returns them.
    pub items: Vec<Item>,
    pub newest_item_id: Option<ItemId>,
    pub stop: WalkStop,
    pub pages: usize,
    /// Entries whose `create_time` could not be parsed.
    pub time_fallbacks: usize,
}

#[derive(Default)]
struct WalkState {
    items: Vec<Item>,
    seen: HashSet<ItemId>,
    pages: usize,
    time_fallbacks: usize,
}

pub struct CursorWalker<'a> {
    client: &'a dyn FeedClient,
    page_delay: Duration,
}

impl<'a> CursorWalker<'a> {
    pub fn new(client: &'a dyn FeedClient, page_delay: Duration) -> Self {
        Self { client, page_delay }
    }

    #[instrument(skip_all, fields(source = group_id, kind = %kind))]
    pub async fn walk(
        &self,
        group_id: &str,
        kind: FeedKind,
        last_known: Option<ItemId>,
        limits: WalkLimits,
    ) -> WalkReport {
        let mut state = WalkState::default();
        let mut cursor: Option<PageCursor> = None;

        let mut stop = loop {
            if state.pages >= limits.max_pages {
                break WalkStop::LimitReached;
            }
            if limits.max_items.is_some_and(|max| state.items.len() >= max) {
                break WalkStop::LimitReached;
            }
            if state.pages > 0 && !self.page_delay.is_zero() {
                tokio::time::sleep(self.page_delay).await;
            }

            debug!(cursor = ?cursor, page = state.pages + 1, "fetching page");
            let page = match self.client.fetch_page(group_id, kind, cursor.as_ref()).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(?err, page = state.pages + 1, "page fetch failed; ending walk early");
                    break WalkStop::TransportError(format!("{err:#}"));
                }
            };
            state.pages += 1;

            match self.consume_page(kind, last_known, page, &mut state).await {
                WalkStep::Continue(next) => cursor = Some(next),
                WalkStep::DedupBoundaryHit => break WalkStop::DedupBoundaryHit,
                WalkStep::Exhausted => break WalkStop::Exhausted,
                WalkStep::TransportError(detail) => break WalkStop::TransportError(detail),
            }
        };

        if let Some(max) = limits.max_items {
            if state.items.len() > max {
                warn!(
                    collected = state.items.len(),
                    kept = max,
                    "item limit reached; older items are skipped"
                );
                state.items.truncate(max);
                stop = WalkStop::LimitReached;
            }
        }
        if stop == WalkStop::LimitReached {
            warn!(pages = state.pages, last_known = ?last_known, "walk stopped at its limit");
        }

        let newest_item_id = state
            .items
            .iter()
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .map(|item| item.id);

        info!(
            items = state.items.len(),
            pages = state.pages,
            newest = ?newest_item_id,
            stop = ?stop,
            time_fallbacks = state.time_fallbacks,
            "walk finished"
        );

        WalkReport {
            items: state.items,
            newest_item_id,
            stop,
            pages: state.pages,
            time_fallbacks: state.time_fallbacks,
        }
    }

    async fn consume_page(
        &self,
        kind: FeedKind,
        last_known: Option<ItemId>,
        page: FeedPage,
        state: &mut WalkState,
    ) -> WalkStep {
        if page.entries.is_empty() {
            debug!("empty page; feed exhausted");
            return WalkStep::Exhausted;
        }

        let mut added = 0usize;
        let mut oldest: Option<DateTime<FixedOffset>> = None;

        for entry in page.entries {
            let decoded = match DecodedItem::decode(entry) {
                Ok(decoded) => decoded,
                Err(err) => {
                    warn!(?err, "skipping undecodable entry");
                    continue;
                }
            };

            // Ids grow with creation time, so anything at or below the
            // checkpoint was delivered already, even if the checkpointed
            // topic itself has since been deleted. Pinned topics sit on top
            // of the feed out of order and never end the walk.
            if let Some(last) = last_known.filter(|last| decoded.item.id <= *last) {
                if decoded.item.topic.sticky {
                    debug!(item_id = %decoded.item.id, "skipping old pinned topic");
                    continue;
                }
                info!(item_id = %decoded.item.id, checkpoint = %last, "reached last delivered item");
                return WalkStep::DedupBoundaryHit;
            }
            if !state.seen.insert(decoded.item.id) {
                debug!(item_id = %decoded.item.id, "entry repeated across pages");
                continue;
            }

            if decoded.trusted_time {
                let ts = decoded.item.created_at;
                oldest = Some(oldest.map_or(ts, |o| o.min(ts)));
            } else {
                state.time_fallbacks += 1;
            }

            let item = if kind.needs_detail() {
                self.expand(decoded).await
            } else {
                decoded.item
            };
            state.items.push(item);
            added += 1;
        }

        if added == 0 {
            debug!("page held nothing new; feed exhausted");
            return WalkStep::Exhausted;
        }

        match kind.cursor_style() {
            CursorStyle::Time => match oldest {
                Some(ts) => WalkStep::Continue(PageCursor::Time(ts)),
                None => {
                    warn!("no trustworthy timestamp on page; cannot page further");
                    WalkStep::Exhausted
                }
            },
            CursorStyle::Index => match page.next_cursor {
                Some(next) => WalkStep::Continue(next),
                None => {
                    debug!("server returned no further index");
                    WalkStep::Exhausted
                }
            },
        }
    }

    /// Replace a listing summary with the full topic; keep the summary when
    /// the detail cannot be fetched so the item is still forwarded.
    async fn expand(&self, summary: DecodedItem) -> Item {
        let id = summary.item.id;
        let detail = match self.client.fetch_topic(id).await {
            Ok(raw) => DecodedItem::decode(raw),
            Err(err) => Err(err),
        };
        match detail {
            Ok(detail) if detail.item.id == id => {
                let created_at = if detail.trusted_time || !summary.trusted_time {
                    detail.item.created_at
                } else {
                    summary.item.created_at
                };
                Item {
                    id,
                    created_at,
                    topic: detail.item.topic,
                }
            }
            Ok(detail) => {
                warn!(item_id = %id, got = %detail.item.id, "topic detail id mismatch; using summary");
                summary.item
            }
            Err(err) => {
                warn!(?err, item_id = %id, "topic detail unavailable; using summary");
                summary.item
            }
        }
    }
}
