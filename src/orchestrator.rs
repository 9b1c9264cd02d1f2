//! One crawl pass over every configured (group, feed kind).
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::{App, GroupConfig};
use crate::dispatch::ForwardDispatcher;
use crate::format::Renderer;
use crate::groups::GroupDirectory;
use crate::model::{Checkpoint, FeedKind, ItemId};
use crate::telegram::{OutboundMessage, Sink};
use crate::walker::{CursorWalker, WalkLimits, WalkStop};
use crate::zsxq::FeedClient;

/// Pacing and bounds for a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub page_delay: Duration,
    pub send_delay: Duration,
    pub max_pages: usize,
    pub first_run_max_pages: usize,
    pub first_run_max_items: usize,
}

impl EngineSettings {
    pub fn from_config(app: &App) -> Self {
        Self {
            page_delay: Duration::from_millis(app.page_delay_ms),
            send_delay: Duration::from_millis(app.send_delay_ms),
            max_pages: app.max_pages,
            first_run_max_pages: app.first_run_max_pages,
            first_run_max_items: app.first_run_max_items,
        }
    }

    /// Without a checkpoint there is no boundary to stop at, so the walk is
    /// capped to a recent slice of the feed.
    pub fn limits_for(&self, last_known: Option<ItemId>) -> WalkLimits {
        match last_known {
            Some(_) => WalkLimits {
                max_pages: self.max_pages,
                max_items: None,
            },
            None => WalkLimits {
                max_pages: self.first_run_max_pages,
                max_items: Some(self.first_run_max_items),
            },
        }
    }
}

/// Cooperative cancellation, observed between units.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl StopSignal {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx: Some(rx) }
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_stopped(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once a stop was requested. A dropped sender counts as stop.
    pub async fn stopped(&mut self) {
        let Some(rx) = self.rx.as_mut() else {
            return std::future::pending().await;
        };
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Committed(ItemId),
    /// Nothing was delivered; the checkpoint stays where it was.
    Uncommitted,
    CommitFailed(ItemId),
}

#[derive(Debug, Clone)]
pub struct UnitReport {
    pub group_id: String,
    pub kind: FeedKind,
    pub fetched: usize,
    pub forwarded: usize,
    pub failed: usize,
    pub stop: WalkStop,
    pub outcome: UnitOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub units: Vec<UnitReport>,
    pub stopped_early: bool,
}

impl RunSummary {
    pub fn forwarded(&self) -> usize {
        self.units.iter().map(|u| u.forwarded).sum()
    }

    pub fn failed(&self) -> usize {
        self.units.iter().map(|u| u.failed).sum()
    }
}

pub struct SourceOrchestrator<'a> {
    pub feed: &'a dyn FeedClient,
    pub sink: &'a dyn Sink,
    pub renderer: &'a dyn Renderer,
    pub store: &'a CheckpointStore,
    pub groups: &'a GroupDirectory,
    pub settings: EngineSettings,
    /// Forum thread for failure reports; `None` disables them.
    pub error_thread_id: Option<i32>,
}

impl<'a> SourceOrchestrator<'a> {
    #[instrument(skip_all, fields(sources = sources.len()))]
    pub async fn run_once(&self, sources: &[GroupConfig], stop: &StopSignal) -> RunSummary {
        let mut summary = RunSummary::default();

        'sources: for source in sources {
            for kind in source.enabled_kinds() {
                if stop.is_stopped() {
                    info!("stop requested; ending pass early");
                    summary.stopped_early = true;
                    break 'sources;
                }
                summary.units.push(self.run_unit(source, kind).await);
            }
        }

        info!(
            units = summary.units.len(),
            forwarded = summary.forwarded(),
            failed = summary.failed(),
            stopped_early = summary.stopped_early,
            "pass finished"
        );
        summary
    }

    #[instrument(skip_all, fields(source = %source.group_id, kind = %kind))]
    async fn run_unit(&self, source: &GroupConfig, kind: FeedKind) -> UnitReport {
        let group_id = source.group_id.as_str();
        let group_name = self.groups.name(group_id);

        let last_known = match self.store.get(group_id, kind).await {
            Ok(checkpoint) => checkpoint.map(|c| c.last_item_id),
            Err(err) => {
                error!(%err, "checkpoint unreadable; crawling as if none were stored");
                None
            }
        };

        let walker = CursorWalker::new(self.feed, self.settings.page_delay);
        let report = walker
            .walk(group_id, kind, last_known, self.settings.limits_for(last_known))
            .await;
        match (&report.stop, last_known) {
            (WalkStop::TransportError(detail), _) => {
                self.report_error(&format!(
                    "{group_name} {} 抓取中断 ({} 条已获取): {detail}",
                    kind.label(),
                    report.items.len()
                ))
                .await;
            }
            // A capped first run is expected; a capped catch-up leaves a gap.
            (WalkStop::LimitReached, Some(last)) => {
                self.report_error(&format!(
                    "{group_name} {} 翻页达到上限 ({} 页)，{last} 之后更早的新内容被跳过",
                    kind.label(),
                    report.pages
                ))
                .await;
            }
            _ => {}
        }

        let fetched = report.items.len();
        let mut batch = report.items;
        batch.reverse();

        let dispatcher =
            ForwardDispatcher::new(self.renderer, self.sink, self.settings.send_delay);
        let outcome = dispatcher
            .forward(&batch, kind, group_name, source.thread_id(kind))
            .await;

        let unit_outcome = match outcome.last_success {
            Some(last) if outcome.success_count > 0 => {
                match self.store.put(group_id, kind, Checkpoint::now(last)).await {
                    Ok(()) => {
                        info!(checkpoint = %last, "checkpoint committed");
                        UnitOutcome::Committed(last)
                    }
                    Err(err) => {
                        error!(%err, checkpoint = %last, "checkpoint commit failed");
                        self.report_error(&format!(
                            "{group_name} {} 检查点保存失败 ({last}): {err}",
                            kind.label()
                        ))
                        .await;
                        UnitOutcome::CommitFailed(last)
                    }
                }
            }
            _ => {
                if fetched > 0 {
                    warn!(fetched, "nothing delivered; checkpoint left untouched");
                }
                UnitOutcome::Uncommitted
            }
        };

        UnitReport {
            group_id: group_id.to_string(),
            kind,
            fetched,
            forwarded: outcome.success_count,
            failed: outcome.failed.len(),
            stop: report.stop,
            outcome: unit_outcome,
        }
    }

    /// Best-effort failure note to the error thread.
    pub async fn report_error(&self, detail: &str) {
        let Some(thread_id) = self.error_thread_id else {
            return;
        };
        let message = OutboundMessage::text(format!(
            "❌ {}",
            html_escape::encode_text(detail)
        ));
        if let Err(err) = self.sink.send(&message, Some(thread_id)).await {
            warn!(?err, "could not deliver error report");
        }
    }
}
